use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::sync::Arc;
use std::time::Duration;

use crate::engine::behavior::{Scheduling, TaskSpec, UserBehavior};
use crate::error::Result;

/// Per-user task picker and think-time source.
///
/// Weighted mode draws from the cumulative weight table, so every task with
/// a positive weight keeps a fixed, non-zero probability on every pick and
/// is eventually selected; weight-0 tasks are left out of the table.
pub struct TaskScheduler {
    behavior: Arc<UserBehavior>,
    // cumulative weights of the pickable tasks, paired with their task index
    cumulative: Vec<u64>,
    slots: Vec<usize>,
    total_weight: u64,
    sequence: Vec<usize>,
    cursor: usize,
    rng: StdRng,
}

impl TaskScheduler {
    pub fn new(behavior: Arc<UserBehavior>) -> Result<Self> {
        Self::with_rng(behavior, StdRng::from_entropy())
    }

    /// Deterministic scheduler for reproducible runs.
    pub fn with_seed(behavior: Arc<UserBehavior>, seed: u64) -> Result<Self> {
        Self::with_rng(behavior, StdRng::seed_from_u64(seed))
    }

    fn with_rng(behavior: Arc<UserBehavior>, rng: StdRng) -> Result<Self> {
        behavior.validate()?;

        let mut cumulative = Vec::new();
        let mut slots = Vec::new();
        let mut sequence = Vec::new();
        let mut running = 0u64;
        for (index, task) in behavior.tasks().iter().enumerate() {
            if task.weight() == 0 {
                continue;
            }
            running += u64::from(task.weight());
            cumulative.push(running);
            slots.push(index);
            sequence.extend(std::iter::repeat(index).take(task.weight() as usize));
        }

        Ok(Self {
            behavior,
            cumulative,
            slots,
            total_weight: running,
            sequence,
            cursor: 0,
            rng,
        })
    }

    pub fn behavior(&self) -> &Arc<UserBehavior> {
        &self.behavior
    }

    /// Choose the next task to run.
    pub fn pick(&mut self) -> &TaskSpec {
        let index = match self.behavior.scheduling() {
            Scheduling::Weighted => {
                let r = self.rng.gen_range(0..self.total_weight);
                let slot = self.cumulative.partition_point(|&c| c <= r);
                self.slots[slot]
            }
            Scheduling::Sequential => {
                let index = self.sequence[self.cursor];
                self.cursor = (self.cursor + 1) % self.sequence.len();
                index
            }
        };
        &self.behavior.tasks()[index]
    }

    /// Think time before the next task, given how long the last one took.
    pub fn next_wait(&mut self, task_elapsed: Duration) -> Duration {
        self.behavior.wait_time().next(&mut self.rng, task_elapsed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::behavior::tests::{fixed_behavior, FixedClient};
    use crate::engine::behavior::WaitTime;
    use std::collections::HashMap;

    fn noop(name: &str, weight: u32) -> TaskSpec {
        TaskSpec::new(name, |_| Box::pin(async { Ok(()) })).with_weight(weight)
    }

    fn behavior(weights: &[u32], scheduling: Scheduling) -> Arc<UserBehavior> {
        let mut b = UserBehavior::new("weights", |_| FixedClient {
            latency: Duration::ZERO,
        })
        .set_scheduling(scheduling);
        for (i, w) in weights.iter().enumerate() {
            b = b.register_task(noop(&format!("t{}", i), *w));
        }
        Arc::new(b)
    }

    fn frequencies(weights: &[u32], picks: usize, seed: u64) -> HashMap<String, usize> {
        let mut s = TaskScheduler::with_seed(behavior(weights, Scheduling::Weighted), seed).unwrap();
        let mut counts = HashMap::new();
        for _ in 0..picks {
            *counts.entry(s.pick().name().to_string()).or_insert(0) += 1;
        }
        counts
    }

    #[test]
    fn test_weighted_frequencies_converge() {
        let weights = [5, 3, 0, 2];
        let total: u32 = weights.iter().sum();
        let picks = 200_000;
        let counts = frequencies(&weights, picks, 42);
        for (i, w) in weights.iter().enumerate() {
            let observed = *counts.get(&format!("t{}", i)).unwrap_or(&0) as f64 / picks as f64;
            let expected = *w as f64 / total as f64;
            assert!(
                (observed - expected).abs() < 0.01,
                "t{}: observed {:.4}, expected {:.4}",
                i,
                observed,
                expected
            );
        }
    }

    #[test]
    fn test_error_shrinks_with_more_picks() {
        let weights = [3, 1];
        let err = |picks: usize| {
            let counts = frequencies(&weights, picks, 9);
            let observed = counts["t0"] as f64 / picks as f64;
            (observed - 0.75).abs()
        };
        assert!(err(100_000) < 0.01);
        assert!(err(100_000) <= err(100).max(0.01));
    }

    #[test]
    fn test_zero_weight_never_picked() {
        let counts = frequencies(&[0, 1, 0], 10_000, 1);
        assert_eq!(counts.len(), 1);
        assert_eq!(counts["t1"], 10_000);
    }

    #[test]
    fn test_every_positive_weight_task_is_picked() {
        let counts = frequencies(&[1000, 1, 1], 100_000, 3);
        assert!(counts.contains_key("t1"));
        assert!(counts.contains_key("t2"));
    }

    #[test]
    fn test_sequential_round_robin() {
        let mut s = TaskScheduler::with_seed(behavior(&[2, 0, 1], Scheduling::Sequential), 0).unwrap();
        let order: Vec<String> = (0..6).map(|_| s.pick().name().to_string()).collect();
        assert_eq!(order, vec!["t0", "t0", "t2", "t0", "t0", "t2"]);
    }

    #[test]
    fn test_rejects_all_zero_weights() {
        assert!(TaskScheduler::with_seed(behavior(&[0, 0], Scheduling::Weighted), 0).is_err());
    }

    #[test]
    fn test_next_wait_uses_policy() {
        let b = Arc::new(
            fixed_behavior("waits").set_wait_time(WaitTime::between(
                Duration::from_secs(1),
                Duration::from_secs(2),
            )),
        );
        let mut s = TaskScheduler::with_seed(b, 5).unwrap();
        for _ in 0..50 {
            let w = s.next_wait(Duration::ZERO);
            assert!(w >= Duration::from_secs(1) && w <= Duration::from_secs(2));
        }
    }
}
