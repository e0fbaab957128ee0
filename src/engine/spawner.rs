//! Population control: ramps live virtual users toward a target count.

use futures::future::BoxFuture;
use parking_lot::Mutex;
use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

use crate::config::RuntimeSettings;
use crate::engine::behavior::{UserBehavior, UserId};
use crate::engine::user::{SharedRecord, UserState, VirtualUser, VirtualUserRecord};
use crate::error::{Result, SwarmError};
use crate::stats::SharedStats;
use crate::utils::{ticks_to_converge, timer_period};

struct UserHandle {
    id: UserId,
    record: SharedRecord,
    stop: watch::Sender<bool>,
    join: JoinHandle<()>,
}

impl UserHandle {
    fn signal_stop(&self) {
        let _ = self.stop.send(true);
    }
}

/// Result of one spawner tick.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct StepOutcome {
    pub spawned: usize,
    pub stopped: usize,
}

/// Result of [`UserSpawner::stop_all`]. `discarded > 0` means the stop
/// timeout elapsed and those users were aborted.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct StopOutcome {
    pub stopped: usize,
    pub discarded: usize,
}

/// Smooth weighted round-robin over user classes: deterministic, and any
/// window of `sum(weights)` picks contains each class exactly `weight` times.
struct ClassPicker {
    weights: Vec<i64>,
    current: Vec<i64>,
}

impl ClassPicker {
    fn new(classes: &[Arc<UserBehavior>]) -> Self {
        let weights: Vec<i64> = classes.iter().map(|c| i64::from(c.weight())).collect();
        let current = vec![0; weights.len()];
        Self { weights, current }
    }

    fn next(&mut self) -> usize {
        let total: i64 = self.weights.iter().sum();
        let mut best = 0;
        for i in 0..self.weights.len() {
            self.current[i] += self.weights[i];
            if self.current[i] > self.current[best] {
                best = i;
            }
        }
        self.current[best] -= total;
        best
    }
}

struct SpawnerState {
    target: usize,
    rate: f64,
    carry: f64,
    // spawn order; the tail is the most recently spawned user
    active: Vec<UserHandle>,
    draining: Vec<UserHandle>,
    picker: ClassPicker,
}

pub struct UserSpawner {
    classes: Vec<Arc<UserBehavior>>,
    stats: SharedStats,
    tick: Duration,
    grace: Duration,
    stop_timeout: Duration,
    next_id: AtomicU64,
    state: Mutex<SpawnerState>,
    driver: Mutex<Option<JoinHandle<()>>>,
}

impl UserSpawner {
    pub fn new(
        classes: Vec<Arc<UserBehavior>>,
        stats: SharedStats,
        settings: &RuntimeSettings,
    ) -> Result<Self> {
        if classes.is_empty() {
            return Err(SwarmError::InvalidBehavior {
                name: "<none>".to_string(),
                reason: "spawner needs at least one user class".to_string(),
            });
        }
        for class in &classes {
            class.validate()?;
        }
        let picker = ClassPicker::new(&classes);
        Ok(Self {
            classes,
            stats,
            tick: settings.tick,
            grace: settings.request_grace,
            stop_timeout: settings.stop_timeout,
            next_id: AtomicU64::new(1),
            state: Mutex::new(SpawnerState {
                target: 0,
                rate: 1.0,
                carry: 0.0,
                active: Vec::new(),
                draining: Vec::new(),
                picker,
            }),
            driver: Mutex::new(None),
        })
    }

    pub fn stats(&self) -> &SharedStats {
        &self.stats
    }

    pub fn tick(&self) -> Duration {
        self.tick
    }

    pub fn stop_timeout(&self) -> Duration {
        self.stop_timeout
    }

    /// Set a new population target. Re-sending the current target and rate
    /// leaves users and the ramp untouched.
    pub fn set_target(&self, count: usize, rate: f64) -> Result<()> {
        if !rate.is_finite() || rate <= 0.0 {
            return Err(SwarmError::InvalidRate(rate));
        }
        let mut state = self.state.lock();
        if state.target == count && state.rate == rate {
            return Ok(());
        }
        if state.target != count {
            state.carry = 0.0;
        }
        let distance = state.active.len().abs_diff(count);
        tracing::debug!(
            from = state.target,
            to = count,
            rate,
            current = state.active.len(),
            ticks = ticks_to_converge(distance, rate * self.tick.as_secs_f64()),
            "spawner target updated"
        );
        state.target = count;
        state.rate = rate;
        Ok(())
    }

    pub fn target(&self) -> usize {
        self.state.lock().target
    }

    pub fn rate(&self) -> f64 {
        self.state.lock().rate
    }

    /// Users counted toward the target: spawned and not yet told to stop.
    pub fn current_user_count(&self) -> usize {
        self.state.lock().active.len()
    }

    pub fn is_converged(&self) -> bool {
        let state = self.state.lock();
        state.active.len() == state.target
    }

    pub fn user_counts_by_class(&self) -> BTreeMap<String, usize> {
        let state = self.state.lock();
        let mut counts = BTreeMap::new();
        for handle in &state.active {
            *counts.entry(handle.record.lock().behavior.clone()).or_insert(0) += 1;
        }
        counts
    }

    pub fn records(&self) -> Vec<VirtualUserRecord> {
        let state = self.state.lock();
        state
            .active
            .iter()
            .chain(state.draining.iter())
            .map(|h| h.record.lock().clone())
            .collect()
    }

    /// Advance one tick: spawn or stop at most `rate` users (plus carried
    /// fraction) toward the target. Must run inside a tokio runtime.
    pub fn step(&self) -> StepOutcome {
        let mut state = self.state.lock();
        state.draining.retain(|h| !h.join.is_finished());
        state.active.retain(|h| !h.join.is_finished());

        let current = state.active.len();
        if current == state.target {
            state.carry = 0.0;
            return StepOutcome::default();
        }

        let budget = state.rate * self.tick.as_secs_f64() + state.carry;
        let allowance = budget.floor();
        state.carry = budget - allowance;
        let distance = current.abs_diff(state.target);
        let n = (allowance as usize).min(distance);
        if n == distance {
            state.carry = 0.0;
        }

        let mut outcome = StepOutcome::default();
        if current < state.target {
            for _ in 0..n {
                let class = self.classes[state.picker.next()].clone();
                match self.spawn_user(class) {
                    Ok(handle) => {
                        state.active.push(handle);
                        outcome.spawned += 1;
                    }
                    Err(e) => {
                        tracing::error!(error = %e, "failed to spawn virtual user");
                        break;
                    }
                }
            }
        } else {
            for _ in 0..n {
                let Some(handle) = state.active.pop() else { break };
                handle.signal_stop();
                tracing::trace!(user_id = handle.id, "stopping virtual user");
                state.draining.push(handle);
                outcome.stopped += 1;
            }
        }
        outcome
    }

    fn spawn_user(&self, class: Arc<UserBehavior>) -> Result<UserHandle> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (stop, rx) = watch::channel(false);
        let user = VirtualUser::new(id, class, self.stats.clone(), rx, self.grace)?;
        let record = user.record();
        let join = tokio::spawn(user.run());
        Ok(UserHandle {
            id,
            record,
            stop,
            join,
        })
    }

    /// Start the tick driver. No-op when it is already running.
    pub fn start(self: &Arc<Self>) {
        let mut driver = self.driver.lock();
        if driver.as_ref().is_some_and(|d| !d.is_finished()) {
            return;
        }
        let spawner = Arc::clone(self);
        *driver = Some(tokio::spawn(async move {
            let mut interval = tokio::time::interval(timer_period(spawner.tick));
            interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                interval.tick().await;
                let outcome = spawner.step();
                if outcome.spawned + outcome.stopped > 0 {
                    tracing::debug!(
                        spawned = outcome.spawned,
                        stopped = outcome.stopped,
                        users = spawner.current_user_count(),
                        "spawner tick"
                    );
                }
            }
        }));
    }

    pub fn is_driving(&self) -> bool {
        self.driver.lock().as_ref().is_some_and(|d| !d.is_finished())
    }

    /// Stop every user and wait up to `timeout` for them to finish.
    ///
    /// The stop signal, target reset and driver shutdown happen before this
    /// returns; the returned future only waits. Users still running at the
    /// deadline are aborted and counted as discarded; their on_stop hooks
    /// do not run.
    pub fn stop_all(&self, timeout: Duration) -> BoxFuture<'static, StopOutcome> {
        if let Some(driver) = self.driver.lock().take() {
            driver.abort();
        }
        let mut handles = {
            let mut state = self.state.lock();
            state.target = 0;
            state.carry = 0.0;
            let mut handles = std::mem::take(&mut state.draining);
            handles.extend(state.active.drain(..).rev());
            handles
        };
        for handle in &handles {
            handle.signal_stop();
        }

        Box::pin(async move {
            let total = handles.len();
            let finished = tokio::time::timeout(
                timeout,
                futures::future::join_all(handles.iter_mut().map(|h| &mut h.join)),
            )
            .await
            .is_ok();
            if finished {
                return StopOutcome {
                    stopped: total,
                    discarded: 0,
                };
            }

            let mut discarded = 0;
            for handle in &handles {
                if !handle.join.is_finished() {
                    handle.join.abort();
                    handle.record.lock().state = UserState::Stopped;
                    discarded += 1;
                }
            }
            tracing::warn!(
                discarded,
                timeout_ms = timeout.as_millis() as u64,
                "stop timeout elapsed, discarding remaining virtual users"
            );
            StopOutcome {
                stopped: total - discarded,
                discarded,
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::behavior::tests::fixed_behavior;
    use crate::engine::behavior::WaitTime;
    use crate::engine::user::UserContext;
    use crate::stats::StatsWindow;

    fn spawner(classes: Vec<UserBehavior>) -> UserSpawner {
        let classes = classes
            .into_iter()
            .map(|c| Arc::new(c.set_wait_time(WaitTime::constant(Duration::from_secs(1)))))
            .collect();
        UserSpawner::new(classes, StatsWindow::shared("local"), &RuntimeSettings::default()).unwrap()
    }

    #[tokio::test(start_paused = true)]
    async fn test_ramp_reaches_target_without_overshoot() {
        let s = spawner(vec![fixed_behavior("a")]);
        s.set_target(25, 4.0).unwrap();
        let mut counts = Vec::new();
        for _ in 0..10 {
            s.step();
            counts.push(s.current_user_count());
            assert!(s.current_user_count() <= 25);
        }
        // ceil(25 / 4) = 7 ticks
        assert_eq!(&counts[..7], &[4, 8, 12, 16, 20, 24, 25]);
        assert!(counts[7..].iter().all(|&c| c == 25));
        assert!(s.is_converged());
    }

    #[tokio::test(start_paused = true)]
    async fn test_fractional_rate_carries_over() {
        let s = spawner(vec![fixed_behavior("a")]);
        s.set_target(10, 0.5).unwrap();
        let counts: Vec<usize> = (0..4)
            .map(|_| {
                s.step();
                s.current_user_count()
            })
            .collect();
        assert_eq!(counts, vec![0, 1, 1, 2]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_ramp_down_is_lifo() {
        let s = spawner(vec![fixed_behavior("a")]);
        s.set_target(6, 100.0).unwrap();
        s.step();
        let ids_before: Vec<UserId> = s.records().iter().map(|r| r.id).collect();
        assert_eq!(ids_before, vec![1, 2, 3, 4, 5, 6]);

        s.set_target(4, 100.0).unwrap();
        assert_eq!(s.step(), StepOutcome { spawned: 0, stopped: 2 });
        let survivors: Vec<UserId> = {
            let state = s.state.lock();
            state.active.iter().map(|h| h.id).collect()
        };
        assert_eq!(survivors, vec![1, 2, 3, 4]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_same_target_is_noop() {
        let s = spawner(vec![fixed_behavior("a")]);
        s.set_target(5, 2.0).unwrap();
        s.step();
        s.set_target(5, 2.0).unwrap();
        s.step();
        assert_eq!(s.current_user_count(), 4);
        s.set_target(5, 2.0).unwrap();
        assert_eq!(s.step(), StepOutcome { spawned: 1, stopped: 0 });
        assert_eq!(s.step(), StepOutcome::default());
    }

    #[tokio::test(start_paused = true)]
    async fn test_rejects_bad_rate() {
        let s = spawner(vec![fixed_behavior("a")]);
        assert!(matches!(s.set_target(5, 0.0), Err(SwarmError::InvalidRate(_))));
        assert!(s.set_target(5, f64::NAN).is_err());
        assert_eq!(s.target(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_classes_interleave_by_weight() {
        let a = fixed_behavior("a").set_weight(3).unwrap();
        let b = fixed_behavior("b");
        let s = spawner(vec![a, b]);
        s.set_target(8, 100.0).unwrap();
        s.step();
        let order: Vec<String> = s.records().into_iter().map(|r| r.behavior).collect();
        assert_eq!(order, vec!["a", "a", "b", "a", "a", "a", "b", "a"]);
        let by_class = s.user_counts_by_class();
        assert_eq!(by_class["a"], 6);
        assert_eq!(by_class["b"], 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_driver_ticks_and_stop_all() {
        let s = Arc::new(spawner(vec![fixed_behavior("a")]));
        s.set_target(10, 5.0).unwrap();
        s.start();
        s.start();
        tokio::time::sleep(Duration::from_millis(1500)).await;
        assert_eq!(s.current_user_count(), 10);

        let outcome = s.stop_all(Duration::from_secs(10)).await;
        assert_eq!(outcome, StopOutcome { stopped: 10, discarded: 0 });
        assert_eq!(s.current_user_count(), 0);
        assert!(!s.is_driving());
    }

    async fn stuck(_user: &mut UserContext) -> anyhow::Result<()> {
        tokio::time::sleep(Duration::from_secs(3600)).await;
        Ok(())
    }

    #[tokio::test(start_paused = true)]
    async fn test_stop_all_discards_after_timeout() {
        let stuck_behavior = UserBehavior::new("stuck", |_| crate::engine::behavior::tests::FixedClient {
            latency: Duration::ZERO,
        })
        .register_task(crate::task!(stuck));
        let s = spawner(vec![stuck_behavior]);
        s.set_target(3, 10.0).unwrap();
        s.step();
        tokio::time::sleep(Duration::from_millis(10)).await;

        let outcome = s.stop_all(Duration::from_secs(2)).await;
        assert_eq!(outcome, StopOutcome { stopped: 0, discarded: 3 });
        assert_eq!(s.current_user_count(), 0);
    }
}
