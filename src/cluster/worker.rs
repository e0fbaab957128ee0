//! Worker side of the swarm: hosts the users and reports to a master.

use async_trait::async_trait;
use chrono::Utc;
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tokio::time::MissedTickBehavior;

use crate::cluster::protocol::{Message, WorkerState};
use crate::cluster::transport;
use crate::config::RuntimeSettings;
use crate::engine::behavior::UserBehavior;
use crate::engine::controller::LoadTarget;
use crate::engine::spawner::{StopOutcome, UserSpawner};
use crate::error::{Result, SwarmError};
use crate::stats::{SharedStats, StatsSnapshot, StatsWindow};
use crate::utils::timer_period;

const RECONNECT_INITIAL: Duration = Duration::from_millis(500);
const RECONNECT_MAX: Duration = Duration::from_secs(30);

struct Generations {
    /// Highest command generation applied since the last registration ack.
    command: u64,
    reset: u64,
}

pub struct WorkerNode {
    id: String,
    capacity_weight: u32,
    settings: RuntimeSettings,
    stats: SharedStats,
    spawner: Arc<UserSpawner>,
    state: Mutex<WorkerState>,
    generations: Mutex<Generations>,
}

impl WorkerNode {
    /// `id` defaults to a random UUID; it also names this worker's stats
    /// source, so it must be unique across the swarm.
    pub fn new(id: Option<String>, classes: Vec<Arc<UserBehavior>>, settings: RuntimeSettings) -> Result<Self> {
        let id = id.unwrap_or_else(|| uuid::Uuid::new_v4().to_string());
        let stats = StatsWindow::shared(id.clone());
        let spawner = Arc::new(UserSpawner::new(classes, stats.clone(), &settings)?);
        Ok(Self {
            id,
            capacity_weight: settings.capacity_weight,
            settings,
            stats,
            spawner,
            state: Mutex::new(WorkerState::Joining),
            generations: Mutex::new(Generations { command: 0, reset: 0 }),
        })
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn state(&self) -> WorkerState {
        *self.state.lock()
    }

    fn set_state(&self, next: WorkerState) {
        let mut state = self.state.lock();
        if *state != next {
            tracing::debug!(worker_id = %self.id, from = %*state, to = %next, "worker state changed");
            *state = next;
        }
    }

    pub fn spawner(&self) -> &Arc<UserSpawner> {
        &self.spawner
    }

    pub fn stats(&self) -> &SharedStats {
        &self.stats
    }

    pub fn register_message(&self) -> Message {
        Message::Register {
            worker_id: self.id.clone(),
            capacity_weight: self.capacity_weight,
        }
    }

    /// Cumulative heartbeat; every call produces a newer snapshot sequence.
    pub fn heartbeat(&self) -> Message {
        Message::Heartbeat {
            worker_id: self.id.clone(),
            stats: self.stats.snapshot(),
            user_count: self.spawner.current_user_count(),
            state: self.state(),
            timestamp: Utc::now(),
        }
    }

    /// Ramp the local population. Used for master targets and local runs.
    pub fn set_local_target(&self, users: usize, rate: f64) -> Result<()> {
        self.spawner.set_target(users, rate)?;
        self.spawner.start();
        self.set_state(if users > 0 {
            WorkerState::Running
        } else {
            WorkerState::Ready
        });
        Ok(())
    }

    /// Begin stopping every user; the returned task finishes once they
    /// have stopped or the stop timeout discarded them.
    fn begin_stop(self: &Arc<Self>) -> tokio::task::JoinHandle<StopOutcome> {
        self.set_state(WorkerState::Stopping);
        let waiting = self.spawner.stop_all(self.settings.stop_timeout);
        let worker = Arc::clone(self);
        tokio::spawn(async move {
            let outcome = waiting.await;
            let mut state = worker.state.lock();
            if *state == WorkerState::Stopping {
                *state = WorkerState::Stopped;
            }
            outcome
        })
    }

    /// Apply one master message; returns the reply to send, if any.
    ///
    /// Commands older than the last applied generation are dropped, and a
    /// re-delivered reset is not applied twice.
    pub fn handle(self: &Arc<Self>, message: Message) -> Result<Option<Message>> {
        let ack = |generation| {
            Some(Message::Ack {
                worker_id: self.id.clone(),
                generation,
            })
        };
        match message {
            Message::Ack { generation, .. } => {
                // registration accepted: generations restart from the master's
                {
                    let mut generations = self.generations.lock();
                    generations.command = generation;
                    generations.reset = generation;
                }
                let state = self.state();
                if matches!(state, WorkerState::Joining | WorkerState::Missing) {
                    self.set_state(if self.spawner.target() > 0 {
                        WorkerState::Running
                    } else {
                        WorkerState::Ready
                    });
                }
                tracing::info!(worker_id = %self.id, generation, "registered with master");
                Ok(None)
            }
            Message::Target {
                user_count,
                rate,
                generation,
            } => {
                if !self.accept(generation) {
                    return Ok(ack(generation));
                }
                tracing::info!(worker_id = %self.id, user_count, rate, generation, "new target");
                self.set_local_target(user_count, rate)?;
                Ok(ack(generation))
            }
            Message::StopAll { generation } => {
                if self.accept(generation) {
                    tracing::info!(worker_id = %self.id, generation, "stopping all users");
                    self.begin_stop();
                }
                Ok(ack(generation))
            }
            Message::ResetStats { generation } => {
                let mut generations = self.generations.lock();
                if generation > generations.reset {
                    generations.reset = generation;
                    generations.command = generations.command.max(generation);
                    drop(generations);
                    self.stats.reset();
                    tracing::info!(worker_id = %self.id, epoch = self.stats.epoch(), "stats reset");
                }
                Ok(ack(generation))
            }
            other @ (Message::Register { .. } | Message::Heartbeat { .. }) => Err(SwarmError::ProtocolViolation(format!(
                "unexpected {} from master",
                other.kind()
            ))),
        }
    }

    fn accept(&self, generation: u64) -> bool {
        let mut generations = self.generations.lock();
        if generation < generations.command {
            tracing::debug!(worker_id = %self.id, generation, current = generations.command, "ignoring stale command");
            return false;
        }
        generations.command = generation;
        true
    }

    /// Run one connected session: register, then heartbeat and apply
    /// commands until the stream closes.
    pub async fn run_session<S>(self: &Arc<Self>, stream: S) -> anyhow::Result<()>
    where
        S: AsyncRead + AsyncWrite + Send,
    {
        let (mut reader, mut writer) = transport::split(stream);
        writer.send(&self.register_message()).await?;

        let mut heartbeat = tokio::time::interval(timer_period(self.settings.heartbeat_interval));
        heartbeat.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = heartbeat.tick() => {
                    writer.send(&self.heartbeat()).await?;
                }
                incoming = reader.next() => match incoming {
                    Ok(Some(message)) => match self.handle(message) {
                        Ok(Some(reply)) => writer.send(&reply).await?,
                        Ok(None) => {}
                        Err(e) => tracing::warn!(worker_id = %self.id, error = %e, "rejected message from master"),
                    },
                    Ok(None) => return Ok(()),
                    Err(SwarmError::ProtocolViolation(reason)) => {
                        tracing::warn!(worker_id = %self.id, reason = %reason, "protocol violation from master");
                    }
                    Err(e) => return Err(e.into()),
                },
            }
        }
    }

    /// Stay connected to the master at `addr`, reconnecting with capped
    /// exponential backoff. Users keep running while disconnected.
    pub async fn connect(self: Arc<Self>, addr: String) {
        let mut backoff = RECONNECT_INITIAL;
        loop {
            match TcpStream::connect(&addr).await {
                Ok(stream) => {
                    let _ = stream.set_nodelay(true);
                    tracing::info!(worker_id = %self.id, master = %addr, "connected to master");
                    backoff = RECONNECT_INITIAL;
                    match self.run_session(stream).await {
                        Ok(()) => tracing::warn!(worker_id = %self.id, "master closed the connection"),
                        Err(e) => tracing::warn!(worker_id = %self.id, error = %e, "connection to master lost"),
                    }
                }
                Err(e) => {
                    tracing::warn!(
                        worker_id = %self.id,
                        master = %addr,
                        error = %e,
                        retry_ms = backoff.as_millis() as u64,
                        "master unreachable"
                    );
                }
            }
            self.set_state(WorkerState::Missing);
            tokio::time::sleep(backoff).await;
            backoff = (backoff * 2).min(RECONNECT_MAX);
        }
    }
}

/// Standalone mode: a worker driven directly by a local controller.
#[async_trait]
impl LoadTarget for WorkerNode {
    async fn apply_target(&self, users: usize, rate: f64) -> Result<()> {
        self.set_local_target(users, rate)
    }

    async fn stop_all(&self) -> StopOutcome {
        self.set_state(WorkerState::Stopping);
        let outcome = self.spawner.stop_all(self.settings.stop_timeout).await;
        self.set_state(WorkerState::Stopped);
        outcome
    }

    async fn reset_stats(&self) -> Result<()> {
        self.stats.reset();
        Ok(())
    }

    fn snapshot(&self) -> StatsSnapshot {
        self.stats.snapshot()
    }

    fn user_count(&self) -> usize {
        self.spawner.current_user_count()
    }

    fn is_converged(&self) -> bool {
        self.spawner.is_converged()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::behavior::tests::fixed_behavior;
    use crate::engine::behavior::WaitTime;

    fn worker() -> Arc<WorkerNode> {
        let behavior = Arc::new(fixed_behavior("a").set_wait_time(WaitTime::constant(Duration::from_secs(1))));
        Arc::new(WorkerNode::new(Some("w1".into()), vec![behavior], RuntimeSettings::default()).unwrap())
    }

    #[tokio::test(start_paused = true)]
    async fn test_target_then_duplicate_and_stale() {
        let w = worker();
        w.handle(Message::Ack {
            worker_id: "w1".into(),
            generation: 0,
        })
        .unwrap();
        assert_eq!(w.state(), WorkerState::Ready);

        let reply = w
            .handle(Message::Target {
                user_count: 4,
                rate: 4.0,
                generation: 2,
            })
            .unwrap();
        assert!(matches!(reply, Some(Message::Ack { generation: 2, .. })));
        assert_eq!(w.state(), WorkerState::Running);
        // duplicate delivery is harmless
        w.handle(Message::Target {
            user_count: 4,
            rate: 4.0,
            generation: 2,
        })
        .unwrap();
        // older target arriving late is ignored
        w.handle(Message::Target {
            user_count: 1,
            rate: 4.0,
            generation: 1,
        })
        .unwrap();
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(w.spawner().target(), 4);
        assert_eq!(w.spawner().current_user_count(), 4);
    }

    #[tokio::test(start_paused = true)]
    async fn test_stop_all_acks_immediately_then_stops() {
        let w = worker();
        w.handle(Message::Target {
            user_count: 3,
            rate: 3.0,
            generation: 1,
        })
        .unwrap();
        tokio::time::sleep(Duration::from_millis(10)).await;

        let reply = w.handle(Message::StopAll { generation: 2 }).unwrap();
        assert!(matches!(reply, Some(Message::Ack { generation: 2, .. })));
        assert_eq!(w.state(), WorkerState::Stopping);
        assert_eq!(w.spawner().current_user_count(), 0);
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(w.state(), WorkerState::Stopped);
    }

    #[tokio::test(start_paused = true)]
    async fn test_reset_applied_once() {
        let w = worker();
        w.handle(Message::Target {
            user_count: 2,
            rate: 2.0,
            generation: 1,
        })
        .unwrap();
        tokio::time::sleep(Duration::from_secs(3)).await;
        assert!(w.stats().snapshot().num_requests() > 0);

        w.handle(Message::ResetStats { generation: 2 }).unwrap();
        assert_eq!(w.stats().epoch(), 1);
        w.handle(Message::ResetStats { generation: 2 }).unwrap();
        assert_eq!(w.stats().epoch(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_heartbeats_are_cumulative_and_ordered() {
        let w = worker();
        w.set_local_target(1, 1.0).unwrap();
        tokio::time::sleep(Duration::from_millis(2500)).await;
        let first = match w.heartbeat() {
            Message::Heartbeat { stats, user_count, .. } => {
                assert_eq!(user_count, 1);
                stats
            }
            other => panic!("unexpected {:?}", other),
        };
        tokio::time::sleep(Duration::from_secs(2)).await;
        let Message::Heartbeat { stats: second, .. } = w.heartbeat() else {
            panic!("expected heartbeat")
        };
        assert!(second.num_requests() >= first.num_requests());
        assert!(second.source("w1").unwrap().seq > first.source("w1").unwrap().seq);
        assert_eq!(first.merge(&second), first.merge(&second).merge(&first));
    }

    #[tokio::test]
    async fn test_rejects_worker_messages_from_master() {
        let w = worker();
        let err = w.handle(w.register_message()).unwrap_err();
        assert!(matches!(err, SwarmError::ProtocolViolation(_)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_session_over_duplex() {
        let w = worker();
        let (worker_end, master_end) = tokio::io::duplex(64 * 1024);
        let session = {
            let w = w.clone();
            tokio::spawn(async move { w.run_session(worker_end).await })
        };
        let (mut reader, mut writer) = transport::split(master_end);

        assert_eq!(reader.next().await.unwrap(), Some(w.register_message()));
        writer
            .send(&Message::Ack {
                worker_id: "w1".into(),
                generation: 0,
            })
            .await
            .unwrap();
        writer
            .send(&Message::Target {
                user_count: 2,
                rate: 2.0,
                generation: 1,
            })
            .await
            .unwrap();

        let mut saw_ack = false;
        let mut saw_running = false;
        for _ in 0..10 {
            match reader.next().await.unwrap() {
                Some(Message::Ack { generation: 1, .. }) => saw_ack = true,
                Some(Message::Heartbeat { user_count: 2, state, .. }) => {
                    assert_eq!(state, WorkerState::Running);
                    saw_running = true;
                }
                _ => {}
            }
            if saw_ack && saw_running {
                break;
            }
        }
        assert!(saw_ack && saw_running);

        drop(reader);
        drop(writer);
        session.await.unwrap().ok();
        // losing the master does not stop users
        assert_eq!(w.spawner().current_user_count(), 2);
    }
}
