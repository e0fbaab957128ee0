//! Master side of the swarm: worker membership, target distribution and
//! global statistics.

use async_trait::async_trait;
use parking_lot::Mutex;
use serde::Serialize;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio::time::Instant;

use crate::cluster::protocol::{Message, WorkerState};
use crate::cluster::transport;
use crate::config::RuntimeSettings;
use crate::engine::controller::LoadTarget;
use crate::engine::spawner::StopOutcome;
use crate::error::{Result, SwarmError};
use crate::stats::StatsSnapshot;
use crate::utils::timer_period;

/// Consecutive protocol violations tolerated before a connection is dropped.
pub const MAX_CONSECUTIVE_VIOLATIONS: usize = 5;
const OUTBOX_CAPACITY: usize = 64;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum WorkerStatus {
    Joining,
    Ready,
    Running,
    Missing,
    Draining,
}

impl WorkerStatus {
    fn takes_load(self) -> bool {
        matches!(self, WorkerStatus::Ready | WorkerStatus::Running)
    }
}

/// Master-side bookkeeping for one worker.
#[derive(Debug)]
pub struct WorkerRecord {
    pub worker_id: String,
    pub capacity_weight: u32,
    pub status: WorkerStatus,
    pub last_heartbeat: Instant,
    pub user_count: usize,
    pub reported_state: WorkerState,
    /// Users this worker was last told to run.
    pub assigned: usize,
    /// Generation of a stats reset the worker has not acknowledged yet.
    pending_reset: Option<u64>,
    outbox: Option<mpsc::Sender<Message>>,
}

impl WorkerRecord {
    fn send(&self, message: Message) {
        let Some(outbox) = &self.outbox else {
            tracing::debug!(worker_id = %self.worker_id, kind = message.kind(), "worker not connected, message dropped");
            return;
        };
        if let Err(e) = outbox.try_send(message) {
            tracing::warn!(worker_id = %self.worker_id, error = %e, "failed to queue message for worker");
        }
    }
}

/// Serializable view of a worker for the control API.
#[derive(Debug, Clone, Serialize)]
pub struct WorkerView {
    pub worker_id: String,
    pub status: WorkerStatus,
    pub state: WorkerState,
    pub capacity_weight: u32,
    pub user_count: usize,
    pub assigned: usize,
    pub connected: bool,
    pub last_heartbeat_ms: u64,
}

/// Result of one liveness sweep.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct LivenessReport {
    pub missing: Vec<String>,
    pub evicted: Vec<String>,
}

struct MasterState {
    workers: BTreeMap<String, WorkerRecord>,
    target: usize,
    rate: f64,
    running: bool,
    generation: u64,
    stats: StatsSnapshot,
    /// Heartbeat stats older than this epoch predate a reset and are ignored.
    epoch_floor: HashMap<String, u64>,
}

pub struct MasterNode {
    settings: RuntimeSettings,
    state: Mutex<MasterState>,
}

/// Split `total` proportionally to `weights`; the remainder goes one each to
/// the first entries.
pub fn split_by_weight(total: usize, weights: &[u32]) -> Vec<usize> {
    let sum: u64 = weights.iter().map(|w| u64::from(*w)).sum();
    if sum == 0 {
        return vec![0; weights.len()];
    }
    let mut shares: Vec<usize> = weights
        .iter()
        .map(|w| ((total as u128 * u128::from(*w)) / u128::from(sum)) as usize)
        .collect();
    let mut remainder = total - shares.iter().sum::<usize>();
    for share in shares.iter_mut() {
        if remainder == 0 {
            break;
        }
        *share += 1;
        remainder -= 1;
    }
    shares
}

impl MasterNode {
    pub fn new(settings: RuntimeSettings) -> Self {
        Self {
            settings,
            state: Mutex::new(MasterState {
                workers: BTreeMap::new(),
                target: 0,
                rate: 1.0,
                running: false,
                generation: 0,
                stats: StatsSnapshot::default(),
                epoch_floor: HashMap::new(),
            }),
        }
    }

    pub fn settings(&self) -> &RuntimeSettings {
        &self.settings
    }

    /// Admit a worker, or re-attach a reconnecting one under its old id.
    /// Returns the worker id, generated when `worker_id` is empty.
    pub fn register(&self, worker_id: &str, capacity_weight: u32, outbox: mpsc::Sender<Message>) -> Result<String> {
        let worker_id = if worker_id.is_empty() {
            uuid::Uuid::new_v4().to_string()
        } else {
            worker_id.to_string()
        };
        if capacity_weight == 0 {
            return Err(SwarmError::InvalidWeight {
                name: worker_id,
                weight: capacity_weight,
            });
        }

        let mut state = self.state.lock();
        let state = &mut *state;
        let generation = state.generation;
        let now = Instant::now();
        match state.workers.get_mut(&worker_id) {
            Some(record) => {
                tracing::info!(worker_id = %worker_id, "worker reconnected");
                record.capacity_weight = capacity_weight;
                record.outbox = Some(outbox);
                record.last_heartbeat = now;
            }
            None => {
                tracing::info!(worker_id = %worker_id, capacity_weight, "worker registered");
                state.workers.insert(
                    worker_id.clone(),
                    WorkerRecord {
                        worker_id: worker_id.clone(),
                        capacity_weight,
                        status: WorkerStatus::Joining,
                        last_heartbeat: now,
                        user_count: 0,
                        reported_state: WorkerState::Joining,
                        assigned: 0,
                        pending_reset: None,
                        outbox: Some(outbox),
                    },
                );
            }
        }
        if let Some(record) = state.workers.get_mut(&worker_id) {
            record.send(Message::Ack {
                worker_id: worker_id.clone(),
                generation,
            });
            // a reset missed while disconnected; the ack above restarts the
            // worker's generations, so re-deliver it above them
            if record.pending_reset.is_some() {
                state.generation += 1;
                record.pending_reset = Some(state.generation);
                tracing::info!(worker_id = %worker_id, generation = state.generation, "re-sending missed stats reset");
                record.send(Message::ResetStats {
                    generation: state.generation,
                });
            }
        }
        // re-send shares so a reconnecting worker gets its target back
        Self::distribute(state, true);
        Ok(worker_id)
    }

    /// Apply one heartbeat received at `now`.
    pub fn heartbeat(
        &self,
        worker_id: &str,
        stats: &StatsSnapshot,
        user_count: usize,
        reported: WorkerState,
        now: Instant,
    ) -> Result<()> {
        let mut state = self.state.lock();
        let state = &mut *state;
        let record = state
            .workers
            .get_mut(worker_id)
            .ok_or_else(|| SwarmError::UnknownWorker(worker_id.to_string()))?;

        record.last_heartbeat = now;
        record.user_count = user_count;
        record.reported_state = reported;

        let previous = record.status;
        record.status = match previous {
            WorkerStatus::Draining => WorkerStatus::Draining,
            _ if reported == WorkerState::Running => WorkerStatus::Running,
            _ => WorkerStatus::Ready,
        };
        let rejoined = !previous.takes_load() && record.status.takes_load();
        match previous {
            WorkerStatus::Missing => tracing::info!(worker_id, "missing worker resumed heartbeats"),
            WorkerStatus::Joining => tracing::debug!(worker_id, "worker ready"),
            _ => {}
        }

        let mut accepted = StatsSnapshot::default();
        let mut stale = false;
        for (source, source_stats) in &stats.sources {
            if source.as_str() != worker_id {
                tracing::warn!(worker_id, source = %source, "dropping stats for another source");
                continue;
            }
            let floor = state.epoch_floor.get(source).copied().unwrap_or(0);
            if source_stats.epoch >= floor {
                accepted.sources.insert(source.clone(), source_stats.clone());
            } else {
                tracing::debug!(worker_id, source = %source, epoch = source_stats.epoch, floor, "ignoring pre-reset stats");
                stale = true;
            }
        }
        state.stats.merge_from(&accepted);

        // pre-reset stats with no reset on its way: the worker never got it
        if stale && record.pending_reset.is_none() {
            state.generation += 1;
            record.pending_reset = Some(state.generation);
            tracing::info!(worker_id, generation = state.generation, "worker missed a stats reset, re-sending");
            record.send(Message::ResetStats {
                generation: state.generation,
            });
        }

        if rejoined {
            Self::distribute(state, false);
        }
        Ok(())
    }

    /// Mark silent workers missing and evict long-silent ones. Evicted
    /// workers' stats stay in the global snapshot.
    pub fn check_liveness(&self, now: Instant) -> LivenessReport {
        let mut state = self.state.lock();
        let mut report = LivenessReport::default();

        for record in state.workers.values_mut() {
            let silent = now.saturating_duration_since(record.last_heartbeat);
            if record.status == WorkerStatus::Missing {
                if silent > self.settings.eviction_timeout {
                    report.evicted.push(record.worker_id.clone());
                }
            } else if silent > self.settings.heartbeat_timeout {
                tracing::warn!(
                    worker_id = %record.worker_id,
                    silent_ms = silent.as_millis() as u64,
                    "worker missed heartbeats, marking missing"
                );
                record.status = WorkerStatus::Missing;
                record.assigned = 0;
                report.missing.push(record.worker_id.clone());
            }
        }
        for id in &report.evicted {
            tracing::warn!(worker_id = %id, "evicting worker, keeping its stats");
            state.workers.remove(id);
        }

        if !report.missing.is_empty() || !report.evicted.is_empty() {
            Self::distribute(&mut state, false);
        }
        report
    }

    /// Recompute every worker's share and send the ones that changed, or all
    /// of them with `force`.
    fn distribute(state: &mut MasterState, force: bool) {
        if !state.running {
            return;
        }
        let eligible: Vec<String> = state
            .workers
            .values()
            .filter(|r| r.status.takes_load())
            .map(|r| r.worker_id.clone())
            .collect();
        let weights: Vec<u32> = eligible.iter().map(|id| state.workers[id].capacity_weight).collect();
        let shares = split_by_weight(state.target, &weights);
        let weight_sum: u64 = weights.iter().map(|w| u64::from(*w)).sum();

        state.generation += 1;
        let generation = state.generation;
        let (target, rate) = (state.target, state.rate);

        for (i, id) in eligible.iter().enumerate() {
            let Some(record) = state.workers.get_mut(id) else { continue };
            let share = shares[i];
            let worker_rate = rate * f64::from(record.capacity_weight) / weight_sum as f64;
            if force || record.assigned != share {
                record.assigned = share;
                record.send(Message::Target {
                    user_count: share,
                    rate: worker_rate,
                    generation,
                });
            }
        }
        for record in state.workers.values_mut() {
            if record.status == WorkerStatus::Draining && (force || record.assigned != 0) {
                record.assigned = 0;
                record.send(Message::Target {
                    user_count: 0,
                    rate,
                    generation,
                });
            }
        }
        tracing::debug!(target, workers = eligible.len(), generation, "distributed target");
    }

    pub fn start(&self, target: usize, rate: f64) -> Result<()> {
        if !rate.is_finite() || rate <= 0.0 {
            return Err(SwarmError::InvalidRate(rate));
        }
        let mut state = self.state.lock();
        if state.workers.values().all(|r| !r.status.takes_load()) {
            tracing::warn!(target, "no ready workers, target applies once workers join");
        }
        let changed = !state.running || state.target != target || state.rate != rate;
        state.target = target;
        state.rate = rate;
        state.running = true;
        Self::distribute(&mut state, changed);
        Ok(())
    }

    /// Tell every worker to stop, without waiting.
    pub fn broadcast_stop(&self) {
        let mut state = self.state.lock();
        state.running = false;
        state.target = 0;
        state.generation += 1;
        let generation = state.generation;
        for record in state.workers.values_mut() {
            record.assigned = 0;
            record.send(Message::StopAll { generation });
        }
    }

    /// Zero global stats and tell workers to reset theirs.
    pub fn reset_stats(&self) {
        let mut state = self.state.lock();
        let state = &mut *state;
        for (source, source_stats) in &state.stats.sources {
            state.epoch_floor.insert(source.clone(), source_stats.epoch + 1);
        }
        state.stats = StatsSnapshot::default();
        state.generation += 1;
        let generation = state.generation;
        for record in state.workers.values_mut() {
            // cleared by the worker's ack; re-sent when it reconnects first
            record.pending_reset = Some(generation);
            record.send(Message::ResetStats { generation });
        }
    }

    /// Record a worker's acknowledgement of `generation`.
    pub fn acknowledged(&self, worker_id: &str, generation: u64) {
        let mut state = self.state.lock();
        if let Some(record) = state.workers.get_mut(worker_id) {
            if record.pending_reset.is_some_and(|pending| generation >= pending) {
                tracing::debug!(worker_id, generation, "stats reset acknowledged");
                record.pending_reset = None;
            }
        }
    }

    /// Stop assigning load to a worker and ramp it down to zero users.
    pub fn drain(&self, worker_id: &str) -> Result<()> {
        let mut state = self.state.lock();
        let record = state
            .workers
            .get_mut(worker_id)
            .ok_or_else(|| SwarmError::UnknownWorker(worker_id.to_string()))?;
        tracing::info!(worker_id, "draining worker");
        record.status = WorkerStatus::Draining;
        Self::distribute(&mut state, false);
        Ok(())
    }

    /// Drop the handle of the connection feeding `outbox`; the record stays
    /// until liveness evicts it. A handle from a newer connection is kept.
    pub fn disconnected(&self, worker_id: &str, outbox: &mpsc::Sender<Message>) {
        let mut state = self.state.lock();
        let Some(record) = state.workers.get_mut(worker_id) else { return };
        if record.outbox.as_ref().is_some_and(|current| current.same_channel(outbox)) {
            tracing::info!(worker_id, "worker connection closed");
            record.outbox = None;
        } else {
            tracing::debug!(worker_id, "stale connection closed, worker already reconnected");
        }
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        self.state.lock().stats.clone()
    }

    pub fn target(&self) -> usize {
        self.state.lock().target
    }

    /// Users reported by every worker that is not missing.
    pub fn user_count(&self) -> usize {
        self.state
            .lock()
            .workers
            .values()
            .filter(|r| r.status != WorkerStatus::Missing)
            .map(|r| r.user_count)
            .sum()
    }

    pub fn worker_status(&self, worker_id: &str) -> Option<WorkerStatus> {
        self.state.lock().workers.get(worker_id).map(|r| r.status)
    }

    pub fn workers(&self) -> Vec<WorkerView> {
        let now = Instant::now();
        self.state
            .lock()
            .workers
            .values()
            .map(|r| WorkerView {
                worker_id: r.worker_id.clone(),
                status: r.status,
                state: r.reported_state,
                capacity_weight: r.capacity_weight,
                user_count: r.user_count,
                assigned: r.assigned,
                connected: r.outbox.is_some(),
                last_heartbeat_ms: now.saturating_duration_since(r.last_heartbeat).as_millis() as u64,
            })
            .collect()
    }

    /// Serve one worker connection until it closes or misbehaves repeatedly.
    pub async fn serve_connection<S>(self: Arc<Self>, stream: S, peer: String) -> anyhow::Result<()>
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        let (mut reader, mut writer) = transport::split(stream);

        let (worker_id, capacity_weight) = match reader.next().await? {
            Some(Message::Register {
                worker_id,
                capacity_weight,
            }) => (worker_id, capacity_weight),
            Some(other) => {
                tracing::warn!(peer = %peer, kind = other.kind(), "first message must be register");
                return Err(SwarmError::ProtocolViolation(format!("expected register, got {}", other.kind())).into());
            }
            None => {
                tracing::debug!(peer = %peer, "connection closed before registration");
                return Ok(());
            }
        };

        let (outbox, mut inbox) = mpsc::channel(OUTBOX_CAPACITY);
        let connection = outbox.clone();
        let worker_id = self.register(&worker_id, capacity_weight, outbox)?;

        let writer_task = tokio::spawn(async move {
            while let Some(message) = inbox.recv().await {
                if let Err(e) = writer.send(&message).await {
                    tracing::debug!(error = %e, "worker write failed");
                    break;
                }
            }
        });

        let mut violations = 0;
        let result = loop {
            let violation = match reader.next().await {
                Ok(Some(Message::Heartbeat {
                    worker_id: from,
                    stats,
                    user_count,
                    state,
                    ..
                })) => {
                    if from != worker_id {
                        Some(format!("heartbeat for {} on connection of {}", from, worker_id))
                    } else {
                        self.heartbeat(&worker_id, &stats, user_count, state, Instant::now())
                            .err()
                            .map(|e| e.to_string())
                    }
                }
                Ok(Some(Message::Ack { generation, .. })) => {
                    tracing::trace!(worker_id = %worker_id, generation, "worker acknowledged");
                    self.acknowledged(&worker_id, generation);
                    None
                }
                Ok(Some(other)) => Some(format!("unexpected {} from worker", other.kind())),
                Ok(None) => break Ok(()),
                Err(SwarmError::ProtocolViolation(reason)) => Some(reason),
                Err(e) => break Err(e.into()),
            };

            match violation {
                Some(reason) => {
                    violations += 1;
                    tracing::warn!(peer = %peer, worker_id = %worker_id, reason = %reason, violations, "protocol violation");
                    if violations >= MAX_CONSECUTIVE_VIOLATIONS {
                        break Err(anyhow::anyhow!("dropping {}: {} consecutive protocol violations", peer, violations));
                    }
                }
                None => violations = 0,
            }
        };

        writer_task.abort();
        self.disconnected(&worker_id, &connection);
        result
    }

    /// Periodic liveness sweep, every heartbeat interval.
    pub async fn run_liveness(self: Arc<Self>) {
        let mut interval = tokio::time::interval(timer_period(self.settings.heartbeat_interval));
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            interval.tick().await;
            self.check_liveness(Instant::now());
        }
    }

    /// Accept workers on `listener` forever, with the liveness sweep running
    /// alongside.
    pub async fn serve(self: Arc<Self>, listener: TcpListener) -> anyhow::Result<()> {
        let liveness = tokio::spawn(self.clone().run_liveness());
        tracing::info!(addr = ?listener.local_addr().ok(), "master accepting workers");
        let result = loop {
            let (stream, addr) = match listener.accept().await {
                Ok(accepted) => accepted,
                Err(e) => break Err(e.into()),
            };
            let _ = stream.set_nodelay(true);
            let master = self.clone();
            tokio::spawn(async move {
                if let Err(e) = master.serve_connection(stream, addr.to_string()).await {
                    tracing::warn!(peer = %addr, error = %e, "worker connection ended with error");
                }
            });
        };
        liveness.abort();
        result
    }

    async fn wait_for_zero_users(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let poll = timer_period(self.settings.heartbeat_interval.min(Duration::from_millis(250)));
        loop {
            if self.user_count() == 0 {
                return true;
            }
            if Instant::now() >= deadline {
                return false;
            }
            tokio::time::sleep(poll).await;
        }
    }
}

#[async_trait]
impl LoadTarget for MasterNode {
    async fn apply_target(&self, users: usize, rate: f64) -> Result<()> {
        self.start(users, rate)
    }

    /// Broadcast stop and wait for workers to report zero users. Workers
    /// enforce their own stop timeout, so the wait allows one extra
    /// heartbeat timeout for the final report to arrive.
    async fn stop_all(&self) -> StopOutcome {
        let before = self.user_count();
        self.broadcast_stop();
        let timeout = self.settings.stop_timeout + self.settings.heartbeat_timeout;
        if self.wait_for_zero_users(timeout).await {
            StopOutcome {
                stopped: before,
                discarded: 0,
            }
        } else {
            let remaining = self.user_count();
            tracing::warn!(remaining, "workers still report users after stop timeout");
            StopOutcome {
                stopped: before.saturating_sub(remaining),
                discarded: remaining,
            }
        }
    }

    async fn reset_stats(&self) -> Result<()> {
        MasterNode::reset_stats(self);
        Ok(())
    }

    fn snapshot(&self) -> StatsSnapshot {
        MasterNode::snapshot(self)
    }

    fn user_count(&self) -> usize {
        MasterNode::user_count(self)
    }

    fn is_converged(&self) -> bool {
        let state = self.state.lock();
        let reported: usize = state
            .workers
            .values()
            .filter(|r| r.status != WorkerStatus::Missing)
            .map(|r| r.user_count)
            .sum();
        reported == state.target
    }
}
