//! Run lifecycle: `stopped → spawning → running → stopping → stopped`.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::Serialize;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{watch, Notify};
use tokio::task::JoinHandle;

use crate::config::Stage;
use crate::engine::control::ControlCommand;
use crate::engine::spawner::StopOutcome;
use crate::error::{Result, SwarmError};
use crate::stats::{ReportStats, StatsSnapshot};
use crate::utils::timer_period;

/// Whatever hosts the users: a local worker or a master relaying to workers.
#[async_trait]
pub trait LoadTarget: Send + Sync {
    async fn apply_target(&self, users: usize, rate: f64) -> Result<()>;
    async fn stop_all(&self) -> StopOutcome;
    async fn reset_stats(&self) -> Result<()>;
    fn snapshot(&self) -> StatsSnapshot;
    fn user_count(&self) -> usize;
    /// True once the hosted population matches the last applied target.
    fn is_converged(&self) -> bool;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum RunPhase {
    Stopped,
    Spawning,
    Running,
    Stopping,
}

impl fmt::Display for RunPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            RunPhase::Stopped => "stopped",
            RunPhase::Spawning => "spawning",
            RunPhase::Running => "running",
            RunPhase::Stopping => "stopping",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct RunState {
    pub target_user_count: usize,
    pub current_user_count: usize,
    pub spawn_rate: f64,
    pub phase: RunPhase,
    pub started_at: Option<DateTime<Utc>>,
    /// Index of the active stage in scripted mode.
    pub stage: Option<usize>,
}

/// Reply to a text/HTTP control command.
#[derive(Debug, Clone)]
pub enum ControlReply {
    Accepted,
    Stopped(StopOutcome),
    Report(ReportStats),
}

struct ControllerState {
    target_users: usize,
    rate: f64,
    phase: RunPhase,
    started_at: Option<DateTime<Utc>>,
    stage: Option<usize>,
    monitor: Option<JoinHandle<()>>,
    stages: Option<JoinHandle<()>>,
    /// Wakes the active stage script; replaced with every new script.
    advance: Option<Arc<Notify>>,
}

struct Inner {
    target: Arc<dyn LoadTarget>,
    tick: Duration,
    state: Mutex<ControllerState>,
    phase_tx: watch::Sender<RunPhase>,
}

impl Inner {
    fn set_phase(&self, state: &mut ControllerState, phase: RunPhase) {
        if state.phase == phase {
            return;
        }
        tracing::info!(from = %state.phase, to = %phase, users = state.target_users, "run phase changed");
        state.phase = phase;
        self.phase_tx.send_replace(phase);
    }
}

/// Single owner of the run state; cheap to clone.
#[derive(Clone)]
pub struct RunController {
    inner: Arc<Inner>,
}

impl RunController {
    pub fn new(target: Arc<dyn LoadTarget>, tick: Duration) -> Self {
        let (phase_tx, _) = watch::channel(RunPhase::Stopped);
        Self {
            inner: Arc::new(Inner {
                target,
                tick,
                state: Mutex::new(ControllerState {
                    target_users: 0,
                    rate: 1.0,
                    phase: RunPhase::Stopped,
                    started_at: None,
                    stage: None,
                    monitor: None,
                    stages: None,
                    advance: None,
                }),
                phase_tx,
            }),
        }
    }

    pub fn phase(&self) -> RunPhase {
        self.inner.state.lock().phase
    }

    pub fn subscribe_phase(&self) -> watch::Receiver<RunPhase> {
        self.inner.phase_tx.subscribe()
    }

    pub fn state(&self) -> RunState {
        let state = self.inner.state.lock();
        RunState {
            target_user_count: state.target_users,
            current_user_count: self.inner.target.user_count(),
            spawn_rate: state.rate,
            phase: state.phase,
            started_at: state.started_at,
            stage: state.stage,
        }
    }

    /// Ramp toward `target` users at `rate` users/second. A manual start
    /// while a stage script runs takes over from the script.
    pub async fn start(&self, target: usize, rate: f64) -> Result<()> {
        {
            let mut state = self.inner.state.lock();
            state.advance = None;
            if let Some(stages) = state.stages.take() {
                tracing::info!("manual start overrides stage script");
                stages.abort();
            }
        }
        self.start_inner(target, rate, None).await
    }

    async fn start_inner(&self, target: usize, rate: f64, stage: Option<usize>) -> Result<()> {
        if !rate.is_finite() || rate <= 0.0 {
            return Err(SwarmError::InvalidRate(rate));
        }
        {
            let state = self.inner.state.lock();
            if state.phase == RunPhase::Stopping {
                return Err(SwarmError::InvalidTransition {
                    from: state.phase.to_string(),
                    action: "start".to_string(),
                });
            }
        }

        self.inner.target.apply_target(target, rate).await?;

        let mut state = self.inner.state.lock();
        if state.phase == RunPhase::Stopped {
            state.started_at = Some(Utc::now());
        }
        state.target_users = target;
        state.rate = rate;
        state.stage = stage;
        self.inner.set_phase(&mut state, RunPhase::Spawning);
        if state.monitor.as_ref().map_or(true, |m| m.is_finished()) {
            state.monitor = Some(self.spawn_monitor());
        }
        Ok(())
    }

    /// Moves `spawning` to `running` once the target reports convergence.
    fn spawn_monitor(&self) -> JoinHandle<()> {
        let inner = Arc::clone(&self.inner);
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(timer_period(inner.tick));
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                interval.tick().await;
                let converged = inner.target.is_converged();
                let mut state = inner.state.lock();
                let phase = state.phase;
                match phase {
                    RunPhase::Spawning if converged => inner.set_phase(&mut state, RunPhase::Running),
                    RunPhase::Stopped | RunPhase::Stopping => break,
                    _ => {}
                }
            }
        })
    }

    /// Stop every user. Safe to call from any phase and more than once.
    pub async fn stop(&self) -> StopOutcome {
        let already_stopping = {
            let mut state = self.inner.state.lock();
            let phase = state.phase;
            match phase {
                RunPhase::Stopped => return StopOutcome::default(),
                RunPhase::Stopping => true,
                RunPhase::Spawning | RunPhase::Running => {
                    state.advance = None;
                    if let Some(stages) = state.stages.take() {
                        stages.abort();
                    }
                    if let Some(monitor) = state.monitor.take() {
                        monitor.abort();
                    }
                    self.inner.set_phase(&mut state, RunPhase::Stopping);
                    false
                }
            }
        };
        if already_stopping {
            let mut phase = self.subscribe_phase();
            let _ = phase.wait_for(|p| *p == RunPhase::Stopped).await;
            return StopOutcome::default();
        }

        let outcome = self.inner.target.stop_all().await;
        if outcome.discarded > 0 {
            tracing::warn!(discarded = outcome.discarded, "stop finished with discarded users");
        }

        let mut state = self.inner.state.lock();
        state.target_users = 0;
        state.stage = None;
        self.inner.set_phase(&mut state, RunPhase::Stopped);
        outcome
    }

    /// Zero statistics everywhere. Refused mid-ramp and while stopping.
    pub async fn reset_stats(&self) -> Result<()> {
        let phase = self.phase();
        if !matches!(phase, RunPhase::Running | RunPhase::Stopped) {
            return Err(SwarmError::InvalidTransition {
                from: phase.to_string(),
                action: "reset stats".to_string(),
            });
        }
        self.inner.target.reset_stats().await?;
        tracing::info!("statistics reset");
        Ok(())
    }

    pub fn get_snapshot(&self) -> StatsSnapshot {
        self.inner.target.snapshot()
    }

    pub fn report(&self) -> ReportStats {
        ReportStats::from_snapshot(&self.get_snapshot(), self.inner.target.user_count())
    }

    pub async fn apply(&self, command: ControlCommand) -> Result<ControlReply> {
        match command {
            ControlCommand::Start { users, rate } => {
                let rate = rate.unwrap_or_else(|| self.inner.state.lock().rate);
                self.start(users, rate).await?;
                Ok(ControlReply::Accepted)
            }
            ControlCommand::Stop => Ok(ControlReply::Stopped(self.stop().await)),
            ControlCommand::ResetStats => {
                self.reset_stats().await?;
                Ok(ControlReply::Accepted)
            }
            ControlCommand::Stats => Ok(ControlReply::Report(self.report())),
        }
    }

    /// Run a stage script: each stage is applied in order and held for its
    /// duration; the run stops after the last one.
    pub fn run_stages(&self, stages: Vec<Stage>) -> Result<()> {
        if let Some(bad) = stages.iter().find(|s| !s.rate.is_finite() || s.rate <= 0.0) {
            return Err(SwarmError::InvalidRate(bad.rate));
        }
        let controller = self.clone();
        let advance = Arc::new(Notify::new());
        let wake = Arc::clone(&advance);
        let handle = tokio::spawn(async move {
            for (index, stage) in stages.iter().enumerate() {
                tracing::info!(stage = index, target = stage.target, rate = stage.rate, "entering stage");
                if let Err(e) = controller.start_inner(stage.target, stage.rate, Some(index)).await {
                    tracing::error!(stage = index, error = %e, "stage could not be applied");
                    break;
                }
                tokio::select! {
                    _ = tokio::time::sleep(stage.duration) => {}
                    _ = wake.notified() => {
                        tracing::info!(stage = index, "stage advanced manually");
                    }
                }
            }
            // detach first so stop() does not abort this task under itself
            {
                let mut state = controller.inner.state.lock();
                state.stages = None;
                state.advance = None;
            }
            controller.stop().await;
        });

        let mut state = self.inner.state.lock();
        if let Some(previous) = state.stages.replace(handle) {
            previous.abort();
        }
        state.advance = Some(advance);
        Ok(())
    }

    /// Skip the rest of the current stage. Ignored when no script runs.
    pub fn advance_stage(&self) {
        let state = self.inner.state.lock();
        let active = state.stages.as_ref().is_some_and(|s| !s.is_finished());
        match (&state.advance, active) {
            (Some(advance), true) => advance.notify_one(),
            _ => tracing::debug!("no stage script running, advance ignored"),
        }
    }
}
