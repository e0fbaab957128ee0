//! Virtual users: one cooperative tokio task per simulated client.

use chrono::Utc;
use futures::FutureExt;
use parking_lot::Mutex;
use serde::Serialize;
use std::any::Any;
use std::collections::HashMap;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::Instant;

use crate::engine::behavior::{Client, TaskSpec, UserBehavior, UserId};
use crate::engine::scheduler::TaskScheduler;
use crate::error::Result;
use crate::stats::{RequestSample, SharedStats};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum UserState {
    Spawning,
    Running,
    Stopping,
    Stopped,
}

/// Spawner-visible view of one user. Only the user's own task writes it.
#[derive(Debug, Clone)]
pub struct VirtualUserRecord {
    pub id: UserId,
    pub behavior: String,
    pub state: UserState,
    pub last_task_start: Option<Instant>,
}

pub type SharedRecord = Arc<Mutex<VirtualUserRecord>>;

/// Everything a task body can touch.
pub struct UserContext {
    id: UserId,
    behavior: String,
    client: Box<dyn Client>,
    stats: SharedStats,
    stop: watch::Receiver<bool>,
    grace: Duration,
    /// Per-user scratch space kept across tasks (session tokens, ids, ...).
    pub data: HashMap<String, serde_json::Value>,
}

impl UserContext {
    pub fn new(
        id: UserId,
        behavior: impl Into<String>,
        client: Box<dyn Client>,
        stats: SharedStats,
        stop: watch::Receiver<bool>,
        grace: Duration,
    ) -> Self {
        Self {
            id,
            behavior: behavior.into(),
            client,
            stats,
            stop,
            grace,
            data: HashMap::new(),
        }
    }

    pub fn id(&self) -> UserId {
        self.id
    }

    pub fn behavior_name(&self) -> &str {
        &self.behavior
    }

    /// True once a stop was signalled or the spawner dropped its handle.
    pub fn is_stopping(&self) -> bool {
        *self.stop.borrow() || self.stop.has_changed().is_err()
    }

    /// Issue one request through the user's client and record the outcome.
    ///
    /// A request in flight when the user is told to stop may keep running
    /// for the grace period; past that it is dropped and recorded as a
    /// cancelled failure.
    pub async fn request(&mut self, name: &str) -> RequestSample {
        let started_at = Utc::now();
        let start = Instant::now();
        let mut stop = self.stop.clone();
        let grace = self.grace;
        let user_id = self.id;

        let sample = tokio::select! {
            sample = self.client.issue(name) => sample,
            _ = async {
                // a dropped sender means the spawner is gone: treat as stop
                let _ = stop.wait_for(|stopping| *stopping).await;
                tokio::time::sleep(grace).await;
            } => {
                tracing::debug!(user_id, request = name, "abandoning request after stop grace period");
                RequestSample::cancelled(name, started_at, start.elapsed())
            }
        };

        self.stats.record(&sample);
        sample
    }

    /// Record a measurement taken outside the client.
    pub fn record(&self, sample: &RequestSample) {
        self.stats.record(sample);
    }
}

pub struct VirtualUser {
    record: SharedRecord,
    ctx: UserContext,
    scheduler: TaskScheduler,
    stop: watch::Receiver<bool>,
}

impl VirtualUser {
    pub fn new(
        id: UserId,
        behavior: Arc<UserBehavior>,
        stats: SharedStats,
        stop: watch::Receiver<bool>,
        grace: Duration,
    ) -> Result<Self> {
        let scheduler = TaskScheduler::new(behavior.clone())?;
        let ctx = UserContext::new(
            id,
            behavior.name(),
            behavior.new_client(id),
            stats,
            stop.clone(),
            grace,
        );
        let record = Arc::new(Mutex::new(VirtualUserRecord {
            id,
            behavior: behavior.name().to_string(),
            state: UserState::Spawning,
            last_task_start: None,
        }));
        Ok(Self {
            record,
            ctx,
            scheduler,
            stop,
        })
    }

    pub fn record(&self) -> SharedRecord {
        self.record.clone()
    }

    fn set_state(&self, state: UserState) {
        self.record.lock().state = state;
    }

    pub async fn run(mut self) {
        self.set_state(UserState::Running);
        let behavior = self.scheduler.behavior().clone();

        if let Some(task) = behavior.start_task() {
            run_task(&mut self.ctx, task).await;
        }

        while !self.ctx.is_stopping() {
            let started = Instant::now();
            self.record.lock().last_task_start = Some(started);
            run_task(&mut self.ctx, self.scheduler.pick()).await;

            if self.ctx.is_stopping() {
                break;
            }

            let wait = self.scheduler.next_wait(started.elapsed());
            if wait.is_zero() {
                tokio::task::yield_now().await;
                continue;
            }
            tokio::select! {
                _ = tokio::time::sleep(wait) => {}
                _ = self.stop.wait_for(|stopping| *stopping) => {}
            }
        }

        self.set_state(UserState::Stopping);
        if let Some(task) = behavior.stop_task() {
            run_task(&mut self.ctx, task).await;
        }
        self.set_state(UserState::Stopped);
        tracing::trace!(user_id = self.ctx.id, "virtual user stopped");
    }
}

/// Run one task body; errors and panics end the iteration, not the user.
async fn run_task(ctx: &mut UserContext, task: &TaskSpec) {
    let user_id = ctx.id;
    let message = match AssertUnwindSafe(task.call(ctx)).catch_unwind().await {
        Ok(Ok(())) => return,
        Ok(Err(err)) => format!("{:#}", err),
        Err(panic) => panic_message(panic),
    };
    tracing::warn!(user_id, task = task.name(), error = %message, "task raised an exception");
    ctx.stats.record_exception(task.name(), &message);
}

fn panic_message(panic: Box<dyn Any + Send>) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        format!("panic: {}", s)
    } else if let Some(s) = panic.downcast_ref::<String>() {
        format!("panic: {}", s)
    } else {
        "panic".to_string()
    }
}
