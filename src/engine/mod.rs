pub mod behavior;
pub mod control;
pub mod controller;
pub mod scheduler;
pub mod spawner;
pub mod user;

pub use behavior::{BehaviorRegistry, Client, Scheduling, TaskSpec, UserBehavior, UserId, WaitTime};
pub use control::{parse_control_command, ControlCommand};
pub use controller::{ControlReply, LoadTarget, RunController, RunPhase, RunState};
pub use scheduler::TaskScheduler;
pub use spawner::{StepOutcome, StopOutcome, UserSpawner};
pub use user::{UserContext, UserState, VirtualUser, VirtualUserRecord};

use tokio::runtime::Runtime;

use crate::config::RuntimeSettings;
use crate::error::Result;

/// Build the runtime that hosts virtual users: one multi-thread pool,
/// `worker_threads` wide (CPU cores unless configured), shared by every user.
pub fn build_runtime(settings: &RuntimeSettings) -> Result<Runtime> {
    let threads = settings.worker_threads.max(1);
    tracing::debug!(threads, "building virtual user runtime");
    Ok(tokio::runtime::Builder::new_multi_thread()
        .worker_threads(threads)
        .thread_name("swarm-worker")
        .enable_all()
        .build()?)
}
