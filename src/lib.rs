//! Swarm load generation core.
//!
//! Virtual users run weighted tasks against a [`Client`], record every
//! request into a mergeable [`StatsWindow`], and are ramped by a
//! [`UserSpawner`]. A [`RunController`] owns the run lifecycle and drives
//! either a local [`WorkerNode`] or a [`MasterNode`] fanning the target out
//! to remote workers.

pub mod cluster;
pub mod config;
pub mod engine;
pub mod error;
pub mod logging;
pub mod stats;
pub mod utils;

pub use cluster::{MasterNode, Message, WorkerNode, WorkerState};
pub use config::{RuntimeSettings, Stage, SwarmConfig};
pub use engine::{
    build_runtime, Client, ControlCommand, LoadTarget, RunController, RunPhase, RunState, Scheduling, TaskSpec,
    UserBehavior, UserContext, UserSpawner, WaitTime,
};
pub use error::{Result, SwarmError};
pub use stats::{RequestSample, ReportStats, StatsSnapshot, StatsWindow};
pub use utils::parse_duration_str;
