//! Error types shared across the swarm core.

use thiserror::Error;

pub type Result<T, E = SwarmError> = std::result::Result<T, E>;

#[derive(Debug, Error)]
pub enum SwarmError {
    /// A behavior definition cannot be run (no tasks, no positive weight, ...).
    #[error("invalid behavior '{name}': {reason}")]
    InvalidBehavior { name: String, reason: String },

    #[error("invalid weight {weight} for '{name}'")]
    InvalidWeight { name: String, weight: u32 },

    #[error("unknown behavior '{0}'")]
    UnknownBehavior(String),

    #[error("invalid spawn rate {0}: must be a finite number > 0")]
    InvalidRate(f64),

    /// A control action is not allowed in the current run phase.
    #[error("cannot {action} while {from}")]
    InvalidTransition { from: String, action: String },

    /// Malformed or unexpected message on the wire.
    #[error("protocol violation: {0}")]
    ProtocolViolation(String),

    #[error("worker {0} is unreachable")]
    WorkerUnreachable(String),

    #[error("unknown worker {0}")]
    UnknownWorker(String),

    /// A histogram built with a different bucket table was received.
    #[error("incompatible histogram bucket table: expected v{expected}, got v{actual}")]
    IncompatibleHistogram { expected: u32, actual: u32 },

    #[error("configuration error: {0}")]
    Config(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Json(#[from] serde_json::Error),
}

impl SwarmError {
    /// Errors that local recovery can absorb without affecting the run.
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            SwarmError::ProtocolViolation(_)
                | SwarmError::WorkerUnreachable(_)
                | SwarmError::UnknownWorker(_)
                | SwarmError::Io(_)
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transition_message() {
        let err = SwarmError::InvalidTransition {
            from: "spawning".to_string(),
            action: "reset stats".to_string(),
        };
        assert_eq!(err.to_string(), "cannot reset stats while spawning");
    }

    #[test]
    fn test_recoverable() {
        assert!(SwarmError::ProtocolViolation("bad frame".into()).is_recoverable());
        assert!(!SwarmError::InvalidRate(0.0).is_recoverable());
    }
}
