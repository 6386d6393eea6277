//! Shared error types.

use uuid::Uuid;

use crate::run::StepStatus;

/// Errors raised by run state stores.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("run not found: {0}")]
    RunNotFound(Uuid),

    #[error("run already exists: {0}")]
    RunExists(Uuid),

    #[error("invalid event sequence for run {run_id}: {reason}")]
    InvalidEvent { run_id: Uuid, reason: String },

    #[error("illegal step transition for '{step_id}': {from} -> {to}")]
    InvalidTransition {
        step_id: String,
        from: StepStatus,
        to: StepStatus,
    },

    #[error("storage backend error: {0}")]
    Backend(String),
}
