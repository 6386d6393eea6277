//! Agent invocation seam.
//!
//! The engine never talks to agents directly. Callers provide an
//! [`AgentDispatcher`]; the engine hands it the agent reference from the
//! step definition, the fully resolved input object, and a cancellation
//! token, and enforces the step timeout around the returned future.

use serde_json::Value;
use tokio_util::sync::CancellationToken;

/// Failure classification returned by dispatchers.
///
/// The retry policy engine treats the transient kinds as retryable; input
/// and rejection errors never retry because the same input would fail the
/// same way again.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum DispatchError {
    #[error("agent '{0}' timed out")]
    Timeout(String),

    #[error("agent '{0}' is rate limited")]
    RateLimited(String),

    #[error("transient failure: {0}")]
    Transient(String),

    #[error("agent refused the input: {0}")]
    InvalidInput(String),

    #[error("agent rejected the task: {0}")]
    AgentRejected(String),

    #[error("unknown agent: {0}")]
    UnknownAgent(String),

    #[error("invocation cancelled")]
    Cancelled,
}

impl DispatchError {
    /// Whether a retry of the same invocation could plausibly succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            DispatchError::Timeout(_)
                | DispatchError::RateLimited(_)
                | DispatchError::Transient(_)
        )
    }

    /// Stable short name for failure reports and logs.
    pub fn kind(&self) -> &'static str {
        match self {
            DispatchError::Timeout(_) => "timeout",
            DispatchError::RateLimited(_) => "rate_limited",
            DispatchError::Transient(_) => "transient",
            DispatchError::InvalidInput(_) => "invalid_input",
            DispatchError::AgentRejected(_) => "agent_rejected",
            DispatchError::UnknownAgent(_) => "unknown_agent",
            DispatchError::Cancelled => "cancelled",
        }
    }
}

/// Invokes agents on behalf of the engine.
///
/// Implementations must be safe to call concurrently; the engine invokes
/// from multiple spawned tasks. Honoring `cancel` promptly is expected but
/// not required for correctness: the engine also races the invocation
/// against the token and the step timeout.
pub trait AgentDispatcher: Send + Sync + 'static {
    fn invoke(
        &self,
        agent: &str,
        input: Value,
        cancel: CancellationToken,
    ) -> impl std::future::Future<Output = Result<Value, DispatchError>> + Send;
}
