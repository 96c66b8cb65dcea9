//! Error taxonomy for vecai-core.
//!
//! Errors are grouped by category (backend, tool, agent, config, context,
//! permission) per the component design. Only `Agent` fatal/cancelled
//! variants and an unrecoverable `Backend::BadResponse` are meant to unwind
//! past the agent loop; everything else is converted to a string and
//! reified as tool-result content so the model can see and adapt to it.

use thiserror::Error;

/// Top-level error type shared across the crate.
#[derive(Debug, Error)]
pub enum VecaiError {
    #[error("backend error: {0}")]
    Backend(#[from] BackendError),

    #[error("tool error: {0}")]
    Tool(#[from] ToolError),

    #[error("agent error: {0}")]
    Agent(#[from] AgentError),

    #[error("config error: {0}")]
    Config(#[from] ConfigError),

    #[error("context error: {0}")]
    Context(#[from] ContextError),

    #[error("permission denied: {0}")]
    Permission(String),
}

impl VecaiError {
    /// Whether the condition is transient and a retry is reasonable.
    pub fn retryable(&self) -> bool {
        matches!(
            self,
            VecaiError::Backend(BackendError::Unavailable { .. })
                | VecaiError::Backend(BackendError::RateLimited { .. })
        )
    }

    /// True for the narrow set of errors that must exit the agent loop
    /// rather than being surfaced as tool-result content.
    pub fn is_fatal_for_loop(&self) -> bool {
        matches!(
            self,
            VecaiError::Agent(AgentError::FatalInternal(_))
                | VecaiError::Agent(AgentError::Cancelled)
                | VecaiError::Agent(AgentError::IterationCapExceeded(_))
                | VecaiError::Backend(BackendError::BadResponse(_))
        )
    }
}

#[derive(Debug, Error)]
pub enum BackendError {
    #[error("model backend unavailable: {0}")]
    Unavailable(String),

    #[error("model backend rate limited, retry after {retry_after_secs}s: {reason}")]
    RateLimited { retry_after_secs: u64, reason: String },

    #[error("model backend returned an unusable response: {0}")]
    BadResponse(String),

    #[error("failed to parse tool-call arguments: {0}")]
    ParseError(String),
}

#[derive(Debug, Error)]
pub enum ToolError {
    #[error("no tool registered with name '{0}'")]
    NotFound(String),

    #[error("permission denied for '{tool}': {reason}")]
    PermissionDenied { tool: String, reason: String },

    #[error("tool '{tool}' failed: {reason}")]
    ExecutionFailed { tool: String, reason: String },

    #[error("invalid arguments for tool '{tool}': {reason}")]
    SchemaInvalid { tool: String, reason: String },
}

#[derive(Debug, Error)]
pub enum AgentError {
    #[error("iteration cap ({0}) exceeded")]
    IterationCapExceeded(usize),

    #[error("cancelled by user")]
    Cancelled,

    #[error("internal error: {0}")]
    FatalInternal(String),
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("invalid configuration: {0}")]
    Invalid(String),

    #[error("missing required configuration: {0}")]
    Missing(String),
}

#[derive(Debug, Error)]
pub enum ContextError {
    #[error("compaction failed: {0}")]
    CompactionFailed(String),
}

pub type Result<T> = std::result::Result<T, VecaiError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn loop_fatal_classification() {
        assert!(VecaiError::Agent(AgentError::Cancelled).is_fatal_for_loop());
        assert!(VecaiError::Agent(AgentError::IterationCapExceeded(25)).is_fatal_for_loop());
        assert!(VecaiError::Backend(BackendError::BadResponse("x".into())).is_fatal_for_loop());
        assert!(!VecaiError::Tool(ToolError::NotFound("x".into())).is_fatal_for_loop());
    }

    #[test]
    fn retryable_classification() {
        assert!(VecaiError::Backend(BackendError::Unavailable("down".into())).retryable());
        assert!(
            VecaiError::Backend(BackendError::RateLimited {
                retry_after_secs: 1,
                reason: "slow down".into()
            })
            .retryable()
        );
        assert!(!VecaiError::Backend(BackendError::BadResponse("bad".into())).retryable());
    }
}
