//! Structured error taxonomy for the agent runtime: one `thiserror` enum
//! with a variant per failure class, plus `From` impls so `anyhow::Error`
//! raised inside state transitions converts cleanly at the orchestrator
//! boundary.

use thiserror::Error;

#[derive(Debug, Error)]
#[non_exhaustive]
pub enum AgentRuntimeError {
    /// Bad request, unknown model, empty request id. No state change.
    #[error("input error: {0}")]
    Input(String),

    /// Network, 5xx, parse error from the provider. Request terminates.
    #[error("provider error: {0}")]
    Provider(#[source] anyhow::Error),

    /// The request was cancelled. Request terminates cleanly; partial
    /// conversation remains persisted.
    #[error("cancelled")]
    Cancelled,

    /// Approval round-trip timed out or was cancelled mid-prompt.
    #[error("approval error for tool call {tool_call_id}: {reason}")]
    Approval {
        tool_call_id: String,
        reason: String,
    },

    /// Tool arguments failed to parse as complete JSON, or failed schema
    /// validation.
    #[error("tool validation error for {tool_call_id}: {reason}")]
    ToolValidation {
        tool_call_id: String,
        reason: String,
    },

    /// The tool itself failed during execution.
    #[error("tool execution error for {tool_call_id}: {reason}")]
    ToolExecution {
        tool_call_id: String,
        reason: String,
    },

    /// Internal invariant violated; the state manager recovery routine
    /// should reset to a safe default and log this.
    #[error("state inconsistency: {0}")]
    StateInconsistency(String),
}

impl From<anyhow::Error> for AgentRuntimeError {
    fn from(e: anyhow::Error) -> Self {
        AgentRuntimeError::Provider(e)
    }
}

impl From<crate::conversation::ToolGroupError> for AgentRuntimeError {
    fn from(e: crate::conversation::ToolGroupError) -> Self {
        AgentRuntimeError::StateInconsistency(e.to_string())
    }
}

pub type Result<T> = std::result::Result<T, AgentRuntimeError>;
