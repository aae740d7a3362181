//! Tool service contract — consumed only.
//!
//! The core decodes arguments, checks the declared schema, and invokes the
//! service; concrete tools (file I/O, shell, remote-agent bridges) live
//! outside this crate.

use crate::message::ContentPart;
use crate::provider::ToolDeclaration;
use crate::remote::RemoteTaskTracker;
use async_trait::async_trait;
use std::sync::Arc;

#[derive(Debug, thiserror::Error)]
pub enum ToolServiceError {
    #[error("unknown tool: {0}")]
    UnknownTool(String),
    #[error("argument validation failed for {tool}: {reason}")]
    Validation { tool: String, reason: String },
    #[error("tool execution failed: {0}")]
    Execution(String),
}

/// Outcome of invoking a single tool function, before it is wrapped into a
/// [`crate::message::ToolExecutionResult`] by the executor.
pub struct ToolInvocationOutcome {
    pub data: serde_json::Value,
    pub diff: Option<String>,
    pub images: Vec<ContentPart>,
    /// Non-empty only for `RequestPlanApproval`, a tool with a special
    /// side-effect on the session's pending plan.
    pub plan: Option<String>,
    /// True only for `TodoWrite`, a tool with a special side-effect on the
    /// session's todo list.
    pub is_todo_update: bool,
}

impl ToolInvocationOutcome {
    pub fn simple(data: serde_json::Value) -> Self {
        Self {
            data,
            diff: None,
            images: Vec::new(),
            plan: None,
            is_todo_update: false,
        }
    }
}

/// A line emitted by a running `Bash` tool, for the streaming output
/// callback.
pub type BashLineCallback = Arc<dyn Fn(&str) + Send + Sync>;

#[async_trait]
pub trait ToolService: Send + Sync {
    fn list_tools_for_mode(&self, mode: crate::approval::AgentMode) -> Vec<ToolDeclaration>;

    fn validate_tool(&self, name: &str, arguments: &serde_json::Value) -> Result<(), ToolServiceError>;

    async fn execute_tool(
        &self,
        function_name: &str,
        arguments: serde_json::Value,
        bash_output: Option<BashLineCallback>,
    ) -> Result<ToolInvocationOutcome, ToolServiceError>;

    /// Returns the remote-task tracker if this service fronts remote-agent
    /// tools, or `None` if it has no remote surface.
    fn task_tracker(&self) -> Option<Arc<RemoteTaskTracker>> {
        None
    }
}
