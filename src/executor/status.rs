//! Per-call status events published while the executor runs.

use crate::message::{ContentPart, ToolCallStatus};
use async_trait::async_trait;

#[derive(Debug, Clone)]
pub struct ToolStatusUpdate {
    pub tool_call_id: String,
    pub tool_name: String,
    pub status: ToolCallStatus,
    pub images: Vec<ContentPart>,
}

impl ToolStatusUpdate {
    pub fn new(tool_call_id: impl Into<String>, tool_name: impl Into<String>, status: ToolCallStatus) -> Self {
        Self {
            tool_call_id: tool_call_id.into(),
            tool_name: tool_name.into(),
            status,
            images: Vec::new(),
        }
    }
}

/// Fixed heartbeat cadence for `running` re-publication.
pub const HEARTBEAT_INTERVAL: std::time::Duration = std::time::Duration::from_millis(500);

/// Receives every status transition the executor publishes. A trait rather
/// than a bare callback so implementations can await the outbound event
/// channel directly (status transitions are "critical" events per §5 and
/// must not be silently dropped).
#[async_trait]
pub trait ToolStatusSink: Send + Sync {
    async fn on_status(&self, update: ToolStatusUpdate);
}
