//! Bridges the executor's [`ApprovalChannel`] to the outbound event stream:
//! emits `ToolApprovalRequested` and waits on a oneshot reply slot that an
//! external caller resolves via [`EventApprovalChannel::respond`]. The
//! reply map is keyed by `tool_call_id` so more than one outstanding prompt
//! can be addressed independently, even though a batch only ever has one
//! approval pending at a time.

use crate::approval::APPROVAL_TIMEOUT;
use crate::events::{ChatEventKind, EventSink};
use crate::executor::{ApprovalChannel, ApprovalDecision};
use crate::state_manager::{PendingApproval, StateManager};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::oneshot;

pub struct EventApprovalChannel {
    events: Arc<EventSink>,
    state_manager: Arc<StateManager>,
    pending: Mutex<HashMap<String, oneshot::Sender<ApprovalDecision>>>,
}

impl EventApprovalChannel {
    pub fn new(events: Arc<EventSink>, state_manager: Arc<StateManager>) -> Self {
        Self {
            events,
            state_manager,
            pending: Mutex::new(HashMap::new()),
        }
    }

    /// Resolve a pending prompt. A no-op if `tool_call_id` has no pending
    /// prompt (already timed out, or never requested).
    pub fn respond(&self, tool_call_id: &str, decision: ApprovalDecision) {
        if let Some(tx) = self.pending.lock().remove(tool_call_id) {
            let _ = tx.send(decision);
        }
    }
}

#[async_trait]
impl ApprovalChannel for EventApprovalChannel {
    async fn request_approval(&self, tool_call_id: &str, tool_name: &str, arguments: &str) -> Option<ApprovalDecision> {
        let (tx, rx) = oneshot::channel();
        self.pending.lock().insert(tool_call_id.to_string(), tx);

        let now = now_unix();
        self.state_manager.push_tool_approval(
            PendingApproval {
                tool_call_id: tool_call_id.to_string(),
                tool_name: tool_name.to_string(),
                arguments: arguments.to_string(),
            },
            now,
        );

        self.events
            .emit(ChatEventKind::ToolApprovalRequested {
                tool_call_id: tool_call_id.to_string(),
                tool_name: tool_name.to_string(),
                arguments: arguments.to_string(),
            })
            .await;

        let result = tokio::time::timeout(APPROVAL_TIMEOUT, rx).await;
        self.pending.lock().remove(tool_call_id);
        self.state_manager.resolve_tool_approval(tool_call_id, now_unix());

        match result {
            Ok(Ok(decision)) => Some(decision),
            Ok(Err(_)) | Err(_) => None,
        }
    }
}

fn now_unix() -> i64 {
    time::OffsetDateTime::now_utc().unix_timestamp()
}
