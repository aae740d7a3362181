//! Outbound event channel: one typed event stream per request, as an
//! envelope (`seq`, `timestamp`, `request_id`, `kind`) wrapping a
//! `#[serde(tag = "type", rename_all = "snake_case")]` kind enum.

use crate::message::{ContentPart, ToolCallRequest, ToolExecutionResult, Usage};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatEvent {
    pub seq: u64,
    pub timestamp_unix: i64,
    pub request_id: String,
    pub kind: ChatEventKind,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ChatEventKind {
    ChatStart,

    ChatChunk {
        #[serde(skip_serializing_if = "Option::is_none")]
        text_delta: Option<String>,
        #[serde(skip_serializing_if = "Option::is_none")]
        reasoning_delta: Option<String>,
        #[serde(skip_serializing_if = "Option::is_none")]
        tool_call_chunk: Option<ToolCallChunk>,
    },

    ChatComplete {
        reasoning: Option<String>,
        tool_calls: Vec<ToolCallRequest>,
        /// Cumulative across every turn of this request, not just the last.
        usage: Usage,
        turns: usize,
    },

    MessageQueued {
        request_id: String,
    },

    OptimizationStatus {
        messages_before: usize,
        messages_after: usize,
        forced: bool,
    },

    ToolExecutionProgress {
        tool_call_id: String,
        tool_name: String,
        status: crate::message::ToolCallStatus,
        #[serde(skip_serializing_if = "Vec::is_empty")]
        images: Vec<ContentPart>,
    },

    BashOutputChunk {
        tool_call_id: String,
        line: String,
    },

    TodoUpdate {
        todos: Vec<TodoItem>,
    },

    PlanApprovalRequested {
        plan: String,
    },

    ToolApprovalRequested {
        tool_call_id: String,
        tool_name: String,
        arguments: String,
    },

    ToolExecutionCompleted {
        success_count: usize,
        failure_count: usize,
    },

    Cancelled,

    ChatError {
        message: String,
    },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolCallChunk {
    pub index: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub arguments_delta: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TodoItem {
    pub id: String,
    pub text: String,
    pub done: bool,
}

/// Result a rejected tool call's message is built from.
pub fn rejection_result(call: &ToolCallRequest) -> ToolExecutionResult {
    ToolExecutionResult::rejected(
        call.id.clone(),
        call.function_name.clone(),
        serde_json::from_str(&call.arguments).unwrap_or(serde_json::Value::Null),
    )
}

/// An outbound channel with a critical/non-critical split: the channel
/// must never block the agent, so non-critical events are dropped with a
/// warning when full, while critical events (status transitions,
/// completion) are retried with a short blocking send.
pub struct EventSink {
    tx: tokio::sync::mpsc::Sender<ChatEvent>,
    seq: std::sync::atomic::AtomicU64,
    request_id: String,
}

impl EventSink {
    pub fn new(capacity: usize, request_id: impl Into<String>) -> (Self, tokio::sync::mpsc::Receiver<ChatEvent>) {
        let (tx, rx) = tokio::sync::mpsc::channel(capacity);
        (
            Self {
                tx,
                seq: std::sync::atomic::AtomicU64::new(0),
                request_id: request_id.into(),
            },
            rx,
        )
    }

    fn next_seq(&self) -> u64 {
        self.seq.fetch_add(1, std::sync::atomic::Ordering::SeqCst)
    }

    fn envelope(&self, kind: ChatEventKind) -> ChatEvent {
        ChatEvent {
            seq: self.next_seq(),
            timestamp_unix: time::OffsetDateTime::now_utc().unix_timestamp(),
            request_id: self.request_id.clone(),
            kind,
        }
    }

    fn is_critical(kind: &ChatEventKind) -> bool {
        !matches!(
            kind,
            ChatEventKind::BashOutputChunk { .. } | ChatEventKind::TodoUpdate { .. }
        )
    }

    /// Emit an event. Critical events use `try_send` then fall back to a
    /// blocking `send` so completion/status transitions are never lost;
    /// non-critical events are dropped on a full channel.
    pub async fn emit(&self, kind: ChatEventKind) {
        let event = self.envelope(kind);
        if Self::is_critical(&event.kind) {
            if self.tx.try_send(event.clone()).is_err() {
                if self.tx.send(event).await.is_err() {
                    log::warn!("event channel closed while emitting a critical event");
                }
            }
        } else if self.tx.try_send(event).is_err() {
            log::warn!("event channel full, dropping non-critical event");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn full_channel_drops_noncritical_without_blocking() {
        let (sink, mut rx) = EventSink::new(1, "req-1");
        // Fill the channel's single slot.
        sink.emit(ChatEventKind::ChatStart).await;

        // Non-critical emit on a full channel must not block and must be dropped.
        let result = tokio::time::timeout(
            std::time::Duration::from_millis(200),
            sink.emit(ChatEventKind::BashOutputChunk {
                tool_call_id: "c1".into(),
                line: "output".into(),
            }),
        )
        .await;
        assert!(result.is_ok(), "emit must not block on a full channel");

        let first = rx.recv().await.unwrap();
        assert!(matches!(first.kind, ChatEventKind::ChatStart));
        // The dropped bash chunk should not appear.
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn seq_numbers_are_strictly_increasing() {
        let (sink, mut rx) = EventSink::new(10, "req-1");
        sink.emit(ChatEventKind::ChatStart).await;
        sink.emit(ChatEventKind::Cancelled).await;
        let a = rx.recv().await.unwrap();
        let b = rx.recv().await.unwrap();
        assert!(b.seq > a.seq);
    }
}
