//! Core message and tool-call data model.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Role of a participant in the conversation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    System,
    User,
    Assistant,
    Tool,
}

/// A single part of a message's content, as a tagged variant rather than a
/// reflection-based union.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ContentPart {
    Text { text: String },
    Image { mime_type: String, data_url: String },
}

impl ContentPart {
    pub fn text(text: impl Into<String>) -> Self {
        ContentPart::Text { text: text.into() }
    }

    pub fn image(mime_type: impl Into<String>, data_url: impl Into<String>) -> Self {
        ContentPart::Image {
            mime_type: mime_type.into(),
            data_url: data_url.into(),
        }
    }

    pub fn as_text(&self) -> Option<&str> {
        match self {
            ContentPart::Text { text } => Some(text),
            ContentPart::Image { .. } => None,
        }
    }
}

/// A function call requested by the assistant.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolCallRequest {
    pub id: String,
    pub function_name: String,
    /// JSON-encoded arguments string, exactly as streamed from the provider.
    pub arguments: String,
}

/// A single conversation message.
///
/// Invariant (T1, enforced by [`crate::conversation::Conversation`]): a
/// `Tool` message must carry `tool_call_id` matching a prior `Assistant`
/// message's `tool_calls` entry, and must appear before the next assistant
/// or user message.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    pub role: Role,
    pub content: Vec<ContentPart>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tool_calls: Vec<ToolCallRequest>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_call_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reasoning: Option<String>,
}

impl Message {
    pub fn system(text: impl Into<String>) -> Self {
        Self {
            role: Role::System,
            content: vec![ContentPart::text(text)],
            tool_calls: Vec::new(),
            tool_call_id: None,
            reasoning: None,
        }
    }

    pub fn user(text: impl Into<String>) -> Self {
        Self {
            role: Role::User,
            content: vec![ContentPart::text(text)],
            tool_calls: Vec::new(),
            tool_call_id: None,
            reasoning: None,
        }
    }

    pub fn assistant(text: impl Into<String>) -> Self {
        Self {
            role: Role::Assistant,
            content: vec![ContentPart::text(text)],
            tool_calls: Vec::new(),
            tool_call_id: None,
            reasoning: None,
        }
    }

    pub fn assistant_with_tool_calls(
        text: impl Into<String>,
        tool_calls: Vec<ToolCallRequest>,
        reasoning: Option<String>,
    ) -> Self {
        Self {
            role: Role::Assistant,
            content: vec![ContentPart::text(text)],
            tool_calls,
            tool_call_id: None,
            reasoning,
        }
    }

    pub fn tool_result(tool_call_id: impl Into<String>, text: impl Into<String>) -> Self {
        Self {
            role: Role::Tool,
            content: vec![ContentPart::text(text)],
            tool_calls: Vec::new(),
            tool_call_id: Some(tool_call_id.into()),
            reasoning: None,
        }
    }

    pub fn text(&self) -> String {
        self.content
            .iter()
            .filter_map(ContentPart::as_text)
            .collect::<Vec<_>>()
            .join("")
    }

    pub fn is_empty_text(&self) -> bool {
        self.content.iter().all(|p| match p {
            ContentPart::Text { text } => text.is_empty(),
            ContentPart::Image { .. } => false,
        })
    }
}

/// Lifecycle status of a single tool call. Transitions are monotonic
/// except `{queued -> starting -> running}`, which may be re-entered as a
/// heartbeat while the tool is executing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ToolCallStatus {
    Pending,
    Queued,
    Starting,
    Running,
    Saving,
    Completed,
    Failed,
    Rejected,
}

impl ToolCallStatus {
    /// Whether `next` is a legal transition from `self`.
    pub fn can_transition_to(self, next: ToolCallStatus) -> bool {
        use ToolCallStatus::*;
        match (self, next) {
            (Pending, Queued) => true,
            (Queued, Starting) | (Queued, Rejected) => true,
            (Starting, Running) | (Starting, Queued) => true,
            (Running, Running) | (Running, Queued) | (Running, Starting) => true,
            (Running, Saving) => true,
            (Saving, Completed) | (Saving, Failed) => true,
            (Queued, Completed) | (Queued, Failed) => true,
            (Starting, Completed) | (Starting, Failed) => true,
            (Running, Completed) | (Running, Failed) => true,
            _ => false,
        }
    }
}

/// The fully-materialized outcome of executing one tool call.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolExecutionResult {
    pub tool_call_id: String,
    pub tool_name: String,
    pub arguments: serde_json::Value,
    pub success: bool,
    pub duration_ms: u64,
    pub data: Option<serde_json::Value>,
    #[serde(default)]
    pub metadata: HashMap<String, serde_json::Value>,
    pub diff: Option<String>,
    pub error: Option<String>,
    #[serde(default)]
    pub images: Vec<ContentPart>,
    pub rejected: bool,
}

impl ToolExecutionResult {
    pub fn success(
        tool_call_id: impl Into<String>,
        tool_name: impl Into<String>,
        arguments: serde_json::Value,
        data: serde_json::Value,
        duration_ms: u64,
    ) -> Self {
        Self {
            tool_call_id: tool_call_id.into(),
            tool_name: tool_name.into(),
            arguments,
            success: true,
            duration_ms,
            data: Some(data),
            metadata: HashMap::new(),
            diff: None,
            error: None,
            images: Vec::new(),
            rejected: false,
        }
    }

    pub fn failure(
        tool_call_id: impl Into<String>,
        tool_name: impl Into<String>,
        arguments: serde_json::Value,
        error: impl Into<String>,
        duration_ms: u64,
    ) -> Self {
        Self {
            tool_call_id: tool_call_id.into(),
            tool_name: tool_name.into(),
            arguments,
            success: false,
            duration_ms,
            data: None,
            metadata: HashMap::new(),
            diff: None,
            error: Some(error.into()),
            images: Vec::new(),
            rejected: false,
        }
    }

    pub fn rejected(
        tool_call_id: impl Into<String>,
        tool_name: impl Into<String>,
        arguments: serde_json::Value,
    ) -> Self {
        Self {
            tool_call_id: tool_call_id.into(),
            tool_name: tool_name.into(),
            arguments,
            success: false,
            duration_ms: 0,
            data: None,
            metadata: HashMap::new(),
            diff: None,
            error: Some("rejected by user".to_string()),
            images: Vec::new(),
            rejected: true,
        }
    }

    /// Render the text the provider should see as the tool's result message.
    pub fn to_provider_text(&self) -> String {
        if let Some(err) = &self.error {
            format!("Error: {err}")
        } else {
            self.data
                .as_ref()
                .map(|v| v.to_string())
                .unwrap_or_default()
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Usage {
    pub prompt_tokens: u64,
    pub completion_tokens: u64,
    pub total_tokens: u64,
}

impl Usage {
    /// Folds another turn's usage into a running total.
    pub fn accumulate(&mut self, other: &Usage) {
        self.prompt_tokens += other.prompt_tokens;
        self.completion_tokens += other.completion_tokens;
        self.total_tokens += other.total_tokens;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tool_call_status_heartbeat_reentry() {
        assert!(ToolCallStatus::Queued.can_transition_to(ToolCallStatus::Starting));
        assert!(ToolCallStatus::Starting.can_transition_to(ToolCallStatus::Running));
        assert!(ToolCallStatus::Running.can_transition_to(ToolCallStatus::Running));
        assert!(ToolCallStatus::Running.can_transition_to(ToolCallStatus::Saving));
        assert!(ToolCallStatus::Saving.can_transition_to(ToolCallStatus::Completed));
        assert!(!ToolCallStatus::Completed.can_transition_to(ToolCallStatus::Running));
    }

    #[test]
    fn usage_accumulates_across_turns() {
        let mut total = Usage { prompt_tokens: 10, completion_tokens: 5, total_tokens: 15 };
        total.accumulate(&Usage { prompt_tokens: 3, completion_tokens: 2, total_tokens: 5 });
        assert_eq!(total.prompt_tokens, 13);
        assert_eq!(total.completion_tokens, 7);
        assert_eq!(total.total_tokens, 20);
    }

    #[test]
    fn rejected_result_carries_recovery_text() {
        let r = ToolExecutionResult::rejected("id1", "Read", serde_json::json!({"path": "a"}));
        assert!(r.rejected);
        assert_eq!(r.error.as_deref(), Some("rejected by user"));
    }

    #[test]
    fn message_text_joins_text_parts_only() {
        let mut m = Message::user("hi");
        m.content.push(ContentPart::image("image/png", "data:..."));
        assert_eq!(m.text(), "hi");
    }
}
