//! Conversation: the ordered message log plus the append-only entry log,
//! and the invariant that every assistant tool call is followed by a
//! matching tool-result message before the next assistant/user turn.

use crate::message::{Message, Role, ToolExecutionResult};
use serde::{Deserialize, Serialize};

/// One entry of the append-only conversation log. Carries bookkeeping the
/// bare `Message` does not: timestamps, visibility, and (for tool entries)
/// the full execution result.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConversationEntry {
    pub message: Message,
    pub created_at_unix: i64,
    #[serde(default)]
    pub hidden: bool,
    #[serde(default)]
    pub plan_approval_pending: bool,
    #[serde(default)]
    pub tool_result: Option<ToolExecutionResult>,
}

impl ConversationEntry {
    pub fn new(message: Message, created_at_unix: i64) -> Self {
        Self {
            message,
            created_at_unix,
            hidden: false,
            plan_approval_pending: false,
            tool_result: None,
        }
    }

    pub fn hidden(mut self) -> Self {
        self.hidden = true;
        self
    }

    pub fn with_tool_result(mut self, result: ToolExecutionResult) -> Self {
        self.tool_result = Some(result);
        self
    }
}

/// The ordered conversation: system prompt + history + in-flight turn.
///
/// Invariant: for every assistant message with `tool_calls`, each call id
/// MUST be followed (with no intervening assistant or user message) by a
/// tool message carrying that id, before the conversation may be sent to
/// the provider. [`Conversation::validate_tool_groups`] checks this.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Conversation {
    pub entries: Vec<ConversationEntry>,
}

/// A violation of the tool-call/tool-result pairing invariant.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ToolGroupError {
    #[error("assistant tool_call {0} has no matching tool result before the next assistant/user message")]
    MissingResult(String),
    #[error("tool message {0} does not match any pending assistant tool_call")]
    UnmatchedToolMessage(String),
}

impl Conversation {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, entry: ConversationEntry) {
        self.entries.push(entry);
    }

    pub fn messages(&self) -> Vec<&Message> {
        self.entries
            .iter()
            .filter(|e| !e.hidden)
            .map(|e| &e.message)
            .collect()
    }

    pub fn last_message(&self) -> Option<&Message> {
        self.entries.last().map(|e| &e.message)
    }

    /// True if the last *visible* message is an assistant message with no
    /// tool_calls (used by the queue-check step's completion short-circuit).
    pub fn last_is_assistant_without_tool_calls(&self) -> bool {
        match self.entries.iter().rev().find(|e| !e.hidden) {
            Some(e) => e.message.role == Role::Assistant && e.message.tool_calls.is_empty(),
            None => false,
        }
    }

    /// Enforce the tool-call/tool-result pairing invariant across the whole
    /// entry log.
    pub fn validate_tool_groups(&self) -> Result<(), ToolGroupError> {
        let mut pending: Vec<String> = Vec::new();

        for entry in &self.entries {
            match entry.message.role {
                Role::Assistant => {
                    if !pending.is_empty() {
                        return Err(ToolGroupError::MissingResult(pending[0].clone()));
                    }
                    pending = entry
                        .message
                        .tool_calls
                        .iter()
                        .map(|tc| tc.id.clone())
                        .collect();
                }
                Role::User => {
                    if !pending.is_empty() {
                        return Err(ToolGroupError::MissingResult(pending[0].clone()));
                    }
                }
                Role::Tool => {
                    let id = entry
                        .message
                        .tool_call_id
                        .clone()
                        .unwrap_or_default();
                    match pending.iter().position(|p| p == &id) {
                        Some(pos) => {
                            pending.remove(pos);
                        }
                        None => return Err(ToolGroupError::UnmatchedToolMessage(id)),
                    }
                }
                Role::System => {}
            }
        }

        if let Some(first) = pending.first() {
            return Err(ToolGroupError::MissingResult(first.clone()));
        }

        Ok(())
    }

    /// Index of the start of the tool group that contains `idx` (the
    /// assistant message whose tool_calls are still being answered at
    /// `idx`), if any. Used by the optimizer to avoid truncating mid-group.
    pub fn group_start_containing(&self, idx: usize) -> Option<usize> {
        if idx >= self.entries.len() {
            return None;
        }
        // Walk backward from idx to the nearest preceding assistant message
        // with tool_calls, stopping if we cross another assistant/user
        // message first (meaning idx is not inside an open group).
        let mut i = idx;
        loop {
            match self.entries[i].message.role {
                Role::Assistant => {
                    return if self.entries[i].message.tool_calls.is_empty() {
                        None
                    } else {
                        Some(i)
                    };
                }
                Role::Tool => {
                    if i == 0 {
                        return None;
                    }
                    i -= 1;
                }
                Role::User | Role::System => return None,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::ToolCallRequest;

    fn now() -> i64 {
        0
    }

    #[test]
    fn empty_conversation_is_valid() {
        assert!(Conversation::new().validate_tool_groups().is_ok());
    }

    #[test]
    fn well_formed_tool_group_validates() {
        let mut c = Conversation::new();
        c.push(ConversationEntry::new(Message::user("hi"), now()));
        c.push(ConversationEntry::new(
            Message::assistant_with_tool_calls(
                "",
                vec![ToolCallRequest {
                    id: "c1".into(),
                    function_name: "Read".into(),
                    arguments: "{}".into(),
                }],
                None,
            ),
            now(),
        ));
        c.push(ConversationEntry::new(
            Message::tool_result("c1", "FOO"),
            now(),
        ));
        assert!(c.validate_tool_groups().is_ok());
    }

    #[test]
    fn missing_tool_result_is_rejected() {
        let mut c = Conversation::new();
        c.push(ConversationEntry::new(
            Message::assistant_with_tool_calls(
                "",
                vec![ToolCallRequest {
                    id: "c1".into(),
                    function_name: "Read".into(),
                    arguments: "{}".into(),
                }],
                None,
            ),
            now(),
        ));
        c.push(ConversationEntry::new(Message::user("are you done?"), now()));
        assert_eq!(
            c.validate_tool_groups(),
            Err(ToolGroupError::MissingResult("c1".into()))
        );
    }

    #[test]
    fn unmatched_tool_message_is_rejected() {
        let mut c = Conversation::new();
        c.push(ConversationEntry::new(
            Message::tool_result("ghost", "x"),
            now(),
        ));
        assert_eq!(
            c.validate_tool_groups(),
            Err(ToolGroupError::UnmatchedToolMessage("ghost".into()))
        );
    }

    #[test]
    fn group_start_containing_finds_assistant_boundary() {
        let mut c = Conversation::new();
        c.push(ConversationEntry::new(Message::user("list"), now())); // 0
        c.push(ConversationEntry::new(
            Message::assistant_with_tool_calls(
                "",
                vec![
                    ToolCallRequest {
                        id: "x".into(),
                        function_name: "Read".into(),
                        arguments: "{}".into(),
                    },
                    ToolCallRequest {
                        id: "y".into(),
                        function_name: "Read".into(),
                        arguments: "{}".into(),
                    },
                ],
                None,
            ),
            now(),
        )); // 1
        c.push(ConversationEntry::new(Message::tool_result("x", "a"), now())); // 2
        c.push(ConversationEntry::new(Message::tool_result("y", "b"), now())); // 3

        assert_eq!(c.group_start_containing(3), Some(1));
        assert_eq!(c.group_start_containing(2), Some(1));
        assert_eq!(c.group_start_containing(1), Some(1));
        assert_eq!(c.group_start_containing(0), None);
    }
}
