//! Conversation Optimizer: bounds token use without breaking tool-call
//! groups, by summarizing a pinned-head/verbatim-tail middle section and
//! falling back to a structural summary if the model call fails.

use crate::conversation::{Conversation, ConversationEntry};
use crate::events::{ChatEventKind, EventSink};
use crate::message::{Message, Role};
use crate::provider::{ChatProvider, ModelId};
use crate::tokenizer::TokenizerPolyfill;
use std::sync::Arc;
use std::time::Duration;

const COMPACTION_PROMPT: &str =
    "Summarize the following conversation excerpt in 2-3 sentences, \
     preserving any decisions, file paths, and outstanding work. \
     Do not mention that this is a summary.";

const SUMMARY_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Debug, Clone)]
pub struct OptimizerConfig {
    /// Pinned root context kept verbatim, default 2 user exchanges (4
    /// entries: user+assistant, twice).
    pub keep_first_messages: usize,
    /// Tail kept verbatim, default 2 entries.
    pub buffer_size: usize,
    /// Trigger threshold, percent of `model_context_tokens`.
    pub auto_at_percent: f64,
    pub model_context_tokens: u64,
}

impl Default for OptimizerConfig {
    fn default() -> Self {
        Self {
            keep_first_messages: 4,
            buffer_size: 2,
            auto_at_percent: 80.0,
            model_context_tokens: 128_000,
        }
    }
}

pub struct ConversationOptimizer {
    provider: Option<Arc<dyn ChatProvider>>,
    config: OptimizerConfig,
    tokenizer: TokenizerPolyfill,
}

impl ConversationOptimizer {
    pub fn new(provider: Option<Arc<dyn ChatProvider>>, config: OptimizerConfig) -> Self {
        Self {
            provider,
            config,
            tokenizer: TokenizerPolyfill::default(),
        }
    }

    fn estimate_total_tokens(&self, conversation: &Conversation) -> u64 {
        let messages = conversation.messages();
        let empty = Message::assistant("");
        self.tokenizer.estimate_usage(&messages, &empty).prompt_tokens
    }

    /// Whether the optimizer should run: forced, or estimated tokens exceed
    /// the configured percentage of the model's context window.
    pub fn should_trigger(&self, conversation: &Conversation, force: bool) -> bool {
        if force {
            return true;
        }
        let tokens = self.estimate_total_tokens(conversation);
        let threshold = (self.config.model_context_tokens as f64) * (self.config.auto_at_percent / 100.0);
        (tokens as f64) > threshold
    }

    /// Run the optimizer. Returns the (possibly unchanged) conversation.
    /// Emits `OptimizationStatus` on `events` only if the entry count
    /// changed.
    pub async fn optimize(
        &self,
        conversation: &Conversation,
        model: &ModelId,
        force: bool,
        events: &EventSink,
    ) -> Conversation {
        if !self.should_trigger(conversation, force) {
            return conversation.clone();
        }

        let before = conversation.entries.len();

        // 1. Split system messages (kept verbatim) from conversation entries.
        let (system, rest): (Vec<usize>, Vec<usize>) = (0..conversation.entries.len())
            .partition(|&i| conversation.entries[i].message.role == Role::System);

        if rest.len() <= self.config.keep_first_messages + self.config.buffer_size {
            // Round-trip idempotence: nothing worth summarizing.
            return conversation.clone();
        }

        // 2-3. Pinned head, tail shifted earlier to respect tool groups.
        let head_end = self.config.keep_first_messages.min(rest.len());
        let raw_tail_start = rest.len().saturating_sub(self.config.buffer_size);
        let tail_start_in_rest = self.shift_tail_to_group_boundary(conversation, &rest, raw_tail_start.max(head_end));

        let head_indices = &rest[..head_end];
        let middle_indices = &rest[head_end..tail_start_in_rest];
        let tail_indices = &rest[tail_start_in_rest..];

        if middle_indices.is_empty() {
            return conversation.clone();
        }

        let middle_entries: Vec<&ConversationEntry> = middle_indices.iter().map(|&i| &conversation.entries[i]).collect();
        let summary_text = self.summarize(&middle_entries, model).await;

        let mut result = Conversation::new();
        for &i in &system {
            result.push(conversation.entries[i].clone());
        }
        for &i in head_indices {
            result.push(conversation.entries[i].clone());
        }
        result.push(ConversationEntry::new(
            Message::assistant(format!("[Context Summary: {summary_text}]")),
            middle_entries.last().map(|e| e.created_at_unix).unwrap_or(0),
        ));
        for &i in tail_indices {
            result.push(conversation.entries[i].clone());
        }

        // 5. Drop any assistant message whose tool_calls no longer have an
        // immediately-following response in the summarized result.
        self.drop_orphaned_tool_groups(&mut result);

        let after = result.entries.len();
        if after != before {
            events
                .emit(ChatEventKind::OptimizationStatus {
                    messages_before: before,
                    messages_after: after,
                    forced: force,
                })
                .await;
        }

        result
    }

    /// If `tail_start` lands mid tool-group, move it to the start of that
    /// group so the tool-call/tool-result pairing invariant holds in the
    /// tail.
    fn shift_tail_to_group_boundary(&self, conversation: &Conversation, rest: &[usize], tail_start: usize) -> usize {
        if tail_start >= rest.len() {
            return rest.len();
        }
        let entry_idx = rest[tail_start];
        match conversation.group_start_containing(entry_idx) {
            Some(group_start_entry_idx) => rest
                .iter()
                .position(|&i| i == group_start_entry_idx)
                .unwrap_or(tail_start),
            None => tail_start,
        }
    }

    fn drop_orphaned_tool_groups(&self, conversation: &mut Conversation) {
        use crate::conversation::ToolGroupError;
        loop {
            let broken_id = match conversation.validate_tool_groups() {
                Ok(()) => return,
                Err(ToolGroupError::MissingResult(id)) => id,
                Err(ToolGroupError::UnmatchedToolMessage(_)) => return, // not this summarizer's doing
            };
            let owner = conversation
                .entries
                .iter()
                .position(|e| e.message.tool_calls.iter().any(|tc| tc.id == broken_id));
            match owner {
                Some(idx) => {
                    conversation.entries.remove(idx);
                }
                None => return,
            }
        }
    }

    async fn summarize(&self, entries: &[&ConversationEntry], model: &ModelId) -> String {
        if let Some(provider) = &self.provider {
            let prompt_messages: Vec<Message> = vec![
                Message::system(COMPACTION_PROMPT),
                Message::user(render_excerpt(entries)),
            ];
            let attempt = tokio::time::timeout(SUMMARY_TIMEOUT, provider.generate_content(model, &prompt_messages, &[])).await;
            if let Ok(Ok(response)) = attempt {
                let text = response.text();
                if !text.trim().is_empty() {
                    return text;
                }
            }
        }
        structural_summary(entries)
    }
}

fn render_excerpt(entries: &[&ConversationEntry]) -> String {
    entries
        .iter()
        .map(|e| format!("{:?}: {}", e.message.role, e.message.text()))
        .collect::<Vec<_>>()
        .join("\n")
}

fn structural_summary(entries: &[&ConversationEntry]) -> String {
    let user = entries.iter().filter(|e| e.message.role == Role::User).count();
    let assistant = entries.iter().filter(|e| e.message.role == Role::Assistant).count();
    let tool = entries.iter().filter(|e| e.message.role == Role::Tool).count();
    format!("{user} user messages, {assistant} assistant, {tool} tool executions")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::ToolCallRequest;

    fn entry(role: Role, text: &str, at: i64) -> ConversationEntry {
        let message = match role {
            Role::User => Message::user(text),
            Role::Assistant => Message::assistant(text),
            Role::System => Message::system(text),
            Role::Tool => Message::tool_result("x", text),
        };
        ConversationEntry::new(message, at)
    }

    fn optimizer() -> ConversationOptimizer {
        ConversationOptimizer::new(
            None,
            OptimizerConfig {
                keep_first_messages: 2,
                buffer_size: 2,
                auto_at_percent: 80.0,
                model_context_tokens: 128_000,
            },
        )
    }

    #[tokio::test]
    async fn short_conversation_is_returned_unchanged() {
        let mut c = Conversation::new();
        c.push(entry(Role::User, "hi", 0));
        c.push(entry(Role::Assistant, "hello", 1));

        let (sink, _rx) = EventSink::new(10, "req-1");
        let model = ModelId::parse("openai/gpt-4").unwrap();
        let result = optimizer().optimize(&c, &model, true, &sink).await;
        assert_eq!(result.entries.len(), c.entries.len());
    }

    #[tokio::test]
    async fn preserves_tool_group_at_tail_boundary() {
        let mut c = Conversation::new();
        for i in 0..6 {
            c.push(entry(Role::User, &format!("u{i}"), i as i64));
            c.push(entry(Role::Assistant, &format!("a{i}"), i as i64));
        }
        c.push(ConversationEntry::new(
            Message::assistant_with_tool_calls(
                "",
                vec![
                    ToolCallRequest { id: "x".into(), function_name: "Read".into(), arguments: "{}".into() },
                    ToolCallRequest { id: "y".into(), function_name: "Read".into(), arguments: "{}".into() },
                ],
                None,
            ),
            100,
        ));
        c.push(entry(Role::Tool, "result-x", 101));
        c.push(ConversationEntry::new(Message::tool_result("y", "result-y"), 102));

        let (sink, _rx) = EventSink::new(10, "req-1");
        let model = ModelId::parse("openai/gpt-4").unwrap();
        let result = optimizer().optimize(&c, &model, true, &sink).await;
        assert!(result.validate_tool_groups().is_ok());
    }
}
