//! Tokenizer Polyfill: character-based usage estimator used only when the
//! provider returns no usage or all-zero usage.

use crate::message::{Message, Role, Usage};

/// Pluggable character-to-token estimator.
pub trait TokenEstimator: Send + Sync {
    fn estimate(&self, text: &str) -> usize;
}

#[derive(Debug, Clone)]
pub struct TokenizerPolyfill {
    pub chars_per_token: f64,
    pub per_message_overhead: u64,
    pub per_tool_call_overhead: u64,
}

impl Default for TokenizerPolyfill {
    fn default() -> Self {
        Self {
            chars_per_token: 4.0,
            per_message_overhead: 4,
            per_tool_call_overhead: 10,
        }
    }
}

impl TokenEstimator for TokenizerPolyfill {
    fn estimate(&self, text: &str) -> usize {
        ((text.chars().count() as f64) / self.chars_per_token).ceil() as usize
    }
}

impl TokenizerPolyfill {
    pub fn new(chars_per_token: f64, per_message_overhead: u64, per_tool_call_overhead: u64) -> Self {
        Self {
            chars_per_token,
            per_message_overhead,
            per_tool_call_overhead,
        }
    }

    /// Returns true if `usage` is absent or reports an all-zero count,
    /// meaning the polyfill should be used in its place.
    pub fn should_polyfill(usage: Option<&Usage>) -> bool {
        match usage {
            None => true,
            Some(u) => u.prompt_tokens == 0 && u.completion_tokens == 0 && u.total_tokens == 0,
        }
    }

    fn message_tokens(&self, message: &Message) -> u64 {
        let mut tokens = self.per_message_overhead;
        tokens += self.estimate(&message.text()) as u64;
        tokens += message.tool_calls.len() as u64 * self.per_tool_call_overhead;
        for tc in &message.tool_calls {
            tokens += self.estimate(&tc.arguments) as u64;
        }
        tokens
    }

    /// Estimate prompt tokens for the messages about to be sent, and
    /// completion tokens for the assistant's response text + tool-call
    /// arguments. Non-negative by construction (u64).
    pub fn estimate_usage(&self, prompt_messages: &[&Message], completion: &Message) -> Usage {
        let prompt_tokens: u64 = prompt_messages.iter().map(|m| self.message_tokens(m)).sum();
        let completion_tokens = self.message_tokens(completion);
        Usage {
            prompt_tokens,
            completion_tokens,
            total_tokens: prompt_tokens + completion_tokens,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::ToolCallRequest;

    #[test]
    fn should_polyfill_when_absent_or_zero() {
        assert!(TokenizerPolyfill::should_polyfill(None));
        assert!(TokenizerPolyfill::should_polyfill(Some(&Usage::default())));
        assert!(!TokenizerPolyfill::should_polyfill(Some(&Usage {
            prompt_tokens: 1,
            completion_tokens: 0,
            total_tokens: 1,
        })));
    }

    #[test]
    fn estimate_is_non_negative_and_grows_with_input() {
        let tok = TokenizerPolyfill::default();
        let short = vec![Message::user("hi")];
        let long = vec![Message::user("hi"), Message::user(&"x".repeat(400))];

        let short_refs: Vec<&Message> = short.iter().collect();
        let long_refs: Vec<&Message> = long.iter().collect();

        let u1 = tok.estimate_usage(&short_refs, &Message::assistant(""));
        let u2 = tok.estimate_usage(&long_refs, &Message::assistant(""));

        assert!(u1.total_tokens <= u2.total_tokens, "polyfill must be monotonic as input grows");
    }

    #[test]
    fn tool_calls_add_overhead() {
        let tok = TokenizerPolyfill::default();
        let plain = Message::assistant("");
        let with_call = Message::assistant_with_tool_calls(
            "",
            vec![ToolCallRequest {
                id: "1".into(),
                function_name: "Read".into(),
                arguments: "{\"path\":\"a\"}".into(),
            }],
            None,
        );
        assert!(tok.message_tokens(&with_call) > tok.message_tokens(&plain));
    }
}
