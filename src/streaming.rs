//! Streaming Aggregator: reconstructs the assistant message + tool-call set
//! from an incremental chunk stream, keyed by tool-call index so
//! out-of-order or interleaved deltas still reassemble correctly.

use crate::message::{ToolCallRequest, Usage};
use crate::tokenizer::TokenizerPolyfill;
use std::collections::BTreeMap;

/// One incremental chunk from the provider's stream.
#[derive(Debug, Clone)]
pub enum StreamChunk {
    Text(String),
    Reasoning(String),
    ToolCallStart { index: usize, id: String, name: String },
    ToolCallArgumentsDelta { index: usize, partial_json: String },
    Usage(Usage),
    Done,
}

#[derive(Debug, Default, Clone)]
struct PartialToolCall {
    id: String,
    name: String,
    arguments: String,
}

/// Accumulates one turn's worth of chunks into a final assistant message.
#[derive(Default)]
pub struct StreamingAggregator {
    text: String,
    reasoning: String,
    tool_calls: BTreeMap<usize, PartialToolCall>,
    usage: Option<Usage>,
}

/// The fully reconstructed result of one stream, produced on
/// `STREAM_COMPLETED`.
#[derive(Debug, Clone)]
pub struct AggregatedTurn {
    pub content: String,
    pub reasoning: Option<String>,
    pub tool_calls: Vec<ToolCallRequest>,
    pub usage: Usage,
    pub usage_was_polyfilled: bool,
}

impl StreamingAggregator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed one chunk. Chunks sharing an index concatenate their argument
    /// deltas in arrival order.
    pub fn push(&mut self, chunk: StreamChunk) {
        match chunk {
            StreamChunk::Text(delta) => self.text.push_str(&delta),
            StreamChunk::Reasoning(delta) => self.reasoning.push_str(&delta),
            StreamChunk::ToolCallStart { index, id, name } => {
                let entry = self.tool_calls.entry(index).or_default();
                entry.id = id;
                entry.name = name;
            }
            StreamChunk::ToolCallArgumentsDelta { index, partial_json } => {
                self.tool_calls
                    .entry(index)
                    .or_default()
                    .arguments
                    .push_str(&partial_json);
            }
            StreamChunk::Usage(u) => self.usage = Some(u),
            StreamChunk::Done => {}
        }
    }

    /// Finalize the turn. If the provider never supplied usage (or reported
    /// all-zero usage), compute a polyfill estimate via the tokenizer.
    pub fn finish(self, prompt_messages: &[&crate::message::Message], tokenizer: &TokenizerPolyfill) -> AggregatedTurn {
        let tool_calls: Vec<ToolCallRequest> = self
            .tool_calls
            .into_iter()
            .map(|(_, v)| ToolCallRequest {
                id: v.id,
                function_name: v.name,
                arguments: v.arguments,
            })
            .collect();

        let (usage, polyfilled) = if TokenizerPolyfill::should_polyfill(self.usage.as_ref()) {
            let completion = crate::message::Message::assistant_with_tool_calls(
                self.text.clone(),
                tool_calls.clone(),
                None,
            );
            (
                tokenizer.estimate_usage(prompt_messages, &completion),
                true,
            )
        } else {
            (self.usage.unwrap(), false)
        };

        AggregatedTurn {
            content: self.text,
            reasoning: if self.reasoning.is_empty() {
                None
            } else {
                Some(self.reasoning)
            },
            tool_calls,
            usage,
            usage_was_polyfilled: polyfilled,
        }
    }
}

/// Validates that a tool call's arguments string is complete JSON. Used by
/// the executor before decoding and invoking the tool.
pub fn validate_complete_json(arguments: &str) -> Result<serde_json::Value, String> {
    serde_json::from_str(arguments).map_err(|e| {
        format!(
            "incomplete or invalid JSON arguments (likely truncated mid-stream): {e}"
        )
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::Message;

    #[test]
    fn same_index_chunks_concatenate_in_order() {
        let mut agg = StreamingAggregator::new();
        agg.push(StreamChunk::ToolCallStart {
            index: 0,
            id: "c1".into(),
            name: "Read".into(),
        });
        agg.push(StreamChunk::ToolCallArgumentsDelta {
            index: 0,
            partial_json: "{\"path\":".into(),
        });
        agg.push(StreamChunk::ToolCallArgumentsDelta {
            index: 0,
            partial_json: "\"a.txt\"}".into(),
        });

        let tok = TokenizerPolyfill::default();
        let turn = agg.finish(&[], &tok);
        assert_eq!(turn.tool_calls.len(), 1);
        assert_eq!(turn.tool_calls[0].arguments, "{\"path\":\"a.txt\"}");
        assert!(validate_complete_json(&turn.tool_calls[0].arguments).is_ok());
    }

    #[test]
    fn multiple_indices_preserve_call_order() {
        let mut agg = StreamingAggregator::new();
        agg.push(StreamChunk::ToolCallStart { index: 1, id: "b".into(), name: "Write".into() });
        agg.push(StreamChunk::ToolCallStart { index: 0, id: "a".into(), name: "Read".into() });
        let tok = TokenizerPolyfill::default();
        let turn = agg.finish(&[], &tok);
        assert_eq!(turn.tool_calls[0].id, "a");
        assert_eq!(turn.tool_calls[1].id, "b");
    }

    #[test]
    fn missing_usage_triggers_polyfill() {
        let mut agg = StreamingAggregator::new();
        agg.push(StreamChunk::Text("hello".into()));
        let tok = TokenizerPolyfill::default();
        let m = Message::user("hi");
        let turn = agg.finish(&[&m], &tok);
        assert!(turn.usage_was_polyfilled);
        assert!(turn.usage.total_tokens > 0);
    }

    #[test]
    fn present_nonzero_usage_is_not_polyfilled() {
        let mut agg = StreamingAggregator::new();
        agg.push(StreamChunk::Usage(Usage {
            prompt_tokens: 10,
            completion_tokens: 5,
            total_tokens: 15,
        }));
        let tok = TokenizerPolyfill::default();
        let turn = agg.finish(&[], &tok);
        assert!(!turn.usage_was_polyfilled);
        assert_eq!(turn.usage.total_tokens, 15);
    }

    #[test]
    fn incomplete_json_fails_validation() {
        assert!(validate_complete_json("{\"path\": \"a.tx").is_err());
    }
}
