//! Conversation repository contract — consumed only.
//!
//! An async trait behind `Arc<dyn Trait>`, safe for concurrent appends. The
//! persistence format itself lives outside this crate.

use crate::conversation::ConversationEntry;
use crate::message::Usage;
use async_trait::async_trait;

#[derive(Debug, thiserror::Error)]
pub enum RepositoryError {
    #[error("repository storage error: {0}")]
    Storage(String),
}

/// Append-only conversation log with usage metadata. Implementations MUST
/// be safe for concurrent `add_message` calls.
#[async_trait]
pub trait ConversationRepository: Send + Sync {
    async fn add_message(&self, entry: ConversationEntry) -> Result<(), RepositoryError>;

    async fn add_token_usage(&self, model: &str, usage: &Usage) -> Result<(), RepositoryError>;

    async fn remove_pending_tool_call_by_id(&self, id: &str) -> Result<(), RepositoryError>;

    /// Render a tool result the way the provider expects it as message text.
    fn format_tool_result_for_llm(&self, result: &crate::message::ToolExecutionResult) -> String {
        result.to_provider_text()
    }
}
