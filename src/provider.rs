//! Provider client contract — consumed only.
//!
//! A trait object the core calls through, never implements. The concrete
//! streaming content generator (HTTP client, retries, model catalogs) lives
//! outside this crate.

use crate::message::Message;
use crate::streaming::StreamChunk;
use async_trait::async_trait;
use futures_util::stream::BoxStream;
use std::time::Duration;

/// A tool made available to the model for one call, per current agent mode.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct ToolDeclaration {
    pub name: String,
    pub description: String,
    pub parameters_schema: serde_json::Value,
}

#[derive(Debug, thiserror::Error)]
pub enum ProviderError {
    #[error("network error: {0}")]
    Network(String),
    #[error("provider returned {status}: {body}")]
    Http { status: u16, body: String },
    #[error("failed to parse provider response: {0}")]
    Parse(String),
}

/// A model id of the form `provider/model`; the core splits on the first
/// `/`.
#[derive(Debug, Clone)]
pub struct ModelId {
    pub provider: String,
    pub model: String,
}

impl ModelId {
    pub fn parse(raw: &str) -> Option<Self> {
        let (provider, model) = raw.split_once('/')?;
        Some(Self {
            provider: provider.to_string(),
            model: model.to_string(),
        })
    }
}

/// Consumed streaming content generator. Option/tool/middleware
/// configuration is modeled as builder methods on the concrete client
/// outside this crate; the core only needs the call surface below.
#[async_trait]
pub trait ChatProvider: Send + Sync {
    async fn generate_content(
        &self,
        model: &ModelId,
        messages: &[Message],
        tools: &[ToolDeclaration],
    ) -> Result<Message, ProviderError>;

    async fn generate_content_stream(
        &self,
        model: &ModelId,
        messages: &[Message],
        tools: &[ToolDeclaration],
    ) -> Result<BoxStream<'static, Result<StreamChunk, ProviderError>>, ProviderError>;

    async fn list_models(&self, provider: &str) -> Result<Vec<String>, ProviderError>;

    async fn health_check(&self, provider: &str, timeout: Duration) -> Result<(), ProviderError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn model_id_splits_on_first_slash_only() {
        let m = ModelId::parse("openai/gpt-4/extra").unwrap();
        assert_eq!(m.provider, "openai");
        assert_eq!(m.model, "gpt-4/extra");
    }

    #[test]
    fn model_id_without_slash_is_none() {
        assert!(ModelId::parse("gpt-4").is_none());
    }
}
