use async_trait::async_trait;

use crate::errors::ModelError;
use crate::llm::types::ChatMessage;

/// Vision-language model endpoint consumed by the worker loop.
/// Implementations make exactly one attempt per call; retries belong to the caller.
#[async_trait]
pub trait ModelClient: Send + Sync {
    /// Identifier of the backing provider (matches the config.toml key).
    fn name(&self) -> &str;

    /// Returns the assistant text for `messages`.
    async fn complete(&self, messages: &[ChatMessage]) -> Result<String, ModelError>;
}
