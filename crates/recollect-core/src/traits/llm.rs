//! Text-generation provider trait

use async_trait::async_trait;
use thiserror::Error;

use crate::message::ChatMessage;
use crate::types::{LLMConfig, LLMResponse};

/// External text-generation capability used for summarizing and merging.
///
/// The engine treats providers as opaque: output is expected, not
/// guaranteed, to follow the requested JSON shape.
#[async_trait]
pub trait LLMProvider: Send + Sync {
    async fn complete(
        &self,
        messages: &[ChatMessage],
        config: Option<&LLMConfig>,
    ) -> Result<LLMResponse, LLMError>;

    fn provider_name(&self) -> &str;
}

#[derive(Debug, Error)]
pub enum LLMError {
    #[error("API error: {message}")]
    API {
        message: String,
        status: Option<u16>,
    },

    #[error("Network error: {0}")]
    Network(String),

    #[error("Rate limit exceeded: {retry_after:?}")]
    RateLimit {
        retry_after: Option<std::time::Duration>,
    },

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Model not found: {0}")]
    ModelNotFound(String),

    #[error("Content filtered: {0}")]
    ContentFiltered(String),

    #[error("Other error: {0}")]
    Other(String),
}
