//! Error types shared by every recollect crate

use thiserror::Error;

use crate::traits::llm::LLMError;

pub type Result<T> = std::result::Result<T, MemoryError>;

#[derive(Debug, Error)]
pub enum MemoryError {
    /// The durable record store rejected a read or write.
    #[error("Persistence error: {0}")]
    Persistence(String),

    /// The shared cache (lease, list, hash primitives) failed.
    #[error("Cache error: {0}")]
    Cache(String),

    #[error("Generation error: {0}")]
    Generation(#[from] LLMError),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Maintenance queue is full")]
    QueueFull,

    #[error("{0}")]
    Other(String),
}

impl From<serde_json::Error> for MemoryError {
    fn from(err: serde_json::Error) -> Self {
        MemoryError::Serialization(err.to_string())
    }
}
