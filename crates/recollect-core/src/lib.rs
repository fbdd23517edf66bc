//! Core types and traits for the recollect memory engine

pub mod error;
pub mod message;
pub mod record;
pub mod traits;
pub mod types;

pub use error::{MemoryError, Result};
pub use message::{ChatMessage, RawTurn, Role};
pub use record::{Cursor, Lifecycle, NewSummaryRecord, Origin, SummaryRecord, TimeSpan};
pub use traits::cache::SharedCache;
pub use traits::llm::{LLMError, LLMProvider};
pub use traits::store::{RecordStore, TurnSource};
pub use types::{FinishReason, LLMConfig, LLMResponse, TokenUsage};
