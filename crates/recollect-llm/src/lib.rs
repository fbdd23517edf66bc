//! Text-generation providers for recollect

pub mod mock;
pub mod registry;

pub use mock::{MockCall, MockLLMProvider};
pub use recollect_core::{
    ChatMessage, FinishReason, LLMConfig, LLMError, LLMProvider, LLMResponse, Role, TokenUsage,
};
pub use registry::LLMRegistry;
