//! Seams between the memory engine and its collaborators

pub mod cache;
pub mod llm;
pub mod store;

pub use cache::SharedCache;
pub use llm::LLMProvider;
pub use store::{RecordStore, TurnSource};
