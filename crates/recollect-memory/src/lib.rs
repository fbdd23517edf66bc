//! Long-term conversation memory: windowed summarization, token budgeting
//! and lease-guarded compaction of summary records

pub mod compaction;
pub mod estimator;
pub mod keys;
pub mod lease;
pub mod sanitize;
pub mod summarizer;
pub mod summary_store;
pub mod token_budget;
pub mod tokens;
pub mod window;

pub use compaction::{CompactionEngine, CompactionOutcome, CompactionPlan, CompactionSettings};
pub use estimator::{AdaptiveSizeEstimator, clamp_alpha, ewma_step};
pub use keys::MemoryKeys;
pub use lease::{Lease, LeaseConfig, LeaseLock};
pub use sanitize::{
    PayloadSpan, SanitizeTier, Sanitized, SummaryPayload, sanitize_model_output, wrap_raw_text,
};
pub use summarizer::{LLMSummarizer, Summarizer};
pub use summary_store::SummaryStore;
pub use token_budget::{
    Budget, ModelProfile, ModelRegistry, PromptComponent, TokenBudgetCalculator,
};
pub use tokens::{clamp_record_tokens, estimate_json_tokens, estimate_text_tokens};
pub use window::{Participants, WindowOutcome, WindowSettings, WindowSummarizer};
