//! recollect: bounded long-term memory for LLM conversations

pub mod error {
    pub use recollect_core::{MemoryError, Result};
}

pub mod model {
    pub use recollect_core::{
        Cursor, Lifecycle, NewSummaryRecord, Origin, RawTurn, Role, SummaryRecord, TimeSpan,
    };
}

pub mod llm {
    pub use recollect_core::{
        ChatMessage, FinishReason, LLMConfig, LLMError, LLMProvider, LLMResponse, TokenUsage,
    };
    pub use recollect_llm::{LLMRegistry, MockCall, MockLLMProvider};
}

pub mod storage {
    pub use recollect_core::{RecordStore, SharedCache, TurnSource};
    #[cfg(feature = "sqlite")]
    pub use recollect_storage::SqliteRecordStore;
    pub use recollect_storage::{
        CacheConfig, DurableBackend, InMemoryCache, InMemoryRecordStore, RedisCache, StorageConfig,
        StoreConfig, create_cache, create_record_store,
    };
}

pub mod memory {
    pub use recollect_memory::{
        AdaptiveSizeEstimator, Budget, CompactionEngine, CompactionOutcome, CompactionPlan,
        CompactionSettings, LLMSummarizer, Lease, LeaseConfig, LeaseLock, MemoryKeys,
        ModelProfile, ModelRegistry, Participants, PayloadSpan, PromptComponent, SanitizeTier,
        Sanitized, Summarizer, SummaryPayload, SummaryStore, TokenBudgetCalculator,
        WindowOutcome, WindowSettings, WindowSummarizer, clamp_alpha, clamp_record_tokens,
        estimate_json_tokens, estimate_text_tokens, ewma_step, sanitize_model_output,
        wrap_raw_text,
    };
}

pub mod runtime {
    pub use recollect_runtime::{
        CompactionConfig, EstimatorConfig, MaintenancePool, MemoryMaintainer, PromptMemoryPlan,
        PromptMemoryPlanner, RecentCacheConfig, RecollectConfig, SummaryConfig,
        TurnMaintenance, WindowConfig, WorkerConfig,
    };
}

pub use error::{MemoryError, Result};
pub use llm::{LLMProvider, LLMRegistry};
pub use memory::{
    Budget, CompactionEngine, CompactionOutcome, LeaseLock, Participants, PromptComponent,
    Summarizer, SummaryStore, TokenBudgetCalculator, WindowOutcome, WindowSummarizer,
};
pub use model::{Origin, RawTurn, Role, SummaryRecord};
pub use runtime::{MaintenancePool, MemoryMaintainer, PromptMemoryPlanner, RecollectConfig};
pub use storage::{RecordStore, SharedCache, StorageConfig, TurnSource};
