//! Per-turn memory maintenance: counters, windowing, compaction

use std::sync::Arc;

use tracing::{info, warn};

use recollect_core::{Result, SharedCache, SummaryRecord, TurnSource};
use recollect_llm::LLMRegistry;
use recollect_memory::{
    AdaptiveSizeEstimator, CompactionEngine, CompactionOutcome, LLMSummarizer, LeaseLock,
    Participants, Summarizer, SummaryStore, TokenBudgetCalculator, WindowOutcome,
    WindowSummarizer, estimate_text_tokens,
};
use recollect_storage::{DurableBackend, create_cache, create_record_store};

use crate::config::RecollectConfig;
use crate::planner::PromptMemoryPlanner;
use crate::pool::MaintenancePool;

/// What one turn's maintenance did. The two cycles are independent: a
/// failed window does not prevent the compaction check.
#[derive(Debug)]
pub struct TurnMaintenance {
    pub since_last: u64,
    pub window: Result<WindowOutcome>,
    pub compaction: Result<CompactionOutcome>,
}

impl TurnMaintenance {
    pub fn is_ok(&self) -> bool {
        self.window.is_ok() && self.compaction.is_ok()
    }
}

pub struct MemoryMaintainer {
    config: RecollectConfig,
    turns: Arc<dyn TurnSource>,
    estimator: AdaptiveSizeEstimator,
    window: WindowSummarizer,
    compaction: CompactionEngine,
    planner: PromptMemoryPlanner,
}

impl MemoryMaintainer {
    pub fn new(
        config: RecollectConfig,
        cache: Arc<dyn SharedCache>,
        backend: DurableBackend,
        summarizer: Arc<dyn Summarizer>,
    ) -> Self {
        let keys = config.keys();
        let ttl = config.cache.ttl();
        let lease = LeaseLock::new(cache.clone(), &config.lease);
        let estimator = AdaptiveSizeEstimator::new(cache.clone(), keys.clone(), ttl);
        let summaries = SummaryStore::new(
            cache.clone(),
            backend.records.clone(),
            keys.clone(),
            config.cache.recent_cache_size,
            ttl,
        );

        let window = WindowSummarizer::new(
            lease.clone(),
            keys.clone(),
            cache,
            backend.records.clone(),
            backend.turns.clone(),
            summaries.clone(),
            summarizer.clone(),
            estimator.clone(),
            config.window_settings(),
        );
        let compaction = CompactionEngine::new(
            lease,
            keys,
            backend.records,
            summaries.clone(),
            summarizer,
            estimator.clone(),
            config.compaction_settings(),
        );
        let planner = PromptMemoryPlanner::new(
            TokenBudgetCalculator::new(config.model_registry()),
            estimator.clone(),
            summaries,
            config.summary.fallback_turn_tokens,
            config.summary.target_summary_tokens,
            config.compaction.soft_cap_ratio,
        );

        Self {
            config,
            turns: backend.turns,
            estimator,
            window,
            compaction,
            planner,
        }
    }

    /// Build the storage backends named in the config and summarize with the
    /// registry's `summarizer_model` provider.
    pub async fn from_config(config: RecollectConfig, registry: &LLMRegistry) -> Result<Self> {
        config.validate()?;
        let cache = create_cache(&config.storage.cache).await?;
        let backend = create_record_store(&config.storage.store).await?;
        let summarizer = LLMSummarizer::from_registry(registry, &config.summarizer_model)?;
        info!(
            model = %config.summarizer_model,
            provider = summarizer.provider_name(),
            "Memory maintainer ready"
        );
        Ok(Self::new(config, cache, backend, Arc::new(summarizer)))
    }

    pub fn config(&self) -> &RecollectConfig {
        &self.config
    }

    pub fn planner(&self) -> &PromptMemoryPlanner {
        &self.planner
    }

    /// Run after a turn has been persisted. `soft_cap` comes from the budget
    /// the turn's prompt was planned with.
    pub async fn on_turn(
        &self,
        chat_id: &str,
        who: Participants,
        soft_cap: usize,
    ) -> TurnMaintenance {
        let since_last = self.estimator.bump_since_last(chat_id).await;

        let window = self.window.run_cycle(chat_id, who).await;
        if let Err(e) = &window {
            warn!(chat_id, error = %e, "Window cycle failed");
        }

        let compaction = self.compaction.run_cycle(chat_id, soft_cap).await;
        if let Err(e) = &compaction {
            warn!(chat_id, error = %e, "Compaction cycle failed");
        }

        TurnMaintenance {
            since_last,
            window,
            compaction,
        }
    }

    /// Queue `on_turn` on the pool without waiting for it.
    pub fn schedule_turn(
        self: &Arc<Self>,
        pool: &MaintenancePool,
        chat_id: impl Into<String>,
        who: Participants,
        soft_cap: usize,
    ) -> Result<()> {
        let this = Arc::clone(self);
        let chat_id = chat_id.into();
        let result = pool.submit(async move {
            this.on_turn(&chat_id, who, soft_cap).await;
        });
        if let Err(e) = &result {
            warn!(error = %e, "Memory maintenance not scheduled");
        }
        result
    }

    /// Feed this turn's observed sizes into the moving averages: raw turns
    /// in the retrieval window, and the summaries that were injected.
    pub async fn update_estimates_after_turn(&self, chat_id: &str, injected: &[SummaryRecord]) {
        let retrieve_size = self.config.window.retrieve_size;
        let turn_avg = match self.turns.recent_turns(chat_id, retrieve_size).await {
            Ok(turns) if !turns.is_empty() => {
                let total: u64 = turns
                    .iter()
                    .map(|t| estimate_text_tokens(&t.content) as u64)
                    .sum();
                (total / turns.len() as u64) as u32
            }
            Ok(_) => self.config.summary.fallback_turn_tokens,
            Err(e) => {
                warn!(chat_id, error = %e, "Failed to read recent turns for estimates");
                self.config.summary.fallback_turn_tokens
            }
        };

        let summary_avg = if injected.is_empty() {
            self.config.summary.target_summary_tokens
        } else {
            let total: u64 = injected.iter().map(|r| r.tokens_est as u64).sum();
            (total / injected.len() as u64) as u32
        };

        self.estimator
            .update_ewma(
                chat_id,
                self.config.estimator.alpha(),
                turn_avg.max(1),
                summary_avg.max(1),
            )
            .await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use recollect_core::{Origin, RecordStore, Role};
    use recollect_llm::MockLLMProvider;
    use recollect_memory::PromptComponent;
    use recollect_storage::{InMemoryCache, InMemoryRecordStore};
    use std::sync::Once;

    static INIT: Once = Once::new();

    fn init_tracing() {
        INIT.call_once(|| {
            let _ = tracing_subscriber::fmt()
                .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
                .with_test_writer()
                .try_init();
        });
    }

    const WHO: Participants = Participants {
        user_id: 11,
        agent_id: 2,
    };

    struct Harness {
        cache: InMemoryCache,
        store: InMemoryRecordStore,
        mock: MockLLMProvider,
        maintainer: Arc<MemoryMaintainer>,
    }

    fn harness(yaml: &str) -> Harness {
        init_tracing();
        let cache = InMemoryCache::new();
        let store = InMemoryRecordStore::new();
        let mock = MockLLMProvider::new("mock");
        mock.set_fallback(r#"{"facts": ["noted"]}"#);

        let backend = DurableBackend {
            records: Arc::new(store.clone()),
            turns: Arc::new(store.clone()),
        };
        let config = RecollectConfig::from_yaml_str(yaml).unwrap();
        let maintainer = MemoryMaintainer::new(
            config,
            Arc::new(cache.clone()),
            backend,
            Arc::new(LLMSummarizer::new(Arc::new(mock.clone()))),
        );
        Harness {
            cache,
            store,
            mock,
            maintainer: Arc::new(maintainer),
        }
    }

    fn chat(h: &Harness, n: usize) {
        for i in 0..n {
            let role = if i % 2 == 0 { Role::User } else { Role::Assistant };
            h.store
                .append_turn("c", role, format!("message number {}", i));
        }
    }

    #[tokio::test]
    async fn test_turns_become_summaries_and_get_compacted() {
        let h = harness("window:\n  retrieve_size: 4\n");

        // two turns per window; each on_turn call summarizes at most one
        for _ in 0..6 {
            chat(&h, 2);
            let report = h.maintainer.on_turn("c", WHO, 100).await;
            assert!(report.is_ok());
            assert!(matches!(report.window, Ok(WindowOutcome::Committed { .. })));
        }
        assert_eq!(h.store.count_active("c").await.unwrap(), 6);
        assert_eq!(h.store.get_cursor("c").await.unwrap().unwrap().last_turn_id, 12);

        // soft cap 6: target 3, reserve 2, one merged record from the oldest 4
        h.mock.push_response(r#"[{"facts": ["merged"]}]"#);
        let report = h.maintainer.on_turn("c", WHO, 6).await;
        assert!(matches!(report.window, Ok(WindowOutcome::NotReady { .. })));
        let Ok(CompactionOutcome::Compacted {
            archived, inserted, ..
        }) = report.compaction
        else {
            panic!("expected compaction");
        };
        assert_eq!(archived, 4);
        assert_eq!(inserted.len(), 1);
        assert_eq!(inserted[0].origin, Origin::Merged);
        assert_eq!(h.store.count_active("c").await.unwrap(), 3);
    }

    #[tokio::test]
    async fn test_since_last_counts_turns_between_summaries() {
        let h = harness("window:\n  retrieve_size: 8\n");

        chat(&h, 1);
        assert_eq!(h.maintainer.on_turn("c", WHO, 100).await.since_last, 1);
        chat(&h, 1);
        assert_eq!(h.maintainer.on_turn("c", WHO, 100).await.since_last, 2);

        chat(&h, 2);
        let report = h.maintainer.on_turn("c", WHO, 100).await;
        assert_eq!(report.since_last, 3);
        assert!(matches!(report.window, Ok(WindowOutcome::Committed { .. })));

        chat(&h, 1);
        assert_eq!(h.maintainer.on_turn("c", WHO, 100).await.since_last, 1);
    }

    #[tokio::test]
    async fn test_window_failure_still_checks_compaction() {
        let h = harness("window:\n  retrieve_size: 2\n");
        chat(&h, 1);
        h.mock.push_error("provider down");

        let report = h.maintainer.on_turn("c", WHO, 100).await;
        assert!(!report.is_ok());
        assert!(report.window.is_err());
        assert!(matches!(
            report.compaction,
            Ok(CompactionOutcome::BelowCap { active: 0, .. })
        ));
    }

    #[tokio::test]
    async fn test_estimates_follow_observed_sizes() {
        let h = harness("estimator:\n  ewma_alpha: 1.0\n");
        h.store.append_turn("c", Role::User, "x".repeat(400));
        h.store.append_turn("c", Role::Assistant, "x".repeat(200));

        let injected: Vec<SummaryRecord> = Vec::new();
        h.maintainer.update_estimates_after_turn("c", &injected).await;

        let plan = h
            .maintainer
            .planner()
            .plan("c", "unknown-model", &[PromptComponent::text("hello")], 2)
            .await
            .unwrap();
        assert_eq!(plan.budget.avg_turn_tokens, 75);
        assert_eq!(plan.budget.target_summary_tokens, 300);
        assert!(h.cache.ttl("chat:lms:ewma:c").is_some());
    }

    #[tokio::test]
    async fn test_scheduled_turns_run_on_the_pool() {
        let h = harness("window:\n  retrieve_size: 2\n");
        let pool = MaintenancePool::from_config(&h.maintainer.config().workers);
        chat(&h, 3);

        for _ in 0..3 {
            h.maintainer.schedule_turn(&pool, "c", WHO, 100).unwrap();
        }
        pool.shutdown().await;

        // jobs that lost the lease race skipped; the rest summarized in order
        let records = h.store.all_records("c");
        assert!(!records.is_empty());
        let cursor = h.store.get_cursor("c").await.unwrap().unwrap();
        assert_eq!(cursor.last_turn_id, records.len() as i64);
        let ends: Vec<i64> = records.iter().filter_map(|r| r.turns_to_id).collect();
        let expected: Vec<i64> = (1..=records.len() as i64).collect();
        assert_eq!(ends, expected);
        assert_eq!(h.cache.ttl("chat:lms:lock:c"), None);
    }

    #[tokio::test]
    async fn test_from_config_uses_registry_model() {
        init_tracing();
        let mock = MockLLMProvider::new("summarizer");
        let registry = LLMRegistry::new().with_provider("qwen-summarizer", Arc::new(mock.clone()));
        let config =
            RecollectConfig::from_yaml_str("summarizer_model: qwen-summarizer\n").unwrap();

        let maintainer = MemoryMaintainer::from_config(config, &registry).await.unwrap();
        assert_eq!(maintainer.config().summarizer_model, "qwen-summarizer");

        let plan = maintainer
            .planner()
            .plan("fresh", "any", &[], 0)
            .await
            .unwrap();
        assert_eq!(plan.budget.available, 98_304);
        assert!(plan.summaries.is_empty());
    }
}
