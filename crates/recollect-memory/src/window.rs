//! Cursor-driven summarization of raw turns, one fixed-size window at a time

use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, info, warn};

use recollect_core::{
    Cursor, NewSummaryRecord, Origin, RawTurn, RecordStore, Result, SharedCache, SummaryRecord,
    TimeSpan, TurnSource,
};

use crate::estimator::AdaptiveSizeEstimator;
use crate::keys::{FIELD_LAST_TO_ID, MemoryKeys};
use crate::lease::{Lease, LeaseLock};
use crate::sanitize::{SanitizeTier, sanitize_model_output};
use crate::summarizer::Summarizer;
use crate::summary_store::SummaryStore;
use crate::tokens::clamp_record_tokens;

#[derive(Debug, Clone)]
pub struct WindowSettings {
    /// Raw turns loaded into a prompt; a window is half of it.
    pub retrieve_size: usize,
    pub lease_ttl: Duration,
    /// TTL of the stat hash that mirrors the cursor.
    pub counter_ttl: Duration,
    pub min_tokens_per_item: u32,
    pub max_tokens_per_item: u32,
}

impl WindowSettings {
    pub fn window_len(&self) -> usize {
        (self.retrieve_size / 2).max(1)
    }
}

impl Default for WindowSettings {
    fn default() -> Self {
        Self {
            retrieve_size: 40,
            lease_ttl: Duration::from_secs(60),
            counter_ttl: Duration::from_secs(604_800),
            min_tokens_per_item: 120,
            max_tokens_per_item: 400,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum WindowOutcome {
    /// Fewer than a full window of turns after the cursor.
    NotReady { pending: usize, window_len: usize },
    /// Another worker holds the conversation's lease.
    Contended,
    Committed {
        record: SummaryRecord,
        cursor: Cursor,
        tier: SanitizeTier,
    },
}

/// Who a conversation's summaries belong to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Participants {
    pub user_id: i64,
    pub agent_id: i64,
}

/// Turns raw conversation history into RAW summary records.
///
/// Each committed cycle covers exactly `window_len` turns strictly after the
/// cursor, in ascending id order, and advances the cursor to the last of
/// them. The record insert and cursor advance are one durable commit.
pub struct WindowSummarizer {
    lease: LeaseLock,
    keys: MemoryKeys,
    cache: Arc<dyn SharedCache>,
    records: Arc<dyn RecordStore>,
    turns: Arc<dyn TurnSource>,
    summaries: SummaryStore,
    summarizer: Arc<dyn Summarizer>,
    estimator: AdaptiveSizeEstimator,
    settings: WindowSettings,
}

impl WindowSummarizer {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        lease: LeaseLock,
        keys: MemoryKeys,
        cache: Arc<dyn SharedCache>,
        records: Arc<dyn RecordStore>,
        turns: Arc<dyn TurnSource>,
        summaries: SummaryStore,
        summarizer: Arc<dyn Summarizer>,
        estimator: AdaptiveSizeEstimator,
        settings: WindowSettings,
    ) -> Self {
        Self {
            lease,
            keys,
            cache,
            records,
            turns,
            summaries,
            summarizer,
            estimator,
            settings,
        }
    }

    pub fn settings(&self) -> &WindowSettings {
        &self.settings
    }

    /// Summarize the next window if a full one is available.
    pub async fn run_cycle(&self, chat_id: &str, who: Participants) -> Result<WindowOutcome> {
        let window_len = self.settings.window_len();
        let last_to_id = self.cached_cursor(chat_id).await?;

        let pending = self
            .turns
            .turns_after(chat_id, last_to_id, window_len)
            .await?;
        if pending.len() < window_len {
            self.touch_stat(chat_id).await;
            debug!(chat_id, pending = pending.len(), window_len, "Window not ready");
            return Ok(WindowOutcome::NotReady {
                pending: pending.len(),
                window_len,
            });
        }

        let Some(lease) = self
            .lease
            .try_acquire(&self.keys.lease(chat_id), self.settings.lease_ttl)
            .await?
        else {
            debug!(chat_id, "Window cycle skipped, lease held elsewhere");
            return Ok(WindowOutcome::Contended);
        };
        lease.start_watchdog();

        let result = self.summarize_locked(chat_id, who, window_len, &lease).await;
        if !lease.release().await {
            warn!(chat_id, "Window cycle finished without holding the lease");
        }
        result
    }

    async fn summarize_locked(
        &self,
        chat_id: &str,
        who: Participants,
        window_len: usize,
        lease: &Lease,
    ) -> Result<WindowOutcome> {
        // the unlocked read may be stale; the durable cursor decides
        let durable_last = self
            .records
            .get_cursor(chat_id)
            .await?
            .map(|c| c.last_turn_id)
            .unwrap_or(0);
        let window = self
            .turns
            .turns_after(chat_id, durable_last, window_len)
            .await?;
        if window.len() < window_len {
            self.cache_cursor(chat_id, durable_last).await;
            debug!(chat_id, pending = window.len(), "Window already taken by another worker");
            return Ok(WindowOutcome::NotReady {
                pending: window.len(),
                window_len,
            });
        }

        let raw = self.summarizer.summarize(&window).await?;
        if !lease.renew_now().await {
            warn!(chat_id, "Lease lost while summarizing, another worker may overlap");
        }
        let sanitized = sanitize_model_output(&raw);
        if sanitized.tier != SanitizeTier::Clean {
            warn!(chat_id, tier = ?sanitized.tier, "Summary output needed sanitizing");
        }

        let (record, cursor) = self.build_record(chat_id, who, &window, sanitized.value)?;
        let stored = self.records.commit_window(record, cursor).await?;

        self.cache_cursor(chat_id, cursor.last_turn_id).await;
        if let Err(e) = self.summaries.push_recent(&stored).await {
            warn!(chat_id, error = %e, "Failed to push summary into recent cache");
            let _ = self.summaries.invalidate(chat_id).await;
        }
        self.estimator.reset_since_last(chat_id).await;

        info!(
            chat_id,
            record_id = stored.id,
            from_turn = ?stored.turns_from_id,
            to_turn = cursor.last_turn_id,
            tokens = stored.tokens_est,
            "Window summarized"
        );
        Ok(WindowOutcome::Committed {
            record: stored,
            cursor,
            tier: sanitized.tier,
        })
    }

    fn build_record(
        &self,
        chat_id: &str,
        who: Participants,
        window: &[RawTurn],
        content: serde_json::Value,
    ) -> Result<(NewSummaryRecord, Cursor)> {
        let (Some(first), Some(last)) = (window.first(), window.last()) else {
            return Err(recollect_core::MemoryError::Other(
                "empty window cannot be summarized".into(),
            ));
        };
        let json = serde_json::to_string(&content)?;
        let tokens_est = clamp_record_tokens(
            &json,
            self.settings.min_tokens_per_item,
            self.settings.max_tokens_per_item,
        );

        let record = NewSummaryRecord {
            chat_id: chat_id.to_string(),
            user_id: who.user_id,
            agent_id: who.agent_id,
            window: Some(TimeSpan::new(first.created_at_ms(), last.created_at_ms())),
            turns_from_id: Some(first.id),
            turns_to_id: Some(last.id),
            tokens_est,
            content,
            origin: Origin::Raw,
        };
        let cursor = Cursor {
            last_turn_id: last.id,
            last_turn_ts: last.created_at_ms(),
            window_len: window.len(),
        };
        Ok((record, cursor))
    }

    /// Cursor from the stat hash, else from the durable store (then cached).
    async fn cached_cursor(&self, chat_id: &str) -> Result<i64> {
        let stat_key = self.keys.stat(chat_id);
        match self.cache.hash_get(&stat_key, FIELD_LAST_TO_ID).await {
            Ok(Some(raw)) => match raw.parse::<i64>() {
                Ok(id) => return Ok(id),
                Err(_) => warn!(chat_id, value = %raw, "Unreadable cached cursor"),
            },
            Ok(None) => {}
            Err(e) => warn!(chat_id, error = %e, "Cursor cache read failed"),
        }

        let last = self
            .records
            .get_cursor(chat_id)
            .await?
            .map(|c| c.last_turn_id)
            .unwrap_or(0);
        self.cache_cursor(chat_id, last).await;
        Ok(last)
    }

    async fn cache_cursor(&self, chat_id: &str, last_to_id: i64) {
        let stat_key = self.keys.stat(chat_id);
        let result = match self
            .cache
            .hash_set(&stat_key, FIELD_LAST_TO_ID, &last_to_id.to_string())
            .await
        {
            Ok(()) => self.cache.expire(&stat_key, self.settings.counter_ttl).await,
            Err(e) => Err(e),
        };
        if let Err(e) = result {
            warn!(chat_id, error = %e, "Failed to cache cursor, dropping stat entry");
            let _ = self.cache.delete(&stat_key).await;
        }
    }

    async fn touch_stat(&self, chat_id: &str) {
        let stat_key = self.keys.stat(chat_id);
        if let Err(e) = self
            .cache
            .expire(&stat_key, self.settings.counter_ttl)
            .await
        {
            debug!(chat_id, error = %e, "Failed to refresh stat TTL");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lease::LeaseConfig;
    use crate::summarizer::LLMSummarizer;
    use async_trait::async_trait;
    use recollect_core::Role;
    use recollect_llm::MockLLMProvider;
    use recollect_storage::{InMemoryCache, InMemoryRecordStore};

    const WHO: Participants = Participants {
        user_id: 7,
        agent_id: 3,
    };

    struct Harness {
        cache: InMemoryCache,
        store: InMemoryRecordStore,
        mock: MockLLMProvider,
        window: WindowSummarizer,
    }

    fn harness(retrieve_size: usize) -> Harness {
        harness_with(retrieve_size, |_, mock| {
            Arc::new(LLMSummarizer::new(Arc::new(mock.clone())))
        })
    }

    fn harness_with(
        retrieve_size: usize,
        summarizer: impl FnOnce(&InMemoryCache, &MockLLMProvider) -> Arc<dyn Summarizer>,
    ) -> Harness {
        let cache = InMemoryCache::new();
        let store = InMemoryRecordStore::new();
        let mock = MockLLMProvider::new("mock");
        mock.set_fallback(r#"{"facts":["summary"],"time_span":{"from":1,"to":2}}"#);
        let summarizer = summarizer(&cache, &mock);

        let shared: Arc<dyn SharedCache> = Arc::new(cache.clone());
        let keys = MemoryKeys::default();
        let ttl = Duration::from_secs(600);
        let summaries = SummaryStore::new(
            shared.clone(),
            Arc::new(store.clone()),
            keys.clone(),
            50,
            ttl,
        );
        let window = WindowSummarizer::new(
            LeaseLock::new(shared.clone(), &LeaseConfig::default()),
            keys.clone(),
            shared.clone(),
            Arc::new(store.clone()),
            Arc::new(store.clone()),
            summaries,
            summarizer,
            AdaptiveSizeEstimator::new(shared, keys, ttl),
            WindowSettings {
                retrieve_size,
                ..WindowSettings::default()
            },
        );
        Harness {
            cache,
            store,
            mock,
            window,
        }
    }

    /// Another worker takes the lease over while the summary is generated.
    struct LeaseStealingSummarizer {
        cache: InMemoryCache,
    }

    #[async_trait]
    impl Summarizer for LeaseStealingSummarizer {
        async fn summarize(&self, _turns: &[RawTurn]) -> Result<String> {
            self.cache.delete("chat:lms:lock:c").await?;
            self.cache
                .set_if_absent("chat:lms:lock:c", "intruder", Duration::from_secs(30))
                .await?;
            Ok(r#"{"facts":["late"]}"#.to_string())
        }

        async fn merge_summaries(&self, _summaries: &[String], _target: usize) -> Result<String> {
            Ok("[]".to_string())
        }
    }

    fn add_turns(store: &InMemoryRecordStore, n: usize) {
        for i in 0..n {
            let role = if i % 2 == 0 { Role::User } else { Role::Assistant };
            store.append_turn("c", role, format!("turn {}", i));
        }
    }

    #[tokio::test]
    async fn test_not_ready_is_a_no_op() {
        let h = harness(8);
        add_turns(&h.store, 3);

        let outcome = h.window.run_cycle("c", WHO).await.unwrap();
        assert_eq!(
            outcome,
            WindowOutcome::NotReady {
                pending: 3,
                window_len: 4
            }
        );
        assert!(h.store.all_records("c").is_empty());
        assert_eq!(h.store.get_cursor("c").await.unwrap(), None);
        assert_eq!(h.mock.call_count(), 0);
        // the cursor read is cached even when nothing happens
        assert_eq!(
            h.cache.hash_get("chat:lms:stat:c", "last_to_id").await.unwrap(),
            Some("0".to_string())
        );
    }

    #[tokio::test]
    async fn test_commit_advances_cursor_window_by_window() {
        let h = harness(4);
        add_turns(&h.store, 3);

        let WindowOutcome::Committed { record, cursor, tier } =
            h.window.run_cycle("c", WHO).await.unwrap()
        else {
            panic!("expected a committed window");
        };
        assert_eq!(tier, SanitizeTier::Clean);
        assert_eq!(record.origin, Origin::Raw);
        assert_eq!((record.turns_from_id, record.turns_to_id), (Some(1), Some(2)));
        assert_eq!((record.user_id, record.agent_id), (7, 3));
        assert_eq!(cursor.last_turn_id, 2);
        assert_eq!(cursor.window_len, 2);
        assert_eq!(record.tokens_est, 120);
        assert_eq!(h.store.get_cursor("c").await.unwrap(), Some(cursor));

        let turns = h.store.turns_after("c", 0, 2).await.unwrap();
        let span = record.window.unwrap();
        assert_eq!(span.from_ts, turns[0].created_at_ms());
        assert_eq!(span.to_ts, turns[1].created_at_ms());

        // one leftover turn is not enough
        assert!(matches!(
            h.window.run_cycle("c", WHO).await.unwrap(),
            WindowOutcome::NotReady { pending: 1, .. }
        ));

        add_turns(&h.store, 1);
        let WindowOutcome::Committed { cursor: next, .. } =
            h.window.run_cycle("c", WHO).await.unwrap()
        else {
            panic!("expected a second committed window");
        };
        assert_eq!(next.last_turn_id, 4);
        assert_eq!(h.mock.call_count(), 2);

        let head = h.cache.list_range("chat:lms:c", 0, 0).await.unwrap();
        let head: SummaryRecord = serde_json::from_str(&head[0]).unwrap();
        assert_eq!(head.turns_to_id, Some(4));
        assert_eq!(h.cache.ttl("chat:lms:lock:c"), None);
    }

    #[tokio::test]
    async fn test_contended_cycle_writes_nothing() {
        let h = harness(4);
        add_turns(&h.store, 2);
        h.cache
            .set_if_absent("chat:lms:lock:c", "other-worker", Duration::from_secs(30))
            .await
            .unwrap();

        assert_eq!(
            h.window.run_cycle("c", WHO).await.unwrap(),
            WindowOutcome::Contended
        );
        assert!(h.store.all_records("c").is_empty());
        assert_eq!(h.mock.call_count(), 0);
    }

    #[tokio::test]
    async fn test_stale_cached_cursor_is_rechecked_under_lease() {
        let h = harness(4);
        add_turns(&h.store, 3);
        h.store
            .upsert_cursor(
                "c",
                Cursor {
                    last_turn_id: 2,
                    last_turn_ts: 0,
                    window_len: 2,
                },
            )
            .await
            .unwrap();
        h.cache
            .hash_set("chat:lms:stat:c", "last_to_id", "0")
            .await
            .unwrap();

        let outcome = h.window.run_cycle("c", WHO).await.unwrap();
        assert!(matches!(outcome, WindowOutcome::NotReady { pending: 1, .. }));
        assert_eq!(h.mock.call_count(), 0);
        assert_eq!(
            h.cache.hash_get("chat:lms:stat:c", "last_to_id").await.unwrap(),
            Some("2".to_string())
        );
    }

    #[tokio::test]
    async fn test_prose_output_is_wrapped() {
        let h = harness(2);
        add_turns(&h.store, 1);
        h.mock.push_response("The customer asked about shipping times.");

        let WindowOutcome::Committed { record, tier, .. } =
            h.window.run_cycle("c", WHO).await.unwrap()
        else {
            panic!("expected a committed window");
        };
        assert_eq!(tier, SanitizeTier::Wrapped);
        assert_eq!(
            record.content["raw_text"],
            "The customer asked about shipping times."
        );
    }

    #[tokio::test]
    async fn test_generation_failure_leaves_cursor_and_lease_clean() {
        let h = harness(2);
        add_turns(&h.store, 1);
        h.mock.push_error("model overloaded");

        let err = h.window.run_cycle("c", WHO).await.unwrap_err();
        assert!(matches!(err, recollect_core::MemoryError::Generation(_)));
        assert_eq!(h.store.get_cursor("c").await.unwrap(), None);
        assert!(h.store.all_records("c").is_empty());
        assert_eq!(h.cache.ttl("chat:lms:lock:c"), None);

        assert!(matches!(
            h.window.run_cycle("c", WHO).await.unwrap(),
            WindowOutcome::Committed { .. }
        ));
    }

    #[tokio::test]
    async fn test_commit_resets_since_last_counter() {
        let h = harness(2);
        add_turns(&h.store, 1);
        h.cache
            .hash_incr("chat:lms:stat:c", "c_since_last_lms", 5)
            .await
            .unwrap();

        h.window.run_cycle("c", WHO).await.unwrap();
        assert_eq!(
            h.cache
                .hash_get("chat:lms:stat:c", "c_since_last_lms")
                .await
                .unwrap(),
            Some("0".to_string())
        );
    }

    #[tokio::test]
    async fn test_lease_lost_mid_summary_still_commits() {
        let h = harness_with(2, |cache, _| {
            Arc::new(LeaseStealingSummarizer {
                cache: cache.clone(),
            })
        });
        add_turns(&h.store, 2);

        let WindowOutcome::Committed { record, cursor, .. } =
            h.window.run_cycle("c", WHO).await.unwrap()
        else {
            panic!("expected a committed window");
        };
        assert_eq!(record.content["facts"][0], "late");
        assert_eq!(cursor.last_turn_id, 1);
        assert_eq!(h.store.get_cursor("c").await.unwrap(), Some(cursor));

        assert!(h
            .cache
            .compare_and_delete("chat:lms:lock:c", "intruder")
            .await
            .unwrap());
    }
}
