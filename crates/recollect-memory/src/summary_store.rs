//! Read-through cache of the newest active summaries per conversation

use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, warn};

use recollect_core::{RecordStore, Result, SharedCache, SummaryRecord};

use crate::keys::MemoryKeys;

/// Cache-aside view over the durable store.
///
/// The cached list holds serialized records, newest first, trimmed to
/// `capacity`. It is never authoritative: a miss or an unreadable entry falls
/// through to the durable store and the list is rebuilt from there.
#[derive(Clone)]
pub struct SummaryStore {
    cache: Arc<dyn SharedCache>,
    records: Arc<dyn RecordStore>,
    keys: MemoryKeys,
    capacity: usize,
    ttl: Duration,
}

impl SummaryStore {
    pub fn new(
        cache: Arc<dyn SharedCache>,
        records: Arc<dyn RecordStore>,
        keys: MemoryKeys,
        capacity: usize,
        ttl: Duration,
    ) -> Self {
        Self {
            cache,
            records,
            keys,
            capacity: capacity.max(1),
            ttl,
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Up to `limit` active summaries, most recent first.
    pub async fn fetch_recent(&self, chat_id: &str, limit: usize) -> Result<Vec<SummaryRecord>> {
        if limit == 0 {
            return Ok(Vec::new());
        }

        let key = self.keys.recent(chat_id);
        if let Some(hit) = self.read_cached(&key, limit).await {
            return Ok(hit);
        }

        debug!(chat_id, limit, "Recent summaries cache miss");
        let mut recent = self
            .records
            .select_newest_active(chat_id, limit.max(self.capacity))
            .await?;
        if !recent.is_empty() {
            if let Err(e) = self.write_list(&key, &recent).await {
                warn!(chat_id, error = %e, "Failed to backfill recent summaries cache");
            }
        }
        recent.truncate(limit);
        Ok(recent)
    }

    async fn read_cached(&self, key: &str, limit: usize) -> Option<Vec<SummaryRecord>> {
        let stop = isize::try_from(limit).unwrap_or(isize::MAX) - 1;
        let raw = match self.cache.list_range(key, 0, stop).await {
            Ok(raw) => raw,
            Err(e) => {
                warn!(key, error = %e, "Recent summaries cache read failed");
                return None;
            }
        };
        if raw.is_empty() {
            return None;
        }

        let mut parsed = Vec::with_capacity(raw.len());
        for entry in &raw {
            match serde_json::from_str::<SummaryRecord>(entry) {
                Ok(record) => parsed.push(record),
                Err(e) => {
                    warn!(key, error = %e, "Unreadable cached summary, falling back to store");
                    return None;
                }
            }
        }
        Some(parsed)
    }

    /// Put a freshly inserted record at the head of the cached list.
    ///
    /// When the list is absent (expired or flushed) it is rebuilt from the
    /// store instead, so the cache never holds a lone head without history.
    pub async fn push_recent(&self, record: &SummaryRecord) -> Result<()> {
        let key = self.keys.recent(&record.chat_id);
        if self.cache.list_range(&key, 0, 0).await?.is_empty() {
            self.rebuild(&record.chat_id).await?;
            return Ok(());
        }

        let json = serde_json::to_string(record)?;
        self.cache.list_push_front(&key, &json).await?;
        self.cache
            .list_trim(&key, 0, self.capacity as isize - 1)
            .await?;
        self.cache.expire(&key, self.ttl).await
    }

    /// Drop the cached list and reload it from the newest active records.
    /// Returns how many records were cached.
    pub async fn rebuild(&self, chat_id: &str) -> Result<usize> {
        let key = self.keys.recent(chat_id);
        self.cache.delete(&key).await?;
        let recent = self
            .records
            .select_newest_active(chat_id, self.capacity)
            .await?;
        self.write_list(&key, &recent).await?;
        Ok(recent.len())
    }

    pub async fn invalidate(&self, chat_id: &str) -> Result<()> {
        self.cache.delete(&self.keys.recent(chat_id)).await
    }

    async fn write_list(&self, key: &str, newest_first: &[SummaryRecord]) -> Result<()> {
        if newest_first.is_empty() {
            return Ok(());
        }
        let values = newest_first
            .iter()
            .map(serde_json::to_string)
            .collect::<std::result::Result<Vec<_>, _>>()?;

        self.cache.delete(key).await?;
        self.cache.list_push_back(key, &values).await?;
        self.cache
            .list_trim(key, 0, self.capacity as isize - 1)
            .await?;
        self.cache.expire(key, self.ttl).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use recollect_core::{NewSummaryRecord, Origin, TimeSpan};
    use recollect_storage::{InMemoryCache, InMemoryRecordStore};

    fn record(chat_id: &str, to_ts: i64) -> NewSummaryRecord {
        NewSummaryRecord {
            chat_id: chat_id.to_string(),
            user_id: 1,
            agent_id: 2,
            window: Some(TimeSpan::new(to_ts - 5, to_ts)),
            turns_from_id: None,
            turns_to_id: None,
            tokens_est: 120,
            content: serde_json::json!({"facts": [to_ts]}),
            origin: Origin::Raw,
        }
    }

    fn setup(capacity: usize) -> (InMemoryCache, InMemoryRecordStore, SummaryStore) {
        let cache = InMemoryCache::new();
        let store = InMemoryRecordStore::new();
        let summaries = SummaryStore::new(
            Arc::new(cache.clone()),
            Arc::new(store.clone()),
            MemoryKeys::default(),
            capacity,
            Duration::from_secs(600),
        );
        (cache, store, summaries)
    }

    fn ids(records: &[SummaryRecord]) -> Vec<i64> {
        records.iter().map(|r| r.id).collect()
    }

    #[tokio::test]
    async fn test_miss_backfills_newest_first() {
        let (cache, store, summaries) = setup(10);
        let a = store.insert_summary(record("c", 100)).await.unwrap();
        let b = store.insert_summary(record("c", 200)).await.unwrap();
        let c = store.insert_summary(record("c", 300)).await.unwrap();

        let first = summaries.fetch_recent("c", 2).await.unwrap();
        assert_eq!(ids(&first), vec![c.id, b.id]);
        assert_eq!(cache.list_range("chat:lms:c", 0, -1).await.unwrap().len(), 3);

        // served from cache now, even though the store changed underneath
        store.mark_archived(&[c.id]).await.unwrap();
        let cached = summaries.fetch_recent("c", 5).await.unwrap();
        assert_eq!(ids(&cached), vec![c.id, b.id, a.id]);
    }

    #[tokio::test]
    async fn test_unbounded_limit_reads_whole_list() {
        let (_cache, store, summaries) = setup(10);
        for ts in [100, 200, 300] {
            store.insert_summary(record("c", ts)).await.unwrap();
        }

        assert_eq!(summaries.fetch_recent("c", usize::MAX).await.unwrap().len(), 3);
        // second read is a cache hit
        assert_eq!(summaries.fetch_recent("c", usize::MAX).await.unwrap().len(), 3);
    }

    #[tokio::test]
    async fn test_push_recent_and_trim() {
        let (_cache, store, summaries) = setup(2);
        let a = store.insert_summary(record("c", 100)).await.unwrap();
        summaries.fetch_recent("c", 2).await.unwrap();

        let b = store.insert_summary(record("c", 200)).await.unwrap();
        summaries.push_recent(&b).await.unwrap();
        let c = store.insert_summary(record("c", 300)).await.unwrap();
        summaries.push_recent(&c).await.unwrap();

        let recent = summaries.fetch_recent("c", 10).await.unwrap();
        assert_eq!(ids(&recent), vec![c.id, b.id]);
        assert!(!ids(&recent).contains(&a.id));
    }

    #[tokio::test]
    async fn test_push_into_missing_list_rebuilds_history() {
        let (cache, store, summaries) = setup(10);
        store.insert_summary(record("c", 100)).await.unwrap();
        store.insert_summary(record("c", 200)).await.unwrap();
        let newest = store.insert_summary(record("c", 300)).await.unwrap();

        summaries.push_recent(&newest).await.unwrap();
        assert_eq!(cache.list_range("chat:lms:c", 0, -1).await.unwrap().len(), 3);
    }

    #[tokio::test]
    async fn test_corrupt_cache_entry_is_a_miss() {
        let (cache, store, summaries) = setup(10);
        let a = store.insert_summary(record("c", 100)).await.unwrap();
        cache.list_push_front("chat:lms:c", "not json").await.unwrap();

        let recent = summaries.fetch_recent("c", 5).await.unwrap();
        assert_eq!(ids(&recent), vec![a.id]);
    }

    #[tokio::test]
    async fn test_rebuild_excludes_archived() {
        let (_cache, store, summaries) = setup(10);
        let a = store.insert_summary(record("c", 100)).await.unwrap();
        let b = store.insert_summary(record("c", 200)).await.unwrap();
        summaries.fetch_recent("c", 5).await.unwrap();

        store.mark_archived(&[a.id]).await.unwrap();
        assert_eq!(summaries.rebuild("c").await.unwrap(), 1);
        assert_eq!(ids(&summaries.fetch_recent("c", 5).await.unwrap()), vec![b.id]);
    }

    #[tokio::test]
    async fn test_empty_conversation() {
        let (cache, _store, summaries) = setup(10);
        assert!(summaries.fetch_recent("none", 5).await.unwrap().is_empty());
        assert!(summaries.fetch_recent("none", 0).await.unwrap().is_empty());
        assert!(cache.is_empty());
    }
}
