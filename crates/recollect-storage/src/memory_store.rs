//! Process-local durable store, for tests and single-instance deployments

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::RwLock;

use recollect_core::{
    Cursor, Lifecycle, NewSummaryRecord, RawTurn, RecordStore, Result, Role, SummaryRecord,
    TurnSource,
};

#[derive(Clone, Default)]
pub struct InMemoryRecordStore {
    inner: Arc<RwLock<Inner>>,
}

#[derive(Default)]
struct Inner {
    records: Vec<SummaryRecord>,
    cursors: HashMap<String, Cursor>,
    turns: Vec<RawTurn>,
    next_record_id: i64,
    next_turn_id: i64,
}

fn age_key(r: &SummaryRecord) -> (i64, i64) {
    (r.effective_to_ms(), r.id)
}

impl InMemoryRecordStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a raw turn stamped with the current time.
    pub fn append_turn(&self, chat_id: &str, role: Role, content: impl Into<String>) -> RawTurn {
        self.append_turn_at(chat_id, role, content, Utc::now())
    }

    pub fn append_turn_at(
        &self,
        chat_id: &str,
        role: Role,
        content: impl Into<String>,
        created_at: DateTime<Utc>,
    ) -> RawTurn {
        let mut inner = self.inner.write();
        inner.next_turn_id += 1;
        let turn = RawTurn {
            id: inner.next_turn_id,
            chat_id: chat_id.to_string(),
            role,
            content: content.into(),
            created_at,
        };
        inner.turns.push(turn.clone());
        turn
    }

    /// Every record of a conversation, archived ones included, in id order.
    pub fn all_records(&self, chat_id: &str) -> Vec<SummaryRecord> {
        self.inner
            .read()
            .records
            .iter()
            .filter(|r| r.chat_id == chat_id)
            .cloned()
            .collect()
    }

    fn active_sorted(&self, chat_id: &str) -> Vec<SummaryRecord> {
        let inner = self.inner.read();
        let mut active: Vec<SummaryRecord> = inner
            .records
            .iter()
            .filter(|r| r.chat_id == chat_id && r.is_active())
            .cloned()
            .collect();
        active.sort_by_key(age_key);
        active
    }
}

#[async_trait]
impl RecordStore for InMemoryRecordStore {
    async fn insert_summary(&self, record: NewSummaryRecord) -> Result<SummaryRecord> {
        let mut inner = self.inner.write();
        inner.next_record_id += 1;
        let stored = record.into_record(inner.next_record_id, Utc::now());
        inner.records.push(stored.clone());
        Ok(stored)
    }

    async fn count_active(&self, chat_id: &str) -> Result<usize> {
        Ok(self
            .inner
            .read()
            .records
            .iter()
            .filter(|r| r.chat_id == chat_id && r.is_active())
            .count())
    }

    async fn select_oldest_active(
        &self,
        chat_id: &str,
        limit: usize,
    ) -> Result<Vec<SummaryRecord>> {
        let mut active = self.active_sorted(chat_id);
        active.truncate(limit);
        Ok(active)
    }

    async fn select_newest_active(
        &self,
        chat_id: &str,
        limit: usize,
    ) -> Result<Vec<SummaryRecord>> {
        let mut active = self.active_sorted(chat_id);
        active.reverse();
        active.truncate(limit);
        Ok(active)
    }

    async fn mark_archived(&self, ids: &[i64]) -> Result<usize> {
        let mut inner = self.inner.write();
        let mut changed = 0;
        for record in inner.records.iter_mut() {
            if record.is_active() && ids.contains(&record.id) {
                record.lifecycle = Lifecycle::Archived;
                changed += 1;
            }
        }
        Ok(changed)
    }

    async fn get_cursor(&self, chat_id: &str) -> Result<Option<Cursor>> {
        Ok(self.inner.read().cursors.get(chat_id).copied())
    }

    async fn upsert_cursor(&self, chat_id: &str, cursor: Cursor) -> Result<()> {
        let mut inner = self.inner.write();
        match inner.cursors.get(chat_id) {
            Some(existing) if existing.last_turn_id > cursor.last_turn_id => {}
            _ => {
                inner.cursors.insert(chat_id.to_string(), cursor);
            }
        }
        Ok(())
    }

    async fn commit_window(
        &self,
        record: NewSummaryRecord,
        cursor: Cursor,
    ) -> Result<SummaryRecord> {
        let mut inner = self.inner.write();
        inner.next_record_id += 1;
        let chat_id = record.chat_id.clone();
        let stored = record.into_record(inner.next_record_id, Utc::now());
        inner.records.push(stored.clone());
        match inner.cursors.get(&chat_id) {
            Some(existing) if existing.last_turn_id > cursor.last_turn_id => {}
            _ => {
                inner.cursors.insert(chat_id, cursor);
            }
        }
        Ok(stored)
    }
}

#[async_trait]
impl TurnSource for InMemoryRecordStore {
    async fn turns_after(
        &self,
        chat_id: &str,
        after_id: i64,
        limit: usize,
    ) -> Result<Vec<RawTurn>> {
        Ok(self
            .inner
            .read()
            .turns
            .iter()
            .filter(|t| t.chat_id == chat_id && t.id > after_id)
            .take(limit)
            .cloned()
            .collect())
    }

    async fn recent_turns(&self, chat_id: &str, limit: usize) -> Result<Vec<RawTurn>> {
        let inner = self.inner.read();
        let matching: Vec<&RawTurn> = inner.turns.iter().filter(|t| t.chat_id == chat_id).collect();
        let start = matching.len().saturating_sub(limit);
        Ok(matching[start..].iter().map(|t| (*t).clone()).collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use recollect_core::{Origin, TimeSpan};

    fn new_record(chat_id: &str, to_ts: i64) -> NewSummaryRecord {
        NewSummaryRecord {
            chat_id: chat_id.to_string(),
            user_id: 1,
            agent_id: 1,
            window: Some(TimeSpan::new(to_ts - 10, to_ts)),
            turns_from_id: None,
            turns_to_id: None,
            tokens_est: 150,
            content: serde_json::json!({"facts": [to_ts]}),
            origin: Origin::Raw,
        }
    }

    #[tokio::test]
    async fn test_age_ordering_and_archival() {
        let store = InMemoryRecordStore::new();
        let late = store.insert_summary(new_record("c", 3_000)).await.unwrap();
        let early = store.insert_summary(new_record("c", 1_000)).await.unwrap();
        let mid = store.insert_summary(new_record("c", 2_000)).await.unwrap();
        store.insert_summary(new_record("other", 500)).await.unwrap();

        let oldest = store.select_oldest_active("c", 2).await.unwrap();
        assert_eq!(
            oldest.iter().map(|r| r.id).collect::<Vec<_>>(),
            vec![early.id, mid.id]
        );
        let newest = store.select_newest_active("c", 10).await.unwrap();
        assert_eq!(newest[0].id, late.id);

        assert_eq!(store.mark_archived(&[early.id, mid.id]).await.unwrap(), 2);
        assert_eq!(store.mark_archived(&[early.id]).await.unwrap(), 0);
        assert_eq!(store.count_active("c").await.unwrap(), 1);
        assert_eq!(store.all_records("c").len(), 3);
    }

    #[tokio::test]
    async fn test_cursor_never_moves_backwards() {
        let store = InMemoryRecordStore::new();
        let cursor = |id| Cursor {
            last_turn_id: id,
            last_turn_ts: id * 10,
            window_len: 5,
        };
        store.upsert_cursor("c", cursor(10)).await.unwrap();
        store.upsert_cursor("c", cursor(4)).await.unwrap();
        assert_eq!(store.get_cursor("c").await.unwrap().unwrap().last_turn_id, 10);
        store.upsert_cursor("c", cursor(12)).await.unwrap();
        assert_eq!(store.get_cursor("c").await.unwrap().unwrap().last_turn_id, 12);
    }

    #[tokio::test]
    async fn test_turns_after_and_recent() {
        let store = InMemoryRecordStore::new();
        for i in 0..6 {
            store.append_turn("c", Role::User, format!("m{}", i));
            store.append_turn("other", Role::User, "noise");
        }
        let after = store.turns_after("c", 3, 2).await.unwrap();
        assert_eq!(after.len(), 2);
        assert!(after[0].id > 3 && after[0].id < after[1].id);

        let recent = store.recent_turns("c", 2).await.unwrap();
        assert_eq!(
            recent.iter().map(|t| t.content.as_str()).collect::<Vec<_>>(),
            vec!["m4", "m5"]
        );
    }
}
