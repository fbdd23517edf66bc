//! Durable store traits

use async_trait::async_trait;

use crate::error::Result;
use crate::message::RawTurn;
use crate::record::{Cursor, NewSummaryRecord, SummaryRecord};

/// Durable store for summary records and summarization cursors.
///
/// This is the source of truth. Records are append-only apart from the
/// `Active -> Archived` lifecycle flip.
///
/// "Age" ordering is by the end of the covered window (creation time when the
/// window is unknown), with the record id as tie-breaker.
///
/// Built-in backends: `InMemoryRecordStore` and `SqliteRecordStore`.
#[async_trait]
pub trait RecordStore: Send + Sync {
    async fn insert_summary(&self, record: NewSummaryRecord) -> Result<SummaryRecord>;

    async fn count_active(&self, chat_id: &str) -> Result<usize>;

    /// Oldest active records first.
    async fn select_oldest_active(&self, chat_id: &str, limit: usize)
    -> Result<Vec<SummaryRecord>>;

    /// Newest active records first.
    async fn select_newest_active(&self, chat_id: &str, limit: usize)
    -> Result<Vec<SummaryRecord>>;

    /// Flip the given records to `Archived`. Already archived ids are ignored.
    /// Returns the number of records that changed state.
    async fn mark_archived(&self, ids: &[i64]) -> Result<usize>;

    async fn get_cursor(&self, chat_id: &str) -> Result<Option<Cursor>>;

    /// Insert or advance the cursor. A cursor never moves backwards: an
    /// upsert with a smaller `last_turn_id` than the stored one is a no-op.
    async fn upsert_cursor(&self, chat_id: &str, cursor: Cursor) -> Result<()>;

    /// Insert a window summary and advance the cursor as one logical step.
    ///
    /// Backends with transactions override this so a crash cannot leave a
    /// record without its cursor advance.
    async fn commit_window(
        &self,
        record: NewSummaryRecord,
        cursor: Cursor,
    ) -> Result<SummaryRecord> {
        let chat_id = record.chat_id.clone();
        let inserted = self.insert_summary(record).await?;
        self.upsert_cursor(&chat_id, cursor).await?;
        Ok(inserted)
    }
}

/// Read access to raw conversation turns, ordered by id.
#[async_trait]
pub trait TurnSource: Send + Sync {
    /// Turns with `id > after_id`, ascending, at most `limit`.
    async fn turns_after(&self, chat_id: &str, after_id: i64, limit: usize)
    -> Result<Vec<RawTurn>>;

    /// The latest `limit` turns, returned in ascending id order.
    async fn recent_turns(&self, chat_id: &str, limit: usize) -> Result<Vec<RawTurn>>;
}
