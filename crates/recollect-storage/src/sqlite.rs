//! SQLite durable store for summary records, cursors and raw turns

use std::str::FromStr;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions};
use sqlx::{Sqlite, SqlitePool};

use recollect_core::{
    Cursor, Lifecycle, MemoryError, NewSummaryRecord, Origin, RawTurn, RecordStore, Result, Role,
    SummaryRecord, TimeSpan, TurnSource,
};

/// Age ordering key: window end, or creation time when the window is unknown.
const AGE_EXPR: &str =
    "CASE WHEN window_to_ts > 0 THEN window_to_ts ELSE created_at_ms END";

const RECORD_COLUMNS: &str = "id, chat_id, user_id, agent_id, window_from_ts, window_to_ts, \
     turns_from_id, turns_to_id, tokens_est, content, origin, lifecycle, created_at_ms";

type RecordRow = (
    i64,
    String,
    i64,
    i64,
    Option<i64>,
    Option<i64>,
    Option<i64>,
    Option<i64>,
    i64,
    String,
    String,
    String,
    i64,
);

type TurnRow = (i64, String, String, String, i64);

fn map_sqlx_err(e: sqlx::Error) -> MemoryError {
    MemoryError::Persistence(e.to_string())
}

fn from_millis(ms: i64) -> DateTime<Utc> {
    DateTime::<Utc>::from_timestamp_millis(ms).unwrap_or_else(Utc::now)
}

fn record_from_row(row: RecordRow) -> Result<SummaryRecord> {
    let (
        id,
        chat_id,
        user_id,
        agent_id,
        window_from_ts,
        window_to_ts,
        turns_from_id,
        turns_to_id,
        tokens_est,
        content,
        origin,
        lifecycle,
        created_at_ms,
    ) = row;

    let window = match (window_from_ts, window_to_ts) {
        (Some(from), Some(to)) => Some(TimeSpan::new(from, to)),
        _ => None,
    };
    let origin = Origin::parse(&origin)
        .ok_or_else(|| MemoryError::Persistence(format!("unknown origin '{}'", origin)))?;
    let lifecycle = Lifecycle::parse(&lifecycle)
        .ok_or_else(|| MemoryError::Persistence(format!("unknown lifecycle '{}'", lifecycle)))?;

    Ok(SummaryRecord {
        id,
        chat_id,
        user_id,
        agent_id,
        window,
        turns_from_id,
        turns_to_id,
        tokens_est: tokens_est.max(0) as u32,
        content: serde_json::from_str(&content)?,
        origin,
        lifecycle,
        created_at: from_millis(created_at_ms),
    })
}

fn turn_from_row(row: TurnRow) -> Result<RawTurn> {
    let (id, chat_id, role, content, created_at_ms) = row;
    let role = Role::parse(&role)
        .ok_or_else(|| MemoryError::Persistence(format!("unknown role '{}'", role)))?;
    Ok(RawTurn {
        id,
        chat_id,
        role,
        content,
        created_at: from_millis(created_at_ms),
    })
}

async fn insert_record<'e, E>(
    executor: E,
    record: &NewSummaryRecord,
    created_at_ms: i64,
) -> Result<i64>
where
    E: sqlx::Executor<'e, Database = Sqlite>,
{
    let content = serde_json::to_string(&record.content)?;
    let result = sqlx::query(
        r#"
        INSERT INTO chat_summaries (
            chat_id, user_id, agent_id, window_from_ts, window_to_ts,
            turns_from_id, turns_to_id, tokens_est, content, origin, lifecycle, created_at_ms
        )
        VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, 'ACTIVE', ?)
        "#,
    )
    .bind(&record.chat_id)
    .bind(record.user_id)
    .bind(record.agent_id)
    .bind(record.window.map(|w| w.from_ts))
    .bind(record.window.map(|w| w.to_ts))
    .bind(record.turns_from_id)
    .bind(record.turns_to_id)
    .bind(record.tokens_est as i64)
    .bind(content)
    .bind(record.origin.as_str())
    .bind(created_at_ms)
    .execute(executor)
    .await
    .map_err(map_sqlx_err)?;
    Ok(result.last_insert_rowid())
}

async fn upsert_cursor_with<'e, E>(executor: E, chat_id: &str, cursor: Cursor) -> Result<()>
where
    E: sqlx::Executor<'e, Database = Sqlite>,
{
    sqlx::query(
        r#"
        INSERT INTO chat_cursors (chat_id, last_turn_id, last_turn_ts, window_len, updated_at_ms)
        VALUES (?, ?, ?, ?, ?)
        ON CONFLICT(chat_id) DO UPDATE SET
            last_turn_id = excluded.last_turn_id,
            last_turn_ts = excluded.last_turn_ts,
            window_len = excluded.window_len,
            updated_at_ms = excluded.updated_at_ms
        WHERE excluded.last_turn_id >= chat_cursors.last_turn_id
        "#,
    )
    .bind(chat_id)
    .bind(cursor.last_turn_id)
    .bind(cursor.last_turn_ts)
    .bind(cursor.window_len as i64)
    .bind(Utc::now().timestamp_millis())
    .execute(executor)
    .await
    .map_err(map_sqlx_err)?;
    Ok(())
}

pub struct SqliteRecordStore {
    pool: SqlitePool,
}

impl SqliteRecordStore {
    pub async fn new(path: &str) -> Result<Self> {
        let options = SqliteConnectOptions::from_str(path)
            .map_err(map_sqlx_err)?
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal);
        let pool = SqlitePool::connect_with(options)
            .await
            .map_err(map_sqlx_err)?;
        let store = Self { pool };
        store.run_migrations().await?;
        Ok(store)
    }

    /// A private in-memory database. The pool is pinned to one long-lived
    /// connection since every `:memory:` connection is a separate database.
    pub async fn in_memory() -> Result<Self> {
        let options = SqliteConnectOptions::from_str("sqlite::memory:").map_err(map_sqlx_err)?;
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect_with(options)
            .await
            .map_err(map_sqlx_err)?;
        let store = Self { pool };
        store.run_migrations().await?;
        Ok(store)
    }

    async fn run_migrations(&self) -> Result<()> {
        let statements = [
            r#"
            CREATE TABLE IF NOT EXISTS chat_summaries (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                chat_id TEXT NOT NULL,
                user_id INTEGER NOT NULL,
                agent_id INTEGER NOT NULL,
                window_from_ts INTEGER,
                window_to_ts INTEGER,
                turns_from_id INTEGER,
                turns_to_id INTEGER,
                tokens_est INTEGER NOT NULL,
                content TEXT NOT NULL,
                origin TEXT NOT NULL,
                lifecycle TEXT NOT NULL DEFAULT 'ACTIVE',
                created_at_ms INTEGER NOT NULL
            )
            "#,
            "CREATE INDEX IF NOT EXISTS idx_chat_summaries_active ON chat_summaries(chat_id, lifecycle)",
            r#"
            CREATE TABLE IF NOT EXISTS chat_cursors (
                chat_id TEXT PRIMARY KEY,
                last_turn_id INTEGER NOT NULL,
                last_turn_ts INTEGER NOT NULL,
                window_len INTEGER NOT NULL,
                updated_at_ms INTEGER NOT NULL
            )
            "#,
            r#"
            CREATE TABLE IF NOT EXISTS chat_turns (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                chat_id TEXT NOT NULL,
                role TEXT NOT NULL,
                content TEXT NOT NULL,
                created_at_ms INTEGER NOT NULL
            )
            "#,
            "CREATE INDEX IF NOT EXISTS idx_chat_turns_chat_id ON chat_turns(chat_id, id)",
        ];

        for statement in statements {
            sqlx::query(statement)
                .execute(&self.pool)
                .await
                .map_err(map_sqlx_err)?;
        }
        Ok(())
    }

    /// Append a raw turn stamped with the current time.
    pub async fn append_turn(
        &self,
        chat_id: &str,
        role: Role,
        content: impl Into<String>,
    ) -> Result<RawTurn> {
        self.append_turn_at(chat_id, role, content, Utc::now()).await
    }

    pub async fn append_turn_at(
        &self,
        chat_id: &str,
        role: Role,
        content: impl Into<String>,
        created_at: DateTime<Utc>,
    ) -> Result<RawTurn> {
        let content = content.into();
        let created_at_ms = created_at.timestamp_millis();
        let result = sqlx::query(
            "INSERT INTO chat_turns (chat_id, role, content, created_at_ms) VALUES (?, ?, ?, ?)",
        )
        .bind(chat_id)
        .bind(role.as_str())
        .bind(&content)
        .bind(created_at_ms)
        .execute(&self.pool)
        .await
        .map_err(map_sqlx_err)?;

        Ok(RawTurn {
            id: result.last_insert_rowid(),
            chat_id: chat_id.to_string(),
            role,
            content,
            created_at: from_millis(created_at_ms),
        })
    }

    async fn select_active(
        &self,
        chat_id: &str,
        limit: usize,
        direction: &str,
    ) -> Result<Vec<SummaryRecord>> {
        let sql = format!(
            "SELECT {cols} FROM chat_summaries WHERE chat_id = ? AND lifecycle = 'ACTIVE' \
             ORDER BY {age} {dir}, id {dir} LIMIT ?",
            cols = RECORD_COLUMNS,
            age = AGE_EXPR,
            dir = direction,
        );
        let rows: Vec<RecordRow> = sqlx::query_as(&sql)
            .bind(chat_id)
            .bind(limit as i64)
            .fetch_all(&self.pool)
            .await
            .map_err(map_sqlx_err)?;
        rows.into_iter().map(record_from_row).collect()
    }

    async fn fetch_record(&self, id: i64) -> Result<SummaryRecord> {
        let sql = format!("SELECT {} FROM chat_summaries WHERE id = ?", RECORD_COLUMNS);
        let row: RecordRow = sqlx::query_as(&sql)
            .bind(id)
            .fetch_one(&self.pool)
            .await
            .map_err(map_sqlx_err)?;
        record_from_row(row)
    }
}

#[async_trait]
impl RecordStore for SqliteRecordStore {
    async fn insert_summary(&self, record: NewSummaryRecord) -> Result<SummaryRecord> {
        let id = insert_record(&self.pool, &record, Utc::now().timestamp_millis()).await?;
        self.fetch_record(id).await
    }

    async fn count_active(&self, chat_id: &str) -> Result<usize> {
        let (count,): (i64,) = sqlx::query_as(
            "SELECT COUNT(*) FROM chat_summaries WHERE chat_id = ? AND lifecycle = 'ACTIVE'",
        )
        .bind(chat_id)
        .fetch_one(&self.pool)
        .await
        .map_err(map_sqlx_err)?;
        Ok(count.max(0) as usize)
    }

    async fn select_oldest_active(
        &self,
        chat_id: &str,
        limit: usize,
    ) -> Result<Vec<SummaryRecord>> {
        self.select_active(chat_id, limit, "ASC").await
    }

    async fn select_newest_active(
        &self,
        chat_id: &str,
        limit: usize,
    ) -> Result<Vec<SummaryRecord>> {
        self.select_active(chat_id, limit, "DESC").await
    }

    async fn mark_archived(&self, ids: &[i64]) -> Result<usize> {
        if ids.is_empty() {
            return Ok(0);
        }
        let placeholders = vec!["?"; ids.len()].join(", ");
        let sql = format!(
            "UPDATE chat_summaries SET lifecycle = 'ARCHIVED' \
             WHERE lifecycle = 'ACTIVE' AND id IN ({})",
            placeholders
        );
        let mut query = sqlx::query(&sql);
        for id in ids {
            query = query.bind(*id);
        }
        let result = query.execute(&self.pool).await.map_err(map_sqlx_err)?;
        Ok(result.rows_affected() as usize)
    }

    async fn get_cursor(&self, chat_id: &str) -> Result<Option<Cursor>> {
        let row: Option<(i64, i64, i64)> = sqlx::query_as(
            "SELECT last_turn_id, last_turn_ts, window_len FROM chat_cursors WHERE chat_id = ?",
        )
        .bind(chat_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(map_sqlx_err)?;

        Ok(row.map(|(last_turn_id, last_turn_ts, window_len)| Cursor {
            last_turn_id,
            last_turn_ts,
            window_len: window_len.max(0) as usize,
        }))
    }

    async fn upsert_cursor(&self, chat_id: &str, cursor: Cursor) -> Result<()> {
        upsert_cursor_with(&self.pool, chat_id, cursor).await
    }

    async fn commit_window(
        &self,
        record: NewSummaryRecord,
        cursor: Cursor,
    ) -> Result<SummaryRecord> {
        let mut tx = self.pool.begin().await.map_err(map_sqlx_err)?;
        let id = insert_record(&mut *tx, &record, Utc::now().timestamp_millis()).await?;
        upsert_cursor_with(&mut *tx, &record.chat_id, cursor).await?;
        tx.commit().await.map_err(map_sqlx_err)?;
        self.fetch_record(id).await
    }
}

#[async_trait]
impl TurnSource for SqliteRecordStore {
    async fn turns_after(
        &self,
        chat_id: &str,
        after_id: i64,
        limit: usize,
    ) -> Result<Vec<RawTurn>> {
        let rows: Vec<TurnRow> = sqlx::query_as(
            "SELECT id, chat_id, role, content, created_at_ms FROM chat_turns \
             WHERE chat_id = ? AND id > ? ORDER BY id ASC LIMIT ?",
        )
        .bind(chat_id)
        .bind(after_id)
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await
        .map_err(map_sqlx_err)?;
        rows.into_iter().map(turn_from_row).collect()
    }

    async fn recent_turns(&self, chat_id: &str, limit: usize) -> Result<Vec<RawTurn>> {
        let rows: Vec<TurnRow> = sqlx::query_as(
            "SELECT id, chat_id, role, content, created_at_ms FROM chat_turns \
             WHERE chat_id = ? ORDER BY id DESC LIMIT ?",
        )
        .bind(chat_id)
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await
        .map_err(map_sqlx_err)?;
        let mut turns = rows
            .into_iter()
            .map(turn_from_row)
            .collect::<Result<Vec<_>>>()?;
        turns.reverse();
        Ok(turns)
    }
}
