//! Durable memory records: summaries and summarization cursors

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Provenance of a summary record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Origin {
    /// Produced from a window of raw turns.
    Raw,
    /// Produced by compacting other summary records.
    Merged,
}

impl Origin {
    pub fn as_str(&self) -> &'static str {
        match self {
            Origin::Raw => "RAW",
            Origin::Merged => "MERGED",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "RAW" => Some(Origin::Raw),
            "MERGED" => Some(Origin::Merged),
            _ => None,
        }
    }
}

/// Lifecycle flag. The only permitted transition is `Active -> Archived`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Lifecycle {
    Active,
    Archived,
}

impl Lifecycle {
    pub fn as_str(&self) -> &'static str {
        match self {
            Lifecycle::Active => "ACTIVE",
            Lifecycle::Archived => "ARCHIVED",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "ACTIVE" => Some(Lifecycle::Active),
            "ARCHIVED" => Some(Lifecycle::Archived),
            _ => None,
        }
    }
}

/// Inclusive millisecond span covered by a record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct TimeSpan {
    pub from_ts: i64,
    pub to_ts: i64,
}

impl TimeSpan {
    pub fn new(from_ts: i64, to_ts: i64) -> Self {
        Self { from_ts, to_ts }
    }

    /// Smallest span that contains every given span.
    pub fn covering(spans: impl IntoIterator<Item = TimeSpan>) -> Option<TimeSpan> {
        spans.into_iter().fold(None, |acc, s| match acc {
            None => Some(s),
            Some(a) => Some(TimeSpan::new(a.from_ts.min(s.from_ts), a.to_ts.max(s.to_ts))),
        })
    }
}

/// A summary record as it exists in the durable store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SummaryRecord {
    pub id: i64,
    pub chat_id: String,
    pub user_id: i64,
    pub agent_id: i64,
    pub window: Option<TimeSpan>,
    #[serde(default)]
    pub turns_from_id: Option<i64>,
    #[serde(default)]
    pub turns_to_id: Option<i64>,
    pub tokens_est: u32,
    pub content: serde_json::Value,
    pub origin: Origin,
    pub lifecycle: Lifecycle,
    pub created_at: DateTime<Utc>,
}

impl SummaryRecord {
    pub fn is_active(&self) -> bool {
        self.lifecycle == Lifecycle::Active
    }

    /// Start of the covered period, falling back to the creation time.
    pub fn effective_from_ms(&self) -> i64 {
        match self.window {
            Some(w) if w.from_ts > 0 => w.from_ts,
            _ => self.created_at.timestamp_millis(),
        }
    }

    /// End of the covered period, falling back to the creation time.
    pub fn effective_to_ms(&self) -> i64 {
        match self.window {
            Some(w) if w.to_ts > 0 => w.to_ts,
            _ => self.created_at.timestamp_millis(),
        }
    }
}

/// A record that has not been inserted yet. The store assigns `id`,
/// `lifecycle` (always `Active`) and `created_at`.
#[derive(Debug, Clone, PartialEq)]
pub struct NewSummaryRecord {
    pub chat_id: String,
    pub user_id: i64,
    pub agent_id: i64,
    pub window: Option<TimeSpan>,
    pub turns_from_id: Option<i64>,
    pub turns_to_id: Option<i64>,
    pub tokens_est: u32,
    pub content: serde_json::Value,
    pub origin: Origin,
}

impl NewSummaryRecord {
    pub fn into_record(self, id: i64, created_at: DateTime<Utc>) -> SummaryRecord {
        SummaryRecord {
            id,
            chat_id: self.chat_id,
            user_id: self.user_id,
            agent_id: self.agent_id,
            window: self.window,
            turns_from_id: self.turns_from_id,
            turns_to_id: self.turns_to_id,
            tokens_est: self.tokens_est,
            content: self.content,
            origin: self.origin,
            lifecycle: Lifecycle::Active,
            created_at,
        }
    }
}

/// Last raw turn already folded into a summary for a conversation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Cursor {
    pub last_turn_id: i64,
    pub last_turn_ts: i64,
    pub window_len: usize,
}
