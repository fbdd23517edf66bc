//! Cache key layout for one deployment

/// Builds every cache key under a shared prefix (default `chat:lms:`).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MemoryKeys {
    prefix: String,
}

/// Stat hash field mirroring the cursor's last summarized turn id.
pub const FIELD_LAST_TO_ID: &str = "last_to_id";
/// Stat hash field counting turns since the last maintenance cycle.
pub const FIELD_SINCE_LAST: &str = "c_since_last_lms";
/// EWMA hash field for the average raw turn size.
pub const FIELD_TURN_AVG: &str = "t_hist_avg";
/// EWMA hash field for the average summary size.
pub const FIELD_SUMMARY_AVG: &str = "t_lms_avg";

impl MemoryKeys {
    pub fn new(prefix: impl Into<String>) -> Self {
        Self {
            prefix: prefix.into(),
        }
    }

    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    /// Recent summaries list, newest first.
    pub fn recent(&self, chat_id: &str) -> String {
        format!("{}{}", self.prefix, chat_id)
    }

    pub fn stat(&self, chat_id: &str) -> String {
        format!("{}stat:{}", self.prefix, chat_id)
    }

    pub fn ewma(&self, chat_id: &str) -> String {
        format!("{}ewma:{}", self.prefix, chat_id)
    }

    /// Lease shared by window and compaction cycles of one conversation.
    pub fn lease(&self, chat_id: &str) -> String {
        format!("{}lock:{}", self.prefix, chat_id)
    }
}

impl Default for MemoryKeys {
    fn default() -> Self {
        Self::new("chat:lms:")
    }
}
