//! Hierarchical compaction: merge the oldest active summaries into fewer,
//! denser MERGED records once a conversation reaches its soft cap.

use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;
use tracing::{debug, info, warn};

use recollect_core::{NewSummaryRecord, Origin, RecordStore, Result, SummaryRecord, TimeSpan};

use crate::estimator::AdaptiveSizeEstimator;
use crate::keys::MemoryKeys;
use crate::lease::{Lease, LeaseLock};
use crate::sanitize::{SanitizeTier, sanitize_model_output, time_span_of, wrap_raw_text};
use crate::summarizer::Summarizer;
use crate::summary_store::SummaryStore;
use crate::tokens::clamp_record_tokens;

/// Sizes of one compaction pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CompactionPlan {
    /// Active count the conversation is brought down to.
    pub final_target: usize,
    /// Newest records left untouched.
    pub reserve_recent: usize,
    /// MERGED records requested from the summarizer.
    pub compact_out: usize,
    /// Oldest records selected for merging.
    pub num_to_compact: usize,
}

impl CompactionPlan {
    pub fn compute(total_active: usize, soft_cap: usize, keep_recent_ratio: f64) -> Self {
        let final_target = (soft_cap / 2).max(2);
        let ratio = if keep_recent_ratio.is_finite() {
            keep_recent_ratio.clamp(0.0, 1.0)
        } else {
            0.5
        };
        let reserve_recent = ((final_target as f64 * ratio).ceil() as usize).max(1);
        let compact_out = final_target.saturating_sub(reserve_recent).max(1);
        let num_to_compact = total_active.saturating_sub(reserve_recent);
        Self {
            final_target,
            reserve_recent,
            compact_out,
            num_to_compact,
        }
    }
}

#[derive(Debug, Clone)]
pub struct CompactionSettings {
    pub keep_recent_ratio: f64,
    pub lease_ttl: Duration,
    pub min_tokens_per_item: u32,
    pub max_tokens_per_item: u32,
}

impl Default for CompactionSettings {
    fn default() -> Self {
        Self {
            keep_recent_ratio: 0.5,
            lease_ttl: Duration::from_secs(60),
            min_tokens_per_item: 120,
            max_tokens_per_item: 400,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum CompactionOutcome {
    BelowCap { active: usize, soft_cap: usize },
    Contended,
    NothingToCompact { plan: CompactionPlan },
    Compacted {
        plan: CompactionPlan,
        archived: usize,
        inserted: Vec<SummaryRecord>,
        tier: SanitizeTier,
    },
}

pub struct CompactionEngine {
    lease: LeaseLock,
    keys: MemoryKeys,
    records: Arc<dyn RecordStore>,
    summaries: SummaryStore,
    summarizer: Arc<dyn Summarizer>,
    estimator: AdaptiveSizeEstimator,
    settings: CompactionSettings,
}

impl CompactionEngine {
    pub fn new(
        lease: LeaseLock,
        keys: MemoryKeys,
        records: Arc<dyn RecordStore>,
        summaries: SummaryStore,
        summarizer: Arc<dyn Summarizer>,
        estimator: AdaptiveSizeEstimator,
        settings: CompactionSettings,
    ) -> Self {
        Self {
            lease,
            keys,
            records,
            summaries,
            summarizer,
            estimator,
            settings,
        }
    }

    pub fn settings(&self) -> &CompactionSettings {
        &self.settings
    }

    /// Compact the conversation if it holds at least `soft_cap` active records.
    ///
    /// A `soft_cap` of zero (no prompt room for summaries) still compacts,
    /// down to the two-record floor of the plan.
    pub async fn run_cycle(&self, chat_id: &str, soft_cap: usize) -> Result<CompactionOutcome> {
        let active = self.records.count_active(chat_id).await?;
        if active < soft_cap {
            debug!(chat_id, active, soft_cap, "Below soft cap");
            return Ok(CompactionOutcome::BelowCap { active, soft_cap });
        }

        let Some(lease) = self
            .lease
            .try_acquire(&self.keys.lease(chat_id), self.settings.lease_ttl)
            .await?
        else {
            debug!(chat_id, "Compaction skipped, lease held elsewhere");
            return Ok(CompactionOutcome::Contended);
        };
        lease.start_watchdog();

        let result = self.compact_locked(chat_id, soft_cap, &lease).await;
        if !lease.release().await {
            warn!(chat_id, "Compaction finished without holding the lease");
        }
        result
    }

    async fn compact_locked(
        &self,
        chat_id: &str,
        soft_cap: usize,
        lease: &Lease,
    ) -> Result<CompactionOutcome> {
        // another worker may have compacted between the check and the lease
        let active = self.records.count_active(chat_id).await?;
        if active < soft_cap {
            return Ok(CompactionOutcome::BelowCap { active, soft_cap });
        }

        let plan = CompactionPlan::compute(active, soft_cap, self.settings.keep_recent_ratio);
        if plan.num_to_compact == 0 {
            return Ok(CompactionOutcome::NothingToCompact { plan });
        }

        let oldest = self
            .records
            .select_oldest_active(chat_id, plan.num_to_compact)
            .await?;
        let Some(first) = oldest.first() else {
            return Ok(CompactionOutcome::NothingToCompact { plan });
        };
        let (user_id, agent_id) = (first.user_id, first.agent_id);

        let fallback = TimeSpan::covering(
            oldest
                .iter()
                .map(|r| TimeSpan::new(r.effective_from_ms(), r.effective_to_ms())),
        )
        .unwrap_or_default();
        let payloads = oldest
            .iter()
            .map(|r| serde_json::to_string(&r.content))
            .collect::<std::result::Result<Vec<_>, _>>()?;

        let raw = self
            .summarizer
            .merge_summaries(&payloads, plan.compact_out)
            .await?;
        if !lease.renew_now().await {
            warn!(chat_id, "Lease lost during merge, continuing");
        }

        let sanitized = sanitize_model_output(&raw);
        if sanitized.tier != SanitizeTier::Clean {
            warn!(chat_id, tier = ?sanitized.tier, "Merge output needed sanitizing");
        }

        let contents = self.merged_items(chat_id, sanitized.value, &raw, plan.compact_out);
        let mut inserted = Vec::with_capacity(contents.len());
        for (content, span) in contents {
            let span = span.unwrap_or(fallback);
            let json = serde_json::to_string(&content)?;
            let record = NewSummaryRecord {
                chat_id: chat_id.to_string(),
                user_id,
                agent_id,
                window: Some(span),
                turns_from_id: None,
                turns_to_id: None,
                tokens_est: clamp_record_tokens(
                    &json,
                    self.settings.min_tokens_per_item,
                    self.settings.max_tokens_per_item,
                ),
                content,
                origin: Origin::Merged,
            };
            inserted.push(self.records.insert_summary(record).await?);
        }

        let ids: Vec<i64> = oldest.iter().map(|r| r.id).collect();
        let archived = self.records.mark_archived(&ids).await?;

        if let Err(e) = self.summaries.rebuild(chat_id).await {
            warn!(chat_id, error = %e, "Failed to rebuild recent summaries cache");
            let _ = self.summaries.invalidate(chat_id).await;
        }
        self.estimator.reset_since_last(chat_id).await;

        info!(
            chat_id,
            archived,
            inserted = inserted.len(),
            remaining = active - archived + inserted.len(),
            "Compacted summaries"
        );
        Ok(CompactionOutcome::Compacted {
            plan,
            archived,
            inserted,
            tier: sanitized.tier,
        })
    }

    /// Content and own time span of each MERGED record to insert.
    fn merged_items(
        &self,
        chat_id: &str,
        value: Value,
        raw: &str,
        compact_out: usize,
    ) -> Vec<(Value, Option<TimeSpan>)> {
        let items = match value {
            Value::Array(items) if !items.is_empty() => items,
            // an empty array would archive records with nothing to replace them
            Value::Array(_) => return vec![(wrap_raw_text(raw.trim()), None)],
            other => return vec![(other, None)],
        };

        if items.len() > compact_out {
            warn!(
                chat_id,
                produced = items.len(),
                requested = compact_out,
                "Merge produced too many items, truncating"
            );
        }
        items
            .into_iter()
            .take(compact_out)
            .map(|item| {
                let item = if item.is_object() {
                    item
                } else {
                    let text = match item {
                        Value::String(s) => s,
                        other => other.to_string(),
                    };
                    wrap_raw_text(&text)
                };
                let span = match time_span_of(&item) {
                    (Some(from), Some(to)) if from <= to => Some(TimeSpan::new(from, to)),
                    _ => None,
                };
                (item, span)
            })
            .collect()
    }
}
