//! Adaptive size estimates kept as soft state in the shared cache

use std::sync::Arc;
use std::time::Duration;

use tracing::warn;

use recollect_core::{Result, SharedCache};

use crate::keys::{FIELD_SINCE_LAST, FIELD_SUMMARY_AVG, FIELD_TURN_AVG, MemoryKeys};

pub const MIN_ALPHA: f64 = 0.01;
pub const MAX_ALPHA: f64 = 1.0;

pub fn clamp_alpha(alpha: f64) -> f64 {
    if alpha.is_nan() {
        return MIN_ALPHA;
    }
    alpha.clamp(MIN_ALPHA, MAX_ALPHA)
}

/// One EWMA step. An unset (zero) average is seeded with the observation.
pub fn ewma_step(alpha: f64, observed: f64, previous: f64) -> f64 {
    let previous = if previous == 0.0 { observed } else { previous };
    alpha * observed + (1.0 - alpha) * previous
}

/// Moving averages of raw-turn and summary token sizes plus the
/// turns-since-last-maintenance counter, per conversation.
///
/// Everything here is soft state: every failure is logged and answered with
/// the caller's fallback, and entries expire after `ttl` of inactivity.
#[derive(Clone)]
pub struct AdaptiveSizeEstimator {
    cache: Arc<dyn SharedCache>,
    keys: MemoryKeys,
    ttl: Duration,
}

impl AdaptiveSizeEstimator {
    pub fn new(cache: Arc<dyn SharedCache>, keys: MemoryKeys, ttl: Duration) -> Self {
        Self { cache, keys, ttl }
    }

    /// Count one more turn and return the new total, 0 if the cache failed.
    pub async fn bump_since_last(&self, chat_id: &str) -> u64 {
        let key = self.keys.stat(chat_id);
        match self.try_bump(&key).await {
            Ok(count) => count.max(0) as u64,
            Err(e) => {
                warn!(chat_id, key = %key, error = %e, "Failed to bump turn counter");
                0
            }
        }
    }

    async fn try_bump(&self, key: &str) -> Result<i64> {
        let count = self.cache.hash_incr(key, FIELD_SINCE_LAST, 1).await?;
        self.cache.expire(key, self.ttl).await?;
        Ok(count)
    }

    pub async fn reset_since_last(&self, chat_id: &str) {
        let key = self.keys.stat(chat_id);
        if let Err(e) = self.try_reset(&key).await {
            warn!(chat_id, key = %key, error = %e, "Failed to reset turn counter");
        }
    }

    async fn try_reset(&self, key: &str) -> Result<()> {
        self.cache.hash_set(key, FIELD_SINCE_LAST, "0").await?;
        self.cache.expire(key, self.ttl).await
    }

    pub async fn since_last(&self, chat_id: &str) -> u64 {
        let key = self.keys.stat(chat_id);
        match self.cache.hash_get(&key, FIELD_SINCE_LAST).await {
            Ok(value) => value.and_then(|v| v.parse::<u64>().ok()).unwrap_or(0),
            Err(e) => {
                warn!(chat_id, error = %e, "Failed to read turn counter");
                0
            }
        }
    }

    /// Fold one observation into both averages. The two series are independent.
    pub async fn update_ewma(
        &self,
        chat_id: &str,
        alpha: f64,
        observed_turn_tokens: u32,
        observed_summary_tokens: u32,
    ) {
        let key = self.keys.ewma(chat_id);
        if let Err(e) = self
            .try_update(&key, clamp_alpha(alpha), observed_turn_tokens, observed_summary_tokens)
            .await
        {
            warn!(chat_id, key = %key, error = %e, "Failed to update size averages");
        }
    }

    async fn try_update(
        &self,
        key: &str,
        alpha: f64,
        turn_tokens: u32,
        summary_tokens: u32,
    ) -> Result<()> {
        let old_turn = self.read_avg(key, FIELD_TURN_AVG).await?;
        let old_summary = self.read_avg(key, FIELD_SUMMARY_AVG).await?;

        let new_turn = ewma_step(alpha, turn_tokens as f64, old_turn);
        let new_summary = ewma_step(alpha, summary_tokens as f64, old_summary);

        self.cache
            .hash_set(key, FIELD_TURN_AVG, &new_turn.to_string())
            .await?;
        self.cache
            .hash_set(key, FIELD_SUMMARY_AVG, &new_summary.to_string())
            .await?;
        self.cache.expire(key, self.ttl).await
    }

    async fn read_avg(&self, key: &str, field: &str) -> Result<f64> {
        let raw = self.cache.hash_get(key, field).await?;
        Ok(raw
            .and_then(|v| v.parse::<f64>().ok())
            .filter(|v| v.is_finite() && *v > 0.0)
            .unwrap_or(0.0))
    }

    async fn avg_or(&self, chat_id: &str, field: &str, fallback: u32) -> u32 {
        let key = self.keys.ewma(chat_id);
        match self.read_avg(&key, field).await {
            Ok(v) if v > 0.0 => (v.round() as u32).max(1),
            Ok(_) => fallback,
            Err(e) => {
                warn!(chat_id, field, error = %e, "Failed to read size average");
                fallback
            }
        }
    }

    pub async fn avg_turn_tokens(&self, chat_id: &str, fallback: u32) -> u32 {
        self.avg_or(chat_id, FIELD_TURN_AVG, fallback).await
    }

    pub async fn avg_summary_tokens(&self, chat_id: &str, fallback: u32) -> u32 {
        self.avg_or(chat_id, FIELD_SUMMARY_AVG, fallback).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use recollect_storage::InMemoryCache;

    fn estimator(cache: &InMemoryCache) -> AdaptiveSizeEstimator {
        AdaptiveSizeEstimator::new(
            Arc::new(cache.clone()),
            MemoryKeys::default(),
            Duration::from_secs(3600),
        )
    }

    #[test]
    fn test_clamp_alpha() {
        assert_eq!(clamp_alpha(0.0), 0.01);
        assert_eq!(clamp_alpha(5.0), 1.0);
        assert_eq!(clamp_alpha(0.2), 0.2);
        assert_eq!(clamp_alpha(f64::NAN), 0.01);
    }

    #[test]
    fn test_ewma_step_seeds_from_first_observation() {
        assert_eq!(ewma_step(0.2, 300.0, 0.0), 300.0);
        assert!((ewma_step(0.2, 300.0, 100.0) - 140.0).abs() < 1e-9);
    }

    #[tokio::test]
    async fn test_fallbacks_when_unset() {
        let cache = InMemoryCache::new();
        let est = estimator(&cache);
        assert_eq!(est.avg_turn_tokens("c", 120).await, 120);
        assert_eq!(est.avg_summary_tokens("c", 300).await, 300);
    }

    #[tokio::test]
    async fn test_ewma_converges_to_constant_input() {
        let cache = InMemoryCache::new();
        let est = estimator(&cache);

        est.update_ewma("c", 0.2, 100, 50).await;
        for _ in 0..20 {
            est.update_ewma("c", 0.2, 300, 150).await;
        }
        let turn = est.avg_turn_tokens("c", 1).await;
        let summary = est.avg_summary_tokens("c", 1).await;
        assert!((297..=300).contains(&turn), "turn avg {}", turn);
        assert!((148..=150).contains(&summary), "summary avg {}", summary);
        assert!(cache.ttl("chat:lms:ewma:c").is_some());
    }

    #[tokio::test]
    async fn test_since_last_counter() {
        let cache = InMemoryCache::new();
        let est = estimator(&cache);

        assert_eq!(est.bump_since_last("c").await, 1);
        assert_eq!(est.bump_since_last("c").await, 2);
        assert_eq!(est.since_last("c").await, 2);
        est.reset_since_last("c").await;
        assert_eq!(est.since_last("c").await, 0);
        assert_eq!(est.bump_since_last("c").await, 1);
    }

    #[tokio::test]
    async fn test_cache_failures_return_fallbacks() {
        let cache = InMemoryCache::new();
        let est = estimator(&cache);
        // a list under the hash key makes every hash operation fail
        cache
            .list_push_front("chat:lms:ewma:c", "not-a-hash")
            .await
            .unwrap();
        cache
            .list_push_front("chat:lms:stat:c", "not-a-hash")
            .await
            .unwrap();

        est.update_ewma("c", 0.2, 300, 300).await;
        assert_eq!(est.avg_turn_tokens("c", 120).await, 120);
        assert_eq!(est.bump_since_last("c").await, 0);
        est.reset_since_last("c").await;
    }
}
