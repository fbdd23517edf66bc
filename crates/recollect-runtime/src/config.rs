//! YAML configuration for the memory engine

use std::collections::HashMap;
use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use recollect_core::{MemoryError, Result};
use recollect_memory::{
    CompactionSettings, LeaseConfig, MemoryKeys, ModelProfile, ModelRegistry, WindowSettings,
    clamp_alpha,
};
use recollect_storage::StorageConfig;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RecollectConfig {
    #[serde(default)]
    pub cache: RecentCacheConfig,

    #[serde(default)]
    pub lease: LeaseConfig,

    #[serde(default)]
    pub summary: SummaryConfig,

    #[serde(default)]
    pub compaction: CompactionConfig,

    #[serde(default)]
    pub estimator: EstimatorConfig,

    #[serde(default)]
    pub window: WindowConfig,

    /// Registry alias of the text-generation provider used for summaries.
    #[serde(default = "default_summarizer_model")]
    pub summarizer_model: String,

    #[serde(default)]
    pub models: HashMap<String, ModelProfile>,

    #[serde(default)]
    pub workers: WorkerConfig,

    #[serde(default)]
    pub storage: StorageConfig,
}

fn default_summarizer_model() -> String {
    "default".to_string()
}

/// Keyspace and lifetime of the soft state kept in the shared cache.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RecentCacheConfig {
    #[serde(default = "default_key_prefix")]
    pub key_prefix: String,

    #[serde(default = "default_recent_cache_size")]
    pub recent_cache_size: usize,

    #[serde(default = "default_counter_ttl_seconds")]
    pub counter_ttl_seconds: u64,
}

fn default_key_prefix() -> String {
    "chat:lms:".to_string()
}

fn default_recent_cache_size() -> usize {
    400
}

fn default_counter_ttl_seconds() -> u64 {
    604_800
}

impl Default for RecentCacheConfig {
    fn default() -> Self {
        Self {
            key_prefix: default_key_prefix(),
            recent_cache_size: default_recent_cache_size(),
            counter_ttl_seconds: default_counter_ttl_seconds(),
        }
    }
}

impl RecentCacheConfig {
    pub fn ttl(&self) -> Duration {
        Duration::from_secs(self.counter_ttl_seconds)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SummaryConfig {
    #[serde(default = "default_min_tokens_per_item")]
    pub min_tokens_per_item: u32,

    #[serde(default = "default_max_tokens_per_item")]
    pub max_tokens_per_item: u32,

    /// Expected summary size until the moving average has data.
    #[serde(default = "default_target_summary_tokens")]
    pub target_summary_tokens: u32,

    #[serde(default = "default_fallback_turn_tokens")]
    pub fallback_turn_tokens: u32,
}

fn default_min_tokens_per_item() -> u32 {
    120
}

fn default_max_tokens_per_item() -> u32 {
    400
}

fn default_target_summary_tokens() -> u32 {
    300
}

fn default_fallback_turn_tokens() -> u32 {
    120
}

impl Default for SummaryConfig {
    fn default() -> Self {
        Self {
            min_tokens_per_item: default_min_tokens_per_item(),
            max_tokens_per_item: default_max_tokens_per_item(),
            target_summary_tokens: default_target_summary_tokens(),
            fallback_turn_tokens: default_fallback_turn_tokens(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CompactionConfig {
    #[serde(default = "default_keep_recent_ratio")]
    pub keep_recent_ratio: f64,

    #[serde(default = "default_soft_cap_ratio")]
    pub soft_cap_ratio: f64,
}

fn default_keep_recent_ratio() -> f64 {
    0.5
}

fn default_soft_cap_ratio() -> f64 {
    0.8
}

impl Default for CompactionConfig {
    fn default() -> Self {
        Self {
            keep_recent_ratio: default_keep_recent_ratio(),
            soft_cap_ratio: default_soft_cap_ratio(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EstimatorConfig {
    #[serde(default = "default_ewma_alpha")]
    pub ewma_alpha: f64,
}

fn default_ewma_alpha() -> f64 {
    0.2
}

impl Default for EstimatorConfig {
    fn default() -> Self {
        Self {
            ewma_alpha: default_ewma_alpha(),
        }
    }
}

impl EstimatorConfig {
    pub fn alpha(&self) -> f64 {
        clamp_alpha(self.ewma_alpha)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WindowConfig {
    /// Raw turns loaded into each prompt. Windows are half this size.
    #[serde(default = "default_retrieve_size")]
    pub retrieve_size: usize,
}

fn default_retrieve_size() -> usize {
    40
}

impl Default for WindowConfig {
    fn default() -> Self {
        Self {
            retrieve_size: default_retrieve_size(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerConfig {
    #[serde(default = "default_concurrency")]
    pub concurrency: usize,

    #[serde(default = "default_queue_capacity")]
    pub queue_capacity: usize,
}

fn default_concurrency() -> usize {
    4
}

fn default_queue_capacity() -> usize {
    200
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            concurrency: default_concurrency(),
            queue_capacity: default_queue_capacity(),
        }
    }
}

impl RecollectConfig {
    pub fn from_yaml_str(yaml: &str) -> Result<Self> {
        let config: RecollectConfig = serde_yaml::from_str(yaml)
            .map_err(|e| MemoryError::Config(format!("Invalid YAML: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_yaml_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|e| {
            MemoryError::Config(format!("Cannot read {}: {}", path.display(), e))
        })?;
        Self::from_yaml_str(&content)
    }

    pub fn validate(&self) -> Result<()> {
        if self.cache.key_prefix.is_empty() {
            return Err(MemoryError::Config(
                "cache.key_prefix cannot be empty".to_string(),
            ));
        }
        if self.cache.recent_cache_size == 0 {
            return Err(MemoryError::Config(
                "cache.recent_cache_size must be greater than 0".to_string(),
            ));
        }
        if self.lease.ttl_seconds == 0 {
            return Err(MemoryError::Config(
                "lease.ttl_seconds must be greater than 0".to_string(),
            ));
        }
        if self.summary.min_tokens_per_item > self.summary.max_tokens_per_item {
            return Err(MemoryError::Config(format!(
                "summary.min_tokens_per_item ({}) exceeds max_tokens_per_item ({})",
                self.summary.min_tokens_per_item, self.summary.max_tokens_per_item
            )));
        }
        for (name, ratio) in [
            ("compaction.keep_recent_ratio", self.compaction.keep_recent_ratio),
            ("compaction.soft_cap_ratio", self.compaction.soft_cap_ratio),
        ] {
            if !(0.0..=1.0).contains(&ratio) {
                return Err(MemoryError::Config(format!(
                    "{} must be within [0, 1], got {}",
                    name, ratio
                )));
            }
        }
        if self.window.retrieve_size == 0 {
            return Err(MemoryError::Config(
                "window.retrieve_size must be greater than 0".to_string(),
            ));
        }
        if self.workers.concurrency == 0 || self.workers.queue_capacity == 0 {
            return Err(MemoryError::Config(
                "workers.concurrency and workers.queue_capacity must be greater than 0"
                    .to_string(),
            ));
        }
        Ok(())
    }

    pub fn keys(&self) -> MemoryKeys {
        MemoryKeys::new(self.cache.key_prefix.clone())
    }

    pub fn model_registry(&self) -> ModelRegistry {
        ModelRegistry::from_profiles(self.models.clone())
    }

    pub fn window_settings(&self) -> WindowSettings {
        WindowSettings {
            retrieve_size: self.window.retrieve_size,
            lease_ttl: self.lease.ttl(),
            counter_ttl: self.cache.ttl(),
            min_tokens_per_item: self.summary.min_tokens_per_item,
            max_tokens_per_item: self.summary.max_tokens_per_item,
        }
    }

    pub fn compaction_settings(&self) -> CompactionSettings {
        CompactionSettings {
            keep_recent_ratio: self.compaction.keep_recent_ratio,
            lease_ttl: self.lease.ttl(),
            min_tokens_per_item: self.summary.min_tokens_per_item,
            max_tokens_per_item: self.summary.max_tokens_per_item,
        }
    }
}
