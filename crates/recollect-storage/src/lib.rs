//! Cache and durable store backends for the recollect memory engine

mod memory_cache;
mod memory_store;
mod redis;

#[cfg(feature = "sqlite")]
mod sqlite;

pub use memory_cache::InMemoryCache;
pub use memory_store::InMemoryRecordStore;
pub use recollect_core::{MemoryError, RecordStore, Result, SharedCache, TurnSource};
pub use redis::RedisCache;

#[cfg(feature = "sqlite")]
pub use sqlite::SqliteRecordStore;

use serde::{Deserialize, Serialize};
use std::sync::Arc;

/// Backend for the shared cache (lease keys, recent lists, counters).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum CacheConfig {
    #[default]
    #[serde(rename = "memory")]
    Memory,
    #[serde(rename = "redis")]
    Redis { url: String },
}

/// Backend for the durable record store and raw turn source.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum StoreConfig {
    #[default]
    #[serde(rename = "memory")]
    Memory,
    #[serde(rename = "sqlite")]
    Sqlite { path: String },
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StorageConfig {
    #[serde(default)]
    pub cache: CacheConfig,
    #[serde(default)]
    pub store: StoreConfig,
}

/// The durable store exposed through both of its seams.
#[derive(Clone)]
pub struct DurableBackend {
    pub records: Arc<dyn RecordStore>,
    pub turns: Arc<dyn TurnSource>,
}

pub async fn create_cache(config: &CacheConfig) -> Result<Arc<dyn SharedCache>> {
    match config {
        CacheConfig::Memory => Ok(Arc::new(InMemoryCache::new())),

        #[cfg(feature = "redis-storage")]
        CacheConfig::Redis { url } => {
            let cache = RedisCache::connect(url).await?;
            tracing::info!(url = %url, "Connected redis cache");
            Ok(Arc::new(cache))
        }

        #[cfg(not(feature = "redis-storage"))]
        CacheConfig::Redis { .. } => Err(MemoryError::Config(
            "Redis cache requires 'redis-storage' feature".into(),
        )),
    }
}

pub async fn create_record_store(config: &StoreConfig) -> Result<DurableBackend> {
    match config {
        StoreConfig::Memory => {
            let store = Arc::new(InMemoryRecordStore::new());
            Ok(DurableBackend {
                records: store.clone(),
                turns: store,
            })
        }

        #[cfg(feature = "sqlite")]
        StoreConfig::Sqlite { path } => {
            let store = Arc::new(SqliteRecordStore::new(path).await?);
            tracing::info!(path = %path, "Opened sqlite record store");
            Ok(DurableBackend {
                records: store.clone(),
                turns: store,
            })
        }

        #[cfg(not(feature = "sqlite"))]
        StoreConfig::Sqlite { .. } => Err(MemoryError::Config(
            "SQLite store requires 'sqlite' feature".into(),
        )),
    }
}
