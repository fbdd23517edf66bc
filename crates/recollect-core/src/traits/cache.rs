//! Shared cache primitives

use std::time::Duration;

use async_trait::async_trait;

use crate::error::Result;

/// Key/value cache shared by every service instance.
///
/// The cache is never authoritative: it may be dropped at any time. The three
/// conditional operations must be atomic on the backing server, since they are
/// the only mutual-exclusion primitive the lease relies on.
///
/// Built-in backends: `InMemoryCache` and `RedisCache`.
#[async_trait]
pub trait SharedCache: Send + Sync {
    /// Store `value` under `key` with a TTL unless the key exists.
    /// Returns `true` when the value was written.
    async fn set_if_absent(&self, key: &str, value: &str, ttl: Duration) -> Result<bool>;

    /// Delete `key` only if it currently holds `expected`.
    async fn compare_and_delete(&self, key: &str, expected: &str) -> Result<bool>;

    /// Reset the TTL of `key` only if it currently holds `expected`.
    async fn compare_and_expire(&self, key: &str, expected: &str, ttl: Duration) -> Result<bool>;

    async fn delete(&self, key: &str) -> Result<()>;

    async fn expire(&self, key: &str, ttl: Duration) -> Result<()>;

    /// Push one value onto the head of a list.
    async fn list_push_front(&self, key: &str, value: &str) -> Result<()>;

    /// Append values to the tail of a list, in order.
    async fn list_push_back(&self, key: &str, values: &[String]) -> Result<()>;

    /// Keep only the inclusive range `[start, stop]`. Negative indexes count
    /// from the tail, as in Redis.
    async fn list_trim(&self, key: &str, start: isize, stop: isize) -> Result<()>;

    async fn list_range(&self, key: &str, start: isize, stop: isize) -> Result<Vec<String>>;

    async fn hash_get(&self, key: &str, field: &str) -> Result<Option<String>>;

    async fn hash_set(&self, key: &str, field: &str, value: &str) -> Result<()>;

    /// Atomically add `delta` to an integer hash field and return the new value.
    async fn hash_incr(&self, key: &str, field: &str, delta: i64) -> Result<i64>;
}
