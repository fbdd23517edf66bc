//! Process-local `SharedCache` backend

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use parking_lot::Mutex;

use recollect_core::{MemoryError, Result, SharedCache};

/// In-process cache with Redis-like semantics and TTLs.
///
/// Every operation runs under one mutex, so the conditional primitives are
/// atomic. Clones share state, which lets tests model several service
/// instances talking to the same cache.
#[derive(Clone, Default)]
pub struct InMemoryCache {
    entries: Arc<Mutex<HashMap<String, Entry>>>,
}

struct Entry {
    value: Value,
    expires_at: Option<Instant>,
}

enum Value {
    Str(String),
    List(VecDeque<String>),
    Hash(HashMap<String, String>),
}

impl Entry {
    fn is_expired(&self, now: Instant) -> bool {
        self.expires_at.is_some_and(|at| at <= now)
    }
}

fn wrong_type(key: &str) -> MemoryError {
    MemoryError::Cache(format!(
        "WRONGTYPE operation against key '{}' holding the wrong kind of value",
        key
    ))
}

/// Resolve Redis-style inclusive indexes against a list length.
fn resolve_range(len: usize, start: isize, stop: isize) -> Option<(usize, usize)> {
    let len = len as isize;
    let start = if start < 0 { (len + start).max(0) } else { start };
    let stop = if stop < 0 { len + stop } else { stop.min(len - 1) };
    if len == 0 || start > stop || start >= len {
        return None;
    }
    Some((start as usize, stop as usize))
}

impl InMemoryCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of live keys.
    pub fn len(&self) -> usize {
        let now = Instant::now();
        self.entries
            .lock()
            .values()
            .filter(|e| !e.is_expired(now))
            .count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Remaining TTL of a key, `None` when absent or persistent.
    pub fn ttl(&self, key: &str) -> Option<Duration> {
        let now = Instant::now();
        let entries = self.entries.lock();
        let entry = entries.get(key).filter(|e| !e.is_expired(now))?;
        entry.expires_at.map(|at| at.saturating_duration_since(now))
    }

    /// Drop every key, simulating a cache flush or failover.
    pub fn flush(&self) {
        self.entries.lock().clear();
    }

    fn with_live<R>(&self, key: &str, f: impl FnOnce(Option<&mut Entry>) -> R) -> R {
        let now = Instant::now();
        let mut entries = self.entries.lock();
        if entries.get(key).is_some_and(|e| e.is_expired(now)) {
            entries.remove(key);
        }
        f(entries.get_mut(key))
    }

    fn with_entry<R>(
        &self,
        key: &str,
        init: impl FnOnce() -> Value,
        f: impl FnOnce(&mut Entry) -> R,
    ) -> R {
        let now = Instant::now();
        let mut entries = self.entries.lock();
        if entries.get(key).is_some_and(|e| e.is_expired(now)) {
            entries.remove(key);
        }
        let entry = entries.entry(key.to_string()).or_insert_with(|| Entry {
            value: init(),
            expires_at: None,
        });
        f(entry)
    }
}

#[async_trait]
impl SharedCache for InMemoryCache {
    async fn set_if_absent(&self, key: &str, value: &str, ttl: Duration) -> Result<bool> {
        let now = Instant::now();
        let mut entries = self.entries.lock();
        if entries.get(key).is_some_and(|e| !e.is_expired(now)) {
            return Ok(false);
        }
        entries.insert(
            key.to_string(),
            Entry {
                value: Value::Str(value.to_string()),
                expires_at: Some(now + ttl),
            },
        );
        Ok(true)
    }

    async fn compare_and_delete(&self, key: &str, expected: &str) -> Result<bool> {
        let now = Instant::now();
        let mut entries = self.entries.lock();
        let matches = matches!(
            entries.get(key),
            Some(Entry { value: Value::Str(v), expires_at }) if v == expected
                && !expires_at.is_some_and(|at| at <= now)
        );
        if matches {
            entries.remove(key);
        }
        Ok(matches)
    }

    async fn compare_and_expire(&self, key: &str, expected: &str, ttl: Duration) -> Result<bool> {
        let now = Instant::now();
        let mut entries = self.entries.lock();
        match entries.get_mut(key) {
            Some(entry) if !entry.is_expired(now) => match &entry.value {
                Value::Str(v) if v == expected => {
                    entry.expires_at = Some(now + ttl);
                    Ok(true)
                }
                _ => Ok(false),
            },
            _ => Ok(false),
        }
    }

    async fn delete(&self, key: &str) -> Result<()> {
        self.entries.lock().remove(key);
        Ok(())
    }

    async fn expire(&self, key: &str, ttl: Duration) -> Result<()> {
        self.with_live(key, |entry| {
            if let Some(entry) = entry {
                entry.expires_at = Some(Instant::now() + ttl);
            }
        });
        Ok(())
    }

    async fn list_push_front(&self, key: &str, value: &str) -> Result<()> {
        self.with_entry(
            key,
            || Value::List(VecDeque::new()),
            |entry| match &mut entry.value {
                Value::List(list) => {
                    list.push_front(value.to_string());
                    Ok(())
                }
                _ => Err(wrong_type(key)),
            },
        )
    }

    async fn list_push_back(&self, key: &str, values: &[String]) -> Result<()> {
        if values.is_empty() {
            return Ok(());
        }
        self.with_entry(
            key,
            || Value::List(VecDeque::new()),
            |entry| match &mut entry.value {
                Value::List(list) => {
                    list.extend(values.iter().cloned());
                    Ok(())
                }
                _ => Err(wrong_type(key)),
            },
        )
    }

    async fn list_trim(&self, key: &str, start: isize, stop: isize) -> Result<()> {
        let now = Instant::now();
        let mut entries = self.entries.lock();
        let Some(entry) = entries.get_mut(key).filter(|e| !e.is_expired(now)) else {
            return Ok(());
        };
        let Value::List(list) = &mut entry.value else {
            return Err(wrong_type(key));
        };
        match resolve_range(list.len(), start, stop) {
            Some((from, to)) => {
                list.truncate(to + 1);
                list.drain(..from);
                Ok(())
            }
            None => {
                entries.remove(key);
                Ok(())
            }
        }
    }

    async fn list_range(&self, key: &str, start: isize, stop: isize) -> Result<Vec<String>> {
        self.with_live(key, |entry| match entry {
            None => Ok(Vec::new()),
            Some(Entry {
                value: Value::List(list),
                ..
            }) => Ok(match resolve_range(list.len(), start, stop) {
                Some((from, to)) => list.range(from..=to).cloned().collect(),
                None => Vec::new(),
            }),
            Some(_) => Err(wrong_type(key)),
        })
    }

    async fn hash_get(&self, key: &str, field: &str) -> Result<Option<String>> {
        self.with_live(key, |entry| match entry {
            None => Ok(None),
            Some(Entry {
                value: Value::Hash(map),
                ..
            }) => Ok(map.get(field).cloned()),
            Some(_) => Err(wrong_type(key)),
        })
    }

    async fn hash_set(&self, key: &str, field: &str, value: &str) -> Result<()> {
        self.with_entry(
            key,
            || Value::Hash(HashMap::new()),
            |entry| match &mut entry.value {
                Value::Hash(map) => {
                    map.insert(field.to_string(), value.to_string());
                    Ok(())
                }
                _ => Err(wrong_type(key)),
            },
        )
    }

    async fn hash_incr(&self, key: &str, field: &str, delta: i64) -> Result<i64> {
        self.with_entry(
            key,
            || Value::Hash(HashMap::new()),
            |entry| match &mut entry.value {
                Value::Hash(map) => {
                    let current = match map.get(field) {
                        Some(raw) => raw.parse::<i64>().map_err(|_| {
                            MemoryError::Cache(format!(
                                "hash value at '{}'/'{}' is not an integer",
                                key, field
                            ))
                        })?,
                        None => 0,
                    };
                    let next = current + delta;
                    map.insert(field.to_string(), next.to_string());
                    Ok(next)
                }
                _ => Err(wrong_type(key)),
            },
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const TTL: Duration = Duration::from_secs(60);

    #[tokio::test]
    async fn test_set_if_absent_is_exclusive() {
        let cache = InMemoryCache::new();
        assert!(cache.set_if_absent("lock", "a", TTL).await.unwrap());
        assert!(!cache.set_if_absent("lock", "b", TTL).await.unwrap());
        assert!(cache.ttl("lock").is_some());
    }

    #[tokio::test]
    async fn test_set_if_absent_after_expiry() {
        let cache = InMemoryCache::new();
        assert!(cache
            .set_if_absent("lock", "a", Duration::from_millis(20))
            .await
            .unwrap());
        tokio::time::sleep(Duration::from_millis(40)).await;
        assert!(cache.set_if_absent("lock", "b", TTL).await.unwrap());
        assert!(!cache.compare_and_delete("lock", "a").await.unwrap());
        assert!(cache.compare_and_delete("lock", "b").await.unwrap());
    }

    #[tokio::test]
    async fn test_compare_and_expire_requires_owner() {
        let cache = InMemoryCache::new();
        cache
            .set_if_absent("lock", "owner", Duration::from_millis(50))
            .await
            .unwrap();
        assert!(!cache.compare_and_expire("lock", "thief", TTL).await.unwrap());
        assert!(cache.compare_and_expire("lock", "owner", TTL).await.unwrap());
        assert!(cache.ttl("lock").unwrap() > Duration::from_secs(30));
    }

    #[tokio::test]
    async fn test_list_push_trim_range() {
        let cache = InMemoryCache::new();
        cache
            .list_push_back("l", &["b".to_string(), "c".to_string(), "d".to_string()])
            .await
            .unwrap();
        cache.list_push_front("l", "a").await.unwrap();
        assert_eq!(
            cache.list_range("l", 0, -1).await.unwrap(),
            vec!["a", "b", "c", "d"]
        );

        cache.list_trim("l", 0, 1).await.unwrap();
        assert_eq!(cache.list_range("l", 0, -1).await.unwrap(), vec!["a", "b"]);
        assert_eq!(cache.list_range("l", 0, 9).await.unwrap(), vec!["a", "b"]);
        assert!(cache.list_range("missing", 0, 9).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_hash_incr_and_set() {
        let cache = InMemoryCache::new();
        assert_eq!(cache.hash_incr("h", "n", 1).await.unwrap(), 1);
        assert_eq!(cache.hash_incr("h", "n", 2).await.unwrap(), 3);
        cache.hash_set("h", "n", "0").await.unwrap();
        assert_eq!(cache.hash_get("h", "n").await.unwrap().as_deref(), Some("0"));
        assert_eq!(cache.hash_get("h", "other").await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_wrong_type_is_cache_error() {
        let cache = InMemoryCache::new();
        cache.hash_set("k", "f", "1").await.unwrap();
        let err = cache.list_push_front("k", "x").await.unwrap_err();
        assert!(matches!(err, MemoryError::Cache(_)));
    }

    #[tokio::test]
    async fn test_clones_share_state() {
        let cache = InMemoryCache::new();
        let other = cache.clone();
        cache.hash_set("h", "f", "v").await.unwrap();
        assert_eq!(other.hash_get("h", "f").await.unwrap().as_deref(), Some("v"));
        other.flush();
        assert!(cache.is_empty());
    }
}
