//! Redis `SharedCache` backend

use std::time::Duration;

#[cfg(feature = "redis-storage")]
use async_trait::async_trait;

use recollect_core::{MemoryError, Result};
#[cfg(feature = "redis-storage")]
use recollect_core::SharedCache;

/// Deletes the key only while it still holds the caller's token.
#[cfg_attr(not(feature = "redis-storage"), allow(dead_code))]
const UNLOCK_SCRIPT: &str = r#"
if redis.call('get', KEYS[1]) == ARGV[1] then
  return redis.call('del', KEYS[1])
else
  return 0
end
"#;

/// Extends the key's TTL (milliseconds) only while it still holds the caller's token.
#[cfg_attr(not(feature = "redis-storage"), allow(dead_code))]
const RENEW_SCRIPT: &str = r#"
if redis.call('get', KEYS[1]) == ARGV[1] then
  return redis.call('pexpire', KEYS[1], ARGV[2])
else
  return 0
end
"#;

#[cfg(feature = "redis-storage")]
pub struct RedisCache {
    conn: redis::aio::ConnectionManager,
    unlock: redis::Script,
    renew: redis::Script,
}

#[cfg(feature = "redis-storage")]
fn map_redis_err(e: redis::RedisError) -> MemoryError {
    MemoryError::Cache(e.to_string())
}

#[cfg_attr(not(feature = "redis-storage"), allow(dead_code))]
fn ttl_millis(ttl: Duration) -> u64 {
    (ttl.as_millis() as u64).max(1)
}

#[cfg(feature = "redis-storage")]
impl RedisCache {
    pub async fn connect(url: &str) -> Result<Self> {
        let client = redis::Client::open(url).map_err(map_redis_err)?;
        let conn = redis::aio::ConnectionManager::new(client)
            .await
            .map_err(map_redis_err)?;
        Ok(Self {
            conn,
            unlock: redis::Script::new(UNLOCK_SCRIPT),
            renew: redis::Script::new(RENEW_SCRIPT),
        })
    }

    fn connection(&self) -> redis::aio::ConnectionManager {
        self.conn.clone()
    }
}

#[cfg(feature = "redis-storage")]
#[async_trait]
impl SharedCache for RedisCache {
    async fn set_if_absent(&self, key: &str, value: &str, ttl: Duration) -> Result<bool> {
        let mut conn = self.connection();
        let reply: Option<String> = redis::cmd("SET")
            .arg(key)
            .arg(value)
            .arg("NX")
            .arg("PX")
            .arg(ttl_millis(ttl))
            .query_async(&mut conn)
            .await
            .map_err(map_redis_err)?;
        Ok(reply.is_some())
    }

    async fn compare_and_delete(&self, key: &str, expected: &str) -> Result<bool> {
        let mut conn = self.connection();
        let deleted: i64 = self
            .unlock
            .key(key)
            .arg(expected)
            .invoke_async(&mut conn)
            .await
            .map_err(map_redis_err)?;
        Ok(deleted > 0)
    }

    async fn compare_and_expire(&self, key: &str, expected: &str, ttl: Duration) -> Result<bool> {
        let mut conn = self.connection();
        let renewed: i64 = self
            .renew
            .key(key)
            .arg(expected)
            .arg(ttl_millis(ttl))
            .invoke_async(&mut conn)
            .await
            .map_err(map_redis_err)?;
        Ok(renewed > 0)
    }

    async fn delete(&self, key: &str) -> Result<()> {
        let mut conn = self.connection();
        redis::cmd("DEL")
            .arg(key)
            .query_async::<()>(&mut conn)
            .await
            .map_err(map_redis_err)
    }

    async fn expire(&self, key: &str, ttl: Duration) -> Result<()> {
        let mut conn = self.connection();
        redis::cmd("PEXPIRE")
            .arg(key)
            .arg(ttl_millis(ttl))
            .query_async::<()>(&mut conn)
            .await
            .map_err(map_redis_err)
    }

    async fn list_push_front(&self, key: &str, value: &str) -> Result<()> {
        let mut conn = self.connection();
        redis::cmd("LPUSH")
            .arg(key)
            .arg(value)
            .query_async::<()>(&mut conn)
            .await
            .map_err(map_redis_err)
    }

    async fn list_push_back(&self, key: &str, values: &[String]) -> Result<()> {
        if values.is_empty() {
            return Ok(());
        }
        let mut conn = self.connection();
        redis::cmd("RPUSH")
            .arg(key)
            .arg(values)
            .query_async::<()>(&mut conn)
            .await
            .map_err(map_redis_err)
    }

    async fn list_trim(&self, key: &str, start: isize, stop: isize) -> Result<()> {
        let mut conn = self.connection();
        redis::cmd("LTRIM")
            .arg(key)
            .arg(start)
            .arg(stop)
            .query_async::<()>(&mut conn)
            .await
            .map_err(map_redis_err)
    }

    async fn list_range(&self, key: &str, start: isize, stop: isize) -> Result<Vec<String>> {
        let mut conn = self.connection();
        redis::cmd("LRANGE")
            .arg(key)
            .arg(start)
            .arg(stop)
            .query_async(&mut conn)
            .await
            .map_err(map_redis_err)
    }

    async fn hash_get(&self, key: &str, field: &str) -> Result<Option<String>> {
        let mut conn = self.connection();
        redis::cmd("HGET")
            .arg(key)
            .arg(field)
            .query_async(&mut conn)
            .await
            .map_err(map_redis_err)
    }

    async fn hash_set(&self, key: &str, field: &str, value: &str) -> Result<()> {
        let mut conn = self.connection();
        redis::cmd("HSET")
            .arg(key)
            .arg(field)
            .arg(value)
            .query_async::<()>(&mut conn)
            .await
            .map_err(map_redis_err)
    }

    async fn hash_incr(&self, key: &str, field: &str, delta: i64) -> Result<i64> {
        let mut conn = self.connection();
        redis::cmd("HINCRBY")
            .arg(key)
            .arg(field)
            .arg(delta)
            .query_async(&mut conn)
            .await
            .map_err(map_redis_err)
    }
}

#[cfg(not(feature = "redis-storage"))]
pub struct RedisCache {
    _private: (),
}

#[cfg(not(feature = "redis-storage"))]
impl RedisCache {
    pub async fn connect(_url: &str) -> Result<Self> {
        Err(MemoryError::Config(
            "Redis cache requires 'redis-storage' feature".to_string(),
        ))
    }
}
