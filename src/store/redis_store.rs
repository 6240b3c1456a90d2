//! Shared counter store backed by Redis.

use async_trait::async_trait;
use redis::aio::ConnectionManager;
use redis::Script;
use tracing::{debug, info};

use super::backend::{CounterHit, CounterStore};
use crate::error::Result;

/// Increment, set the expiry on first hit, and report the remaining TTL in one
/// server-side step. A key left without an expiry is given one so it cannot
/// live forever.
const INCREMENT_SCRIPT: &str = r"
local count = redis.call('INCR', KEYS[1])
if count == 1 then
  redis.call('PEXPIRE', KEYS[1], ARGV[1])
end
local ttl = redis.call('PTTL', KEYS[1])
if ttl < 0 then
  redis.call('PEXPIRE', KEYS[1], ARGV[1])
  ttl = tonumber(ARGV[1])
end
return {count, ttl}
";

/// A counter store shared by every instance pointing at the same Redis.
#[derive(Clone)]
pub struct RedisStore {
    conn: ConnectionManager,
    script: Script,
    key_prefix: String,
}

impl RedisStore {
    /// Connect to Redis at `url`, namespacing keys with `key_prefix`.
    pub async fn connect(url: &str, key_prefix: &str) -> Result<Self> {
        let client = redis::Client::open(url)?;
        let conn = ConnectionManager::new(client).await?;
        info!(key_prefix = %key_prefix, "Connected to Redis counter store");

        Ok(Self {
            conn,
            script: Script::new(INCREMENT_SCRIPT),
            key_prefix: key_prefix.to_string(),
        })
    }

    fn namespaced(&self, key: &str) -> String {
        format!("{}{}", self.key_prefix, key)
    }
}

#[async_trait]
impl CounterStore for RedisStore {
    async fn increment_and_get(&self, key: &str, window_ms: u64) -> Result<CounterHit> {
        let key = self.namespaced(key);
        let mut conn = self.conn.clone();

        let (count, ttl): (u64, i64) = self
            .script
            .key(&key)
            .arg(window_ms)
            .invoke_async(&mut conn)
            .await?;

        debug!(key = %key, count = count, ttl_ms = ttl, "Incremented Redis counter");

        Ok(CounterHit {
            count,
            ttl_remaining_ms: ttl.max(0) as u64,
        })
    }
}

impl std::fmt::Debug for RedisStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RedisStore")
            .field("key_prefix", &self.key_prefix)
            .finish()
    }
}
