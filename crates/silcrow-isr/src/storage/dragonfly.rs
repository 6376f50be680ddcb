//! Dragonfly (Redis-compatible) key-value store for the KV cache adapter

use crate::storage::kv::KvStore;
use anyhow::{Context, Result};
use async_trait::async_trait;
use redis::aio::ConnectionManager;
use redis::{AsyncCommands, Client};
use std::time::Duration;

/// [`KvStore`] over a Dragonfly or Redis server.
///
/// Key namespacing is left to [`KvAdapter`](crate::storage::kv::KvAdapter);
/// this type speaks raw keys.
#[derive(Clone)]
pub struct RedisKvStore {
    manager: ConnectionManager,
}

impl RedisKvStore {
    pub async fn connect(url: &str) -> Result<Self> {
        let client = Client::open(url).context("Failed to create Redis/Dragonfly client")?;

        let manager = ConnectionManager::new(client)
            .await
            .context("Failed to create connection manager")?;

        Ok(Self { manager })
    }

    /// Test connection to Dragonfly/Redis
    pub async fn ping(&self) -> Result<bool> {
        let mut conn = self.manager.clone();
        let pong: String = redis::cmd("PING")
            .query_async(&mut conn)
            .await
            .context("Failed to ping Redis/Dragonfly")?;

        Ok(pong == "PONG")
    }
}

fn ttl_secs(ttl: Duration) -> u64 {
    ttl.as_secs().max(1)
}

#[async_trait]
impl KvStore for RedisKvStore {
    async fn get(&self, key: &str) -> Result<Option<String>> {
        let mut conn = self.manager.clone();
        conn.get(key)
            .await
            .context("Failed to get from Redis/Dragonfly")
    }

    async fn set(&self, key: &str, value: String, ttl: Option<Duration>) -> Result<()> {
        let mut conn = self.manager.clone();
        let mut cmd = redis::cmd("SET");
        cmd.arg(key).arg(value);
        if let Some(ttl) = ttl {
            cmd.arg("EX").arg(ttl_secs(ttl));
        }
        cmd.query_async::<_, ()>(&mut conn)
            .await
            .context("Failed to set in Redis/Dragonfly")
    }

    async fn expire(&self, key: &str, ttl: Option<Duration>) -> Result<()> {
        let mut conn = self.manager.clone();
        let cmd = match ttl {
            Some(ttl) => {
                let mut cmd = redis::cmd("EXPIRE");
                cmd.arg(key).arg(ttl_secs(ttl));
                cmd
            }
            None => {
                let mut cmd = redis::cmd("PERSIST");
                cmd.arg(key);
                cmd
            }
        };
        cmd.query_async::<_, i64>(&mut conn)
            .await
            .context("Failed to update expiry in Redis/Dragonfly")?;
        Ok(())
    }

    async fn del(&self, keys: &[String]) -> Result<usize> {
        if keys.is_empty() {
            return Ok(0);
        }
        let mut conn = self.manager.clone();
        conn.del(keys)
            .await
            .context("Failed to delete from Redis/Dragonfly")
    }

    async fn exists(&self, key: &str) -> Result<bool> {
        let mut conn = self.manager.clone();
        conn.exists(key)
            .await
            .context("Failed to check existence in Redis/Dragonfly")
    }

    async fn sadd(&self, key: &str, member: &str) -> Result<()> {
        let mut conn = self.manager.clone();
        let _: i64 = conn
            .sadd(key, member)
            .await
            .context("Failed to add set member")?;
        Ok(())
    }

    async fn srem(&self, key: &str, member: &str) -> Result<()> {
        let mut conn = self.manager.clone();
        let _: i64 = conn
            .srem(key, member)
            .await
            .context("Failed to remove set member")?;
        Ok(())
    }

    async fn smembers(&self, key: &str) -> Result<Vec<String>> {
        let mut conn = self.manager.clone();
        conn.smembers(key)
            .await
            .context("Failed to read set members")
    }

    async fn keys_with_prefix(&self, prefix: &str) -> Result<Vec<String>> {
        let mut conn = self.manager.clone();
        let mut iter = conn
            .scan_match::<_, String>(match_pattern(prefix))
            .await
            .context("Failed to scan keys")?;

        let mut keys = Vec::new();
        while let Some(key) = iter.next_item().await {
            keys.push(key);
        }
        // SCAN may return a key more than once.
        keys.sort_unstable();
        keys.dedup();
        Ok(keys)
    }
}

/// SCAN `MATCH` glob for keys starting with `prefix`
fn match_pattern(prefix: &str) -> String {
    let mut pattern = String::with_capacity(prefix.len() + 1);
    for c in prefix.chars() {
        if matches!(c, '*' | '?' | '[' | ']' | '\\') {
            pattern.push('\\');
        }
        pattern.push(c);
    }
    pattern.push('*');
    pattern
}
