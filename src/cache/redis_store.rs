//! Redis backend (feature `redis`).
//!
//! One multiplexed async connection shared by every operation; each call
//! clones the handle, which is cheap and lets requests pipeline over the
//! same socket.

use std::collections::HashSet;
use std::time::Duration;

use async_trait::async_trait;
use redis::aio::MultiplexedConnection;
use redis::{AsyncCommands, Client};
use tokio::sync::RwLock;
use tracing::{debug, info};

use super::backend::{BackendStats, KeyValueBackend};
use crate::{GovernorError, Result};

/// [`KeyValueBackend`] over a Redis server.
pub struct RedisBackend {
    client: Client,
    url: String,
    conn: RwLock<Option<MultiplexedConnection>>,
}

impl RedisBackend {
    /// Create a backend for `url` (`redis://` or `rediss://`).
    ///
    /// Only parses the address; no connection is made until `connect`.
    pub fn new(url: &str) -> Result<Self> {
        let client = Client::open(url)
            .map_err(|e| GovernorError::Configuration(format!("invalid redis url {url}: {e}")))?;
        Ok(Self {
            client,
            url: url.to_string(),
            conn: RwLock::new(None),
        })
    }

    async fn conn(&self) -> Result<MultiplexedConnection> {
        self.conn
            .read()
            .await
            .clone()
            .ok_or(GovernorError::NotConnected)
    }
}

/// Redis rejects zero-second expiries.
fn whole_secs(ttl: Duration) -> u64 {
    ttl.as_secs().max(1)
}

fn whole_millis(ttl: Duration) -> u64 {
    u64::try_from(ttl.as_millis()).unwrap_or(u64::MAX).max(1)
}

/// Pull a numeric field out of `INFO` output.
fn info_field(info: &str, field: &str) -> Option<u64> {
    info.lines().find_map(|line| {
        let (name, value) = line.split_once(':')?;
        (name == field).then(|| value.trim().parse().ok()).flatten()
    })
}

#[async_trait]
impl KeyValueBackend for RedisBackend {
    fn name(&self) -> &str {
        "redis"
    }

    async fn connect(&self) -> Result<()> {
        let mut conn = self.client.get_multiplexed_async_connection().await?;
        let _: String = redis::cmd("PING").query_async(&mut conn).await?;
        *self.conn.write().await = Some(conn);
        info!(url = %self.url, "connected to redis");
        Ok(())
    }

    async fn disconnect(&self) -> Result<()> {
        if self.conn.write().await.take().is_some() {
            info!(url = %self.url, "disconnected from redis");
        }
        Ok(())
    }

    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
        let mut conn = self.conn().await?;
        let value: Option<Vec<u8>> = conn.get(key).await?;
        Ok(value)
    }

    async fn set(&self, key: &str, value: Vec<u8>, ttl: Option<Duration>) -> Result<bool> {
        let mut conn = self.conn().await?;
        match ttl {
            Some(ttl) => {
                let _: () = conn.set_ex(key, value, whole_secs(ttl)).await?;
            }
            None => {
                let _: () = conn.set(key, value).await?;
            }
        }
        Ok(true)
    }

    async fn set_if_exists(
        &self,
        key: &str,
        value: Vec<u8>,
        ttl: Option<Duration>,
    ) -> Result<bool> {
        let mut conn = self.conn().await?;
        let mut cmd = redis::cmd("SET");
        cmd.arg(key).arg(value).arg("XX");
        if let Some(ttl) = ttl {
            cmd.arg("PX").arg(whole_millis(ttl));
        }
        let reply: Option<String> = cmd.query_async(&mut conn).await?;
        Ok(reply.is_some())
    }

    async fn delete(&self, key: &str) -> Result<bool> {
        let mut conn = self.conn().await?;
        let deleted: i64 = conn.del(key).await?;
        Ok(deleted > 0)
    }

    async fn delete_many(&self, keys: &[String]) -> Result<usize> {
        if keys.is_empty() {
            return Ok(0);
        }
        let mut conn = self.conn().await?;
        let deleted: i64 = conn.del(keys).await?;
        Ok(deleted.max(0) as usize)
    }

    async fn exists(&self, key: &str) -> Result<bool> {
        let mut conn = self.conn().await?;
        let exists: bool = conn.exists(key).await?;
        Ok(exists)
    }

    async fn add_to_set(&self, set_key: &str, member: &str) -> Result<()> {
        let mut conn = self.conn().await?;
        let _: i64 = conn.sadd(set_key, member).await?;
        Ok(())
    }

    async fn members_of(&self, set_key: &str) -> Result<HashSet<String>> {
        let mut conn = self.conn().await?;
        let members: HashSet<String> = conn.smembers(set_key).await?;
        Ok(members)
    }

    async fn expire(&self, key: &str, ttl: Duration) -> Result<bool> {
        let mut conn = self.conn().await?;
        let updated: bool = conn.expire(key, whole_secs(ttl) as i64).await?;
        Ok(updated)
    }

    async fn time_to_live(&self, key: &str) -> Result<Option<Duration>> {
        let mut conn = self.conn().await?;
        // -2: missing, -1: no expiry
        let secs: i64 = conn.ttl(key).await?;
        Ok((secs >= 0).then(|| Duration::from_secs(secs as u64)))
    }

    async fn delete_prefix(&self, prefix: &str) -> Result<usize> {
        let mut conn = self.conn().await?;
        let keys: Vec<String> = conn.keys(format!("{prefix}*")).await?;
        if keys.is_empty() {
            return Ok(0);
        }
        let deleted: i64 = conn.del(&keys).await?;
        debug!(prefix, deleted, "redis prefix cleared");
        Ok(deleted.max(0) as usize)
    }

    async fn stats(&self, prefix: &str) -> Result<BackendStats> {
        let mut conn = self.conn().await?;
        let keys: Vec<String> = conn.keys(format!("{prefix}*")).await?;
        let info: String = redis::cmd("INFO").arg("stats").query_async(&mut conn).await?;
        Ok(BackendStats {
            key_count: keys.len() as u64,
            hits: info_field(&info, "keyspace_hits"),
            misses: info_field(&info, "keyspace_misses"),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_info_counters() {
        let info = "# Stats\r\nkeyspace_hits:42\r\nkeyspace_misses:7\r\n";
        assert_eq!(info_field(info, "keyspace_hits"), Some(42));
        assert_eq!(info_field(info, "keyspace_misses"), Some(7));
        assert_eq!(info_field(info, "evicted_keys"), None);
    }

    #[test]
    fn expiries_never_round_to_zero() {
        assert_eq!(whole_secs(Duration::from_millis(300)), 1);
        assert_eq!(whole_millis(Duration::from_micros(10)), 1);
        assert_eq!(whole_millis(Duration::from_millis(2_900)), 2_900);
    }

    #[test]
    fn rejects_malformed_url() {
        assert!(matches!(
            RedisBackend::new("not a url"),
            Err(GovernorError::Configuration(_))
        ));
    }

    #[tokio::test]
    async fn operations_fail_before_connect() {
        let backend = RedisBackend::new("redis://127.0.0.1:6379").unwrap();
        assert!(matches!(
            backend.get("k").await,
            Err(GovernorError::NotConnected)
        ));
    }
}
