//! Key-value backend contract used by [`CacheManager`](super::CacheManager).
//!
//! Any store with TTL expiry, atomic single-key get/set and set-valued keys
//! can back the cache. Two implementations ship with the crate:
//! [`MemoryBackend`](super::MemoryBackend) and, behind the `redis` feature,
//! [`RedisBackend`](super::RedisBackend).

use std::collections::HashSet;
use std::time::Duration;

use async_trait::async_trait;
use serde::Serialize;

use crate::{GovernorError, Result};

/// Backend-reported occupancy and counters.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct BackendStats {
    /// Approximate number of keys under the queried prefix.
    pub key_count: u64,
    /// Backend-wide lookup hits, when the backend tracks them.
    pub hits: Option<u64>,
    /// Backend-wide lookup misses, when the backend tracks them.
    pub misses: Option<u64>,
}

/// Object-safe async key-value store.
///
/// Every method reports backend failures as `Err`; the cache manager turns
/// those into misses, `false` or `0`. Keys passed in are already namespaced.
#[async_trait]
pub trait KeyValueBackend: Send + Sync {
    /// Short backend name for logs and health reports (e.g. `"memory"`).
    fn name(&self) -> &str;

    /// Establish (or re-establish) the connection.
    async fn connect(&self) -> Result<()>;

    /// Release the connection. Later calls fail until `connect` succeeds.
    async fn disconnect(&self) -> Result<()>;

    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>>;

    /// Store `value`, expiring after `ttl` when given. Returns whether it was stored.
    async fn set(&self, key: &str, value: Vec<u8>, ttl: Option<Duration>) -> Result<bool>;

    /// Replace the value of an existing key, expiring after `ttl` when given.
    ///
    /// Atomic with respect to `delete`: returns `false` and stores nothing
    /// when the key is absent.
    async fn set_if_exists(
        &self,
        key: &str,
        value: Vec<u8>,
        ttl: Option<Duration>,
    ) -> Result<bool>;

    /// Returns whether the key existed.
    async fn delete(&self, key: &str) -> Result<bool>;

    /// Delete several keys, returning how many existed.
    async fn delete_many(&self, keys: &[String]) -> Result<usize> {
        let results =
            futures_util::future::join_all(keys.iter().map(|key| self.delete(key))).await;
        let mut deleted = 0;
        for result in results {
            if result? {
                deleted += 1;
            }
        }
        Ok(deleted)
    }

    async fn exists(&self, key: &str) -> Result<bool>;

    /// Add `member` to the set stored at `set_key`, creating it if needed.
    async fn add_to_set(&self, set_key: &str, member: &str) -> Result<()>;

    /// Members of the set at `set_key`; empty when absent.
    async fn members_of(&self, set_key: &str) -> Result<HashSet<String>>;

    /// Set a key's time-to-live. Returns false if the key does not exist.
    async fn expire(&self, key: &str, ttl: Duration) -> Result<bool>;

    /// Remaining lifetime of a key; `None` when absent or persistent.
    async fn time_to_live(&self, key: &str) -> Result<Option<Duration>>;

    /// Delete every key starting with `prefix`, returning the count.
    async fn delete_prefix(&self, prefix: &str) -> Result<usize>;

    async fn stats(&self, prefix: &str) -> Result<BackendStats>;
}

/// Backend standing in for one that could not be configured.
///
/// Every call fails with the original configuration error, so a manager
/// built on it initializes to `Degraded` and serves as a pass-through.
pub(crate) struct UnavailableBackend {
    reason: String,
}

impl UnavailableBackend {
    pub(crate) fn new(reason: impl Into<String>) -> Self {
        Self {
            reason: reason.into(),
        }
    }

    fn fail<T>(&self) -> Result<T> {
        Err(GovernorError::Configuration(self.reason.clone()))
    }
}

#[async_trait]
impl KeyValueBackend for UnavailableBackend {
    fn name(&self) -> &str {
        "unavailable"
    }

    async fn connect(&self) -> Result<()> {
        self.fail()
    }

    async fn disconnect(&self) -> Result<()> {
        Ok(())
    }

    async fn get(&self, _key: &str) -> Result<Option<Vec<u8>>> {
        self.fail()
    }

    async fn set(&self, _key: &str, _value: Vec<u8>, _ttl: Option<Duration>) -> Result<bool> {
        self.fail()
    }

    async fn set_if_exists(
        &self,
        _key: &str,
        _value: Vec<u8>,
        _ttl: Option<Duration>,
    ) -> Result<bool> {
        self.fail()
    }

    async fn delete(&self, _key: &str) -> Result<bool> {
        self.fail()
    }

    async fn exists(&self, _key: &str) -> Result<bool> {
        self.fail()
    }

    async fn add_to_set(&self, _set_key: &str, _member: &str) -> Result<()> {
        self.fail()
    }

    async fn members_of(&self, _set_key: &str) -> Result<HashSet<String>> {
        self.fail()
    }

    async fn expire(&self, _key: &str, _ttl: Duration) -> Result<bool> {
        self.fail()
    }

    async fn time_to_live(&self, _key: &str) -> Result<Option<Duration>> {
        self.fail()
    }

    async fn delete_prefix(&self, _prefix: &str) -> Result<usize> {
        self.fail()
    }

    async fn stats(&self, _prefix: &str) -> Result<BackendStats> {
        self.fail()
    }
}
