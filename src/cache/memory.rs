//! In-process backend on moka.

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use moka::Expiry;
use moka::future::Cache;
use moka::ops::compute::{CompResult, Op};
use tracing::{debug, info};

use super::backend::{BackendStats, KeyValueBackend};
use crate::{GovernorError, Result};

/// Default maximum number of keys held by a [`MemoryBackend`].
pub const DEFAULT_MEMORY_CAPACITY: u64 = 100_000;

#[derive(Debug, Clone)]
enum Stored {
    Bytes(Vec<u8>),
    Set(HashSet<String>),
}

/// A stored value plus its absolute deadline.
///
/// Carrying the deadline in the value lets set-membership updates keep the
/// remaining lifetime instead of restarting it.
#[derive(Debug, Clone)]
struct Slot {
    value: Stored,
    expires_at: Option<Instant>,
}

impl Slot {
    fn new(value: Stored, ttl: Option<Duration>) -> Self {
        Self {
            value,
            expires_at: ttl.map(|ttl| Instant::now() + ttl),
        }
    }

    fn remaining(&self, now: Instant) -> Option<Duration> {
        self.expires_at.map(|at| at.saturating_duration_since(now))
    }
}

struct SlotExpiry;

impl Expiry<String, Slot> for SlotExpiry {
    fn expire_after_create(&self, _key: &String, slot: &Slot, created_at: Instant) -> Option<Duration> {
        slot.remaining(created_at)
    }

    fn expire_after_update(
        &self,
        _key: &String,
        slot: &Slot,
        updated_at: Instant,
        _duration_until_expiry: Option<Duration>,
    ) -> Option<Duration> {
        slot.remaining(updated_at)
    }
}

/// In-process [`KeyValueBackend`] with per-key expiry.
///
/// Starts disconnected; [`connect`](KeyValueBackend::connect) must be called
/// first (the cache manager does this in `initialize`). While disconnected
/// every operation fails with [`GovernorError::NotConnected`], which makes
/// outage handling testable without a network store.
///
/// ```rust
/// # use lit_governor::{MemoryBackend, KeyValueBackend};
/// # #[tokio::main]
/// # async fn main() {
/// let backend = MemoryBackend::new();
/// backend.connect().await.unwrap();
/// backend.set("k", b"v".to_vec(), None).await.unwrap();
/// assert_eq!(backend.get("k").await.unwrap(), Some(b"v".to_vec()));
/// # }
/// ```
pub struct MemoryBackend {
    cache: Cache<String, Slot>,
    connected: AtomicBool,
    reachable: AtomicBool,
    hits: AtomicU64,
    misses: AtomicU64,
}

impl MemoryBackend {
    /// Create a backend holding up to [`DEFAULT_MEMORY_CAPACITY`] keys.
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_MEMORY_CAPACITY)
    }

    /// Create a backend with a custom key capacity.
    pub fn with_capacity(max_keys: u64) -> Self {
        let cache = Cache::builder()
            .max_capacity(max_keys)
            .expire_after(SlotExpiry)
            .build();
        Self {
            cache,
            connected: AtomicBool::new(false),
            reachable: AtomicBool::new(true),
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
        }
    }

    /// Simulate the store becoming (un)reachable.
    ///
    /// An unreachable backend drops its connection and refuses `connect`.
    /// Stored data survives, as it would on a restarted network store.
    pub fn set_reachable(&self, reachable: bool) {
        self.reachable.store(reachable, Ordering::SeqCst);
        if !reachable {
            self.connected.store(false, Ordering::SeqCst);
        }
    }

    /// Whether the backend is currently connected.
    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    fn ensure_connected(&self) -> Result<()> {
        if self.is_connected() {
            Ok(())
        } else {
            Err(GovernorError::NotConnected)
        }
    }
}

impl Default for MemoryBackend {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl KeyValueBackend for MemoryBackend {
    fn name(&self) -> &str {
        "memory"
    }

    async fn connect(&self) -> Result<()> {
        if !self.reachable.load(Ordering::SeqCst) {
            return Err(GovernorError::Backend(
                "memory backend is unreachable".to_string(),
            ));
        }
        self.connected.store(true, Ordering::SeqCst);
        debug!("memory backend connected");
        Ok(())
    }

    async fn disconnect(&self) -> Result<()> {
        self.connected.store(false, Ordering::SeqCst);
        debug!("memory backend disconnected");
        Ok(())
    }

    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
        self.ensure_connected()?;
        match self.cache.get(key).await {
            Some(Slot {
                value: Stored::Bytes(bytes),
                ..
            }) => {
                self.hits.fetch_add(1, Ordering::Relaxed);
                Ok(Some(bytes))
            }
            Some(_) => Err(GovernorError::Backend(format!(
                "key {key} holds a set, not a value"
            ))),
            None => {
                self.misses.fetch_add(1, Ordering::Relaxed);
                Ok(None)
            }
        }
    }

    async fn set(&self, key: &str, value: Vec<u8>, ttl: Option<Duration>) -> Result<bool> {
        self.ensure_connected()?;
        self.cache
            .insert(key.to_string(), Slot::new(Stored::Bytes(value), ttl))
            .await;
        Ok(true)
    }

    async fn set_if_exists(
        &self,
        key: &str,
        value: Vec<u8>,
        ttl: Option<Duration>,
    ) -> Result<bool> {
        self.ensure_connected()?;
        let mut wrong_type = false;
        let result = self
            .cache
            .entry(key.to_string())
            .and_compute_with(|existing| {
                let op = match existing.map(|entry| entry.into_value()) {
                    Some(Slot {
                        value: Stored::Bytes(_),
                        ..
                    }) => Op::Put(Slot::new(Stored::Bytes(value), ttl)),
                    Some(_) => {
                        wrong_type = true;
                        Op::Nop
                    }
                    None => Op::Nop,
                };
                std::future::ready(op)
            })
            .await;
        if wrong_type {
            return Err(GovernorError::Backend(format!(
                "key {key} holds a set, not a value"
            )));
        }
        Ok(matches!(result, CompResult::ReplacedWith(_)))
    }

    async fn delete(&self, key: &str) -> Result<bool> {
        self.ensure_connected()?;
        Ok(self.cache.remove(key).await.is_some())
    }

    async fn exists(&self, key: &str) -> Result<bool> {
        self.ensure_connected()?;
        Ok(self.cache.contains_key(key))
    }

    async fn add_to_set(&self, set_key: &str, member: &str) -> Result<()> {
        self.ensure_connected()?;
        let mut wrong_type = false;
        self.cache
            .entry(set_key.to_string())
            .and_compute_with(|existing| {
                let op = match existing.map(|entry| entry.into_value()) {
                    Some(Slot {
                        value: Stored::Set(mut members),
                        expires_at,
                    }) => {
                        if members.insert(member.to_string()) {
                            Op::Put(Slot {
                                value: Stored::Set(members),
                                expires_at,
                            })
                        } else {
                            Op::Nop
                        }
                    }
                    Some(_) => {
                        wrong_type = true;
                        Op::Nop
                    }
                    None => Op::Put(Slot::new(
                        Stored::Set(HashSet::from([member.to_string()])),
                        None,
                    )),
                };
                std::future::ready(op)
            })
            .await;
        if wrong_type {
            return Err(GovernorError::Backend(format!(
                "key {set_key} holds a value, not a set"
            )));
        }
        Ok(())
    }

    async fn members_of(&self, set_key: &str) -> Result<HashSet<String>> {
        self.ensure_connected()?;
        match self.cache.get(set_key).await {
            Some(Slot {
                value: Stored::Set(members),
                ..
            }) => Ok(members),
            Some(_) => Err(GovernorError::Backend(format!(
                "key {set_key} holds a value, not a set"
            ))),
            None => Ok(HashSet::new()),
        }
    }

    async fn expire(&self, key: &str, ttl: Duration) -> Result<bool> {
        self.ensure_connected()?;
        let result = self
            .cache
            .entry(key.to_string())
            .and_compute_with(|existing| {
                let op = match existing {
                    Some(entry) => Op::Put(Slot {
                        expires_at: Some(Instant::now() + ttl),
                        ..entry.into_value()
                    }),
                    None => Op::Nop,
                };
                std::future::ready(op)
            })
            .await;
        Ok(result.into_entry().is_some())
    }

    async fn time_to_live(&self, key: &str) -> Result<Option<Duration>> {
        self.ensure_connected()?;
        Ok(self
            .cache
            .get(key)
            .await
            .and_then(|slot| slot.remaining(Instant::now())))
    }

    async fn delete_prefix(&self, prefix: &str) -> Result<usize> {
        self.ensure_connected()?;
        let keys: Vec<String> = self
            .cache
            .iter()
            .filter(|(key, _)| key.starts_with(prefix))
            .map(|(key, _)| key.as_ref().clone())
            .collect();
        let mut deleted = 0;
        for key in &keys {
            if self.cache.remove(key).await.is_some() {
                deleted += 1;
            }
        }
        info!(prefix, deleted, "memory backend prefix cleared");
        Ok(deleted)
    }

    async fn stats(&self, prefix: &str) -> Result<BackendStats> {
        self.ensure_connected()?;
        let key_count = self
            .cache
            .iter()
            .filter(|(key, _)| key.starts_with(prefix))
            .count() as u64;
        Ok(BackendStats {
            key_count,
            hits: Some(self.hits.load(Ordering::Relaxed)),
            misses: Some(self.misses.load(Ordering::Relaxed)),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn connected() -> MemoryBackend {
        let backend = MemoryBackend::new();
        backend.connect().await.unwrap();
        backend
    }

    #[tokio::test]
    async fn operations_fail_until_connected() {
        let backend = MemoryBackend::new();
        assert!(matches!(
            backend.get("k").await,
            Err(GovernorError::NotConnected)
        ));
        backend.connect().await.unwrap();
        assert_eq!(backend.get("k").await.unwrap(), None);
    }

    #[tokio::test]
    async fn unreachable_refuses_connect() {
        let backend = connected().await;
        backend.set_reachable(false);
        assert!(!backend.is_connected());
        assert!(backend.connect().await.is_err());
        backend.set_reachable(true);
        assert!(backend.connect().await.is_ok());
    }

    #[tokio::test]
    async fn add_to_set_keeps_deadline() {
        let backend = connected().await;
        backend.add_to_set("tags", "a").await.unwrap();
        assert!(backend.expire("tags", Duration::from_secs(100)).await.unwrap());
        backend.add_to_set("tags", "b").await.unwrap();

        let ttl = backend.time_to_live("tags").await.unwrap().unwrap();
        assert!(ttl <= Duration::from_secs(100));
        assert!(ttl > Duration::from_secs(90));
        assert_eq!(backend.members_of("tags").await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn expire_missing_key_is_false() {
        let backend = connected().await;
        assert!(!backend.expire("nope", Duration::from_secs(1)).await.unwrap());
    }

    #[tokio::test]
    async fn set_if_exists_skips_missing_keys() {
        let backend = connected().await;
        assert!(!backend.set_if_exists("k", b"x".to_vec(), None).await.unwrap());
        assert_eq!(backend.get("k").await.unwrap(), None);

        backend.set("k", b"a".to_vec(), None).await.unwrap();
        assert!(backend
            .set_if_exists("k", b"b".to_vec(), Some(Duration::from_secs(30)))
            .await
            .unwrap());
        assert_eq!(backend.get("k").await.unwrap(), Some(b"b".to_vec()));
        let ttl = backend.time_to_live("k").await.unwrap().unwrap();
        assert!(ttl <= Duration::from_secs(30));

        backend.add_to_set("s", "m").await.unwrap();
        assert!(backend.set_if_exists("s", b"x".to_vec(), None).await.is_err());
    }

    #[tokio::test]
    async fn set_ops_on_value_key_fail() {
        let backend = connected().await;
        backend.set("plain", b"x".to_vec(), None).await.unwrap();
        assert!(backend.add_to_set("plain", "m").await.is_err());
        assert!(backend.members_of("plain").await.is_err());
    }
}
