//! Category-aware cache manager over a [`KeyValueBackend`].
//!
//! # Failure model
//!
//! A cache must never become a single point of failure, so backend errors
//! and timeouts never reach callers: `get` misses, `set` and `delete` return
//! `false`, counts are `0`. Each such failure is logged at `warn!` and
//! counted in `lit_governor_cache_errors_total{operation}`. Only contract
//! violations (empty category, identifier or tag, the reserved `tag`
//! category, zero TTL) return `Err`.
//!
//! # Tag index
//!
//! Each tag owns a set key `<prefix>tag:<tag>` listing the data keys that
//! carry it. A hit's write-back only touches keys that still exist, so it
//! cannot resurrect an entry invalidated after it was read. The set's lifetime is only ever extended to cover its
//! longest-lived member. Invalidation deletes the data keys before the set,
//! so a crash midway leaves a set pointing at already-deleted keys rather
//! than live data the index no longer knows about.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::json;
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

use super::backend::{BackendStats, KeyValueBackend};
use super::category::{CacheCategory, TtlTable};
use super::entry::CacheEntry;
use super::key::{self, CacheIdentifier};
use crate::telemetry;
use crate::{GovernorError, Result};

/// Default namespace for every key the manager writes.
pub const DEFAULT_KEY_PREFIX: &str = "litreview:v1:";

/// Default per-operation backend timeout.
pub const DEFAULT_OPERATION_TIMEOUT: Duration = Duration::from_secs(2);

/// Lifetime of the health-check probe key.
const PROBE_TTL: Duration = Duration::from_secs(60);

/// Lifecycle state of a [`CacheManager`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CacheState {
    Uninitialized,
    Initializing,
    /// Backend connected; operations hit the store.
    Ready,
    /// Backend unreachable; every operation is a safe no-op.
    Degraded,
    Shutdown,
}

impl CacheState {
    pub fn as_str(&self) -> &'static str {
        match self {
            CacheState::Uninitialized => "uninitialized",
            CacheState::Initializing => "initializing",
            CacheState::Ready => "ready",
            CacheState::Degraded => "degraded",
            CacheState::Shutdown => "shutdown",
        }
    }
}

impl fmt::Display for CacheState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Overall cache health.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HealthStatus {
    /// Probe round-tripped exactly.
    Healthy,
    /// Backend answered, but with unexpected content.
    Degraded,
    /// Backend failed or the manager is not ready.
    Unhealthy,
}

/// Result of [`CacheManager::health_check`].
#[derive(Debug, Clone, Serialize)]
pub struct CacheHealth {
    pub status: HealthStatus,
    pub backend: String,
    pub state: CacheState,
    pub error: Option<String>,
    pub response_time_ms: Option<f64>,
    pub timestamp: DateTime<Utc>,
}

/// Result of [`CacheManager::stats`].
#[derive(Debug, Clone, Serialize)]
pub struct CacheManagerStats {
    pub state: CacheState,
    pub backend: String,
    pub key_prefix: String,
    /// Backend counters; `None` when unavailable.
    pub backend_stats: Option<BackendStats>,
    pub error: Option<String>,
    /// Effective category → TTL seconds.
    pub ttl: BTreeMap<String, u64>,
}

/// Cache front-end: namespaced keys, category TTLs, tag invalidation.
///
/// ```rust
/// # use std::sync::Arc;
/// # use lit_governor::{CacheManager, MemoryBackend};
/// # #[tokio::main]
/// # async fn main() -> lit_governor::Result<()> {
/// let cache = CacheManager::new(Arc::new(MemoryBackend::new()));
/// assert!(cache.initialize().await);
///
/// cache
///     .set("search_results", "q1", &serde_json::json!({"x": 1}), None, &["arxiv"])
///     .await?;
/// let hit: Option<serde_json::Value> = cache.get("search_results", "q1").await?;
/// assert_eq!(hit, Some(serde_json::json!({"x": 1})));
///
/// assert_eq!(cache.invalidate_by_tag("arxiv").await?, 1);
/// # Ok(())
/// # }
/// ```
pub struct CacheManager {
    backend: Arc<dyn KeyValueBackend>,
    key_prefix: String,
    ttls: TtlTable,
    operation_timeout: Duration,
    state: RwLock<CacheState>,
}

impl CacheManager {
    /// Create an uninitialized manager over `backend`.
    pub fn new(backend: Arc<dyn KeyValueBackend>) -> Self {
        Self {
            backend,
            key_prefix: DEFAULT_KEY_PREFIX.to_string(),
            ttls: TtlTable::new(),
            operation_timeout: DEFAULT_OPERATION_TIMEOUT,
            state: RwLock::new(CacheState::Uninitialized),
        }
    }

    /// Set the key namespace. Default: `"litreview:v1:"`.
    pub fn key_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.key_prefix = prefix.into();
        self
    }

    /// Override the default lifetime of one category.
    pub fn category_ttl(mut self, category: impl Into<String>, ttl: Duration) -> Self {
        self.ttls.set(category, ttl);
        self
    }

    /// Replace the whole TTL table.
    pub fn ttl_table(mut self, ttls: TtlTable) -> Self {
        self.ttls = ttls;
        self
    }

    /// Bound every backend call. Default: 2 seconds.
    pub fn operation_timeout(mut self, timeout: Duration) -> Self {
        self.operation_timeout = timeout;
        self
    }

    pub fn backend_name(&self) -> &str {
        self.backend.name()
    }

    pub fn prefix(&self) -> &str {
        &self.key_prefix
    }

    pub fn ttls(&self) -> &TtlTable {
        &self.ttls
    }

    /// Default lifetime for `category`.
    pub fn ttl_for(&self, category: &str) -> Duration {
        self.ttls.ttl_for(category)
    }

    pub async fn state(&self) -> CacheState {
        *self.state.read().await
    }

    pub async fn is_ready(&self) -> bool {
        self.state().await == CacheState::Ready
    }

    // =========================================================================
    // Lifecycle
    // =========================================================================

    /// Connect the backend.
    ///
    /// Returns `false` on failure, leaving the manager `Degraded`. Valid
    /// from any state, including after [`shutdown`](Self::shutdown).
    pub async fn initialize(&self) -> bool {
        *self.state.write().await = CacheState::Initializing;

        let connect = self.call("connect", self.backend.connect()).await;
        let next = match connect {
            Ok(()) => {
                info!(backend = self.backend.name(), prefix = %self.key_prefix, "cache manager initialized");
                CacheState::Ready
            }
            Err(e) => {
                warn!(backend = self.backend.name(), error = %e, "cache manager initialization failed, running uncached");
                CacheState::Degraded
            }
        };
        *self.state.write().await = next;
        next == CacheState::Ready
    }

    /// Release the backend connection.
    pub async fn shutdown(&self) {
        if let Err(e) = self.call("disconnect", self.backend.disconnect()).await {
            warn!(backend = self.backend.name(), error = %e, "cache backend disconnect failed");
        }
        *self.state.write().await = CacheState::Shutdown;
        info!(backend = self.backend.name(), "cache manager shutdown completed");
    }

    // =========================================================================
    // Core operations
    // =========================================================================

    /// Look up a cached value.
    ///
    /// `Ok(None)` on miss, backend failure, non-ready state, or a stored
    /// value that does not deserialize as `T`. A hit bumps the entry's
    /// hit count best-effort.
    pub async fn get<T: DeserializeOwned>(
        &self,
        category: &str,
        identifier: impl Into<CacheIdentifier>,
    ) -> Result<Option<T>> {
        let key = key::data_key(&self.key_prefix, category, &identifier.into())?;
        let state = self.state().await;
        if state != CacheState::Ready {
            debug!(%key, %state, "cache not ready, treating as miss");
            record_miss(category);
            return Ok(None);
        }

        let bytes = match self.call("get", self.backend.get(&key)).await {
            Ok(Some(bytes)) => bytes,
            Ok(None) => {
                debug!(%key, "cache miss");
                record_miss(category);
                return Ok(None);
            }
            Err(e) => {
                self.backend_failure("get", &key, &e);
                record_miss(category);
                return Ok(None);
            }
        };

        let mut entry = match CacheEntry::from_bytes(&bytes) {
            Ok(entry) => entry,
            Err(e) => {
                warn!(%key, error = %e, "corrupt cache entry, treating as miss");
                record_miss(category);
                return Ok(None);
            }
        };

        let value = match serde_json::from_value::<T>(entry.data.clone()) {
            Ok(value) => value,
            Err(e) => {
                warn!(%key, error = %e, "cached value has unexpected shape, treating as miss");
                record_miss(category);
                return Ok(None);
            }
        };

        debug!(%key, hits = entry.hit_count + 1, "cache hit");
        metrics::counter!(telemetry::CACHE_HITS_TOTAL, "category" => category.to_string())
            .increment(1);

        entry.hit_count += 1;
        self.record_hit(&key, &entry).await;

        Ok(Some(value))
    }

    /// Store a value under the category's TTL (or `ttl` when given),
    /// indexed under each of `tags`.
    ///
    /// Returns whether the value and all its tag memberships were stored.
    /// Fails only on contract violations or a value that cannot be
    /// serialized to JSON.
    /// If tag indexing fails the data key is removed again, so an entry is
    /// never live without being reachable from its tags.
    pub async fn set<T: Serialize + ?Sized>(
        &self,
        category: &str,
        identifier: impl Into<CacheIdentifier>,
        value: &T,
        ttl: Option<Duration>,
        tags: &[&str],
    ) -> Result<bool> {
        let key = key::data_key(&self.key_prefix, category, &identifier.into())?;
        if tags.iter().any(|tag| tag.is_empty()) {
            return Err(GovernorError::InvalidInput(
                "cache tags must not be empty".to_string(),
            ));
        }
        let ttl = ttl.unwrap_or_else(|| self.ttls.ttl_for(category));
        if ttl.is_zero() {
            return Err(GovernorError::InvalidInput(
                "cache ttl must be greater than zero".to_string(),
            ));
        }

        let tags: BTreeSet<String> = tags.iter().map(|tag| tag.to_string()).collect();
        let entry = CacheEntry::new(serde_json::to_value(value)?, Some(ttl), tags);
        let bytes = entry.to_bytes()?;

        if !self.is_ready().await {
            debug!(%key, "cache not ready, not storing");
            return Ok(false);
        }

        match self.call("set", self.backend.set(&key, bytes, Some(ttl))).await {
            Ok(true) => {}
            Ok(false) => return Ok(false),
            Err(e) => {
                self.backend_failure("set", &key, &e);
                return Ok(false);
            }
        }

        for tag in &entry.tags {
            if let Err(e) = self.index_tag(tag, &key, ttl).await {
                self.backend_failure("tag", &key, &e);
                if let Err(e) = self.call("delete", self.backend.delete(&key)).await {
                    self.backend_failure("delete", &key, &e);
                }
                return Ok(false);
            }
        }

        debug!(%key, ttl_secs = ttl.as_secs(), tags = entry.tags.len(), "cache set");
        Ok(true)
    }

    /// Remove one entry. Returns whether it existed.
    pub async fn delete(
        &self,
        category: &str,
        identifier: impl Into<CacheIdentifier>,
    ) -> Result<bool> {
        let key = key::data_key(&self.key_prefix, category, &identifier.into())?;
        if !self.is_ready().await {
            return Ok(false);
        }
        match self.call("delete", self.backend.delete(&key)).await {
            Ok(deleted) => {
                debug!(%key, deleted, "cache delete");
                Ok(deleted)
            }
            Err(e) => {
                self.backend_failure("delete", &key, &e);
                Ok(false)
            }
        }
    }

    /// Whether an entry is currently stored.
    pub async fn exists(
        &self,
        category: &str,
        identifier: impl Into<CacheIdentifier>,
    ) -> Result<bool> {
        let key = key::data_key(&self.key_prefix, category, &identifier.into())?;
        if !self.is_ready().await {
            return Ok(false);
        }
        match self.call("exists", self.backend.exists(&key)).await {
            Ok(exists) => Ok(exists),
            Err(e) => {
                self.backend_failure("exists", &key, &e);
                Ok(false)
            }
        }
    }

    /// Delete every entry carrying `tag`, returning how many were removed.
    pub async fn invalidate_by_tag(&self, tag: &str) -> Result<usize> {
        if tag.is_empty() {
            return Err(GovernorError::InvalidInput(
                "cache tag must not be empty".to_string(),
            ));
        }
        if !self.is_ready().await {
            return Ok(0);
        }

        let tag_key = key::tag_key(&self.key_prefix, tag);
        let members = match self.call("members", self.backend.members_of(&tag_key)).await {
            Ok(members) => members,
            Err(e) => {
                self.backend_failure("invalidate", &tag_key, &e);
                return Ok(0);
            }
        };
        if members.is_empty() {
            debug!(%tag, "no entries to invalidate");
            return Ok(0);
        }

        let mut keys: Vec<String> = members.into_iter().collect();
        keys.sort();
        let deleted = match self.call("delete_many", self.backend.delete_many(&keys)).await {
            Ok(deleted) => deleted,
            Err(e) => {
                // Keep the index so a retry can still find the members.
                self.backend_failure("invalidate", &tag_key, &e);
                return Ok(0);
            }
        };

        if let Err(e) = self.call("delete", self.backend.delete(&tag_key)).await {
            self.backend_failure("invalidate", &tag_key, &e);
        }

        metrics::counter!(telemetry::CACHE_INVALIDATIONS_TOTAL).increment(deleted as u64);
        info!(%tag, deleted, "invalidated cache entries");
        Ok(deleted)
    }

    /// Delete every key under this manager's namespace.
    pub async fn clear(&self) -> usize {
        if !self.is_ready().await {
            return 0;
        }
        match self
            .call("clear", self.backend.delete_prefix(&self.key_prefix))
            .await
        {
            Ok(deleted) => {
                info!(prefix = %self.key_prefix, deleted, "cache cleared");
                deleted
            }
            Err(e) => {
                self.backend_failure("clear", &self.key_prefix, &e);
                0
            }
        }
    }

    // =========================================================================
    // Health and statistics
    // =========================================================================

    /// Round-trip a probe value through the backend (set → get → delete).
    pub async fn health_check(&self) -> CacheHealth {
        let state = self.state().await;
        let mut health = CacheHealth {
            status: HealthStatus::Unhealthy,
            backend: self.backend.name().to_string(),
            state,
            error: None,
            response_time_ms: None,
            timestamp: Utc::now(),
        };
        if state != CacheState::Ready {
            health.error = Some(format!("cache manager is {state}"));
            return health;
        }

        let probe_key = format!("{}health_check", self.key_prefix);
        let probe = json!({ "timestamp": health.timestamp.to_rfc3339() });
        let started = Instant::now();

        let outcome = self.probe(&probe_key, &probe).await;
        health.response_time_ms = Some(started.elapsed().as_secs_f64() * 1000.0);

        match outcome {
            Ok(true) => health.status = HealthStatus::Healthy,
            Ok(false) => {
                health.status = HealthStatus::Degraded;
                health.error = Some("probe value did not round-trip".to_string());
            }
            Err(e) => {
                warn!(backend = self.backend.name(), error = %e, "cache health check failed");
                health.error = Some(e.to_string());
            }
        }
        health
    }

    async fn probe(&self, key: &str, expected: &serde_json::Value) -> Result<bool> {
        let bytes = serde_json::to_vec(expected)?;
        self.call("set", self.backend.set(key, bytes, Some(PROBE_TTL)))
            .await?;
        let retrieved = self.call("get", self.backend.get(key)).await?;
        self.call("delete", self.backend.delete(key)).await?;

        Ok(retrieved
            .and_then(|bytes| serde_json::from_slice::<serde_json::Value>(&bytes).ok())
            .is_some_and(|value| &value == expected))
    }

    /// Aggregated statistics. Never fails.
    pub async fn stats(&self) -> CacheManagerStats {
        let state = self.state().await;
        let mut stats = CacheManagerStats {
            state,
            backend: self.backend.name().to_string(),
            key_prefix: self.key_prefix.clone(),
            backend_stats: None,
            error: None,
            ttl: self.ttls.as_map().clone(),
        };
        if state != CacheState::Ready {
            return stats;
        }
        match self
            .call("stats", self.backend.stats(&self.key_prefix))
            .await
        {
            Ok(backend_stats) => stats.backend_stats = Some(backend_stats),
            Err(e) => {
                self.backend_failure("stats", &self.key_prefix, &e);
                stats.error = Some(e.to_string());
            }
        }
        stats
    }

    // =========================================================================
    // Category helpers
    // =========================================================================

    pub async fn get_search_results<T: DeserializeOwned>(
        &self,
        query: &str,
        source: &str,
    ) -> Result<Option<T>> {
        self.get(
            CacheCategory::SearchResults.as_str(),
            search_id(query, source),
        )
        .await
    }

    /// Tagged `search_results` and `source`.
    pub async fn cache_search_results<T: Serialize + ?Sized>(
        &self,
        query: &str,
        source: &str,
        results: &T,
        ttl: Option<Duration>,
    ) -> Result<bool> {
        let category = CacheCategory::SearchResults.as_str();
        self.set(category, search_id(query, source), results, ttl, &[category, source])
            .await
    }

    pub async fn get_paper_metadata<T: DeserializeOwned>(
        &self,
        paper_id: &str,
        source: &str,
    ) -> Result<Option<T>> {
        self.get(
            CacheCategory::PaperMetadata.as_str(),
            paper_id_key(paper_id, source),
        )
        .await
    }

    /// Tagged `paper_metadata` and `source`.
    pub async fn cache_paper_metadata<T: Serialize + ?Sized>(
        &self,
        paper_id: &str,
        source: &str,
        metadata: &T,
        ttl: Option<Duration>,
    ) -> Result<bool> {
        let category = CacheCategory::PaperMetadata.as_str();
        self.set(
            category,
            paper_id_key(paper_id, source),
            metadata,
            ttl,
            &[category, source],
        )
        .await
    }

    pub async fn get_embeddings(&self, text_hash: &str) -> Result<Option<Vec<f32>>> {
        self.get(CacheCategory::Embeddings.as_str(), text_hash).await
    }

    /// Tagged `embeddings`.
    pub async fn cache_embeddings(
        &self,
        text_hash: &str,
        embeddings: &[f32],
        ttl: Option<Duration>,
    ) -> Result<bool> {
        let category = CacheCategory::Embeddings.as_str();
        self.set(category, text_hash, embeddings, ttl, &[category])
            .await
    }

    pub async fn get_llm_response<T: DeserializeOwned>(
        &self,
        prompt_hash: &str,
        model: &str,
    ) -> Result<Option<T>> {
        self.get(
            CacheCategory::LlmResponses.as_str(),
            llm_id(prompt_hash, model),
        )
        .await
    }

    /// Tagged `llm_responses` and `model`.
    pub async fn cache_llm_response<T: Serialize + ?Sized>(
        &self,
        prompt_hash: &str,
        model: &str,
        response: &T,
        ttl: Option<Duration>,
    ) -> Result<bool> {
        let category = CacheCategory::LlmResponses.as_str();
        self.set(
            category,
            llm_id(prompt_hash, model),
            response,
            ttl,
            &[category, model],
        )
        .await
    }

    pub async fn get_api_response<T: DeserializeOwned>(
        &self,
        endpoint: &str,
        params_hash: &str,
    ) -> Result<Option<T>> {
        self.get(
            CacheCategory::ApiResponses.as_str(),
            api_id(endpoint, params_hash),
        )
        .await
    }

    /// Tagged `api_responses` and the endpoint's first path segment.
    pub async fn cache_api_response<T: Serialize + ?Sized>(
        &self,
        endpoint: &str,
        params_hash: &str,
        response: &T,
        ttl: Option<Duration>,
    ) -> Result<bool> {
        let category = CacheCategory::ApiResponses.as_str();
        let mut tags = vec![category];
        if let Some(segment) = endpoint.split('/').find(|s| !s.is_empty()) {
            tags.push(segment);
        }
        self.set(category, api_id(endpoint, params_hash), response, ttl, &tags)
            .await
    }

    /// Invalidate search results from `source`, or all of them.
    pub async fn invalidate_search_cache(&self, source: Option<&str>) -> Result<usize> {
        self.invalidate_by_tag(source.unwrap_or(CacheCategory::SearchResults.as_str()))
            .await
    }

    /// Invalidate paper metadata from `source`, or all of it.
    pub async fn invalidate_paper_cache(&self, source: Option<&str>) -> Result<usize> {
        self.invalidate_by_tag(source.unwrap_or(CacheCategory::PaperMetadata.as_str()))
            .await
    }

    /// Invalidate responses from `model`, or all LLM responses.
    pub async fn invalidate_llm_cache(&self, model: Option<&str>) -> Result<usize> {
        self.invalidate_by_tag(model.unwrap_or(CacheCategory::LlmResponses.as_str()))
            .await
    }

    // =========================================================================
    // Internals
    // =========================================================================

    /// Run a backend call under the operation timeout.
    async fn call<T>(
        &self,
        operation: &str,
        fut: impl Future<Output = Result<T>>,
    ) -> Result<T> {
        match tokio::time::timeout(self.operation_timeout, fut).await {
            Ok(result) => result,
            Err(_) => Err(GovernorError::Timeout {
                operation: operation.to_string(),
                timeout_ms: self.operation_timeout.as_millis() as u64,
            }),
        }
    }

    fn backend_failure(&self, operation: &'static str, key: &str, err: &GovernorError) {
        warn!(backend = self.backend.name(), operation, %key, error = %err, "cache backend error");
        metrics::counter!(telemetry::CACHE_ERRORS_TOTAL, "operation" => operation).increment(1);
    }

    /// Add `key` to the tag's set and stretch the set's lifetime to cover it.
    async fn index_tag(&self, tag: &str, key: &str, ttl: Duration) -> Result<()> {
        let tag_key = key::tag_key(&self.key_prefix, tag);
        self.call("add_to_set", self.backend.add_to_set(&tag_key, key))
            .await?;
        let current = self
            .call("time_to_live", self.backend.time_to_live(&tag_key))
            .await?;
        if current.is_none_or(|current| current < ttl) {
            self.call("expire", self.backend.expire(&tag_key, ttl))
                .await?;
        }
        Ok(())
    }

    /// Persist an incremented hit count without extending the entry's life.
    ///
    /// Only overwrites a key that still exists, so an entry deleted or
    /// invalidated since it was read stays gone.
    async fn record_hit(&self, key: &str, entry: &CacheEntry) {
        let remaining = entry.remaining_ttl(Utc::now());
        if remaining.is_some_and(|left| left < Duration::from_secs(1)) {
            return;
        }
        let bytes = match entry.to_bytes() {
            Ok(bytes) => bytes,
            Err(e) => {
                debug!(%key, error = %e, "could not encode hit count");
                return;
            }
        };
        match self
            .call("hit_count", self.backend.set_if_exists(key, bytes, remaining))
            .await
        {
            Ok(true) => {}
            Ok(false) => debug!(%key, "entry removed since read, hit count dropped"),
            Err(e) => debug!(%key, error = %e, "hit count update failed"),
        }
    }
}

fn record_miss(category: &str) {
    metrics::counter!(telemetry::CACHE_MISSES_TOTAL, "category" => category.to_string())
        .increment(1);
}

fn search_id(query: &str, source: &str) -> CacheIdentifier {
    CacheIdentifier::fields([("query", query), ("source", source)])
}

fn paper_id_key(paper_id: &str, source: &str) -> CacheIdentifier {
    CacheIdentifier::fields([("id", paper_id), ("source", source)])
}

fn llm_id(prompt_hash: &str, model: &str) -> CacheIdentifier {
    CacheIdentifier::fields([("hash", prompt_hash), ("model", model)])
}

fn api_id(endpoint: &str, params_hash: &str) -> CacheIdentifier {
    CacheIdentifier::fields([("endpoint", endpoint), ("params", params_hash)])
}
