//! Configuration loading.
//!
//! Configuration is loaded from TOML files with the following resolution order:
//! 1. Explicit path (e.g. `govctl --config <path>`)
//! 2. `~/.lit-governor/config.toml` (user)
//! 3. `/etc/lit-governor/config.toml` (system)
//!
//! ```toml
//! [cache]
//! url = "redis://localhost:6379"
//! key_prefix = "litreview:v1:"
//!
//! [cache.ttl]
//! search_results = 900
//!
//! [rate_limits.default]
//! requests = 100
//! window_secs = 60
//!
//! [rate_limits."search:*"]
//! requests = 20
//! window_secs = 60
//! algorithm = "token_bucket"
//! burst = 40
//! ```

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use serde::Deserialize;
use tracing::warn;

use crate::cache::{
    CacheManager, DEFAULT_KEY_PREFIX, DEFAULT_MEMORY_CAPACITY, KeyValueBackend, MemoryBackend,
    UnavailableBackend,
};
use crate::ratelimit::{RateLimitAlgorithm, RateLimitPolicy, RateLimiter};
use crate::{GovernorError, Result};

/// Top-level configuration.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct GovernorConfig {
    #[serde(default)]
    pub cache: CacheConfig,
    /// Policies by identity pattern. When empty the stock policies apply.
    #[serde(default)]
    pub rate_limits: BTreeMap<String, PolicyConfig>,
}

/// Cache backend configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct CacheConfig {
    /// Backend address: `memory://`, `redis://…` or `rediss://…` (default: `memory://`).
    #[serde(default = "default_url")]
    pub url: String,
    /// Namespace for every key (default: `litreview:v1:`).
    #[serde(default = "default_key_prefix")]
    pub key_prefix: String,
    /// Per-category TTL overrides in seconds.
    #[serde(default)]
    pub ttl: BTreeMap<String, u64>,
    /// Per-operation backend timeout in milliseconds (default: 2000).
    #[serde(default = "default_operation_timeout_ms")]
    pub operation_timeout_ms: u64,
    /// Key capacity of the in-memory backend (default: 100,000).
    #[serde(default = "default_memory_capacity")]
    pub memory_capacity: u64,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            url: default_url(),
            key_prefix: default_key_prefix(),
            ttl: BTreeMap::new(),
            operation_timeout_ms: default_operation_timeout_ms(),
            memory_capacity: default_memory_capacity(),
        }
    }
}

fn default_url() -> String {
    "memory://".to_string()
}

fn default_key_prefix() -> String {
    DEFAULT_KEY_PREFIX.to_string()
}

fn default_operation_timeout_ms() -> u64 {
    2_000
}

fn default_memory_capacity() -> u64 {
    DEFAULT_MEMORY_CAPACITY
}

/// One rate-limit policy as written in the config file.
#[derive(Debug, Clone, Copy, Deserialize)]
pub struct PolicyConfig {
    /// Units admitted per window.
    pub requests: u32,
    pub window_secs: u64,
    #[serde(default)]
    pub algorithm: RateLimitAlgorithm,
    #[serde(default)]
    pub burst: Option<u32>,
}

impl From<PolicyConfig> for RateLimitPolicy {
    fn from(config: PolicyConfig) -> Self {
        RateLimitPolicy {
            allowance: config.requests,
            window_secs: config.window_secs,
            algorithm: config.algorithm,
            burst: config.burst,
        }
    }
}

impl GovernorConfig {
    /// Load configuration from the standard locations.
    ///
    /// Fails if no file is found.
    pub fn load(explicit_path: Option<&Path>) -> Result<Self> {
        let path = Self::resolve_config_path(explicit_path)?;
        Self::load_from_file(&path)
    }

    /// Like [`load`](Self::load), but falls back to defaults when no file
    /// exists in the standard locations. An explicit path must still exist.
    pub fn load_or_default(explicit_path: Option<&Path>) -> Result<Self> {
        if explicit_path.is_some() {
            return Self::load(explicit_path);
        }
        match Self::find_standard_path() {
            Some(path) => Self::load_from_file(&path),
            None => Ok(Self::default()),
        }
    }

    /// Parse configuration from a TOML string.
    pub fn parse(content: &str) -> Result<Self> {
        toml::from_str(content)
            .map_err(|e| GovernorError::Configuration(format!("Failed to parse config: {e}")))
    }

    fn load_from_file(path: &Path) -> Result<Self> {
        let content = fs::read_to_string(path).map_err(|e| {
            GovernorError::Configuration(format!("Failed to read config file {path:?}: {e}"))
        })?;
        toml::from_str(&content).map_err(|e| {
            GovernorError::Configuration(format!("Failed to parse config file {path:?}: {e}"))
        })
    }

    fn resolve_config_path(explicit: Option<&Path>) -> Result<PathBuf> {
        if let Some(path) = explicit {
            if path.exists() {
                return Ok(path.to_path_buf());
            }
            return Err(GovernorError::Configuration(format!(
                "Config file not found: {path:?}"
            )));
        }

        Self::find_standard_path().ok_or_else(|| {
            GovernorError::Configuration(
                "No config file found. Create ~/.lit-governor/config.toml or /etc/lit-governor/config.toml"
                    .to_string(),
            )
        })
    }

    fn find_standard_path() -> Option<PathBuf> {
        if let Some(home) = dirs::home_dir() {
            let user_config = home.join(".lit-governor").join("config.toml");
            if user_config.exists() {
                return Some(user_config);
            }
        }

        let system_config = PathBuf::from("/etc/lit-governor/config.toml");
        system_config.exists().then_some(system_config)
    }

    /// Build a limiter with the configured policies.
    ///
    /// Malformed policies are registered as written. The limiter logs them
    /// and leaves their identities unlimited rather than handing them to a
    /// broader pattern.
    pub fn build_rate_limiter(&self) -> RateLimiter {
        let limiter = RateLimiter::new();
        if self.rate_limits.is_empty() {
            limiter.set_default_policies();
            return limiter;
        }
        for (pattern, config) in &self.rate_limits {
            limiter.set_policy(pattern.clone(), RateLimitPolicy::from(*config));
        }
        limiter
    }

    /// Build an uninitialized cache manager for the configured backend.
    ///
    /// An unusable backend address does not fail here: the manager is built
    /// over a stand-in that refuses to connect, so `initialize()` returns
    /// `false` and the cache runs as a pass-through.
    pub fn build_cache_manager(&self) -> CacheManager {
        let backend = match self.backend() {
            Ok(backend) => backend,
            Err(e) => {
                warn!(url = %self.cache.url, error = %e, "cache backend unavailable, caching disabled");
                Arc::new(UnavailableBackend::new(e.to_string()))
            }
        };

        let mut manager = CacheManager::new(backend)
            .key_prefix(self.cache.key_prefix.clone())
            .operation_timeout(Duration::from_millis(self.cache.operation_timeout_ms));
        for (category, secs) in &self.cache.ttl {
            if *secs == 0 {
                warn!(%category, "ignoring zero cache ttl override");
                continue;
            }
            manager = manager.category_ttl(category.clone(), Duration::from_secs(*secs));
        }
        manager
    }

    fn backend(&self) -> Result<Arc<dyn KeyValueBackend>> {
        let url = self.cache.url.as_str();
        let (scheme, _) = url.split_once("://").ok_or_else(|| {
            GovernorError::Configuration(format!("cache url has no scheme: {url}"))
        })?;
        match scheme {
            "memory" => Ok(Arc::new(MemoryBackend::with_capacity(
                self.cache.memory_capacity,
            ))),
            #[cfg(feature = "redis")]
            "redis" | "rediss" => Ok(Arc::new(crate::cache::RedisBackend::new(url)?)),
            #[cfg(not(feature = "redis"))]
            "redis" | "rediss" => Err(GovernorError::Configuration(
                "redis support not compiled in (enable the `redis` feature)".to_string(),
            )),
            other => Err(GovernorError::Configuration(format!(
                "unsupported cache scheme: {other}"
            ))),
        }
    }
}
