//! lit-governor - request governance for a literature-review backend
//!
//! Two cooperating components protect the backend and the paid APIs behind
//! it (paper search, LLMs, embeddings):
//!
//! - [`RateLimiter`]: per-identity admission control with four algorithms
//!   (fixed window, sliding window, token bucket, leaky bucket).
//! - [`CacheManager`]: category-TTL result caching over a
//!   [`KeyValueBackend`], with tag-indexed bulk invalidation.
//!
//! Both are plain values built once at startup and shared by `Arc`. Neither
//! makes the caller unavailable: a broken policy means "no limit" and an
//! unreachable cache means "always miss".
//!
//! # Example
//!
//! ```rust
//! use std::sync::Arc;
//! use lit_governor::{CacheManager, MemoryBackend, RateLimitPolicy, RateLimiter};
//!
//! #[tokio::main]
//! async fn main() -> lit_governor::Result<()> {
//!     let limiter = RateLimiter::new();
//!     limiter.set_policy("user:*", RateLimitPolicy::new(20, 60));
//!
//!     let cache = CacheManager::new(Arc::new(MemoryBackend::new()));
//!     cache.initialize().await;
//!
//!     let decision = limiter.check_limit("user:alice", 1)?;
//!     if !decision.allowed {
//!         // Reply 429 with Retry-After: decision.retry_after_secs
//!         return Ok(());
//!     }
//!
//!     let cached: Option<Vec<String>> = cache.get_search_results("transformers", "arxiv").await?;
//!     if cached.is_none() {
//!         let results = vec!["Attention Is All You Need".to_string()];
//!         cache
//!             .cache_search_results("transformers", "arxiv", &results, None)
//!             .await?;
//!     }
//!     Ok(())
//! }
//! ```

pub mod cache;
pub mod clock;
pub mod config;
pub mod error;
pub mod ratelimit;
pub mod telemetry;

// Re-export main types at crate root
pub use error::{GovernorError, Result};

pub use cache::{
    BackendStats, CacheCategory, CacheEntry, CacheHealth, CacheIdentifier, CacheManager,
    CacheManagerStats, CacheState, HealthStatus, KeyValueBackend, MemoryBackend, TtlTable,
};
#[cfg(feature = "redis")]
pub use cache::RedisBackend;
pub use clock::{Clock, ManualClock, SystemClock};
pub use config::{CacheConfig, GovernorConfig, PolicyConfig};
pub use ratelimit::{
    RateLimitAlgorithm, RateLimitPolicy, RateLimitResult, RateLimitState, RateLimiter,
    RateLimiterStats,
};
