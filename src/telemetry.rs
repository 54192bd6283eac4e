//! Telemetry metric name constants.
//!
//! Centralised metric names for rate-limit and cache operations. Consumers
//! install their own `metrics` recorder (e.g. prometheus, statsd); without a
//! recorder installed, all metric calls are no-ops.
//!
//! # Metric naming conventions
//!
//! All metrics are prefixed with `lit_governor_`. Counters end in `_total`.
//!
//! # Common labels
//!
//! - `decision`: rate-limit outcome: "allowed", "denied" or "unlimited"
//! - `algorithm`: rate-limit algorithm (e.g. "token_bucket")
//! - `category`: cache category (e.g. "search_results")
//! - `operation`: cache operation that failed (e.g. "get", "set")

/// Total rate-limit decisions.
///
/// Labels: `decision`, `algorithm`.
pub const RATE_LIMIT_DECISIONS_TOTAL: &str = "lit_governor_rate_limit_decisions_total";

/// Total identities purged by the idle-state sweep.
pub const RATE_LIMIT_PURGED_TOTAL: &str = "lit_governor_rate_limit_purged_total";

/// Total cache hits.
///
/// Labels: `category`.
pub const CACHE_HITS_TOTAL: &str = "lit_governor_cache_hits_total";

/// Total cache misses (including misses caused by a degraded backend).
///
/// Labels: `category`.
pub const CACHE_MISSES_TOTAL: &str = "lit_governor_cache_misses_total";

/// Total backend failures swallowed by the cache manager.
///
/// Labels: `operation`.
pub const CACHE_ERRORS_TOTAL: &str = "lit_governor_cache_errors_total";

/// Total entries removed by tag invalidation.
pub const CACHE_INVALIDATIONS_TOTAL: &str = "lit_governor_cache_invalidations_total";
