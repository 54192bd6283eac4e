//! Per-identity rate limiting.
//!
//! [`RateLimiter`] decides whether a unit of work for a caller identity may
//! proceed now. Policies are registered under identity patterns and resolved
//! in this order:
//!
//! 1. exact match on the identity
//! 2. the longest trailing-wildcard pattern (`"ip:*"`) whose prefix matches
//! 3. the `"default"` pattern
//! 4. no limit (always allowed, `remaining = +inf`)
//!
//! # Concurrency
//!
//! State lives in a sharded [`DashMap`]. A decision is a synchronous
//! read-modify-write under the identity's entry guard with no `.await`, so
//! concurrent checks for one identity never both take the last unit, and a
//! cancelled caller cannot leave half-applied state. Unrelated identities
//! only contend when they hash to the same shard.
//!
//! # Memory
//!
//! State is created on first check. Identities untouched for over an hour
//! are purged by a sweep that runs from inside `check_limit` at most once
//! every five minutes.

mod algorithm;
mod policy;

pub use algorithm::{RateLimitState, compute_decision};
pub use policy::{RateLimitAlgorithm, RateLimitPolicy, RateLimitResult};

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, PoisonError, RwLock};
use std::time::Duration;

use dashmap::DashMap;
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::clock::{Clock, SystemClock};
use crate::telemetry;
use crate::{GovernorError, Result};

/// Pattern consulted when nothing more specific matches.
pub const DEFAULT_PATTERN: &str = "default";

/// Minimum time between idle-state sweeps. Default: 5 minutes.
pub const DEFAULT_CLEANUP_INTERVAL: Duration = Duration::from_secs(300);

/// Idle time after which an identity's state is purged. Default: 1 hour.
pub const DEFAULT_IDLE_TTL: Duration = Duration::from_secs(3600);

/// State for one identity plus the last time it was checked.
#[derive(Debug)]
struct IdentityState {
    state: RateLimitState,
    last_seen: f64,
}

/// Snapshot of limiter configuration and occupancy.
#[derive(Debug, Clone, Serialize)]
pub struct RateLimiterStats {
    /// Registered policies by pattern.
    pub policies: BTreeMap<String, RateLimitPolicy>,
    /// Identities with live state.
    pub tracked_identities: usize,
    /// Unix seconds of the last sweep (or of construction).
    pub last_cleanup: f64,
}

/// Multi-algorithm rate limiter keyed by caller identity.
///
/// ```rust
/// # use lit_governor::{RateLimiter, RateLimitPolicy, RateLimitAlgorithm};
/// let limiter = RateLimiter::new();
/// limiter.set_policy("user:*", RateLimitPolicy::new(2, 60));
///
/// assert!(limiter.check_limit("user:42", 1).unwrap().allowed);
/// assert!(limiter.check_limit("user:42", 1).unwrap().allowed);
/// let denied = limiter.check_limit("user:42", 1).unwrap();
/// assert!(!denied.allowed);
/// assert!(denied.retry_after_secs.unwrap() >= 1);
/// ```
pub struct RateLimiter {
    policies: RwLock<HashMap<String, RateLimitPolicy>>,
    states: DashMap<String, IdentityState>,
    clock: Arc<dyn Clock>,
    cleanup_interval: f64,
    idle_ttl: f64,
    /// Unix seconds of the last sweep, stored as `f64` bits.
    last_cleanup: AtomicU64,
}

impl RateLimiter {
    /// Create a limiter with no policies, driven by the system clock.
    pub fn new() -> Self {
        Self::with_clock(Arc::new(SystemClock))
    }

    /// Create a limiter driven by a custom clock.
    pub fn with_clock(clock: Arc<dyn Clock>) -> Self {
        let now = clock.now();
        Self {
            policies: RwLock::new(HashMap::new()),
            states: DashMap::new(),
            clock,
            cleanup_interval: DEFAULT_CLEANUP_INTERVAL.as_secs_f64(),
            idle_ttl: DEFAULT_IDLE_TTL.as_secs_f64(),
            last_cleanup: AtomicU64::new(now.to_bits()),
        }
    }

    /// Create a limiter pre-loaded with the stock policies.
    ///
    /// `default` 100/min, `search` 20/min, `admin` 1000/min, `guest` 10/min,
    /// all sliding window.
    pub fn with_default_policies() -> Self {
        let limiter = Self::new();
        limiter.set_default_policies();
        limiter
    }

    /// Set the minimum time between idle-state sweeps.
    pub fn cleanup_interval(mut self, interval: Duration) -> Self {
        self.cleanup_interval = interval.as_secs_f64();
        self
    }

    /// Set how long an identity may stay idle before its state is purged.
    pub fn idle_ttl(mut self, ttl: Duration) -> Self {
        self.idle_ttl = ttl.as_secs_f64();
        self
    }

    /// Register the stock policies (see [`with_default_policies`](Self::with_default_policies)).
    pub fn set_default_policies(&self) {
        for (pattern, allowance) in [
            (DEFAULT_PATTERN, 100),
            ("search", 20),
            ("admin", 1000),
            ("guest", 10),
        ] {
            self.set_policy(pattern, RateLimitPolicy::new(allowance, 60));
        }
        info!("default rate limits configured");
    }

    /// Register or replace the policy for an identity pattern.
    ///
    /// Malformed policies are stored but treated as "no limit" when
    /// consulted, so a config mistake never blocks all traffic.
    pub fn set_policy(&self, pattern: impl Into<String>, policy: RateLimitPolicy) {
        let pattern = pattern.into();
        if let Err(e) = policy.validate() {
            warn!(%pattern, error = %e, "malformed rate limit policy, requests will not be limited");
        }
        info!(%pattern, %policy, "rate limit set");
        self.policies
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(pattern, policy);
    }

    /// Remove the policy for a pattern, returning it if present.
    pub fn remove_policy(&self, pattern: &str) -> Option<RateLimitPolicy> {
        self.policies
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(pattern)
    }

    /// Resolve the policy governing `identity`, with the pattern it came from.
    pub fn policy_for(&self, identity: &str) -> Option<(String, RateLimitPolicy)> {
        let policies = self.policies.read().unwrap_or_else(PoisonError::into_inner);

        if let Some(policy) = policies.get(identity) {
            return Some((identity.to_string(), *policy));
        }

        let wildcard = policies
            .iter()
            .filter_map(|(pattern, policy)| {
                let prefix = pattern.strip_suffix('*')?;
                identity
                    .starts_with(prefix)
                    .then_some((prefix.len(), pattern, policy))
            })
            .max_by_key(|(len, _, _)| *len);
        if let Some((_, pattern, policy)) = wildcard {
            return Some((pattern.clone(), *policy));
        }

        policies
            .get(DEFAULT_PATTERN)
            .map(|policy| (DEFAULT_PATTERN.to_string(), *policy))
    }

    /// Check whether `cost` units for `identity` may proceed now.
    ///
    /// The cost is admitted whole or not at all. Returns
    /// [`GovernorError::InvalidInput`] for an empty identity or zero cost;
    /// every other outcome, including "no policy", is an `Ok` result.
    pub fn check_limit(&self, identity: &str, cost: u32) -> Result<RateLimitResult> {
        if identity.is_empty() {
            return Err(GovernorError::InvalidInput(
                "rate limit identity must not be empty".to_string(),
            ));
        }
        if cost == 0 {
            return Err(GovernorError::InvalidInput(
                "rate limit cost must be at least 1".to_string(),
            ));
        }

        let now = self.clock.now();

        let Some((pattern, policy)) = self.policy_for(identity) else {
            metrics::counter!(telemetry::RATE_LIMIT_DECISIONS_TOTAL, "decision" => "unlimited", "algorithm" => "none")
                .increment(1);
            return Ok(RateLimitResult::unlimited(now));
        };

        if !policy.is_valid() {
            debug!(%identity, %pattern, "malformed policy, failing open");
            metrics::counter!(telemetry::RATE_LIMIT_DECISIONS_TOTAL, "decision" => "unlimited", "algorithm" => policy.algorithm.as_str())
                .increment(1);
            return Ok(RateLimitResult::unlimited(now));
        }

        self.cleanup_if_needed(now);

        let result = {
            let mut entry = self
                .states
                .entry(identity.to_string())
                .or_insert_with(|| IdentityState {
                    state: RateLimitState::initial(&policy, now),
                    last_seen: now,
                });
            entry.last_seen = now;
            compute_decision(&mut entry.state, &policy, now, cost)
        };

        if f64::from(cost) > policy.max_cost() {
            warn!(%identity, %pattern, cost, %policy, "cost exceeds policy capacity, request can never be admitted");
        }

        let decision = if result.allowed { "allowed" } else { "denied" };
        metrics::counter!(telemetry::RATE_LIMIT_DECISIONS_TOTAL, "decision" => decision, "algorithm" => policy.algorithm.as_str())
            .increment(1);
        if !result.allowed {
            debug!(
                %identity,
                %pattern,
                cost,
                retry_after = ?result.retry_after_secs,
                "rate limit exceeded"
            );
        }

        Ok(result)
    }

    /// Drop all state for `identity`, as if it had never made a request.
    ///
    /// Returns whether any state existed.
    pub fn reset(&self, identity: &str) -> bool {
        let existed = self.states.remove(identity).is_some();
        if existed {
            info!(%identity, "rate limit reset");
        }
        existed
    }

    /// Snapshot of the current state for `identity`, if any.
    pub fn state_of(&self, identity: &str) -> Option<RateLimitState> {
        self.states.get(identity).map(|entry| entry.state.clone())
    }

    /// Number of identities with live state.
    pub fn tracked_identities(&self) -> usize {
        self.states.len()
    }

    /// Limiter statistics.
    pub fn stats(&self) -> RateLimiterStats {
        let policies = self
            .policies
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .map(|(pattern, policy)| (pattern.clone(), *policy))
            .collect();
        RateLimiterStats {
            policies,
            tracked_identities: self.states.len(),
            last_cleanup: f64::from_bits(self.last_cleanup.load(Ordering::Acquire)),
        }
    }

    /// Purge idle identities now, regardless of the sweep interval.
    ///
    /// Returns the number of identities removed.
    pub fn cleanup_now(&self) -> usize {
        let now = self.clock.now();
        self.last_cleanup.store(now.to_bits(), Ordering::Release);
        self.purge_idle(now)
    }

    /// Run the sweep if the interval has passed and no other caller claimed it.
    fn cleanup_if_needed(&self, now: f64) {
        let last_bits = self.last_cleanup.load(Ordering::Acquire);
        if now - f64::from_bits(last_bits) < self.cleanup_interval {
            return;
        }
        if self
            .last_cleanup
            .compare_exchange(last_bits, now.to_bits(), Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return;
        }
        self.purge_idle(now);
    }

    fn purge_idle(&self, now: f64) -> usize {
        let cutoff = now - self.idle_ttl;
        let before = self.states.len();
        self.states.retain(|_, entry| entry.last_seen > cutoff);
        let purged = before.saturating_sub(self.states.len());

        metrics::counter!(telemetry::RATE_LIMIT_PURGED_TOTAL).increment(purged as u64);
        debug!(purged, active = self.states.len(), "rate limiter cleanup completed");
        purged
    }
}

impl Default for RateLimiter {
    fn default() -> Self {
        Self::new()
    }
}
