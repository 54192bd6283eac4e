//! Rate-limit policies and decisions.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::{GovernorError, Result};

/// Admission algorithm used by a [`RateLimitPolicy`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum RateLimitAlgorithm {
    /// Epoch-aligned windows with a counter that resets at each boundary.
    FixedWindow,
    /// Exact rolling window over recorded request timestamps.
    #[default]
    SlidingWindow,
    /// Continuously refilling bucket; allows bursts up to capacity.
    TokenBucket,
    /// Continuously draining queue; smooths traffic to the leak rate.
    LeakyBucket,
}

impl RateLimitAlgorithm {
    /// Stable lowercase name, as used in configuration and metric labels.
    pub fn as_str(&self) -> &'static str {
        match self {
            RateLimitAlgorithm::FixedWindow => "fixed_window",
            RateLimitAlgorithm::SlidingWindow => "sliding_window",
            RateLimitAlgorithm::TokenBucket => "token_bucket",
            RateLimitAlgorithm::LeakyBucket => "leaky_bucket",
        }
    }
}

impl fmt::Display for RateLimitAlgorithm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Quota for one identity pattern.
///
/// ```rust
/// # use lit_governor::{RateLimitAlgorithm, RateLimitPolicy};
/// let policy = RateLimitPolicy::new(20, 60)
///     .algorithm(RateLimitAlgorithm::TokenBucket)
///     .burst(40);
/// assert_eq!(policy.capacity(), 40.0);
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct RateLimitPolicy {
    /// Units admitted per window.
    pub allowance: u32,
    /// Window length in seconds.
    pub window_secs: u64,
    /// Admission algorithm. Default: sliding window.
    #[serde(default)]
    pub algorithm: RateLimitAlgorithm,
    /// Bucket capacity for token/leaky bucket. Defaults to `allowance`.
    #[serde(default)]
    pub burst: Option<u32>,
}

impl RateLimitPolicy {
    /// Sliding-window policy of `allowance` units per `window_secs`.
    pub fn new(allowance: u32, window_secs: u64) -> Self {
        Self {
            allowance,
            window_secs,
            algorithm: RateLimitAlgorithm::default(),
            burst: None,
        }
    }

    /// Set the admission algorithm.
    pub fn algorithm(mut self, algorithm: RateLimitAlgorithm) -> Self {
        self.algorithm = algorithm;
        self
    }

    /// Set the bucket capacity.
    pub fn burst(mut self, burst: u32) -> Self {
        self.burst = Some(burst);
        self
    }

    /// Bucket capacity: `burst` if set, otherwise `allowance`.
    pub fn capacity(&self) -> f64 {
        f64::from(self.burst.unwrap_or(self.allowance))
    }

    /// Largest cost a single check can ever be admitted for.
    pub fn max_cost(&self) -> f64 {
        match self.algorithm {
            RateLimitAlgorithm::FixedWindow | RateLimitAlgorithm::SlidingWindow => {
                f64::from(self.allowance)
            }
            RateLimitAlgorithm::TokenBucket | RateLimitAlgorithm::LeakyBucket => self.capacity(),
        }
    }

    /// Refill/leak rate in units per second.
    pub fn rate_per_sec(&self) -> f64 {
        f64::from(self.allowance) / self.window_secs as f64
    }

    /// Units refilled (or leaked) over `secs` seconds.
    ///
    /// Multiplies before dividing so whole windows come out exact.
    pub fn units_over(&self, secs: f64) -> f64 {
        secs * f64::from(self.allowance) / self.window()
    }

    /// Seconds needed to refill (or leak) `units`.
    pub fn secs_for(&self, units: f64) -> f64 {
        units * self.window() / f64::from(self.allowance)
    }

    /// Window length as `f64` seconds.
    pub fn window(&self) -> f64 {
        self.window_secs as f64
    }

    /// Check that the policy can admit anything at all.
    pub fn validate(&self) -> Result<()> {
        if self.allowance == 0 {
            return Err(GovernorError::Configuration(
                "allowance must be greater than 0".to_string(),
            ));
        }
        if self.window_secs == 0 {
            return Err(GovernorError::Configuration(
                "window_secs must be greater than 0".to_string(),
            ));
        }
        if self.burst == Some(0) {
            return Err(GovernorError::Configuration(
                "burst must be greater than 0 when set".to_string(),
            ));
        }
        Ok(())
    }

    /// Whether [`validate`](Self::validate) passes.
    pub fn is_valid(&self) -> bool {
        self.validate().is_ok()
    }
}

impl fmt::Display for RateLimitPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}s ({})", self.allowance, self.window_secs, self.algorithm)?;
        if let Some(burst) = self.burst {
            write!(f, " burst={burst}")?;
        }
        Ok(())
    }
}

/// Outcome of a [`RateLimiter::check_limit`](super::RateLimiter::check_limit) call.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct RateLimitResult {
    /// Whether the whole cost was admitted.
    pub allowed: bool,
    /// Units still available. `f64::INFINITY` when no policy applies.
    pub remaining: f64,
    /// Unix seconds at which the quota is fully restored.
    pub reset_at: f64,
    /// Seconds to wait before retrying. Set only on denial, always >= 1.
    pub retry_after_secs: Option<u64>,
}

impl RateLimitResult {
    /// Result for identities with no applicable policy.
    pub fn unlimited(now: f64) -> Self {
        Self {
            allowed: true,
            remaining: f64::INFINITY,
            reset_at: now,
            retry_after_secs: None,
        }
    }

    pub(crate) fn allow(remaining: f64, reset_at: f64) -> Self {
        Self {
            allowed: true,
            remaining: remaining.max(0.0).floor(),
            reset_at,
            retry_after_secs: None,
        }
    }

    pub(crate) fn deny(remaining: f64, reset_at: f64, retry_after_secs: u64) -> Self {
        Self {
            allowed: false,
            remaining: remaining.max(0.0).floor(),
            reset_at,
            retry_after_secs: Some(retry_after_secs.max(1)),
        }
    }

    /// Whether no policy constrained this decision.
    pub fn is_unlimited(&self) -> bool {
        self.remaining.is_infinite()
    }
}
