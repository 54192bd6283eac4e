//! Per-identity limiter state and the four admission algorithms.
//!
//! Each algorithm is a pure function of `(state, policy, now, cost)` that
//! mutates the state in place and returns a [`RateLimitResult`]. Nothing here
//! awaits, so the caller can run a decision entirely under one map guard.

use std::collections::VecDeque;

use serde::Serialize;

use super::policy::{RateLimitAlgorithm, RateLimitPolicy, RateLimitResult};

/// Tolerance for float comparisons on bucket levels.
const EPSILON: f64 = 1e-9;

/// Algorithm-shaped mutable state for one identity.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "algorithm", rename_all = "snake_case")]
pub enum RateLimitState {
    FixedWindow {
        window_start: f64,
        count: u64,
    },
    /// Admitted requests as `(timestamp, cost)` pairs, oldest first.
    SlidingWindow {
        entries: VecDeque<(f64, u32)>,
        in_window: u64,
    },
    TokenBucket {
        tokens: f64,
        last_refill: f64,
    },
    LeakyBucket {
        level: f64,
        last_leak: f64,
    },
}

impl RateLimitState {
    /// Fresh state for `policy`: empty windows, full token bucket, empty leaky bucket.
    pub fn initial(policy: &RateLimitPolicy, now: f64) -> Self {
        match policy.algorithm {
            RateLimitAlgorithm::FixedWindow => RateLimitState::FixedWindow {
                window_start: window_floor(now, policy.window()),
                count: 0,
            },
            RateLimitAlgorithm::SlidingWindow => RateLimitState::SlidingWindow {
                entries: VecDeque::new(),
                in_window: 0,
            },
            RateLimitAlgorithm::TokenBucket => RateLimitState::TokenBucket {
                tokens: policy.capacity(),
                last_refill: now,
            },
            RateLimitAlgorithm::LeakyBucket => RateLimitState::LeakyBucket {
                level: 0.0,
                last_leak: now,
            },
        }
    }

    /// The algorithm this state belongs to.
    pub fn algorithm(&self) -> RateLimitAlgorithm {
        match self {
            RateLimitState::FixedWindow { .. } => RateLimitAlgorithm::FixedWindow,
            RateLimitState::SlidingWindow { .. } => RateLimitAlgorithm::SlidingWindow,
            RateLimitState::TokenBucket { .. } => RateLimitAlgorithm::TokenBucket,
            RateLimitState::LeakyBucket { .. } => RateLimitAlgorithm::LeakyBucket,
        }
    }
}

/// Decide whether `cost` units fit under `policy` at `now`, updating `state`.
///
/// The state must match `policy.algorithm`; a mismatched state is reset
/// first (this happens when a pattern's policy is replaced).
pub fn compute_decision(
    state: &mut RateLimitState,
    policy: &RateLimitPolicy,
    now: f64,
    cost: u32,
) -> RateLimitResult {
    if state.algorithm() != policy.algorithm {
        *state = RateLimitState::initial(policy, now);
    }

    match state {
        RateLimitState::FixedWindow {
            window_start,
            count,
        } => fixed_window(window_start, count, policy, now, cost),
        RateLimitState::SlidingWindow { entries, in_window } => {
            sliding_window(entries, in_window, policy, now, cost)
        }
        RateLimitState::TokenBucket {
            tokens,
            last_refill,
        } => token_bucket(tokens, last_refill, policy, now, cost),
        RateLimitState::LeakyBucket { level, last_leak } => {
            leaky_bucket(level, last_leak, policy, now, cost)
        }
    }
}

fn fixed_window(
    window_start: &mut f64,
    count: &mut u64,
    policy: &RateLimitPolicy,
    now: f64,
    cost: u32,
) -> RateLimitResult {
    let current = window_floor(now, policy.window());
    if *window_start != current {
        *window_start = current;
        *count = 0;
    }

    let allowance = u64::from(policy.allowance);
    let cost = u64::from(cost);
    let reset_at = current + policy.window();

    if *count + cost <= allowance {
        *count += cost;
        return RateLimitResult::allow((allowance - *count) as f64, reset_at);
    }

    let remaining = allowance.saturating_sub(*count) as f64;
    if cost > allowance {
        return RateLimitResult::deny(remaining, reset_at, policy.window_secs);
    }
    RateLimitResult::deny(remaining, reset_at, ceil_secs(reset_at - now))
}

fn sliding_window(
    entries: &mut VecDeque<(f64, u32)>,
    in_window: &mut u64,
    policy: &RateLimitPolicy,
    now: f64,
    cost: u32,
) -> RateLimitResult {
    let window = policy.window();
    let cutoff = now - window;

    while let Some(&(ts, units)) = entries.front() {
        if ts > cutoff {
            break;
        }
        entries.pop_front();
        *in_window = in_window.saturating_sub(u64::from(units));
    }

    let allowance = u64::from(policy.allowance);
    let units = u64::from(cost);

    if *in_window + units <= allowance {
        match entries.back_mut() {
            Some((ts, recorded)) if *ts == now => *recorded += cost,
            _ => entries.push_back((now, cost)),
        }
        *in_window += units;
        return RateLimitResult::allow((allowance - *in_window) as f64, now + window);
    }

    let remaining = allowance.saturating_sub(*in_window) as f64;
    if units > allowance {
        return RateLimitResult::deny(remaining, now + window, policy.window_secs);
    }

    // Walk from the oldest entry until enough units have aged out to fit `cost`.
    let mut must_free = *in_window + units - allowance;
    let mut free_at = now;
    for &(ts, recorded) in entries.iter() {
        free_at = ts + window;
        let recorded = u64::from(recorded);
        if recorded >= must_free {
            break;
        }
        must_free -= recorded;
    }

    RateLimitResult::deny(remaining, free_at, ceil_secs(free_at - now))
}

fn token_bucket(
    tokens: &mut f64,
    last_refill: &mut f64,
    policy: &RateLimitPolicy,
    now: f64,
    cost: u32,
) -> RateLimitResult {
    let capacity = policy.capacity();

    let elapsed = (now - *last_refill).max(0.0);
    *tokens = (*tokens + policy.units_over(elapsed)).min(capacity);
    *last_refill = last_refill.max(now);

    let cost = f64::from(cost);
    if *tokens + EPSILON >= cost {
        *tokens = (*tokens - cost).max(0.0);
        let reset_at = now + policy.secs_for(capacity - *tokens);
        return RateLimitResult::allow(*tokens, reset_at);
    }

    let reset_at = now + policy.secs_for(capacity - *tokens);
    if cost > capacity {
        return RateLimitResult::deny(*tokens, reset_at, policy.window_secs);
    }
    RateLimitResult::deny(*tokens, reset_at, ceil_secs(policy.secs_for(cost - *tokens)))
}

fn leaky_bucket(
    level: &mut f64,
    last_leak: &mut f64,
    policy: &RateLimitPolicy,
    now: f64,
    cost: u32,
) -> RateLimitResult {
    let capacity = policy.capacity();

    let elapsed = (now - *last_leak).max(0.0);
    *level = (*level - policy.units_over(elapsed)).max(0.0);
    *last_leak = last_leak.max(now);

    let cost = f64::from(cost);
    if *level + cost <= capacity + EPSILON {
        *level = (*level + cost).min(capacity);
        return RateLimitResult::allow(capacity - *level, now + policy.secs_for(*level));
    }

    let reset_at = now + policy.secs_for(*level);
    if cost > capacity {
        return RateLimitResult::deny(capacity - *level, reset_at, policy.window_secs);
    }
    let overflow = *level + cost - capacity;
    RateLimitResult::deny(capacity - *level, reset_at, ceil_secs(policy.secs_for(overflow)))
}

/// Start of the epoch-aligned window containing `now`.
fn window_floor(now: f64, window: f64) -> f64 {
    (now / window).floor() * window
}

/// Smallest whole number of seconds >= `secs`, and at least 1.
fn ceil_secs(secs: f64) -> u64 {
    (secs - EPSILON).ceil().max(1.0) as u64
}

#[cfg(test)]
mod tests {
    use super::*;

    fn policy(algorithm: RateLimitAlgorithm) -> RateLimitPolicy {
        RateLimitPolicy::new(4, 10).algorithm(algorithm)
    }

    #[test]
    fn ceil_secs_rounds_up_and_floors_at_one() {
        assert_eq!(ceil_secs(0.0), 1);
        assert_eq!(ceil_secs(0.2), 1);
        assert_eq!(ceil_secs(1.0), 1);
        assert_eq!(ceil_secs(1.01), 2);
        assert_eq!(ceil_secs(59.5), 60);
    }

    #[test]
    fn window_floor_is_epoch_aligned() {
        assert_eq!(window_floor(125.0, 60.0), 120.0);
        assert_eq!(window_floor(120.0, 60.0), 120.0);
    }

    #[test]
    fn initial_token_bucket_is_full_and_leaky_is_empty() {
        let tb = RateLimitState::initial(&policy(RateLimitAlgorithm::TokenBucket), 0.0);
        assert_eq!(
            tb,
            RateLimitState::TokenBucket {
                tokens: 4.0,
                last_refill: 0.0
            }
        );
        let lb = RateLimitState::initial(&policy(RateLimitAlgorithm::LeakyBucket), 0.0);
        assert_eq!(
            lb,
            RateLimitState::LeakyBucket {
                level: 0.0,
                last_leak: 0.0
            }
        );
    }

    #[test]
    fn fixed_window_denies_until_next_boundary() {
        let p = policy(RateLimitAlgorithm::FixedWindow);
        let mut state = RateLimitState::initial(&p, 1_003.0);
        for _ in 0..4 {
            assert!(compute_decision(&mut state, &p, 1_003.0, 1).allowed);
        }
        let denied = compute_decision(&mut state, &p, 1_003.0, 1);
        assert!(!denied.allowed);
        // window [1000, 1010) → 7 seconds left
        assert_eq!(denied.retry_after_secs, Some(7));
        assert_eq!(denied.reset_at, 1_010.0);

        assert!(compute_decision(&mut state, &p, 1_010.0, 1).allowed);
    }

    #[test]
    fn sliding_window_retry_tracks_oldest_entry() {
        let p = policy(RateLimitAlgorithm::SlidingWindow);
        let mut state = RateLimitState::initial(&p, 0.0);
        assert!(compute_decision(&mut state, &p, 100.0, 1).allowed);
        assert!(compute_decision(&mut state, &p, 103.0, 3).allowed);

        let denied = compute_decision(&mut state, &p, 104.0, 1);
        assert!(!denied.allowed);
        // entry at 100 leaves the window at 110
        assert_eq!(denied.retry_after_secs, Some(6));

        // needing 2 units means the cost-3 entry at 103 must also leave
        let denied = compute_decision(&mut state, &p, 104.0, 2);
        assert_eq!(denied.retry_after_secs, Some(9));

        assert!(compute_decision(&mut state, &p, 110.0, 1).allowed);
    }

    #[test]
    fn sliding_window_merges_same_instant() {
        let p = policy(RateLimitAlgorithm::SlidingWindow);
        let mut state = RateLimitState::initial(&p, 0.0);
        compute_decision(&mut state, &p, 5.0, 1);
        compute_decision(&mut state, &p, 5.0, 2);
        match &state {
            RateLimitState::SlidingWindow { entries, in_window } => {
                assert_eq!(entries.len(), 1);
                assert_eq!(*in_window, 3);
            }
            other => panic!("unexpected state {other:?}"),
        }
    }

    #[test]
    fn token_bucket_retry_after_matches_refill_rate() {
        // 4 tokens per 10s → 0.4 tokens/s
        let p = policy(RateLimitAlgorithm::TokenBucket);
        let mut state = RateLimitState::initial(&p, 0.0);
        assert!(compute_decision(&mut state, &p, 0.0, 4).allowed);

        let denied = compute_decision(&mut state, &p, 0.0, 1);
        assert_eq!(denied.retry_after_secs, Some(3)); // 2.5s rounded up

        assert!(compute_decision(&mut state, &p, 2.5, 1).allowed);
    }

    #[test]
    fn leaky_bucket_retry_after_matches_leak_rate() {
        let p = policy(RateLimitAlgorithm::LeakyBucket);
        let mut state = RateLimitState::initial(&p, 0.0);
        assert!(compute_decision(&mut state, &p, 0.0, 4).allowed);

        let denied = compute_decision(&mut state, &p, 0.0, 2);
        assert_eq!(denied.retry_after_secs, Some(5));

        assert!(compute_decision(&mut state, &p, 5.0, 2).allowed);
    }

    #[test]
    fn cost_above_capacity_is_never_admitted() {
        for algorithm in [
            RateLimitAlgorithm::FixedWindow,
            RateLimitAlgorithm::SlidingWindow,
            RateLimitAlgorithm::TokenBucket,
            RateLimitAlgorithm::LeakyBucket,
        ] {
            let p = policy(algorithm);
            let mut state = RateLimitState::initial(&p, 0.0);
            let result = compute_decision(&mut state, &p, 0.0, 5);
            assert!(!result.allowed, "{algorithm} admitted oversized cost");
            assert_eq!(result.retry_after_secs, Some(10));
        }
    }

    #[test]
    fn mismatched_state_is_reinitialised() {
        let fixed = policy(RateLimitAlgorithm::FixedWindow);
        let mut state = RateLimitState::initial(&fixed, 0.0);
        let bucket = policy(RateLimitAlgorithm::TokenBucket);
        let result = compute_decision(&mut state, &bucket, 0.0, 1);
        assert!(result.allowed);
        assert_eq!(state.algorithm(), RateLimitAlgorithm::TokenBucket);
    }
}
