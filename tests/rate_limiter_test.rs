//! Tests for the rate limiter: algorithm laws, policy resolution, fail-open
//! behaviour and concurrent admission.

use std::sync::Arc;
use std::time::Duration;

use lit_governor::{
    GovernorError, ManualClock, RateLimitAlgorithm, RateLimitPolicy, RateLimitState, RateLimiter,
};

const ALGORITHMS: [RateLimitAlgorithm; 4] = [
    RateLimitAlgorithm::FixedWindow,
    RateLimitAlgorithm::SlidingWindow,
    RateLimitAlgorithm::TokenBucket,
    RateLimitAlgorithm::LeakyBucket,
];

/// Window-aligned start time (multiple of 10 and 60).
const T0: f64 = 1_000_020.0;

fn limiter_at(start: f64) -> (Arc<ManualClock>, RateLimiter) {
    let clock = Arc::new(ManualClock::new(start));
    let limiter = RateLimiter::with_clock(clock.clone());
    (clock, limiter)
}

fn secs(n: u64) -> Duration {
    Duration::from_secs(n)
}

// ============================================================================
// Algorithm laws
// ============================================================================

#[test]
fn allowance_admitted_then_next_denied() {
    for algorithm in ALGORITHMS {
        let (_, limiter) = limiter_at(T0);
        limiter.set_policy("default", RateLimitPolicy::new(5, 10).algorithm(algorithm));

        for i in 0..5 {
            let result = limiter.check_limit("user:1", 1).unwrap();
            assert!(result.allowed, "{algorithm}: request {i} denied");
            assert!(result.retry_after_secs.is_none());
        }
        let denied = limiter.check_limit("user:1", 1).unwrap();
        assert!(!denied.allowed, "{algorithm}: request 6 admitted");
        assert!(denied.retry_after_secs.unwrap() >= 1);
        assert_eq!(denied.remaining, 0.0);
    }
}

#[test]
fn retry_after_is_the_minimum_sufficient_wait() {
    for algorithm in ALGORITHMS {
        let (clock, limiter) = limiter_at(T0);
        limiter.set_policy("default", RateLimitPolicy::new(4, 10).algorithm(algorithm));

        for _ in 0..4 {
            assert!(limiter.check_limit("id", 1).unwrap().allowed);
        }
        let retry = limiter
            .check_limit("id", 1)
            .unwrap()
            .retry_after_secs
            .unwrap();

        if retry > 1 {
            clock.set(T0 + (retry - 1) as f64);
            assert!(
                !limiter.check_limit("id", 1).unwrap().allowed,
                "{algorithm}: admitted before retry_after={retry}"
            );
        }
        clock.set(T0 + retry as f64);
        assert!(
            limiter.check_limit("id", 1).unwrap().allowed,
            "{algorithm}: still denied after retry_after={retry}"
        );
    }
}

#[test]
fn sliding_window_ages_out_after_window() {
    let (clock, limiter) = limiter_at(T0);
    limiter.set_policy("default", RateLimitPolicy::new(3, 60));

    for _ in 0..3 {
        assert!(limiter.check_limit("u", 1).unwrap().allowed);
    }
    assert!(!limiter.check_limit("u", 1).unwrap().allowed);

    clock.advance(secs(61));
    let result = limiter.check_limit("u", 1).unwrap();
    assert!(result.allowed);
    assert_eq!(result.remaining, 2.0);
}

#[test]
fn sliding_window_denial_points_at_oldest_entry() {
    let (clock, limiter) = limiter_at(T0);
    limiter.set_policy("default", RateLimitPolicy::new(2, 60));

    limiter.check_limit("u", 1).unwrap();
    clock.advance(secs(20));
    limiter.check_limit("u", 1).unwrap();
    clock.advance(secs(10));

    // First entry leaves at T0 + 60, i.e. 30s from now.
    let denied = limiter.check_limit("u", 1).unwrap();
    assert_eq!(denied.retry_after_secs, Some(30));
    assert_eq!(denied.reset_at, T0 + 60.0);
}

#[test]
fn fixed_window_allows_boundary_burst() {
    let (clock, limiter) = limiter_at(T0 - 0.5);
    limiter.set_policy(
        "default",
        RateLimitPolicy::new(10, 60).algorithm(RateLimitAlgorithm::FixedWindow),
    );

    for _ in 0..10 {
        assert!(limiter.check_limit("u", 1).unwrap().allowed);
    }
    clock.set(T0 + 0.5);
    for _ in 0..10 {
        assert!(limiter.check_limit("u", 1).unwrap().allowed);
    }
    assert!(!limiter.check_limit("u", 1).unwrap().allowed);
}

#[test]
fn fixed_window_reports_window_end() {
    let (clock, limiter) = limiter_at(T0);
    limiter.set_policy(
        "default",
        RateLimitPolicy::new(1, 60).algorithm(RateLimitAlgorithm::FixedWindow),
    );
    clock.advance(secs(45));
    limiter.check_limit("u", 1).unwrap();
    let denied = limiter.check_limit("u", 1).unwrap();
    assert_eq!(denied.reset_at, T0 + 60.0);
    assert_eq!(denied.retry_after_secs, Some(15));
}

#[test]
fn token_bucket_refills_to_capacity_not_beyond() {
    let (clock, limiter) = limiter_at(T0);
    limiter.set_policy(
        "default",
        RateLimitPolicy::new(6, 30).algorithm(RateLimitAlgorithm::TokenBucket),
    );

    for _ in 0..6 {
        assert!(limiter.check_limit("u", 1).unwrap().allowed);
    }
    assert!(!limiter.check_limit("u", 1).unwrap().allowed);

    // Ten windows of idling still only refills to capacity.
    clock.advance(secs(300));
    for _ in 0..6 {
        assert!(limiter.check_limit("u", 1).unwrap().allowed);
    }
    assert!(!limiter.check_limit("u", 1).unwrap().allowed);

    clock.advance(secs(30));
    match limiter.state_of("u").unwrap() {
        RateLimitState::TokenBucket { tokens, .. } => assert_eq!(tokens, 0.0),
        other => panic!("unexpected state {other:?}"),
    }
    let result = limiter.check_limit("u", 1).unwrap();
    assert!(result.allowed);
    assert_eq!(result.remaining, 5.0);
}

#[test]
fn token_bucket_burst_exceeds_allowance() {
    let (_, limiter) = limiter_at(T0);
    limiter.set_policy(
        "default",
        RateLimitPolicy::new(2, 10)
            .algorithm(RateLimitAlgorithm::TokenBucket)
            .burst(5),
    );
    let result = limiter.check_limit("u", 5).unwrap();
    assert!(result.allowed);
    assert_eq!(result.remaining, 0.0);
}

#[test]
fn leaky_bucket_drains_after_window() {
    let (clock, limiter) = limiter_at(T0);
    limiter.set_policy(
        "default",
        RateLimitPolicy::new(8, 20).algorithm(RateLimitAlgorithm::LeakyBucket),
    );

    assert!(limiter.check_limit("u", 8).unwrap().allowed);
    assert!(!limiter.check_limit("u", 1).unwrap().allowed);

    clock.advance(secs(20));
    let result = limiter.check_limit("u", 8).unwrap();
    assert!(result.allowed, "bucket did not drain");
    assert_eq!(result.remaining, 0.0);
}

#[test]
fn leaky_bucket_level_never_negative() {
    let (clock, limiter) = limiter_at(T0);
    limiter.set_policy(
        "default",
        RateLimitPolicy::new(4, 10).algorithm(RateLimitAlgorithm::LeakyBucket),
    );
    limiter.check_limit("u", 1).unwrap();
    clock.advance(secs(1_000));
    limiter.check_limit("u", 1).unwrap();
    match limiter.state_of("u").unwrap() {
        RateLimitState::LeakyBucket { level, .. } => assert_eq!(level, 1.0),
        other => panic!("unexpected state {other:?}"),
    }
}

#[test]
fn cost_is_admitted_whole_or_not_at_all() {
    for algorithm in ALGORITHMS {
        let (_, limiter) = limiter_at(T0);
        limiter.set_policy("default", RateLimitPolicy::new(5, 60).algorithm(algorithm));

        assert!(limiter.check_limit("u", 3).unwrap().allowed);
        let denied = limiter.check_limit("u", 3).unwrap();
        assert!(!denied.allowed, "{algorithm}: partial cost admitted");
        assert_eq!(denied.remaining, 2.0, "{algorithm}: denial consumed units");
        assert!(limiter.check_limit("u", 2).unwrap().allowed);
    }
}

#[test]
fn cost_above_capacity_waits_a_full_window() {
    for algorithm in ALGORITHMS {
        let (_, limiter) = limiter_at(T0);
        limiter.set_policy("default", RateLimitPolicy::new(5, 60).algorithm(algorithm));
        let denied = limiter.check_limit("u", 6).unwrap();
        assert!(!denied.allowed);
        assert_eq!(denied.retry_after_secs, Some(60), "{algorithm}");
        // Nothing consumed.
        assert!(limiter.check_limit("u", 5).unwrap().allowed, "{algorithm}");
    }
}

// ============================================================================
// Policy resolution and fail-open
// ============================================================================

#[test]
fn unknown_identity_without_default_is_unlimited() {
    let (_, limiter) = limiter_at(T0);
    limiter.set_policy("admin", RateLimitPolicy::new(1, 60));

    for _ in 0..1_000 {
        let result = limiter.check_limit("ip:203.0.113.9", 1).unwrap();
        assert!(result.allowed);
        assert!(result.remaining.is_infinite());
        assert!(result.is_unlimited());
    }
    assert_eq!(limiter.tracked_identities(), 0);
}

#[test]
fn wildcard_patterns_share_a_policy_not_state() {
    let (_, limiter) = limiter_at(T0);
    limiter.set_policy("ip:*", RateLimitPolicy::new(1, 60));

    assert!(limiter.check_limit("ip:1.1.1.1", 1).unwrap().allowed);
    assert!(!limiter.check_limit("ip:1.1.1.1", 1).unwrap().allowed);
    assert!(limiter.check_limit("ip:2.2.2.2", 1).unwrap().allowed);
}

#[test]
fn malformed_policy_fails_open() {
    let (_, limiter) = limiter_at(T0);
    limiter.set_policy("default", RateLimitPolicy::new(0, 60));
    limiter.set_policy("zero-window", RateLimitPolicy::new(10, 0));

    for identity in ["anyone", "zero-window"] {
        for _ in 0..50 {
            let result = limiter.check_limit(identity, 1).unwrap();
            assert!(result.allowed);
            assert!(result.is_unlimited());
        }
    }
}

#[test]
fn contract_violations_are_errors() {
    let (_, limiter) = limiter_at(T0);
    limiter.set_policy("default", RateLimitPolicy::new(10, 60));
    assert!(matches!(
        limiter.check_limit("", 1),
        Err(GovernorError::InvalidInput(_))
    ));
    assert!(matches!(
        limiter.check_limit("user", 0),
        Err(GovernorError::InvalidInput(_))
    ));
}

#[test]
fn replacing_policy_algorithm_reinitialises_state() {
    let (_, limiter) = limiter_at(T0);
    limiter.set_policy("default", RateLimitPolicy::new(1, 60));
    limiter.check_limit("u", 1).unwrap();
    assert!(!limiter.check_limit("u", 1).unwrap().allowed);

    limiter.set_policy(
        "default",
        RateLimitPolicy::new(1, 60).algorithm(RateLimitAlgorithm::TokenBucket),
    );
    assert!(limiter.check_limit("u", 1).unwrap().allowed);
    assert_eq!(
        limiter.state_of("u").unwrap().algorithm(),
        RateLimitAlgorithm::TokenBucket
    );
}

#[test]
fn reset_clears_identity() {
    let (_, limiter) = limiter_at(T0);
    limiter.set_policy("default", RateLimitPolicy::new(1, 60));
    limiter.check_limit("u", 1).unwrap();
    assert!(!limiter.check_limit("u", 1).unwrap().allowed);

    assert!(limiter.reset("u"));
    assert!(!limiter.reset("u"));
    assert!(limiter.check_limit("u", 1).unwrap().allowed);
}

#[test]
fn default_policies_match_stock_table() {
    let limiter = RateLimiter::with_default_policies();
    let expect = [("default", 100), ("search", 20), ("admin", 1000), ("guest", 10)];
    for (pattern, allowance) in expect {
        let (matched, policy) = limiter.policy_for(pattern).unwrap();
        assert_eq!(matched, pattern);
        assert_eq!(policy.allowance, allowance);
        assert_eq!(policy.window_secs, 60);
        assert_eq!(policy.algorithm, RateLimitAlgorithm::SlidingWindow);
    }
}

// ============================================================================
// Idle-state sweep
// ============================================================================

#[test]
fn idle_identities_purged_after_an_hour() {
    let (clock, limiter) = limiter_at(T0);
    limiter.set_policy("default", RateLimitPolicy::new(10, 60));

    for i in 0..100 {
        limiter.check_limit(&format!("ip:{i}"), 1).unwrap();
    }
    assert_eq!(limiter.tracked_identities(), 100);

    // Under an hour: sweep runs (interval passed) but nothing is idle enough.
    clock.advance(secs(1_800));
    limiter.check_limit("fresh", 1).unwrap();
    assert_eq!(limiter.tracked_identities(), 101);

    clock.advance(secs(1_801));
    limiter.check_limit("fresh", 1).unwrap();
    assert_eq!(limiter.tracked_identities(), 1);
    assert!(limiter.state_of("fresh").is_some());
}

#[test]
fn cleanup_now_ignores_interval() {
    let (clock, limiter) = limiter_at(T0);
    limiter.set_policy("default", RateLimitPolicy::new(10, 60));
    limiter.check_limit("a", 1).unwrap();
    clock.advance(secs(3_601));
    assert_eq!(limiter.cleanup_now(), 1);
    assert_eq!(limiter.stats().last_cleanup, T0 + 3_601.0);
}

#[test]
fn custom_idle_ttl_and_interval() {
    let clock = Arc::new(ManualClock::new(T0));
    let limiter = RateLimiter::with_clock(clock.clone())
        .cleanup_interval(secs(10))
        .idle_ttl(secs(30));
    limiter.set_policy("default", RateLimitPolicy::new(10, 60));

    limiter.check_limit("a", 1).unwrap();
    clock.advance(secs(31));
    limiter.check_limit("b", 1).unwrap();
    assert!(limiter.state_of("a").is_none());
}

// ============================================================================
// Concurrency
// ============================================================================

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_checks_admit_exactly_one() {
    for algorithm in ALGORITHMS {
        let clock = Arc::new(ManualClock::new(T0));
        let limiter = Arc::new(RateLimiter::with_clock(clock));
        limiter.set_policy("default", RateLimitPolicy::new(1, 3_600).algorithm(algorithm));

        let barrier = Arc::new(tokio::sync::Barrier::new(64));
        let handles: Vec<_> = (0..64)
            .map(|_| {
                let limiter = limiter.clone();
                let barrier = barrier.clone();
                tokio::spawn(async move {
                    barrier.wait().await;
                    limiter.check_limit("shared", 1).unwrap().allowed
                })
            })
            .collect();

        let mut admitted = 0;
        for handle in handles {
            if handle.await.unwrap() {
                admitted += 1;
            }
        }
        assert_eq!(admitted, 1, "{algorithm}: admitted {admitted}");
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_checks_respect_allowance() {
    let clock = Arc::new(ManualClock::new(T0));
    let limiter = Arc::new(RateLimiter::with_clock(clock));
    limiter.set_policy("default", RateLimitPolicy::new(25, 60));

    let handles: Vec<_> = (0..200)
        .map(|i| {
            let limiter = limiter.clone();
            tokio::spawn(async move {
                // Two identities interleaved.
                let identity = if i % 2 == 0 { "even" } else { "odd" };
                limiter.check_limit(identity, 1).unwrap().allowed
            })
        })
        .collect();

    let mut admitted = 0;
    for handle in handles {
        if handle.await.unwrap() {
            admitted += 1;
        }
    }
    assert_eq!(admitted, 50);
}
