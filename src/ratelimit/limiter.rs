//! Core sliding-window rate limiter.

use dashmap::DashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, OnceLock};
use tracing::{debug, trace, warn};

use crate::config::{LimiterConfig, PolicyMode};
use crate::error::{LimiterError, Result};

use super::clock::{Clock, SystemClock};
use super::decision::{Decision, Policy, WindowStats};
use super::window::WindowState;

/// The rate limiter that owns every key's window.
///
/// Windows live in a sharded map. Checking a key holds that key's shard
/// lock for the whole evict, evaluate and record sequence, so decisions for
/// one key are linearizable while keys on other shards proceed in parallel.
/// This struct is thread-safe and can be shared across multiple tasks.
pub struct RateLimiter {
    /// Request windows indexed by key
    windows: DashMap<String, WindowState>,
    /// Time source for admission and stats
    clock: Arc<dyn Clock>,
    /// Whether a key keeps the first policy it was checked with
    policy_mode: PolicyMode,
    /// Window for `stats` when the caller does not pass one
    stats_window_secs: u64,
    /// Requests admitted since construction
    admitted: AtomicU64,
    /// Requests rejected since construction
    rejected: AtomicU64,
}

impl RateLimiter {
    /// Create a new rate limiter with default settings.
    pub fn new() -> Self {
        Self::with_config(&LimiterConfig::default())
    }

    /// Create a rate limiter from configuration, reading the system clock.
    pub fn with_config(config: &LimiterConfig) -> Self {
        Self::with_config_and_clock(config, Arc::new(SystemClock))
    }

    /// Create a rate limiter with default settings and a custom time source.
    pub fn with_clock(clock: Arc<dyn Clock>) -> Self {
        Self::with_config_and_clock(&LimiterConfig::default(), clock)
    }

    /// Create a rate limiter from configuration and a custom time source.
    pub fn with_config_and_clock(config: &LimiterConfig, clock: Arc<dyn Clock>) -> Self {
        let windows = match config.shard_amount {
            Some(shards) if shards > 1 && shards.is_power_of_two() => {
                DashMap::with_shard_amount(shards)
            }
            Some(shards) => {
                warn!(shards, "Ignoring invalid shard amount, using default sharding");
                DashMap::new()
            }
            None => DashMap::new(),
        };

        Self {
            windows,
            clock,
            policy_mode: config.policy_mode,
            stats_window_secs: config.stats_window_secs,
            admitted: AtomicU64::new(0),
            rejected: AtomicU64::new(0),
        }
    }

    /// Check whether a request for `key` may proceed under `policy`.
    ///
    /// On allow, the request time is recorded. On deny, nothing is recorded.
    /// An empty key is a caller defect and returns `InvalidKey`; in bound
    /// mode a policy that differs from the key's bound one returns
    /// `PolicyMismatch`.
    pub fn check(&self, key: &str, policy: Policy) -> Result<Decision> {
        if key.is_empty() {
            return Err(LimiterError::InvalidKey("key must not be empty".to_string()));
        }

        trace!(key = %key, policy = %policy, "Checking rate limit");

        let decision = if let Some(mut window) = self.windows.get_mut(key) {
            self.admit(key, &mut window, policy)?
        } else {
            // entry() is an atomic insert-if-absent, so two first-time callers
            // for the same key always share one window.
            let mut window = self.windows.entry(key.to_string()).or_insert_with(|| {
                debug!(key = %key, "Creating window for new key");
                WindowState::new()
            });
            self.admit(key, &mut window, policy)?
        };

        if decision.is_allowed() {
            self.admitted.fetch_add(1, Ordering::Relaxed);
        } else {
            self.rejected.fetch_add(1, Ordering::Relaxed);
        }

        Ok(decision)
    }

    /// Check admission with a policy given as its two parts.
    pub fn is_allowed(&self, key: &str, max_requests: u64, window_seconds: u64) -> Result<Decision> {
        self.check(key, Policy::new(max_requests, window_seconds))
    }

    /// Evaluate one request against a locked window.
    fn admit(&self, key: &str, window: &mut WindowState, policy: Policy) -> Result<Decision> {
        if self.policy_mode == PolicyMode::Bound {
            match window.bound_policy() {
                Some(bound) if bound != policy => {
                    debug!(key = %key, bound = %bound, requested = %policy, "Policy mismatch");
                    return Err(LimiterError::PolicyMismatch {
                        key: key.to_string(),
                        bound,
                        requested: policy,
                    });
                }
                Some(_) => {}
                None => window.bind(policy),
            }
        }

        // Read the clock under the lock so timestamps follow lock order.
        let now = self.clock.now();
        let window_len = policy.window();
        window.evict_stale(now - window_len);
        let count = window.len() as u64;

        if policy.max_requests == 0 {
            debug!(key = %key, "Rate limit denies everything for a zero-request policy");
            return Ok(Decision::Denied {
                current_count: count,
                limit: 0,
                window_seconds: policy.window_seconds,
                retry_after: policy.window_seconds.max(1),
            });
        }

        if count >= policy.max_requests {
            let oldest = window.oldest().unwrap_or(now);
            // Float-to-int casts saturate, so huge windows cannot overflow.
            let retry_after = ((oldest + window_len - now).floor() + 1.0).max(1.0) as u64;
            debug!(
                key = %key,
                count = count,
                limit = policy.max_requests,
                retry_after = retry_after,
                "Rate limit exceeded"
            );
            return Ok(Decision::Denied {
                current_count: count,
                limit: policy.max_requests,
                window_seconds: policy.window_seconds,
                retry_after,
            });
        }

        window.record(now);
        let current_count = count + 1;
        let oldest = window.oldest().unwrap_or(now);

        Ok(Decision::Allowed {
            current_count,
            limit: policy.max_requests,
            remaining: policy.max_requests - current_count,
            window_seconds: policy.window_seconds,
            reset_at: (oldest + window_len).floor() as i64,
        })
    }

    /// Occupancy of `key` over the configured default stats window.
    pub fn stats(&self, key: &str) -> WindowStats {
        self.stats_for(key, self.stats_window_secs)
    }

    /// Occupancy of `key` over the trailing `window_seconds`.
    ///
    /// Never records, evicts, or creates a window. Unknown keys report an
    /// empty window.
    pub fn stats_for(&self, key: &str, window_seconds: u64) -> WindowStats {
        match self.windows.get(key) {
            Some(window) => window.snapshot(self.clock.now() - window_seconds as f64),
            None => WindowStats::empty(),
        }
    }

    /// Forget everything about one key, including a bound policy.
    ///
    /// Returns `true` if the key existed.
    pub fn clear_key(&self, key: &str) -> bool {
        let removed = self.windows.remove(key).is_some();
        if removed {
            debug!(key = %key, "Cleared rate limit window");
        }
        removed
    }

    /// Clear all windows.
    ///
    /// This is intended for test fixtures and administrative resets.
    pub fn clear(&self) {
        self.windows.clear();
        debug!("Cleared all rate limit windows");
    }

    /// Remove keys whose newest request is older than `horizon_secs`, and
    /// keys holding no requests at all. Returns the number of keys removed.
    pub fn reap_idle(&self, horizon_secs: u64) -> usize {
        let cutoff = self.clock.now() - horizon_secs as f64;
        let mut removed = 0;

        self.windows.retain(|_, window| {
            let keep = window.newest().is_some_and(|newest| newest >= cutoff);
            if !keep {
                removed += 1;
            }
            keep
        });

        if removed > 0 {
            debug!(removed = removed, remaining = self.windows.len(), "Reaped idle keys");
        }
        removed
    }

    /// Get the number of tracked keys.
    pub fn key_count(&self) -> usize {
        self.windows.len()
    }

    /// Total admitted requests.
    pub fn admitted_total(&self) -> u64 {
        self.admitted.load(Ordering::Relaxed)
    }

    /// Total rejected requests.
    pub fn rejected_total(&self) -> u64 {
        self.rejected.load(Ordering::Relaxed)
    }

    /// How repeated policies on one key are handled.
    pub fn policy_mode(&self) -> PolicyMode {
        self.policy_mode
    }
}

impl Default for RateLimiter {
    fn default() -> Self {
        Self::new()
    }
}

/// The process-wide limiter, created on first use with default settings.
pub fn global() -> &'static RateLimiter {
    static GLOBAL: OnceLock<RateLimiter> = OnceLock::new();
    GLOBAL.get_or_init(RateLimiter::new)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ratelimit::clock::ManualClock;
    use std::time::Duration;
    use tokio_test::{assert_err, assert_ok};

    const START: f64 = 1_700_000_000.0;

    fn manual_limiter() -> (RateLimiter, Arc<ManualClock>) {
        let clock = Arc::new(ManualClock::new(START));
        (RateLimiter::with_clock(clock.clone()), clock)
    }

    fn allowed(limiter: &RateLimiter, key: &str, max: u64, window: u64) -> bool {
        limiter.is_allowed(key, max, window).unwrap().is_allowed()
    }

    #[test]
    fn test_rate_limiter_creation() {
        let limiter = RateLimiter::new();
        assert_eq!(limiter.key_count(), 0);
        assert_eq!(limiter.policy_mode(), PolicyMode::Latest);
    }

    #[test]
    fn test_remaining_counts_down_then_denies() {
        let (limiter, _clock) = manual_limiter();

        for expected in [4, 3, 2, 1, 0] {
            let decision = assert_ok!(limiter.is_allowed("u1", 5, 10));
            assert!(decision.is_allowed());
            assert_eq!(decision.remaining(), Some(expected));
        }

        let decision = assert_ok!(limiter.is_allowed("u1", 5, 10));
        assert!(!decision.is_allowed());
        assert_eq!(decision.current_count(), 5);
        assert!(decision.retry_after().unwrap() >= 1);
        assert_eq!(limiter.admitted_total(), 5);
        assert_eq!(limiter.rejected_total(), 1);
    }

    #[test]
    fn test_allowed_metadata() {
        let (limiter, clock) = manual_limiter();
        clock.advance(0.5);

        let decision = limiter.is_allowed("u1", 3, 10).unwrap();

        assert_eq!(
            decision,
            Decision::Allowed {
                current_count: 1,
                limit: 3,
                remaining: 2,
                window_seconds: 10,
                reset_at: START as i64 + 10,
            }
        );
    }

    #[test]
    fn test_reset_at_tracks_oldest_retained_entry() {
        let (limiter, clock) = manual_limiter();

        limiter.is_allowed("u1", 3, 10).unwrap();
        clock.advance(3.0);

        let decision = limiter.is_allowed("u1", 3, 10).unwrap();
        assert_eq!(decision.current_count(), 2);
        assert_eq!(decision.reset_at(), Some(START as i64 + 10));
    }

    #[test]
    fn test_huge_window_saturates_retry_after() {
        let (limiter, _clock) = manual_limiter();

        assert!(allowed(&limiter, "forever", 1, u64::MAX));
        let decision = limiter.is_allowed("forever", 1, u64::MAX).unwrap();

        assert!(!decision.is_allowed());
        assert_eq!(decision.retry_after(), Some(u64::MAX));
    }

    #[test]
    fn test_retry_after_counts_from_oldest_entry() {
        let (limiter, clock) = manual_limiter();

        for _ in 0..5 {
            assert!(allowed(&limiter, "u1", 5, 10));
        }
        clock.advance(4.25);

        let decision = limiter.is_allowed("u1", 5, 10).unwrap();
        // floor(START + 10 - (START + 4.25)) + 1
        assert_eq!(decision.retry_after(), Some(6));
    }

    #[test]
    fn test_window_expiry_readmits() {
        let (limiter, clock) = manual_limiter();

        assert!(allowed(&limiter, "u2", 2, 2));
        assert!(allowed(&limiter, "u2", 2, 2));
        assert!(!allowed(&limiter, "u2", 2, 2));

        clock.advance(2.1);
        assert!(allowed(&limiter, "u2", 2, 2));
    }

    #[test]
    fn test_entry_at_cutoff_is_retained() {
        let (limiter, clock) = manual_limiter();

        assert!(allowed(&limiter, "edge", 1, 2));
        clock.advance(2.0);
        // The first entry sits exactly on the cutoff and still counts.
        assert!(!allowed(&limiter, "edge", 1, 2));

        clock.advance(0.001);
        assert!(allowed(&limiter, "edge", 1, 2));
    }

    #[test]
    fn test_sliding_window_with_real_clock() {
        let limiter = RateLimiter::new();

        assert!(allowed(&limiter, "u2", 2, 2));
        assert!(allowed(&limiter, "u2", 2, 2));
        assert!(!allowed(&limiter, "u2", 2, 2));

        std::thread::sleep(Duration::from_millis(2100));
        assert!(allowed(&limiter, "u2", 2, 2));
    }

    #[test]
    fn test_different_keys_are_isolated() {
        let (limiter, _clock) = manual_limiter();

        for _ in 0..3 {
            assert!(allowed(&limiter, "a", 3, 10));
        }
        for _ in 0..3 {
            assert!(allowed(&limiter, "b", 3, 10));
        }

        assert!(!allowed(&limiter, "a", 3, 10));
        assert_eq!(limiter.stats_for("b", 10).total_requests, 3);
        assert!(!allowed(&limiter, "b", 3, 10));
        assert_eq!(limiter.key_count(), 2);
    }

    #[test]
    fn test_exhausting_one_key_leaves_fresh_key_alone() {
        let (limiter, _clock) = manual_limiter();

        for _ in 0..4 {
            limiter.is_allowed("noisy", 3, 10).unwrap();
        }

        assert!(allowed(&limiter, "quiet", 3, 10));
    }

    #[test]
    fn test_zero_max_requests_always_denies() {
        let (limiter, _clock) = manual_limiter();

        let decision = limiter.is_allowed("blocked", 0, 30).unwrap();

        assert!(!decision.is_allowed());
        assert_eq!(decision.retry_after(), Some(30));
        assert_eq!(limiter.stats_for("blocked", 30).total_requests, 0);
    }

    #[test]
    fn test_zero_max_and_zero_window_retry_is_at_least_one() {
        let (limiter, _clock) = manual_limiter();
        let decision = limiter.is_allowed("blocked", 0, 0).unwrap();
        assert_eq!(decision.retry_after(), Some(1));
    }

    #[test]
    fn test_zero_window_only_counts_same_instant() {
        let (limiter, clock) = manual_limiter();

        assert!(allowed(&limiter, "instant", 1, 0));
        // Same timestamp: the previous entry sits on the cutoff.
        assert!(!allowed(&limiter, "instant", 1, 0));

        clock.advance(0.001);
        assert!(allowed(&limiter, "instant", 1, 0));
        assert_eq!(limiter.stats_for("instant", 0).total_requests, 1);
    }

    #[test]
    fn test_empty_key_is_rejected() {
        let limiter = RateLimiter::new();

        let err = assert_err!(limiter.is_allowed("", 5, 10));
        assert!(matches!(err, LimiterError::InvalidKey(_)));
        assert_eq!(limiter.key_count(), 0);
    }

    #[test]
    fn test_stats_after_admissions_and_clear() {
        let (limiter, clock) = manual_limiter();

        for _ in 0..3 {
            limiter.is_allowed("stats", 10, 60).unwrap();
            clock.advance(1.0);
        }

        let stats = limiter.stats("stats");
        assert_eq!(stats.total_requests, 3);
        assert_eq!(stats.first_request, Some(START));
        assert_eq!(stats.last_request, Some(START + 2.0));

        assert!(limiter.clear_key("stats"));
        assert_eq!(limiter.stats("stats"), WindowStats::empty());
    }

    #[test]
    fn test_stats_respects_requested_window() {
        let (limiter, clock) = manual_limiter();

        limiter.is_allowed("k", 10, 60).unwrap();
        clock.advance(20.0);
        limiter.is_allowed("k", 10, 60).unwrap();

        assert_eq!(limiter.stats_for("k", 60).total_requests, 2);
        assert_eq!(limiter.stats_for("k", 10).total_requests, 1);
    }

    #[test]
    fn test_stats_is_idempotent() {
        let (limiter, _clock) = manual_limiter();

        limiter.is_allowed("k", 2, 10).unwrap();
        for _ in 0..10 {
            assert_eq!(limiter.stats_for("k", 10).total_requests, 1);
        }

        assert!(allowed(&limiter, "k", 2, 10));
        assert!(!allowed(&limiter, "k", 2, 10));
    }

    #[test]
    fn test_stats_for_unknown_key_creates_nothing() {
        let limiter = RateLimiter::new();

        assert_eq!(limiter.stats("ghost"), WindowStats::empty());
        assert_eq!(limiter.key_count(), 0);
    }

    #[test]
    fn test_clear_key_resets_only_that_key() {
        let (limiter, _clock) = manual_limiter();

        for _ in 0..5 {
            limiter.is_allowed("c", 5, 10).unwrap();
        }
        limiter.is_allowed("d", 5, 10).unwrap();
        assert!(!allowed(&limiter, "c", 5, 10));

        limiter.clear_key("c");

        assert!(allowed(&limiter, "c", 5, 10));
        assert_eq!(limiter.stats_for("d", 10).total_requests, 1);
    }

    #[test]
    fn test_clear_unknown_key_is_noop() {
        let limiter = RateLimiter::new();
        assert!(!limiter.clear_key("never-seen"));
    }

    #[test]
    fn test_clear_all() {
        let (limiter, _clock) = manual_limiter();

        limiter.is_allowed("x", 5, 10).unwrap();
        limiter.is_allowed("y", 5, 10).unwrap();
        assert_eq!(limiter.key_count(), 2);

        limiter.clear();
        assert_eq!(limiter.key_count(), 0);
    }

    #[test]
    fn test_latest_policy_wins_in_latest_mode() {
        let (limiter, _clock) = manual_limiter();

        for _ in 0..3 {
            limiter.is_allowed("drift", 5, 10).unwrap();
        }

        // Tightening the limit applies immediately to the existing entries.
        assert!(!allowed(&limiter, "drift", 2, 10));
    }

    #[test]
    fn test_bound_mode_rejects_policy_change() {
        let clock = Arc::new(ManualClock::new(START));
        let config = LimiterConfig {
            policy_mode: PolicyMode::Bound,
            ..LimiterConfig::default()
        };
        let limiter = RateLimiter::with_config_and_clock(&config, clock);

        assert!(allowed(&limiter, "bound", 5, 10));

        let err = assert_err!(limiter.is_allowed("bound", 2, 10));
        match err {
            LimiterError::PolicyMismatch { key, bound, requested } => {
                assert_eq!(key, "bound");
                assert_eq!(bound, Policy::new(5, 10));
                assert_eq!(requested, Policy::new(2, 10));
            }
            other => panic!("unexpected error: {other}"),
        }
        // The rejected call recorded nothing.
        assert_eq!(limiter.stats_for("bound", 10).total_requests, 1);

        limiter.clear_key("bound");
        assert!(allowed(&limiter, "bound", 2, 10));
    }

    #[test]
    fn test_backwards_clock_keeps_window_sorted() {
        let (limiter, clock) = manual_limiter();

        limiter.is_allowed("skew", 10, 60).unwrap();
        clock.set(START - 5.0);
        limiter.is_allowed("skew", 10, 60).unwrap();

        let stats = limiter.stats_for("skew", 60);
        assert_eq!(stats.total_requests, 2);
        assert_eq!(stats.last_request, Some(START));
    }

    #[test]
    fn test_reap_idle_removes_stale_and_empty_keys() {
        let (limiter, clock) = manual_limiter();

        limiter.is_allowed("old", 5, 10).unwrap();
        limiter.is_allowed("empty", 0, 10).unwrap();
        clock.advance(500.0);
        limiter.is_allowed("recent", 5, 10).unwrap();
        clock.advance(500.0);

        let removed = limiter.reap_idle(600);

        assert_eq!(removed, 2);
        assert_eq!(limiter.key_count(), 1);
        assert_eq!(limiter.stats_for("recent", 3600).total_requests, 1);
    }

    #[test]
    fn test_sharded_config() {
        let config = LimiterConfig {
            shard_amount: Some(8),
            ..LimiterConfig::default()
        };
        let limiter = RateLimiter::with_config(&config);

        for i in 0..32 {
            assert!(allowed(&limiter, &format!("k{i}"), 1, 10));
        }
        assert_eq!(limiter.key_count(), 32);
    }

    #[test]
    fn test_invalid_shard_amount_falls_back() {
        let config = LimiterConfig {
            shard_amount: Some(3),
            ..LimiterConfig::default()
        };
        let limiter = RateLimiter::with_config(&config);
        assert!(allowed(&limiter, "k", 1, 10));
    }

    #[test]
    fn test_concurrent_first_use_admits_once() {
        let (limiter, _clock) = manual_limiter();

        let limiter = &limiter;
        let admitted: usize = std::thread::scope(|scope| {
            let handles: Vec<_> = (0..16)
                .map(|_| scope.spawn(move || allowed(limiter, "race", 1, 60) as usize))
                .collect();
            handles.into_iter().map(|h| h.join().unwrap()).sum()
        });

        assert_eq!(admitted, 1);
        assert_eq!(limiter.key_count(), 1);
    }

    #[test]
    fn test_concurrent_same_key_never_over_admits() {
        let limiter = RateLimiter::new();
        let limiter = &limiter;

        let admitted: usize = std::thread::scope(|scope| {
            let handles: Vec<_> = (0..8)
                .map(|_| {
                    scope.spawn(move || {
                        (0..50)
                            .filter(|_| allowed(limiter, "shared", 100, 60))
                            .count()
                    })
                })
                .collect();
            handles.into_iter().map(|h| h.join().unwrap()).sum()
        });

        assert_eq!(admitted, 100);
        assert_eq!(limiter.stats_for("shared", 60).total_requests, 100);
        assert_eq!(limiter.rejected_total(), 300);
    }

    #[test]
    fn test_concurrent_keys_each_get_full_quota() {
        let (limiter, _clock) = manual_limiter();

        std::thread::scope(|scope| {
            for t in 0..8 {
                let limiter = &limiter;
                scope.spawn(move || {
                    let key = format!("tenant-{t}");
                    for _ in 0..10 {
                        assert!(allowed(limiter, &key, 10, 60));
                    }
                    assert!(!allowed(limiter, &key, 10, 60));
                });
            }
        });

        assert_eq!(limiter.key_count(), 8);
        assert_eq!(limiter.admitted_total(), 80);
    }

    #[test]
    fn test_global_is_shared() {
        let first = global();
        let second = global();

        assert!(std::ptr::eq(first, second));

        first.is_allowed("global-test-key", 1, 10).unwrap();
        assert!(!allowed(second, "global-test-key", 1, 10));
    }
}
