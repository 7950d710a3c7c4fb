//! Sliding-window rate limiter.
//!
//! Admits at most `limit` events per key within the trailing window. Every
//! call prunes the key's history lazily, so cost is proportional to the
//! number of admissions still inside the window.

use std::collections::{HashMap, VecDeque};
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tracing::debug;

/// Limit applied to keys without an explicit non-zero override.
pub const DEFAULT_RATE_LIMIT: u32 = 1000;

/// Key used for the process-wide send budget.
pub const GLOBAL_RATE_KEY: &str = "GLOBAL";

#[derive(Default)]
struct LimiterState {
    limits: HashMap<String, u32>,
    history: HashMap<String, VecDeque<Instant>>,
}

/// Exact sliding-window admission control keyed by string.
///
/// A single lock covers every key, so all `allow`/`set_limit` calls are
/// serialized.
pub struct SlidingWindowLimiter {
    window: Duration,
    state: Mutex<LimiterState>,
}

impl SlidingWindowLimiter {
    pub fn new(window: Duration) -> Self {
        Self {
            window,
            state: Mutex::new(LimiterState::default()),
        }
    }

    pub fn window(&self) -> Duration {
        self.window
    }

    /// Record an override for `key`.
    ///
    /// A limit of 0 does not mean "admit nothing": it restores
    /// [`DEFAULT_RATE_LIMIT`] for the key.
    pub fn set_limit(&self, key: &str, limit: u32) {
        let mut state = self.state.lock();
        state.limits.insert(key.to_string(), limit);
        debug!(key, limit, "rate_limit_set");
    }

    /// Limit currently in force for `key`.
    pub fn effective_limit(&self, key: &str) -> u32 {
        let state = self.state.lock();
        effective(&state.limits, key)
    }

    /// Try to admit one event for `key` now.
    pub fn allow(&self, key: &str) -> bool {
        let mut state = self.state.lock();
        // Read the clock under the lock so histories stay ordered.
        self.admit(&mut state, key, Instant::now())
    }

    /// Try to admit one event for `key` at `now`.
    ///
    /// Entries at or before `now - window` are dropped first; the event is
    /// recorded only when the remaining count is below the limit.
    pub fn allow_at(&self, key: &str, now: Instant) -> bool {
        let mut state = self.state.lock();
        self.admit(&mut state, key, now)
    }

    fn admit(&self, state: &mut LimiterState, key: &str, now: Instant) -> bool {
        let limit = effective(&state.limits, key) as usize;
        let history = state.history.entry(key.to_string()).or_default();

        // Oldest admissions sit at the front.
        // An instant before the process clock origin cannot be built; nothing
        // can have expired yet in that case.
        if let Some(cutoff) = now.checked_sub(self.window) {
            while history.front().is_some_and(|t| *t <= cutoff) {
                history.pop_front();
            }
        }

        if history.len() >= limit {
            return false;
        }

        history.push_back(now);
        true
    }
}

fn effective(limits: &HashMap<String, u32>, key: &str) -> u32 {
    match limits.get(key) {
        Some(&n) if n != 0 => n,
        _ => DEFAULT_RATE_LIMIT,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ms(n: u64) -> Duration {
        Duration::from_millis(n)
    }

    #[test]
    fn test_window_expiry_readmits() {
        let limiter = SlidingWindowLimiter::new(Duration::from_secs(1));
        limiter.set_limit("K", 2);
        let t0 = Instant::now();

        assert!(limiter.allow_at("K", t0));
        assert!(limiter.allow_at("K", t0 + ms(100)));
        assert!(!limiter.allow_at("K", t0 + ms(200)));
        // t0 has left the window.
        assert!(limiter.allow_at("K", t0 + ms(1100)));
        // t0+100ms sits exactly on the cutoff and is dropped too.
        assert!(limiter.allow_at("K", t0 + ms(1101)));
        assert!(!limiter.allow_at("K", t0 + ms(1102)));
    }

    #[test]
    fn test_denied_calls_are_not_recorded() {
        let limiter = SlidingWindowLimiter::new(Duration::from_secs(1));
        limiter.set_limit("K", 1);
        let t0 = Instant::now();

        assert!(limiter.allow_at("K", t0));
        for i in 1..10 {
            assert!(!limiter.allow_at("K", t0 + ms(i * 50)));
        }
        // Only the first admission occupies the window.
        assert!(limiter.allow_at("K", t0 + ms(1001)));
    }

    #[test]
    fn test_zero_limit_means_default() {
        let limiter = SlidingWindowLimiter::new(Duration::from_secs(1));
        limiter.set_limit("K", 0);
        assert_eq!(limiter.effective_limit("K"), DEFAULT_RATE_LIMIT);
        assert!(limiter.allow("K"));
    }

    #[test]
    fn test_default_limit_bounds_admissions() {
        let limiter = SlidingWindowLimiter::new(Duration::from_secs(60));
        let t0 = Instant::now();

        let admitted = (0..DEFAULT_RATE_LIMIT + 50)
            .filter(|i| limiter.allow_at("K", t0 + Duration::from_micros(*i as u64)))
            .count();
        assert_eq!(admitted, DEFAULT_RATE_LIMIT as usize);
    }

    #[test]
    fn test_keys_are_independent() {
        let limiter = SlidingWindowLimiter::new(Duration::from_secs(1));
        limiter.set_limit("a", 1);
        limiter.set_limit("b", 1);
        let t0 = Instant::now();

        assert!(limiter.allow_at("a", t0));
        assert!(!limiter.allow_at("a", t0));
        assert!(limiter.allow_at("b", t0));
    }

    #[test]
    fn test_no_window_ever_exceeds_limit() {
        let limiter = SlidingWindowLimiter::new(ms(100));
        limiter.set_limit("K", 3);
        let t0 = Instant::now();

        let mut attempts: Vec<Instant> = (0..500u64)
            .map(|i| t0 + ms(i * 7 % 1000) + Duration::from_micros(i))
            .collect();
        attempts.sort();

        let accepted: Vec<Instant> = attempts
            .into_iter()
            .filter(|t| limiter.allow_at("K", *t))
            .collect();

        for (i, start) in accepted.iter().enumerate() {
            let in_window = accepted[i..]
                .iter()
                .take_while(|t| t.duration_since(*start) < ms(100))
                .count();
            assert!(in_window <= 3, "window starting at #{i} admitted {in_window}");
        }
    }

    #[test]
    fn test_concurrent_callers_share_budget() {
        use std::sync::Arc;

        let limiter = Arc::new(SlidingWindowLimiter::new(Duration::from_secs(60)));
        limiter.set_limit(GLOBAL_RATE_KEY, 100);

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let limiter = Arc::clone(&limiter);
                std::thread::spawn(move || {
                    (0..50).filter(|_| limiter.allow(GLOBAL_RATE_KEY)).count()
                })
            })
            .collect();

        let total: usize = handles.into_iter().map(|h| h.join().unwrap()).sum();
        assert_eq!(total, 100);
    }
}
