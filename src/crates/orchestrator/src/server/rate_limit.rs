//! Per-client fixed-window send limiter (SPEC_FULL.md §4.2, §8 property
//! "at most `messages_per_second` sends succeed within one wall-clock
//! second").
//!
//! `api::ws::rate_limit::TokenBucket` refills continuously and grants an
//! initial burst of `capacity = messages_per_second * 10`, which lets a
//! fresh client exceed the per-second budget on its first second — not
//! reused here. This tracks a hard window instead: a counter that resets
//! the instant a new wall-clock second begins, with no burst allowance.

use dashmap::DashMap;
use std::sync::atomic::{AtomicI64, AtomicU32, Ordering};
use tokio::time::Instant;

struct Window {
    started_at_ms: AtomicI64,
    count: AtomicU32,
}

/// Tracks one fixed window per client, keyed by client id.
pub struct RateLimiter {
    windows: DashMap<String, Window>,
    messages_per_second: u32,
    epoch: Instant,
}

impl RateLimiter {
    pub fn new(messages_per_second: u32) -> Self {
        Self {
            windows: DashMap::new(),
            messages_per_second,
            epoch: Instant::now(),
        }
    }

    /// Record an attempted send for `client_id` at the current instant.
    /// Returns `true` if it is within budget (and counts toward it), or
    /// `false` if the client is already at its per-second cap.
    pub fn try_consume(&self, client_id: &str) -> bool {
        let now_ms = self.epoch.elapsed().as_millis() as i64;
        let window = self
            .windows
            .entry(client_id.to_string())
            .or_insert_with(|| Window {
                started_at_ms: AtomicI64::new(now_ms),
                count: AtomicU32::new(0),
            });

        let started_at = window.started_at_ms.load(Ordering::SeqCst);
        if now_ms - started_at >= 1000 {
            window.started_at_ms.store(now_ms, Ordering::SeqCst);
            window.count.store(1, Ordering::SeqCst);
            return true;
        }

        let prior = window.count.fetch_add(1, Ordering::SeqCst);
        prior < self.messages_per_second
    }

    pub fn remove(&self, client_id: &str) {
        self.windows.remove(client_id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn allows_exactly_budget_within_one_window() {
        let limiter = RateLimiter::new(2);
        assert!(limiter.try_consume("c1"));
        assert!(limiter.try_consume("c1"));
        assert!(!limiter.try_consume("c1"));
    }

    #[test]
    fn tracks_clients_independently() {
        let limiter = RateLimiter::new(1);
        assert!(limiter.try_consume("a"));
        assert!(limiter.try_consume("b"));
        assert!(!limiter.try_consume("a"));
    }

    #[tokio::test(start_paused = true)]
    async fn window_resets_after_one_second() {
        let limiter = RateLimiter::new(1);
        assert!(limiter.try_consume("c1"));
        assert!(!limiter.try_consume("c1"));

        tokio::time::advance(std::time::Duration::from_millis(1001)).await;
        assert!(limiter.try_consume("c1"));
    }
}
