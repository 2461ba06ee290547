//! [C] Rate limiter — fixed-window per-key quota with a janitor.
//!
//! Hand-built on `dashmap` rather than the teacher's `governor` dependency:
//! `governor`'s GCRA cells don't expose the fixed-window-per-key +
//! `waitForToken` polling contract the spec's testable properties require
//! (see SPEC_FULL.md section 2 and DESIGN.md [C]).

use dashmap::DashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::time::sleep;

struct Window {
    count: u64,
    limit: u64,
    window: Duration,
    window_start: Instant,
    last_touched: Instant,
}

impl Window {
    fn new(limit: u64, window: Duration) -> Self {
        let now = Instant::now();
        Self {
            count: 0,
            limit,
            window,
            window_start: now,
            last_touched: now,
        }
    }

    fn roll_if_expired(&mut self, now: Instant) {
        if now.duration_since(self.window_start) >= self.window {
            self.window_start = now;
            self.count = 0;
        }
    }
}

/// Per-key fixed-window rate limiter with a background janitor that
/// drops windows idle for >= 2x their period.
pub struct RateLimiter {
    windows: Arc<DashMap<String, Window>>,
    janitor: tokio::task::JoinHandle<()>,
}

impl RateLimiter {
    pub fn new() -> Self {
        let windows: Arc<DashMap<String, Window>> = Arc::new(DashMap::new());
        let janitor_windows = windows.clone();
        let janitor = tokio::spawn(async move {
            loop {
                sleep(Duration::from_secs(60)).await;
                let now = Instant::now();
                janitor_windows.retain(|_, w| {
                    now.duration_since(w.last_touched) < w.window * 2
                });
            }
        });
        Self { windows, janitor }
    }

    /// Configure (or reconfigure) the quota for `key`.
    pub fn set_limit(&self, key: &str, count: u64, window: Duration) {
        self.windows
            .entry(key.to_string())
            .and_modify(|w| {
                w.limit = count;
                w.window = window;
            })
            .or_insert_with(|| Window::new(count, window));
    }

    /// Attempt to consume one token for `key`. Returns `true` if granted.
    pub fn check(&self, key: &str) -> bool {
        let now = Instant::now();
        let mut entry = self
            .windows
            .entry(key.to_string())
            .or_insert_with(|| Window::new(u64::MAX, Duration::from_secs(1)));
        entry.roll_if_expired(now);
        entry.last_touched = now;
        if entry.count < entry.limit {
            entry.count += 1;
            true
        } else {
            false
        }
    }

    /// Poll `check` at ~100ms intervals until a token is granted or
    /// `deadline` elapses, in which case this returns `false`.
    pub async fn wait_for_token(&self, key: &str, deadline: Duration) -> bool {
        let start = Instant::now();
        loop {
            if self.check(key) {
                return true;
            }
            if start.elapsed() >= deadline {
                return false;
            }
            sleep(Duration::from_millis(100)).await;
        }
    }

    /// Number of tracked keys (test/introspection helper).
    pub fn tracked_keys(&self) -> usize {
        self.windows.len()
    }
}

impl Default for RateLimiter {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for RateLimiter {
    fn drop(&mut self) {
        self.janitor.abort();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn at_most_count_checks_grant_per_window() {
        let rl = RateLimiter::new();
        rl.set_limit("k", 3, Duration::from_secs(60));
        let grants: Vec<bool> = (0..5).map(|_| rl.check("k")).collect();
        assert_eq!(grants.iter().filter(|&&g| g).count(), 3);
    }

    #[tokio::test]
    async fn window_resets_after_expiry() {
        let rl = RateLimiter::new();
        rl.set_limit("k", 1, Duration::from_millis(50));
        assert!(rl.check("k"));
        assert!(!rl.check("k"));
        tokio::time::sleep(Duration::from_millis(60)).await;
        assert!(rl.check("k"));
    }

    #[tokio::test]
    async fn wait_for_token_terminates_when_a_window_grants() {
        let rl = RateLimiter::new();
        rl.set_limit("k", 1, Duration::from_millis(50));
        assert!(rl.check("k")); // consume the only token
        let got = rl.wait_for_token("k", Duration::from_millis(500)).await;
        assert!(got);
    }

    #[tokio::test]
    async fn wait_for_token_gives_up_at_deadline() {
        let rl = RateLimiter::new();
        rl.set_limit("k", 0, Duration::from_secs(60));
        let got = rl.wait_for_token("k", Duration::from_millis(150)).await;
        assert!(!got);
    }

    #[tokio::test]
    async fn different_keys_have_independent_quotas() {
        let rl = RateLimiter::new();
        rl.set_limit("a", 1, Duration::from_secs(60));
        rl.set_limit("b", 1, Duration::from_secs(60));
        assert!(rl.check("a"));
        assert!(rl.check("b"));
        assert!(!rl.check("a"));
    }
}
