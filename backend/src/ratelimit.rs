//! Per-user message rate limiting: a sliding 60-second window with a
//! per-minute cap plus a 1-second burst cap on consecutive sub-second
//! arrivals. Breaches reject the single message; the socket stays open.

use std::collections::HashMap;

use tokio::sync::RwLock;
use tracing::warn;

#[derive(Debug, Clone, Copy)]
pub struct RateLimitConfig {
    pub requests_per_minute: u32,
    pub burst_size: u32,
    pub window_secs: f64,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self { requests_per_minute: 100, burst_size: 20, window_secs: 60.0 }
    }
}

#[derive(Debug, Default, Clone, Copy)]
struct UserWindow {
    window_start: f64,
    requests: u32,
    /// Length of the current run of sub-second arrivals, including the
    /// message under evaluation
    burst: u32,
    last_arrival: f64,
}

pub struct RateLimiter {
    config: RateLimitConfig,
    windows: RwLock<HashMap<String, UserWindow>>,
}

impl RateLimiter {
    pub fn new(config: RateLimitConfig) -> Self {
        Self { config, windows: RwLock::new(HashMap::new()) }
    }

    /// Record one arrival for `user_id` at `now` (seconds) and decide whether
    /// it is admitted. Rejected messages still count as arrivals for burst
    /// tracking.
    pub async fn check(&self, user_id: &str, now: f64) -> bool {
        let mut windows = self.windows.write().await;
        let window = windows.entry(user_id.to_string()).or_default();

        // Slide the window
        if now - window.window_start >= self.config.window_secs {
            window.window_start = now;
            window.requests = 0;
            window.burst = 0;
        }

        // Burst: consecutive arrivals under one second apart
        if window.last_arrival > 0.0 && now - window.last_arrival < 1.0 {
            window.burst += 1;
        } else {
            window.burst = 1;
        }
        window.last_arrival = now;

        if window.burst > self.config.burst_size {
            warn!("Rate limit burst breach for user {user_id}");
            return false;
        }

        if window.requests >= self.config.requests_per_minute {
            warn!("Rate limit window breach for user {user_id}");
            return false;
        }

        window.requests += 1;
        true
    }

    /// Drop per-user state on disconnect.
    pub async fn forget(&self, user_id: &str) {
        self.windows.write().await.remove(user_id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn twenty_first_subsecond_message_is_rejected() {
        let limiter = RateLimiter::new(RateLimitConfig::default());
        let base = 1000.0;

        // 21 frames within one second: first 20 admitted, 21st rejected
        for i in 0..20 {
            let now = base + i as f64 * 0.04;
            assert!(limiter.check("u1", now).await, "message {} rejected early", i + 1);
        }
        assert!(!limiter.check("u1", base + 0.9).await);

        // After a >1s gap the burst resets and messages flow again
        assert!(limiter.check("u1", base + 2.0).await);
    }

    #[tokio::test]
    async fn per_minute_cap_applies_across_bursts() {
        let limiter = RateLimiter::new(RateLimitConfig::default());
        let mut now = 0.0;
        let mut admitted = 0;

        // Groups of 20 fast messages separated by burst-resetting gaps,
        // all inside one 60 s window
        for group in 0..5 {
            now = 10.0 + group as f64 * 2.0;
            for i in 0..20 {
                if limiter.check("u1", now + i as f64 * 0.01).await {
                    admitted += 1;
                }
            }
        }
        assert_eq!(admitted, 100);

        // 101st admitted message would exceed the window cap
        assert!(!limiter.check("u1", now + 1.5).await);

        // A fresh window admits again
        assert!(limiter.check("u1", 80.0).await);
    }

    #[tokio::test]
    async fn users_are_limited_independently() {
        let limiter = RateLimiter::new(RateLimitConfig::default());
        let base = 500.0;
        for i in 0..20 {
            assert!(limiter.check("a", base + i as f64 * 0.01).await);
        }
        assert!(!limiter.check("a", base + 0.5).await);
        // A different user is unaffected by a's burst
        assert!(limiter.check("b", base + 0.5).await);
    }

    #[tokio::test]
    async fn forget_clears_state() {
        let limiter = RateLimiter::new(RateLimitConfig::default());
        let base = 100.0;
        for i in 0..21 {
            let _ = limiter.check("u1", base + i as f64 * 0.01).await;
        }
        assert!(!limiter.check("u1", base + 0.3).await);

        limiter.forget("u1").await;
        assert!(limiter.check("u1", base + 0.31).await);
    }
}
