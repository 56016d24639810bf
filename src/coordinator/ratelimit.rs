//! Sliding-window rate limiter keyed by `(guild, user)`.

use std::collections::VecDeque;
use std::time::Duration;

use dashmap::DashMap;
use tokio::time::Instant;

use crate::config::RateLimitConfig;
use crate::error::{NetworkError, Result};

pub struct RateLimiter {
    windows: DashMap<String, VecDeque<Instant>>,
    window: Duration,
    max_requests: usize,
}

impl RateLimiter {
    pub fn new(config: &RateLimitConfig) -> Self {
        Self {
            windows: DashMap::new(),
            window: Duration::from_secs(config.window_secs),
            max_requests: config.max_requests.max(1),
        }
    }

    fn key(guild_id: &str, user_id: &str) -> String {
        format!("{guild_id}:{user_id}")
    }

    /// Record one event, or reject with the wait time when the window is
    /// full. Rejections do not consume window slots.
    pub fn check(&self, guild_id: &str, user_id: &str) -> Result<()> {
        let now = Instant::now();
        let mut window = self.windows.entry(Self::key(guild_id, user_id)).or_default();

        while let Some(front) = window.front() {
            if now.duration_since(*front) >= self.window {
                window.pop_front();
            } else {
                break;
            }
        }

        if window.len() >= self.max_requests {
            let retry_after = window
                .front()
                .map(|oldest| self.window.saturating_sub(now.duration_since(*oldest)))
                .unwrap_or(self.window);
            return Err(NetworkError::RateLimited {
                retry_after_secs: retry_after.as_secs().max(1),
            }
            .into());
        }

        window.push_back(now);
        Ok(())
    }

    /// Drop windows with no recent events. Called by the periodic sweep.
    pub fn prune(&self) {
        let now = Instant::now();
        self.windows.retain(|_, window| {
            window
                .back()
                .map(|last| now.duration_since(*last) < self.window)
                .unwrap_or(false)
        });
    }

    pub fn tracked_keys(&self) -> usize {
        self.windows.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorCode;

    fn limiter(max: usize, window_secs: u64) -> RateLimiter {
        RateLimiter::new(&RateLimitConfig {
            window_secs,
            max_requests: max,
        })
    }

    #[tokio::test]
    async fn allows_up_to_the_cap_then_rejects() {
        let limiter = limiter(10, 10);
        for _ in 0..10 {
            limiter.check("g1", "u1").unwrap();
        }
        let err = limiter.check("g1", "u1").unwrap_err();
        assert_eq!(err.code(), ErrorCode::RateLimited);
        assert!(err.retry_after().is_some());
    }

    #[tokio::test]
    async fn windows_are_per_guild_and_user() {
        let limiter = limiter(2, 10);
        limiter.check("g1", "u1").unwrap();
        limiter.check("g1", "u1").unwrap();
        assert!(limiter.check("g1", "u1").is_err());

        // A different user and a different guild are unaffected.
        limiter.check("g1", "u2").unwrap();
        limiter.check("g2", "u1").unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn window_slides() {
        let limiter = limiter(2, 10);
        limiter.check("g1", "u1").unwrap();
        limiter.check("g1", "u1").unwrap();
        assert!(limiter.check("g1", "u1").is_err());

        tokio::time::advance(Duration::from_secs(11)).await;
        assert!(limiter.check("g1", "u1").is_ok());
    }

    #[tokio::test(start_paused = true)]
    async fn prune_drops_cold_windows() {
        let limiter = limiter(2, 10);
        limiter.check("g1", "u1").unwrap();
        assert_eq!(limiter.tracked_keys(), 1);

        tokio::time::advance(Duration::from_secs(11)).await;
        limiter.prune();
        assert_eq!(limiter.tracked_keys(), 0);
    }
}
