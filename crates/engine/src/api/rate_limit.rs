//! Sliding-window request limiter shared by every exchange client
//!
//! Public (market data) and private (account/order) calls are budgeted
//! separately. A caller over budget waits for the oldest request in the
//! window to expire instead of failing.

use std::collections::VecDeque;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::debug;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestGroup {
    Public,
    Private,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RateLimitConfig {
    pub public_per_window: usize,
    pub private_per_window: usize,
    pub window_ms: u64,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            public_per_window: 10,
            private_per_window: 8,
            window_ms: 1000,
        }
    }
}

struct Window {
    max: usize,
    sent: Mutex<VecDeque<Instant>>,
}

impl Window {
    fn new(max: usize) -> Self {
        Self {
            max: max.max(1),
            sent: Mutex::new(VecDeque::new()),
        }
    }

    async fn acquire(&self, window: Duration, group: RequestGroup) {
        loop {
            let wait = {
                let mut sent = self.sent.lock().await;
                let now = Instant::now();
                while sent.front().is_some_and(|t| now.duration_since(*t) >= window) {
                    sent.pop_front();
                }
                if sent.len() < self.max {
                    sent.push_back(now);
                    return;
                }
                match sent.front() {
                    Some(oldest) => window.saturating_sub(now.duration_since(*oldest)),
                    None => Duration::ZERO,
                }
            };
            debug!(?group, wait_ms = wait.as_millis() as u64, "Rate limit reached, waiting");
            tokio::time::sleep(wait).await;
        }
    }
}

pub struct RateLimiter {
    window: Duration,
    public: Window,
    private: Window,
}

impl RateLimiter {
    pub fn new(config: &RateLimitConfig) -> Self {
        Self {
            window: Duration::from_millis(config.window_ms),
            public: Window::new(config.public_per_window),
            private: Window::new(config.private_per_window),
        }
    }

    /// Wait until a request in `group` fits the budget, then account for it
    pub async fn acquire(&self, group: RequestGroup) {
        let bucket = match group {
            RequestGroup::Public => &self.public,
            RequestGroup::Private => &self.private,
        };
        bucket.acquire(self.window, group).await;
    }
}

impl Default for RateLimiter {
    fn default() -> Self {
        Self::new(&RateLimitConfig::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    fn limiter(per_window: usize, window_ms: u64) -> RateLimiter {
        RateLimiter::new(&RateLimitConfig {
            public_per_window: per_window,
            private_per_window: per_window,
            window_ms,
        })
    }

    #[tokio::test]
    async fn test_under_budget_does_not_wait() {
        let limiter = limiter(5, 1000);
        let start = Instant::now();
        for _ in 0..5 {
            limiter.acquire(RequestGroup::Public).await;
        }
        assert!(start.elapsed() < Duration::from_millis(100));
    }

    #[tokio::test]
    async fn test_over_budget_waits_for_window() {
        let limiter = limiter(2, 150);
        let start = Instant::now();
        for _ in 0..3 {
            limiter.acquire(RequestGroup::Private).await;
        }
        assert!(start.elapsed() >= Duration::from_millis(140));
    }

    #[tokio::test]
    async fn test_groups_are_independent() {
        let limiter = limiter(1, 1000);
        let start = Instant::now();
        limiter.acquire(RequestGroup::Public).await;
        limiter.acquire(RequestGroup::Private).await;
        assert!(start.elapsed() < Duration::from_millis(100));
    }

    #[tokio::test]
    async fn test_shared_across_tasks() {
        let limiter = Arc::new(limiter(3, 200));
        let start = Instant::now();
        let handles: Vec<_> = (0..6)
            .map(|_| {
                let limiter = limiter.clone();
                tokio::spawn(async move { limiter.acquire(RequestGroup::Public).await })
            })
            .collect();
        for h in handles {
            h.await.unwrap();
        }
        assert!(start.elapsed() >= Duration::from_millis(190));
    }
}
