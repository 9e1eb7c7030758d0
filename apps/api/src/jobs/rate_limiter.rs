//! Sliding-window rate limiter for outbound provider calls.
//!
//! Keeps the grant timestamps of the last 60 seconds. The window lock is held for the
//! whole of `acquire`, including any sleep, so callers are granted strictly in the
//! order they reached the lock and no two callers can act on the same stale window.

use std::collections::VecDeque;
use std::num::NonZeroU32;
use std::time::Duration;

use tokio::sync::Mutex;
use tokio::time::{sleep, Instant};
use tracing::debug;

pub const WINDOW: Duration = Duration::from_secs(60);

#[derive(Debug)]
pub struct RateLimiter {
    limit: usize,
    window: Duration,
    grants: Mutex<VecDeque<Instant>>,
}

impl RateLimiter {
    /// A limiter granting at most `per_minute` calls in any rolling minute.
    pub fn per_minute(per_minute: NonZeroU32) -> Self {
        Self::with_window(per_minute, WINDOW)
    }

    pub fn with_window(limit: NonZeroU32, window: Duration) -> Self {
        let limit = limit.get() as usize;
        Self {
            limit,
            window,
            grants: Mutex::new(VecDeque::with_capacity(limit)),
        }
    }

    pub fn limit(&self) -> usize {
        self.limit
    }

    /// Waits until a call may be made and records the grant. Never fails.
    pub async fn acquire(&self) {
        // tokio's Mutex queues waiters FIFO.
        let mut grants = self.grants.lock().await;

        loop {
            let now = Instant::now();
            while let Some(&oldest) = grants.front() {
                if now.duration_since(oldest) >= self.window {
                    grants.pop_front();
                } else {
                    break;
                }
            }

            if grants.len() < self.limit {
                grants.push_back(now);
                return;
            }

            let Some(&oldest) = grants.front() else {
                continue;
            };
            let wait = self.window - now.duration_since(oldest);
            debug!(wait_ms = wait.as_millis() as u64, "rate limit reached, waiting");
            sleep(wait).await;
        }
    }

    /// Number of grants inside the current window.
    #[cfg(test)]
    pub async fn in_window(&self) -> usize {
        let grants = self.grants.lock().await;
        let now = Instant::now();
        grants
            .iter()
            .filter(|&&t| now.duration_since(t) < self.window)
            .count()
    }
}
