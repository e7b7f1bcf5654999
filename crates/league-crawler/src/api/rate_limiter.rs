//! Request pacing shared by every worker.
//!
//! Enforces a minimum spacing between requests and a cap per rolling minute.

use std::collections::VecDeque;
use std::time::{Duration, Instant};
use tokio::time::sleep;

const WINDOW: Duration = Duration::from_secs(60);

/// Rate limiter with dual constraints (minimum interval and per-minute cap)
#[derive(Debug)]
pub struct RateLimiter {
    min_interval: Duration,
    /// Zero disables the per-minute cap
    max_per_minute: u32,
    last_request: Option<Instant>,
    /// Request timestamps in the last minute, oldest first
    recent_requests: VecDeque<Instant>,
}

impl RateLimiter {
    pub fn new(min_interval: Duration, max_per_minute: u32) -> Self {
        Self {
            min_interval,
            max_per_minute,
            last_request: None,
            recent_requests: VecDeque::with_capacity(max_per_minute as usize),
        }
    }

    /// No pacing at all
    pub fn unlimited() -> Self {
        Self::new(Duration::ZERO, 0)
    }

    /// Wait until a request can be made, respecting both limits
    pub async fn acquire(&mut self) {
        self.prune(Instant::now());

        if self.max_per_minute > 0 && self.recent_requests.len() >= self.max_per_minute as usize {
            if let Some(&oldest) = self.recent_requests.front() {
                let elapsed = oldest.elapsed();
                if elapsed < WINDOW {
                    let wait_time = WINDOW - elapsed;
                    tracing::debug!(
                        wait_ms = wait_time.as_millis() as u64,
                        "Rate limit: waiting for per-minute cap"
                    );
                    sleep(wait_time).await;
                }
            }
            self.prune(Instant::now());
        }

        if let Some(last) = self.last_request {
            let elapsed = last.elapsed();
            if elapsed < self.min_interval {
                let wait_time = self.min_interval - elapsed;
                tracing::trace!(
                    wait_ms = wait_time.as_millis() as u64,
                    "Rate limit: waiting for minimum interval"
                );
                sleep(wait_time).await;
            }
        }

        let request_time = Instant::now();
        self.last_request = Some(request_time);
        self.recent_requests.push_back(request_time);
    }

    /// Get the current number of requests in the last minute
    pub fn current_minute_count(&mut self) -> usize {
        self.prune(Instant::now());
        self.recent_requests.len()
    }

    fn prune(&mut self, now: Instant) {
        while let Some(&oldest) = self.recent_requests.front() {
            if now.duration_since(oldest) >= WINDOW {
                self.recent_requests.pop_front();
            } else {
                break;
            }
        }
    }
}
