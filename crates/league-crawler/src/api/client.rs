//! Rate-limited, retrying fetcher.

use super::rate_limiter::RateLimiter;
use super::transport::{HttpTransport, Transport};
use super::types::*;
use anyhow::Result;
use shared::config::CrawlerConfig;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Mutex;
use tokio::time::{sleep, timeout};
use tracing::{debug, warn};

/// Retry behaviour for transient failures
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    /// Total attempts including the first
    pub max_attempts: u32,
    pub backoff_base: Duration,
}

impl RetryPolicy {
    /// Delay after the failed attempt with the given zero-based index
    pub fn backoff(&self, attempt: u32) -> Duration {
        self.backoff_base
            .saturating_mul(2u32.saturating_pow(attempt.min(16)))
    }
}

/// Issues requests through a transport with shared pacing and retries
#[derive(Clone)]
pub struct Fetcher {
    transport: Arc<dyn Transport>,
    rate_limiter: Arc<Mutex<RateLimiter>>,
    counters: Arc<FetchCounters>,
    retry: RetryPolicy,
    /// Hard bound on one attempt, independent of backoff
    request_timeout: Duration,
}

impl Fetcher {
    pub fn new(
        transport: Arc<dyn Transport>,
        rate_limiter: RateLimiter,
        retry: RetryPolicy,
        request_timeout: Duration,
    ) -> Self {
        Self {
            transport,
            rate_limiter: Arc::new(Mutex::new(rate_limiter)),
            counters: Arc::new(FetchCounters::new()),
            retry,
            request_timeout,
        }
    }

    /// Production fetcher over HTTP
    pub fn from_config(config: &CrawlerConfig) -> Result<Self> {
        let request_timeout = Duration::from_secs(config.request_timeout_secs);
        let transport = HttpTransport::new(&config.user_agent, request_timeout)?;

        Ok(Self::new(
            Arc::new(transport),
            RateLimiter::new(
                Duration::from_millis(config.rate_limit.min_interval_ms),
                config.rate_limit.requests_per_minute,
            ),
            RetryPolicy {
                max_attempts: config.retry.max_attempts.max(1),
                backoff_base: Duration::from_millis(config.retry.backoff_base_ms),
            },
            request_timeout,
        ))
    }

    pub fn counters(&self) -> Arc<FetchCounters> {
        Arc::clone(&self.counters)
    }

    /// Fetch a request, retrying transient failures.
    ///
    /// Never fails: every problem is folded into the outcome's status.
    pub async fn fetch(&self, request: &Request) -> FetchOutcome {
        let started = Instant::now();
        let max_attempts = self.retry.max_attempts.max(1);

        let mut status = FetchStatus::TransientError;
        let mut http_status = 0;
        let mut body = None;
        let mut attempts = 0;

        for attempt in 0..max_attempts {
            if attempt > 0 {
                let delay = self.retry.backoff(attempt - 1);
                debug!(url = %request.url, delay_ms = delay.as_millis() as u64, "Retrying after delay");
                sleep(delay).await;
            }

            self.rate_limiter.lock().await.acquire().await;
            self.counters.record_attempt(attempt > 0);
            attempts += 1;

            debug!(url = %request.url, attempt = attempt + 1, "Making request");

            match timeout(self.request_timeout, self.transport.send(request)).await {
                Err(_) => {
                    warn!(url = %request.url, attempt = attempt + 1, "Request timed out");
                    status = FetchStatus::TransientError;
                }
                Ok(Err(TransportError::Other(e))) => {
                    warn!(url = %request.url, error = %e, "Request failed permanently");
                    status = FetchStatus::PermanentError;
                    break;
                }
                Ok(Err(e)) => {
                    warn!(url = %request.url, attempt = attempt + 1, error = %e, "Request error");
                    status = FetchStatus::TransientError;
                }
                Ok(Ok(response)) => {
                    http_status = response.status;
                    status = FetchStatus::from_http(response.status);
                    match status {
                        FetchStatus::Success => {
                            body = Some(response.body);
                            break;
                        }
                        FetchStatus::TransientError => {
                            warn!(
                                url = %request.url,
                                status = response.status,
                                attempt = attempt + 1,
                                "Transient HTTP status"
                            );
                        }
                        FetchStatus::NotFound | FetchStatus::PermanentError => {
                            debug!(url = %request.url, status = response.status, "Not retrying");
                            break;
                        }
                    }
                }
            }
        }

        let outcome = FetchOutcome {
            status,
            body,
            http_status,
            elapsed: started.elapsed(),
            attempts,
        };
        self.counters.record_outcome(&outcome);
        outcome
    }
}
