//! Request and outcome types for the statistics archive.

use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Method {
    Get,
    Post,
}

/// One logical request against the remote catalog
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Request {
    pub method: Method,
    pub url: String,
    /// Form fields for POST requests
    pub form: Vec<(String, String)>,
}

impl Request {
    pub fn get(url: impl Into<String>) -> Self {
        Self {
            method: Method::Get,
            url: url.into(),
            form: Vec::new(),
        }
    }

    pub fn post(url: impl Into<String>, form: Vec<(String, String)>) -> Self {
        Self {
            method: Method::Post,
            url: url.into(),
            form,
        }
    }
}

/// What a single transport attempt returned
#[derive(Debug, Clone)]
pub struct RawResponse {
    pub status: u16,
    pub body: String,
}

/// A transport attempt that never produced a status line
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("request timed out")]
    Timeout,

    #[error("connection failed: {0}")]
    Connect(String),

    #[error("transport error: {0}")]
    Other(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FetchStatus {
    Success,
    NotFound,
    TransientError,
    PermanentError,
}

impl FetchStatus {
    /// Classify an HTTP status code
    pub fn from_http(status: u16) -> Self {
        match status {
            200..=299 => FetchStatus::Success,
            404 | 410 => FetchStatus::NotFound,
            408 | 429 => FetchStatus::TransientError,
            500..=599 => FetchStatus::TransientError,
            _ => FetchStatus::PermanentError,
        }
    }

    pub fn is_error(&self) -> bool {
        matches!(
            self,
            FetchStatus::TransientError | FetchStatus::PermanentError
        )
    }
}

/// Classified result of one Fetcher call, after retries
#[derive(Debug, Clone)]
pub struct FetchOutcome {
    pub status: FetchStatus,
    pub body: Option<String>,
    /// Last HTTP status seen; 0 when no attempt got a response
    pub http_status: u16,
    pub elapsed: Duration,
    pub attempts: u32,
}

impl FetchOutcome {
    pub fn body_len(&self) -> usize {
        self.body.as_ref().map(|b| b.len()).unwrap_or(0)
    }
}

/// Run-scoped fetch counters shared by all workers
#[derive(Debug, Default)]
pub struct FetchCounters {
    requests: AtomicU64,
    attempts: AtomicU64,
    retries: AtomicU64,
    success: AtomicU64,
    not_found: AtomicU64,
    transient: AtomicU64,
    permanent: AtomicU64,
    bytes: AtomicU64,
}

impl FetchCounters {
    pub fn new() -> Self {
        Self::default()
    }

    pub(crate) fn record_attempt(&self, is_retry: bool) {
        self.attempts.fetch_add(1, Ordering::Relaxed);
        if is_retry {
            self.retries.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub(crate) fn record_outcome(&self, outcome: &FetchOutcome) {
        self.requests.fetch_add(1, Ordering::Relaxed);
        self.bytes
            .fetch_add(outcome.body_len() as u64, Ordering::Relaxed);
        let counter = match outcome.status {
            FetchStatus::Success => &self.success,
            FetchStatus::NotFound => &self.not_found,
            FetchStatus::TransientError => &self.transient,
            FetchStatus::PermanentError => &self.permanent,
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }

    /// Number of logical requests issued so far
    pub fn requests(&self) -> u64 {
        self.requests.load(Ordering::Relaxed)
    }

    pub fn snapshot(&self) -> FetchStats {
        FetchStats {
            requests: self.requests.load(Ordering::Relaxed),
            attempts: self.attempts.load(Ordering::Relaxed),
            retries: self.retries.load(Ordering::Relaxed),
            success: self.success.load(Ordering::Relaxed),
            not_found: self.not_found.load(Ordering::Relaxed),
            transient: self.transient.load(Ordering::Relaxed),
            permanent: self.permanent.load(Ordering::Relaxed),
            bytes: self.bytes.load(Ordering::Relaxed),
        }
    }
}

/// Point-in-time copy of `FetchCounters`
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct FetchStats {
    pub requests: u64,
    pub attempts: u64,
    pub retries: u64,
    pub success: u64,
    pub not_found: u64,
    pub transient: u64,
    pub permanent: u64,
    pub bytes: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_classification() {
        assert_eq!(FetchStatus::from_http(200), FetchStatus::Success);
        assert_eq!(FetchStatus::from_http(404), FetchStatus::NotFound);
        assert_eq!(FetchStatus::from_http(410), FetchStatus::NotFound);
        assert_eq!(FetchStatus::from_http(429), FetchStatus::TransientError);
        assert_eq!(FetchStatus::from_http(503), FetchStatus::TransientError);
        assert_eq!(FetchStatus::from_http(403), FetchStatus::PermanentError);
        assert_eq!(FetchStatus::from_http(301), FetchStatus::PermanentError);
    }

    #[test]
    fn test_counters_snapshot() {
        let counters = FetchCounters::new();
        counters.record_attempt(false);
        counters.record_attempt(true);
        counters.record_outcome(&FetchOutcome {
            status: FetchStatus::Success,
            body: Some("<table></table>".to_string()),
            http_status: 200,
            elapsed: Duration::from_millis(5),
            attempts: 2,
        });

        let stats = counters.snapshot();
        assert_eq!(stats.requests, 1);
        assert_eq!(stats.attempts, 2);
        assert_eq!(stats.retries, 1);
        assert_eq!(stats.success, 1);
        assert_eq!(stats.bytes, 15);
    }
}
