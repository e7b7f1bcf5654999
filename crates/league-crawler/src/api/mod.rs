//! Access to the remote statistics archive.
//!
//! This module provides a rate-limited, retry-enabled fetcher over a
//! pluggable transport, plus the request builder for archive URLs.

pub mod client;
pub mod rate_limiter;
pub mod request;
pub mod transport;
pub mod types;

pub use client::{Fetcher, RetryPolicy};
pub use rate_limiter::RateLimiter;
pub use request::{RequestBuilder, StatistikRequestBuilder};
pub use transport::{HttpTransport, Transport};
pub use types::*;
