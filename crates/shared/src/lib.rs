//! Shared library for the league crawler.
//!
//! This crate provides the pieces every binary needs:
//! - Configuration management
//! - SQLite database handle, schema and migrations
//! - Crawl state store (cache entries, sessions, anomalies)
//! - Data model types
//! - File path utilities
//! - Logging infrastructure

pub mod config;
pub mod db;
pub mod logging;
pub mod models;
pub mod paths;
pub mod store;

// Re-export commonly used types
pub use config::{AnomalyPolicy, Config, ConfigError};
pub use db::Database;
pub use logging::LogConfig;
pub use models::*;
pub use paths::DataPaths;
pub use store::{CrawlStore, PeriodStats, SessionCounters};

/// Common result type using anyhow::Error
pub type Result<T> = anyhow::Result<T>;
