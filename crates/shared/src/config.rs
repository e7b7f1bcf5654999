//! Configuration management for the league crawler.
//!
//! This module handles loading and parsing configuration from TOML files,
//! with sensible defaults for all settings.

use crate::models::{EndpointKind, Period};
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use thiserror::Error;

/// Largest accepted neighbour distance for flood fill
pub const MAX_ADJACENCY_RADIUS: i64 = 1_000;

/// Fatal configuration problems detected before a run starts
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("no periods configured")]
    NoPeriods,

    #[error("period {0} has no seed ids and no declared ranges")]
    NoSeeds(Period),

    #[error("worker count must be at least 1")]
    ZeroWorkers,

    #[error("adjacency radius must be at least 1")]
    ZeroRadius,

    #[error("adjacency radius {0} exceeds {max}", max = MAX_ADJACENCY_RADIUS)]
    RadiusTooLarge(i64),

    #[error("retry max_attempts must be at least 1")]
    ZeroAttempts,

    #[error("declared range {start}..={end} is inverted")]
    InvertedRange { start: i64, end: i64 },

    #[error("declared range {start}..={end} has a non-positive step")]
    BadRangeStep { start: i64, end: i64 },

    #[error("body size bounds are inverted: min {min} > max {max}")]
    InvertedBodyBounds { min: usize, max: usize },

    #[error("no endpoints configured")]
    NoEndpoints,
}

/// Main configuration structure
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Data directory settings
    pub data: DataConfig,

    /// Database settings
    pub database: DatabaseConfig,

    /// Logging settings
    pub logging: LoggingConfig,

    /// Remote catalog access
    pub crawler: CrawlerConfig,

    /// ID space exploration
    pub discovery: DiscoveryConfig,

    #[serde(default)]
    pub anomaly: AnomalyConfig,

    #[serde(default)]
    pub staleness: StalenessConfig,
}

/// Data directory configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DataConfig {
    /// Root data directory path
    pub root_dir: String,
}

/// Database configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseConfig {
    /// Database file path (relative to data directory or absolute)
    pub path: String,
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log directory path (relative to data directory or absolute)
    pub log_dir: String,

    /// Default log level (trace, debug, info, warn, error)
    pub default_level: String,

    /// Enable console output
    pub console: bool,

    /// Enable file output
    pub file: bool,

    /// Enable JSON formatting for file logs
    pub json_format: bool,
}

/// Remote catalog access configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CrawlerConfig {
    /// Base URL of the statistics archive
    pub base_url: String,

    /// User agent sent with every request
    pub user_agent: String,

    /// Hard timeout for a single request attempt
    pub request_timeout_secs: u64,

    pub rate_limit: RateLimitConfig,

    pub retry: RetryConfig,

    pub response_cache: ResponseCacheConfig,
}

/// Rate limiting configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RateLimitConfig {
    /// Minimum delay between two requests in milliseconds
    pub min_interval_ms: u64,

    /// Maximum requests per rolling minute
    pub requests_per_minute: u32,
}

/// Retry configuration for transient failures
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryConfig {
    /// Total attempts per request, including the first one
    pub max_attempts: u32,

    /// Backoff base in milliseconds, doubled after every failed attempt
    pub backoff_base_ms: u64,
}

/// Response cache configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResponseCacheConfig {
    /// Enable caching
    pub enabled: bool,

    /// Cache directory (relative to data directory)
    pub cache_dir: String,
}

/// Declared scan range of league ids
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RangeConfig {
    /// First id (inclusive)
    pub start: i64,

    /// Last id (inclusive)
    pub end: i64,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub step: Option<i64>,

    /// Restrict the range to these periods; applies to every period when absent
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub periods: Option<Vec<Period>>,
}

impl RangeConfig {
    pub fn applies_to(&self, period: Period) -> bool {
        match &self.periods {
            Some(periods) => periods.contains(&period),
            None => true,
        }
    }

    pub fn ids(&self) -> impl Iterator<Item = i64> {
        let step = self.step.unwrap_or(1).max(1) as usize;
        (self.start..=self.end).step_by(step)
    }
}

/// ID space exploration configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DiscoveryConfig {
    /// League ids known to be valid in the reference period
    pub seed_ids: Vec<i64>,

    #[serde(default)]
    pub ranges: Vec<RangeConfig>,

    /// Periods to explore, in processing order
    pub periods: Vec<Period>,

    /// Period the seed ids belong to
    pub reference_period: Period,

    /// Period that is still in progress on the remote side
    pub current_period: Period,

    /// How far league ids shift per period
    pub offset_step: i64,

    pub adjacency_radius: i64,

    pub worker_count: usize,

    /// Endpoints fetched per league; the first one probes existence
    pub endpoints: Vec<EndpointKind>,

    /// Wall-clock bound for a whole run
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub run_timeout_secs: Option<u64>,
}

/// What happens when a critical anomaly is raised
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
pub enum AnomalyPolicy {
    /// Stop the affected period, then stop the run
    HaltRun,
    /// Stop the affected period, withhold its output and continue
    SkipPeriod,
    /// Record the event and keep going
    LogOnly,
}

impl AnomalyPolicy {
    pub fn halts(&self) -> bool {
        !matches!(self, AnomalyPolicy::LogOnly)
    }
}

impl fmt::Display for AnomalyPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AnomalyPolicy::HaltRun => write!(f, "halt-run"),
            AnomalyPolicy::SkipPeriod => write!(f, "skip-period"),
            AnomalyPolicy::LogOnly => write!(f, "log-only"),
        }
    }
}

impl FromStr for AnomalyPolicy {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "halt-run" => Ok(AnomalyPolicy::HaltRun),
            "skip-period" => Ok(AnomalyPolicy::SkipPeriod),
            "log-only" => Ok(AnomalyPolicy::LogOnly),
            _ => Err(anyhow::anyhow!("Invalid anomaly policy: {}", s)),
        }
    }
}

/// Anomaly thresholds and policy
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AnomalyConfig {
    pub policy: AnomalyPolicy,

    /// Confirmed leagues a drained period must reach
    pub min_entities_per_period: usize,

    /// Normalized records a single league may produce
    pub max_records_per_entity: usize,

    pub min_body_bytes: usize,

    pub max_body_bytes: usize,

    /// Failed fetches in a row before a period is considered broken
    pub max_consecutive_fetch_errors: u32,
}

impl Default for AnomalyConfig {
    fn default() -> Self {
        Self {
            policy: AnomalyPolicy::HaltRun,
            min_entities_per_period: 5,
            max_records_per_entity: 200,
            min_body_bytes: 5_000,
            max_body_bytes: 500_000,
            max_consecutive_fetch_errors: 10,
        }
    }
}

/// Cache staleness windows
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StalenessConfig {
    /// Re-test window for confirmed leagues of the current period
    pub confirmed_ttl_hours: u64,

    /// Re-test window for rejected and errored coordinates
    pub rejected_ttl_days: u64,
}

impl Default for StalenessConfig {
    fn default() -> Self {
        Self {
            confirmed_ttl_hours: 24,
            rejected_ttl_days: 7,
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            data: DataConfig {
                root_dir: "data".to_string(),
            },
            database: DatabaseConfig {
                path: "crawl.db".to_string(),
            },
            logging: LoggingConfig {
                log_dir: "logs".to_string(),
                default_level: "info".to_string(),
                console: true,
                file: true,
                json_format: false,
            },
            crawler: CrawlerConfig {
                base_url: "https://www.basketball-bund.net".to_string(),
                user_agent: "Mozilla/5.0 (X11; Linux x86_64) league-crawler/0.1".to_string(),
                request_timeout_secs: 15,
                rate_limit: RateLimitConfig {
                    min_interval_ms: 500,
                    requests_per_minute: 60,
                },
                retry: RetryConfig {
                    max_attempts: 3,
                    backoff_base_ms: 1000,
                },
                response_cache: ResponseCacheConfig {
                    enabled: true,
                    cache_dir: "cache/responses".to_string(),
                },
            },
            discovery: DiscoveryConfig {
                seed_ids: vec![47959, 47960, 47961, 51020],
                ranges: Vec::new(),
                periods: (2003..=2024).map(Period).collect(),
                reference_period: Period(2025),
                current_period: Period(2024),
                offset_step: 1,
                adjacency_radius: 5,
                worker_count: 4,
                endpoints: EndpointKind::ALL.to_vec(),
                run_timeout_secs: None,
            },
            anomaly: AnomalyConfig::default(),
            staleness: StalenessConfig::default(),
        }
    }
}

impl Config {
    /// Load configuration from a TOML file
    ///
    /// If the file doesn't exist, returns the default configuration.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();

        if !path.exists() {
            tracing::warn!(
                path = %path.display(),
                "Config file not found, using defaults"
            );
            return Ok(Self::default());
        }

        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;

        let config: Config = toml::from_str(&content)
            .with_context(|| format!("Failed to parse config file: {}", path.display()))?;

        tracing::info!(
            path = %path.display(),
            "Configuration loaded successfully"
        );

        Ok(config)
    }

    /// Save configuration to a TOML file
    pub fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();

        let content = toml::to_string_pretty(self).context("Failed to serialize configuration")?;

        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)
                    .with_context(|| format!("Failed to create {}", parent.display()))?;
            }
        }

        std::fs::write(path, content)
            .with_context(|| format!("Failed to write config file: {}", path.display()))?;

        tracing::info!(
            path = %path.display(),
            "Configuration saved successfully"
        );

        Ok(())
    }

    /// Check the conditions that make a run impossible
    pub fn validate(&self) -> std::result::Result<(), ConfigError> {
        let discovery = &self.discovery;

        if discovery.periods.is_empty() {
            return Err(ConfigError::NoPeriods);
        }
        if discovery.worker_count == 0 {
            return Err(ConfigError::ZeroWorkers);
        }
        if discovery.adjacency_radius < 1 {
            return Err(ConfigError::ZeroRadius);
        }
        if discovery.adjacency_radius > MAX_ADJACENCY_RADIUS {
            return Err(ConfigError::RadiusTooLarge(discovery.adjacency_radius));
        }
        if discovery.endpoints.is_empty() {
            return Err(ConfigError::NoEndpoints);
        }
        if self.crawler.retry.max_attempts == 0 {
            return Err(ConfigError::ZeroAttempts);
        }

        for range in &discovery.ranges {
            if range.start > range.end {
                return Err(ConfigError::InvertedRange {
                    start: range.start,
                    end: range.end,
                });
            }
            if matches!(range.step, Some(step) if step < 1) {
                return Err(ConfigError::BadRangeStep {
                    start: range.start,
                    end: range.end,
                });
            }
        }

        if self.anomaly.min_body_bytes > self.anomaly.max_body_bytes {
            return Err(ConfigError::InvertedBodyBounds {
                min: self.anomaly.min_body_bytes,
                max: self.anomaly.max_body_bytes,
            });
        }

        if discovery.seed_ids.is_empty() {
            for &period in &discovery.periods {
                if !discovery.ranges.iter().any(|r| r.applies_to(period)) {
                    return Err(ConfigError::NoSeeds(period));
                }
            }
        }

        Ok(())
    }

    /// Get the absolute path for the data directory
    pub fn data_dir(&self) -> PathBuf {
        PathBuf::from(&self.data.root_dir)
    }

    /// Get the absolute path for the database file
    pub fn database_path(&self) -> PathBuf {
        self.resolve(&self.database.path)
    }

    /// Get the absolute path for the log directory
    pub fn log_dir(&self) -> PathBuf {
        self.resolve(&self.logging.log_dir)
    }

    /// Get the absolute path for the response cache directory
    pub fn response_cache_dir(&self) -> PathBuf {
        self.resolve(&self.crawler.response_cache.cache_dir)
    }

    fn resolve(&self, path: &str) -> PathBuf {
        let path = Path::new(path);
        if path.is_absolute() {
            path.to_path_buf()
        } else {
            self.data_dir().join(path)
        }
    }
}
