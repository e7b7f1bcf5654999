//! Logging for the league crawler.
//!
//! Console output is human-readable and goes to stderr so `list`, `stats` and
//! `anomalies` can print to stdout. The optional file layer rotates daily and
//! can emit JSON so anomaly events stay machine-readable.

use crate::config::LoggingConfig;
use anyhow::{Context, Result};
use std::path::PathBuf;
use tracing::{Level, Subscriber};
use tracing_subscriber::{
    fmt::{self, format::FmtSpan},
    layer::SubscriberExt,
    registry::LookupSpan,
    util::SubscriberInitExt,
    EnvFilter, Layer,
};

/// Crates whose output is noise at the crawler's default level
const QUIET_CRATES: &[&str] = &["hyper", "reqwest", "h2", "html5ever", "selectors"];

#[derive(Debug, Clone)]
pub struct LogConfig {
    pub log_dir: PathBuf,
    /// Prefix of the rotated log files
    pub component: String,
    pub level: Level,
    pub console: bool,
    pub file: bool,
    /// JSON lines in the file layer
    pub json_format: bool,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            log_dir: PathBuf::from("data/logs"),
            component: "league-crawler".to_string(),
            level: Level::INFO,
            console: true,
            file: true,
            json_format: false,
        }
    }
}

impl LogConfig {
    /// Build from the `[logging]` section; `verbose` forces DEBUG
    pub fn from_settings(
        settings: &LoggingConfig,
        log_dir: PathBuf,
        component: &str,
        verbose: bool,
    ) -> Self {
        Self {
            log_dir,
            component: component.to_string(),
            level: if verbose {
                Level::DEBUG
            } else {
                parse_level(&settings.default_level)
            },
            console: settings.console,
            file: settings.file,
            json_format: settings.json_format,
        }
    }

    /// Filter directives used when `RUST_LOG` is not set
    pub fn directives(&self) -> String {
        let mut directives = vec![
            format!("league_crawler={}", self.level),
            format!("shared={}", self.level),
        ];
        directives.extend(QUIET_CRATES.iter().map(|c| format!("{}=warn", c)));
        directives.join(",")
    }
}

fn console_layer<S>() -> Box<dyn Layer<S> + Send + Sync>
where
    S: Subscriber + for<'a> LookupSpan<'a>,
{
    fmt::layer()
        .with_target(true)
        .with_span_events(FmtSpan::NONE)
        .with_writer(std::io::stderr)
        .boxed()
}

fn file_layer<S>(config: &LogConfig) -> Box<dyn Layer<S> + Send + Sync>
where
    S: Subscriber + for<'a> LookupSpan<'a>,
{
    let appender = tracing_appender::rolling::daily(&config.log_dir, &config.component);
    if config.json_format {
        fmt::layer()
            .json()
            .with_current_span(true)
            .with_span_list(false)
            .with_writer(appender)
            .boxed()
    } else {
        fmt::layer()
            .with_ansi(false)
            .with_span_events(FmtSpan::CLOSE)
            .with_writer(appender)
            .boxed()
    }
}

/// Install the global subscriber. `RUST_LOG` overrides the configured level.
pub fn init(config: LogConfig) -> Result<()> {
    if config.file {
        std::fs::create_dir_all(&config.log_dir).with_context(|| {
            format!("Failed to create log directory: {}", config.log_dir.display())
        })?;
    }

    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(config.directives()));

    let mut layers = Vec::new();
    if config.console {
        layers.push(console_layer());
    }
    if config.file {
        layers.push(file_layer(&config));
    }

    tracing_subscriber::registry()
        .with(env_filter)
        .with(layers)
        .try_init()
        .context("Failed to initialize tracing subscriber")?;

    tracing::info!(
        component = %config.component,
        log_dir = %config.log_dir.display(),
        level = %config.level,
        "Logging initialized"
    );
    Ok(())
}

/// Parse a configured level name, falling back to INFO
pub fn parse_level(level: &str) -> Level {
    level.parse().unwrap_or(Level::INFO)
}
