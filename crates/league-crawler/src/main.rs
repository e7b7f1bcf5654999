//! League crawler CLI application.

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use league_crawler::LeagueCrawler;
use shared::{AnomalyPolicy, Config, CrawlStore, DataPaths, Period};
use std::path::PathBuf;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

#[derive(Parser, Debug)]
#[command(name = "league-crawler")]
#[command(author, version, about = "Discover leagues and extract archive statistics", long_about = None)]
struct Args {
    /// Path to configuration file
    #[arg(short, long, default_value = "config.toml")]
    config: PathBuf,

    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run discovery and extraction
    Run {
        /// Restrict the run to these periods
        #[arg(short, long = "period")]
        periods: Vec<Period>,

        /// Number of concurrent workers
        #[arg(short, long)]
        workers: Option<usize>,

        /// What to do on a critical anomaly: halt-run, skip-period or log-only
        #[arg(long)]
        policy: Option<AnomalyPolicy>,

        /// Clear the response cache before running
        #[arg(long)]
        clear_response_cache: bool,
    },

    /// Show crawl cache statistics per period
    Stats,

    /// List confirmed leagues
    List {
        #[arg(short, long)]
        period: Option<Period>,

        #[arg(short, long, default_value = "50")]
        limit: usize,
    },

    /// List persisted anomalies
    Anomalies {
        /// Include acknowledged anomalies
        #[arg(long)]
        all: bool,
    },

    /// Acknowledge the blocking anomalies of a period
    Ack {
        #[arg(short, long)]
        period: Period,
    },

    /// Write the default configuration file
    InitConfig { path: PathBuf },
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    if let Command::InitConfig { path } = &args.command {
        Config::default()
            .save(path)
            .with_context(|| format!("Failed to write config to {}", path.display()))?;
        println!("Default configuration written to {}", path.display());
        return Ok(());
    }

    // Load configuration
    let config = Config::from_file(&args.config)
        .with_context(|| format!("Failed to load config from {}", args.config.display()))?;

    // Initialize logging
    shared::logging::init(shared::LogConfig::from_settings(
        &config.logging,
        config.log_dir(),
        "league-crawler",
        args.verbose,
    ))?;

    info!(config_file = %args.config.display(), "Loaded configuration");

    match args.command {
        Command::Run {
            periods,
            workers,
            policy,
            clear_response_cache,
        } => run(config, periods, workers, policy, clear_response_cache).await,
        Command::Stats => stats(&config),
        Command::List { period, limit } => list(&config, period, limit),
        Command::Anomalies { all } => anomalies(&config, all),
        Command::Ack { period } => ack(&config, period),
        Command::InitConfig { .. } => Ok(()),
    }
}

async fn run(
    mut config: Config,
    periods: Vec<Period>,
    workers: Option<usize>,
    policy: Option<AnomalyPolicy>,
    clear_response_cache: bool,
) -> Result<()> {
    if !periods.is_empty() {
        config.discovery.periods = periods;
    }
    if let Some(workers) = workers {
        config.discovery.worker_count = workers;
    }
    if let Some(policy) = policy {
        config.anomaly.policy = policy;
    }

    DataPaths::new(config.data_dir())
        .create_dirs()
        .context("Failed to create data directories")?;

    let crawler = LeagueCrawler::from_config(config)?;

    if clear_response_cache {
        info!("Clearing response cache");
        crawler
            .response_cache()
            .clear()
            .context("Failed to clear response cache")?;
    }

    let cache_stats = crawler
        .response_cache()
        .stats()
        .context("Failed to get response cache stats")?;
    info!(
        cached_files = cache_stats.total_files,
        cache_size_mb = cache_stats.total_size_bytes / 1_000_000,
        "Response cache statistics"
    );

    let cancel = CancellationToken::new();
    {
        let cancel = cancel.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                warn!("Interrupt received, finishing in-flight requests");
                cancel.cancel();
            }
        });
    }

    let summary = crawler.run(cancel).await.context("Crawl failed")?;

    info!("=== Crawl Complete ===");
    info!("Outcome: {}", summary.outcome);
    info!("Periods processed: {}", summary.periods_processed);
    info!("Candidates tested: {}", summary.candidates_tested);
    info!("Cache hits: {}", summary.cache_hits);
    info!("Fetch calls: {}", summary.fetch_calls);
    info!("Confirmed: {}", summary.confirmed);
    info!("Rejected: {}", summary.rejected);
    info!("Errored: {}", summary.errored);
    info!("Entities: {}", summary.entities);
    info!("Parse failures: {}", summary.parse_failures);
    info!("Identity conflicts: {}", summary.identity_conflicts);
    for sample in &summary.samples {
        info!("  {}", sample);
    }

    for period in &summary.periods {
        info!(
            period = period.period.0,
            state = %period.state,
            confirmed = period.confirmed,
            entities = period.entities,
            "Period result"
        );
    }

    if summary.has_critical() {
        for event in summary.anomalies.iter().filter(|e| e.is_critical()) {
            error!(kind = %event.kind, "{}", event.message);
        }
        anyhow::bail!(
            "{} critical anomalies raised; inspect with `anomalies` and acknowledge with `ack`",
            summary.anomalies.iter().filter(|e| e.is_critical()).count()
        );
    }

    Ok(())
}

fn open_store(config: &Config) -> Result<CrawlStore> {
    CrawlStore::open(config.database_path()).context("Failed to open crawl database")
}

fn stats(config: &Config) -> Result<()> {
    let store = open_store(config)?;
    let stats = store.period_stats()?;

    if stats.is_empty() {
        println!("Crawl cache is empty");
        return Ok(());
    }

    println!(
        "{:>6} {:>8} {:>9} {:>8} {:>7} {:>8}",
        "period", "tested", "confirmed", "rejected", "errored", "records"
    );
    for s in &stats {
        println!(
            "{:>6} {:>8} {:>9} {:>8} {:>7} {:>8}",
            s.period.0,
            s.total - s.untested,
            s.confirmed,
            s.rejected,
            s.errored,
            s.records
        );
    }

    if let Some(last) = store.recent_sessions(1)?.first() {
        println!(
            "\nLast session #{} started {} ({})",
            last.id,
            last.started_at.format("%Y-%m-%d %H:%M"),
            last.outcome.as_deref().unwrap_or("running")
        );
    }
    Ok(())
}

fn list(config: &Config, period: Option<Period>, limit: usize) -> Result<()> {
    let store = open_store(config)?;
    for entry in store.confirmed_entries(period, limit)? {
        println!(
            "{:>6} {:>8} {:>8} {:>5}  {}",
            entry.period.0,
            entry.candidate_id,
            entry.quality.to_string(),
            entry.record_count,
            entry.display_name.as_deref().unwrap_or("-")
        );
    }
    Ok(())
}

fn anomalies(config: &Config, all: bool) -> Result<()> {
    let store = open_store(config)?;
    let anomalies = store.list_anomalies(all)?;

    if anomalies.is_empty() {
        println!("No anomalies");
        return Ok(());
    }

    for a in &anomalies {
        println!(
            "#{:<5} {} {:<8} {:<16} period={} {}{}{}",
            a.id,
            a.event.raised_at.format("%Y-%m-%d %H:%M"),
            a.event.severity.to_string(),
            a.event.kind.as_str(),
            a.event
                .period
                .map(|p| p.to_string())
                .unwrap_or_else(|| "-".to_string()),
            a.event.message,
            if a.blocking { " [blocking]" } else { "" },
            if a.acknowledged { " [acknowledged]" } else { "" },
        );
    }
    Ok(())
}

fn ack(config: &Config, period: Period) -> Result<()> {
    let mut store = open_store(config)?;
    let count = store.acknowledge_period(period)?;
    info!(period = period.0, acknowledged = count, "Anomalies acknowledged");
    println!("Acknowledged {} anomalies for period {}", count, period);
    Ok(())
}
