//! Run orchestrator.
//!
//! Coordinates a whole crawl: validate configuration, open a crawl session,
//! explore each period in declared order, hand finalized entities to the
//! sink and close the session with its counters.

use crate::anomaly::AnomalyMonitor;
use crate::api::{FetchStats, Fetcher, RequestBuilder, StatistikRequestBuilder};
use crate::cache::{lock_store, shared_store, CrawlCache, SharedStore, StalenessPolicy};
use crate::discovery::{ExploreError, IdSpaceExplorer, PeriodState, PeriodSummary, SeedPlan};
use crate::response_cache::ResponseCache;
use crate::sink::{JsonFileSink, Sink};
use anyhow::{Context, Result};
use serde::Serialize;
use shared::{AnomalyEvent, Config, CrawlStore, DataPaths, Period, SessionCounters};
use std::collections::HashSet;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

/// Recovered problems reported in the run summary
const MAX_SAMPLES: usize = 10;

/// How a run ended
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RunOutcome {
    Completed,
    /// A critical anomaly stopped the run
    Halted,
    Cancelled,
}

impl fmt::Display for RunOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RunOutcome::Completed => write!(f, "completed"),
            RunOutcome::Halted => write!(f, "halted"),
            RunOutcome::Cancelled => write!(f, "cancelled"),
        }
    }
}

/// Result of one run
#[derive(Debug, Clone, Serialize)]
pub struct RunSummary {
    pub session_id: i64,
    pub periods_processed: usize,
    pub candidates_tested: usize,
    pub cache_hits: usize,
    pub fetch_calls: usize,
    pub confirmed: usize,
    pub rejected: usize,
    pub errored: usize,
    pub entities: usize,
    pub parse_failures: usize,
    pub identity_conflicts: usize,
    /// First parse failures and identity conflicts, for inspection
    pub samples: Vec<String>,
    pub anomalies: Vec<AnomalyEvent>,
    pub periods: Vec<PeriodSummary>,
    pub outcome: RunOutcome,
    pub fetch_stats: FetchStats,
}

impl RunSummary {
    fn new(session_id: i64) -> Self {
        Self {
            session_id,
            periods_processed: 0,
            candidates_tested: 0,
            cache_hits: 0,
            fetch_calls: 0,
            confirmed: 0,
            rejected: 0,
            errored: 0,
            entities: 0,
            parse_failures: 0,
            identity_conflicts: 0,
            samples: Vec::new(),
            anomalies: Vec::new(),
            periods: Vec::new(),
            outcome: RunOutcome::Completed,
            fetch_stats: FetchStats::default(),
        }
    }

    fn add(&mut self, period: &PeriodSummary) {
        self.periods_processed += 1;
        self.candidates_tested += period.candidates_tested;
        self.cache_hits += period.cache_hits;
        self.fetch_calls += period.fetch_calls;
        self.confirmed += period.confirmed;
        self.rejected += period.rejected;
        self.errored += period.errored;
        self.entities += period.entities;
        self.parse_failures += period.parse_failures;
        self.identity_conflicts += period.identity_conflicts;
    }

    /// Whether any critical anomaly was raised; callers gate CI on this
    pub fn has_critical(&self) -> bool {
        self.anomalies.iter().any(|e| e.is_critical())
    }

    pub fn period(&self, period: Period) -> Option<&PeriodSummary> {
        self.periods.iter().find(|p| p.period == period)
    }

    fn counters(&self) -> SessionCounters {
        SessionCounters {
            candidates_tested: self.candidates_tested,
            confirmed: self.confirmed,
            rejected: self.rejected,
            errored: self.errored,
            entities: self.entities,
        }
    }
}

/// Discovery-and-extraction engine for one catalog
pub struct LeagueCrawler {
    config: Config,
    fetcher: Fetcher,
    builder: Arc<dyn RequestBuilder>,
    store: SharedStore,
    responses: Arc<ResponseCache>,
    sink: Arc<dyn Sink>,
}

impl LeagueCrawler {
    /// Crawler over the given collaborators, with the archive request
    /// builder and no response cache
    pub fn new(config: Config, fetcher: Fetcher, store: CrawlStore, sink: Arc<dyn Sink>) -> Self {
        let builder = Arc::new(StatistikRequestBuilder::new(config.crawler.base_url.clone()));
        Self {
            config,
            fetcher,
            builder,
            store: shared_store(store),
            responses: Arc::new(ResponseCache::disabled()),
            sink,
        }
    }

    /// Production crawler: HTTP fetcher, database, response cache and JSON
    /// exports all taken from the configuration
    pub fn from_config(config: Config) -> Result<Self> {
        let fetcher = Fetcher::from_config(&config.crawler).context("Failed to create fetcher")?;

        let db_path = config.database_path();
        info!(db_path = %db_path.display(), "Opening crawl database");
        let store = CrawlStore::open(&db_path).context("Failed to open crawl database")?;

        let responses = ResponseCache::new(
            config.response_cache_dir(),
            config.crawler.response_cache.enabled,
        )
        .context("Failed to initialize response cache")?;

        let sink = Arc::new(JsonFileSink::new(DataPaths::new(config.data_dir())));

        Ok(Self::new(config, fetcher, store, sink).with_response_cache(responses))
    }

    pub fn with_request_builder(mut self, builder: Arc<dyn RequestBuilder>) -> Self {
        self.builder = builder;
        self
    }

    pub fn with_response_cache(mut self, responses: ResponseCache) -> Self {
        self.responses = Arc::new(responses);
        self
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn store(&self) -> SharedStore {
        Arc::clone(&self.store)
    }

    pub fn response_cache(&self) -> &ResponseCache {
        &self.responses
    }

    /// Run discovery and extraction over every configured period.
    ///
    /// Recovered problems end up in the summary. Only configuration errors,
    /// crawl-state persistence failures and sink failures abort.
    pub async fn run(&self, cancel: CancellationToken) -> Result<RunSummary, ExploreError> {
        self.config.validate()?;
        let discovery = &self.config.discovery;

        let session_id = lock_store(&self.store)
            .and_then(|mut store| store.start_session(&discovery.periods))
            .map_err(ExploreError::persistence)?;
        info!(session_id, periods = discovery.periods.len(), "Crawl session started");

        let policy = StalenessPolicy::from_config(&self.config.staleness, discovery.current_period);
        let cache = Arc::new(
            CrawlCache::load(Arc::clone(&self.store), policy).map_err(ExploreError::persistence)?,
        );
        let monitor = Arc::new(
            AnomalyMonitor::from_config(&self.config.anomaly)
                .with_store(Arc::clone(&self.store), Some(session_id)),
        );
        let explorer = IdSpaceExplorer::new(
            self.fetcher.clone(),
            Arc::clone(&self.builder),
            Arc::clone(&cache),
            Arc::clone(&self.responses),
            Arc::clone(&monitor),
            discovery,
        );

        let blocked: HashSet<Period> = lock_store(&self.store)
            .and_then(|store| store.blocked_periods())
            .map_err(ExploreError::persistence)?
            .into_iter()
            .collect();

        let cancel = cancel.child_token();
        if let Some(secs) = discovery.run_timeout_secs {
            let timer = cancel.clone();
            tokio::spawn(async move {
                tokio::select! {
                    _ = timer.cancelled() => {}
                    _ = tokio::time::sleep(Duration::from_secs(secs)) => {
                        warn!(timeout_secs = secs, "Run timeout reached, cancelling");
                        timer.cancel();
                    }
                }
            });
        }

        let fetches_before = self.fetcher.counters().snapshot();
        let mut summary = RunSummary::new(session_id);
        let result = self
            .explore_periods(&explorer, &cache, &monitor, &blocked, &cancel, &mut summary)
            .await;
        // Stops the run timer
        cancel.cancel();

        summary.anomalies = monitor.events();
        summary.fetch_stats = diff(self.fetcher.counters().snapshot(), fetches_before);

        let outcome = match &result {
            Ok(()) => summary.outcome.to_string(),
            Err(_) => "failed".to_string(),
        };
        let closed = lock_store(&self.store)
            .and_then(|mut store| store.complete_session(session_id, &summary.counters(), &outcome));

        if let Err(e) = result {
            error!(session_id, error = %e, "Crawl aborted");
            return Err(e);
        }
        closed.map_err(ExploreError::persistence)?;

        info!(
            session_id,
            outcome = %summary.outcome,
            periods = summary.periods_processed,
            tested = summary.candidates_tested,
            cache_hits = summary.cache_hits,
            confirmed = summary.confirmed,
            rejected = summary.rejected,
            errored = summary.errored,
            entities = summary.entities,
            anomalies = summary.anomalies.len(),
            "Crawl session finished"
        );
        Ok(summary)
    }

    async fn explore_periods(
        &self,
        explorer: &IdSpaceExplorer,
        cache: &CrawlCache,
        monitor: &AnomalyMonitor,
        blocked: &HashSet<Period>,
        cancel: &CancellationToken,
        summary: &mut RunSummary,
    ) -> Result<(), ExploreError> {
        let discovery = &self.config.discovery;

        for (idx, &period) in discovery.periods.iter().enumerate() {
            if cancel.is_cancelled() {
                summary.outcome = RunOutcome::Cancelled;
                break;
            }

            if blocked.contains(&period) {
                warn!(
                    period = period.0,
                    "Period blocked by an unacknowledged critical anomaly, skipping"
                );
                summary
                    .periods
                    .push(PeriodSummary::new(period, PeriodState::Blocked));
                continue;
            }

            info!(
                progress = format!("{}/{}", idx + 1, discovery.periods.len()),
                period = period.0,
                "Processing period"
            );

            let plan = SeedPlan::for_period(discovery, period, &cache.confirmed_ids(period));
            let exploration = explorer.explore_period(&plan, cancel).await?;

            if monitor.withholds(period) {
                warn!(
                    period = period.0,
                    entities = exploration.entities.len(),
                    "Withholding entities of halted period"
                );
            } else {
                self.sink
                    .emit(period, &exploration.entities)
                    .map_err(|e| ExploreError::Sink {
                        period,
                        message: format!("{:#}", e),
                    })?;
            }

            summary.add(&exploration.summary);
            let room = MAX_SAMPLES.saturating_sub(summary.samples.len());
            summary
                .samples
                .extend(exploration.samples.into_iter().take(room));

            let state = exploration.summary.state;
            summary.periods.push(exploration.summary);

            if state == PeriodState::Cancelled {
                summary.outcome = RunOutcome::Cancelled;
                break;
            }
            if monitor.run_halted() {
                error!(period = period.0, "Critical anomaly, halting run");
                summary.outcome = RunOutcome::Halted;
                break;
            }
        }
        Ok(())
    }
}

fn diff(after: FetchStats, before: FetchStats) -> FetchStats {
    FetchStats {
        requests: after.requests - before.requests,
        attempts: after.attempts - before.attempts,
        retries: after.retries - before.retries,
        success: after.success - before.success,
        not_found: after.not_found - before.not_found,
        transient: after.transient - before.transient,
        permanent: after.permanent - before.permanent,
        bytes: after.bytes - before.bytes,
    }
}
