//! Sparse id-space discovery.
//!
//! League ids are opaque and shift between seasons, so each period is
//! explored as a flood fill: start from seeds (literal, extrapolated from the
//! reference season, declared ranges, and ids confirmed by earlier runs),
//! then keep enqueueing the numeric neighbours of every confirmed id until
//! nothing new turns up. The crawl cache is consulted before every fetch, so
//! the fill terminates and re-runs cost nothing for coordinates already known.

use crate::anomaly::AnomalyMonitor;
use crate::api::{FetchOutcome, FetchStatus, Fetcher, RequestBuilder};
use crate::cache::{Claim, CrawlCache, Observation};
use crate::merge::{MergedEntity, RecordMerger};
use crate::normalize::{extract_caption, normalize_document, NormalizedRecord};
use crate::response_cache::{CachedResponse, ResponseCache};
use chrono::Utc;
use serde::Serialize;
use shared::config::DiscoveryConfig;
use shared::{CandidateState, Candidate, ConfigError, EndpointKind, Period, Quality};
use std::collections::{BTreeSet, HashSet};
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard};
use thiserror::Error;
use tokio::sync::Notify;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Samples of recovered problems kept per period
const MAX_SAMPLES: usize = 10;

/// Conditions that abort a run
#[derive(Debug, Error)]
pub enum ExploreError {
    #[error("invalid configuration: {0}")]
    Config(#[from] ConfigError),

    #[error("crawl state persistence failed: {0}")]
    Persistence(String),

    #[error("sink failed for period {period}: {message}")]
    Sink { period: Period, message: String },

    #[error("discovery worker failed: {0}")]
    Worker(String),
}

impl ExploreError {
    pub(crate) fn persistence(err: impl fmt::Display) -> Self {
        ExploreError::Persistence(err.to_string())
    }
}

/// Seeding for one period
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SeedPlan {
    pub period: Period,
    /// Every starting id, ascending and unique
    pub ids: Vec<i64>,
    pub literal: usize,
    pub extrapolated: usize,
    pub ranged: usize,
    pub cached: usize,
}

impl SeedPlan {
    /// Build the starting set for `period`.
    ///
    /// Seeds are known-good in the reference period; for earlier periods each
    /// seed is also shifted by `(reference - period) * offset_step`.
    pub fn for_period(discovery: &DiscoveryConfig, period: Period, cached: &[i64]) -> Self {
        let mut ids = BTreeSet::new();
        let mut extrapolated = 0;

        for &seed in &discovery.seed_ids {
            ids.insert(seed);
            if period < discovery.reference_period {
                let distance = i64::from(discovery.reference_period.0) - i64::from(period.0);
                let shifted = seed.saturating_sub(distance.saturating_mul(discovery.offset_step));
                if shifted > 0 && ids.insert(shifted) {
                    extrapolated += 1;
                }
            }
        }

        let mut ranged = 0;
        for range in discovery.ranges.iter().filter(|r| r.applies_to(period)) {
            for id in range.ids() {
                if ids.insert(id) {
                    ranged += 1;
                }
            }
        }

        let mut from_cache = 0;
        for &id in cached {
            if ids.insert(id) {
                from_cache += 1;
            }
        }

        Self {
            period,
            ids: ids.into_iter().collect(),
            literal: discovery.seed_ids.len(),
            extrapolated,
            ranged,
            cached: from_cache,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.ids.is_empty()
    }
}

#[derive(Debug, Default)]
struct FrontierState {
    pending: BTreeSet<i64>,
    seen: HashSet<i64>,
    in_flight: usize,
    closed: bool,
}

/// Per-period work queue.
///
/// Ids come out in ascending order, each id enters at most once, and
/// `next()` yields `None` once the period is drained or closed.
#[derive(Debug, Default)]
pub struct Frontier {
    state: Mutex<FrontierState>,
    notify: Notify,
}

impl Frontier {
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> MutexGuard<'_, FrontierState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Enqueue an id unless it was seen before or the frontier is closed
    pub fn push(&self, id: i64) -> bool {
        let added = {
            let mut state = self.state();
            !state.closed && state.seen.insert(id) && state.pending.insert(id)
        };
        if added {
            self.notify.notify_waiters();
        }
        added
    }

    pub fn push_all(&self, ids: impl IntoIterator<Item = i64>) -> usize {
        ids.into_iter().filter(|&id| self.push(id)).count()
    }

    /// Take the lowest pending id, waiting while other work is in flight
    pub async fn next(&self) -> Option<i64> {
        loop {
            let notified = self.notify.notified();
            {
                let mut state = self.state();
                if state.closed {
                    return None;
                }
                if let Some(id) = state.pending.pop_first() {
                    state.in_flight += 1;
                    return Some(id);
                }
                if state.in_flight == 0 {
                    return None;
                }
            }
            notified.await;
        }
    }

    /// Mark one dequeued id as finished
    pub fn complete(&self) {
        {
            let mut state = self.state();
            state.in_flight = state.in_flight.saturating_sub(1);
        }
        self.notify.notify_waiters();
    }

    /// Stop handing out ids
    pub fn close(&self) {
        self.state().closed = true;
        self.notify.notify_waiters();
    }

    pub fn is_closed(&self) -> bool {
        self.state().closed
    }

    pub fn seen(&self) -> usize {
        self.state().seen.len()
    }

    pub fn pending(&self) -> usize {
        self.state().pending.len()
    }
}

/// How a period's exploration ended
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum PeriodState {
    /// Every candidate was investigated
    Drained,
    /// A critical anomaly stopped the period
    Halted,
    Cancelled,
    /// Skipped because of an unacknowledged critical from an earlier run
    Blocked,
}

impl fmt::Display for PeriodState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PeriodState::Drained => write!(f, "drained"),
            PeriodState::Halted => write!(f, "halted"),
            PeriodState::Cancelled => write!(f, "cancelled"),
            PeriodState::Blocked => write!(f, "blocked"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PeriodSummary {
    pub period: Period,
    pub state: PeriodState,
    /// Coordinates fetched in this run
    pub candidates_tested: usize,
    /// Coordinates answered from the crawl cache
    pub cache_hits: usize,
    /// Confirmed coordinates, fetched or cached
    pub confirmed: usize,
    pub rejected: usize,
    pub errored: usize,
    /// Confirmed coordinates whose entities came from the response cache
    pub replayed: usize,
    pub entities: usize,
    pub fetch_calls: usize,
    pub parse_failures: usize,
    pub identity_conflicts: usize,
}

impl PeriodSummary {
    pub fn new(period: Period, state: PeriodState) -> Self {
        Self {
            period,
            state,
            candidates_tested: 0,
            cache_hits: 0,
            confirmed: 0,
            rejected: 0,
            errored: 0,
            replayed: 0,
            entities: 0,
            fetch_calls: 0,
            parse_failures: 0,
            identity_conflicts: 0,
        }
    }
}

/// Everything one period produced
#[derive(Debug, Clone)]
pub struct PeriodExploration {
    pub summary: PeriodSummary,
    pub entities: Vec<MergedEntity>,
    /// Messages of recovered parse failures and identity conflicts
    pub samples: Vec<String>,
}

/// Collaborators shared by every worker
struct ExploreContext {
    fetcher: Fetcher,
    builder: Arc<dyn RequestBuilder>,
    cache: Arc<CrawlCache>,
    responses: Arc<ResponseCache>,
    monitor: Arc<AnomalyMonitor>,
    endpoints: Vec<EndpointKind>,
    radius: i64,
    workers: usize,
}

/// State of one period under exploration
struct PeriodRun {
    period: Period,
    frontier: Frontier,
    merger: Mutex<RecordMerger>,
    summary: Mutex<PeriodSummary>,
    samples: Mutex<Vec<String>>,
}

impl PeriodRun {
    fn new(period: Period) -> Self {
        Self {
            period,
            frontier: Frontier::new(),
            merger: Mutex::new(RecordMerger::new(period)),
            summary: Mutex::new(PeriodSummary::new(period, PeriodState::Drained)),
            samples: Mutex::new(Vec::new()),
        }
    }

    fn tally(&self, f: impl FnOnce(&mut PeriodSummary)) {
        let mut summary = self.summary.lock().unwrap_or_else(|p| p.into_inner());
        f(&mut summary);
    }

    fn sample(&self, message: String) {
        let mut samples = self.samples.lock().unwrap_or_else(|p| p.into_inner());
        if samples.len() < MAX_SAMPLES {
            samples.push(message);
        }
    }
}

/// Fetched body of one endpoint that may be kept for replay
struct Fetched {
    endpoint: EndpointKind,
    http_status: u16,
    body: String,
}

pub struct IdSpaceExplorer {
    ctx: Arc<ExploreContext>,
}

impl IdSpaceExplorer {
    pub fn new(
        fetcher: Fetcher,
        builder: Arc<dyn RequestBuilder>,
        cache: Arc<CrawlCache>,
        responses: Arc<ResponseCache>,
        monitor: Arc<AnomalyMonitor>,
        discovery: &DiscoveryConfig,
    ) -> Self {
        Self {
            ctx: Arc::new(ExploreContext {
                fetcher,
                builder,
                cache,
                responses,
                monitor,
                endpoints: discovery.endpoints.clone(),
                radius: discovery.adjacency_radius.max(1),
                workers: discovery.worker_count.max(1),
            }),
        }
    }

    /// Flood-fill one period from its seed plan until drained, halted or
    /// cancelled, then hand back the period's merged entities.
    pub async fn explore_period(
        &self,
        plan: &SeedPlan,
        cancel: &CancellationToken,
    ) -> Result<PeriodExploration, ExploreError> {
        let period = plan.period;
        let run = Arc::new(PeriodRun::new(period));
        run.frontier.push_all(plan.ids.iter().copied());

        info!(
            period = period.0,
            seeds = plan.ids.len(),
            literal = plan.literal,
            extrapolated = plan.extrapolated,
            ranged = plan.ranged,
            cached = plan.cached,
            workers = self.ctx.workers,
            "Exploring period"
        );

        let mut workers = JoinSet::new();
        for worker_id in 0..self.ctx.workers {
            let ctx = Arc::clone(&self.ctx);
            let run = Arc::clone(&run);
            let cancel = cancel.clone();
            workers.spawn(async move { run_worker(worker_id, ctx, run, cancel).await });
        }

        let mut failure = None;
        while let Some(joined) = workers.join_next().await {
            let result = joined
                .map_err(|e| ExploreError::Worker(format!("worker task ended abnormally: {}", e)))
                .and_then(|r| r);
            if let Err(e) = result {
                run.frontier.close();
                failure.get_or_insert(e);
            }
        }
        if let Some(e) = failure {
            return Err(e);
        }

        let mut state = if self.ctx.monitor.is_halted(period) {
            PeriodState::Halted
        } else if cancel.is_cancelled() {
            PeriodState::Cancelled
        } else {
            PeriodState::Drained
        };

        let mut summary = run
            .summary
            .lock()
            .map(|s| s.clone())
            .map_err(|_| ExploreError::Worker("period summary lock poisoned".to_string()))?;

        if state == PeriodState::Drained {
            self.ctx
                .monitor
                .check_drained(period, summary.confirmed)
                .map_err(ExploreError::persistence)?;
            if self.ctx.monitor.is_halted(period) {
                state = PeriodState::Halted;
            }
        }

        let entities = run
            .merger
            .lock()
            .map(|m| m.finalize())
            .map_err(|_| ExploreError::Worker("record merger lock poisoned".to_string()))?;
        let samples = run
            .samples
            .lock()
            .map(|s| s.clone())
            .unwrap_or_default();

        summary.state = state;
        summary.entities = entities.len();

        info!(
            period = period.0,
            state = %state,
            tested = summary.candidates_tested,
            cache_hits = summary.cache_hits,
            confirmed = summary.confirmed,
            rejected = summary.rejected,
            errored = summary.errored,
            entities = summary.entities,
            "Period finished"
        );

        Ok(PeriodExploration {
            summary,
            entities,
            samples,
        })
    }
}

async fn run_worker(
    worker_id: usize,
    ctx: Arc<ExploreContext>,
    run: Arc<PeriodRun>,
    cancel: CancellationToken,
) -> Result<(), ExploreError> {
    loop {
        let id = tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                debug!(worker_id, period = run.period.0, "Worker cancelled");
                break;
            }
            next = run.frontier.next() => match next {
                Some(id) => id,
                None => break,
            },
        };

        if ctx.monitor.is_halted(run.period) {
            run.frontier.complete();
            run.frontier.close();
            break;
        }

        let result = process_candidate(&ctx, &run, Candidate::new(id, run.period)).await;
        run.frontier.complete();

        if let Err(e) = result {
            run.frontier.close();
            return Err(e);
        }
        if ctx.monitor.is_halted(run.period) {
            run.frontier.close();
        }
    }
    Ok(())
}

async fn process_candidate(
    ctx: &ExploreContext,
    run: &PeriodRun,
    candidate: Candidate,
) -> Result<(), ExploreError> {
    let claim = ctx
        .cache
        .try_claim(candidate, Utc::now())
        .map_err(ExploreError::persistence)?;

    match claim {
        Claim::Busy => Ok(()),
        Claim::Fresh(entry) => match entry.state {
            CandidateState::Confirmed => {
                if replay(ctx, run, candidate)? || !ctx.responses.is_enabled() {
                    run.tally(|s| {
                        s.cache_hits += 1;
                        s.confirmed += 1;
                    });
                    expand(ctx, run, candidate);
                    return Ok(());
                }
                if !ctx.cache.reclaim(candidate).map_err(ExploreError::persistence)? {
                    return Ok(());
                }
                warn!(candidate = %candidate, "Confirmed league has no replayable responses, re-testing");
                test_claimed(ctx, run, candidate).await
            }
            CandidateState::Rejected => {
                run.tally(|s| {
                    s.cache_hits += 1;
                    s.rejected += 1;
                });
                Ok(())
            }
            CandidateState::Errored => {
                run.tally(|s| {
                    s.cache_hits += 1;
                    s.errored += 1;
                });
                Ok(())
            }
            CandidateState::Untested => Ok(()),
        },
        Claim::Claimed => test_claimed(ctx, run, candidate).await,
    }
}

/// Test a coordinate this worker holds the claim for
async fn test_claimed(
    ctx: &ExploreContext,
    run: &PeriodRun,
    candidate: Candidate,
) -> Result<(), ExploreError> {
    run.tally(|s| s.candidates_tested += 1);
    let result = test_candidate(ctx, run, candidate).await;
    if result.is_err() {
        ctx.cache.release(candidate);
    }
    result
}

async fn fetch_endpoint(
    ctx: &ExploreContext,
    run: &PeriodRun,
    candidate: Candidate,
    endpoint: EndpointKind,
) -> Result<FetchOutcome, ExploreError> {
    let request = ctx.builder.build(candidate, endpoint);
    let outcome = ctx.fetcher.fetch(&request).await;
    run.tally(|s| s.fetch_calls += 1);

    debug!(
        candidate = %candidate,
        endpoint = %endpoint,
        status = ?outcome.status,
        http_status = outcome.http_status,
        elapsed_ms = outcome.elapsed.as_millis() as u64,
        "Fetched"
    );

    ctx.monitor
        .observe_fetch(candidate.period, outcome.status)
        .map_err(ExploreError::persistence)?;
    if outcome.status == FetchStatus::Success {
        ctx.monitor
            .observe_body(candidate, endpoint, outcome.body_len())
            .map_err(ExploreError::persistence)?;
    }
    Ok(outcome)
}

/// Probe a claimed coordinate, then extract every endpoint of a league
async fn test_candidate(
    ctx: &ExploreContext,
    run: &PeriodRun,
    candidate: Candidate,
) -> Result<(), ExploreError> {
    let Some((&probe, rest)) = ctx.endpoints.split_first() else {
        return Err(ExploreError::Config(ConfigError::NoEndpoints));
    };

    let outcome = fetch_endpoint(ctx, run, candidate, probe).await?;
    let body = match outcome.status {
        FetchStatus::Success => outcome.body.unwrap_or_default(),
        FetchStatus::NotFound | FetchStatus::PermanentError => {
            return record(ctx, run, candidate, Observation::rejected());
        }
        FetchStatus::TransientError => {
            return record(ctx, run, candidate, Observation::errored());
        }
    };

    let mut records: Vec<NormalizedRecord> = match normalize_document(&body, candidate, probe) {
        Ok(normalized) => normalized.records,
        Err(failure) => {
            run.tally(|s| s.parse_failures += 1);
            run.sample(format!("{} {}: {}", candidate, probe, failure));
            ctx.monitor
                .observe_parse_failure(candidate, probe, &failure)
                .map_err(ExploreError::persistence)?;
            return record(ctx, run, candidate, Observation::errored());
        }
    };

    if records.is_empty() {
        debug!(candidate = %candidate, "Probe returned no entity rows");
        return record(ctx, run, candidate, Observation::rejected());
    }

    let display_name = extract_caption(&body);
    let mut fetched = vec![Fetched {
        endpoint: probe,
        http_status: outcome.http_status,
        body,
    }];
    let mut complete = true;

    for &endpoint in rest {
        if ctx.monitor.is_halted(candidate.period) {
            complete = false;
            break;
        }

        let outcome = fetch_endpoint(ctx, run, candidate, endpoint).await?;
        if outcome.status != FetchStatus::Success {
            complete = false;
            continue;
        }
        let body = outcome.body.unwrap_or_default();

        match normalize_document(&body, candidate, endpoint) {
            Ok(normalized) => records.extend(normalized.records),
            Err(failure) => {
                complete = false;
                run.tally(|s| s.parse_failures += 1);
                run.sample(format!("{} {}: {}", candidate, endpoint, failure));
                ctx.monitor
                    .observe_parse_failure(candidate, endpoint, &failure)
                    .map_err(ExploreError::persistence)?;
                continue;
            }
        }
        fetched.push(Fetched {
            endpoint,
            http_status: outcome.http_status,
            body,
        });
    }

    let quality = if complete {
        Quality::Complete
    } else {
        Quality::Partial
    };

    ctx.monitor
        .observe_records(candidate, records.len())
        .map_err(ExploreError::persistence)?;

    // Responses are stored before the league is recorded
    for page in fetched {
        let cached = CachedResponse {
            endpoint: page.endpoint,
            candidate,
            http_status: page.http_status,
            fetched_at: Utc::now(),
            body: page.body,
        };
        if let Err(e) = ctx.responses.put(&cached) {
            ctx.monitor
                .observe_response_cache_write(candidate, page.endpoint, &e)
                .map_err(ExploreError::persistence)?;
        }
    }

    let observation = Observation::confirmed(quality, records.len() as u32, display_name);
    store_observation(ctx, candidate, observation)?;
    run.tally(|s| s.confirmed += 1);

    merge(ctx, run, records)?;
    expand(ctx, run, candidate);
    Ok(())
}

/// Write an observation to the crawl cache. A refused write is reported as
/// a warning and leaves the stored facts in place.
fn store_observation(
    ctx: &ExploreContext,
    candidate: Candidate,
    observation: Observation,
) -> Result<(), ExploreError> {
    match ctx.cache.record(candidate, observation, Utc::now()) {
        Ok(_) => Ok(()),
        Err(conflict) if conflict.is_conflict() => ctx
            .monitor
            .observe_duplicate_write(candidate, conflict.to_string())
            .map_err(ExploreError::persistence),
        Err(e) => Err(ExploreError::persistence(e)),
    }
}

fn record(
    ctx: &ExploreContext,
    run: &PeriodRun,
    candidate: Candidate,
    observation: Observation,
) -> Result<(), ExploreError> {
    let state = observation.state;
    store_observation(ctx, candidate, observation)?;
    match state {
        CandidateState::Rejected => run.tally(|s| s.rejected += 1),
        CandidateState::Errored => run.tally(|s| s.errored += 1),
        _ => {}
    }
    Ok(())
}

/// Rebuild a cached league's records from stored responses. Returns whether
/// anything was replayed.
fn replay(ctx: &ExploreContext, run: &PeriodRun, candidate: Candidate) -> Result<bool, ExploreError> {
    let mut records = Vec::new();
    for &endpoint in &ctx.endpoints {
        let cached = match ctx.responses.get(endpoint, candidate) {
            Ok(Some(cached)) => cached,
            Ok(None) => continue,
            Err(e) => {
                debug!(candidate = %candidate, endpoint = %endpoint, error = %e, "Unreadable cached response");
                continue;
            }
        };
        match normalize_document(&cached.body, candidate, endpoint) {
            Ok(normalized) => records.extend(normalized.records),
            Err(failure) => {
                debug!(candidate = %candidate, endpoint = %endpoint, error = %failure, "Cached response no longer parses");
            }
        }
    }

    if records.is_empty() {
        return Ok(false);
    }
    run.tally(|s| s.replayed += 1);
    merge(ctx, run, records)?;
    Ok(true)
}

fn merge(
    ctx: &ExploreContext,
    run: &PeriodRun,
    records: Vec<NormalizedRecord>,
) -> Result<(), ExploreError> {
    let conflicts = {
        let mut merger = run
            .merger
            .lock()
            .map_err(|_| ExploreError::Worker("record merger lock poisoned".to_string()))?;
        records
            .into_iter()
            .flat_map(|record| merger.merge(record))
            .collect::<Vec<_>>()
    };

    for conflict in &conflicts {
        run.tally(|s| s.identity_conflicts += 1);
        run.sample(format!(
            "{}: {} '{}' vs '{}'",
            conflict.identity_key, conflict.field, conflict.existing, conflict.incoming
        ));
        ctx.monitor
            .observe_field_conflict(run.period, conflict)
            .map_err(ExploreError::persistence)?;
    }
    Ok(())
}

/// Enqueue the neighbours of a confirmed id
fn expand(ctx: &ExploreContext, run: &PeriodRun, candidate: Candidate) {
    if ctx.monitor.is_halted(run.period) {
        return;
    }
    let id = candidate.candidate_id;
    let neighbours = (id.saturating_sub(ctx.radius)..=id.saturating_add(ctx.radius))
        .filter(|&n| n > 0 && n != id);
    let added = run.frontier.push_all(neighbours);
    if added > 0 {
        debug!(candidate = %candidate, added, "Expanded neighbours");
    }
}
