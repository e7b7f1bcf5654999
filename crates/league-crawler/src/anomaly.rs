//! Anomaly monitor.
//!
//! Tracks run-scoped counters against configured thresholds and turns
//! deviations into `AnomalyEvent`s. A critical event under a halting policy
//! stops the affected period from dequeuing further candidates; under
//! `HaltRun` it also stops the run once the period is wound down.

use crate::api::FetchStatus;
use crate::cache::{lock_store, SharedStore};
use crate::merge::FieldConflict;
use crate::normalize::ParseFailure;
use anyhow::Result;
use serde_json::json;
use shared::config::AnomalyConfig;
use shared::{AnomalyEvent, AnomalyKind, AnomalyPolicy, Candidate, EndpointKind, Period};
use std::collections::{HashMap, HashSet};
use std::sync::Mutex;
use tracing::{error, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AnomalyThresholds {
    pub min_entities_per_period: usize,
    pub max_records_per_entity: usize,
    pub min_body_bytes: usize,
    pub max_body_bytes: usize,
    pub max_consecutive_fetch_errors: u32,
}

impl From<&AnomalyConfig> for AnomalyThresholds {
    fn from(config: &AnomalyConfig) -> Self {
        Self {
            min_entities_per_period: config.min_entities_per_period,
            max_records_per_entity: config.max_records_per_entity,
            min_body_bytes: config.min_body_bytes,
            max_body_bytes: config.max_body_bytes,
            max_consecutive_fetch_errors: config.max_consecutive_fetch_errors,
        }
    }
}

impl Default for AnomalyThresholds {
    fn default() -> Self {
        Self::from(&AnomalyConfig::default())
    }
}

#[derive(Debug, Default)]
struct MonitorState {
    events: Vec<AnomalyEvent>,
    halted: HashSet<Period>,
    consecutive_errors: HashMap<Period, u32>,
    run_halted: bool,
}

pub struct AnomalyMonitor {
    thresholds: AnomalyThresholds,
    policy: AnomalyPolicy,
    store: Option<SharedStore>,
    session_id: Option<i64>,
    state: Mutex<MonitorState>,
}

impl AnomalyMonitor {
    /// A monitor that keeps events in memory only
    pub fn new(thresholds: AnomalyThresholds, policy: AnomalyPolicy) -> Self {
        Self {
            thresholds,
            policy,
            store: None,
            session_id: None,
            state: Mutex::new(MonitorState::default()),
        }
    }

    pub fn from_config(config: &AnomalyConfig) -> Self {
        Self::new(AnomalyThresholds::from(config), config.policy)
    }

    /// Persist every raised event to the crawl store under a session
    pub fn with_store(mut self, store: SharedStore, session_id: Option<i64>) -> Self {
        self.store = Some(store);
        self.session_id = session_id;
        self
    }

    pub fn thresholds(&self) -> &AnomalyThresholds {
        &self.thresholds
    }

    pub fn policy(&self) -> AnomalyPolicy {
        self.policy
    }

    fn state(&self) -> Result<std::sync::MutexGuard<'_, MonitorState>> {
        self.state
            .lock()
            .map_err(|_| anyhow::anyhow!("anomaly monitor lock poisoned"))
    }

    /// Log, persist and apply the policy to one event.
    ///
    /// Fails only when the event cannot be persisted.
    pub fn raise(&self, event: AnomalyEvent) -> Result<()> {
        let blocking = event.is_critical() && self.policy.halts();

        if event.is_critical() {
            error!(
                kind = %event.kind,
                period = ?event.period.map(|p| p.0),
                candidate_id = ?event.candidate_id,
                policy = %self.policy,
                context = %event.context,
                "{}",
                event.message
            );
        } else {
            warn!(
                kind = %event.kind,
                period = ?event.period.map(|p| p.0),
                candidate_id = ?event.candidate_id,
                "{}",
                event.message
            );
        }

        if let Some(store) = &self.store {
            lock_store(store)?.record_anomaly(self.session_id, &event, blocking)?;
        }

        let mut state = self.state()?;
        if blocking {
            if let Some(period) = event.period {
                state.halted.insert(period);
            }
            if self.policy == AnomalyPolicy::HaltRun {
                state.run_halted = true;
            }
        }
        state.events.push(event);
        Ok(())
    }

    /// Track consecutive failed fetches within a period
    pub fn observe_fetch(&self, period: Period, status: FetchStatus) -> Result<()> {
        let limit = self.thresholds.max_consecutive_fetch_errors;
        let count = {
            let mut state = self.state()?;
            let counter = state.consecutive_errors.entry(period).or_insert(0);
            if status.is_error() {
                *counter += 1;
            } else {
                *counter = 0;
            }
            *counter
        };

        if limit > 0 && count == limit {
            self.raise(
                AnomalyEvent::critical(
                    AnomalyKind::FetchErrors,
                    format!("{} consecutive failed fetches in period {}", count, period),
                )
                .for_period(period)
                .with_context(json!({
                    "consecutive_errors": count,
                    "threshold": limit,
                    "last_status": format!("{:?}", status),
                })),
            )?;
        }
        Ok(())
    }

    pub fn observe_body(&self, candidate: Candidate, endpoint: EndpointKind, len: usize) -> Result<()> {
        let (min, max) = (self.thresholds.min_body_bytes, self.thresholds.max_body_bytes);
        if len >= min && len <= max {
            return Ok(());
        }
        self.raise(
            AnomalyEvent::warning(
                AnomalyKind::BodySize,
                format!("{} body of {} is {} bytes, expected {}..={}", endpoint, candidate, len, min, max),
            )
            .for_candidate(candidate)
            .with_context(json!({
                "endpoint": endpoint.as_str(),
                "bytes": len,
                "min_bytes": min,
                "max_bytes": max,
            })),
        )
    }

    pub fn observe_records(&self, candidate: Candidate, count: usize) -> Result<()> {
        let max = self.thresholds.max_records_per_entity;
        if count <= max {
            return Ok(());
        }
        self.raise(
            AnomalyEvent::warning(
                AnomalyKind::TooManyRecords,
                format!("{} produced {} records, more than {}", candidate, count, max),
            )
            .for_candidate(candidate)
            .with_context(json!({ "records": count, "threshold": max })),
        )
    }

    pub fn observe_field_conflict(&self, period: Period, conflict: &FieldConflict) -> Result<()> {
        self.raise(
            AnomalyEvent::warning(
                AnomalyKind::FieldConflict,
                format!(
                    "{}: field {} has '{}', {} brought '{}'",
                    conflict.identity_key,
                    conflict.field,
                    conflict.existing,
                    conflict.provenance.endpoint,
                    conflict.incoming
                ),
            )
            .for_candidate(Candidate::new(conflict.provenance.candidate_id, period))
            .with_context(json!({
                "identity_key": conflict.identity_key,
                "field": conflict.field,
                "existing": conflict.existing,
                "incoming": conflict.incoming,
                "provenance": conflict.provenance,
            })),
        )
    }

    pub fn observe_duplicate_write(&self, candidate: Candidate, message: String) -> Result<()> {
        self.raise(
            AnomalyEvent::warning(AnomalyKind::DuplicateWrite, message).for_candidate(candidate),
        )
    }

    pub fn observe_parse_failure(
        &self,
        candidate: Candidate,
        endpoint: EndpointKind,
        failure: &ParseFailure,
    ) -> Result<()> {
        self.raise(
            AnomalyEvent::warning(
                AnomalyKind::ParseFailure,
                format!("{} {}: {}", candidate, endpoint, failure),
            )
            .for_candidate(candidate)
            .with_context(json!({ "endpoint": endpoint.as_str() })),
        )
    }

    /// A confirmed league's body could not be kept for replay
    pub fn observe_response_cache_write(
        &self,
        candidate: Candidate,
        endpoint: EndpointKind,
        error: &anyhow::Error,
    ) -> Result<()> {
        self.raise(
            AnomalyEvent::warning(
                AnomalyKind::ResponseCacheWrite,
                format!("{} {} response not cached: {:#}", candidate, endpoint, error),
            )
            .for_candidate(candidate)
            .with_context(json!({ "endpoint": endpoint.as_str() })),
        )
    }

    /// Check a drained period's confirmed count
    pub fn check_drained(&self, period: Period, confirmed: usize) -> Result<()> {
        let min = self.thresholds.min_entities_per_period;
        if confirmed >= min {
            return Ok(());
        }
        self.raise(
            AnomalyEvent::critical(
                AnomalyKind::LowEntityCount,
                format!("period {} drained with {} confirmed leagues, expected at least {}", period, confirmed, min),
            )
            .for_period(period)
            .with_context(json!({ "confirmed": confirmed, "threshold": min })),
        )
    }

    /// No further candidates may be dequeued for this period
    pub fn is_halted(&self, period: Period) -> bool {
        self.state
            .lock()
            .map(|s| s.halted.contains(&period))
            .unwrap_or(true)
    }

    pub fn run_halted(&self) -> bool {
        self.state.lock().map(|s| s.run_halted).unwrap_or(true)
    }

    /// Entities of a halted period are not handed to the sink
    pub fn withholds(&self, period: Period) -> bool {
        self.is_halted(period)
    }

    /// Every event raised so far, in order
    pub fn events(&self) -> Vec<AnomalyEvent> {
        self.state
            .lock()
            .map(|s| s.events.clone())
            .unwrap_or_default()
    }

    pub fn has_critical(&self) -> bool {
        self.events().iter().any(|e| e.is_critical())
    }
}
