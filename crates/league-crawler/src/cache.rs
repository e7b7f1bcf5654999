//! Crawl cache: the single source of truth for tested coordinates.
//!
//! An in-memory index over `CrawlStore`, guarded by one short-held mutex.
//! Workers claim a coordinate before fetching it, so no coordinate is ever
//! fetched twice concurrently, and every recorded outcome is written through
//! to SQLite before the call returns.

use anyhow::Result;
use chrono::{DateTime, Duration, Utc};
use shared::{CacheEntry, Candidate, CandidateState, CrawlStore, Period, Quality};
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard};
use thiserror::Error;
use tracing::{debug, trace};

/// Store handle shared by the cache, the anomaly monitor and the orchestrator
pub type SharedStore = Arc<Mutex<CrawlStore>>;

pub fn shared_store(store: CrawlStore) -> SharedStore {
    Arc::new(Mutex::new(store))
}

/// Lock a shared store, mapping poisoning to an error
pub fn lock_store(store: &SharedStore) -> Result<MutexGuard<'_, CrawlStore>> {
    store
        .lock()
        .map_err(|_| anyhow::anyhow!("crawl store lock poisoned"))
}

#[derive(Debug, Error)]
pub enum CacheError {
    #[error(
        "duplicate write for {candidate}: recorded {existing_quality}/{existing_count}, \
         now {quality}/{record_count}"
    )]
    DuplicateWriteConflict {
        candidate: Candidate,
        existing_quality: Quality,
        existing_count: u32,
        quality: Quality,
        record_count: u32,
    },

    #[error("refusing to overwrite fresh {existing} entry for {candidate} with {incoming}: not claimed")]
    UnclaimedWrite {
        candidate: Candidate,
        existing: CandidateState,
        incoming: CandidateState,
    },

    #[error("crawl cache persistence failed: {0}")]
    Persistence(String),
}

impl CacheError {
    /// The write was refused and the stored facts are unchanged
    pub fn is_conflict(&self) -> bool {
        matches!(
            self,
            CacheError::DuplicateWriteConflict { .. } | CacheError::UnclaimedWrite { .. }
        )
    }
}

/// When a cached answer must be re-tested
#[derive(Debug, Clone, Copy)]
pub struct StalenessPolicy {
    /// Applies to confirmed entries of the current period only
    pub confirmed_ttl: Duration,
    pub rejected_ttl: Duration,
    pub current_period: Period,
}

impl StalenessPolicy {
    pub fn from_config(staleness: &shared::config::StalenessConfig, current_period: Period) -> Self {
        Self {
            confirmed_ttl: Duration::hours(staleness.confirmed_ttl_hours as i64),
            rejected_ttl: Duration::days(staleness.rejected_ttl_days as i64),
            current_period,
        }
    }

    pub fn is_stale(&self, entry: &CacheEntry, now: DateTime<Utc>) -> bool {
        let age = now - entry.last_checked_at;
        match entry.state {
            CandidateState::Untested => true,
            // Closed seasons do not change
            CandidateState::Confirmed if entry.period < self.current_period => false,
            CandidateState::Confirmed => age >= self.confirmed_ttl,
            CandidateState::Rejected | CandidateState::Errored => age >= self.rejected_ttl,
        }
    }
}

/// Result of an atomic lookup-then-claim
#[derive(Debug, Clone, PartialEq)]
pub enum Claim {
    /// The caller owns the coordinate and must `record` or `release` it
    Claimed,
    /// A fresh cached answer exists; nothing to fetch
    Fresh(CacheEntry),
    /// Another worker holds the claim
    Busy,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecordOutcome {
    /// New facts were stored
    Written,
    /// Same facts as before; only the check time moved
    Refreshed,
}

/// Facts learned from testing one coordinate
#[derive(Debug, Clone, PartialEq)]
pub struct Observation {
    pub state: CandidateState,
    pub quality: Quality,
    pub record_count: u32,
    pub display_name: Option<String>,
}

impl Observation {
    pub fn rejected() -> Self {
        Self {
            state: CandidateState::Rejected,
            quality: Quality::None,
            record_count: 0,
            display_name: None,
        }
    }

    pub fn errored() -> Self {
        Self {
            state: CandidateState::Errored,
            quality: Quality::None,
            record_count: 0,
            display_name: None,
        }
    }

    pub fn confirmed(quality: Quality, record_count: u32, display_name: Option<String>) -> Self {
        Self {
            state: CandidateState::Confirmed,
            quality,
            record_count,
            display_name,
        }
    }
}

#[derive(Debug, Default)]
struct CacheState {
    entries: HashMap<Candidate, CacheEntry>,
    claims: HashSet<Candidate>,
    /// Coordinates recorded as confirmed during this run
    confirmed_this_run: HashSet<Candidate>,
}

pub struct CrawlCache {
    store: SharedStore,
    policy: StalenessPolicy,
    state: Mutex<CacheState>,
}

impl CrawlCache {
    /// Load every persisted entry into memory
    pub fn load(store: SharedStore, policy: StalenessPolicy) -> Result<Self> {
        let entries = lock_store(&store)?.load_entries()?;
        debug!(entries = entries.len(), "Crawl cache loaded");

        let state = CacheState {
            entries: entries.into_iter().map(|e| (e.candidate(), e)).collect(),
            ..Default::default()
        };

        Ok(Self {
            store,
            policy,
            state: Mutex::new(state),
        })
    }

    pub fn policy(&self) -> &StalenessPolicy {
        &self.policy
    }

    fn state(&self) -> Result<MutexGuard<'_, CacheState>, CacheError> {
        self.state
            .lock()
            .map_err(|_| CacheError::Persistence("crawl cache lock poisoned".to_string()))
    }

    /// Cached entry for a coordinate, if any. No side effects.
    pub fn lookup(&self, candidate: Candidate) -> Option<CacheEntry> {
        self.state
            .lock()
            .ok()
            .and_then(|state| state.entries.get(&candidate).cloned())
    }

    pub fn is_stale(&self, entry: &CacheEntry, now: DateTime<Utc>) -> bool {
        self.policy.is_stale(entry, now)
    }

    /// Atomically look a coordinate up and claim it if it needs testing
    pub fn try_claim(&self, candidate: Candidate, now: DateTime<Utc>) -> Result<Claim, CacheError> {
        let mut state = self.state()?;

        if state.claims.contains(&candidate) {
            return Ok(Claim::Busy);
        }

        if let Some(entry) = state.entries.get(&candidate) {
            if !self.policy.is_stale(entry, now) {
                trace!(candidate = %candidate, state = %entry.state, "Fresh cache entry");
                return Ok(Claim::Fresh(entry.clone()));
            }
            debug!(candidate = %candidate, state = %entry.state, "Stale cache entry, re-testing");
        }

        state.claims.insert(candidate);
        Ok(Claim::Claimed)
    }

    /// Drop a claim without recording anything
    pub fn release(&self, candidate: Candidate) {
        if let Ok(mut state) = self.state.lock() {
            state.claims.remove(&candidate);
        }
    }

    /// Claim a coordinate whatever its freshness, for re-testing an entry
    /// whose stored responses cannot be replayed. `false` when another
    /// worker already holds the claim.
    pub fn reclaim(&self, candidate: Candidate) -> Result<bool, CacheError> {
        let mut state = self.state()?;
        let claimed = state.claims.insert(candidate);
        if claimed {
            debug!(candidate = %candidate, "Reclaimed fresh entry for re-test");
        }
        Ok(claimed)
    }

    /// Record what testing a coordinate revealed and release its claim.
    ///
    /// The entry is persisted before the in-memory index changes. A tested
    /// entry that is still fresh may only be overwritten under a claim from
    /// `try_claim`, otherwise the write is refused with `UnclaimedWrite`. A
    /// confirmed coordinate re-recorded within one run with different quality
    /// or record count is refused with `DuplicateWriteConflict`.
    pub fn record(
        &self,
        candidate: Candidate,
        observation: Observation,
        now: DateTime<Utc>,
    ) -> Result<RecordOutcome, CacheError> {
        let mut state = self.state()?;
        let claimed = state.claims.remove(&candidate);

        let existing = state.entries.get(&candidate).cloned();

        if let Some(existing) = &existing {
            if !claimed
                && existing.state != CandidateState::Untested
                && !self.policy.is_stale(existing, now)
            {
                return Err(CacheError::UnclaimedWrite {
                    candidate,
                    existing: existing.state,
                    incoming: observation.state,
                });
            }

            let differs = existing.quality != observation.quality
                || existing.record_count != observation.record_count;
            if existing.state == CandidateState::Confirmed
                && observation.state == CandidateState::Confirmed
                && state.confirmed_this_run.contains(&candidate)
                && differs
            {
                return Err(CacheError::DuplicateWriteConflict {
                    candidate,
                    existing_quality: existing.quality,
                    existing_count: existing.record_count,
                    quality: observation.quality,
                    record_count: observation.record_count,
                });
            }
        }

        let outcome = match &existing {
            Some(e)
                if e.state == observation.state
                    && e.quality == observation.quality
                    && e.record_count == observation.record_count =>
            {
                RecordOutcome::Refreshed
            }
            _ => RecordOutcome::Written,
        };

        let entry = CacheEntry {
            candidate_id: candidate.candidate_id,
            period: candidate.period,
            state: observation.state,
            quality: observation.quality,
            record_count: observation.record_count,
            display_name: observation
                .display_name
                .or_else(|| existing.as_ref().and_then(|e| e.display_name.clone())),
            last_checked_at: now,
            created_at: existing.as_ref().map(|e| e.created_at).unwrap_or(now),
        };

        lock_store(&self.store)
            .and_then(|mut store| store.upsert_entry(&entry))
            .map_err(|e| CacheError::Persistence(format!("{:#}", e)))?;

        if entry.state == CandidateState::Confirmed {
            state.confirmed_this_run.insert(candidate);
        }
        trace!(candidate = %candidate, state = %entry.state, ?outcome, "Recorded");
        state.entries.insert(candidate, entry);

        Ok(outcome)
    }

    /// Confirmed ids of a period, ascending
    pub fn confirmed_ids(&self, period: Period) -> Vec<i64> {
        let Ok(state) = self.state.lock() else {
            return Vec::new();
        };
        let mut ids: Vec<i64> = state
            .entries
            .values()
            .filter(|e| e.period == period && e.state == CandidateState::Confirmed)
            .map(|e| e.candidate_id)
            .collect();
        ids.sort_unstable();
        ids
    }

    pub fn len(&self) -> usize {
        self.state.lock().map(|s| s.entries.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
