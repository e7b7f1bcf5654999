//! Durable crawl state.
//!
//! `CrawlStore` is the SQL access layer for the crawl cache, the session log
//! and persisted anomaly events. Every write is a single statement and is
//! durable once the call returns.

use crate::models::*;
use crate::Database;
use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use rusqlite::{params, OptionalExtension};
use serde::Serialize;
use std::collections::BTreeMap;
use std::path::Path;
use std::str::FromStr;
use tracing::{debug, info};

const ENTRY_COLUMNS: &str = "candidate_id, period, state, quality, record_count, display_name,
     last_checked_at, created_at";

/// Crawl state store
pub struct CrawlStore {
    db: Database,
}

impl CrawlStore {
    /// Create a new store over the given database
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        Ok(Self::new(Database::open(path)?))
    }

    pub fn open_in_memory() -> Result<Self> {
        Ok(Self::new(Database::open_in_memory()?))
    }

    pub fn db(&self) -> &Database {
        &self.db
    }

    // ========== Cache entries ==========

    /// Load every cache entry, ordered by period then id
    pub fn load_entries(&self) -> Result<Vec<CacheEntry>> {
        let conn = self.db.conn();
        let mut stmt = conn.prepare(&format!(
            "SELECT {} FROM crawl_cache ORDER BY period, candidate_id",
            ENTRY_COLUMNS
        ))?;

        let entries = stmt
            .query_map([], row_to_entry)?
            .collect::<rusqlite::Result<Vec<_>>>()
            .context("Failed to load cache entries")?;

        debug!(count = entries.len(), "Loaded cache entries");
        Ok(entries)
    }

    pub fn get_entry(&self, candidate_id: i64, period: Period) -> Result<Option<CacheEntry>> {
        self.db
            .conn()
            .query_row(
                &format!(
                    "SELECT {} FROM crawl_cache WHERE candidate_id = ?1 AND period = ?2",
                    ENTRY_COLUMNS
                ),
                params![candidate_id, period.0],
                row_to_entry,
            )
            .optional()
            .context("Failed to query cache entry")
    }

    /// Insert or replace the entry for its coordinate.
    ///
    /// `created_at` of an existing row is preserved.
    pub fn upsert_entry(&mut self, entry: &CacheEntry) -> Result<()> {
        self.db
            .conn_mut()
            .execute(
                "INSERT INTO crawl_cache (
                    candidate_id, period, state, quality, record_count, display_name,
                    last_checked_at, created_at
                ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)
                ON CONFLICT(candidate_id, period) DO UPDATE SET
                    state = excluded.state,
                    quality = excluded.quality,
                    record_count = excluded.record_count,
                    display_name = excluded.display_name,
                    last_checked_at = excluded.last_checked_at",
                params![
                    entry.candidate_id,
                    entry.period.0,
                    entry.state.to_string(),
                    entry.quality.to_string(),
                    entry.record_count,
                    entry.display_name,
                    entry.last_checked_at,
                    entry.created_at,
                ],
            )
            .with_context(|| {
                format!(
                    "Failed to persist cache entry {}",
                    entry.candidate()
                )
            })?;
        Ok(())
    }

    /// Per-period counts of cache entries by state
    pub fn period_stats(&self) -> Result<Vec<PeriodStats>> {
        let conn = self.db.conn();
        let mut stmt = conn.prepare(
            "SELECT period, state, COUNT(*), COALESCE(SUM(record_count), 0)
             FROM crawl_cache GROUP BY period, state ORDER BY period",
        )?;

        let rows = stmt.query_map([], |row| {
            Ok((
                row.get::<_, i32>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, i64>(2)?,
                row.get::<_, i64>(3)?,
            ))
        })?;

        let mut by_period: BTreeMap<i32, PeriodStats> = BTreeMap::new();
        for row in rows {
            let (period, state, count, records) = row?;
            let stats = by_period
                .entry(period)
                .or_insert_with(|| PeriodStats::empty(Period(period)));
            let count = count as usize;
            match state.parse::<CandidateState>()? {
                CandidateState::Untested => stats.untested += count,
                CandidateState::Confirmed => {
                    stats.confirmed += count;
                    stats.records += records as usize;
                }
                CandidateState::Rejected => stats.rejected += count,
                CandidateState::Errored => stats.errored += count,
            }
            stats.total += count;
        }

        Ok(by_period.into_values().collect())
    }

    /// Confirmed leagues, optionally restricted to one period
    pub fn confirmed_entries(&self, period: Option<Period>, limit: usize) -> Result<Vec<CacheEntry>> {
        let conn = self.db.conn();
        let limit = limit.min(i64::MAX as usize) as i64;

        let entries = match period {
            Some(period) => {
                let mut stmt = conn.prepare(&format!(
                    "SELECT {} FROM crawl_cache
                     WHERE state = 'confirmed' AND period = ?1
                     ORDER BY candidate_id LIMIT ?2",
                    ENTRY_COLUMNS
                ))?;
                let rows = stmt
                    .query_map(params![period.0, limit], row_to_entry)?
                    .collect::<rusqlite::Result<Vec<_>>>()?;
                rows
            }
            None => {
                let mut stmt = conn.prepare(&format!(
                    "SELECT {} FROM crawl_cache
                     WHERE state = 'confirmed'
                     ORDER BY period DESC, candidate_id LIMIT ?1",
                    ENTRY_COLUMNS
                ))?;
                let rows = stmt
                    .query_map(params![limit], row_to_entry)?
                    .collect::<rusqlite::Result<Vec<_>>>()?;
                rows
            }
        };

        Ok(entries)
    }

    // ========== Sessions ==========

    /// Open a crawl session and return its id
    pub fn start_session(&mut self, periods: &[Period]) -> Result<i64> {
        let periods = serde_json::to_string(periods)?;
        let conn = self.db.conn_mut();
        conn.execute(
            "INSERT INTO crawl_sessions (started_at, periods) VALUES (?1, ?2)",
            params![Utc::now(), periods],
        )
        .context("Failed to start crawl session")?;

        let id = conn.last_insert_rowid();
        info!(session_id = id, "Started crawl session");
        Ok(id)
    }

    pub fn complete_session(
        &mut self,
        session_id: i64,
        counters: &SessionCounters,
        outcome: &str,
    ) -> Result<()> {
        self.db
            .conn_mut()
            .execute(
                "UPDATE crawl_sessions SET
                    completed_at = ?1,
                    candidates_tested = ?2,
                    confirmed = ?3,
                    rejected = ?4,
                    errored = ?5,
                    entities = ?6,
                    outcome = ?7
                 WHERE id = ?8",
                params![
                    Utc::now(),
                    counters.candidates_tested as i64,
                    counters.confirmed as i64,
                    counters.rejected as i64,
                    counters.errored as i64,
                    counters.entities as i64,
                    outcome,
                    session_id,
                ],
            )
            .context("Failed to complete crawl session")?;

        info!(session_id, outcome, "Completed crawl session");
        Ok(())
    }

    /// Most recent sessions first
    pub fn recent_sessions(&self, limit: usize) -> Result<Vec<SessionRecord>> {
        let conn = self.db.conn();
        let mut stmt = conn.prepare(
            "SELECT id, started_at, completed_at, candidates_tested, confirmed, rejected,
                    errored, entities, outcome
             FROM crawl_sessions ORDER BY id DESC LIMIT ?1",
        )?;

        let sessions = stmt
            .query_map(params![limit as i64], |row| {
                Ok(SessionRecord {
                    id: row.get(0)?,
                    started_at: row.get(1)?,
                    completed_at: row.get(2)?,
                    counters: SessionCounters {
                        candidates_tested: row.get::<_, i64>(3)? as usize,
                        confirmed: row.get::<_, i64>(4)? as usize,
                        rejected: row.get::<_, i64>(5)? as usize,
                        errored: row.get::<_, i64>(6)? as usize,
                        entities: row.get::<_, i64>(7)? as usize,
                    },
                    outcome: row.get(8)?,
                })
            })?
            .collect::<rusqlite::Result<Vec<_>>>()?;

        Ok(sessions)
    }

    // ========== Anomalies ==========

    /// Persist an anomaly event.
    ///
    /// A blocking event keeps its period from being crawled again until it is
    /// acknowledged.
    pub fn record_anomaly(
        &mut self,
        session_id: Option<i64>,
        event: &AnomalyEvent,
        blocking: bool,
    ) -> Result<i64> {
        let context = serde_json::to_string(&event.context)?;
        let conn = self.db.conn_mut();
        conn.execute(
            "INSERT INTO crawl_anomalies (
                session_id, severity, kind, period, candidate_id, message, context,
                raised_at, blocking
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
            params![
                session_id,
                event.severity.to_string(),
                event.kind.as_str(),
                event.period.map(|p| p.0),
                event.candidate_id,
                event.message,
                context,
                event.raised_at,
                blocking,
            ],
        )
        .context("Failed to persist anomaly")?;

        Ok(conn.last_insert_rowid())
    }

    pub fn list_anomalies(&self, include_acknowledged: bool) -> Result<Vec<StoredAnomaly>> {
        let conn = self.db.conn();
        let sql = if include_acknowledged {
            "SELECT id, session_id, severity, kind, period, candidate_id, message, context,
                    raised_at, blocking, acknowledged
             FROM crawl_anomalies ORDER BY id"
        } else {
            "SELECT id, session_id, severity, kind, period, candidate_id, message, context,
                    raised_at, blocking, acknowledged
             FROM crawl_anomalies WHERE acknowledged = 0 ORDER BY id"
        };

        let mut stmt = conn.prepare(sql)?;
        let anomalies = stmt
            .query_map([], row_to_anomaly)?
            .collect::<rusqlite::Result<Vec<_>>>()
            .context("Failed to load anomalies")?;

        Ok(anomalies)
    }

    /// Periods held back by unacknowledged blocking anomalies
    pub fn blocked_periods(&self) -> Result<Vec<Period>> {
        let conn = self.db.conn();
        let mut stmt = conn.prepare(
            "SELECT DISTINCT period FROM crawl_anomalies
             WHERE blocking = 1 AND acknowledged = 0 AND period IS NOT NULL
             ORDER BY period",
        )?;

        let periods = stmt
            .query_map([], |row| row.get::<_, i32>(0).map(Period))?
            .collect::<rusqlite::Result<Vec<_>>>()?;

        Ok(periods)
    }

    /// Acknowledge every open anomaly of a period, returning how many changed
    pub fn acknowledge_period(&mut self, period: Period) -> Result<usize> {
        let changed = self
            .db
            .conn_mut()
            .execute(
                "UPDATE crawl_anomalies SET acknowledged = 1
                 WHERE period = ?1 AND acknowledged = 0",
                params![period.0],
            )
            .context("Failed to acknowledge anomalies")?;

        info!(period = %period, acknowledged = changed, "Acknowledged anomalies");
        Ok(changed)
    }
}

/// Helper: parse a stored enum column
fn parse_column<T>(idx: usize, value: String) -> rusqlite::Result<T>
where
    T: FromStr<Err = anyhow::Error>,
{
    value.parse::<T>().map_err(|e| {
        rusqlite::Error::FromSqlConversionFailure(idx, rusqlite::types::Type::Text, e.into())
    })
}

/// Helper: Convert a database row to a CacheEntry
fn row_to_entry(row: &rusqlite::Row) -> rusqlite::Result<CacheEntry> {
    Ok(CacheEntry {
        candidate_id: row.get(0)?,
        period: Period(row.get(1)?),
        state: parse_column(2, row.get(2)?)?,
        quality: parse_column(3, row.get(3)?)?,
        record_count: row.get::<_, i64>(4)?.max(0) as u32,
        display_name: row.get(5)?,
        last_checked_at: row.get(6)?,
        created_at: row.get(7)?,
    })
}

fn row_to_anomaly(row: &rusqlite::Row) -> rusqlite::Result<StoredAnomaly> {
    let context: String = row.get(7)?;
    Ok(StoredAnomaly {
        id: row.get(0)?,
        session_id: row.get(1)?,
        event: AnomalyEvent {
            severity: parse_column(2, row.get(2)?)?,
            kind: parse_column(3, row.get(3)?)?,
            period: row.get::<_, Option<i32>>(4)?.map(Period),
            candidate_id: row.get(5)?,
            message: row.get(6)?,
            context: serde_json::from_str(&context).unwrap_or(serde_json::Value::Null),
            raised_at: row.get(8)?,
        },
        blocking: row.get(9)?,
        acknowledged: row.get(10)?,
    })
}

/// Cache statistics for one period
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PeriodStats {
    pub period: Period,
    pub total: usize,
    pub untested: usize,
    pub confirmed: usize,
    pub rejected: usize,
    pub errored: usize,
    /// Sum of record counts over confirmed leagues
    pub records: usize,
}

impl PeriodStats {
    fn empty(period: Period) -> Self {
        Self {
            period,
            total: 0,
            untested: 0,
            confirmed: 0,
            rejected: 0,
            errored: 0,
            records: 0,
        }
    }
}

/// Counters written when a session completes
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct SessionCounters {
    pub candidates_tested: usize,
    pub confirmed: usize,
    pub rejected: usize,
    pub errored: usize,
    pub entities: usize,
}

#[derive(Debug, Clone)]
pub struct SessionRecord {
    pub id: i64,
    pub started_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    pub counters: SessionCounters,
    pub outcome: Option<String>,
}

/// An anomaly event as persisted
#[derive(Debug, Clone)]
pub struct StoredAnomaly {
    pub id: i64,
    pub session_id: Option<i64>,
    pub event: AnomalyEvent,
    pub blocking: bool,
    pub acknowledged: bool,
}
