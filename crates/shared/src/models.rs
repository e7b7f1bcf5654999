//! Data models for the crawl pipeline.
//!
//! This module defines the durable facts the crawler keeps about the remote
//! catalog (cache entries), the coordinates it tests (candidates), the
//! statistics endpoints it knows how to read, and the anomaly events raised
//! while a run is in progress.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// A season. The remote catalog partitions league identifiers by season,
/// keyed by the year the season starts in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Period(pub i32);

impl Period {
    pub fn year(self) -> i32 {
        self.0
    }
}

impl fmt::Display for Period {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for Period {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        s.trim()
            .parse::<i32>()
            .map(Period)
            .map_err(|_| anyhow::anyhow!("Invalid period: {}", s))
    }
}

/// A coordinate to test: one league identifier within one season
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Candidate {
    pub period: Period,
    pub candidate_id: i64,
}

impl Candidate {
    pub fn new(candidate_id: i64, period: Period) -> Self {
        Self {
            period,
            candidate_id,
        }
    }
}

impl fmt::Display for Candidate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.candidate_id, self.period)
    }
}

/// What the crawler learned about a candidate
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum CandidateState {
    Untested,
    Confirmed,
    Rejected,
    Errored,
}

impl fmt::Display for CandidateState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CandidateState::Untested => write!(f, "untested"),
            CandidateState::Confirmed => write!(f, "confirmed"),
            CandidateState::Rejected => write!(f, "rejected"),
            CandidateState::Errored => write!(f, "errored"),
        }
    }
}

impl FromStr for CandidateState {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "untested" => Ok(CandidateState::Untested),
            "confirmed" => Ok(CandidateState::Confirmed),
            "rejected" => Ok(CandidateState::Rejected),
            "errored" => Ok(CandidateState::Errored),
            _ => Err(anyhow::anyhow!("Invalid candidate state: {}", s)),
        }
    }
}

/// How much of a confirmed league's statistics could be extracted
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum Quality {
    None,
    Partial,
    Complete,
}

impl fmt::Display for Quality {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Quality::None => write!(f, "none"),
            Quality::Partial => write!(f, "partial"),
            Quality::Complete => write!(f, "complete"),
        }
    }
}

impl FromStr for Quality {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "none" => Ok(Quality::None),
            "partial" => Ok(Quality::Partial),
            "complete" => Ok(Quality::Complete),
            _ => Err(anyhow::anyhow!("Invalid quality: {}", s)),
        }
    }
}

/// Durable fact about one candidate coordinate
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CacheEntry {
    pub candidate_id: i64,
    pub period: Period,
    pub state: CandidateState,
    pub quality: Quality,
    pub record_count: u32,
    pub display_name: Option<String>,
    pub last_checked_at: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
}

impl CacheEntry {
    pub fn candidate(&self) -> Candidate {
        Candidate::new(self.candidate_id, self.period)
    }
}

/// Statistics endpoint exposed for every league
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[serde(rename_all = "snake_case")]
pub enum EndpointKind {
    Standings,
    TopScorers,
    FreeThrows,
    ThreePointers,
}

impl EndpointKind {
    pub const ALL: [EndpointKind; 4] = [
        EndpointKind::TopScorers,
        EndpointKind::FreeThrows,
        EndpointKind::ThreePointers,
        EndpointKind::Standings,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            EndpointKind::Standings => "standings",
            EndpointKind::TopScorers => "top_scorers",
            EndpointKind::FreeThrows => "free_throws",
            EndpointKind::ThreePointers => "three_pointers",
        }
    }
}

impl fmt::Display for EndpointKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for EndpointKind {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "standings" => Ok(EndpointKind::Standings),
            "top_scorers" => Ok(EndpointKind::TopScorers),
            "free_throws" => Ok(EndpointKind::FreeThrows),
            "three_pointers" => Ok(EndpointKind::ThreePointers),
            _ => Err(anyhow::anyhow!("Unknown endpoint kind: {}", s)),
        }
    }
}

/// Anomaly severity
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Warning,
    Critical,
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Severity::Warning => write!(f, "warning"),
            Severity::Critical => write!(f, "critical"),
        }
    }
}

impl FromStr for Severity {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "warning" => Ok(Severity::Warning),
            "critical" => Ok(Severity::Critical),
            _ => Err(anyhow::anyhow!("Invalid severity: {}", s)),
        }
    }
}

/// What an anomaly event is about
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum AnomalyKind {
    /// Too few confirmed leagues once a season drained
    LowEntityCount,
    /// A single league produced more records than expected
    TooManyRecords,
    /// Response body outside the configured size window
    BodySize,
    /// Two records under one identity key disagree on a field
    FieldConflict,
    /// A confirmed cache entry was re-recorded with different facts
    DuplicateWrite,
    /// A statistics table could not be coerced into typed fields
    ParseFailure,
    /// Too many consecutive failed fetches within one season
    FetchErrors,
    /// A confirmed league's response bodies could not be stored for replay
    ResponseCacheWrite,
}

impl AnomalyKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            AnomalyKind::LowEntityCount => "low_entity_count",
            AnomalyKind::TooManyRecords => "too_many_records",
            AnomalyKind::BodySize => "body_size",
            AnomalyKind::FieldConflict => "field_conflict",
            AnomalyKind::DuplicateWrite => "duplicate_write",
            AnomalyKind::ParseFailure => "parse_failure",
            AnomalyKind::FetchErrors => "fetch_errors",
            AnomalyKind::ResponseCacheWrite => "response_cache_write",
        }
    }
}

impl fmt::Display for AnomalyKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for AnomalyKind {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "low_entity_count" => Ok(AnomalyKind::LowEntityCount),
            "too_many_records" => Ok(AnomalyKind::TooManyRecords),
            "body_size" => Ok(AnomalyKind::BodySize),
            "field_conflict" => Ok(AnomalyKind::FieldConflict),
            "duplicate_write" => Ok(AnomalyKind::DuplicateWrite),
            "parse_failure" => Ok(AnomalyKind::ParseFailure),
            "fetch_errors" => Ok(AnomalyKind::FetchErrors),
            "response_cache_write" => Ok(AnomalyKind::ResponseCacheWrite),
            _ => Err(anyhow::anyhow!("Invalid anomaly kind: {}", s)),
        }
    }
}

/// Run-time signal that the observed data deviates from expected bounds
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AnomalyEvent {
    pub severity: Severity,
    pub kind: AnomalyKind,
    pub message: String,
    pub period: Option<Period>,
    pub candidate_id: Option<i64>,
    /// Snapshot of the counters and values that triggered the event
    pub context: serde_json::Value,
    pub raised_at: DateTime<Utc>,
}

impl AnomalyEvent {
    pub fn new(severity: Severity, kind: AnomalyKind, message: impl Into<String>) -> Self {
        Self {
            severity,
            kind,
            message: message.into(),
            period: None,
            candidate_id: None,
            context: serde_json::Value::Object(Default::default()),
            raised_at: Utc::now(),
        }
    }

    pub fn warning(kind: AnomalyKind, message: impl Into<String>) -> Self {
        Self::new(Severity::Warning, kind, message)
    }

    pub fn critical(kind: AnomalyKind, message: impl Into<String>) -> Self {
        Self::new(Severity::Critical, kind, message)
    }

    pub fn for_period(mut self, period: Period) -> Self {
        self.period = Some(period);
        self
    }

    pub fn for_candidate(mut self, candidate: Candidate) -> Self {
        self.period = Some(candidate.period);
        self.candidate_id = Some(candidate.candidate_id);
        self
    }

    pub fn with_context(mut self, context: serde_json::Value) -> Self {
        self.context = context;
        self
    }

    pub fn is_critical(&self) -> bool {
        self.severity == Severity::Critical
    }
}
