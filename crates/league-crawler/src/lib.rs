//! League crawler library for the basketball-bund.net statistics archive.
//!
//! This library discovers which league ids exist in which season, extracts
//! the statistics tables behind each league and merges them into one record
//! per player or team, while keeping re-runs incremental and halting on
//! suspicious result shapes.

pub mod anomaly;
pub mod api;
pub mod cache;
pub mod crawler;
pub mod discovery;
pub mod merge;
pub mod normalize;
pub mod response_cache;
pub mod sink;

pub use anomaly::{AnomalyMonitor, AnomalyThresholds};
pub use api::{Fetcher, HttpTransport, RateLimiter, RequestBuilder, RetryPolicy, StatistikRequestBuilder, Transport};
pub use cache::{CacheError, Claim, CrawlCache, Observation, SharedStore, StalenessPolicy};
pub use crawler::{LeagueCrawler, RunOutcome, RunSummary};
pub use discovery::{ExploreError, Frontier, IdSpaceExplorer, PeriodState, PeriodSummary, SeedPlan};
pub use merge::{FieldConflict, MergedEntity, RecordMerger};
pub use normalize::{ColumnSchema, DropReason, FieldValue, NormalizedRecord, ParseFailure};
pub use response_cache::ResponseCache;
pub use sink::{JsonFileSink, MemorySink, Sink};
