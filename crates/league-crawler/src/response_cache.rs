//! Response cache for archive pages.
//!
//! Implements permanent caching of successful endpoint bodies so re-runs can
//! rebuild entities for already-confirmed leagues without fetching again.

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use shared::{Candidate, DataPaths, EndpointKind};
use std::path::{Path, PathBuf};
use tracing::{debug, info};

/// One cached endpoint body
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CachedResponse {
    pub endpoint: EndpointKind,
    pub candidate: Candidate,
    pub http_status: u16,
    pub fetched_at: DateTime<Utc>,
    pub body: String,
}

/// Cache manager for endpoint responses
pub struct ResponseCache {
    /// Root cache directory
    cache_dir: PathBuf,
    /// Whether caching is enabled
    enabled: bool,
}

impl ResponseCache {
    pub fn new(cache_dir: impl AsRef<Path>, enabled: bool) -> Result<Self> {
        let cache_dir = cache_dir.as_ref().to_path_buf();

        if enabled {
            std::fs::create_dir_all(&cache_dir).with_context(|| {
                format!("Failed to create cache directory: {}", cache_dir.display())
            })?;
            info!(cache_dir = %cache_dir.display(), "Response cache initialized");
        }

        Ok(Self { cache_dir, enabled })
    }

    /// A cache that stores nothing
    pub fn disabled() -> Self {
        Self {
            cache_dir: PathBuf::new(),
            enabled: false,
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    pub fn get(&self, endpoint: EndpointKind, candidate: Candidate) -> Result<Option<CachedResponse>> {
        if !self.enabled {
            return Ok(None);
        }

        let path = self.cache_path(endpoint, candidate);
        if !path.exists() {
            debug!(candidate = %candidate, endpoint = %endpoint, "Response cache miss");
            return Ok(None);
        }

        let content = std::fs::read_to_string(&path)
            .with_context(|| format!("Failed to read cache file: {}", path.display()))?;
        let cached: CachedResponse = serde_json::from_str(&content)
            .with_context(|| format!("Failed to parse cache file: {}", path.display()))?;

        debug!(candidate = %candidate, endpoint = %endpoint, "Response cache hit");
        Ok(Some(cached))
    }

    /// Store a body. The file is written under a temporary name and renamed
    /// into place so an interrupted write never leaves a torn entry.
    pub fn put(&self, response: &CachedResponse) -> Result<()> {
        if !self.enabled {
            return Ok(());
        }

        let path = self.cache_path(response.endpoint, response.candidate);
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).with_context(|| {
                format!("Failed to create cache subdirectory: {}", parent.display())
            })?;
        }

        let content = serde_json::to_string(response).context("Failed to serialize response")?;
        let tmp = path.with_extension("json.tmp");
        std::fs::write(&tmp, content)
            .with_context(|| format!("Failed to write cache file: {}", tmp.display()))?;
        std::fs::rename(&tmp, &path)
            .with_context(|| format!("Failed to move cache file into place: {}", path.display()))?;

        debug!(
            candidate = %response.candidate,
            endpoint = %response.endpoint,
            path = %path.display(),
            "Response cached"
        );
        Ok(())
    }

    pub fn exists(&self, endpoint: EndpointKind, candidate: Candidate) -> bool {
        self.enabled && self.cache_path(endpoint, candidate).exists()
    }

    fn cache_path(&self, endpoint: EndpointKind, candidate: Candidate) -> PathBuf {
        DataPaths::response_file(
            &self.cache_dir,
            endpoint,
            candidate.candidate_id,
            candidate.period,
        )
    }

    /// Clear all cached responses
    pub fn clear(&self) -> Result<()> {
        if !self.enabled {
            return Ok(());
        }

        if self.cache_dir.exists() {
            std::fs::remove_dir_all(&self.cache_dir).with_context(|| {
                format!("Failed to remove cache directory: {}", self.cache_dir.display())
            })?;
            std::fs::create_dir_all(&self.cache_dir).with_context(|| {
                format!("Failed to recreate cache directory: {}", self.cache_dir.display())
            })?;
            info!("Response cache cleared");
        }

        Ok(())
    }

    /// Get cache statistics
    pub fn stats(&self) -> Result<CacheStats> {
        let mut stats = CacheStats::default();
        if !self.enabled || !self.cache_dir.exists() {
            return Ok(stats);
        }

        for period_dir in std::fs::read_dir(&self.cache_dir)? {
            let period_dir = period_dir?;
            if !period_dir.path().is_dir() {
                continue;
            }
            stats.periods += 1;
            for entry in std::fs::read_dir(period_dir.path())? {
                let entry = entry?;
                let path = entry.path();
                if path.is_file() && path.extension().map(|e| e == "json").unwrap_or(false) {
                    stats.total_files += 1;
                    stats.total_size_bytes += entry.metadata()?.len();
                }
            }
        }

        Ok(stats)
    }
}

/// Cache statistics
#[derive(Debug, Clone, Default)]
pub struct CacheStats {
    pub periods: usize,
    pub total_files: usize,
    pub total_size_bytes: u64,
}
