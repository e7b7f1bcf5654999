//! File path utilities for organizing data files.
//!
//! Every file the crawler writes lives under one data root: the SQLite
//! database, the response cache, per-period exports and logs.

use crate::models::{EndpointKind, Period};
use std::path::{Path, PathBuf};

/// File path manager for data files
#[derive(Debug, Clone)]
pub struct DataPaths {
    root: PathBuf,
}

impl DataPaths {
    /// Create a new DataPaths with the given root directory
    pub fn new(root: impl AsRef<Path>) -> Self {
        Self {
            root: root.as_ref().to_path_buf(),
        }
    }

    /// Get the root data directory
    pub fn root(&self) -> &Path {
        &self.root
    }

    // ========== Response cache ==========

    pub fn cache_dir(&self) -> PathBuf {
        self.root.join("cache")
    }

    /// Default response cache directory
    pub fn response_cache_dir(&self) -> PathBuf {
        self.cache_dir().join("responses")
    }

    /// Cached body of one endpoint for one league
    pub fn response_file(
        cache_dir: &Path,
        endpoint: EndpointKind,
        candidate_id: i64,
        period: Period,
    ) -> PathBuf {
        cache_dir
            .join(period.to_string())
            .join(format!("{}_{}.json", candidate_id, endpoint.as_str()))
    }

    // ========== Exports ==========

    pub fn exports_dir(&self) -> PathBuf {
        self.root.join("exports")
    }

    /// Merged entities of one period
    pub fn export_file(&self, period: Period) -> PathBuf {
        self.exports_dir().join(format!("players_{}.json", period))
    }

    // ========== Database ==========

    pub fn crawl_db(&self) -> PathBuf {
        self.root.join("crawl.db")
    }

    // ========== Logs ==========

    pub fn logs_dir(&self) -> PathBuf {
        self.root.join("logs")
    }

    /// Create all necessary directories
    pub fn create_dirs(&self) -> std::io::Result<()> {
        for dir in [
            self.response_cache_dir(),
            self.exports_dir(),
            self.logs_dir(),
        ] {
            std::fs::create_dir_all(&dir)?;
        }
        Ok(())
    }
}
