//! Database operations for SQLite.
//!
//! This module handles database connections, schema creation, and migrations.

use anyhow::{Context, Result};
use rusqlite::Connection;
use std::path::Path;
use tracing::{debug, info};

/// Schema version written by `schema.sql`
pub const SCHEMA_VERSION: i32 = 2;

/// Database connection wrapper
pub struct Database {
    conn: Connection,
}

impl Database {
    /// Open or create a database at the given path
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let is_new = !path.exists();

        debug!(path = %path.display(), "Opening database");

        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent).with_context(|| {
                    format!("Failed to create database directory {}", parent.display())
                })?;
            }
        }

        let conn = Connection::open(path)
            .with_context(|| format!("Failed to open database at {}", path.display()))?;

        Self::init(conn, is_new)
    }

    /// Open a private in-memory database with the full schema
    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory().context("Failed to open in-memory database")?;
        Self::init(conn, true)
    }

    fn init(conn: Connection, is_new: bool) -> Result<Self> {
        conn.execute("PRAGMA foreign_keys = ON", [])
            .context("Failed to enable foreign keys")?;

        let mut db = Self { conn };

        if is_new {
            info!("Creating new database schema");
            db.create_schema()?;
        } else {
            db.run_migrations()?;
        }

        Ok(db)
    }

    fn create_schema(&mut self) -> Result<()> {
        self.conn
            .execute_batch(include_str!("../schema.sql"))
            .context("Failed to create database schema")?;

        info!(version = SCHEMA_VERSION, "Database schema created successfully");
        Ok(())
    }

    /// Get a reference to the underlying connection
    pub fn conn(&self) -> &Connection {
        &self.conn
    }

    /// Get a mutable reference to the underlying connection
    pub fn conn_mut(&mut self) -> &mut Connection {
        &mut self.conn
    }

    /// Check if a table exists
    pub fn table_exists(&self, table_name: &str) -> Result<bool> {
        let count: i64 = self.conn.query_row(
            "SELECT COUNT(*) FROM sqlite_master WHERE type='table' AND name=?1",
            [table_name],
            |row| row.get(0),
        )?;
        Ok(count > 0)
    }

    /// Check if a column exists on a table
    pub fn column_exists(&self, table_name: &str, column: &str) -> Result<bool> {
        let mut stmt = self
            .conn
            .prepare(&format!("PRAGMA table_info({})", table_name))?;
        let names = stmt
            .query_map([], |row| row.get::<_, String>(1))?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(names.iter().any(|name| name == column))
    }

    /// Get the database version (from user_version pragma)
    pub fn get_version(&self) -> Result<i32> {
        let version: i32 = self
            .conn
            .query_row("PRAGMA user_version", [], |row| row.get(0))?;
        Ok(version)
    }

    /// Set the database version
    pub fn set_version(&self, version: i32) -> Result<()> {
        self.conn
            .execute_batch(&format!("PRAGMA user_version = {}", version))?;
        Ok(())
    }

    /// Bring an existing database up to `SCHEMA_VERSION`
    fn run_migrations(&mut self) -> Result<()> {
        let version = self.get_version()?;
        if version >= SCHEMA_VERSION {
            debug!(version, "Database schema is current");
            return Ok(());
        }

        // Version 0 databases predate the crawler tables entirely
        if !self.table_exists("crawl_cache")? {
            info!("Running migration: creating crawler tables");
            self.create_schema()?;
            return Ok(());
        }

        // Version 1 stored anomalies without the blocking/acknowledged flags
        if self.table_exists("crawl_anomalies")?
            && !self.column_exists("crawl_anomalies", "blocking")?
        {
            info!("Running migration: adding anomaly acknowledgement columns");
            self.conn
                .execute_batch(
                    "ALTER TABLE crawl_anomalies ADD COLUMN blocking INTEGER NOT NULL DEFAULT 0;
                     ALTER TABLE crawl_anomalies ADD COLUMN acknowledged INTEGER NOT NULL DEFAULT 0;
                     CREATE INDEX IF NOT EXISTS idx_crawl_anomalies_blocking
                     ON crawl_anomalies(period, blocking, acknowledged);",
                )
                .context("Failed to add anomaly acknowledgement columns")?;
        }

        // Remaining tables are created idempotently
        self.conn
            .execute_batch(include_str!("../schema.sql"))
            .context("Failed to apply schema")?;

        self.set_version(SCHEMA_VERSION)?;
        info!(from = version, to = SCHEMA_VERSION, "Migrations completed");
        Ok(())
    }

    /// Begin a transaction
    pub fn begin_transaction(&mut self) -> Result<rusqlite::Transaction<'_>> {
        self.conn.transaction().context("Failed to begin transaction")
    }
}
