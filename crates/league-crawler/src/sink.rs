//! Output sinks for finalized entities.

use crate::merge::MergedEntity;
use anyhow::{Context, Result};
use serde::Serialize;
use shared::{DataPaths, Period};
use std::sync::Mutex;
use tracing::info;

/// Receives each period's finalized entities
pub trait Sink: Send + Sync {
    fn emit(&self, period: Period, entities: &[MergedEntity]) -> Result<()>;
}

#[derive(Serialize)]
struct ExportFile<'a> {
    period: Period,
    exported_at: chrono::DateTime<chrono::Utc>,
    entity_count: usize,
    entities: &'a [MergedEntity],
}

/// Writes `players_<period>.json` under the exports directory
pub struct JsonFileSink {
    paths: DataPaths,
}

impl JsonFileSink {
    pub fn new(paths: DataPaths) -> Self {
        Self { paths }
    }
}

impl Sink for JsonFileSink {
    fn emit(&self, period: Period, entities: &[MergedEntity]) -> Result<()> {
        let path = self.paths.export_file(period);
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).with_context(|| {
                format!("Failed to create exports directory: {}", parent.display())
            })?;
        }

        let export = ExportFile {
            period,
            exported_at: chrono::Utc::now(),
            entity_count: entities.len(),
            entities,
        };
        let content =
            serde_json::to_string_pretty(&export).context("Failed to serialize entities")?;
        std::fs::write(&path, content)
            .with_context(|| format!("Failed to write export: {}", path.display()))?;

        info!(
            period = period.0,
            entities = entities.len(),
            path = %path.display(),
            "Entities exported"
        );
        Ok(())
    }
}

/// Keeps every emitted batch in memory
#[derive(Debug, Default)]
pub struct MemorySink {
    batches: Mutex<Vec<(Period, Vec<MergedEntity>)>>,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn batches(&self) -> Vec<(Period, Vec<MergedEntity>)> {
        self.batches
            .lock()
            .map(|b| b.clone())
            .unwrap_or_default()
    }

    /// Entities emitted for one period, if it was emitted
    pub fn entities(&self, period: Period) -> Option<Vec<MergedEntity>> {
        self.batches()
            .into_iter()
            .find(|(p, _)| *p == period)
            .map(|(_, entities)| entities)
    }
}

impl Sink for MemorySink {
    fn emit(&self, period: Period, entities: &[MergedEntity]) -> Result<()> {
        self.batches
            .lock()
            .map_err(|_| anyhow::anyhow!("memory sink lock poisoned"))?
            .push((period, entities.to_vec()));
        Ok(())
    }
}
