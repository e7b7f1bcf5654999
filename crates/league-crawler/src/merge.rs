//! Record merging by identity key.
//!
//! Partial records about one player (or team) arrive from several endpoints
//! and leagues. The merger keeps every distinct value seen per field so the
//! result, and the number of conflicts reported, does not depend on the
//! order in which workers delivered the records.

use crate::normalize::{FieldValue, NormalizedRecord, Provenance};
use serde::Serialize;
use shared::Period;
use std::collections::{BTreeMap, HashMap};

/// One logical entity after all contributions were merged
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MergedEntity {
    pub identity_key: String,
    /// Each field resolved to its earliest value in crawl order: the value
    /// with the smallest provenance (period, candidate id, endpoint, table,
    /// row). This is not arrival order; concurrent workers deliver records
    /// in any order and the result stays the same.
    pub fields: BTreeMap<String, FieldValue>,
    /// Fields that saw more than one value, all values in crawl order
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    pub conflicts: BTreeMap<String, Vec<FieldValue>>,
    /// Contributing records, in crawl order
    pub contributions: Vec<NormalizedRecord>,
}

/// A new distinct value for an already-set field
#[derive(Debug, Clone, PartialEq)]
pub struct FieldConflict {
    pub identity_key: String,
    pub field: String,
    pub existing: FieldValue,
    pub incoming: FieldValue,
    pub provenance: Provenance,
}

#[derive(Debug, Default)]
struct Accumulator {
    /// Distinct values per field with the earliest provenance that carried each
    fields: BTreeMap<String, Vec<(FieldValue, Provenance)>>,
    contributions: Vec<NormalizedRecord>,
}

/// Merges the records of one period
#[derive(Debug)]
pub struct RecordMerger {
    period: Period,
    entities: HashMap<String, Accumulator>,
    conflicts: usize,
}

impl RecordMerger {
    pub fn new(period: Period) -> Self {
        Self {
            period,
            entities: HashMap::new(),
            conflicts: 0,
        }
    }

    pub fn period(&self) -> Period {
        self.period
    }

    /// Number of distinct entities so far
    pub fn len(&self) -> usize {
        self.entities.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entities.is_empty()
    }

    /// Total conflicts reported so far
    pub fn conflict_count(&self) -> usize {
        self.conflicts
    }

    /// Fold one record in, returning the conflicts it introduced
    pub fn merge(&mut self, record: NormalizedRecord) -> Vec<FieldConflict> {
        let mut conflicts = Vec::new();
        let acc = self
            .entities
            .entry(record.identity_key.clone())
            .or_default();

        for (field, value) in &record.fields {
            let values = acc.fields.entry(field.clone()).or_default();

            if let Some(slot) = values.iter_mut().find(|(v, _)| v == value) {
                if record.provenance < slot.1 {
                    slot.1 = record.provenance.clone();
                }
                continue;
            }

            if let Some((existing, _)) = values.iter().min_by(|a, b| a.1.cmp(&b.1)) {
                conflicts.push(FieldConflict {
                    identity_key: record.identity_key.clone(),
                    field: field.clone(),
                    existing: existing.clone(),
                    incoming: value.clone(),
                    provenance: record.provenance.clone(),
                });
            }
            values.push((value.clone(), record.provenance.clone()));
        }

        acc.contributions.push(record);
        self.conflicts += conflicts.len();
        conflicts
    }

    /// Snapshot of every entity, sorted by identity key. Field values are
    /// resolved by smallest provenance, not by the order `merge` was called.
    pub fn finalize(&self) -> Vec<MergedEntity> {
        let mut keys: Vec<&String> = self.entities.keys().collect();
        keys.sort();

        keys.into_iter()
            .filter_map(|key| self.entities.get(key).map(|acc| (key, acc)))
            .map(|(key, acc)| {
                let mut fields = BTreeMap::new();
                let mut conflicts = BTreeMap::new();

                for (name, values) in &acc.fields {
                    let mut ordered: Vec<&(FieldValue, Provenance)> = values.iter().collect();
                    ordered.sort_by(|a, b| a.1.cmp(&b.1));

                    if let Some((first, _)) = ordered.first() {
                        fields.insert(name.clone(), first.clone());
                    }
                    if ordered.len() > 1 {
                        conflicts.insert(
                            name.clone(),
                            ordered.iter().map(|(v, _)| v.clone()).collect(),
                        );
                    }
                }

                let mut contributions = acc.contributions.clone();
                contributions.sort_by(|a, b| a.provenance.cmp(&b.provenance));

                MergedEntity {
                    identity_key: key.clone(),
                    fields,
                    conflicts,
                    contributions,
                }
            })
            .collect()
    }
}
