//! Current-state store for a CDC-merged dimension.

use dashmap::DashMap;
use std::cmp::Ordering;

use crate::value::{Record, RowKey, Value};

/// Current row for one natural key and the position of the event that produced it.
#[derive(Debug, Clone, PartialEq)]
pub struct DimensionEntry {
    pub row: Record,
    pub sequence: Value,
    /// Read-order ordinal of the winning event. Rows restored from a table
    /// snapshot carry 0, so they rank before anything read after a restart.
    pub arrival: u64,
}

impl DimensionEntry {
    /// Order two entries by `(sequence, arrival)`.
    pub fn cmp_position(&self, sequence: &Value, arrival: u64) -> Ordering {
        (&self.sequence, self.arrival).cmp(&(sequence, arrival))
    }
}

/// Sharded concurrent map from natural key to current row.
///
/// Writers for the same key must be serialized by the caller; the merge
/// planner guarantees this by partitioning events by key.
#[derive(Debug, Default)]
pub struct DimensionStore {
    rows: DashMap<RowKey, DimensionEntry>,
}

impl DimensionStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    pub fn get(&self, key: &RowKey) -> Option<DimensionEntry> {
        self.rows.get(key).map(|entry| entry.value().clone())
    }

    pub fn contains(&self, key: &RowKey) -> bool {
        self.rows.contains_key(key)
    }

    /// Replace the entry for `key`.
    pub fn insert(&self, key: RowKey, entry: DimensionEntry) {
        self.rows.insert(key, entry);
    }

    pub fn clear(&self) {
        self.rows.clear();
    }

    /// All current rows, ordered by key.
    pub fn rows(&self) -> Vec<(RowKey, Record)> {
        let mut rows: Vec<_> = self
            .rows
            .iter()
            .map(|entry| (entry.key().clone(), entry.value().row.clone()))
            .collect();
        rows.sort_by(|a, b| a.0.cmp(&b.0));
        rows
    }
}
