//! Incremental inner equi-join of a fact table with dimension tables.
//!
//! Dimensions are joined in order. Each one is matched on a column of the
//! row accumulated so far, so a later dimension can be reached through a
//! column contributed by an earlier one (bookings reach airports through
//! the flight's `airport_id`). Dimension columns never overwrite columns
//! already present in the accumulated row.
//!
//! The join keeps the latest fact per fact key, the latest row per
//! dimension key, and a reverse index from dimension key to the facts that
//! reference it. A fact change recomputes that fact and a dimension change
//! recomputes every fact referencing the changed key. Output rows are keyed
//! by the fact key and emitted only when they differ from the last emitted
//! row.
//!
//! After a restart the state is rebuilt from the current rows of every
//! input and reconciled against the rows emitted before the restart.

use indexmap::IndexMap;
use std::collections::{HashMap, HashSet};
use std::ops::AddAssign;
use tracing::debug;

use crate::config::JoinMissPolicy;
use crate::table::{Change, ChangeOp, TableChange};
use crate::value::{Record, RowKey, Value};

/// One dimension of a join.
#[derive(Debug, Clone, PartialEq)]
pub struct JoinDimension {
    pub table: String,
    /// Column of the accumulated row matched against the dimension key.
    pub on: String,
}

/// Shape of a join.
#[derive(Debug, Clone, PartialEq)]
pub struct JoinSpec {
    pub fact_key: Vec<String>,
    pub dimensions: Vec<JoinDimension>,
    pub select: Vec<String>,
    pub join_miss: JoinMissPolicy,
}

/// Which input a change belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JoinInput {
    Fact,
    Dimension(usize),
}

/// Counters for one call to [`StreamJoin::apply`].
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct JoinStats {
    pub upserts: usize,
    pub deletes: usize,
    /// Facts discarded under [`JoinMissPolicy::Drop`].
    pub dropped: usize,
}

impl AddAssign for JoinStats {
    fn add_assign(&mut self, other: Self) {
        self.upserts += other.upserts;
        self.deletes += other.deletes;
        self.dropped += other.dropped;
    }
}

/// Join state and incremental evaluation.
pub struct StreamJoin {
    spec: JoinSpec,
    facts: HashMap<RowKey, Record>,
    dims: Vec<HashMap<Value, Record>>,
    /// Per dimension, dimension key to referencing facts.
    refs: Vec<HashMap<Value, HashSet<RowKey>>>,
    /// Per fact, the dimension key it references in each dimension.
    fact_refs: HashMap<RowKey, Vec<Option<Value>>>,
    emitted: HashMap<RowKey, Record>,
    pending: HashSet<RowKey>,
    /// Offset of the latest fact change per key while rebuilding.
    replayed: HashMap<RowKey, usize>,
}

impl StreamJoin {
    pub fn new(spec: JoinSpec) -> Self {
        let n = spec.dimensions.len();
        Self {
            spec,
            facts: HashMap::new(),
            dims: vec![HashMap::new(); n],
            refs: vec![HashMap::new(); n],
            fact_refs: HashMap::new(),
            emitted: HashMap::new(),
            pending: HashSet::new(),
            replayed: HashMap::new(),
        }
    }

    pub fn spec(&self) -> &JoinSpec {
        &self.spec
    }

    /// Facts that currently produce no output row.
    pub fn pending(&self) -> usize {
        self.pending.len()
    }

    pub fn fact_count(&self) -> usize {
        self.facts.len()
    }

    /// Facts kept without an output row, which only the drop policy needs
    /// to remember across restarts.
    pub fn unmatched(&self) -> Vec<RowKey> {
        if self.spec.join_miss != JoinMissPolicy::Drop {
            return Vec::new();
        }
        let mut keys: Vec<RowKey> = self.pending.iter().cloned().collect();
        keys.sort();
        keys
    }

    /// Last emitted row for `key`.
    pub fn emitted(&self, key: &RowKey) -> Option<&Record> {
        self.emitted.get(key)
    }

    /// Seed the emitted rows from the output table before a replay.
    pub fn restore_emitted(&mut self, rows: impl IntoIterator<Item = (RowKey, Record)>) {
        self.emitted = rows.into_iter().collect();
    }

    /// Apply input changes and return the output changes they cause.
    ///
    /// With `replay` set the join state is rebuilt but nothing is emitted
    /// and the emitted rows are left as restored.
    pub fn apply(
        &mut self,
        input: JoinInput,
        changes: &[TableChange],
        replay: bool,
    ) -> (Vec<Change>, JoinStats) {
        let mut out = Vec::new();
        let mut stats = JoinStats::default();

        for change in changes {
            match input {
                JoinInput::Fact => self.apply_fact(change, replay, &mut out, &mut stats),
                JoinInput::Dimension(index) => {
                    self.apply_dimension(index, change, replay, &mut out, &mut stats)
                }
            }
        }
        (out, stats)
    }

    /// Finish a replay and reconcile with the restored emitted rows.
    ///
    /// Every fact is joined against the rebuilt dimensions and the changes
    /// that bring the output up to date are returned. Under
    /// [`JoinMissPolicy::Drop`] a fact without an emitted row survives only
    /// if it is listed in `unmatched` or changed at or after `fresh_from`
    /// and joins now.
    pub fn finish_replay(
        &mut self,
        unmatched: &[RowKey],
        fresh_from: usize,
    ) -> (Vec<Change>, JoinStats) {
        let offsets = std::mem::take(&mut self.replayed);
        let unmatched: HashSet<RowKey> = unmatched.iter().cloned().collect();
        let drop_misses = self.spec.join_miss == JoinMissPolicy::Drop;
        let mut out = Vec::new();
        let mut stats = JoinStats::default();

        let mut keys: Vec<RowKey> = self.facts.keys().cloned().collect();
        keys.sort();
        for key in keys {
            let (row, refs) = self.compute(&key);
            self.index_fact(&key, refs);

            if drop_misses && !self.emitted.contains_key(&key) && !unmatched.contains(&key) {
                let fresh = offsets.get(&key).is_some_and(|offset| *offset >= fresh_from);
                if !fresh || row.is_none() {
                    self.remove_fact(&key);
                    if fresh {
                        stats.dropped += 1;
                    }
                    continue;
                }
            }
            self.publish(key, row, &mut out, &mut stats);
        }

        // Facts deleted while the join was down.
        let gone: Vec<RowKey> = self
            .emitted
            .keys()
            .filter(|key| !self.facts.contains_key(*key))
            .cloned()
            .collect();
        for key in gone {
            self.retract(&key, &mut out, &mut stats);
        }
        (out, stats)
    }

    fn apply_fact(
        &mut self,
        change: &TableChange,
        replay: bool,
        out: &mut Vec<Change>,
        stats: &mut JoinStats,
    ) {
        let key = match (&change.op, &change.key) {
            (ChangeOp::Append, _) => change.row.key(&self.spec.fact_key),
            (_, Some(key)) => Some(key.clone()),
            (_, None) => None,
        };
        let Some(key) = key else {
            debug!(offset = change.offset, "Skipping fact without a key");
            return;
        };

        if replay {
            self.replayed.insert(key.clone(), change.offset);
        }
        if change.op == ChangeOp::Delete {
            self.remove_fact(&key);
            if !replay {
                self.retract(&key, out, stats);
            }
            return;
        }

        let first_seen = !self.facts.contains_key(&key);
        self.facts.insert(key.clone(), change.row.clone());
        let (row, refs) = self.compute(&key);
        self.index_fact(&key, refs);

        if row.is_none() && first_seen && self.spec.join_miss == JoinMissPolicy::Drop && !replay {
            self.remove_fact(&key);
            stats.dropped += 1;
            return;
        }
        if !replay {
            self.publish(key, row, out, stats);
        }
    }

    fn apply_dimension(
        &mut self,
        index: usize,
        change: &TableChange,
        replay: bool,
        out: &mut Vec<Change>,
        stats: &mut JoinStats,
    ) {
        let Some(dim_key) = change
            .key
            .as_ref()
            .and_then(|key| key.parts().first().cloned())
        else {
            debug!(offset = change.offset, "Skipping dimension change without a key");
            return;
        };

        match change.op {
            ChangeOp::Delete => {
                self.dims[index].remove(&dim_key);
            }
            _ => {
                self.dims[index].insert(dim_key.clone(), change.row.clone());
            }
        }

        let affected: Vec<RowKey> = self.refs[index]
            .get(&dim_key)
            .map(|facts| facts.iter().cloned().collect())
            .unwrap_or_default();
        for key in affected {
            let (row, refs) = self.compute(&key);
            self.index_fact(&key, refs);
            if !replay {
                self.publish(key, row, out, stats);
            }
        }
    }

    /// Join one fact. Also returns the dimension keys it references, up to
    /// and including the first one that is missing.
    fn compute(&self, key: &RowKey) -> (Option<Record>, Vec<Option<Value>>) {
        let mut refs = vec![None; self.spec.dimensions.len()];
        let Some(fact) = self.facts.get(key) else {
            return (None, refs);
        };

        let mut row = fact.clone();
        for (i, dimension) in self.spec.dimensions.iter().enumerate() {
            let on = row.value(&dimension.on);
            if on.is_null() {
                return (None, refs);
            }
            refs[i] = Some(on.clone());
            let Some(dim_row) = self.dims[i].get(on) else {
                return (None, refs);
            };
            for (column, value) in dim_row.iter() {
                if !row.contains(column) {
                    row.insert(column.clone(), value.clone());
                }
            }
        }

        let projected = row.project(&self.spec.select);
        let complete = self
            .spec
            .select
            .iter()
            .all(|column| !projected.value(column).is_null());
        (complete.then_some(projected), refs)
    }

    fn index_fact(&mut self, key: &RowKey, refs: Vec<Option<Value>>) {
        let previous = self.fact_refs.insert(key.clone(), refs.clone());
        for (i, new_ref) in refs.iter().enumerate() {
            let old_ref = previous.as_ref().and_then(|p| p[i].as_ref());
            if old_ref == new_ref.as_ref() {
                continue;
            }
            if let Some(old) = old_ref {
                self.unlink(i, old, key);
            }
            if let Some(new) = new_ref {
                self.refs[i].entry(new.clone()).or_default().insert(key.clone());
            }
        }
    }

    fn unlink(&mut self, index: usize, dim_key: &Value, fact: &RowKey) {
        if let Some(facts) = self.refs[index].get_mut(dim_key) {
            facts.remove(fact);
            if facts.is_empty() {
                self.refs[index].remove(dim_key);
            }
        }
    }

    fn remove_fact(&mut self, key: &RowKey) {
        self.facts.remove(key);
        self.pending.remove(key);
        if let Some(refs) = self.fact_refs.remove(key) {
            for (i, dim_key) in refs.iter().enumerate() {
                if let Some(dim_key) = dim_key {
                    self.unlink(i, dim_key, key);
                }
            }
        }
    }

    fn publish(
        &mut self,
        key: RowKey,
        row: Option<Record>,
        out: &mut Vec<Change>,
        stats: &mut JoinStats,
    ) {
        match row {
            Some(row) => {
                self.pending.remove(&key);
                if self.emitted.get(&key) != Some(&row) {
                    self.emitted.insert(key.clone(), row.clone());
                    out.push(Change::upsert(key, row));
                    stats.upserts += 1;
                }
            }
            None => {
                self.pending.insert(key.clone());
                self.retract(&key, out, stats);
            }
        }
    }

    fn retract(&mut self, key: &RowKey, out: &mut Vec<Change>, stats: &mut JoinStats) {
        if let Some(previous) = self.emitted.remove(key) {
            out.push(Change::delete(key.clone(), previous));
            stats.deletes += 1;
        }
    }
}

/// Keep only the last change per key, preserving first-seen order.
pub fn coalesce(changes: Vec<Change>) -> Vec<Change> {
    let mut last: IndexMap<RowKey, Change> = IndexMap::new();
    for change in changes {
        if let Some(key) = change.key.clone() {
            last.insert(key, change);
        }
    }
    last.into_values().collect()
}
