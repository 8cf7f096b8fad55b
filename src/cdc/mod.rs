//! Sequence-ordered CDC merge (SCD type 1).
//!
//! Change events are reduced into one current row per natural key. An event
//! replaces the stored row when its `(sequence, arrival)` position is at
//! least the stored one; older events are discarded as stale. Equal sequence
//! values resolve by arrival ordinal, the later arrival winning.
//!
//! Merging a batch is split in two so the table commit can sit in between:
//! [`CdcMerge::plan`] computes the winning upserts without touching the
//! store, and [`CdcMerge::apply`] installs them once they are durable.

mod store;

pub use store::{DimensionEntry, DimensionStore};

use std::cmp::Ordering;
use std::collections::HashMap;
use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::sync::Arc;
use tokio::task::{JoinError, JoinSet};

use crate::emit;
use crate::metrics::events::{CdcEvents, DimensionRows, MergeOutcome};
use crate::value::{Record, RowKey, Value};

/// One observed state of an entity.
#[derive(Debug, Clone, PartialEq)]
pub struct ChangeEvent {
    pub key: RowKey,
    pub sequence: Value,
    pub arrival: u64,
    pub row: Record,
}

impl ChangeEvent {
    fn cmp_position(&self, other: &ChangeEvent) -> Ordering {
        (&self.sequence, self.arrival).cmp(&(&other.sequence, other.arrival))
    }
}

/// A record that cannot take part in a merge.
#[derive(Debug, Clone, PartialEq)]
pub struct RejectedEvent {
    pub row: Record,
    pub reason: String,
}

/// Per-outcome event counts for one batch.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct MergeStats {
    pub applied: usize,
    pub superseded: usize,
    pub stale: usize,
    pub unchanged: usize,
    pub rejected: usize,
}

impl MergeStats {
    fn add(&mut self, other: MergeStats) {
        self.applied += other.applied;
        self.superseded += other.superseded;
        self.stale += other.stale;
        self.unchanged += other.unchanged;
        self.rejected += other.rejected;
    }
}

/// Winning upserts of a batch, not yet applied to the store.
#[derive(Debug, Default)]
pub struct MergePlan {
    /// One entry per changed key, ordered by key.
    pub upserts: Vec<(RowKey, DimensionEntry)>,
    pub stats: MergeStats,
}

impl MergePlan {
    pub fn is_empty(&self) -> bool {
        self.upserts.is_empty()
    }
}

/// CDC reducer for one dimension.
#[derive(Debug)]
pub struct CdcMerge {
    name: String,
    keys: Vec<String>,
    sequence_by: String,
    parallelism: usize,
    store: Arc<DimensionStore>,
    next_arrival: u64,
}

impl CdcMerge {
    pub fn new(
        name: impl Into<String>,
        keys: Vec<String>,
        sequence_by: impl Into<String>,
        parallelism: usize,
    ) -> Self {
        Self {
            name: name.into(),
            keys,
            sequence_by: sequence_by.into(),
            parallelism: parallelism.max(1),
            store: Arc::new(DimensionStore::new()),
            next_arrival: 1,
        }
    }

    pub fn keys(&self) -> &[String] {
        &self.keys
    }

    pub fn sequence_by(&self) -> &str {
        &self.sequence_by
    }

    pub fn store(&self) -> &Arc<DimensionStore> {
        &self.store
    }

    /// Turn records into change events, assigning arrival ordinals in order.
    ///
    /// Records without a complete key or with a null sequence value are
    /// rejected.
    pub fn events(&mut self, records: Vec<Record>) -> (Vec<ChangeEvent>, Vec<RejectedEvent>) {
        let mut events = Vec::with_capacity(records.len());
        let mut rejected = Vec::new();

        for row in records {
            let Some(key) = row.key(&self.keys) else {
                rejected.push(RejectedEvent {
                    reason: format!("missing natural key ({})", self.keys.join(", ")),
                    row,
                });
                continue;
            };
            let sequence = row.value(&self.sequence_by).clone();
            if sequence.is_null() {
                rejected.push(RejectedEvent {
                    reason: format!("missing sequence value ({})", self.sequence_by),
                    row,
                });
                continue;
            }

            let arrival = self.next_arrival;
            self.next_arrival += 1;
            events.push(ChangeEvent {
                key,
                sequence,
                arrival,
                row,
            });
        }

        (events, rejected)
    }

    /// Compute the upserts a batch of events produces.
    ///
    /// Events are partitioned by key hash so every key is reduced by exactly
    /// one task, and partitions are reduced concurrently on the blocking pool.
    pub async fn plan(&self, events: Vec<ChangeEvent>) -> Result<MergePlan, JoinError> {
        let mut partitions: Vec<Vec<ChangeEvent>> = vec![Vec::new(); self.parallelism];
        for event in events {
            let index = partition_for(&event.key, self.parallelism);
            partitions[index].push(event);
        }

        let mut tasks = JoinSet::new();
        for partition in partitions.into_iter().filter(|p| !p.is_empty()) {
            let store = self.store.clone();
            tasks.spawn_blocking(move || reduce_partition(&store, partition));
        }

        let mut plan = MergePlan::default();
        while let Some(result) = tasks.join_next().await {
            let (upserts, stats) = result?;
            plan.upserts.extend(upserts);
            plan.stats.add(stats);
        }
        plan.upserts.sort_by(|a, b| a.0.cmp(&b.0));

        self.emit_stats(&plan.stats);
        Ok(plan)
    }

    /// Install planned upserts. Call only after they were committed.
    pub fn apply(&self, upserts: Vec<(RowKey, DimensionEntry)>) {
        for (key, entry) in upserts {
            self.store.insert(key, entry);
        }
        emit!(DimensionRows {
            count: self.store.len(),
            target: self.name.clone(),
        });
    }

    /// Plan and apply in one step, for callers without a commit in between.
    pub async fn merge(&mut self, records: Vec<Record>) -> Result<MergeStats, JoinError> {
        let (events, rejected) = self.events(records);
        let mut plan = self.plan(events).await?;
        plan.stats.rejected = rejected.len();
        let stats = plan.stats;
        self.apply(plan.upserts);
        Ok(stats)
    }

    /// Rebuild the store from committed rows.
    ///
    /// Restored rows get arrival 0: any event read after a restart arrived
    /// later than everything already committed.
    pub fn restore(&self, rows: impl IntoIterator<Item = (RowKey, Record)>) {
        self.store.clear();
        for (key, row) in rows {
            let sequence = row.value(&self.sequence_by).clone();
            self.store.insert(
                key,
                DimensionEntry {
                    row,
                    sequence,
                    arrival: 0,
                },
            );
        }
        emit!(DimensionRows {
            count: self.store.len(),
            target: self.name.clone(),
        });
    }

    fn emit_stats(&self, stats: &MergeStats) {
        for (count, outcome) in [
            (stats.applied, MergeOutcome::Applied),
            (stats.superseded, MergeOutcome::Superseded),
            (stats.stale, MergeOutcome::Stale),
            (stats.unchanged, MergeOutcome::Unchanged),
        ] {
            emit!(CdcEvents {
                count: count as u64,
                outcome,
                target: self.name.clone(),
            });
        }
    }
}

fn partition_for(key: &RowKey, partitions: usize) -> usize {
    let mut hasher = DefaultHasher::new();
    key.hash(&mut hasher);
    (hasher.finish() % partitions as u64) as usize
}

/// Reduce one partition to its winning upserts.
fn reduce_partition(
    store: &DimensionStore,
    events: Vec<ChangeEvent>,
) -> (Vec<(RowKey, DimensionEntry)>, MergeStats) {
    let mut stats = MergeStats::default();
    let mut winners: HashMap<RowKey, ChangeEvent> = HashMap::new();

    for event in events {
        let stale = store.get(&event.key).is_some_and(|current| {
            current.cmp_position(&event.sequence, event.arrival) == Ordering::Greater
        });
        if stale {
            stats.stale += 1;
            continue;
        }

        match winners.get_mut(&event.key) {
            Some(winner) => {
                // One of the two loses either way.
                stats.superseded += 1;
                if event.cmp_position(winner) != Ordering::Less {
                    *winner = event;
                }
            }
            None => {
                winners.insert(event.key.clone(), event);
            }
        }
    }

    let mut upserts = Vec::with_capacity(winners.len());
    for (key, winner) in winners {
        let unchanged = store
            .get(&key)
            .is_some_and(|current| current.sequence == winner.sequence && current.row == winner.row);
        if unchanged {
            stats.unchanged += 1;
            continue;
        }
        stats.applied += 1;
        upserts.push((
            key,
            DimensionEntry {
                row: winner.row,
                sequence: winner.sequence,
                arrival: winner.arrival,
            },
        ));
    }

    (upserts, stats)
}
