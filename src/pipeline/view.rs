//! View stage: incremental join of conformed tables.
//!
//! The stage follows the change stream of its fact table and of each
//! dimension table with its own cursors. A batch reads up to `batch_size`
//! changes per input, joins them (dimensions first), and commits the
//! resulting upserts and retractions with the cursor offsets they end at.
//! Cursors move only after the commit succeeds.
//!
//! On start the join is rebuilt from the current rows of every input, the
//! cursors are placed at the end of each input, and whatever differs from
//! the rows already in the output is committed as one batch.

use async_trait::async_trait;
use indexmap::IndexMap;
use snafu::prelude::*;
use std::time::Duration;
use tracing::{debug, info};

use super::PipelineContext;
use crate::checkpoint::{CheckpointCoordinator, StageProgress};
use crate::config::{StageKey, ViewConfig};
use crate::emit;
use crate::error::{PipelineError, PipelineTableSnafu};
use crate::join::{JoinDimension, JoinInput, JoinSpec, JoinStats, StreamJoin, coalesce};
use crate::metrics::events::{JoinMissesDropped, JoinPendingFacts, JoinedRowsEmitted};
use crate::polling::{IterationResult, PollingProcessor};
use crate::table::{Change, ConformedTableRef, TableChange, TableCursor};

/// Changes read from every input in one batch.
pub struct ViewBatch {
    fact: Vec<TableChange>,
    dimensions: Vec<Vec<TableChange>>,
}

impl ViewBatch {
    fn is_empty(&self) -> bool {
        self.fact.is_empty() && self.dimensions.iter().all(Vec::is_empty)
    }
}

/// One view pipeline.
pub struct ViewStage {
    key: StageKey,
    join: StreamJoin,
    fact: TableCursor,
    dimensions: Vec<TableCursor>,
    output: ConformedTableRef,
    checkpoint: CheckpointCoordinator,
    batch_size: usize,
    poll_interval: Duration,
}

impl ViewStage {
    pub fn new(
        key: StageKey,
        config: &ViewConfig,
        context: &PipelineContext,
    ) -> Result<Self, PipelineError> {
        let output = context.table(&config.table_name(&key))?;
        let fact = context.table(&config.fact.table)?.cursor();
        let dimensions = config
            .dimensions
            .iter()
            .map(|d| Ok(context.table(&d.table)?.cursor()))
            .collect::<Result<Vec<_>, PipelineError>>()?;

        let spec = JoinSpec {
            fact_key: config.fact.key.clone(),
            dimensions: config
                .dimensions
                .iter()
                .map(|d| JoinDimension {
                    table: d.table.clone(),
                    on: d.on.clone(),
                })
                .collect(),
            select: config.select.clone(),
            join_miss: config.join_miss,
        };

        Ok(Self {
            checkpoint: CheckpointCoordinator::new(
                key.id(),
                StageProgress::Join {
                    inputs: IndexMap::new(),
                    unmatched: Vec::new(),
                },
            ),
            join: StreamJoin::new(spec),
            key,
            fact,
            dimensions,
            output,
            batch_size: config.batch_size.max(1),
            poll_interval: config.poll_interval(),
        })
    }

    pub fn key(&self) -> &StageKey {
        &self.key
    }

    pub fn poll_interval(&self) -> Duration {
        self.poll_interval
    }

    /// Rebuild the join state from the inputs' current rows and commit
    /// the difference to the output.
    async fn restore(&mut self) -> Result<(), PipelineError> {
        self.checkpoint
            .restore_from_table(&self.output)
            .await
            .context(PipelineTableSnafu)?;
        let restored = self.checkpoint.progress().await;
        let (offsets, unmatched) = match &restored {
            StageProgress::Join { inputs, unmatched } => (inputs.clone(), unmatched.clone()),
            StageProgress::Source { .. } => (IndexMap::new(), Vec::new()),
        };

        self.join.restore_emitted(self.output.keyed_snapshot().await);

        // Dimensions before facts, so loaded facts find their rows.
        let mut loaded = 0;
        for (i, cursor) in self.dimensions.iter_mut().enumerate() {
            let (changes, end) = cursor.table().current_changes().await;
            loaded += changes.len();
            self.join.apply(JoinInput::Dimension(i), &changes, true);
            cursor.seek(end);
        }
        let (changes, end) = self.fact.table().current_changes().await;
        loaded += changes.len();
        self.join.apply(JoinInput::Fact, &changes, true);
        self.fact.seek(end);

        let fresh_from = offsets
            .get(self.fact.table().name())
            .copied()
            .unwrap_or(0);
        let (out, stats) = self.join.finish_replay(&unmatched, fresh_from);
        let changed = out.len();
        let progress = self.progress(self.positions());
        if !out.is_empty() || progress != restored {
            self.commit(out, progress, &stats).await?;
        }

        info!(
            target = %self.key,
            loaded,
            changed,
            facts = self.join.fact_count(),
            pending = self.join.pending(),
            "Join state restored"
        );
        emit!(JoinPendingFacts {
            count: self.join.pending(),
            target: self.key.to_string(),
        });
        Ok(())
    }

    /// Current position of every input cursor.
    fn positions(&self) -> IndexMap<String, usize> {
        std::iter::once(&self.fact)
            .chain(&self.dimensions)
            .map(|cursor| (cursor.table().name().to_string(), cursor.position()))
            .collect()
    }

    fn progress(&self, inputs: IndexMap<String, usize>) -> StageProgress {
        StageProgress::Join {
            inputs,
            unmatched: self.join.unmatched(),
        }
    }

    /// Commit output changes with the checkpoint they complete. Returns
    /// the version and the number of rows written.
    async fn commit(
        &self,
        out: Vec<Change>,
        progress: StageProgress,
        stats: &JoinStats,
    ) -> Result<(i64, usize), PipelineError> {
        let changes = coalesce(out);
        let written = changes.len();
        let version = self
            .output
            .commit(changes, Some(self.checkpoint.checkpoint_for(progress.clone())))
            .await
            .context(PipelineTableSnafu)?;
        self.checkpoint
            .mark_checkpoint_committed(version, progress)
            .await;
        self.emit_stats(stats);
        Ok((version, written))
    }

    fn emit_stats(&self, stats: &JoinStats) {
        emit!(JoinedRowsEmitted {
            upserts: stats.upserts as u64,
            deletes: stats.deletes as u64,
            target: self.key.to_string(),
        });
        if stats.dropped > 0 {
            emit!(JoinMissesDropped {
                count: stats.dropped as u64,
                target: self.key.to_string(),
            });
        }
        emit!(JoinPendingFacts {
            count: self.join.pending(),
            target: self.key.to_string(),
        });
    }
}

#[async_trait]
impl PollingProcessor for ViewStage {
    type State = ViewBatch;
    type Error = PipelineError;

    async fn prepare(&mut self, cold_start: bool) -> Result<Option<ViewBatch>, PipelineError> {
        if cold_start {
            self.restore().await?;
        }

        let fact = self.fact.peek(self.batch_size).await;
        let mut dimensions = Vec::with_capacity(self.dimensions.len());
        for cursor in &self.dimensions {
            dimensions.push(cursor.peek(self.batch_size).await);
        }

        let batch = ViewBatch { fact, dimensions };
        if batch.is_empty() {
            return Ok(None);
        }
        Ok(Some(batch))
    }

    async fn process(&mut self, batch: ViewBatch) -> Result<IterationResult, PipelineError> {
        let mut out: Vec<Change> = Vec::new();
        let mut stats = JoinStats::default();
        // Dimensions first, so facts in the same batch see their rows.
        let feeds = batch
            .dimensions
            .iter()
            .enumerate()
            .map(|(i, changes)| (JoinInput::Dimension(i), changes))
            .chain(std::iter::once((JoinInput::Fact, &batch.fact)));
        for (input, changes) in feeds {
            let (emitted, s) = self.join.apply(input, changes, false);
            out.extend(emitted);
            stats += s;
        }

        // Offsets one past the last change read from each input.
        let next = |cursor: &TableCursor, changes: &[TableChange]| {
            changes
                .last()
                .map_or(cursor.position(), |change| change.offset + 1)
        };
        let mut inputs = IndexMap::new();
        inputs.insert(
            self.fact.table().name().to_string(),
            next(&self.fact, &batch.fact),
        );
        for (cursor, changes) in self.dimensions.iter().zip(&batch.dimensions) {
            inputs.insert(cursor.table().name().to_string(), next(cursor, changes));
        }

        let progress = self.progress(inputs.clone());
        let (version, written) = self.commit(out, progress, &stats).await?;

        self.fact.seek(inputs[self.fact.table().name()]);
        for cursor in &mut self.dimensions {
            let position = inputs[cursor.table().name()];
            cursor.seek(position);
        }

        debug!(target = %self.key, ?inputs, "Advanced join inputs");
        info!(
            target = %self.key,
            version,
            fact_changes = batch.fact.len(),
            dimension_changes = batch.dimensions.iter().map(Vec::len).sum::<usize>(),
            written,
            pending = self.join.pending(),
            "Committed join batch"
        );
        Ok(IterationResult::ProcessedItems)
    }
}
