//! Entity stage: raw source to conformed table.
//!
//! Each batch is read, validated and either appended or CDC-merged, then
//! committed together with the source offsets it ends at. The CDC store is
//! only updated after the commit succeeds, so a batch that fails or is
//! cancelled before committing leaves no trace and is read again.

use async_trait::async_trait;
use chrono::Utc;
use snafu::prelude::*;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info};

use super::PipelineContext;
use crate::cdc::{CdcMerge, MergePlan, RejectedEvent};
use crate::checkpoint::{CheckpointCoordinator, StageProgress};
use crate::config::{EntityConfig, MergeConfig, StageKey};
use crate::dlq::{FailedRecord, FailureTracker};
use crate::error::{ConfigSnafu, MergeTaskSnafu, PipelineError, PipelineSourceSnafu, PipelineTableSnafu};
use crate::polling::{IterationResult, PollingProcessor};
use crate::source::{MalformedRecord, NdjsonReader, RawSource, SourceBatch, SourceOffsets};
use crate::table::{Change, ConformedTableRef};
use crate::validate::Validator;

/// One entity pipeline.
pub struct EntityStage {
    key: StageKey,
    source: RawSource,
    validator: Validator,
    /// `None` for append tables.
    merge: Option<CdcMerge>,
    table: ConformedTableRef,
    checkpoint: CheckpointCoordinator,
    failures: FailureTracker,
    batch_size: usize,
    poll_interval: Duration,
}

impl EntityStage {
    pub fn new(
        key: StageKey,
        config: &EntityConfig,
        context: &PipelineContext,
    ) -> Result<Self, PipelineError> {
        let table = context.table(&config.table_name(&key))?;
        let schema = (!config.source.schema.is_empty()).then(|| Arc::new(config.source.schema.clone()));
        let reader = NdjsonReader::new(schema, config.source.compression);
        let source = RawSource::new(
            key.id(),
            &config.source.path,
            config.source.storage_options.clone(),
            reader,
        );

        let rules = config.rule_set(&key).context(ConfigSnafu)?;
        let validator = Validator::new(
            key.id(),
            config.casts.clone(),
            config.processing_time_column.clone(),
            rules,
        );

        let merge = match &config.merge {
            MergeConfig::Append => None,
            MergeConfig::Cdc { keys, sequence_by } => Some(CdcMerge::new(
                key.id(),
                keys.clone(),
                sequence_by.clone(),
                context.parallelism,
            )),
        };

        Ok(Self {
            checkpoint: CheckpointCoordinator::new(
                key.id(),
                StageProgress::Source {
                    offsets: SourceOffsets::new(),
                },
            ),
            failures: context.failure_tracker(key.id()),
            key,
            source,
            validator,
            merge,
            table,
            batch_size: config.source.batch_size,
            poll_interval: config.source.poll_interval(),
        })
    }

    pub fn key(&self) -> &StageKey {
        &self.key
    }

    pub fn poll_interval(&self) -> Duration {
        self.poll_interval
    }

    async fn offsets(&self) -> SourceOffsets {
        match self.checkpoint.progress().await {
            StageProgress::Source { offsets } => offsets,
            StageProgress::Join { .. } => SourceOffsets::new(),
        }
    }

    /// Restore offsets and the CDC store from the output table.
    async fn restore(&mut self) -> Result<(), PipelineError> {
        let restored = self
            .checkpoint
            .restore_from_table(&self.table)
            .await
            .context(PipelineTableSnafu)?;

        if let Some(merge) = &self.merge {
            merge.restore(self.table.keyed_snapshot().await);
        }

        if restored {
            let version = self.table.version().await;
            let rows = self.table.len().await;
            info!(
                target = %self.key,
                version,
                rows,
                "Resuming from checkpoint"
            );
        } else {
            info!(target = %self.key, source = %self.source.url(), "Cold start, reading from the beginning");
        }
        Ok(())
    }

    /// Send rejected records to the DLQ. Fails once max_failures is reached.
    async fn record_failures(
        &mut self,
        malformed: Vec<MalformedRecord>,
        rejected: Vec<RejectedEvent>,
    ) -> Result<(), PipelineError> {
        for malformed in malformed {
            self.failures
                .record_failure(FailedRecord::decode(
                    self.key.id(),
                    malformed.file,
                    malformed.line,
                    malformed.error,
                    malformed.raw,
                ))
                .await?;
        }
        for event in rejected {
            self.failures
                .record_failure(FailedRecord::merge(
                    self.key.id(),
                    event.reason,
                    event.row.to_json(),
                ))
                .await?;
        }
        Ok(())
    }
}

#[async_trait]
impl PollingProcessor for EntityStage {
    type State = SourceBatch;
    type Error = PipelineError;

    async fn prepare(&mut self, cold_start: bool) -> Result<Option<SourceBatch>, PipelineError> {
        if cold_start {
            self.restore().await?;
        }

        let offsets = self.offsets().await;
        let batch = self
            .source
            .poll_batch(&offsets, self.batch_size)
            .await
            .context(PipelineSourceSnafu {
                stage: self.key.id(),
            })?;

        // Offsets can move without records, e.g. past an empty file.
        if batch.is_empty() && batch.offsets == offsets {
            return Ok(None);
        }
        Ok(Some(batch))
    }

    async fn process(&mut self, batch: SourceBatch) -> Result<IterationResult, PipelineError> {
        let SourceBatch {
            records,
            malformed,
            offsets,
            ..
        } = batch;
        let read = records.len();

        let validated = self.validator.validate(records, Utc::now());
        let valid = validated.records.len();

        let (changes, plan, rejected) = match &mut self.merge {
            None => (
                validated
                    .records
                    .into_iter()
                    .map(Change::append)
                    .collect::<Vec<_>>(),
                None,
                Vec::new(),
            ),
            Some(merge) => {
                let (events, rejected) = merge.events(validated.records);
                let mut plan: MergePlan = merge.plan(events).await.context(MergeTaskSnafu {
                    stage: self.key.id(),
                })?;
                plan.stats.rejected = rejected.len();
                let changes = plan
                    .upserts
                    .iter()
                    .map(|(key, entry)| Change::upsert(key.clone(), entry.row.clone()))
                    .collect();
                (changes, Some(plan), rejected)
            }
        };

        let progress = StageProgress::Source { offsets };
        let written = changes.len();
        let version = self
            .table
            .commit(changes, Some(self.checkpoint.checkpoint_for(progress.clone())))
            .await
            .context(PipelineTableSnafu)?;

        if let (Some(merge), Some(plan)) = (&self.merge, plan) {
            debug!(target = %self.key, stats = ?plan.stats, "Merged change events");
            merge.apply(plan.upserts);
        }
        self.checkpoint
            .mark_checkpoint_committed(version, progress)
            .await;

        info!(
            target = %self.key,
            version,
            read,
            valid,
            dropped = validated.dropped,
            malformed = malformed.len(),
            rejected = rejected.len(),
            written,
            "Committed batch"
        );

        self.record_failures(malformed, rejected).await?;
        Ok(IterationResult::ProcessedItems)
    }
}
