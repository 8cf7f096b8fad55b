//! Shared resources handed to every stage.

use indexmap::IndexMap;
use snafu::prelude::*;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

use crate::dlq::{DeadLetterQueue, FailureTracker};
use crate::error::{PipelineError, TableNotFoundSnafu};
use crate::table::ConformedTableRef;

/// Named tables plus process-wide settings.
///
/// Stages never talk to each other directly; everything they share goes
/// through the tables held here.
#[derive(Clone)]
pub struct PipelineContext {
    tables: IndexMap<String, ConformedTableRef>,
    dlq: Option<Arc<DeadLetterQueue>>,
    /// Maximum DLQ records per stage before it stops (0 = unlimited).
    pub max_failures: usize,
    /// Partitions reduced concurrently per CDC batch.
    pub parallelism: usize,
    /// Maximum jitter in seconds added to poll intervals.
    pub poll_jitter_secs: u64,
    pub shutdown: CancellationToken,
}

impl PipelineContext {
    pub fn new(
        tables: IndexMap<String, ConformedTableRef>,
        dlq: Option<Arc<DeadLetterQueue>>,
        max_failures: usize,
        parallelism: usize,
        poll_jitter_secs: u64,
        shutdown: CancellationToken,
    ) -> Self {
        Self {
            tables,
            dlq,
            max_failures,
            parallelism,
            poll_jitter_secs,
            shutdown,
        }
    }

    pub fn table(&self, name: &str) -> Result<ConformedTableRef, PipelineError> {
        self.tables
            .get(name)
            .cloned()
            .context(TableNotFoundSnafu { name })
    }

    pub fn tables(&self) -> impl Iterator<Item = &ConformedTableRef> {
        self.tables.values()
    }

    pub fn dlq(&self) -> Option<&Arc<DeadLetterQueue>> {
        self.dlq.as_ref()
    }

    /// A failure tracker for one stage, sharing the process DLQ.
    pub fn failure_tracker(&self, stage: &str) -> FailureTracker {
        FailureTracker::new(self.max_failures, self.dlq.clone(), stage)
    }
}
