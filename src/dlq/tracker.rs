//! Failure tracking with DLQ integration.
//!
//! Each stage owns one tracker. It counts rejected records, forwards them
//! to the shared DLQ and stops the stage once `max_failures` is reached.

use std::sync::Arc;
use tracing::error;

use crate::emit;
use crate::error::{MaxFailuresExceededSnafu, PipelineError};
use crate::metrics::events::RecordFailed;

use super::{DeadLetterQueue, FailedRecord};

/// Tracks failures and handles DLQ recording with max_failures enforcement.
pub struct FailureTracker {
    count: usize,
    max_failures: usize,
    dlq: Option<Arc<DeadLetterQueue>>,
    target: String,
}

impl FailureTracker {
    /// Create a new failure tracker. A `max_failures` of 0 means unlimited.
    pub fn new(
        max_failures: usize,
        dlq: Option<Arc<DeadLetterQueue>>,
        target: impl Into<String>,
    ) -> Self {
        Self {
            count: 0,
            max_failures,
            dlq,
            target: target.into(),
        }
    }

    /// Record a failure, emit metrics and check the max_failures limit.
    ///
    /// Returns `Err` once the limit is reached, after flushing the DLQ.
    pub async fn record_failure(&mut self, failed: FailedRecord) -> Result<(), PipelineError> {
        self.count += 1;
        emit!(RecordFailed {
            stage: failed.stage,
            target: self.target.clone(),
        });

        if let Some(dlq) = &self.dlq {
            dlq.record_failure(failed).await;
        }

        if self.max_failures > 0 && self.count >= self.max_failures {
            error!(
                target = %self.target,
                count = self.count,
                "Max failures reached, stopping stage"
            );
            self.finalize_dlq().await;
            return MaxFailuresExceededSnafu { count: self.count }.fail();
        }

        Ok(())
    }

    /// Flush the DLQ, logging any errors.
    pub async fn finalize_dlq(&self) {
        if let Some(dlq) = &self.dlq {
            if let Err(e) = dlq.finalize().await {
                error!(target = %self.target, error = %e, "Failed to finalize DLQ");
            }
        }
    }

    pub fn count(&self) -> usize {
        self.count
    }
}
