//! Checkpoint coordination for exactly-once observable state.
//!
//! Checkpoints are never written on their own. A stage captures its
//! progress, hands it to [`ConformedTable::commit`](crate::table::ConformedTable::commit)
//! together with the batch output, and only then marks it committed. On
//! restart the latest checkpoint is read back from the table's commit log.

pub mod state;

pub use state::{CHECKPOINT_SCHEMA_VERSION, CheckpointState, StageProgress};

use std::sync::Arc;
use std::time::Instant;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::emit;
use crate::error::TableError;
use crate::metrics::events::CheckpointCommitted;
use crate::table::ConformedTable;

struct CoordinatorInner {
    progress: StageProgress,
    committed_version: i64,
    last_commit: Instant,
}

/// Holds one stage's progress between commits.
pub struct CheckpointCoordinator {
    stage: String,
    inner: Arc<Mutex<CoordinatorInner>>,
}

impl CheckpointCoordinator {
    pub fn new(stage: impl Into<String>, initial: StageProgress) -> Self {
        Self {
            stage: stage.into(),
            inner: Arc::new(Mutex::new(CoordinatorInner {
                progress: initial,
                committed_version: -1,
                last_commit: Instant::now(),
            })),
        }
    }

    pub fn stage(&self) -> &str {
        &self.stage
    }

    /// Restore progress from a recovered checkpoint.
    ///
    /// Checkpoints written by another stage or in an unknown format are
    /// ignored and leave the current progress untouched.
    pub async fn restore_from_state(&self, checkpoint: CheckpointState) -> bool {
        if checkpoint.stage != self.stage {
            warn!(
                target = %self.stage,
                owner = %checkpoint.stage,
                "Ignoring checkpoint owned by another stage"
            );
            return false;
        }
        if checkpoint.schema_version != CHECKPOINT_SCHEMA_VERSION {
            warn!(
                target = %self.stage,
                schema_version = checkpoint.schema_version,
                "Ignoring checkpoint with unsupported schema version"
            );
            return false;
        }

        let mut inner = self.inner.lock().await;
        inner.progress = checkpoint.progress;
        info!(target = %self.stage, "Restored checkpoint state");
        true
    }

    /// Recover the output table and restore from its latest checkpoint.
    ///
    /// Returns whether a checkpoint was restored.
    pub async fn restore_from_table(&self, table: &ConformedTable) -> Result<bool, TableError> {
        let checkpoint = table.recover().await?;
        {
            let mut inner = self.inner.lock().await;
            inner.committed_version = table.version().await;
        }
        match checkpoint {
            Some(checkpoint) => Ok(self.restore_from_state(checkpoint).await),
            None => Ok(false),
        }
    }

    /// Current progress.
    pub async fn progress(&self) -> StageProgress {
        self.inner.lock().await.progress.clone()
    }

    /// Checkpoint to commit together with a batch ending at `progress`.
    pub fn checkpoint_for(&self, progress: StageProgress) -> CheckpointState {
        CheckpointState::new(self.stage.clone(), progress)
    }

    /// Advance to `progress` once the commit carrying it succeeded.
    pub async fn mark_checkpoint_committed(&self, version: i64, progress: StageProgress) {
        let mut inner = self.inner.lock().await;
        let since_last = inner.last_commit.elapsed();
        inner.progress = progress;
        inner.committed_version = version;
        inner.last_commit = Instant::now();
        emit!(CheckpointCommitted {
            target: self.stage.clone(),
        });
        debug!(
            target = %self.stage,
            version,
            since_last_ms = since_last.as_millis() as u64,
            "Checkpoint committed"
        );
    }

    /// Version of the last commit that carried this stage's checkpoint.
    pub async fn committed_version(&self) -> i64 {
        self.inner.lock().await.committed_version
    }
}
