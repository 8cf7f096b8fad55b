//! Checkpoint state serialization.
//!
//! A checkpoint records how far a stage got through its input. It is
//! embedded in the same commit entry as the stage's output, so the two can
//! never disagree after a crash.

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};

use crate::source::SourceOffsets;
use crate::value::RowKey;

/// Current checkpoint format version.
pub const CHECKPOINT_SCHEMA_VERSION: u32 = 1;

/// Input progress of one stage.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum StageProgress {
    /// Raw-zone file offsets of an entity stage.
    Source { offsets: SourceOffsets },
    /// Next change-stream offset per input table of a join stage.
    Join {
        inputs: IndexMap<String, usize>,
        /// Facts kept without an output row under the drop miss policy.
        #[serde(default, skip_serializing_if = "Vec::is_empty")]
        unmatched: Vec<RowKey>,
    },
}

/// Complete checkpoint state for recovery.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CheckpointState {
    pub schema_version: u32,
    /// Name of the stage that owns this checkpoint.
    pub stage: String,
    pub progress: StageProgress,
}

impl CheckpointState {
    pub fn new(stage: impl Into<String>, progress: StageProgress) -> Self {
        Self {
            schema_version: CHECKPOINT_SCHEMA_VERSION,
            stage: stage.into(),
            progress,
        }
    }

    pub fn source_offsets(&self) -> Option<&SourceOffsets> {
        match &self.progress {
            StageProgress::Source { offsets } => Some(offsets),
            StageProgress::Join { .. } => None,
        }
    }

    pub fn join_inputs(&self) -> Option<&IndexMap<String, usize>> {
        match &self.progress {
            StageProgress::Join { inputs, .. } => Some(inputs),
            StageProgress::Source { .. } => None,
        }
    }
}
