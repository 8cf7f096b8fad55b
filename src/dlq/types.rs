//! DLQ types for failure tracking.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::metrics::events::FailureStage;

/// One rejected record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FailedRecord {
    /// Stage that rejected the record.
    pub target: String,
    /// Raw-zone file the record came from, when known.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub file: Option<String>,
    /// 1-based line number within `file`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub line: Option<usize>,
    pub error: String,
    pub stage: FailureStage,
    /// The offending raw line or decoded row.
    pub record: serde_json::Value,
    pub timestamp: DateTime<Utc>,
}

impl FailedRecord {
    /// A raw line that did not decode.
    pub fn decode(
        target: impl Into<String>,
        file: impl Into<String>,
        line: usize,
        error: impl Into<String>,
        raw: impl Into<String>,
    ) -> Self {
        Self {
            target: target.into(),
            file: Some(file.into()),
            line: Some(line),
            error: error.into(),
            stage: FailureStage::Decode,
            record: serde_json::Value::String(raw.into()),
            timestamp: Utc::now(),
        }
    }

    /// A decoded row that could not be merged.
    pub fn merge(target: impl Into<String>, error: impl Into<String>, row: serde_json::Value) -> Self {
        Self {
            target: target.into(),
            file: None,
            line: None,
            error: error.into(),
            stage: FailureStage::Merge,
            record: row,
            timestamp: Utc::now(),
        }
    }
}

/// Failure counts by stage.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FailureStats {
    pub decode: usize,
    pub merge: usize,
}

impl FailureStats {
    pub fn increment(&mut self, stage: FailureStage) {
        match stage {
            FailureStage::Decode => self.decode += 1,
            FailureStage::Merge => self.merge += 1,
        }
    }

    pub fn total(&self) -> usize {
        self.decode + self.merge
    }
}
