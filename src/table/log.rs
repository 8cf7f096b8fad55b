//! Commit log entries and table snapshots.
//!
//! Each commit is one immutable JSON object at
//! `<table>/_log/<version:020>.json`. Zero-padded versions make the
//! lexicographic listing order the commit order. Every few commits the
//! whole table is also written to `<table>/_snapshot/<version:020>.json`
//! so recovery only has to read the commits after it.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::checkpoint::CheckpointState;
use crate::value::{Record, RowKey};

/// Kind of change in a table's change stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChangeOp {
    Append,
    Upsert,
    Delete,
}

impl ChangeOp {
    pub fn as_str(&self) -> &'static str {
        match self {
            ChangeOp::Append => "append",
            ChangeOp::Upsert => "upsert",
            ChangeOp::Delete => "delete",
        }
    }
}

/// A change handed to [`super::ConformedTable::commit`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Change {
    pub op: ChangeOp,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub key: Option<RowKey>,
    pub row: Record,
}

impl Change {
    pub fn append(row: Record) -> Self {
        Self {
            op: ChangeOp::Append,
            key: None,
            row,
        }
    }

    pub fn upsert(key: RowKey, row: Record) -> Self {
        Self {
            op: ChangeOp::Upsert,
            key: Some(key),
            row,
        }
    }

    /// Retract `key`. `row` is the last row emitted for it.
    pub fn delete(key: RowKey, row: Record) -> Self {
        Self {
            op: ChangeOp::Delete,
            key: Some(key),
            row,
        }
    }
}

/// A committed change as seen by change-stream readers.
#[derive(Debug, Clone, PartialEq)]
pub struct TableChange {
    /// Position in the change stream, starting at 0.
    pub offset: usize,
    /// Table version that produced the change.
    pub version: i64,
    pub op: ChangeOp,
    pub key: Option<RowKey>,
    pub row: Record,
}

/// One commit log object.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CommitEntry {
    pub version: i64,
    pub committed_at: DateTime<Utc>,
    pub changes: Vec<Change>,
    /// Progress of the producing stage at the time of this commit.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub checkpoint: Option<CheckpointState>,
}

/// Materialized table contents as of one version.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TableSnapshot {
    pub version: i64,
    /// Change-stream offset one past the last change included.
    pub end_offset: usize,
    pub rows: Vec<SnapshotRow>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub checkpoint: Option<CheckpointState>,
}

/// One row of a [`TableSnapshot`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SnapshotRow {
    /// Offset of the change that wrote the row.
    pub offset: usize,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub key: Option<RowKey>,
    pub row: Record,
}

/// Path of the commit log directory of `table`.
pub fn log_dir(table: &str) -> String {
    format!("{table}/_log")
}

/// Path of the commit object for `version`.
pub fn log_path(table: &str, version: i64) -> String {
    format!("{table}/_log/{version:020}.json")
}

pub fn snapshot_dir(table: &str) -> String {
    format!("{table}/_snapshot")
}

pub fn snapshot_path(table: &str, version: i64) -> String {
    format!("{table}/_snapshot/{version:020}.json")
}

/// Version encoded in a log or snapshot object path.
pub fn path_version(path: &str) -> Option<i64> {
    let name = path.rsplit('/').next()?;
    name.strip_suffix(".json")?.parse().ok()
}
