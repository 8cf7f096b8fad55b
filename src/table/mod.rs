//! Conformed tables.
//!
//! A conformed table is the persisted output of a stage. Every commit
//! appends one immutable entry to the table's log, carrying both the
//! changes and the producing stage's checkpoint, written with
//! put-if-absent. The in-memory view (current rows and the change stream)
//! only advances after that write succeeded.
//!
//! Readers either take a point-in-time [`ConformedTable::snapshot`] or
//! follow the change stream through independent [`TableCursor`]s. Changes
//! every registered cursor has moved past are dropped from memory, and
//! every `snapshot_interval` commits the current rows are written as a
//! snapshot object that recovery starts from.

mod cursor;
mod log;

pub use cursor::TableCursor;
pub use log::{
    Change, ChangeOp, CommitEntry, SnapshotRow, TableChange, TableSnapshot, log_dir, log_path,
    path_version, snapshot_dir, snapshot_path,
};

use bytes::Bytes;
use chrono::Utc;
use dashmap::DashMap;
use snafu::prelude::*;
use std::collections::{BTreeMap, VecDeque};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;
use tokio::sync::{Mutex, RwLock, watch};
use tracing::{debug, info, warn};

use crate::checkpoint::CheckpointState;
use crate::emit;
use crate::error::{
    CommitConflictSnafu, CommitWriteSnafu, LogDecodeSnafu, LogEncodeSnafu, LogListSnafu,
    LogReadSnafu, MissingRowKeySnafu, SnapshotDecodeSnafu, SnapshotEncodeSnafu,
    SnapshotListSnafu, SnapshotReadSnafu, SnapshotWriteSnafu, TableError, UnsupportedChangeSnafu,
};
use crate::metrics::events::{CommitDuration, RetainedChanges, RowsCommitted, TableVersion};
use crate::storage::StorageProviderRef;
use crate::value::{Record, RowKey};

/// A shared table handle.
pub type ConformedTableRef = Arc<ConformedTable>;

/// Commits between two snapshots unless configured otherwise.
pub const DEFAULT_SNAPSHOT_INTERVAL: u64 = 100;

/// How a table materializes its changes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TableMode {
    /// Every change is a new row.
    Append,
    /// One row per key; upserts replace and deletes remove.
    Upsert { keys: Vec<String> },
}

impl TableMode {
    pub fn keys(&self) -> Option<&[String]> {
        match self {
            TableMode::Append => None,
            TableMode::Upsert { keys } => Some(keys),
        }
    }
}

#[derive(Debug)]
struct TableState {
    version: i64,
    appended: Vec<Record>,
    /// Current row per key with the offset of the change that wrote it.
    keyed: BTreeMap<RowKey, (usize, Record)>,
    /// Offset of the first change still held in `changes`.
    base: usize,
    changes: VecDeque<TableChange>,
    checkpoint: Option<CheckpointState>,
    recovered: bool,
}

impl TableState {
    fn new() -> Self {
        Self {
            version: -1,
            appended: Vec::new(),
            keyed: BTreeMap::new(),
            base: 0,
            changes: VecDeque::new(),
            checkpoint: None,
            recovered: false,
        }
    }

    fn from_snapshot(snapshot: TableSnapshot) -> Self {
        let mut state = Self::new();
        for row in snapshot.rows {
            match row.key {
                Some(key) => {
                    state.keyed.insert(key, (row.offset, row.row));
                }
                None => state.appended.push(row.row),
            }
        }
        state.version = snapshot.version;
        state.base = snapshot.end_offset;
        state.checkpoint = snapshot.checkpoint;
        state
    }

    fn to_snapshot(&self) -> TableSnapshot {
        let appended = self
            .appended
            .iter()
            .enumerate()
            .map(|(offset, row)| SnapshotRow {
                offset,
                key: None,
                row: row.clone(),
            });
        let keyed = self.keyed.iter().map(|(key, (offset, row))| SnapshotRow {
            offset: *offset,
            key: Some(key.clone()),
            row: row.clone(),
        });
        TableSnapshot {
            version: self.version,
            end_offset: self.end_offset(),
            rows: appended.chain(keyed).collect(),
            checkpoint: self.checkpoint.clone(),
        }
    }

    fn end_offset(&self) -> usize {
        self.base + self.changes.len()
    }

    fn apply(&mut self, entry: CommitEntry) {
        for change in entry.changes {
            let offset = self.end_offset();
            match (change.op, &change.key) {
                (ChangeOp::Append, _) => self.appended.push(change.row.clone()),
                (ChangeOp::Upsert, Some(key)) => {
                    self.keyed.insert(key.clone(), (offset, change.row.clone()));
                }
                (ChangeOp::Delete, Some(key)) => {
                    self.keyed.remove(key);
                }
                // Rejected before commit.
                (_, None) => continue,
            }
            self.changes.push_back(TableChange {
                offset,
                version: entry.version,
                op: change.op,
                key: change.key,
                row: change.row,
            });
        }
        if entry.checkpoint.is_some() {
            self.checkpoint = entry.checkpoint;
        }
        self.version = entry.version;
    }

    /// Drop held changes below `offset`.
    fn trim(&mut self, offset: usize) {
        let offset = offset.min(self.end_offset());
        while self.base < offset {
            self.changes.pop_front();
            self.base += 1;
        }
    }
}

/// A named, persisted, continuously updated table.
pub struct ConformedTable {
    name: String,
    mode: TableMode,
    storage: StorageProviderRef,
    snapshot_interval: u64,
    state: RwLock<TableState>,
    commit_lock: Mutex<()>,
    version_tx: watch::Sender<i64>,
    /// Position of every live cursor.
    readers: DashMap<u64, usize>,
    next_reader: AtomicU64,
}

impl std::fmt::Debug for ConformedTable {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConformedTable")
            .field("name", &self.name)
            .field("mode", &self.mode)
            .finish_non_exhaustive()
    }
}

impl ConformedTable {
    /// Create a handle on `name` under the output root.
    ///
    /// Call [`recover`](Self::recover) before the first commit when the
    /// table may already hold data.
    pub fn new(name: impl Into<String>, mode: TableMode, storage: StorageProviderRef) -> Self {
        let (version_tx, _) = watch::channel(-1);
        Self {
            name: name.into(),
            mode,
            storage,
            snapshot_interval: DEFAULT_SNAPSHOT_INTERVAL,
            state: RwLock::new(TableState::new()),
            commit_lock: Mutex::new(()),
            version_tx,
            readers: DashMap::new(),
            next_reader: AtomicU64::new(0),
        }
    }

    /// Write a snapshot every `interval` commits. Zero disables snapshots.
    pub fn with_snapshot_interval(mut self, interval: u64) -> Self {
        self.snapshot_interval = interval;
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn mode(&self) -> &TableMode {
        &self.mode
    }

    /// Rebuild the in-memory view from the latest snapshot and the commits
    /// after it.
    ///
    /// Returns the checkpoint of the latest commit that carried one.
    /// Calling it again after a successful recovery is a no-op.
    pub async fn recover(&self) -> Result<Option<CheckpointState>, TableError> {
        let _guard = self.commit_lock.lock().await;
        {
            let state = self.state.read().await;
            if state.recovered {
                return Ok(state.checkpoint.clone());
            }
        }

        let mut recovered = match self.load_snapshot().await {
            Ok(Some(snapshot)) => TableState::from_snapshot(snapshot),
            Ok(None) => TableState::new(),
            Err(e) => {
                warn!(table = %self.name, error = %e, "Ignoring unreadable snapshot, reading the full log");
                TableState::new()
            }
        };
        let from_version = recovered.version;

        let objects = self
            .storage
            .list(Some(&log_dir(&self.name)))
            .await
            .context(LogListSnafu { table: &self.name })?;

        let mut replayed = 0;
        for object in &objects {
            match path_version(&object.path) {
                Some(version) if version > from_version => {}
                _ => continue,
            }
            let bytes = self
                .storage
                .get(&object.path)
                .await
                .context(LogReadSnafu { path: &object.path })?;
            let entry: CommitEntry =
                serde_json::from_slice(&bytes).context(LogDecodeSnafu { path: &object.path })?;
            recovered.apply(entry);
            replayed += 1;
        }
        recovered.recovered = true;

        let checkpoint = recovered.checkpoint.clone();
        let version = recovered.version;
        *self.state.write().await = recovered;
        self.version_tx.send_replace(version);

        if version >= 0 {
            info!(
                table = %self.name,
                version,
                snapshot_version = from_version,
                commits = replayed,
                "Recovered table from commit log"
            );
            emit!(TableVersion {
                version,
                table: self.name.clone(),
            });
        }
        Ok(checkpoint)
    }

    /// Latest snapshot object, if any.
    async fn load_snapshot(&self) -> Result<Option<TableSnapshot>, TableError> {
        let objects = self
            .storage
            .list(Some(&snapshot_dir(&self.name)))
            .await
            .context(SnapshotListSnafu { table: &self.name })?;
        let Some(latest) = objects
            .iter()
            .rev()
            .find(|o| path_version(&o.path).is_some())
        else {
            return Ok(None);
        };

        let bytes = self
            .storage
            .get(&latest.path)
            .await
            .context(SnapshotReadSnafu { path: &latest.path })?;
        let snapshot =
            serde_json::from_slice(&bytes).context(SnapshotDecodeSnafu { path: &latest.path })?;
        Ok(Some(snapshot))
    }

    async fn write_snapshot(&self, snapshot: TableSnapshot) -> Result<(), TableError> {
        let path = snapshot_path(&self.name, snapshot.version);
        let bytes =
            serde_json::to_vec(&snapshot).context(SnapshotEncodeSnafu { table: &self.name })?;
        self.storage
            .put(&path, Bytes::from(bytes))
            .await
            .context(SnapshotWriteSnafu { path: &path })?;
        debug!(table = %self.name, version = snapshot.version, rows = snapshot.rows.len(), "Wrote snapshot");
        Ok(())
    }

    /// Commit changes together with the producing stage's checkpoint.
    ///
    /// Returns the new version. A commit with no changes and no checkpoint
    /// writes nothing and returns the current version.
    pub async fn commit(
        &self,
        changes: Vec<Change>,
        checkpoint: Option<CheckpointState>,
    ) -> Result<i64, TableError> {
        let _guard = self.commit_lock.lock().await;
        if changes.is_empty() && checkpoint.is_none() {
            return Ok(self.version().await);
        }
        self.check_changes(&changes)?;

        let start = Instant::now();
        let version = self.state.read().await.version + 1;
        let entry = CommitEntry {
            version,
            committed_at: Utc::now(),
            changes,
            checkpoint,
        };
        let bytes = serde_json::to_vec(&entry).context(LogEncodeSnafu { table: &self.name })?;

        if let Err(source) = self
            .storage
            .put_if_absent(&log_path(&self.name, version), Bytes::from(bytes))
            .await
        {
            if source.is_already_exists() {
                return CommitConflictSnafu {
                    table: &self.name,
                    version,
                }
                .fail();
            }
            return Err(source).context(CommitWriteSnafu {
                table: &self.name,
                version,
            });
        }

        let rows = entry.changes.len();
        let (retained, snapshot) = {
            let mut state = self.state.write().await;
            state.apply(entry);
            let low_water = self.low_water(state.end_offset());
            state.trim(low_water);
            let snapshot = (self.snapshot_interval > 0
                && version > 0
                && version as u64 % self.snapshot_interval == 0)
                .then(|| state.to_snapshot());
            (state.changes.len(), snapshot)
        };
        self.version_tx.send_replace(version);

        if let Some(snapshot) = snapshot {
            if let Err(e) = self.write_snapshot(snapshot).await {
                warn!(table = %self.name, version, error = %e, "Failed to write snapshot");
            }
        }

        emit!(RowsCommitted {
            count: rows as u64,
            table: self.name.clone(),
        });
        emit!(TableVersion {
            version,
            table: self.name.clone(),
        });
        emit!(RetainedChanges {
            count: retained,
            table: self.name.clone(),
        });
        emit!(CommitDuration {
            duration: start.elapsed(),
            table: self.name.clone(),
        });
        debug!(table = %self.name, version, rows, retained, "Committed");

        Ok(version)
    }

    fn check_changes(&self, changes: &[Change]) -> Result<(), TableError> {
        for change in changes {
            match (&self.mode, change.op) {
                (TableMode::Append, ChangeOp::Append) => {}
                (TableMode::Upsert { .. }, ChangeOp::Upsert | ChangeOp::Delete) => {
                    ensure!(change.key.is_some(), MissingRowKeySnafu { table: &self.name });
                }
                (_, op) => {
                    return UnsupportedChangeSnafu {
                        table: &self.name,
                        op: op.as_str(),
                    }
                    .fail();
                }
            }
        }
        Ok(())
    }

    /// Lowest position of any live cursor, `end` when there is none.
    fn low_water(&self, end: usize) -> usize {
        self.readers
            .iter()
            .map(|reader| *reader.value())
            .min()
            .unwrap_or(end)
    }

    pub(crate) fn register_reader(&self, position: usize) -> u64 {
        let id = self.next_reader.fetch_add(1, Ordering::Relaxed);
        self.readers.insert(id, position);
        id
    }

    pub(crate) fn move_reader(&self, id: u64, position: usize) {
        self.readers.insert(id, position);
    }

    pub(crate) fn release_reader(&self, id: u64) {
        self.readers.remove(&id);
    }

    /// Latest committed version, `-1` before the first commit.
    pub async fn version(&self) -> i64 {
        self.state.read().await.version
    }

    /// Checkpoint carried by the latest commit that had one.
    pub async fn checkpoint(&self) -> Option<CheckpointState> {
        self.state.read().await.checkpoint.clone()
    }

    /// Current rows. Upsert tables are ordered by key, append tables by commit order.
    pub async fn snapshot(&self) -> Vec<Record> {
        let state = self.state.read().await;
        match self.mode {
            TableMode::Append => state.appended.clone(),
            TableMode::Upsert { .. } => state.keyed.values().map(|(_, row)| row.clone()).collect(),
        }
    }

    /// Current rows of an upsert table with their keys, ordered by key.
    pub async fn keyed_snapshot(&self) -> Vec<(RowKey, Record)> {
        let state = self.state.read().await;
        state
            .keyed
            .iter()
            .map(|(k, (_, row))| (k.clone(), row.clone()))
            .collect()
    }

    /// Every current row as the change that wrote it, with the offset one
    /// past the last change. Both are read at the same version.
    pub async fn current_changes(&self) -> (Vec<TableChange>, usize) {
        let state = self.state.read().await;
        let version = state.version;
        let changes = match self.mode {
            TableMode::Append => state
                .appended
                .iter()
                .enumerate()
                .map(|(offset, row)| TableChange {
                    offset,
                    version,
                    op: ChangeOp::Append,
                    key: None,
                    row: row.clone(),
                })
                .collect(),
            TableMode::Upsert { .. } => state
                .keyed
                .iter()
                .map(|(key, (offset, row))| TableChange {
                    offset: *offset,
                    version,
                    op: ChangeOp::Upsert,
                    key: Some(key.clone()),
                    row: row.clone(),
                })
                .collect(),
        };
        (changes, state.end_offset())
    }

    /// Current row for `key` in an upsert table.
    pub async fn get(&self, key: &RowKey) -> Option<Record> {
        self.state
            .read()
            .await
            .keyed
            .get(key)
            .map(|(_, row)| row.clone())
    }

    /// Number of rows currently in the table.
    pub async fn len(&self) -> usize {
        let state = self.state.read().await;
        match self.mode {
            TableMode::Append => state.appended.len(),
            TableMode::Upsert { .. } => state.keyed.len(),
        }
    }

    /// Offset one past the last change.
    pub async fn end_offset(&self) -> usize {
        self.state.read().await.end_offset()
    }

    /// Offset of the oldest change still held in memory.
    pub async fn start_offset(&self) -> usize {
        self.state.read().await.base
    }

    /// Up to `limit` changes starting at `offset`. Changes already trimmed
    /// are skipped.
    pub async fn changes_since(&self, offset: usize, limit: usize) -> Vec<TableChange> {
        let state = self.state.read().await;
        state
            .changes
            .iter()
            .skip(offset.saturating_sub(state.base))
            .take(limit)
            .cloned()
            .collect()
    }

    /// Watch the committed version.
    pub fn subscribe(&self) -> watch::Receiver<i64> {
        self.version_tx.subscribe()
    }

    /// A new change-stream reader positioned at the start.
    ///
    /// Changes are held in memory until every live cursor has moved past them.
    pub fn cursor(self: &Arc<Self>) -> TableCursor {
        TableCursor::new(self.clone(), 0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::checkpoint::StageProgress;
    use crate::storage::StorageProvider;
    use crate::value::Value;
    use std::collections::HashMap;
    use tempfile::TempDir;

    async fn storage(dir: &TempDir) -> StorageProviderRef {
        Arc::new(
            StorageProvider::create_with_options(dir.path().to_str().unwrap(), HashMap::new())
                .await
                .unwrap(),
        )
    }

    fn keyed() -> TableMode {
        TableMode::Upsert {
            keys: vec!["id".to_string()],
        }
    }

    fn row(id: i64, name: &str) -> Record {
        let mut r = Record::new();
        r.insert("id", id);
        r.insert("name", name);
        r
    }

    fn checkpoint(inputs: &[(&str, usize)]) -> CheckpointState {
        CheckpointState::new(
            "stage",
            StageProgress::Join {
                inputs: inputs.iter().map(|(k, v)| (k.to_string(), *v)).collect(),
                unmatched: Vec::new(),
            },
        )
    }

    #[tokio::test]
    async fn test_upsert_snapshot_and_changes() {
        let dir = TempDir::new().unwrap();
        let table = Arc::new(ConformedTable::new("dim", keyed(), storage(&dir).await));
        let _reader = table.cursor();

        table
            .commit(
                vec![
                    Change::upsert(RowKey::single(2i64), row(2, "b")),
                    Change::upsert(RowKey::single(1i64), row(1, "a")),
                ],
                None,
            )
            .await
            .unwrap();
        let v = table
            .commit(vec![Change::upsert(RowKey::single(1i64), row(1, "A"))], None)
            .await
            .unwrap();

        assert_eq!(v, 1);
        assert_eq!(table.snapshot().await, vec![row(1, "A"), row(2, "b")]);

        let changes = table.changes_since(0, 10).await;
        assert_eq!(changes.len(), 3);
        assert_eq!(changes[2].offset, 2);
        assert_eq!(changes[2].version, 1);
        assert_eq!(table.changes_since(1, 1).await[0].row, row(1, "a"));
    }

    #[tokio::test]
    async fn test_delete_removes_row() {
        let dir = TempDir::new().unwrap();
        let table = ConformedTable::new("view", keyed(), storage(&dir).await);
        table
            .commit(vec![Change::upsert(RowKey::single(1i64), row(1, "a"))], None)
            .await
            .unwrap();
        table
            .commit(vec![Change::delete(RowKey::single(1i64), row(1, "a"))], None)
            .await
            .unwrap();

        assert!(table.snapshot().await.is_empty());
        assert_eq!(table.end_offset().await, 2);
    }

    #[tokio::test]
    async fn test_recover_restores_rows_and_checkpoint() {
        let dir = TempDir::new().unwrap();
        let storage = storage(&dir).await;
        {
            let table = ConformedTable::new("facts", TableMode::Append, storage.clone());
            table
                .commit(vec![Change::append(row(1, "a"))], Some(checkpoint(&[("x", 1)])))
                .await
                .unwrap();
            table
                .commit(vec![Change::append(row(2, "b"))], Some(checkpoint(&[("x", 2)])))
                .await
                .unwrap();
            table.commit(vec![Change::append(row(3, "c"))], None).await.unwrap();
        }

        let table = ConformedTable::new("facts", TableMode::Append, storage);
        let recovered = table.recover().await.unwrap();

        assert_eq!(recovered, Some(checkpoint(&[("x", 2)])));
        assert_eq!(table.version().await, 2);
        assert_eq!(table.len().await, 3);
        assert_eq!(table.end_offset().await, 3);

        let v = table.commit(vec![Change::append(row(4, "d"))], None).await.unwrap();
        assert_eq!(v, 3);
    }

    #[tokio::test]
    async fn test_recover_is_idempotent() {
        let dir = TempDir::new().unwrap();
        let table = ConformedTable::new("t", TableMode::Append, storage(&dir).await);
        assert_eq!(table.recover().await.unwrap(), None);
        table
            .commit(vec![Change::append(row(1, "a"))], Some(checkpoint(&[])))
            .await
            .unwrap();
        assert_eq!(table.recover().await.unwrap(), Some(checkpoint(&[])));
        assert_eq!(table.len().await, 1);
    }

    #[tokio::test]
    async fn test_concurrent_writer_conflicts() {
        let dir = TempDir::new().unwrap();
        let storage = storage(&dir).await;
        let first = ConformedTable::new("t", TableMode::Append, storage.clone());
        let second = ConformedTable::new("t", TableMode::Append, storage);

        first.commit(vec![Change::append(row(1, "a"))], None).await.unwrap();
        let err = second
            .commit(vec![Change::append(row(2, "b"))], None)
            .await
            .unwrap_err();

        assert!(matches!(err, TableError::CommitConflict { version: 0, .. }));
        assert!(second.snapshot().await.is_empty());
    }

    #[tokio::test]
    async fn test_rejects_changes_that_do_not_fit_mode() {
        let dir = TempDir::new().unwrap();
        let storage = storage(&dir).await;
        let append = ConformedTable::new("a", TableMode::Append, storage.clone());
        let err = append
            .commit(vec![Change::upsert(RowKey::single(1i64), row(1, "a"))], None)
            .await
            .unwrap_err();
        assert!(matches!(err, TableError::UnsupportedChange { .. }));

        let upsert = ConformedTable::new("u", keyed(), storage);
        let keyless = Change {
            op: ChangeOp::Upsert,
            key: None,
            row: row(1, "a"),
        };
        let err = upsert.commit(vec![keyless], None).await.unwrap_err();
        assert!(matches!(err, TableError::MissingRowKey { .. }));
        assert_eq!(upsert.version().await, -1);
    }

    #[tokio::test]
    async fn test_empty_commit_without_checkpoint_is_noop() {
        let dir = TempDir::new().unwrap();
        let table = ConformedTable::new("t", TableMode::Append, storage(&dir).await);
        assert_eq!(table.commit(Vec::new(), None).await.unwrap(), -1);

        let v = table
            .commit(Vec::new(), Some(checkpoint(&[("x", 0)])))
            .await
            .unwrap();
        assert_eq!(v, 0);
        assert_eq!(table.checkpoint().await, Some(checkpoint(&[("x", 0)])));
    }

    #[tokio::test]
    async fn test_subscribe_sees_commits() {
        let dir = TempDir::new().unwrap();
        let table = ConformedTable::new("t", keyed(), storage(&dir).await);
        let mut rx = table.subscribe();
        assert_eq!(*rx.borrow(), -1);

        table
            .commit(vec![Change::upsert(RowKey::single(1i64), row(1, "a"))], None)
            .await
            .unwrap();
        rx.changed().await.unwrap();
        assert_eq!(*rx.borrow(), 0);
        assert_eq!(
            table.get(&RowKey::single(1i64)).await.unwrap().value("name"),
            &Value::from("a")
        );
    }

    #[tokio::test]
    async fn test_changes_are_trimmed_below_slowest_cursor() {
        let dir = TempDir::new().unwrap();
        let table = Arc::new(ConformedTable::new("t", TableMode::Append, storage(&dir).await));
        let mut fast = table.cursor();
        let mut slow = table.cursor();

        for i in 0..4 {
            table.commit(vec![Change::append(row(i, "x"))], None).await.unwrap();
        }
        fast.seek(4);
        slow.seek(2);
        table.commit(vec![Change::append(row(4, "x"))], None).await.unwrap();

        assert_eq!(table.start_offset().await, 2);
        assert_eq!(table.end_offset().await, 5);
        assert_eq!(slow.next_batch(10).await.len(), 3);

        drop(slow);
        table.commit(vec![Change::append(row(5, "x"))], None).await.unwrap();
        assert_eq!(table.start_offset().await, 4);
        assert_eq!(fast.next_batch(10).await.len(), 2);
        // Rows are unaffected by trimming.
        assert_eq!(table.len().await, 6);
    }

    #[tokio::test]
    async fn test_table_without_readers_keeps_no_changes() {
        let dir = TempDir::new().unwrap();
        let table = ConformedTable::new("t", keyed(), storage(&dir).await);
        table
            .commit(vec![Change::upsert(RowKey::single(1i64), row(1, "a"))], None)
            .await
            .unwrap();
        assert_eq!(table.start_offset().await, 1);
        assert!(table.changes_since(0, 10).await.is_empty());
        assert_eq!(table.len().await, 1);
    }

    #[tokio::test]
    async fn test_recover_starts_from_latest_snapshot() {
        let dir = TempDir::new().unwrap();
        let storage = storage(&dir).await;
        {
            let table = ConformedTable::new("dim", keyed(), storage.clone()).with_snapshot_interval(2);
            for i in 0..5 {
                table
                    .commit(
                        vec![Change::upsert(RowKey::single(i % 3), row(i % 3, &i.to_string()))],
                        Some(checkpoint(&[("x", i as usize)])),
                    )
                    .await
                    .unwrap();
            }
        }
        assert!(dir.path().join(snapshot_path("dim", 4)).exists());

        // Commits covered by the snapshot are not read again.
        std::fs::remove_file(dir.path().join(log_path("dim", 1))).unwrap();

        let table = ConformedTable::new("dim", keyed(), storage);
        let recovered = table.recover().await.unwrap();
        assert_eq!(recovered, Some(checkpoint(&[("x", 4)])));
        assert_eq!(table.version().await, 4);
        assert_eq!(table.end_offset().await, 5);
        assert_eq!(
            table.get(&RowKey::single(1i64)).await.unwrap().value("name"),
            &Value::from("4")
        );

        let (changes, end) = table.current_changes().await;
        assert_eq!(end, 5);
        let offsets: Vec<_> = changes.iter().map(|c| c.offset).collect();
        assert_eq!(offsets, vec![3, 4, 2]);

        let v = table
            .commit(vec![Change::upsert(RowKey::single(0i64), row(0, "5"))], None)
            .await
            .unwrap();
        assert_eq!(v, 5);
    }

    #[tokio::test]
    async fn test_unreadable_snapshot_falls_back_to_log() {
        let dir = TempDir::new().unwrap();
        let storage = storage(&dir).await;
        {
            let table = ConformedTable::new("t", TableMode::Append, storage.clone()).with_snapshot_interval(1);
            for i in 0..3 {
                table.commit(vec![Change::append(row(i, "a"))], None).await.unwrap();
            }
        }
        std::fs::write(dir.path().join(snapshot_path("t", 2)), b"{not json").unwrap();

        let table = ConformedTable::new("t", TableMode::Append, storage);
        table.recover().await.unwrap();
        assert_eq!(table.len().await, 3);
        assert_eq!(table.version().await, 2);
    }
}
