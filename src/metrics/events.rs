//! Internal events for metrics emission.
//!
//! Each event struct represents a measurable occurrence in the pipeline.
//! Events implement the `InternalEvent` trait which emits the corresponding
//! Prometheus metric. Every stage-level event carries a `target` label with
//! the stage or table name.

use metrics::{counter, gauge, histogram};
use std::time::Duration;
use tracing::trace;

/// Trait for internal events that can be emitted as metrics.
pub trait InternalEvent {
    /// Emit this event as a metric.
    fn emit(self);
}

// ============================================================================
// Source events
// ============================================================================

/// Event emitted when records are read from a raw-zone location.
pub struct RecordsRead {
    pub count: u64,
    pub target: String,
}

impl InternalEvent for RecordsRead {
    fn emit(self) {
        trace!(count = self.count, target = %self.target, "Records read");
        counter!("contrail_records_read_total", "target" => self.target).increment(self.count);
    }
}

/// Event emitted when raw bytes are fetched from a raw-zone location.
pub struct BytesRead {
    pub bytes: u64,
    pub target: String,
}

impl InternalEvent for BytesRead {
    fn emit(self) {
        trace!(bytes = self.bytes, target = %self.target, "Bytes read");
        counter!("contrail_bytes_read_total", "target" => self.target).increment(self.bytes);
    }
}

/// Event emitted when the number of unfinished source files changes.
pub struct PendingFiles {
    pub count: usize,
    pub target: String,
}

impl InternalEvent for PendingFiles {
    fn emit(self) {
        trace!(count = self.count, target = %self.target, "Pending files");
        gauge!("contrail_pending_files", "target" => self.target).set(self.count as f64);
    }
}

/// Event emitted when records carried fields that failed schema coercion.
pub struct RecordsRescued {
    pub count: u64,
    pub target: String,
}

impl InternalEvent for RecordsRescued {
    fn emit(self) {
        trace!(count = self.count, target = %self.target, "Records rescued");
        counter!("contrail_records_rescued_total", "target" => self.target).increment(self.count);
    }
}

/// Stage at which a record failure occurred.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FailureStage {
    /// The raw line was not a JSON object.
    Decode,
    /// The change event had no usable key or sequence value.
    Merge,
}

impl FailureStage {
    pub fn as_str(&self) -> &'static str {
        match self {
            FailureStage::Decode => "decode",
            FailureStage::Merge => "merge",
        }
    }
}

/// Event emitted when a record is sent to the dead-letter queue.
pub struct RecordFailed {
    pub stage: FailureStage,
    pub target: String,
}

impl InternalEvent for RecordFailed {
    fn emit(self) {
        trace!(stage = self.stage.as_str(), target = %self.target, "Record failed");
        counter!(
            "contrail_records_failed_total",
            "stage" => self.stage.as_str(),
            "target" => self.target
        )
        .increment(1);
    }
}

// ============================================================================
// Validation events
// ============================================================================

/// Event emitted when a cast produced `NULL` from a non-null value.
pub struct CastFailures {
    pub count: u64,
    pub column: String,
    pub target: String,
}

impl InternalEvent for CastFailures {
    fn emit(self) {
        trace!(
            count = self.count,
            column = %self.column,
            target = %self.target,
            "Cast failures"
        );
        counter!(
            "contrail_cast_failures_total",
            "column" => self.column,
            "target" => self.target
        )
        .increment(self.count);
    }
}

/// Event emitted when records violate a named rule.
pub struct RecordsDropped {
    pub count: u64,
    pub rule: String,
    pub target: String,
}

impl InternalEvent for RecordsDropped {
    fn emit(self) {
        trace!(
            count = self.count,
            rule = %self.rule,
            target = %self.target,
            "Records dropped"
        );
        counter!(
            "contrail_rule_violations_total",
            "rule" => self.rule,
            "target" => self.target
        )
        .increment(self.count);
    }
}

// ============================================================================
// CDC merge events
// ============================================================================

/// What happened to a change event during a merge.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MergeOutcome {
    /// The event produced a new current row.
    Applied,
    /// A later event for the same key in the same batch won.
    Superseded,
    /// The event was older than the stored row.
    Stale,
    /// The event matched the stored row exactly.
    Unchanged,
    /// The event had no usable key or sequence value.
    Rejected,
}

impl MergeOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            MergeOutcome::Applied => "applied",
            MergeOutcome::Superseded => "superseded",
            MergeOutcome::Stale => "stale",
            MergeOutcome::Unchanged => "unchanged",
            MergeOutcome::Rejected => "rejected",
        }
    }
}

/// Event emitted after a merge batch is planned.
pub struct CdcEvents {
    pub count: u64,
    pub outcome: MergeOutcome,
    pub target: String,
}

impl InternalEvent for CdcEvents {
    fn emit(self) {
        if self.count == 0 {
            return;
        }
        trace!(
            count = self.count,
            outcome = self.outcome.as_str(),
            target = %self.target,
            "CDC events"
        );
        counter!(
            "contrail_cdc_events_total",
            "outcome" => self.outcome.as_str(),
            "target" => self.target
        )
        .increment(self.count);
    }
}

/// Event emitted when the number of live dimension rows changes.
pub struct DimensionRows {
    pub count: usize,
    pub target: String,
}

impl InternalEvent for DimensionRows {
    fn emit(self) {
        trace!(count = self.count, target = %self.target, "Dimension rows");
        gauge!("contrail_dimension_rows", "target" => self.target).set(self.count as f64);
    }
}

// ============================================================================
// Table events
// ============================================================================

/// Event emitted when changes are committed to a conformed table.
pub struct RowsCommitted {
    pub count: u64,
    pub table: String,
}

impl InternalEvent for RowsCommitted {
    fn emit(self) {
        trace!(count = self.count, table = %self.table, "Rows committed");
        counter!("contrail_rows_committed_total", "table" => self.table).increment(self.count);
    }
}

/// Event emitted when a table's committed version advances.
pub struct TableVersion {
    pub version: i64,
    pub table: String,
}

impl InternalEvent for TableVersion {
    fn emit(self) {
        trace!(version = self.version, table = %self.table, "Table version");
        gauge!("contrail_table_version", "table" => self.table).set(self.version as f64);
    }
}

/// Event emitted when a table commit completes.
pub struct CommitDuration {
    pub duration: Duration,
    pub table: String,
}

impl InternalEvent for CommitDuration {
    fn emit(self) {
        trace!(
            duration_ms = self.duration.as_millis(),
            table = %self.table,
            "Commit completed"
        );
        histogram!("contrail_commit_duration_seconds", "table" => self.table)
            .record(self.duration.as_secs_f64());
    }
}

/// Event emitted when a table's in-memory change stream is trimmed.
pub struct RetainedChanges {
    pub count: usize,
    pub table: String,
}

impl InternalEvent for RetainedChanges {
    fn emit(self) {
        trace!(count = self.count, table = %self.table, "Retained changes");
        gauge!("contrail_table_retained_changes", "table" => self.table).set(self.count as f64);
    }
}

// ============================================================================
// Join events
// ============================================================================

/// Event emitted when the number of facts waiting for a dimension changes.
pub struct JoinPendingFacts {
    pub count: usize,
    pub target: String,
}

impl InternalEvent for JoinPendingFacts {
    fn emit(self) {
        trace!(count = self.count, target = %self.target, "Join pending facts");
        gauge!("contrail_join_pending_facts", "target" => self.target).set(self.count as f64);
    }
}

/// Event emitted when joined rows are emitted or retracted.
pub struct JoinedRowsEmitted {
    pub upserts: u64,
    pub deletes: u64,
    pub target: String,
}

impl InternalEvent for JoinedRowsEmitted {
    fn emit(self) {
        trace!(
            upserts = self.upserts,
            deletes = self.deletes,
            target = %self.target,
            "Joined rows emitted"
        );
        counter!("contrail_joined_rows_total", "op" => "upsert", "target" => self.target.clone())
            .increment(self.upserts);
        counter!("contrail_joined_rows_total", "op" => "delete", "target" => self.target)
            .increment(self.deletes);
    }
}

/// Event emitted when facts are discarded under the `drop` join-miss policy.
pub struct JoinMissesDropped {
    pub count: u64,
    pub target: String,
}

impl InternalEvent for JoinMissesDropped {
    fn emit(self) {
        trace!(count = self.count, target = %self.target, "Join misses dropped");
        counter!("contrail_join_misses_dropped_total", "target" => self.target)
            .increment(self.count);
    }
}

// ============================================================================
// Storage operation events
// ============================================================================

/// Storage operation types.
#[derive(Debug, Clone, Copy)]
pub enum StorageOperation {
    Get,
    Put,
    List,
}

impl StorageOperation {
    pub fn as_str(&self) -> &'static str {
        match self {
            StorageOperation::Get => "get",
            StorageOperation::Put => "put",
            StorageOperation::List => "list",
        }
    }
}

/// Status of a storage request.
#[derive(Debug, Clone, Copy)]
pub enum RequestStatus {
    Success,
    Error,
}

impl RequestStatus {
    fn as_str(&self) -> &'static str {
        match self {
            RequestStatus::Success => "success",
            RequestStatus::Error => "error",
        }
    }
}

/// Event emitted when a storage request completes.
pub struct StorageRequest {
    pub operation: StorageOperation,
    pub status: RequestStatus,
}

impl InternalEvent for StorageRequest {
    fn emit(self) {
        trace!(
            operation = self.operation.as_str(),
            status = self.status.as_str(),
            "Storage request"
        );
        counter!(
            "contrail_storage_requests_total",
            "operation" => self.operation.as_str(),
            "status" => self.status.as_str()
        )
        .increment(1);
    }
}

/// Event emitted when a storage request completes with duration.
pub struct StorageRequestDuration {
    pub operation: StorageOperation,
    pub duration: Duration,
}

impl InternalEvent for StorageRequestDuration {
    fn emit(self) {
        histogram!(
            "contrail_storage_request_duration_seconds",
            "operation" => self.operation.as_str()
        )
        .record(self.duration.as_secs_f64());
    }
}

// ============================================================================
// Polling loop events
// ============================================================================

/// Outcome of a polling iteration.
#[derive(Debug, Clone, Copy)]
pub enum IterationResultType {
    Processed,
    NoItems,
}

impl IterationResultType {
    fn as_str(&self) -> &'static str {
        match self {
            IterationResultType::Processed => "processed",
            IterationResultType::NoItems => "no_items",
        }
    }
}

/// Event emitted when a polling iteration completes.
pub struct IterationCompleted {
    pub result: IterationResultType,
    pub target: String,
}

impl InternalEvent for IterationCompleted {
    fn emit(self) {
        trace!(result = self.result.as_str(), target = %self.target, "Iteration completed");
        counter!(
            "contrail_iterations_total",
            "result" => self.result.as_str(),
            "target" => self.target
        )
        .increment(1);
    }
}

/// Event emitted with the wall time of a polling iteration.
pub struct IterationDuration {
    pub duration: Duration,
    pub target: String,
}

impl InternalEvent for IterationDuration {
    fn emit(self) {
        histogram!("contrail_iteration_duration_seconds", "target" => self.target)
            .record(self.duration.as_secs_f64());
    }
}

/// Event emitted when a stage checkpoint is committed with its output.
pub struct CheckpointCommitted {
    pub target: String,
}

impl InternalEvent for CheckpointCommitted {
    fn emit(self) {
        trace!(target = %self.target, "Checkpoint committed");
        counter!("contrail_checkpoints_committed_total", "target" => self.target).increment(1);
    }
}
