//! Error types for contrail using snafu.
//!
//! This module defines structured error types with context selectors for
//! all error conditions in the codebase. Variant names are unique across
//! enums so their context selectors never collide.

use snafu::prelude::*;
use std::path::PathBuf;

// ============ Storage Errors ============

/// Errors that can occur during storage operations.
#[derive(Debug, Snafu)]
#[snafu(visibility(pub))]
pub enum StorageError {
    /// Invalid storage URL format.
    #[snafu(display("Invalid storage URL: {url}"))]
    InvalidUrl { url: String },

    /// Failed to parse a storage URL.
    #[snafu(display("Failed to parse storage URL: {url}"))]
    UrlParse { url: String, source: url::ParseError },

    /// Failed to create a local directory.
    #[snafu(display("Failed to create directory {}", path.display()))]
    CreateDir {
        path: PathBuf,
        source: std::io::Error,
    },

    /// Object store operation failed.
    #[snafu(display("Storage operation failed"))]
    ObjectStore { source: object_store::Error },
}

impl StorageError {
    /// Check if this error represents a "not found" condition.
    pub fn is_not_found(&self) -> bool {
        matches!(
            self,
            StorageError::ObjectStore {
                source: object_store::Error::NotFound { .. }
            }
        )
    }

    /// Check if this error was caused by a put-if-absent conflict.
    pub fn is_already_exists(&self) -> bool {
        matches!(
            self,
            StorageError::ObjectStore {
                source: object_store::Error::AlreadyExists { .. }
            }
        )
    }
}

// ============ Rule Errors ============

/// Errors produced while parsing a validation rule.
#[derive(Debug, Snafu, PartialEq)]
#[snafu(visibility(pub))]
pub enum RuleError {
    /// The rule is not valid SQL.
    #[snafu(display("Invalid expression: {message}"))]
    Syntax { message: String },

    /// Input remained after a complete expression.
    #[snafu(display("Unexpected '{found}' after expression"))]
    TrailingInput { found: String },

    /// The expression uses SQL that rules do not evaluate.
    #[snafu(display("Unsupported expression '{expr}'"))]
    Unsupported { expr: String },

    /// A numeric literal could not be parsed.
    #[snafu(display("Invalid number '{text}'"))]
    InvalidNumber { text: String },
}

// ============ Config Errors ============

/// Errors that can occur during configuration parsing and validation.
#[derive(Debug, Snafu)]
#[snafu(visibility(pub))]
pub enum ConfigError {
    /// No entity pipelines configured.
    #[snafu(display("At least one entity must be configured"))]
    NoEntities,

    /// Source path is empty.
    #[snafu(display("Source path cannot be empty for entity '{entity}'"))]
    EmptySourcePath { entity: String },

    /// Output path is empty.
    #[snafu(display("Output path cannot be empty"))]
    EmptyOutputPath,

    /// CDC merge configured without key columns.
    #[snafu(display("CDC merge for '{entity}' requires at least one key column"))]
    MissingKeyColumns { entity: String },

    /// CDC merge configured without a sequence column.
    #[snafu(display("CDC merge for '{entity}' requires a sequence_by column"))]
    MissingSequenceColumn { entity: String },

    /// A view has no dimensions or no selected columns.
    #[snafu(display("View '{view}' is incomplete: {message}"))]
    IncompleteView { view: String, message: String },

    /// A validation rule failed to parse.
    #[snafu(display("Invalid rule '{rule}' for '{entity}'"))]
    InvalidRule {
        entity: String,
        rule: String,
        source: RuleError,
    },

    /// Environment variable interpolation failed.
    #[snafu(display("Environment variable interpolation failed:\n{message}"))]
    EnvInterpolation { message: String },

    /// Failed to parse YAML configuration.
    #[snafu(display("Failed to parse YAML configuration"))]
    YamlParse { source: serde_yaml::Error },

    /// Failed to read configuration file.
    #[snafu(display("Failed to read configuration file {}", path.display()))]
    ReadFile {
        path: PathBuf,
        source: std::io::Error,
    },

    /// Failed to list a configuration directory.
    #[snafu(display("Failed to read configuration directory {}", path.display()))]
    ReadDir {
        path: PathBuf,
        source: std::io::Error,
    },

    /// Configuration file has an unsupported extension.
    #[snafu(display("Unsupported configuration format: {}", path.display()))]
    UnsupportedFormat { path: PathBuf },

    /// The same component was defined in more than one file.
    #[snafu(display("Duplicate components across config files: {}", keys.join(", ")))]
    DuplicateComponents { keys: Vec<String> },

    /// Several config sources failed.
    #[snafu(display("Failed to load configuration:\n{}", errors.join("\n")))]
    MultipleErrors { errors: Vec<String> },
}

// ============ Source Errors ============

/// Errors that can occur while reading a raw-zone location.
#[derive(Debug, Snafu)]
#[snafu(visibility(pub))]
pub enum SourceError {
    /// The raw-zone location could not be opened.
    #[snafu(display("Failed to open source {url}"))]
    SourceOpen { url: String, source: StorageError },

    /// Listing the raw-zone location failed.
    #[snafu(display("Failed to list source files"))]
    SourceList { source: StorageError },

    /// Reading a raw file failed.
    #[snafu(display("Failed to read source file {path}"))]
    SourceRead { path: String, source: StorageError },

    /// Gzip decompression failed.
    #[snafu(display("Decompression failed for {path}"))]
    Decompress {
        path: String,
        source: std::io::Error,
    },

    /// The blocking parse task did not complete.
    #[snafu(display("Parse task failed"))]
    ParseTask { source: tokio::task::JoinError },
}

// ============ Table Errors ============

/// Errors that can occur while committing to or recovering a conformed table.
#[derive(Debug, Snafu)]
#[snafu(visibility(pub))]
pub enum TableError {
    /// Writing a commit entry failed.
    #[snafu(display("Failed to write commit {version} for table {table}"))]
    CommitWrite {
        table: String,
        version: i64,
        source: StorageError,
    },

    /// Another writer already committed this version.
    #[snafu(display("Commit conflict on table {table}: version {version} already exists"))]
    CommitConflict { table: String, version: i64 },

    /// Encoding a commit entry failed.
    #[snafu(display("Failed to encode commit for table {table}"))]
    LogEncode {
        table: String,
        source: serde_json::Error,
    },

    /// Listing the commit log failed.
    #[snafu(display("Failed to list commit log for table {table}"))]
    LogList { table: String, source: StorageError },

    /// Reading a commit entry failed.
    #[snafu(display("Failed to read commit {path}"))]
    LogRead { path: String, source: StorageError },

    /// Decoding a commit entry failed.
    #[snafu(display("Failed to decode commit {path}"))]
    LogDecode {
        path: String,
        source: serde_json::Error,
    },

    /// Listing the snapshots failed.
    #[snafu(display("Failed to list snapshots for table {table}"))]
    SnapshotList { table: String, source: StorageError },

    /// Reading a snapshot failed.
    #[snafu(display("Failed to read snapshot {path}"))]
    SnapshotRead { path: String, source: StorageError },

    /// Decoding a snapshot failed.
    #[snafu(display("Failed to decode snapshot {path}"))]
    SnapshotDecode {
        path: String,
        source: serde_json::Error,
    },

    /// Encoding a snapshot failed.
    #[snafu(display("Failed to encode snapshot of table {table}"))]
    SnapshotEncode {
        table: String,
        source: serde_json::Error,
    },

    /// Writing a snapshot failed.
    #[snafu(display("Failed to write snapshot {path}"))]
    SnapshotWrite { path: String, source: StorageError },

    /// An upsert or delete arrived without a key.
    #[snafu(display("Keyed change without a row key on table {table}"))]
    MissingRowKey { table: String },

    /// The change kind does not fit the table mode.
    #[snafu(display("Table {table} does not accept {op} changes"))]
    UnsupportedChange { table: String, op: String },
}

// ============ Topology Errors ============

/// Errors detected while building the pipeline graph.
#[derive(Debug, Snafu)]
#[snafu(visibility(pub))]
pub enum TopologyError {
    /// A stage or table name is used twice.
    #[snafu(display("Duplicate {kind} name: {name}"))]
    DuplicateName { kind: &'static str, name: String },

    /// A stage reads a table nothing produces.
    #[snafu(display("Stage '{stage}' reads unknown table '{table}'"))]
    UnknownTable { stage: String, table: String },

    /// The stage graph contains a cycle.
    #[snafu(display("Pipeline graph contains a cycle through: {}", stages.join(" -> ")))]
    Cycle { stages: Vec<String> },

    /// A join dimension is not an upsert table keyed on the join column.
    #[snafu(display(
        "View '{view}' joins '{table}' on '{column}', but the table is not keyed on that column"
    ))]
    InvalidDimension {
        view: String,
        table: String,
        column: String,
    },
}

// ============ Metrics Errors ============

/// Errors that can occur during metrics initialization.
#[derive(Debug, Snafu)]
#[snafu(visibility(pub))]
pub enum MetricsError {
    /// Failed to initialize Prometheus recorder.
    #[snafu(display("Failed to initialize Prometheus recorder"))]
    PrometheusInit {
        source: metrics_exporter_prometheus::BuildError,
    },

    /// Metrics were initialized twice.
    #[snafu(display("Metrics already initialized"))]
    AlreadyInitialized,
}

// ============ DLQ Errors ============

/// Errors that can occur during Dead Letter Queue operations.
#[derive(Debug, Snafu)]
#[snafu(visibility(pub))]
// Prefix is intentional to avoid snafu selector conflicts (e.g., WriteSnafu)
#[allow(clippy::enum_variant_names)]
pub enum DlqError {
    /// Failed to write to DLQ.
    #[snafu(display("Failed to write to DLQ"))]
    DlqWrite { source: StorageError },

    /// Failed to serialize failed record.
    #[snafu(display("Failed to serialize DLQ record"))]
    DlqSerialize { source: serde_json::Error },

    /// Failed to create DLQ storage provider.
    #[snafu(display("Failed to create DLQ storage"))]
    DlqStorage { source: StorageError },
}

// ============ Pipeline Error (top-level) ============

/// Top-level pipeline errors that aggregate all error types.
#[derive(Debug, Snafu)]
#[snafu(visibility(pub))]
pub enum PipelineError {
    /// Source error.
    #[snafu(display("Source error in stage {stage}"))]
    PipelineSource { stage: String, source: SourceError },

    /// Table error.
    #[snafu(display("Table error"))]
    PipelineTable { source: TableError },

    /// Storage error.
    #[snafu(display("Storage error"))]
    PipelineStorage { source: StorageError },

    /// Configuration error.
    #[snafu(display("Configuration error"))]
    Config { source: ConfigError },

    /// Topology error.
    #[snafu(display("Invalid pipeline topology"))]
    Topology { source: TopologyError },

    /// Address parsing error.
    #[snafu(display("Failed to parse address"))]
    AddressParse { source: std::net::AddrParseError },

    /// Metrics error.
    #[snafu(display("Metrics error"))]
    Metrics { source: MetricsError },

    /// DLQ error.
    #[snafu(display("DLQ error"))]
    Dlq { source: DlqError },

    /// Max failures exceeded.
    #[snafu(display("Max failures exceeded: {count} failures"))]
    MaxFailuresExceeded { count: usize },

    /// A table requested by name does not exist.
    #[snafu(display("Unknown table: {name}"))]
    TableNotFound { name: String },

    /// The CDC reduction task did not complete.
    #[snafu(display("Merge task failed in stage {stage}"))]
    MergeTask {
        stage: String,
        source: tokio::task::JoinError,
    },

    /// One or more stages stopped with an error.
    #[snafu(display("Stages failed: {}", stages.join(", ")))]
    StagesFailed { stages: Vec<String> },
}
