//! Configuration parsing and validation.
//!
//! A configuration names an output root, a set of entity pipelines (raw
//! source to conformed table) and a set of views joining those tables.
//! It may be split across several YAML files; see [`loader`].

mod loader;
mod path;
mod stage_key;
mod vars;

pub use loader::load_from_paths;
pub use path::{CliArgs, ConfigPath, is_yaml_file};
pub use stage_key::StageKey;
pub use vars::interpolate;

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use snafu::prelude::*;
use std::collections::HashMap;
use std::path::Path;
use std::time::Duration;

use crate::error::{
    ConfigError, EmptyOutputPathSnafu, EmptySourcePathSnafu, EnvInterpolationSnafu,
    IncompleteViewSnafu, MissingKeyColumnsSnafu, MissingSequenceColumnSnafu,
    NoEntitiesSnafu, YamlParseSnafu,
};
use crate::schema::FieldType;
use crate::validate::RuleSet;

/// Main configuration structure.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub output: OutputConfig,
    #[serde(default)]
    pub entities: IndexMap<StageKey, EntityConfig>,
    #[serde(default)]
    pub views: IndexMap<StageKey, ViewConfig>,
    #[serde(default)]
    pub global: GlobalConfig,
    #[serde(default)]
    pub metrics: MetricsConfig,
    #[serde(default)]
    pub error_handling: ErrorHandlingConfig,
}

/// Root location of the conformed tables.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct OutputConfig {
    #[serde(default)]
    pub path: String,
    #[serde(default)]
    pub storage_options: HashMap<String, String>,
    /// Commits between two table snapshots, 0 to disable (default: 100).
    #[serde(default)]
    pub snapshot_interval: Option<u64>,
}

impl OutputConfig {
    pub fn snapshot_interval(&self) -> u64 {
        self.snapshot_interval
            .unwrap_or(crate::table::DEFAULT_SNAPSHOT_INTERVAL)
    }
}

/// Options shared by every stage of the process.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct GlobalConfig {
    /// Random delay added to each poll interval, in seconds (default: 5).
    #[serde(default)]
    pub poll_jitter_secs: Option<u64>,
    /// Partitions reduced concurrently per CDC batch (default: available cores).
    #[serde(default)]
    pub parallelism: Option<usize>,
}

const DEFAULT_POLL_JITTER_SECS: u64 = 5;

impl GlobalConfig {
    pub fn poll_jitter_secs(&self) -> u64 {
        self.poll_jitter_secs.unwrap_or(DEFAULT_POLL_JITTER_SECS)
    }

    pub fn parallelism(&self) -> usize {
        self.parallelism
            .unwrap_or_else(|| {
                std::thread::available_parallelism()
                    .map(|n| n.get())
                    .unwrap_or(1)
            })
            .max(1)
    }

    fn merge_from(&mut self, other: GlobalConfig) {
        self.poll_jitter_secs = other.poll_jitter_secs.or(self.poll_jitter_secs);
        self.parallelism = other.parallelism.or(self.parallelism);
    }
}

/// Metrics configuration for the Prometheus endpoint.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MetricsConfig {
    /// Whether metrics collection is enabled (default: true).
    #[serde(default = "default_metrics_enabled")]
    pub enabled: bool,
    /// Address to bind the metrics HTTP server (default: "0.0.0.0:9090").
    #[serde(default = "default_metrics_address")]
    pub address: String,
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            enabled: default_metrics_enabled(),
            address: default_metrics_address(),
        }
    }
}

impl MetricsConfig {
    fn merge_from(&mut self, other: MetricsConfig) {
        if other != MetricsConfig::default() {
            *self = other;
        }
    }
}

fn default_metrics_enabled() -> bool {
    true
}

fn default_metrics_address() -> String {
    crate::metrics::server::DEFAULT_METRICS_ADDR.to_string()
}

/// Dead-letter queue and failure limits.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ErrorHandlingConfig {
    /// DLQ records after which a stage stops (0 = unlimited, default: 0).
    #[serde(default)]
    pub max_failures: usize,
    /// Location for rejected records. Without it rejects are only counted.
    #[serde(default)]
    pub dlq_path: Option<String>,
    #[serde(default)]
    pub dlq_storage_options: HashMap<String, String>,
}

impl ErrorHandlingConfig {
    fn merge_from(&mut self, other: ErrorHandlingConfig) {
        if other.max_failures > 0 {
            self.max_failures = other.max_failures;
        }
        self.dlq_path = other.dlq_path.or(self.dlq_path.take());
        self.dlq_storage_options.extend(other.dlq_storage_options);
    }
}

/// One raw entity feeding one conformed table.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EntityConfig {
    pub source: SourceConfig,
    /// Output table name (default: `silver_<entity>`).
    #[serde(default)]
    pub table: Option<String>,
    /// Columns cast after reading; a failed cast yields NULL.
    #[serde(default)]
    pub casts: IndexMap<String, FieldType>,
    /// Column stamped with the batch processing time.
    #[serde(default)]
    pub processing_time_column: Option<String>,
    /// Named predicates; a record violating any of them is dropped.
    #[serde(default)]
    pub rules: IndexMap<String, String>,
    #[serde(default)]
    pub merge: MergeConfig,
}

impl EntityConfig {
    pub fn table_name(&self, key: &StageKey) -> String {
        self.table.clone().unwrap_or_else(|| key.default_table())
    }
}

/// How validated records reach the table.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(tag = "mode", rename_all = "lowercase")]
pub enum MergeConfig {
    /// Every record is appended.
    #[default]
    Append,
    /// Records are change events reduced to one row per key.
    Cdc {
        keys: Vec<String>,
        sequence_by: String,
    },
}

/// Raw-zone location of one entity.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SourceConfig {
    /// Directory of NDJSON files, e.g. "s3://lake/raw/bookings" or "/data/raw/bookings".
    pub path: String,
    /// Declared field types; values that do not fit are rescued.
    #[serde(default)]
    pub schema: IndexMap<String, FieldType>,
    #[serde(default)]
    pub compression: CompressionFormat,
    /// Maximum records per batch (default: 8192).
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    /// Seconds between polls when idle (default: 10).
    #[serde(default = "default_poll_interval_secs")]
    pub poll_interval_secs: u64,
    #[serde(default)]
    pub storage_options: HashMap<String, String>,
}

impl SourceConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.poll_interval_secs)
    }
}

fn default_batch_size() -> usize {
    8192
}

fn default_poll_interval_secs() -> u64 {
    10
}

/// Compression format of source files.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, Default, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum CompressionFormat {
    /// Gzip for files ending in `.gz`, plain otherwise.
    #[default]
    Auto,
    Gzip,
    None,
}

/// A join of one fact table with a chain of dimension tables.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ViewConfig {
    /// Output table name (default: `silver_<view>`).
    #[serde(default)]
    pub table: Option<String>,
    pub fact: FactConfig,
    pub dimensions: Vec<DimensionConfig>,
    /// Output columns, taken from the joined row.
    pub select: Vec<String>,
    #[serde(default)]
    pub join_miss: JoinMissPolicy,
    #[serde(default = "default_poll_interval_secs")]
    pub poll_interval_secs: u64,
    /// Maximum input changes read per table per batch (default: 8192).
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
}

impl ViewConfig {
    pub fn table_name(&self, key: &StageKey) -> String {
        self.table.clone().unwrap_or_else(|| key.default_table())
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.poll_interval_secs)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FactConfig {
    pub table: String,
    /// Columns identifying a fact row and the output row.
    pub key: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DimensionConfig {
    pub table: String,
    /// Column of the joined row matched against the dimension key.
    pub on: String,
}

/// What to do with a fact whose dimensions are missing.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JoinMissPolicy {
    /// Keep the fact pending until its dimensions arrive.
    #[default]
    Hold,
    /// Discard a fact that cannot be joined when first seen.
    Drop,
}

impl Config {
    /// Load and validate configuration from files and directories.
    pub fn from_paths(paths: &[ConfigPath]) -> Result<Self, ConfigError> {
        let config = load_from_paths(paths)?;
        config.validate()?;
        Ok(config)
    }

    /// Load and validate a single YAML file.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        Self::from_paths(&[ConfigPath::File(path.as_ref().to_path_buf())])
    }

    /// Parse and validate YAML text after environment interpolation.
    pub fn from_yaml(contents: &str) -> Result<Self, ConfigError> {
        let config = Self::parse_yaml(contents)?;
        config.validate()?;
        Ok(config)
    }

    /// Parse YAML text after environment interpolation, without validation.
    pub(crate) fn parse_yaml(contents: &str) -> Result<Self, ConfigError> {
        let text = interpolate(contents).map_err(|problems| {
            EnvInterpolationSnafu {
                message: problems.join("\n"),
            }
            .build()
        })?;
        serde_yaml::from_str(&text).context(YamlParseSnafu)
    }

    /// Fold a partial configuration from another file into this one.
    pub(crate) fn merge(&mut self, other: Config) -> Result<(), ConfigError> {
        let duplicates: Vec<String> = other
            .entities
            .keys()
            .filter(|key| self.entities.contains_key(*key))
            .chain(other.views.keys().filter(|key| self.views.contains_key(*key)))
            .map(|key| key.to_string())
            .collect();
        if !duplicates.is_empty() {
            return Err(ConfigError::DuplicateComponents { keys: duplicates });
        }

        self.entities.extend(other.entities);
        self.views.extend(other.views);
        if !other.output.path.is_empty() {
            self.output = other.output;
        }
        self.global.merge_from(other.global);
        self.metrics.merge_from(other.metrics);
        self.error_handling.merge_from(other.error_handling);
        Ok(())
    }

    /// Check everything that can be checked without building the graph.
    pub fn validate(&self) -> Result<(), ConfigError> {
        ensure!(!self.entities.is_empty(), NoEntitiesSnafu);
        ensure!(!self.output.path.is_empty(), EmptyOutputPathSnafu);

        for (key, entity) in &self.entities {
            ensure!(
                !entity.source.path.is_empty(),
                EmptySourcePathSnafu { entity: key.id() }
            );
            if let MergeConfig::Cdc { keys, sequence_by } = &entity.merge {
                ensure!(
                    !keys.is_empty(),
                    MissingKeyColumnsSnafu { entity: key.id() }
                );
                ensure!(
                    !sequence_by.is_empty(),
                    MissingSequenceColumnSnafu { entity: key.id() }
                );
            }
            entity.rule_set(key)?;
        }

        for (key, view) in &self.views {
            let incomplete = |message: &str| {
                IncompleteViewSnafu {
                    view: key.id(),
                    message,
                }
                .build()
            };
            if view.fact.key.is_empty() {
                return Err(incomplete("fact key is empty"));
            }
            if view.dimensions.is_empty() {
                return Err(incomplete("no dimensions"));
            }
            if view.dimensions.iter().any(|d| d.on.is_empty()) {
                return Err(incomplete("dimension without a join column"));
            }
            if view.select.is_empty() {
                return Err(incomplete("no selected columns"));
            }
        }
        Ok(())
    }
}

impl EntityConfig {
    /// Parse the entity's rules.
    pub fn rule_set(&self, key: &StageKey) -> Result<RuleSet, ConfigError> {
        RuleSet::parse(&self.rules).map_err(|(rule, source)| ConfigError::InvalidRule {
            entity: key.id().to_string(),
            rule,
            source,
        })
    }
}
