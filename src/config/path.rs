//! Command-line arguments and configuration sources.

use clap::Parser;
use std::path::{Path, PathBuf};

/// A configuration source, either a single file or a directory of them.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
pub enum ConfigPath {
    File(PathBuf),
    Dir(PathBuf),
}

impl ConfigPath {
    /// Classify a path given on the command line.
    pub fn from_arg(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        if path.is_dir() {
            Self::Dir(path)
        } else {
            Self::File(path)
        }
    }

    pub fn path(&self) -> &Path {
        match self {
            Self::File(p) | Self::Dir(p) => p,
        }
    }
}

/// Check if a path has a YAML extension.
pub fn is_yaml_file(path: &Path) -> bool {
    path.extension()
        .and_then(|ext| ext.to_str())
        .is_some_and(|ext| ext == "yaml" || ext == "yml")
}

/// contrail: streaming bronze-to-silver pipelines with CDC merge and joins.
#[derive(Parser, Debug)]
#[command(name = "contrail", version, about)]
pub struct CliArgs {
    /// Configuration file or directory (can be specified multiple times)
    #[arg(short, long, required = true)]
    pub config: Vec<PathBuf>,

    /// Default log level when RUST_LOG is not set
    #[arg(long, default_value = "info")]
    pub log_level: String,

    /// Validate the configuration and print the pipeline graph, then exit
    #[arg(long)]
    pub dry_run: bool,

    /// Run every stage until none makes progress, then exit
    #[arg(long)]
    pub once: bool,

    /// Print the snapshot of a table as NDJSON, then exit
    #[arg(long, value_name = "TABLE")]
    pub snapshot: Option<String>,
}

impl CliArgs {
    pub fn config_paths(&self) -> Vec<ConfigPath> {
        self.config.iter().cloned().map(ConfigPath::from_arg).collect()
    }
}
