//! contrail: incremental bronze-to-silver streaming pipelines.
//!
//! Raw NDJSON change streams are validated, appended or CDC-merged into
//! conformed tables, and joined incrementally into business views. Every
//! stage commits its output together with its progress, so a restarted
//! process resumes without reprocessing or losing records.
//!
//! # Example
//!
//! ```ignore
//! use contrail::{Config, Topology};
//! use tokio_util::sync::CancellationToken;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let config = Config::from_file("pipeline.yaml")?;
//!     let mut topology = Topology::build(&config, CancellationToken::new()).await?;
//!     topology.run_until_idle().await?;
//!     for row in topology.snapshot("business_view").await? {
//!         println!("{}", row.to_json());
//!     }
//!     Ok(())
//! }
//! ```

pub mod cdc;
pub mod checkpoint;
pub mod config;
pub mod dlq;
pub mod error;
pub mod join;
pub mod metrics;
pub mod pipeline;
pub mod polling;
pub mod schema;
pub mod signal;
pub mod source;
pub mod storage;
pub mod table;
pub mod validate;
pub mod value;

use tracing_subscriber::EnvFilter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

pub use config::{CliArgs, Config};
pub use pipeline::{PipelineGraph, Topology};
pub use storage::{StorageProvider, StorageProviderRef};
pub use value::{Record, RowKey, Value};

/// Initialize tracing.
///
/// `RUST_LOG` takes precedence over `default_level`.
pub fn init_tracing(default_level: &str) {
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));

    let fmt_layer = tracing_subscriber::fmt::layer().with_target(true);

    tracing_subscriber::registry()
        .with(fmt_layer)
        .with(env_filter)
        .init();
}
