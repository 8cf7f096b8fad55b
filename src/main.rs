//! contrail CLI: runs the configured entity and view pipelines.

use std::process::ExitCode;

use clap::Parser;
use snafu::prelude::*;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use contrail::error::{AddressParseSnafu, MetricsSnafu, PipelineError, TopologySnafu};
use contrail::signal::shutdown_signal;
use contrail::{CliArgs, Config, PipelineGraph, Topology, init_tracing, metrics};

#[tokio::main]
async fn main() -> ExitCode {
    let args = CliArgs::parse();
    init_tracing(&args.log_level);

    let paths = args.config_paths();
    info!("Loading config from {} source(s)", paths.len());

    let config = match Config::from_paths(&paths) {
        Ok(c) => c,
        Err(e) => {
            eprintln!("Failed to load config: {}", snafu::Report::from_error(e));
            return ExitCode::FAILURE;
        }
    };

    match run(&args, config).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!(error = %e, "Pipeline failed");
            eprintln!("Pipeline failed: {}", snafu::Report::from_error(e));
            ExitCode::FAILURE
        }
    }
}

async fn run(args: &CliArgs, config: Config) -> Result<(), PipelineError> {
    if args.dry_run {
        let graph = PipelineGraph::from_config(&config).context(TopologySnafu)?;
        print!("{}", graph.describe());
        info!("Configuration is valid");
        return Ok(());
    }

    let shutdown = CancellationToken::new();

    if let Some(table) = &args.snapshot {
        let topology = Topology::build(&config, shutdown).await?;
        for row in topology.snapshot(table).await? {
            println!("{}", row.to_json());
        }
        return Ok(());
    }

    if args.once {
        let mut topology = Topology::build(&config, shutdown).await?;
        let batches = topology.run_until_idle().await?;
        info!(batches, "Run complete");
        return Ok(());
    }

    if config.metrics.enabled {
        let addr = config.metrics.address.parse().context(AddressParseSnafu)?;
        metrics::init_global(addr).context(MetricsSnafu)?;
    }

    let topology = Topology::build(&config, shutdown.clone()).await?;
    for stage in topology.graph().stages() {
        info!(target = %stage.name, writes = %stage.writes, "Stage configured");
    }

    tokio::spawn(async move {
        shutdown_signal().await;
        shutdown.cancel();
    });

    topology.run().await
}
