//! Pipeline topology: named tables, the stages that fill them, and the
//! runner that drives every stage.
//!
//! Each stage runs its own polling loop on its own task. Stages only share
//! tables, so a stage that fails stops alone while the others keep running.

mod context;
mod entity;
mod graph;
mod view;

pub use context::PipelineContext;
pub use entity::EntityStage;
pub use graph::{PipelineGraph, StageKind, StageNode};
pub use view::ViewStage;

use futures::future::try_join_all;
use indexmap::IndexMap;
use snafu::prelude::*;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use crate::config::{Config, StageKey};
use crate::dlq::DeadLetterQueue;
use crate::error::{
    DlqSnafu, PipelineError, PipelineStorageSnafu, PipelineTableSnafu, StagesFailedSnafu,
    TopologySnafu,
};
use crate::polling::{IterationResult, PollingProcessor, random_jitter, run_polling_loop};
use crate::storage::StorageProvider;
use crate::table::{ConformedTable, ConformedTableRef};
use crate::value::Record;

/// A runnable stage.
pub enum Stage {
    Entity(EntityStage),
    View(ViewStage),
}

impl Stage {
    pub fn key(&self) -> &StageKey {
        match self {
            Stage::Entity(stage) => stage.key(),
            Stage::View(stage) => stage.key(),
        }
    }

    fn poll_interval(&self) -> Duration {
        match self {
            Stage::Entity(stage) => stage.poll_interval(),
            Stage::View(stage) => stage.poll_interval(),
        }
    }

    /// Prepare and process one batch. Returns whether anything was committed.
    async fn step(&mut self, cold_start: bool) -> Result<bool, PipelineError> {
        let result = match self {
            Stage::Entity(stage) => match stage.prepare(cold_start).await? {
                Some(batch) => stage.process(batch).await?,
                None => IterationResult::NoItems,
            },
            Stage::View(stage) => match stage.prepare(cold_start).await? {
                Some(batch) => stage.process(batch).await?,
                None => IterationResult::NoItems,
            },
        };
        Ok(result == IterationResult::ProcessedItems)
    }

    async fn run(
        &mut self,
        poll_jitter_secs: u64,
        shutdown: CancellationToken,
    ) -> Result<(), PipelineError> {
        let interval = self.poll_interval();
        match self {
            Stage::Entity(stage) => {
                let name = stage.key().to_string();
                run_polling_loop(stage, interval, poll_jitter_secs, shutdown, &name).await
            }
            Stage::View(stage) => {
                let name = stage.key().to_string();
                run_polling_loop(stage, interval, poll_jitter_secs, shutdown, &name).await
            }
        }
    }
}

/// A validated pipeline ready to run.
pub struct Topology {
    graph: PipelineGraph,
    context: PipelineContext,
    stages: Vec<Stage>,
    started: bool,
}

impl Topology {
    /// Validate the graph, open storage, recover every table and build the
    /// stages in dependency order.
    pub async fn build(config: &Config, shutdown: CancellationToken) -> Result<Self, PipelineError> {
        let graph = PipelineGraph::from_config(config).context(TopologySnafu)?;

        let storage = Arc::new(
            StorageProvider::create_with_options(
                &config.output.path,
                config.output.storage_options.clone(),
            )
            .await
            .context(PipelineStorageSnafu)?,
        );

        let tables: IndexMap<String, ConformedTableRef> = graph
            .tables()
            .iter()
            .map(|(name, mode)| {
                let table = ConformedTable::new(name.clone(), mode.clone(), storage.clone())
                    .with_snapshot_interval(config.output.snapshot_interval());
                (name.clone(), Arc::new(table))
            })
            .collect();

        let dlq = DeadLetterQueue::from_config(&config.error_handling)
            .await
            .context(DlqSnafu)?
            .map(Arc::new);

        let context = PipelineContext::new(
            tables,
            dlq,
            config.error_handling.max_failures,
            config.global.parallelism(),
            config.global.poll_jitter_secs(),
            shutdown,
        );
        recover_tables(&context).await?;

        let mut stages = Vec::with_capacity(graph.stages().len());
        for node in graph.stages() {
            let key = StageKey::new(&node.name);
            let stage = match &node.kind {
                StageKind::Entity { .. } => {
                    let entity = &config.entities[&key];
                    Stage::Entity(EntityStage::new(key, entity, &context)?)
                }
                StageKind::View => {
                    let view = &config.views[&key];
                    Stage::View(ViewStage::new(key, view, &context)?)
                }
            };
            stages.push(stage);
        }

        info!(
            stages = stages.len(),
            tables = graph.tables().len(),
            output = %config.output.path,
            "Topology built"
        );
        Ok(Self {
            graph,
            context,
            stages,
            started: false,
        })
    }

    pub fn graph(&self) -> &PipelineGraph {
        &self.graph
    }

    pub fn describe(&self) -> String {
        self.graph.describe()
    }

    pub fn table(&self, name: &str) -> Result<ConformedTableRef, PipelineError> {
        self.context.table(name)
    }

    pub fn stages(&self) -> impl Iterator<Item = &StageKey> {
        self.stages.iter().map(Stage::key)
    }

    /// Run every stage until shutdown.
    ///
    /// Returns an error naming the stages that stopped with one.
    pub async fn run(self) -> Result<(), PipelineError> {
        let Self { context, stages, .. } = self;
        let mut handles: JoinSet<(StageKey, Result<(), PipelineError>)> = JoinSet::new();

        for mut stage in stages {
            let shutdown = context.shutdown.clone();
            let jitter_secs = context.poll_jitter_secs;
            let start_jitter = random_jitter(jitter_secs);

            handles.spawn(async move {
                let key = stage.key().clone();
                if !start_jitter.is_zero() {
                    info!(
                        target = %key,
                        jitter_ms = start_jitter.as_millis() as u64,
                        "Delaying stage start for jitter"
                    );
                    if shutdown
                        .run_until_cancelled(tokio::time::sleep(start_jitter))
                        .await
                        .is_none()
                    {
                        return (key, Ok(()));
                    }
                }
                let result = stage.run(jitter_secs, shutdown).await;
                (key, result)
            });
        }

        info!("Spawned {} stage tasks", handles.len());

        let mut failed = Vec::new();
        while let Some(result) = handles.join_next().await {
            match result {
                Ok((key, Ok(()))) => info!(target = %key, "Stage stopped"),
                Ok((key, Err(e))) => {
                    error!(target = %key, error = %e, "Stage failed");
                    failed.push(key.to_string());
                }
                Err(e) => {
                    error!(error = %e, "Stage task panicked");
                    failed.push("<panicked>".to_string());
                }
            }
        }

        if let Some(dlq) = context.dlq() {
            if let Err(e) = dlq.finalize().await {
                error!(error = %e, "Failed to flush DLQ");
            }
        }

        ensure!(failed.is_empty(), StagesFailedSnafu { stages: failed });
        info!("All stages stopped");
        Ok(())
    }

    /// Run stages in dependency order until a full round commits nothing.
    ///
    /// Used by `--once` and tests. Any stage error is returned immediately.
    pub async fn run_until_idle(&mut self) -> Result<usize, PipelineError> {
        let mut batches = 0;
        loop {
            let mut progressed = false;
            for stage in &mut self.stages {
                let mut cold_start = !self.started;
                while stage.step(cold_start).await? {
                    cold_start = false;
                    progressed = true;
                    batches += 1;
                }
            }
            self.started = true;
            if !progressed {
                break;
            }
        }

        if let Some(dlq) = self.context.dlq() {
            dlq.flush().await.context(DlqSnafu)?;
        }
        info!(batches, "Pipeline idle");
        Ok(batches)
    }

    /// Current rows of `name`.
    pub async fn snapshot(&self, name: &str) -> Result<Vec<Record>, PipelineError> {
        Ok(self.table(name)?.snapshot().await)
    }
}

/// Load every table's commit log before any stage reads from it.
async fn recover_tables(context: &PipelineContext) -> Result<(), PipelineError> {
    try_join_all(context.tables().map(|table| table.recover()))
        .await
        .context(PipelineTableSnafu)?;
    Ok(())
}
