//! The pipeline graph: named tables and the stages between them.
//!
//! Built from configuration and validated before anything runs. Every
//! table has exactly one producing stage; a view may read any table,
//! including another view's output, as long as the graph stays acyclic.

use indexmap::{IndexMap, IndexSet};
use snafu::prelude::*;
use std::collections::VecDeque;

use crate::config::{Config, MergeConfig};
use crate::error::{
    CycleSnafu, DuplicateNameSnafu, InvalidDimensionSnafu, TopologyError, UnknownTableSnafu,
};
use crate::table::TableMode;

/// What a stage does.
#[derive(Debug, Clone, PartialEq)]
pub enum StageKind {
    /// Raw source to conformed table.
    Entity { source: String },
    /// Join of conformed tables.
    View,
}

/// A node of the graph.
#[derive(Debug, Clone, PartialEq)]
pub struct StageNode {
    pub name: String,
    pub kind: StageKind,
    /// Tables read, fact first for views.
    pub reads: Vec<String>,
    pub writes: String,
}

/// Validated stage graph.
#[derive(Debug, Clone)]
pub struct PipelineGraph {
    /// Stages in dependency order.
    stages: Vec<StageNode>,
    tables: IndexMap<String, TableMode>,
}

impl PipelineGraph {
    pub fn from_config(config: &Config) -> Result<Self, TopologyError> {
        let mut stages = Vec::new();
        let mut tables: IndexMap<String, TableMode> = IndexMap::new();
        let mut stage_names = IndexSet::new();

        for (key, entity) in &config.entities {
            ensure!(
                stage_names.insert(key.id().to_string()),
                DuplicateNameSnafu {
                    kind: "stage",
                    name: key.id()
                }
            );
            let table = entity.table_name(key);
            let mode = match &entity.merge {
                MergeConfig::Append => TableMode::Append,
                MergeConfig::Cdc { keys, .. } => TableMode::Upsert { keys: keys.clone() },
            };
            ensure!(
                tables.insert(table.clone(), mode).is_none(),
                DuplicateNameSnafu {
                    kind: "table",
                    name: table
                }
            );
            stages.push(StageNode {
                name: key.id().to_string(),
                kind: StageKind::Entity {
                    source: entity.source.path.clone(),
                },
                reads: Vec::new(),
                writes: table,
            });
        }

        for (key, view) in &config.views {
            ensure!(
                stage_names.insert(key.id().to_string()),
                DuplicateNameSnafu {
                    kind: "stage",
                    name: key.id()
                }
            );
            let table = view.table_name(key);
            ensure!(
                tables
                    .insert(
                        table.clone(),
                        TableMode::Upsert {
                            keys: view.fact.key.clone()
                        }
                    )
                    .is_none(),
                DuplicateNameSnafu {
                    kind: "table",
                    name: table
                }
            );

            let mut reads = vec![view.fact.table.clone()];
            for dimension in &view.dimensions {
                ensure!(
                    !reads.contains(&dimension.table),
                    DuplicateNameSnafu {
                        kind: "view input",
                        name: &dimension.table
                    }
                );
                reads.push(dimension.table.clone());
            }
            stages.push(StageNode {
                name: key.id().to_string(),
                kind: StageKind::View,
                reads,
                writes: table,
            });
        }

        for stage in &stages {
            for input in &stage.reads {
                ensure!(
                    tables.contains_key(input),
                    UnknownTableSnafu {
                        stage: &stage.name,
                        table: input
                    }
                );
            }
        }

        for (key, view) in &config.views {
            for dimension in &view.dimensions {
                let keyed_on_column = matches!(
                    tables.get(&dimension.table),
                    Some(TableMode::Upsert { keys }) if keys.len() == 1 && keys[0] == dimension.on
                );
                ensure!(
                    keyed_on_column,
                    InvalidDimensionSnafu {
                        view: key.id(),
                        table: &dimension.table,
                        column: &dimension.on
                    }
                );
            }
        }

        let stages = dependency_order(stages)?;
        Ok(Self { stages, tables })
    }

    /// Stages with every producer before its consumers.
    pub fn stages(&self) -> &[StageNode] {
        &self.stages
    }

    pub fn tables(&self) -> &IndexMap<String, TableMode> {
        &self.tables
    }

    /// Human-readable rendering for `--dry-run`.
    pub fn describe(&self) -> String {
        let mut lines = Vec::with_capacity(self.stages.len());
        for stage in &self.stages {
            let inputs = match &stage.kind {
                StageKind::Entity { source } => source.clone(),
                StageKind::View => stage.reads.join(" + "),
            };
            let mode = match self.tables.get(&stage.writes) {
                Some(TableMode::Upsert { keys }) => format!("upsert by {}", keys.join(", ")),
                _ => "append".to_string(),
            };
            lines.push(format!(
                "{:<12} {} -> {} [{}]\n",
                stage.name, inputs, stage.writes, mode
            ));
        }
        lines.concat()
    }
}

/// Kahn's algorithm over the stage graph.
fn dependency_order(stages: Vec<StageNode>) -> Result<Vec<StageNode>, TopologyError> {
    let producer: IndexMap<&str, usize> = stages
        .iter()
        .enumerate()
        .map(|(i, s)| (s.writes.as_str(), i))
        .collect();

    let mut in_degree = vec![0usize; stages.len()];
    let mut consumers: Vec<Vec<usize>> = vec![Vec::new(); stages.len()];
    for (i, stage) in stages.iter().enumerate() {
        for input in &stage.reads {
            if let Some(&p) = producer.get(input.as_str()) {
                consumers[p].push(i);
                in_degree[i] += 1;
            }
        }
    }

    let mut ready: VecDeque<usize> = (0..stages.len()).filter(|&i| in_degree[i] == 0).collect();
    let mut order = Vec::with_capacity(stages.len());
    while let Some(i) = ready.pop_front() {
        order.push(i);
        for &c in &consumers[i] {
            in_degree[c] -= 1;
            if in_degree[c] == 0 {
                ready.push_back(c);
            }
        }
    }

    if order.len() < stages.len() {
        let stuck: Vec<String> = (0..stages.len())
            .filter(|i| in_degree[*i] > 0)
            .map(|i| stages[i].name.clone())
            .collect();
        return CycleSnafu { stages: stuck }.fail();
    }

    let mut slots: Vec<Option<StageNode>> = stages.into_iter().map(Some).collect();
    Ok(order.into_iter().filter_map(|i| slots[i].take()).collect())
}
