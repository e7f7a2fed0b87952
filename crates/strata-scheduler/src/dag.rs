//! Dependency resolution for the tasks of a stage.
//!
//! Dependencies are resolved before tasks are created: callers build a list of
//! [`TaskCreate`] plus index edges, which the store materializes into each
//! task's `blocked_by`.

use chrono::{DateTime, Utc};
use petgraph::algo::toposort;
use petgraph::graph::{DiGraph, NodeIndex};
use std::collections::BTreeMap;
use strata_core::ids::{DatabaseId, EnvironmentId, InstanceId};
use strata_core::instance::Database;
use strata_core::payload::{
    GhostCutoverPayload, GhostDropOriginalTablePayload, GhostSyncPayload, PitrCutoverPayload,
    PitrRestorePayload, TaskPayload,
};
use strata_core::pipeline::{StageCreate, TaskIndexDag};
use strata_core::task::TaskCreate;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum DagError {
    #[error("Cycle detected in task dependencies")]
    CycleDetected,
    #[error("Dependency {from} -> {to} is out of range for {len} tasks")]
    IndexOutOfRange { from: usize, to: usize, len: usize },
    #[error("Task {0} depends on itself")]
    SelfDependency(usize),
    #[error("Empty stage")]
    EmptyStage,
}

impl From<DagError> for strata_core::Error {
    fn from(err: DagError) -> Self {
        strata_core::Error::InvalidDependency(err.to_string())
    }
}

/// Task dependency graph over indices into a task list.
#[derive(Debug)]
pub struct TaskDag {
    graph: DiGraph<usize, ()>,
}

impl TaskDag {
    pub fn build(len: usize, edges: &[TaskIndexDag]) -> Result<Self, DagError> {
        if len == 0 {
            return Err(DagError::EmptyStage);
        }

        let mut graph = DiGraph::with_capacity(len, edges.len());
        let nodes: Vec<NodeIndex> = (0..len).map(|i| graph.add_node(i)).collect();
        for edge in edges {
            if edge.from >= len || edge.to >= len {
                return Err(DagError::IndexOutOfRange {
                    from: edge.from,
                    to: edge.to,
                    len,
                });
            }
            if edge.from == edge.to {
                return Err(DagError::SelfDependency(edge.from));
            }
            graph.add_edge(nodes[edge.from], nodes[edge.to], ());
        }

        let dag = Self { graph };
        dag.topological_order()?;
        Ok(dag)
    }

    /// Task indices in an order that respects every edge.
    pub fn topological_order(&self) -> Result<Vec<usize>, DagError> {
        toposort(&self.graph, None)
            .map(|indices| indices.iter().map(|&idx| self.graph[idx]).collect())
            .map_err(|_| DagError::CycleDetected)
    }

    /// Indices of tasks that must finish before `index` may run.
    pub fn blockers(&self, index: usize) -> Vec<usize> {
        let mut blockers: Vec<usize> = self
            .graph
            .neighbors_directed(NodeIndex::new(index), petgraph::Direction::Incoming)
            .map(|n| self.graph[n])
            .collect();
        blockers.sort_unstable();
        blockers
    }
}

/// Rejects stages whose dependencies are out of range or cyclic.
pub fn validate_stage(stage: &StageCreate) -> Result<(), DagError> {
    TaskDag::build(stage.tasks.len(), &stage.dependencies).map(|_| ())
}

/// A task definition tagged with the migration version it applies.
#[derive(Debug, Clone)]
pub struct VersionedTask {
    pub task: TaskCreate,
    pub version: String,
}

/// Orders tasks by version within each database and chains them.
///
/// Tasks are grouped by target database (in database id order), sorted by
/// version within each group (stable for equal versions), and every task
/// depends on its predecessor in the same group. Groups are independent.
pub fn order_tasks_by_version(tasks: Vec<VersionedTask>) -> (Vec<TaskCreate>, Vec<TaskIndexDag>) {
    let mut groups: BTreeMap<Option<DatabaseId>, Vec<VersionedTask>> = BTreeMap::new();
    for task in tasks {
        groups.entry(task.task.database_id).or_default().push(task);
    }

    let mut ordered = Vec::new();
    let mut edges = Vec::new();
    for mut group in groups.into_values() {
        group.sort_by(|a, b| a.version.cmp(&b.version));
        let start = ordered.len();
        for (offset, versioned) in group.into_iter().enumerate() {
            if offset > 0 {
                edges.push(TaskIndexDag::new(start + offset - 1, start + offset));
            }
            ordered.push(versioned.task);
        }
    }
    (ordered, edges)
}

/// Tasks of one stage together with their dependency edges.
#[derive(Debug, Clone)]
pub struct StagePlan {
    pub tasks: Vec<TaskCreate>,
    pub dependencies: Vec<TaskIndexDag>,
}

impl StagePlan {
    pub fn into_stage(self, name: impl Into<String>, environment_id: EnvironmentId) -> StageCreate {
        StageCreate {
            name: name.into(),
            environment_id,
            tasks: self.tasks,
            dependencies: self.dependencies,
        }
    }
}

/// gh-ost plan: sync, then cutover, then drop the original table.
pub fn ghost_plan(
    database: &Database,
    sync: GhostSyncPayload,
    earliest_allowed_at: Option<DateTime<Utc>>,
) -> strata_core::Result<StagePlan> {
    let table_name = sync.table_name.clone();
    let mut sync_task = TaskCreate::new(
        format!("Sync data {}", database.name),
        database.instance_id,
        Some(database.id),
        TaskPayload::SchemaUpdateGhostSync(sync),
    )?;
    if let Some(at) = earliest_allowed_at {
        sync_task = sync_task.not_before(at);
    }
    let cutover = TaskCreate::new(
        format!("Switch tables {}", database.name),
        database.instance_id,
        Some(database.id),
        TaskPayload::SchemaUpdateGhostCutover(GhostCutoverPayload {}),
    )?;
    let drop = TaskCreate::new(
        format!("Drop original table {}", table_name),
        database.instance_id,
        Some(database.id),
        TaskPayload::SchemaUpdateGhostDropOriginalTable(GhostDropOriginalTablePayload {
            database_name: database.name.clone(),
            table_name,
        }),
    )?;

    Ok(StagePlan {
        tasks: vec![sync_task, cutover, drop],
        dependencies: vec![TaskIndexDag::new(0, 1), TaskIndexDag::new(1, 2)],
    })
}

/// PITR plan: restore, then cutover when restoring in place.
pub fn pitr_plan(database: &Database, restore: PitrRestorePayload) -> strata_core::Result<StagePlan> {
    let in_place = restore.is_in_place();
    let instance_id: InstanceId = restore.target_instance_id.unwrap_or(database.instance_id);
    let mut tasks = vec![TaskCreate::new(
        format!("Restore to point in time {}", database.name),
        instance_id,
        Some(database.id),
        TaskPayload::PitrRestore(restore),
    )?];
    let mut dependencies = vec![];

    if in_place {
        tasks.push(TaskCreate::new(
            format!("Swap PITR and the original database {}", database.name),
            database.instance_id,
            Some(database.id),
            TaskPayload::PitrCutover(PitrCutoverPayload {}),
        )?);
        dependencies.push(TaskIndexDag::new(0, 1));
    }

    Ok(StagePlan { tasks, dependencies })
}
