//! Pipelines and stages.

use crate::error::{Error, Result};
use crate::ids::{EnvironmentId, PipelineId, PrincipalId, StageId, TaskId};
use crate::task::{Task, TaskCreate, TaskStatus};
use chrono::{DateTime, Utc};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::str::FromStr;

/// Mirrors the status of the owning issue.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum PipelineStatus {
    Open,
    Done,
    Canceled,
}

impl PipelineStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            PipelineStatus::Open => "open",
            PipelineStatus::Done => "done",
            PipelineStatus::Canceled => "canceled",
        }
    }
}

impl FromStr for PipelineStatus {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "open" => Ok(PipelineStatus::Open),
            "done" => Ok(PipelineStatus::Done),
            "canceled" => Ok(PipelineStatus::Canceled),
            other => Err(Error::InvalidPayload(format!("unknown pipeline status: {other}"))),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct Pipeline {
    pub id: PipelineId,
    pub name: String,
    pub status: PipelineStatus,
    /// Ordered by `position`.
    pub stages: Vec<Stage>,
    pub creator_id: PrincipalId,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Pipeline {
    /// The first stage that still has a task other than Done.
    pub fn active_stage(&self) -> Option<&Stage> {
        self.stages.iter().find(|s| !s.is_done())
    }

    pub fn is_done(&self) -> bool {
        self.stages.iter().all(Stage::is_done)
    }

    pub fn stage(&self, id: StageId) -> Option<&Stage> {
        self.stages.iter().find(|s| s.id == id)
    }

    pub fn task(&self, id: TaskId) -> Option<&Task> {
        self.tasks().find(|t| t.id == id)
    }

    pub fn tasks(&self) -> impl Iterator<Item = &Task> {
        self.stages.iter().flat_map(|s| s.tasks.iter())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct Stage {
    pub id: StageId,
    pub pipeline_id: PipelineId,
    pub environment_id: EnvironmentId,
    pub name: String,
    pub position: u32,
    pub tasks: Vec<Task>,
}

impl Stage {
    pub fn is_done(&self) -> bool {
        self.tasks.iter().all(|t| t.status.is_terminal())
    }

    pub fn has_status(&self, status: TaskStatus) -> bool {
        self.tasks.iter().any(|t| t.status == status)
    }
}

/// Dependency edge between two tasks of the same stage create request,
/// by index into its task list.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct TaskIndexDag {
    pub from: usize,
    pub to: usize,
}

impl TaskIndexDag {
    pub fn new(from: usize, to: usize) -> Self {
        Self { from, to }
    }
}

#[derive(Debug, Clone)]
pub struct StageCreate {
    pub name: String,
    pub environment_id: EnvironmentId,
    pub tasks: Vec<TaskCreate>,
    pub dependencies: Vec<TaskIndexDag>,
}

#[derive(Debug, Clone)]
pub struct PipelineCreate {
    pub name: String,
    pub creator_id: PrincipalId,
    pub stages: Vec<StageCreate>,
}

impl PipelineCreate {
    /// Edges must stay inside their stage and reference existing tasks.
    pub fn validate(&self) -> Result<()> {
        for stage in &self.stages {
            let len = stage.tasks.len();
            for edge in &stage.dependencies {
                if edge.from >= len || edge.to >= len || edge.from == edge.to {
                    return Err(Error::InvalidDependency(format!(
                        "edge {} -> {} in stage {} with {} tasks",
                        edge.from, edge.to, stage.name, len
                    )));
                }
            }
        }
        Ok(())
    }

    /// Assign ids and resolve dependency edges into `blocked_by`. Every stored
    /// pipeline goes through here so both stores agree on the layout.
    pub fn materialize(self) -> Result<Pipeline> {
        self.validate()?;

        let id = PipelineId::new();
        let now = Utc::now();
        let mut stages = Vec::with_capacity(self.stages.len());

        for (position, stage) in self.stages.into_iter().enumerate() {
            let stage_id = StageId::new();
            let task_ids: Vec<TaskId> = stage.tasks.iter().map(|_| TaskId::new()).collect();
            let tasks = stage
                .tasks
                .into_iter()
                .enumerate()
                .map(|(i, create)| Task {
                    id: task_ids[i],
                    pipeline_id: id,
                    stage_id,
                    name: create.name,
                    task_type: create.task_type,
                    status: create.status,
                    instance_id: create.instance_id,
                    database_id: create.database_id,
                    payload: create.payload,
                    earliest_allowed_at: create.earliest_allowed_at,
                    blocked_by: stage
                        .dependencies
                        .iter()
                        .filter(|edge| edge.to == i)
                        .map(|edge| task_ids[edge.from])
                        .collect(),
                    result: None,
                    creator_id: self.creator_id,
                    updater_id: self.creator_id,
                    created_at: now,
                    updated_at: now,
                })
                .collect();

            stages.push(Stage {
                id: stage_id,
                pipeline_id: id,
                environment_id: stage.environment_id,
                name: stage.name,
                position: position as u32,
                tasks,
            });
        }

        Ok(Pipeline {
            id,
            name: self.name,
            status: PipelineStatus::Open,
            stages,
            creator_id: self.creator_id,
            created_at: now,
            updated_at: now,
        })
    }
}
