//! Tasks, their status machine and run results.

use crate::error::{Error, Result};
use crate::ids::{DatabaseId, InstanceId, PipelineId, PrincipalId, StageId, TaskId};
use crate::payload::TaskPayload;
use chrono::{DateTime, Utc};
use schemars::JsonSchema;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// The closed set of operations a task can perform.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, JsonSchema)]
pub enum TaskType {
    #[serde(rename = "general")]
    General,
    #[serde(rename = "database.create")]
    DatabaseCreate,
    #[serde(rename = "database.schema.update")]
    SchemaUpdate,
    #[serde(rename = "database.schema.update.ghost.sync")]
    SchemaUpdateGhostSync,
    #[serde(rename = "database.schema.update.ghost.cutover")]
    SchemaUpdateGhostCutover,
    #[serde(rename = "database.schema.update.ghost.drop-original-table")]
    SchemaUpdateGhostDropOriginalTable,
    #[serde(rename = "database.data.update")]
    DataUpdate,
    #[serde(rename = "database.backup")]
    DatabaseBackup,
    #[serde(rename = "database.restore")]
    DatabaseRestore,
    #[serde(rename = "database.pitr.restore")]
    PitrRestore,
    #[serde(rename = "database.pitr.cutover")]
    PitrCutover,
}

impl TaskType {
    pub const ALL: [TaskType; 11] = [
        TaskType::General,
        TaskType::DatabaseCreate,
        TaskType::SchemaUpdate,
        TaskType::SchemaUpdateGhostSync,
        TaskType::SchemaUpdateGhostCutover,
        TaskType::SchemaUpdateGhostDropOriginalTable,
        TaskType::DataUpdate,
        TaskType::DatabaseBackup,
        TaskType::DatabaseRestore,
        TaskType::PitrRestore,
        TaskType::PitrCutover,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            TaskType::General => "general",
            TaskType::DatabaseCreate => "database.create",
            TaskType::SchemaUpdate => "database.schema.update",
            TaskType::SchemaUpdateGhostSync => "database.schema.update.ghost.sync",
            TaskType::SchemaUpdateGhostCutover => "database.schema.update.ghost.cutover",
            TaskType::SchemaUpdateGhostDropOriginalTable => {
                "database.schema.update.ghost.drop-original-table"
            }
            TaskType::DataUpdate => "database.data.update",
            TaskType::DatabaseBackup => "database.backup",
            TaskType::DatabaseRestore => "database.restore",
            TaskType::PitrRestore => "database.pitr.restore",
            TaskType::PitrCutover => "database.pitr.cutover",
        }
    }

    /// Task types whose executor applies a SQL statement to the target database.
    pub fn carries_statement(&self) -> bool {
        matches!(
            self,
            TaskType::SchemaUpdate | TaskType::SchemaUpdateGhostSync | TaskType::DataUpdate
        )
    }
}

impl fmt::Display for TaskType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TaskType {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        TaskType::ALL
            .into_iter()
            .find(|t| t.as_str() == s)
            .ok_or_else(|| Error::InvalidPayload(format!("unknown task type: {s}")))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    PendingApproval,
    Pending,
    Running,
    Done,
    Failed,
    Canceled,
}

impl TaskStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskStatus::PendingApproval => "pending_approval",
            TaskStatus::Pending => "pending",
            TaskStatus::Running => "running",
            TaskStatus::Done => "done",
            TaskStatus::Failed => "failed",
            TaskStatus::Canceled => "canceled",
        }
    }

    /// Done is the only status without outgoing transitions. Failed and Canceled
    /// tasks can be re-submitted, so they still hold their stage open.
    pub fn is_terminal(&self) -> bool {
        matches!(self, TaskStatus::Done)
    }

    pub fn can_transition_to(&self, next: TaskStatus) -> bool {
        use TaskStatus::*;
        match self {
            PendingApproval => matches!(next, Pending),
            Pending => matches!(next, Running | PendingApproval | Canceled),
            Running => matches!(next, Done | Failed | Canceled),
            Done => false,
            Failed => matches!(next, Pending | PendingApproval),
            Canceled => matches!(next, Pending | PendingApproval),
        }
    }

    /// Validates `self -> next`. A same-status patch is accepted as a no-op.
    pub fn check_transition(&self, next: TaskStatus) -> Result<()> {
        if *self == next || self.can_transition_to(next) {
            Ok(())
        } else {
            Err(Error::InvalidStatusTransition {
                from: *self,
                to: next,
            })
        }
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TaskStatus {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "pending_approval" => Ok(TaskStatus::PendingApproval),
            "pending" => Ok(TaskStatus::Pending),
            "running" => Ok(TaskStatus::Running),
            "done" => Ok(TaskStatus::Done),
            "failed" => Ok(TaskStatus::Failed),
            "canceled" => Ok(TaskStatus::Canceled),
            other => Err(Error::InvalidPayload(format!("unknown task status: {other}"))),
        }
    }
}

/// What an executor reports for a finished run.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub struct TaskRunResult {
    pub detail: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub change_history_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,
}

impl TaskRunResult {
    pub fn detail(detail: impl Into<String>) -> Self {
        Self {
            detail: detail.into(),
            ..Default::default()
        }
    }
}

/// Granular progress of a long-running executor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub struct Progress {
    pub total_unit: u64,
    pub completed_unit: u64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Progress {
    pub fn new(total_unit: u64) -> Self {
        let now = Utc::now();
        Self {
            total_unit,
            completed_unit: 0,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn advance(&mut self, completed_unit: u64) {
        self.completed_unit = completed_unit.min(self.total_unit);
        self.updated_at = Utc::now();
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct Task {
    pub id: TaskId,
    pub pipeline_id: PipelineId,
    pub stage_id: StageId,
    pub name: String,
    pub task_type: TaskType,
    pub status: TaskStatus,
    pub instance_id: InstanceId,
    pub database_id: Option<DatabaseId>,
    /// Type-specific parameters; decoded by the executor bound to `task_type`.
    pub payload: serde_json::Value,
    pub earliest_allowed_at: Option<DateTime<Utc>>,
    /// Tasks that must be Done before this one may run.
    pub blocked_by: Vec<TaskId>,
    pub result: Option<TaskRunResult>,
    pub creator_id: PrincipalId,
    pub updater_id: PrincipalId,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Task {
    /// Decode the payload into the shape the executor expects.
    pub fn payload<T: DeserializeOwned>(&self) -> Result<T> {
        serde_json::from_value(self.payload.clone()).map_err(|e| {
            Error::InvalidPayload(format!("task {} ({}): {}", self.id, self.task_type, e))
        })
    }

    /// Whether the scheduled execution floor has passed at `now`.
    pub fn is_time_allowed(&self, now: DateTime<Utc>) -> bool {
        self.earliest_allowed_at.is_none_or(|at| at <= now)
    }
}

/// A task to be materialized as part of a pipeline.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskCreate {
    pub name: String,
    pub task_type: TaskType,
    pub status: TaskStatus,
    pub instance_id: InstanceId,
    pub database_id: Option<DatabaseId>,
    pub payload: serde_json::Value,
    pub earliest_allowed_at: Option<DateTime<Utc>>,
}

impl TaskCreate {
    /// New tasks wait for approval; the task type follows from the payload variant.
    pub fn new(
        name: impl Into<String>,
        instance_id: InstanceId,
        database_id: Option<DatabaseId>,
        payload: TaskPayload,
    ) -> Result<Self> {
        Ok(Self {
            name: name.into(),
            task_type: payload.task_type(),
            status: TaskStatus::PendingApproval,
            instance_id,
            database_id,
            payload: payload.into_value()?,
            earliest_allowed_at: None,
        })
    }

    pub fn with_status(mut self, status: TaskStatus) -> Self {
        self.status = status;
        self
    }

    pub fn not_before(mut self, at: DateTime<Utc>) -> Self {
        self.earliest_allowed_at = Some(at);
        self
    }
}

/// Filter for listing tasks. Unset fields match everything.
#[derive(Debug, Clone, Default)]
pub struct TaskFind {
    pub ids: Option<Vec<TaskId>>,
    pub pipeline_id: Option<PipelineId>,
    pub stage_id: Option<StageId>,
    pub statuses: Option<Vec<TaskStatus>>,
    pub task_types: Option<Vec<TaskType>>,
}

impl TaskFind {
    pub fn with_status(status: TaskStatus) -> Self {
        Self {
            statuses: Some(vec![status]),
            ..Default::default()
        }
    }

    pub fn matches(&self, task: &Task) -> bool {
        self.ids.as_ref().is_none_or(|ids| ids.contains(&task.id))
            && self.pipeline_id.is_none_or(|id| id == task.pipeline_id)
            && self.stage_id.is_none_or(|id| id == task.stage_id)
            && self
                .statuses
                .as_ref()
                .is_none_or(|s| s.contains(&task.status))
            && self
                .task_types
                .as_ref()
                .is_none_or(|t| t.contains(&task.task_type))
    }
}

/// A conditional status update. Rows whose current status differs from
/// `expected_status` (when set) are left untouched and not returned.
#[derive(Debug, Clone)]
pub struct TaskStatusPatch {
    pub ids: Vec<TaskId>,
    pub updater_id: PrincipalId,
    pub status: TaskStatus,
    pub expected_status: Option<TaskStatus>,
    pub result: Option<TaskRunResult>,
    pub comment: Option<String>,
}

impl TaskStatusPatch {
    pub fn new(ids: Vec<TaskId>, updater_id: PrincipalId, status: TaskStatus) -> Self {
        Self {
            ids,
            updater_id,
            status,
            expected_status: None,
            result: None,
            comment: None,
        }
    }

    pub fn expecting(mut self, status: TaskStatus) -> Self {
        self.expected_status = Some(status);
        self
    }

    pub fn with_result(mut self, result: TaskRunResult) -> Self {
        self.result = Some(result);
        self
    }

    pub fn with_comment(mut self, comment: impl Into<String>) -> Self {
        self.comment = Some(comment.into());
        self
    }
}
