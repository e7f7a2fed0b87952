//! Task check runs and their findings.

use crate::error::{Error, Result};
use crate::ids::{PrincipalId, TaskCheckRunId, TaskId};
use chrono::{DateTime, Utc};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "kebab-case")]
pub enum TaskCheckType {
    StatementSyntax,
    StatementAdvise,
    StatementType,
    DatabaseConnect,
    MigrationSchema,
    Timing,
    GhostDryRun,
    PitrPreflight,
}

impl TaskCheckType {
    pub const ALL: [TaskCheckType; 8] = [
        TaskCheckType::StatementSyntax,
        TaskCheckType::StatementAdvise,
        TaskCheckType::StatementType,
        TaskCheckType::DatabaseConnect,
        TaskCheckType::MigrationSchema,
        TaskCheckType::Timing,
        TaskCheckType::GhostDryRun,
        TaskCheckType::PitrPreflight,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            TaskCheckType::StatementSyntax => "statement-syntax",
            TaskCheckType::StatementAdvise => "statement-advise",
            TaskCheckType::StatementType => "statement-type",
            TaskCheckType::DatabaseConnect => "database-connect",
            TaskCheckType::MigrationSchema => "migration-schema",
            TaskCheckType::Timing => "timing",
            TaskCheckType::GhostDryRun => "ghost-dry-run",
            TaskCheckType::PitrPreflight => "pitr-preflight",
        }
    }
}

impl fmt::Display for TaskCheckType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TaskCheckType {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        TaskCheckType::ALL
            .into_iter()
            .find(|t| t.as_str() == s)
            .ok_or_else(|| Error::InvalidPayload(format!("unknown check type: {s}")))
    }
}

/// Check runs are created already `Running`; the check scheduler picks up every
/// `Running` run and settles it as `Done` or `Failed`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum TaskCheckRunStatus {
    Running,
    Done,
    Failed,
}

impl TaskCheckRunStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskCheckRunStatus::Running => "running",
            TaskCheckRunStatus::Done => "done",
            TaskCheckRunStatus::Failed => "failed",
        }
    }

    pub fn is_terminal(&self) -> bool {
        !matches!(self, TaskCheckRunStatus::Running)
    }
}

impl FromStr for TaskCheckRunStatus {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "running" => Ok(TaskCheckRunStatus::Running),
            "done" => Ok(TaskCheckRunStatus::Done),
            "failed" => Ok(TaskCheckRunStatus::Failed),
            other => Err(Error::InvalidPayload(format!("unknown check status: {other}"))),
        }
    }
}

/// Severity of a finding. Ordered so that `Error < Warn < Success`.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, JsonSchema,
)]
#[serde(rename_all = "snake_case")]
pub enum FindingStatus {
    Error,
    Warn,
    Success,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub struct Finding {
    pub status: FindingStatus,
    pub namespace: String,
    pub code: i32,
    pub title: String,
    pub content: String,
}

impl Finding {
    pub const NAMESPACE: &'static str = "strata";

    pub fn success(title: impl Into<String>) -> Self {
        Self::new(FindingStatus::Success, 0, title, "")
    }

    pub fn warn(code: i32, title: impl Into<String>, content: impl Into<String>) -> Self {
        Self::new(FindingStatus::Warn, code, title, content)
    }

    pub fn error(code: i32, title: impl Into<String>, content: impl Into<String>) -> Self {
        Self::new(FindingStatus::Error, code, title, content)
    }

    fn new(
        status: FindingStatus,
        code: i32,
        title: impl Into<String>,
        content: impl Into<String>,
    ) -> Self {
        Self {
            status,
            namespace: Self::NAMESPACE.to_string(),
            code,
            title: title.into(),
            content: content.into(),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub struct TaskCheckRunResult {
    #[serde(default)]
    pub findings: Vec<Finding>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct TaskCheckRun {
    pub id: TaskCheckRunId,
    pub task_id: TaskId,
    pub check_type: TaskCheckType,
    pub status: TaskCheckRunStatus,
    pub result: TaskCheckRunResult,
    pub comment: Option<String>,
    pub creator_id: PrincipalId,
    pub updater_id: PrincipalId,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl TaskCheckRun {
    /// Done, and no finding is worse than `min`. An empty finding list passes.
    pub fn passes(&self, min: FindingStatus) -> bool {
        self.status == TaskCheckRunStatus::Done
            && self.result.findings.iter().all(|f| f.status >= min)
    }
}

#[derive(Debug, Clone)]
pub struct TaskCheckRunCreate {
    pub task_id: TaskId,
    pub check_type: TaskCheckType,
    pub creator_id: PrincipalId,
}

#[derive(Debug, Clone, Default)]
pub struct TaskCheckRunFind {
    pub task_id: Option<TaskId>,
    pub check_type: Option<TaskCheckType>,
    pub statuses: Option<Vec<TaskCheckRunStatus>>,
}

impl TaskCheckRunFind {
    pub fn for_task(task_id: TaskId) -> Self {
        Self {
            task_id: Some(task_id),
            ..Default::default()
        }
    }

    pub fn with_status(status: TaskCheckRunStatus) -> Self {
        Self {
            statuses: Some(vec![status]),
            ..Default::default()
        }
    }

    pub fn matches(&self, run: &TaskCheckRun) -> bool {
        self.task_id.is_none_or(|id| id == run.task_id)
            && self.check_type.is_none_or(|t| t == run.check_type)
            && self
                .statuses
                .as_ref()
                .is_none_or(|s| s.contains(&run.status))
    }
}

/// Settles a `Running` check run. Ignored if the run is no longer `Running`.
#[derive(Debug, Clone)]
pub struct TaskCheckRunStatusPatch {
    pub id: TaskCheckRunId,
    pub updater_id: PrincipalId,
    pub status: TaskCheckRunStatus,
    pub result: TaskCheckRunResult,
    pub comment: Option<String>,
}

/// Latest run per check type. `runs` must be in creation order, as repositories
/// return them.
pub fn latest_by_type(runs: &[TaskCheckRun]) -> HashMap<TaskCheckType, &TaskCheckRun> {
    let mut latest = HashMap::new();
    for run in runs {
        latest.insert(run.check_type, run);
    }
    latest
}

/// Whether the latest run of every `required` type passes at `min`.
/// A required type that has never run does not pass.
pub fn passes_all(runs: &[TaskCheckRun], required: &[TaskCheckType], min: FindingStatus) -> bool {
    let latest = latest_by_type(runs);
    required
        .iter()
        .all(|t| latest.get(t).is_some_and(|run| run.passes(min)))
}
