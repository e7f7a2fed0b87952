//! Environment approval policies and external approval records.

use crate::error::{Error, Result};
use crate::ids::{EnvironmentId, ExternalApprovalId, IssueId, PrincipalId, StageId};
use crate::issue::IssueType;
use chrono::{DateTime, Utc};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::str::FromStr;

/// How tasks in an environment leave `PendingApproval`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum ApprovalMode {
    /// The scheduler approves once every check is clean.
    Automatic,
    /// A single authorized actor (or an external approval) approves.
    #[default]
    Manual,
}

impl ApprovalMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            ApprovalMode::Automatic => "automatic",
            ApprovalMode::Manual => "manual",
        }
    }
}

impl FromStr for ApprovalMode {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "automatic" => Ok(ApprovalMode::Automatic),
            "manual" => Ok(ApprovalMode::Manual),
            other => Err(Error::InvalidPayload(format!("unknown approval mode: {other}"))),
        }
    }
}

/// Who may approve tasks of a given issue type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum AssigneeGroupValue {
    #[default]
    WorkspaceOwnerOrDba,
    ProjectOwner,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub struct AssigneeGroup {
    pub issue_type: IssueType,
    pub value: AssigneeGroupValue,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub struct ApprovalPolicy {
    pub environment_id: EnvironmentId,
    pub mode: ApprovalMode,
    #[serde(default)]
    pub assignee_groups: Vec<AssigneeGroup>,
}

impl ApprovalPolicy {
    /// Manual approval by workspace owners and DBAs.
    pub fn manual(environment_id: EnvironmentId) -> Self {
        Self {
            environment_id,
            mode: ApprovalMode::Manual,
            assignee_groups: vec![],
        }
    }

    pub fn automatic(environment_id: EnvironmentId) -> Self {
        Self {
            environment_id,
            mode: ApprovalMode::Automatic,
            assignee_groups: vec![],
        }
    }

    pub fn is_automatic(&self) -> bool {
        self.mode == ApprovalMode::Automatic
    }

    pub fn assignee_group(&self, issue_type: IssueType) -> AssigneeGroupValue {
        self.assignee_groups
            .iter()
            .find(|g| g.issue_type == issue_type)
            .map(|g| g.value)
            .unwrap_or_default()
    }
}

/// State of an approval instance on the provider side.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum ExternalApprovalStatus {
    Pending,
    Approved,
    Rejected,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum CancelReason {
    General,
    Reassigned,
    NoTaskPendingApproval,
    IssueNotOpen,
    SqlModified,
}

impl CancelReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            CancelReason::General => "general",
            CancelReason::Reassigned => "reassigned",
            CancelReason::NoTaskPendingApproval => "no_task_pending_approval",
            CancelReason::IssueNotOpen => "issue_not_open",
            CancelReason::SqlModified => "sql_modified",
        }
    }

    /// Human-readable explanation shown on the provider side.
    pub fn message(&self) -> &'static str {
        match self {
            CancelReason::General => "The approval request was canceled.",
            CancelReason::Reassigned => "The issue was reassigned to another approver.",
            CancelReason::NoTaskPendingApproval => "No task is waiting for approval anymore.",
            CancelReason::IssueNotOpen => "The issue is no longer open.",
            CancelReason::SqlModified => "The SQL statement was modified.",
        }
    }
}

impl FromStr for CancelReason {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "general" => Ok(CancelReason::General),
            "reassigned" => Ok(CancelReason::Reassigned),
            "no_task_pending_approval" => Ok(CancelReason::NoTaskPendingApproval),
            "issue_not_open" => Ok(CancelReason::IssueNotOpen),
            "sql_modified" => Ok(CancelReason::SqlModified),
            other => Err(Error::InvalidPayload(format!("unknown cancel reason: {other}"))),
        }
    }
}

/// The issue/stage/assignee snapshot an approval request was made for.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ExternalApprovalPayload {
    pub stage_id: StageId,
    pub assignee_id: PrincipalId,
    pub instance_code: String,
    pub requester_id: PrincipalId,
    #[serde(default)]
    pub rejected: bool,
}

/// A live (non-archived) approval request. At most one exists per issue.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct ExternalApproval {
    pub id: ExternalApprovalId,
    pub issue_id: IssueId,
    pub requester_id: PrincipalId,
    pub approver_id: PrincipalId,
    pub payload: ExternalApprovalPayload,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct ExternalApprovalCreate {
    pub issue_id: IssueId,
    pub requester_id: PrincipalId,
    pub approver_id: PrincipalId,
    pub payload: ExternalApprovalPayload,
}

/// What the provider shows the approver.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApprovalRequest {
    pub issue_name: String,
    pub stage_name: String,
    pub requester_email: String,
    pub approver_email: String,
    pub tasks: Vec<ApprovalTaskSummary>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApprovalTaskSummary {
    pub name: String,
    pub statement: Option<String>,
}
