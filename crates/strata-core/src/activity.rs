//! Activities, inbox entries and project webhooks.

use crate::error::{Error, Result};
use crate::ids::{ActivityId, PrincipalId, ProjectId, TaskId, WebhookId};
use crate::issue::{Issue, IssueStatus};
use crate::task::TaskStatus;
use chrono::{DateTime, Utc};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::str::FromStr;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, JsonSchema)]
pub enum ActivityType {
    #[serde(rename = "issue.create")]
    IssueCreate,
    #[serde(rename = "issue.status.update")]
    IssueStatusUpdate,
    #[serde(rename = "issue.comment.create")]
    IssueCommentCreate,
    #[serde(rename = "issue.field.update")]
    IssueFieldUpdate,
    #[serde(rename = "pipeline.task.status.update")]
    TaskStatusUpdate,
    #[serde(rename = "pipeline.task.check.status.update")]
    TaskCheckRunStatusUpdate,
}

impl ActivityType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ActivityType::IssueCreate => "issue.create",
            ActivityType::IssueStatusUpdate => "issue.status.update",
            ActivityType::IssueCommentCreate => "issue.comment.create",
            ActivityType::IssueFieldUpdate => "issue.field.update",
            ActivityType::TaskStatusUpdate => "pipeline.task.status.update",
            ActivityType::TaskCheckRunStatusUpdate => "pipeline.task.check.status.update",
        }
    }
}

impl FromStr for ActivityType {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        [
            ActivityType::IssueCreate,
            ActivityType::IssueStatusUpdate,
            ActivityType::IssueCommentCreate,
            ActivityType::IssueFieldUpdate,
            ActivityType::TaskStatusUpdate,
            ActivityType::TaskCheckRunStatusUpdate,
        ]
        .into_iter()
        .find(|t| t.as_str() == s)
        .ok_or_else(|| Error::InvalidPayload(format!("unknown activity type: {s}")))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum ActivityLevel {
    Info,
    Warn,
    Error,
}

impl ActivityLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            ActivityLevel::Info => "info",
            ActivityLevel::Warn => "warn",
            ActivityLevel::Error => "error",
        }
    }
}

impl FromStr for ActivityLevel {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "info" => Ok(ActivityLevel::Info),
            "warn" => Ok(ActivityLevel::Warn),
            "error" => Ok(ActivityLevel::Error),
            other => Err(Error::InvalidPayload(format!("unknown activity level: {other}"))),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct Activity {
    pub id: ActivityId,
    pub creator_id: PrincipalId,
    /// The issue id for issue activities, the pipeline id for task activities.
    pub container_id: Uuid,
    pub activity_type: ActivityType,
    pub level: ActivityLevel,
    pub comment: String,
    pub payload: serde_json::Value,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct ActivityCreate {
    pub creator_id: PrincipalId,
    pub container_id: Uuid,
    pub activity_type: ActivityType,
    pub level: ActivityLevel,
    pub comment: String,
    pub payload: serde_json::Value,
}

/// Context passed along with an activity so the sink can fan it out.
#[derive(Debug, Clone, Default)]
pub struct ActivityMeta {
    pub issue: Option<Issue>,
}

impl ActivityMeta {
    pub fn issue(issue: Issue) -> Self {
        Self { issue: Some(issue) }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct TaskStatusUpdatePayload {
    pub task_id: TaskId,
    pub old_status: TaskStatus,
    pub new_status: TaskStatus,
    pub issue_name: String,
    pub task_name: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct IssueStatusUpdatePayload {
    pub old_status: IssueStatus,
    pub new_status: IssueStatus,
    pub issue_name: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct InboxEntry {
    pub receiver_id: PrincipalId,
    pub activity_id: ActivityId,
    pub read: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum WebhookKind {
    Slack,
    Discord,
    Generic,
}

impl WebhookKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            WebhookKind::Slack => "slack",
            WebhookKind::Discord => "discord",
            WebhookKind::Generic => "generic",
        }
    }
}

impl FromStr for WebhookKind {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "slack" => Ok(WebhookKind::Slack),
            "discord" => Ok(WebhookKind::Discord),
            "generic" => Ok(WebhookKind::Generic),
            other => Err(Error::InvalidPayload(format!("unknown webhook kind: {other}"))),
        }
    }
}

/// An outbound endpoint subscribed to a project's activities.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct Webhook {
    pub id: WebhookId,
    pub project_id: ProjectId,
    pub name: String,
    pub kind: WebhookKind,
    pub url: String,
    pub activity_types: Vec<ActivityType>,
}

impl Webhook {
    pub fn subscribes_to(&self, activity_type: ActivityType) -> bool {
        self.activity_types.contains(&activity_type)
    }
}
