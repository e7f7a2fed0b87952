//! Issues: the change requests that own a pipeline.

use crate::error::{Error, Result};
use crate::ids::{IssueId, PipelineId, PrincipalId, ProjectId};
use chrono::{DateTime, Utc};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::str::FromStr;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum IssueStatus {
    Open,
    Done,
    Canceled,
}

impl IssueStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            IssueStatus::Open => "open",
            IssueStatus::Done => "done",
            IssueStatus::Canceled => "canceled",
        }
    }
}

impl FromStr for IssueStatus {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "open" => Ok(IssueStatus::Open),
            "done" => Ok(IssueStatus::Done),
            "canceled" => Ok(IssueStatus::Canceled),
            other => Err(Error::InvalidPayload(format!("unknown issue status: {other}"))),
        }
    }
}

/// Kind of change. Approval policies pick assignee groups per issue type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum IssueType {
    General,
    DatabaseCreate,
    SchemaUpdate,
    SchemaUpdateGhost,
    DataUpdate,
    DatabaseRestorePitr,
}

impl IssueType {
    pub fn as_str(&self) -> &'static str {
        match self {
            IssueType::General => "general",
            IssueType::DatabaseCreate => "database_create",
            IssueType::SchemaUpdate => "schema_update",
            IssueType::SchemaUpdateGhost => "schema_update_ghost",
            IssueType::DataUpdate => "data_update",
            IssueType::DatabaseRestorePitr => "database_restore_pitr",
        }
    }
}

impl FromStr for IssueType {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "general" => Ok(IssueType::General),
            "database_create" => Ok(IssueType::DatabaseCreate),
            "schema_update" => Ok(IssueType::SchemaUpdate),
            "schema_update_ghost" => Ok(IssueType::SchemaUpdateGhost),
            "data_update" => Ok(IssueType::DataUpdate),
            "database_restore_pitr" => Ok(IssueType::DatabaseRestorePitr),
            other => Err(Error::InvalidPayload(format!("unknown issue type: {other}"))),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct Issue {
    pub id: IssueId,
    pub project_id: ProjectId,
    pub name: String,
    pub issue_type: IssueType,
    pub status: IssueStatus,
    pub creator_id: PrincipalId,
    pub assignee_id: PrincipalId,
    pub pipeline_id: PipelineId,
    pub subscribers: Vec<PrincipalId>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct IssueCreate {
    pub project_id: ProjectId,
    pub name: String,
    pub issue_type: IssueType,
    pub creator_id: PrincipalId,
    pub assignee_id: PrincipalId,
    pub pipeline_id: PipelineId,
    pub subscribers: Vec<PrincipalId>,
}

#[derive(Debug, Clone)]
pub struct IssuePatch {
    pub id: IssueId,
    pub updater_id: PrincipalId,
    pub status: Option<IssueStatus>,
    pub assignee_id: Option<PrincipalId>,
}

impl IssuePatch {
    pub fn status(id: IssueId, updater_id: PrincipalId, status: IssueStatus) -> Self {
        Self {
            id,
            updater_id,
            status: Some(status),
            assignee_id: None,
        }
    }

    pub fn assignee(id: IssueId, updater_id: PrincipalId, assignee_id: PrincipalId) -> Self {
        Self {
            id,
            updater_id,
            status: None,
            assignee_id: Some(assignee_id),
        }
    }
}
