//! Typed task payloads.
//!
//! Tasks persist their payload as an opaque JSON document. [`TaskPayload`] is the
//! tagged form used when creating tasks; executors decode only the variant they
//! own via [`crate::task::Task::payload`].

use crate::error::{Error, Result};
use crate::ids::{BackupId, DatabaseId, InstanceId, ProjectId};
use crate::task::TaskType;
use chrono::{DateTime, TimeZone, Utc};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct DatabaseCreatePayload {
    pub project_id: ProjectId,
    pub database_name: String,
    pub statement: String,
    #[serde(default)]
    pub character_set: Option<String>,
    #[serde(default)]
    pub collation: Option<String>,
    #[serde(default)]
    pub schema_version: Option<String>,
    #[serde(default)]
    pub labels: BTreeMap<String, String>,
}

/// Payload shared by schema-update and data-update tasks.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct MigrationPayload {
    pub statement: String,
    #[serde(default)]
    pub rollback_statement: Option<String>,
    pub schema_version: String,
    #[serde(default)]
    pub vcs_push_event: Option<serde_json::Value>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct GhostSyncPayload {
    pub statement: String,
    pub schema_version: String,
    pub table_name: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct GhostCutoverPayload {}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct GhostDropOriginalTablePayload {
    pub database_name: String,
    pub table_name: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct BackupPayload {
    pub backup_id: BackupId,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct RestorePayload {
    pub backup_id: BackupId,
    pub target_database_name: String,
}

/// Either `backup_id` (restore a backup) or `point_in_time_ts` (backup + binlog
/// replay up to the given unix timestamp); exactly one must be set.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct PitrRestorePayload {
    pub project_id: ProjectId,
    pub database_id: DatabaseId,
    #[serde(default)]
    pub backup_id: Option<BackupId>,
    #[serde(default)]
    pub point_in_time_ts: Option<i64>,
    /// Restore into a new database on this instance instead of in place.
    #[serde(default)]
    pub target_instance_id: Option<InstanceId>,
    #[serde(default)]
    pub target_database_name: Option<String>,
}

impl PitrRestorePayload {
    pub fn validate(&self) -> Result<()> {
        match (self.backup_id, self.point_in_time_ts) {
            (Some(_), None) | (None, Some(_)) => Ok(()),
            _ => Err(Error::InvalidPayload(
                "exactly one of backupId and pointInTimeTs must be set".to_string(),
            )),
        }
    }

    pub fn point_in_time(&self) -> Option<DateTime<Utc>> {
        self.point_in_time_ts
            .and_then(|ts| Utc.timestamp_opt(ts, 0).single())
    }

    /// In-place restores are followed by a cutover task.
    pub fn is_in_place(&self) -> bool {
        self.target_database_name.is_none()
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct PitrCutoverPayload {}

/// One variant per [`TaskType`].
#[derive(Debug, Clone, PartialEq)]
pub enum TaskPayload {
    General,
    DatabaseCreate(DatabaseCreatePayload),
    SchemaUpdate(MigrationPayload),
    SchemaUpdateGhostSync(GhostSyncPayload),
    SchemaUpdateGhostCutover(GhostCutoverPayload),
    SchemaUpdateGhostDropOriginalTable(GhostDropOriginalTablePayload),
    DataUpdate(MigrationPayload),
    DatabaseBackup(BackupPayload),
    DatabaseRestore(RestorePayload),
    PitrRestore(PitrRestorePayload),
    PitrCutover(PitrCutoverPayload),
}

impl TaskPayload {
    pub fn task_type(&self) -> TaskType {
        match self {
            TaskPayload::General => TaskType::General,
            TaskPayload::DatabaseCreate(_) => TaskType::DatabaseCreate,
            TaskPayload::SchemaUpdate(_) => TaskType::SchemaUpdate,
            TaskPayload::SchemaUpdateGhostSync(_) => TaskType::SchemaUpdateGhostSync,
            TaskPayload::SchemaUpdateGhostCutover(_) => TaskType::SchemaUpdateGhostCutover,
            TaskPayload::SchemaUpdateGhostDropOriginalTable(_) => {
                TaskType::SchemaUpdateGhostDropOriginalTable
            }
            TaskPayload::DataUpdate(_) => TaskType::DataUpdate,
            TaskPayload::DatabaseBackup(_) => TaskType::DatabaseBackup,
            TaskPayload::DatabaseRestore(_) => TaskType::DatabaseRestore,
            TaskPayload::PitrRestore(_) => TaskType::PitrRestore,
            TaskPayload::PitrCutover(_) => TaskType::PitrCutover,
        }
    }

    pub fn into_value(self) -> Result<serde_json::Value> {
        let value = match self {
            TaskPayload::General => serde_json::json!({}),
            TaskPayload::DatabaseCreate(p) => serde_json::to_value(p)?,
            TaskPayload::SchemaUpdate(p) | TaskPayload::DataUpdate(p) => serde_json::to_value(p)?,
            TaskPayload::SchemaUpdateGhostSync(p) => serde_json::to_value(p)?,
            TaskPayload::SchemaUpdateGhostCutover(p) => serde_json::to_value(p)?,
            TaskPayload::SchemaUpdateGhostDropOriginalTable(p) => serde_json::to_value(p)?,
            TaskPayload::DatabaseBackup(p) => serde_json::to_value(p)?,
            TaskPayload::DatabaseRestore(p) => serde_json::to_value(p)?,
            TaskPayload::PitrRestore(p) => {
                p.validate()?;
                serde_json::to_value(p)?
            }
            TaskPayload::PitrCutover(p) => serde_json::to_value(p)?,
        };
        Ok(value)
    }

    /// Decode a stored payload using the task type as the tag.
    pub fn decode(task_type: TaskType, value: &serde_json::Value) -> Result<Self> {
        fn from<T: serde::de::DeserializeOwned>(value: &serde_json::Value) -> Result<T> {
            serde_json::from_value(value.clone()).map_err(|e| Error::InvalidPayload(e.to_string()))
        }

        Ok(match task_type {
            TaskType::General => TaskPayload::General,
            TaskType::DatabaseCreate => TaskPayload::DatabaseCreate(from(value)?),
            TaskType::SchemaUpdate => TaskPayload::SchemaUpdate(from(value)?),
            TaskType::SchemaUpdateGhostSync => TaskPayload::SchemaUpdateGhostSync(from(value)?),
            TaskType::SchemaUpdateGhostCutover => {
                TaskPayload::SchemaUpdateGhostCutover(from(value)?)
            }
            TaskType::SchemaUpdateGhostDropOriginalTable => {
                TaskPayload::SchemaUpdateGhostDropOriginalTable(from(value)?)
            }
            TaskType::DataUpdate => TaskPayload::DataUpdate(from(value)?),
            TaskType::DatabaseBackup => TaskPayload::DatabaseBackup(from(value)?),
            TaskType::DatabaseRestore => TaskPayload::DatabaseRestore(from(value)?),
            TaskType::PitrRestore => {
                let payload: PitrRestorePayload = from(value)?;
                payload.validate()?;
                TaskPayload::PitrRestore(payload)
            }
            TaskType::PitrCutover => TaskPayload::PitrCutover(from(value)?),
        })
    }

    /// The SQL statement the task applies, if any.
    pub fn statement(&self) -> Option<&str> {
        match self {
            TaskPayload::DatabaseCreate(p) => Some(&p.statement),
            TaskPayload::SchemaUpdate(p) | TaskPayload::DataUpdate(p) => Some(&p.statement),
            TaskPayload::SchemaUpdateGhostSync(p) => Some(&p.statement),
            _ => None,
        }
    }
}
