//! Instances, databases and backups. Tasks reference these by id; they are
//! looked up, never owned.

use crate::error::{Error, Result};
use crate::ids::{BackupId, DatabaseId, EnvironmentId, InstanceId, ProjectId};
use chrono::{DateTime, Utc};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::str::FromStr;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum Engine {
    Postgres,
    Mysql,
    Tidb,
    Clickhouse,
    Snowflake,
}

impl Engine {
    pub fn as_str(&self) -> &'static str {
        match self {
            Engine::Postgres => "postgres",
            Engine::Mysql => "mysql",
            Engine::Tidb => "tidb",
            Engine::Clickhouse => "clickhouse",
            Engine::Snowflake => "snowflake",
        }
    }

    pub fn supports_syntax_check(&self) -> bool {
        matches!(self, Engine::Postgres | Engine::Mysql | Engine::Tidb)
    }

    pub fn supports_sql_review(&self) -> bool {
        matches!(self, Engine::Postgres | Engine::Mysql | Engine::Tidb)
    }

    pub fn supports_statement_type_check(&self) -> bool {
        matches!(self, Engine::Postgres)
    }

    /// Engines with binlog-based point-in-time recovery.
    pub fn supports_pitr(&self) -> bool {
        matches!(self, Engine::Mysql)
    }
}

impl FromStr for Engine {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "postgres" => Ok(Engine::Postgres),
            "mysql" => Ok(Engine::Mysql),
            "tidb" => Ok(Engine::Tidb),
            "clickhouse" => Ok(Engine::Clickhouse),
            "snowflake" => Ok(Engine::Snowflake),
            other => Err(Error::InvalidPayload(format!("unknown engine: {other}"))),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct Instance {
    pub id: InstanceId,
    pub environment_id: EnvironmentId,
    pub name: String,
    pub engine: Engine,
    pub host: String,
    pub port: u16,
    pub username: String,
    #[serde(skip_serializing, default)]
    pub password: String,
    pub archived: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct Database {
    pub id: DatabaseId,
    pub instance_id: InstanceId,
    pub project_id: ProjectId,
    pub name: String,
    pub schema_version: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Insert-or-update keyed by (instance, name).
#[derive(Debug, Clone)]
pub struct DatabaseUpsert {
    pub instance_id: InstanceId,
    pub project_id: ProjectId,
    pub name: String,
    pub schema_version: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum BackupStatus {
    PendingCreate,
    Done,
    Failed,
}

impl BackupStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            BackupStatus::PendingCreate => "pending_create",
            BackupStatus::Done => "done",
            BackupStatus::Failed => "failed",
        }
    }
}

impl FromStr for BackupStatus {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "pending_create" => Ok(BackupStatus::PendingCreate),
            "done" => Ok(BackupStatus::Done),
            "failed" => Ok(BackupStatus::Failed),
            other => Err(Error::InvalidPayload(format!("unknown backup status: {other}"))),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct Backup {
    pub id: BackupId,
    pub database_id: DatabaseId,
    pub name: String,
    pub status: BackupStatus,
    /// Location of the dump, relative to the configured backup directory.
    pub storage_path: String,
    pub size_bytes: Option<u64>,
    pub comment: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct BackupCreate {
    pub database_id: DatabaseId,
    pub name: String,
    pub storage_path: String,
}

#[derive(Debug, Clone)]
pub struct BackupPatch {
    pub id: BackupId,
    pub status: BackupStatus,
    pub size_bytes: Option<u64>,
    pub comment: Option<String>,
}
