//! Ports to the managed database instances.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::path::Path;
use strata_core::ids::{PrincipalId, TaskId};
use strata_core::instance::Instance;
use strata_scheduler::ExecutorError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum DriverError {
    /// The object to create is already there.
    #[error("Already exists: {0}")]
    AlreadyExists(String),

    #[error("Connection error: {0}")]
    Connection(String),

    #[error("Statement error: {0}")]
    Statement(String),

    #[error("Not supported: {0}")]
    NotSupported(String),

    #[error("Tool error: {0}")]
    Tool(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<DriverError> for ExecutorError {
    fn from(err: DriverError) -> Self {
        match err {
            DriverError::NotSupported(msg) => ExecutorError::Unsupported(msg),
            other => ExecutorError::Driver(other.to_string()),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MigrationKind {
    Baseline,
    Migrate,
    Data,
    /// A database created by restoring another database's backup.
    Branch,
}

impl MigrationKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            MigrationKind::Baseline => "BASELINE",
            MigrationKind::Migrate => "MIGRATE",
            MigrationKind::Data => "DATA",
            MigrationKind::Branch => "BRANCH",
        }
    }
}

/// One migration to apply and record.
#[derive(Debug, Clone)]
pub struct MigrationInfo {
    pub database: String,
    pub version: String,
    pub kind: MigrationKind,
    pub description: String,
    pub task_id: TaskId,
    pub creator_id: PrincipalId,
}

/// A row of the migration history kept on the instance.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MigrationRecord {
    pub id: String,
    pub database: String,
    pub version: String,
    pub kind: MigrationKind,
    pub task_id: TaskId,
    pub created_at: DateTime<Utc>,
}

/// Admin connection to one instance.
#[async_trait]
pub trait Driver: Send + Sync {
    async fn ping(&self) -> Result<(), DriverError>;

    async fn database_exists(&self, name: &str) -> Result<bool, DriverError>;

    /// Fails with [`DriverError::AlreadyExists`] when the database is there.
    async fn create_database(&self, name: &str, statement: &str) -> Result<(), DriverError>;

    async fn drop_database_if_exists(&self, name: &str) -> Result<(), DriverError>;

    async fn rename_database(&self, from: &str, to: &str) -> Result<(), DriverError>;

    async fn drop_table_if_exists(&self, database: &str, table: &str) -> Result<(), DriverError>;

    /// Whether migrations can be recorded in `database`: the history table
    /// exists or may be created.
    async fn migration_history_ready(&self, database: &str) -> Result<bool, DriverError>;

    async fn find_migration(
        &self,
        database: &str,
        version: &str,
    ) -> Result<Option<MigrationRecord>, DriverError>;

    /// Applies `statement` to `info.database` and records it in the history.
    /// Fails with [`DriverError::AlreadyExists`] when the version is recorded.
    async fn execute_migration(
        &self,
        info: &MigrationInfo,
        statement: &str,
    ) -> Result<MigrationRecord, DriverError>;

    /// Writes a logical dump of `database` to `path`; returns its size in bytes.
    async fn dump(&self, database: &str, path: &Path) -> Result<u64, DriverError>;

    async fn restore(&self, database: &str, path: &Path) -> Result<(), DriverError>;
}

/// Opens admin connections.
#[async_trait]
pub trait DriverFactory: Send + Sync {
    async fn connect(&self, instance: &Instance) -> Result<Box<dyn Driver>, DriverError>;
}

/// Migration version used when none is supplied, e.g. `20240102150405`.
pub fn default_migration_version(now: DateTime<Utc>) -> String {
    now.format("%Y%m%d%H%M%S").to_string()
}
