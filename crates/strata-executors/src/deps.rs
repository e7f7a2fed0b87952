//! Collaborators shared by every executor.

use crate::advisor::SqlAdvisor;
use crate::driver::{Driver, DriverFactory};
use crate::ghost::GhostMigrator;
use crate::tasks::pitr::BinlogReplayer;
use std::path::PathBuf;
use std::sync::Arc;
use strata_core::ids::{BackupId, InstanceId};
use strata_core::instance::{Backup, Database, Instance};
use strata_core::ports::Store;
use strata_core::task::Task;
use strata_scheduler::ExecutorError;

pub struct ExecutorDeps {
    pub store: Arc<dyn Store>,
    pub drivers: Arc<dyn DriverFactory>,
    pub advisor: Arc<dyn SqlAdvisor>,
    /// Online schema change tooling; gh-ost tasks fail without it.
    pub ghost: Option<Arc<dyn GhostMigrator>>,
    /// Binlog replay for point-in-time restores.
    pub replayer: Option<Arc<dyn BinlogReplayer>>,
    pub backup_dir: PathBuf,
}

impl ExecutorDeps {
    pub async fn instance(&self, id: InstanceId) -> Result<Instance, ExecutorError> {
        self.store
            .get_instance(id)
            .await?
            .ok_or_else(|| ExecutorError::NotFound(format!("instance {id}")))
    }

    /// The database a task targets.
    pub async fn database(&self, task: &Task) -> Result<Database, ExecutorError> {
        let id = task
            .database_id
            .ok_or_else(|| ExecutorError::InvalidPayload(format!("task {} has no database", task.id)))?;
        self.store
            .get_database(id)
            .await?
            .ok_or_else(|| ExecutorError::NotFound(format!("database {id}")))
    }

    pub async fn backup(&self, id: BackupId) -> Result<Backup, ExecutorError> {
        self.store
            .get_backup(id)
            .await?
            .ok_or_else(|| ExecutorError::NotFound(format!("backup {id}")))
    }

    pub async fn driver(&self, instance: &Instance) -> Result<Box<dyn Driver>, ExecutorError> {
        Ok(self.drivers.connect(instance).await?)
    }

    pub fn backup_path(&self, backup: &Backup) -> PathBuf {
        self.backup_dir.join(&backup.storage_path)
    }
}
