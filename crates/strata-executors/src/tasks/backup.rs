use crate::deps::ExecutorDeps;
use crate::driver::{DriverError, MigrationInfo, MigrationKind, default_migration_version};
use async_trait::async_trait;
use std::sync::Arc;
use strata_core::instance::{Backup, BackupPatch, BackupStatus, DatabaseUpsert};
use strata_core::payload::{BackupPayload, RestorePayload};
use strata_core::task::{Task, TaskRunResult};
use strata_scheduler::{ExecutionContext, ExecutorError, RunOnce, TaskExecutor};
use tracing::{error, info};

/// Dumps a database into the backup directory.
pub struct BackupExecutor {
    deps: Arc<ExecutorDeps>,
}

impl BackupExecutor {
    pub fn new(deps: Arc<ExecutorDeps>) -> Self {
        Self { deps }
    }

    async fn dump(&self, backup: &Backup) -> Result<u64, ExecutorError> {
        let database = self
            .deps
            .store
            .get_database(backup.database_id)
            .await?
            .ok_or_else(|| ExecutorError::NotFound(format!("database {}", backup.database_id)))?;
        let instance = self.deps.instance(database.instance_id).await?;
        let driver = self.deps.driver(&instance).await?;

        let path = self.deps.backup_path(backup);
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(DriverError::from)?;
        }
        Ok(driver.dump(&database.name, &path).await?)
    }
}

#[async_trait]
impl TaskExecutor for BackupExecutor {
    async fn run_once(&self, _ctx: &ExecutionContext, task: &Task) -> Result<RunOnce, ExecutorError> {
        let payload: BackupPayload = task.payload()?;
        let backup = self.deps.backup(payload.backup_id).await?;
        if backup.status == BackupStatus::Done {
            return Ok(RunOnce::Completed(TaskRunResult::detail(format!(
                "Backup {} already taken",
                backup.name
            ))));
        }

        match self.dump(&backup).await {
            Ok(size) => {
                self.deps
                    .store
                    .patch_backup(BackupPatch {
                        id: backup.id,
                        status: BackupStatus::Done,
                        size_bytes: Some(size),
                        comment: None,
                    })
                    .await?;
                info!(task_id = %task.id, backup = %backup.name, size, "Backup taken");
                Ok(RunOnce::Completed(TaskRunResult::detail(format!(
                    "Took backup {} ({size} bytes)",
                    backup.name
                ))))
            }
            Err(e) => {
                error!(task_id = %task.id, backup = %backup.name, error = %e, "Backup failed");
                self.deps
                    .store
                    .patch_backup(BackupPatch {
                        id: backup.id,
                        status: BackupStatus::Failed,
                        size_bytes: None,
                        comment: Some(e.to_string()),
                    })
                    .await?;
                Err(e)
            }
        }
    }
}

/// Restores a backup into a new database on the task's instance.
pub struct RestoreExecutor {
    deps: Arc<ExecutorDeps>,
}

impl RestoreExecutor {
    pub fn new(deps: Arc<ExecutorDeps>) -> Self {
        Self { deps }
    }
}

#[async_trait]
impl TaskExecutor for RestoreExecutor {
    async fn run_once(&self, _ctx: &ExecutionContext, task: &Task) -> Result<RunOnce, ExecutorError> {
        let payload: RestorePayload = task.payload()?;
        let backup = self.deps.backup(payload.backup_id).await?;
        if backup.status != BackupStatus::Done {
            return Err(ExecutorError::Other(format!(
                "backup {} is {}, not done",
                backup.name,
                backup.status.as_str()
            )));
        }
        let source = self
            .deps
            .store
            .get_database(backup.database_id)
            .await?
            .ok_or_else(|| ExecutorError::NotFound(format!("database {}", backup.database_id)))?;
        let instance = self.deps.instance(task.instance_id).await?;
        let driver = self.deps.driver(&instance).await?;
        let target = payload.target_database_name;

        // Tied to the task so a rerun recognises its own restore.
        let version = default_migration_version(task.created_at);
        let restored = driver.database_exists(&target).await?
            && driver
                .find_migration(&target, &version)
                .await?
                .is_some_and(|r| r.task_id == task.id);

        let record = if restored {
            info!(task_id = %task.id, database = %target, "Restore already finished");
            driver.find_migration(&target, &version).await?
        } else {
            match driver.create_database(&target, "").await {
                Ok(()) | Err(DriverError::AlreadyExists(_)) => {}
                Err(e) => return Err(e.into()),
            }
            driver.restore(&target, &self.deps.backup_path(&backup)).await?;
            let info = MigrationInfo {
                database: target.clone(),
                version,
                kind: MigrationKind::Branch,
                description: format!("Restored from backup {} of {}", backup.name, source.name),
                task_id: task.id,
                creator_id: task.creator_id,
            };
            Some(driver.execute_migration(&info, "").await?)
        };

        self.deps
            .store
            .upsert_database(DatabaseUpsert {
                instance_id: instance.id,
                project_id: source.project_id,
                name: target.clone(),
                schema_version: source.schema_version.clone(),
            })
            .await?;

        Ok(RunOnce::Completed(TaskRunResult {
            detail: format!("Restored backup {} into {target}", backup.name),
            change_history_id: record.as_ref().map(|r| r.id.clone()),
            version: record.map(|r| r.version),
        }))
    }
}
