//! Point-in-time recovery.
//!
//! A restore task loads a backup into a scratch database (or a new target
//! database) and, for point-in-time requests, replays binlog up to the
//! requested moment. In-place restores are finished by a cutover task that
//! swaps the scratch database in under the original name.

use crate::deps::ExecutorDeps;
use crate::driver::{Driver, DriverError};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::{DashMap, DashSet};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use strata_core::ids::TaskId;
use strata_core::instance::{Backup, BackupStatus, Database, DatabaseUpsert, Instance};
use strata_core::payload::PitrRestorePayload;
use strata_core::task::{Progress, Task, TaskFind, TaskRunResult, TaskType};
use strata_scheduler::{ExecutionContext, ExecutorError, RunOnce, TaskExecutor};
use tracing::{debug, info};

const PROGRESS_INTERVAL: Duration = Duration::from_secs(1);

#[derive(Debug, Clone)]
pub struct ReplayRequest {
    pub instance: Instance,
    pub source_database: String,
    pub target_database: String,
    /// The backup the target was restored from; replay starts where it ends.
    pub backup: Backup,
    pub until: DateTime<Utc>,
}

/// Replays binlog events onto a restored database.
#[async_trait]
pub trait BinlogReplayer: Send + Sync {
    /// Bytes of binlog between the backup and `until`.
    async fn replay_size(&self, request: &ReplayRequest) -> Result<u64, DriverError>;

    /// Replays and bumps `applied` as bytes are consumed.
    async fn replay(&self, request: &ReplayRequest, applied: &AtomicU64) -> Result<(), DriverError>;
}

/// Scratch database an in-place restore writes into.
pub fn pitr_database_name(database: &str, restore_task: &Task) -> String {
    format!("{database}_pitr_{}", restore_task.created_at.timestamp())
}

/// Name the original database is parked under during cutover.
pub fn parked_database_name(database: &str, restore_task: &Task) -> String {
    format!("{database}_del_{}", restore_task.created_at.timestamp())
}

pub struct PitrRestoreExecutor {
    deps: Arc<ExecutorDeps>,
    progress: DashMap<TaskId, Progress>,
    completed: DashSet<TaskId>,
}

impl PitrRestoreExecutor {
    pub fn new(deps: Arc<ExecutorDeps>) -> Self {
        Self {
            deps,
            progress: DashMap::new(),
            completed: DashSet::new(),
        }
    }

    async fn source(&self, payload: &PitrRestorePayload) -> Result<(Database, Instance), ExecutorError> {
        let database = self
            .deps
            .store
            .get_database(payload.database_id)
            .await?
            .ok_or_else(|| ExecutorError::NotFound(format!("database {}", payload.database_id)))?;
        let instance = self.deps.instance(database.instance_id).await?;
        Ok((database, instance))
    }

    /// The requested backup, or the latest finished one taken at or before
    /// `until`.
    async fn pick_backup(
        &self,
        payload: &PitrRestorePayload,
        until: Option<DateTime<Utc>>,
    ) -> Result<Backup, ExecutorError> {
        if let Some(id) = payload.backup_id {
            let backup = self.deps.backup(id).await?;
            if backup.status != BackupStatus::Done {
                return Err(ExecutorError::Other(format!("backup {} is not done", backup.name)));
            }
            return Ok(backup);
        }
        let until = until.ok_or_else(|| {
            ExecutorError::InvalidPayload("neither backupId nor pointInTimeTs is set".to_string())
        })?;
        self.deps
            .store
            .list_backups(payload.database_id)
            .await?
            .into_iter()
            .filter(|b| b.status == BackupStatus::Done && b.created_at <= until)
            .max_by_key(|b| b.created_at)
            .ok_or_else(|| ExecutorError::NotFound(format!("no finished backup before {until}")))
    }

    async fn replay(
        &self,
        ctx: &ExecutionContext,
        task: &Task,
        replayer: &dyn BinlogReplayer,
        request: &ReplayRequest,
    ) -> Result<(), ExecutorError> {
        let total = replayer.replay_size(request).await?;
        self.progress.insert(task.id, Progress::new(total));

        let applied = AtomicU64::new(0);
        let replay = replayer.replay(request, &applied);
        tokio::pin!(replay);
        let mut ticker = tokio::time::interval(PROGRESS_INTERVAL);

        loop {
            tokio::select! {
                result = &mut replay => {
                    result?;
                    self.advance(task.id, total);
                    return Ok(());
                }
                _ = ticker.tick() => self.advance(task.id, applied.load(Ordering::Relaxed)),
                _ = ctx.canceled() => {
                    return Err(ExecutorError::Other("binlog replay canceled".to_string()));
                }
            }
        }
    }

    fn advance(&self, task_id: TaskId, completed: u64) {
        if let Some(mut progress) = self.progress.get_mut(&task_id) {
            progress.advance(completed);
        }
    }
}

#[async_trait]
impl TaskExecutor for PitrRestoreExecutor {
    async fn run_once(&self, ctx: &ExecutionContext, task: &Task) -> Result<RunOnce, ExecutorError> {
        let payload: PitrRestorePayload = task.payload()?;
        payload.validate()?;
        let until = payload.point_in_time();
        let (source, source_instance) = self.source(&payload).await?;

        let replayer = match until {
            Some(_) if !source_instance.engine.supports_pitr() => {
                return Err(ExecutorError::Unsupported(format!(
                    "point-in-time recovery is not available for {}",
                    source_instance.engine.as_str()
                )));
            }
            Some(_) => Some(self.deps.replayer.clone().ok_or_else(|| {
                ExecutorError::Unsupported("no binlog replayer is configured".to_string())
            })?),
            None => None,
        };
        let backup = self.pick_backup(&payload, until).await?;

        let target_instance = match payload.target_instance_id {
            Some(id) => self.deps.instance(id).await?,
            None => source_instance.clone(),
        };
        let driver = self.deps.driver(&target_instance).await?;
        let target = match &payload.target_database_name {
            Some(name) => {
                if driver.database_exists(name).await? {
                    return Err(ExecutorError::Other(format!("database {name} already exists")));
                }
                name.clone()
            }
            None => {
                let scratch = pitr_database_name(&source.name, task);
                // Leftovers of an interrupted attempt.
                driver.drop_database_if_exists(&scratch).await?;
                scratch
            }
        };

        driver.create_database(&target, "").await?;
        self.progress
            .insert(task.id, Progress::new(backup.size_bytes.unwrap_or(0)));
        driver.restore(&target, &self.deps.backup_path(&backup)).await?;
        info!(task_id = %task.id, backup = %backup.name, database = %target, "Restored backup");

        if let (Some(until), Some(replayer)) = (until, replayer) {
            let request = ReplayRequest {
                instance: source_instance.clone(),
                source_database: source.name.clone(),
                target_database: target.clone(),
                backup: backup.clone(),
                until,
            };
            self.replay(ctx, task, replayer.as_ref(), &request).await?;
            info!(task_id = %task.id, until = %until, "Replayed binlog");
        } else {
            self.advance(task.id, u64::MAX);
        }

        if !payload.is_in_place() {
            self.deps
                .store
                .upsert_database(DatabaseUpsert {
                    instance_id: target_instance.id,
                    project_id: payload.project_id,
                    name: target.clone(),
                    schema_version: source.schema_version.clone(),
                })
                .await?;
        }
        self.completed.insert(task.id);

        let detail = match until {
            Some(until) => format!("Restored {} to {until} into {target}", source.name),
            None => format!("Restored backup {} into {target}", backup.name),
        };
        Ok(RunOnce::Completed(TaskRunResult::detail(detail)))
    }

    fn progress(&self, task_id: TaskId) -> Option<Progress> {
        self.progress.get(&task_id).map(|p| *p)
    }

    fn is_completed(&self, task_id: TaskId) -> bool {
        self.completed.contains(&task_id)
    }

    fn forget(&self, task_id: TaskId) {
        self.progress.remove(&task_id);
        self.completed.remove(&task_id);
    }
}

/// Swaps the restored scratch database in under the original name.
pub struct PitrCutoverExecutor {
    deps: Arc<ExecutorDeps>,
}

impl PitrCutoverExecutor {
    pub fn new(deps: Arc<ExecutorDeps>) -> Self {
        Self { deps }
    }

    async fn restore_task(&self, task: &Task) -> Result<Task, ExecutorError> {
        self.deps
            .store
            .list_tasks(&TaskFind {
                pipeline_id: Some(task.pipeline_id),
                stage_id: Some(task.stage_id),
                task_types: Some(vec![TaskType::PitrRestore]),
                ..Default::default()
            })
            .await?
            .into_iter()
            .find(|t| t.database_id == task.database_id)
            .ok_or_else(|| ExecutorError::NotFound(format!("restore task for {}", task.id)))
    }

    async fn swap(
        driver: &dyn Driver,
        database: &str,
        scratch: &str,
        parked: &str,
    ) -> Result<(), ExecutorError> {
        if driver.database_exists(database).await? {
            driver.rename_database(database, parked).await?;
        }
        driver.rename_database(scratch, database).await?;
        Ok(())
    }
}

#[async_trait]
impl TaskExecutor for PitrCutoverExecutor {
    async fn run_once(&self, _ctx: &ExecutionContext, task: &Task) -> Result<RunOnce, ExecutorError> {
        let restore = self.restore_task(task).await?;
        let database = self.deps.database(&restore).await?;
        let instance = self.deps.instance(database.instance_id).await?;
        let driver = self.deps.driver(&instance).await?;

        let scratch = pitr_database_name(&database.name, &restore);
        let parked = parked_database_name(&database.name, &restore);

        if driver.database_exists(&scratch).await? {
            Self::swap(driver.as_ref(), &database.name, &scratch, &parked).await?;
            info!(task_id = %task.id, database = %database.name, parked = %parked, "Swapped in restored database");
        } else if driver.database_exists(&parked).await? {
            debug!(task_id = %task.id, database = %database.name, "Cutover already done");
        } else {
            return Err(ExecutorError::NotFound(format!(
                "restored database {scratch} is missing"
            )));
        }

        Ok(RunOnce::Completed(TaskRunResult::detail(format!(
            "Replaced {} with its restored copy; the previous database is kept as {parked}",
            database.name
        ))))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{FakeReplayer, Harness};
    use chrono::Duration as ChronoDuration;
    use strata_core::instance::Engine;
    use strata_core::payload::{PitrCutoverPayload, TaskPayload};
    use tokio_test::assert_err;

    fn restore_payload(h: &Harness) -> PitrRestorePayload {
        PitrRestorePayload {
            project_id: h.project_id,
            database_id: h.database_id,
            backup_id: None,
            point_in_time_ts: None,
            target_instance_id: None,
            target_database_name: None,
        }
    }

    #[tokio::test]
    async fn test_in_place_restore_then_cutover() {
        let h = Harness::new().await;
        let backup = h.done_backup("nightly").await;
        let [restore, cutover]: [Task; 2] = h
            .stage(vec![
                TaskPayload::PitrRestore(PitrRestorePayload {
                    backup_id: Some(backup.id),
                    ..restore_payload(&h)
                }),
                TaskPayload::PitrCutover(PitrCutoverPayload::default()),
            ])
            .await
            .try_into()
            .unwrap();
        let ctx = ExecutionContext::default();

        let executor = PitrRestoreExecutor::new(h.deps.clone());
        executor.run_once(&ctx, &restore).await.unwrap();
        let scratch = pitr_database_name("shop", &restore);
        assert!(h.driver.has_database(&scratch));
        assert!(executor.is_completed(restore.id));
        let progress = executor.progress(restore.id).unwrap();
        assert_eq!(progress.completed_unit, progress.total_unit);

        let cutover_exec = PitrCutoverExecutor::new(h.deps.clone());
        cutover_exec.run_once(&ctx, &cutover).await.unwrap();
        assert!(h.driver.has_database("shop"));
        assert!(h.driver.has_database(&parked_database_name("shop", &restore)));
        assert!(!h.driver.has_database(&scratch));

        // A rerun after the swap is a no-op.
        cutover_exec.run_once(&ctx, &cutover).await.unwrap();
        assert_eq!(h.driver.renames().len(), 2);
    }

    #[tokio::test]
    async fn test_settled_restore_releases_its_state() {
        let h = Harness::new().await;
        let backup = h.done_backup("nightly").await;
        let task = h
            .task(
                TaskPayload::PitrRestore(PitrRestorePayload {
                    backup_id: Some(backup.id),
                    ..restore_payload(&h)
                }),
                Some(h.database_id),
            )
            .await;

        let executor = PitrRestoreExecutor::new(h.deps.clone());
        executor
            .run_once(&ExecutionContext::default(), &task)
            .await
            .unwrap();
        assert!(executor.progress(task.id).is_some());

        executor.forget(task.id);
        assert!(executor.progress(task.id).is_none());
        assert!(!executor.is_completed(task.id));
        assert!(executor.progress.is_empty());
        assert!(executor.completed.is_empty());
    }

    #[tokio::test]
    async fn test_point_in_time_picks_latest_backup_and_replays() {
        let replayer = Arc::new(FakeReplayer::new(4096));
        let h = Harness::builder()
            .engine(Engine::Mysql)
            .replayer(replayer.clone())
            .build()
            .await;
        let _old = h.done_backup("monday").await;
        let newer = h.done_backup("tuesday").await;
        let until = Utc::now() + ChronoDuration::seconds(5);
        let task = h
            .task(
                TaskPayload::PitrRestore(PitrRestorePayload {
                    point_in_time_ts: Some(until.timestamp()),
                    target_database_name: Some("shop_at_noon".to_string()),
                    ..restore_payload(&h)
                }),
                Some(h.database_id),
            )
            .await;

        let executor = PitrRestoreExecutor::new(h.deps.clone());
        executor
            .run_once(&ExecutionContext::default(), &task)
            .await
            .unwrap();

        let requests = replayer.requests();
        assert_eq!(requests.len(), 1);
        assert_eq!(requests[0].backup.id, newer.id);
        assert_eq!(requests[0].target_database, "shop_at_noon");
        assert_eq!(executor.progress(task.id).unwrap().completed_unit, 4096);
        assert!(
            h.store
                .find_database(h.instance_id, "shop_at_noon")
                .await
                .unwrap()
                .is_some()
        );
    }

    #[tokio::test]
    async fn test_point_in_time_on_postgres_is_unsupported() {
        let h = Harness::builder()
            .replayer(Arc::new(FakeReplayer::new(1)))
            .build()
            .await;
        h.done_backup("nightly").await;
        let task = h
            .task(
                TaskPayload::PitrRestore(PitrRestorePayload {
                    point_in_time_ts: Some(Utc::now().timestamp()),
                    ..restore_payload(&h)
                }),
                Some(h.database_id),
            )
            .await;

        let err = assert_err!(
            PitrRestoreExecutor::new(h.deps.clone())
                .run_once(&ExecutionContext::default(), &task)
                .await
        );
        assert!(matches!(err, ExecutorError::Unsupported(_)));
    }

    #[tokio::test]
    async fn test_existing_target_database_is_refused() {
        let h = Harness::new().await;
        let backup = h.done_backup("nightly").await;
        h.driver.add_database("shop_copy");
        let task = h
            .task(
                TaskPayload::PitrRestore(PitrRestorePayload {
                    backup_id: Some(backup.id),
                    target_database_name: Some("shop_copy".to_string()),
                    ..restore_payload(&h)
                }),
                Some(h.database_id),
            )
            .await;

        let err = PitrRestoreExecutor::new(h.deps.clone())
            .run_once(&ExecutionContext::default(), &task)
            .await
            .unwrap_err();
        assert!(err.to_string().contains("already exists"));
        assert!(h.driver.restores().is_empty());
    }
}
