use crate::deps::ExecutorDeps;
use crate::driver::{DriverError, MigrationInfo, MigrationKind, MigrationRecord};
use async_trait::async_trait;
use std::sync::Arc;
use strata_core::instance::DatabaseUpsert;
use strata_core::payload::MigrationPayload;
use strata_core::task::{Task, TaskRunResult};
use strata_scheduler::{ExecutionContext, ExecutorError, RunOnce, TaskExecutor};
use tracing::{info, warn};

/// Applies a schema or data change and records it in the migration history.
///
/// The history is consulted before anything runs: a version already recorded
/// by this task means an earlier attempt finished, one recorded by another
/// task is a conflict.
pub struct MigrationExecutor {
    deps: Arc<ExecutorDeps>,
    kind: MigrationKind,
}

impl MigrationExecutor {
    pub fn schema_update(deps: Arc<ExecutorDeps>) -> Self {
        Self {
            deps,
            kind: MigrationKind::Migrate,
        }
    }

    pub fn data_update(deps: Arc<ExecutorDeps>) -> Self {
        Self {
            deps,
            kind: MigrationKind::Data,
        }
    }

    fn claim(task: &Task, record: MigrationRecord) -> Result<MigrationRecord, ExecutorError> {
        if record.task_id == task.id {
            Ok(record)
        } else {
            Err(ExecutorError::Driver(format!(
                "version {} of {} was already applied by task {}",
                record.version, record.database, record.task_id
            )))
        }
    }
}

#[async_trait]
impl TaskExecutor for MigrationExecutor {
    async fn run_once(&self, _ctx: &ExecutionContext, task: &Task) -> Result<RunOnce, ExecutorError> {
        let payload: MigrationPayload = task.payload()?;
        let database = self.deps.database(task).await?;
        let instance = self.deps.instance(database.instance_id).await?;
        let driver = self.deps.driver(&instance).await?;

        let record = match driver
            .find_migration(&database.name, &payload.schema_version)
            .await?
        {
            Some(record) => {
                info!(task_id = %task.id, version = %record.version, "Migration already recorded");
                Self::claim(task, record)?
            }
            None => {
                let info = MigrationInfo {
                    database: database.name.clone(),
                    version: payload.schema_version.clone(),
                    kind: self.kind,
                    description: task.name.clone(),
                    task_id: task.id,
                    creator_id: task.creator_id,
                };
                match driver.execute_migration(&info, &payload.statement).await {
                    Ok(record) => record,
                    Err(DriverError::AlreadyExists(_)) => {
                        warn!(task_id = %task.id, version = %info.version, "Version recorded concurrently");
                        let record = driver
                            .find_migration(&info.database, &info.version)
                            .await?
                            .ok_or_else(|| {
                                ExecutorError::Driver(format!("version {} vanished", info.version))
                            })?;
                        Self::claim(task, record)?
                    }
                    Err(e) => return Err(e.into()),
                }
            }
        };

        if self.kind == MigrationKind::Migrate {
            self.deps
                .store
                .upsert_database(DatabaseUpsert {
                    instance_id: database.instance_id,
                    project_id: database.project_id,
                    name: database.name.clone(),
                    schema_version: Some(record.version.clone()),
                })
                .await?;
        }

        Ok(RunOnce::Completed(TaskRunResult {
            detail: format!("Applied migration {} to {}", record.version, database.name),
            change_history_id: Some(record.id),
            version: Some(record.version),
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::Harness;
    use pretty_assertions::assert_eq;
    use strata_core::payload::TaskPayload;

    fn schema_update(statement: &str, version: &str) -> TaskPayload {
        TaskPayload::SchemaUpdate(MigrationPayload {
            statement: statement.to_string(),
            rollback_statement: None,
            schema_version: version.to_string(),
            vcs_push_event: None,
        })
    }

    #[tokio::test]
    async fn test_applies_and_bumps_schema_version() {
        let h = Harness::new().await;
        let task = h
            .task(
                schema_update("ALTER TABLE orders ADD COLUMN note TEXT", "20240201"),
                Some(h.database_id),
            )
            .await;

        let outcome = MigrationExecutor::schema_update(h.deps.clone())
            .run_once(&ExecutionContext::default(), &task)
            .await
            .unwrap();

        let RunOnce::Completed(result) = outcome else {
            panic!("migration should complete");
        };
        assert_eq!(result.version.as_deref(), Some("20240201"));
        assert_eq!(
            h.driver.statements("shop"),
            vec!["ALTER TABLE orders ADD COLUMN note TEXT".to_string()]
        );
        let db = h.store.get_database(h.database_id).await.unwrap().unwrap();
        assert_eq!(db.schema_version.as_deref(), Some("20240201"));
    }

    #[tokio::test]
    async fn test_rerun_does_not_apply_twice() {
        let h = Harness::new().await;
        let task = h
            .task(schema_update("CREATE INDEX idx ON orders (id)", "20240202"), Some(h.database_id))
            .await;
        let executor = MigrationExecutor::schema_update(h.deps.clone());
        let ctx = ExecutionContext::default();

        let first = executor.run_once(&ctx, &task).await.unwrap();
        let second = executor.run_once(&ctx, &task).await.unwrap();

        assert_eq!(first, second);
        assert_eq!(h.driver.statements("shop").len(), 1);
    }

    #[tokio::test]
    async fn test_version_taken_by_another_task_fails() {
        let h = Harness::new().await;
        let first = h
            .task(schema_update("CREATE TABLE a (id int)", "20240203"), Some(h.database_id))
            .await;
        let second = h
            .task(schema_update("CREATE TABLE b (id int)", "20240203"), Some(h.database_id))
            .await;
        let executor = MigrationExecutor::schema_update(h.deps.clone());
        let ctx = ExecutionContext::default();

        executor.run_once(&ctx, &first).await.unwrap();
        let err = executor.run_once(&ctx, &second).await.unwrap_err();
        assert!(err.to_string().contains("already applied"));
    }

    #[tokio::test]
    async fn test_statement_error_fails_the_task() {
        let h = Harness::new().await;
        h.driver.fail_statements_containing("DROP");
        let task = h
            .task(
                TaskPayload::DataUpdate(MigrationPayload {
                    statement: "DROP TABLE orders".to_string(),
                    rollback_statement: None,
                    schema_version: "20240204".to_string(),
                    vcs_push_event: None,
                }),
                Some(h.database_id),
            )
            .await;

        let err = MigrationExecutor::data_update(h.deps.clone())
            .run_once(&ExecutionContext::default(), &task)
            .await
            .unwrap_err();
        assert!(matches!(err, ExecutorError::Driver(_)));
        assert!(h.driver.history("shop").is_empty());
        let db = h.store.get_database(h.database_id).await.unwrap().unwrap();
        assert_eq!(db.schema_version, None);
    }
}
