use crate::deps::ExecutorDeps;
use crate::driver::{DriverError, MigrationInfo, MigrationKind};
use async_trait::async_trait;
use std::sync::Arc;
use strata_core::instance::DatabaseUpsert;
use strata_core::payload::DatabaseCreatePayload;
use strata_core::task::{Task, TaskRunResult};
use strata_scheduler::{ExecutionContext, ExecutorError, RunOnce, TaskExecutor};
use tracing::info;

/// Creates a database, registers it and records its baseline version.
///
/// A rerun after a restart finds the database already there and carries on.
pub struct DatabaseCreateExecutor {
    deps: Arc<ExecutorDeps>,
}

impl DatabaseCreateExecutor {
    pub fn new(deps: Arc<ExecutorDeps>) -> Self {
        Self { deps }
    }
}

#[async_trait]
impl TaskExecutor for DatabaseCreateExecutor {
    async fn run_once(&self, _ctx: &ExecutionContext, task: &Task) -> Result<RunOnce, ExecutorError> {
        let payload: DatabaseCreatePayload = task.payload()?;
        let instance = self.deps.instance(task.instance_id).await?;
        let driver = self.deps.driver(&instance).await?;

        match driver
            .create_database(&payload.database_name, &payload.statement)
            .await
        {
            Ok(()) => info!(task_id = %task.id, database = %payload.database_name, "Created database"),
            Err(DriverError::AlreadyExists(_)) => {
                info!(task_id = %task.id, database = %payload.database_name, "Database already exists")
            }
            Err(e) => return Err(e.into()),
        }

        self.deps
            .store
            .upsert_database(DatabaseUpsert {
                instance_id: instance.id,
                project_id: payload.project_id,
                name: payload.database_name.clone(),
                schema_version: payload.schema_version.clone(),
            })
            .await?;

        let mut result = TaskRunResult::detail(format!(
            "Created database {}",
            payload.database_name
        ));
        if let Some(version) = payload.schema_version {
            let info = MigrationInfo {
                database: payload.database_name.clone(),
                version: version.clone(),
                kind: MigrationKind::Baseline,
                description: "Create database".to_string(),
                task_id: task.id,
                creator_id: task.creator_id,
            };
            let record = match driver.execute_migration(&info, "").await {
                Ok(record) => Some(record),
                Err(DriverError::AlreadyExists(_)) => {
                    driver.find_migration(&info.database, &version).await?
                }
                Err(e) => return Err(e.into()),
            };
            result.change_history_id = record.map(|r| r.id);
            result.version = Some(version);
        }
        Ok(RunOnce::Completed(result))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::Harness;
    use std::collections::BTreeMap;
    use strata_core::payload::TaskPayload;

    fn payload(h: &Harness, version: Option<&str>) -> TaskPayload {
        TaskPayload::DatabaseCreate(DatabaseCreatePayload {
            project_id: h.project_id,
            database_name: "inventory".to_string(),
            statement: "CREATE DATABASE inventory".to_string(),
            character_set: None,
            collation: None,
            schema_version: version.map(str::to_string),
            labels: BTreeMap::new(),
        })
    }

    #[tokio::test]
    async fn test_creates_registers_and_baselines() {
        let h = Harness::new().await;
        let task = h.task(payload(&h, Some("20240301")), None).await;

        let RunOnce::Completed(result) = DatabaseCreateExecutor::new(h.deps.clone())
            .run_once(&ExecutionContext::default(), &task)
            .await
            .unwrap()
        else {
            panic!("create should complete");
        };

        assert!(h.driver.has_database("inventory"));
        let db = h
            .store
            .find_database(h.instance_id, "inventory")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(db.schema_version.as_deref(), Some("20240301"));
        assert_eq!(result.version.as_deref(), Some("20240301"));
        assert!(result.change_history_id.is_some());
    }

    #[tokio::test]
    async fn test_rerun_after_restart_succeeds() {
        let h = Harness::new().await;
        let task = h.task(payload(&h, Some("20240301")), None).await;
        let executor = DatabaseCreateExecutor::new(h.deps.clone());
        let ctx = ExecutionContext::default();

        let first = executor.run_once(&ctx, &task).await.unwrap();
        let second = executor.run_once(&ctx, &task).await.unwrap();
        assert_eq!(first, second);
        assert_eq!(h.driver.history("inventory").len(), 1);
    }

    #[tokio::test]
    async fn test_without_version_skips_history() {
        let h = Harness::new().await;
        let task = h.task(payload(&h, None), None).await;

        DatabaseCreateExecutor::new(h.deps.clone())
            .run_once(&ExecutionContext::default(), &task)
            .await
            .unwrap();
        assert!(h.driver.history("inventory").is_empty());
    }
}
