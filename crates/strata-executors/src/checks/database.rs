use crate::deps::ExecutorDeps;
use async_trait::async_trait;
use std::sync::Arc;
use strata_core::check::{Finding, TaskCheckRun};
use strata_core::task::Task;
use strata_scheduler::{ExecutionContext, ExecutorError, TaskCheckExecutor};

pub const CONNECTION_FAILED: i32 = 101;
pub const MIGRATION_SCHEMA_MISSING: i32 = 102;

/// Whether the target instance answers.
pub struct DatabaseConnectCheck {
    deps: Arc<ExecutorDeps>,
}

impl DatabaseConnectCheck {
    pub fn new(deps: Arc<ExecutorDeps>) -> Self {
        Self { deps }
    }
}

#[async_trait]
impl TaskCheckExecutor for DatabaseConnectCheck {
    async fn run(
        &self,
        _ctx: &ExecutionContext,
        _run: &TaskCheckRun,
        task: &Task,
    ) -> Result<Vec<Finding>, ExecutorError> {
        let instance = self.deps.instance(task.instance_id).await?;
        let outcome = match self.deps.drivers.connect(&instance).await {
            Ok(driver) => driver.ping().await,
            Err(e) => Err(e),
        };
        Ok(match outcome {
            Ok(()) => vec![Finding::success("OK")],
            Err(e) => vec![Finding::error(
                CONNECTION_FAILED,
                format!("Cannot connect to {}", instance.name),
                e.to_string(),
            )],
        })
    }
}

/// Whether migrations can be recorded in the target database.
pub struct MigrationSchemaCheck {
    deps: Arc<ExecutorDeps>,
}

impl MigrationSchemaCheck {
    pub fn new(deps: Arc<ExecutorDeps>) -> Self {
        Self { deps }
    }
}

#[async_trait]
impl TaskCheckExecutor for MigrationSchemaCheck {
    async fn run(
        &self,
        _ctx: &ExecutionContext,
        _run: &TaskCheckRun,
        task: &Task,
    ) -> Result<Vec<Finding>, ExecutorError> {
        let database = self.deps.database(task).await?;
        let instance = self.deps.instance(database.instance_id).await?;
        let driver = self.deps.driver(&instance).await?;

        if driver.migration_history_ready(&database.name).await? {
            Ok(vec![Finding::success("OK")])
        } else {
            Ok(vec![Finding::error(
                MIGRATION_SCHEMA_MISSING,
                "Migration history unavailable",
                format!(
                    "The migration history table is missing in {} and cannot be created",
                    database.name
                ),
            )])
        }
    }
}
