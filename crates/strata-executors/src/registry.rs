//! The full executor set, keyed by task and check type.

use crate::checks::{
    DatabaseConnectCheck, MigrationSchemaCheck, PitrPreflightCheck, StatementAdviseCheck,
    StatementSyntaxCheck, StatementTypeCheck, TimingCheck,
};
use crate::deps::ExecutorDeps;
use crate::ghost::{
    GhostCutoverExecutor, GhostDropOriginalTableExecutor, GhostDryRunCheck, GhostSyncExecutor,
};
use crate::tasks::{
    BackupExecutor, DatabaseCreateExecutor, GeneralExecutor, MigrationExecutor,
    PitrCutoverExecutor, PitrRestoreExecutor, RestoreExecutor,
};
use std::sync::Arc;
use strata_core::check::TaskCheckType;
use strata_core::task::TaskType;
use strata_scheduler::{CheckExecutorRegistry, RegistryError, TaskExecutorRegistry};

pub fn task_executors(deps: Arc<ExecutorDeps>) -> Result<TaskExecutorRegistry, RegistryError> {
    TaskExecutorRegistry::new()
        .with(TaskType::General, Arc::new(GeneralExecutor))?
        .with(
            TaskType::DatabaseCreate,
            Arc::new(DatabaseCreateExecutor::new(deps.clone())),
        )?
        .with(
            TaskType::SchemaUpdate,
            Arc::new(MigrationExecutor::schema_update(deps.clone())),
        )?
        .with(
            TaskType::DataUpdate,
            Arc::new(MigrationExecutor::data_update(deps.clone())),
        )?
        .with(
            TaskType::SchemaUpdateGhostSync,
            Arc::new(GhostSyncExecutor::new(deps.clone())),
        )?
        .with(
            TaskType::SchemaUpdateGhostCutover,
            Arc::new(GhostCutoverExecutor::new(deps.clone())),
        )?
        .with(
            TaskType::SchemaUpdateGhostDropOriginalTable,
            Arc::new(GhostDropOriginalTableExecutor::new(deps.clone())),
        )?
        .with(TaskType::DatabaseBackup, Arc::new(BackupExecutor::new(deps.clone())))?
        .with(TaskType::DatabaseRestore, Arc::new(RestoreExecutor::new(deps.clone())))?
        .with(TaskType::PitrRestore, Arc::new(PitrRestoreExecutor::new(deps.clone())))?
        .with(TaskType::PitrCutover, Arc::new(PitrCutoverExecutor::new(deps)))
}

pub fn check_executors(deps: Arc<ExecutorDeps>) -> Result<CheckExecutorRegistry, RegistryError> {
    CheckExecutorRegistry::new()
        .with(
            TaskCheckType::StatementSyntax,
            Arc::new(StatementSyntaxCheck::new(deps.clone())),
        )?
        .with(
            TaskCheckType::StatementAdvise,
            Arc::new(StatementAdviseCheck::new(deps.clone())),
        )?
        .with(
            TaskCheckType::StatementType,
            Arc::new(StatementTypeCheck::new(deps.clone())),
        )?
        .with(
            TaskCheckType::DatabaseConnect,
            Arc::new(DatabaseConnectCheck::new(deps.clone())),
        )?
        .with(
            TaskCheckType::MigrationSchema,
            Arc::new(MigrationSchemaCheck::new(deps.clone())),
        )?
        .with(TaskCheckType::Timing, Arc::new(TimingCheck))?
        .with(TaskCheckType::GhostDryRun, Arc::new(GhostDryRunCheck::new(deps.clone())))?
        .with(TaskCheckType::PitrPreflight, Arc::new(PitrPreflightCheck::new(deps)))
}
