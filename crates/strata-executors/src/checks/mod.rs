//! Task check executors.

pub mod database;
pub mod pitr;
pub mod statement;
pub mod timing;

pub use database::{DatabaseConnectCheck, MigrationSchemaCheck};
pub use pitr::PitrPreflightCheck;
pub use statement::{StatementAdviseCheck, StatementSyntaxCheck, StatementTypeCheck};
pub use timing::TimingCheck;

use crate::deps::ExecutorDeps;
use strata_core::instance::Instance;
use strata_core::payload::TaskPayload;
use strata_core::task::Task;
use strata_scheduler::ExecutorError;

/// The instance a task runs against and the statement it carries, if any.
pub(crate) async fn statement_of(
    deps: &ExecutorDeps,
    task: &Task,
) -> Result<(Instance, Option<String>), ExecutorError> {
    let instance = deps.instance(task.instance_id).await?;
    let payload = TaskPayload::decode(task.task_type, &task.payload)?;
    Ok((instance, payload.statement().map(str::to_string)))
}
