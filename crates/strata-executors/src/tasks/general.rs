use async_trait::async_trait;
use strata_core::task::{Task, TaskRunResult};
use strata_scheduler::{ExecutionContext, ExecutorError, RunOnce, TaskExecutor};

/// Placeholder tasks with no side effect.
#[derive(Debug, Default)]
pub struct GeneralExecutor;

#[async_trait]
impl TaskExecutor for GeneralExecutor {
    async fn run_once(&self, _ctx: &ExecutionContext, task: &Task) -> Result<RunOnce, ExecutorError> {
        Ok(RunOnce::Completed(TaskRunResult::detail(format!(
            "Finished {}",
            task.name
        ))))
    }
}
