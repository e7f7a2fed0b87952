use async_trait::async_trait;
use chrono::Utc;
use strata_core::check::{Finding, TaskCheckRun};
use strata_core::task::Task;
use strata_scheduler::{ExecutionContext, ExecutorError, TaskCheckExecutor};

pub const NOT_YET_ALLOWED: i32 = 601;

/// Reports a task whose earliest allowed time is still ahead.
///
/// Only a warning: the task scheduler holds the task back on its own.
#[derive(Debug, Default)]
pub struct TimingCheck;

#[async_trait]
impl TaskCheckExecutor for TimingCheck {
    async fn run(
        &self,
        _ctx: &ExecutionContext,
        _run: &TaskCheckRun,
        task: &Task,
    ) -> Result<Vec<Finding>, ExecutorError> {
        match task.earliest_allowed_at {
            Some(at) if at > Utc::now() => Ok(vec![Finding::warn(
                NOT_YET_ALLOWED,
                "Waiting for the scheduled time",
                format!("The task will not run before {}", at.to_rfc3339()),
            )]),
            _ => Ok(vec![Finding::success("OK")]),
        }
    }
}
