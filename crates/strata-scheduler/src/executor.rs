//! Executor contracts for tasks and task checks.
//!
//! A task executor reports one of three outcomes per invocation: finished
//! ([`RunOnce::Completed`]), still in flight ([`RunOnce::Pending`] or a
//! transient error), or failed (any other [`ExecutorError`]). Executors can be
//! invoked again for a task that is already `Running` after a restart, so
//! create-type operations must tolerate their own earlier effects.

use async_trait::async_trait;
use futures::FutureExt;
use std::any::Any;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use strata_core::check::{Finding, TaskCheckRun};
use strata_core::ids::TaskId;
use strata_core::task::{Progress, Task, TaskRunResult};
use thiserror::Error;
use tokio_util::sync::{CancellationToken, WaitForCancellationFuture};
use tracing::error;

/// Finding code used when third-party tooling crashes inside a check.
pub const THIRD_PARTY_PANIC_CODE: i32 = 10_001;

#[derive(Debug, Error)]
pub enum ExecutorError {
    #[error("Invalid payload: {0}")]
    InvalidPayload(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Driver error: {0}")]
    Driver(String),

    #[error("Store error: {0}")]
    Store(String),

    /// The operation has not finished; the task stays `Running` and is
    /// invoked again on the next tick.
    #[error("Transient error: {0}")]
    Transient(String),

    #[error("Executor panicked: {0}")]
    Panicked(String),

    #[error("Unsupported: {0}")]
    Unsupported(String),

    #[error("{0}")]
    Other(String),
}

impl ExecutorError {
    pub fn is_transient(&self) -> bool {
        matches!(self, ExecutorError::Transient(_))
    }
}

impl From<strata_core::Error> for ExecutorError {
    fn from(err: strata_core::Error) -> Self {
        match err {
            strata_core::Error::InvalidPayload(msg) => ExecutorError::InvalidPayload(msg),
            other => ExecutorError::Store(other.to_string()),
        }
    }
}

/// Outcome of a successful [`TaskExecutor::run_once`] call.
#[derive(Debug, Clone, PartialEq)]
pub enum RunOnce {
    Completed(TaskRunResult),
    /// Still in flight; poll again next tick.
    Pending,
}

/// Per-invocation context. The token fires when the task is canceled.
#[derive(Debug, Clone, Default)]
pub struct ExecutionContext {
    cancel: CancellationToken,
}

impl ExecutionContext {
    pub fn new(cancel: CancellationToken) -> Self {
        Self { cancel }
    }

    pub fn is_canceled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Resolves once the task is canceled.
    pub fn canceled(&self) -> WaitForCancellationFuture<'_> {
        self.cancel.cancelled()
    }
}

/// Performs the side-effecting operation of one task type.
#[async_trait]
pub trait TaskExecutor: Send + Sync {
    async fn run_once(&self, ctx: &ExecutionContext, task: &Task)
    -> Result<RunOnce, ExecutorError>;

    /// Granular progress for long-running executors.
    fn progress(&self, _task_id: TaskId) -> Option<Progress> {
        None
    }

    /// Whether the executor has finished its work for `task_id`, independent
    /// of whether the scheduler has recorded the outcome yet.
    fn is_completed(&self, _task_id: TaskId) -> bool {
        false
    }

    /// Drops per-task state once the scheduler has settled `task_id` as
    /// `Done`, `Failed` or `Canceled`. Not called while the task stays `Running`.
    fn forget(&self, _task_id: TaskId) {}
}

/// Evaluates one aspect of a task's readiness.
///
/// An empty list and a single success finding both mean "nothing to act on".
/// Returning `Err` marks the check run `Failed`, which is distinct from a
/// `Done` run carrying error findings.
#[async_trait]
pub trait TaskCheckExecutor: Send + Sync {
    async fn run(
        &self,
        ctx: &ExecutionContext,
        run: &TaskCheckRun,
        task: &Task,
    ) -> Result<Vec<Finding>, ExecutorError>;
}

/// Best-effort text of a caught panic payload.
pub fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "Unknown panic".to_string()
    }
}

/// Polls `fut` to completion, turning a panic into `Err(message)`.
pub async fn catch_panic<F: Future>(fut: F) -> Result<F::Output, String> {
    AssertUnwindSafe(fut)
        .catch_unwind()
        .await
        .map_err(|panic_info| panic_message(&*panic_info))
}

/// Runs a call into third-party tooling. A panic inside it becomes a single
/// error finding, so the check run still completes as `Done`.
pub async fn run_isolated<F>(tool: &str, fut: F) -> Result<Vec<Finding>, ExecutorError>
where
    F: Future<Output = Result<Vec<Finding>, ExecutorError>>,
{
    match catch_panic(fut).await {
        Ok(result) => result,
        Err(message) => {
            error!(tool = %tool, panic = %message, "Third-party tool panicked during check");
            Ok(vec![Finding::error(
                THIRD_PARTY_PANIC_CODE,
                format!("{tool} crashed"),
                message,
            )])
        }
    }
}
