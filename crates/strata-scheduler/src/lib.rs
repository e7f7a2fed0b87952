//! Background runners that drive pipelines to completion.
//!
//! - [`TaskScheduler`] approves, promotes and executes tasks.
//! - [`CheckScheduler`] runs task checks.
//! - [`ApprovalRunner`] syncs approval requests with an external provider.
//! - [`StatusService`] is the single path for task, check run and issue
//!   status changes, shared by the runners and the operator surface.
//!
//! [`Runner`] wires them together around one store.

pub mod approval;
pub mod check_scheduler;
pub mod dag;
pub mod executor;
pub mod inflight;
pub mod plan;
pub mod registry;
pub mod runner;
pub mod status;
pub mod task_scheduler;

#[cfg(test)]
mod testing;

pub use approval::ApprovalRunner;
pub use check_scheduler::CheckScheduler;
pub use dag::{DagError, StagePlan, TaskDag};
pub use executor::{
    ExecutionContext, ExecutorError, RunOnce, THIRD_PARTY_PANIC_CODE, TaskCheckExecutor,
    TaskExecutor, run_isolated,
};
pub use inflight::InFlight;
pub use registry::{CheckExecutorRegistry, RegistryError, TaskExecutorRegistry};
pub use runner::{Runner, RunnerBuilder, RunnerConfig};
pub use status::StatusService;
pub use task_scheduler::TaskScheduler;
