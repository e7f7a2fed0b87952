//! Executors for every task and check type.
//!
//! Task executors perform the operation a task stands for against a managed
//! instance through the [`driver::Driver`] port. Check executors inspect a
//! task before it runs. [`registry::task_executors`] and
//! [`registry::check_executors`] bind them to their types.

pub mod advisor;
pub mod checks;
pub mod deps;
pub mod driver;
pub mod ghost;
pub mod postgres;
pub mod registry;
pub mod tasks;

#[cfg(test)]
mod testing;

pub use advisor::{BasicAdvisor, SqlAdvisor};
pub use deps::ExecutorDeps;
pub use driver::{Driver, DriverError, DriverFactory};
pub use ghost::{GhostCli, GhostMigrator};
pub use postgres::{PgDriverFactory, PgTools};
pub use registry::{check_executors, task_executors};
pub use tasks::BinlogReplayer;
