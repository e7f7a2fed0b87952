//! Task executors, one per task type.

pub mod backup;
pub mod database_create;
pub mod general;
pub mod migration;
pub mod pitr;

pub use backup::{BackupExecutor, RestoreExecutor};
pub use database_create::DatabaseCreateExecutor;
pub use general::GeneralExecutor;
pub use migration::MigrationExecutor;
pub use pitr::{BinlogReplayer, PitrCutoverExecutor, PitrRestoreExecutor, ReplayRequest};
