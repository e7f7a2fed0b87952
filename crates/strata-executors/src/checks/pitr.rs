use crate::deps::ExecutorDeps;
use async_trait::async_trait;
use std::sync::Arc;
use strata_core::check::{Finding, TaskCheckRun};
use strata_core::instance::BackupStatus;
use strata_core::payload::PitrRestorePayload;
use strata_core::task::Task;
use strata_scheduler::{ExecutionContext, ExecutorError, TaskCheckExecutor};

pub const INVALID_REQUEST: i32 = 701;
pub const NO_BACKUP: i32 = 702;
pub const PITR_UNSUPPORTED: i32 = 703;
pub const TARGET_EXISTS: i32 = 704;

/// Verifies a restore can start: a usable backup, engine support for
/// point-in-time requests, and a free target name.
pub struct PitrPreflightCheck {
    deps: Arc<ExecutorDeps>,
}

impl PitrPreflightCheck {
    pub fn new(deps: Arc<ExecutorDeps>) -> Self {
        Self { deps }
    }

    async fn findings(&self, payload: &PitrRestorePayload) -> Result<Vec<Finding>, ExecutorError> {
        let mut findings = Vec::new();
        let Some(database) = self.deps.store.get_database(payload.database_id).await? else {
            return Ok(vec![Finding::error(
                INVALID_REQUEST,
                "Unknown database",
                format!("Database {} does not exist", payload.database_id),
            )]);
        };
        let instance = self.deps.instance(database.instance_id).await?;

        let backups = self.deps.store.list_backups(database.id).await?;
        let usable = match (payload.backup_id, payload.point_in_time()) {
            (Some(id), _) => backups
                .iter()
                .any(|b| b.id == id && b.status == BackupStatus::Done),
            (None, Some(until)) => backups
                .iter()
                .any(|b| b.status == BackupStatus::Done && b.created_at <= until),
            (None, None) => false,
        };
        if !usable {
            findings.push(Finding::error(
                NO_BACKUP,
                "No usable backup",
                format!("No finished backup of {} covers the request", database.name),
            ));
        }

        if payload.point_in_time_ts.is_some() {
            if !instance.engine.supports_pitr() {
                findings.push(Finding::error(
                    PITR_UNSUPPORTED,
                    "Point-in-time recovery unsupported",
                    format!("{} instances cannot replay to a point in time", instance.engine.as_str()),
                ));
            } else if self.deps.replayer.is_none() {
                findings.push(Finding::error(
                    PITR_UNSUPPORTED,
                    "Point-in-time recovery unavailable",
                    "No binlog replayer is configured on this server",
                ));
            }
        }

        if let Some(name) = &payload.target_database_name {
            let target = match payload.target_instance_id {
                Some(id) => self.deps.instance(id).await?,
                None => instance,
            };
            let driver = self.deps.driver(&target).await?;
            if driver.database_exists(name).await? {
                findings.push(Finding::error(
                    TARGET_EXISTS,
                    "Target database exists",
                    format!("{name} already exists on {}", target.name),
                ));
            }
        }
        Ok(findings)
    }
}

#[async_trait]
impl TaskCheckExecutor for PitrPreflightCheck {
    async fn run(
        &self,
        _ctx: &ExecutionContext,
        _run: &TaskCheckRun,
        task: &Task,
    ) -> Result<Vec<Finding>, ExecutorError> {
        let payload: PitrRestorePayload = match task.payload() {
            Ok(payload) => payload,
            Err(e) => {
                return Ok(vec![Finding::error(INVALID_REQUEST, "Invalid restore request", e.to_string())]);
            }
        };
        if let Err(e) = payload.validate() {
            return Ok(vec![Finding::error(INVALID_REQUEST, "Invalid restore request", e.to_string())]);
        }

        let findings = self.findings(&payload).await?;
        if findings.is_empty() {
            Ok(vec![Finding::success("OK")])
        } else {
            Ok(findings)
        }
    }
}
