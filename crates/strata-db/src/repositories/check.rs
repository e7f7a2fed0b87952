//! PostgreSQL implementation of TaskCheckRunRepository.

use super::{PgStore, db_err, json_col, parse_col};
use async_trait::async_trait;
use chrono::Utc;
use sqlx::Row;
use sqlx::postgres::PgRow;
use strata_core::Result;
use strata_core::check::{
    TaskCheckRun, TaskCheckRunCreate, TaskCheckRunFind, TaskCheckRunResult, TaskCheckRunStatus,
    TaskCheckRunStatusPatch,
};
use strata_core::ids::*;
use strata_core::ports::TaskCheckRunRepository;

const CHECK_COLUMNS: &str = "id, task_id, check_type, status, result, comment, creator_id, \
     updater_id, created_at, updated_at";

fn row_to_check_run(r: &PgRow) -> Result<TaskCheckRun> {
    Ok(TaskCheckRun {
        id: TaskCheckRunId::from_uuid(r.get("id")),
        task_id: TaskId::from_uuid(r.get("task_id")),
        check_type: parse_col(r, "check_type")?,
        status: parse_col(r, "status")?,
        result: json_col(r, "result")?,
        comment: r.get("comment"),
        creator_id: PrincipalId::from_uuid(r.get("creator_id")),
        updater_id: PrincipalId::from_uuid(r.get("updater_id")),
        created_at: r.get("created_at"),
        updated_at: r.get("updated_at"),
    })
}

#[async_trait]
impl TaskCheckRunRepository for PgStore {
    async fn create_task_check_runs(
        &self,
        creates: Vec<TaskCheckRunCreate>,
    ) -> Result<Vec<TaskCheckRun>> {
        let mut tx = self.pool().begin().await.map_err(db_err)?;
        let mut runs = Vec::with_capacity(creates.len());
        let now = Utc::now();

        for create in creates {
            let run = TaskCheckRun {
                id: TaskCheckRunId::new(),
                task_id: create.task_id,
                check_type: create.check_type,
                status: TaskCheckRunStatus::Running,
                result: TaskCheckRunResult::default(),
                comment: None,
                creator_id: create.creator_id,
                updater_id: create.creator_id,
                created_at: now,
                updated_at: now,
            };

            sqlx::query(
                r#"INSERT INTO task_check_runs (id, task_id, check_type, status, result,
                       creator_id, updater_id, created_at, updated_at)
                   VALUES ($1, $2, $3, $4, $5, $6, $6, $7, $7)"#,
            )
            .bind(run.id.as_uuid())
            .bind(run.task_id.as_uuid())
            .bind(run.check_type.as_str())
            .bind(run.status.as_str())
            .bind(serde_json::to_value(&run.result)?)
            .bind(run.creator_id.as_uuid())
            .bind(now)
            .execute(&mut *tx)
            .await
            .map_err(db_err)?;

            runs.push(run);
        }

        tx.commit().await.map_err(db_err)?;
        Ok(runs)
    }

    async fn get_task_check_run(&self, id: TaskCheckRunId) -> Result<Option<TaskCheckRun>> {
        let row = sqlx::query(&format!(
            "SELECT {CHECK_COLUMNS} FROM task_check_runs WHERE id = $1"
        ))
        .bind(id.as_uuid())
        .fetch_optional(self.pool())
        .await
        .map_err(db_err)?;

        row.as_ref().map(row_to_check_run).transpose()
    }

    async fn list_task_check_runs(&self, find: &TaskCheckRunFind) -> Result<Vec<TaskCheckRun>> {
        let statuses: Option<Vec<String>> = find
            .statuses
            .as_ref()
            .map(|s| s.iter().map(|s| s.as_str().to_string()).collect());

        let rows = sqlx::query(&format!(
            r#"SELECT {CHECK_COLUMNS} FROM task_check_runs
               WHERE ($1::uuid IS NULL OR task_id = $1)
                 AND ($2::text IS NULL OR check_type = $2)
                 AND ($3::text[] IS NULL OR status = ANY($3))
               ORDER BY seq"#
        ))
        .bind(find.task_id.map(|id| *id.as_uuid()))
        .bind(find.check_type.map(|t| t.as_str()))
        .bind(statuses)
        .fetch_all(self.pool())
        .await
        .map_err(db_err)?;

        rows.iter().map(row_to_check_run).collect()
    }

    async fn patch_task_check_run_status(
        &self,
        patch: &TaskCheckRunStatusPatch,
    ) -> Result<Option<TaskCheckRun>> {
        let row = sqlx::query(&format!(
            r#"UPDATE task_check_runs
               SET status = $1, result = $2, comment = $3, updater_id = $4, updated_at = NOW()
               WHERE id = $5 AND status = 'running'
               RETURNING {CHECK_COLUMNS}"#
        ))
        .bind(patch.status.as_str())
        .bind(serde_json::to_value(&patch.result)?)
        .bind(patch.comment.as_deref())
        .bind(patch.updater_id.as_uuid())
        .bind(patch.id.as_uuid())
        .fetch_optional(self.pool())
        .await
        .map_err(db_err)?;

        row.as_ref().map(row_to_check_run).transpose()
    }
}
