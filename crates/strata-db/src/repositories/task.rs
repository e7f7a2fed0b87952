//! PostgreSQL implementation of TaskRepository.

use super::{PgStore, db_err, parse_col};
use async_trait::async_trait;
use sqlx::Row;
use sqlx::postgres::PgRow;
use strata_core::ids::*;
use strata_core::ports::TaskRepository;
use strata_core::task::{Task, TaskFind, TaskRunResult, TaskStatusPatch};
use strata_core::Result;
use uuid::Uuid;

pub(crate) const TASK_COLUMNS: &str = "id, pipeline_id, stage_id, name, task_type, status, \
     instance_id, database_id, payload, earliest_allowed_at, blocked_by, result, creator_id, \
     updater_id, created_at, updated_at";

pub(crate) fn row_to_task(r: &PgRow) -> Result<Task> {
    let result: Option<serde_json::Value> = r.get("result");
    let result: Option<TaskRunResult> = result.map(serde_json::from_value).transpose()?;

    Ok(Task {
        id: TaskId::from_uuid(r.get("id")),
        pipeline_id: PipelineId::from_uuid(r.get("pipeline_id")),
        stage_id: StageId::from_uuid(r.get("stage_id")),
        name: r.get("name"),
        task_type: parse_col(r, "task_type")?,
        status: parse_col(r, "status")?,
        instance_id: InstanceId::from_uuid(r.get("instance_id")),
        database_id: r
            .get::<Option<Uuid>, _>("database_id")
            .map(DatabaseId::from_uuid),
        payload: r.get("payload"),
        earliest_allowed_at: r.get("earliest_allowed_at"),
        blocked_by: r
            .get::<Vec<Uuid>, _>("blocked_by")
            .into_iter()
            .map(TaskId::from_uuid)
            .collect(),
        result,
        creator_id: PrincipalId::from_uuid(r.get("creator_id")),
        updater_id: PrincipalId::from_uuid(r.get("updater_id")),
        created_at: r.get("created_at"),
        updated_at: r.get("updated_at"),
    })
}

fn uuids<T, F>(ids: &[T], f: F) -> Vec<Uuid>
where
    F: Fn(&T) -> Uuid,
{
    ids.iter().map(f).collect()
}

#[async_trait]
impl TaskRepository for PgStore {
    async fn get_task(&self, id: TaskId) -> Result<Option<Task>> {
        let row = sqlx::query(&format!("SELECT {TASK_COLUMNS} FROM tasks WHERE id = $1"))
            .bind(id.as_uuid())
            .fetch_optional(self.pool())
            .await
            .map_err(db_err)?;

        row.as_ref().map(row_to_task).transpose()
    }

    async fn list_tasks(&self, find: &TaskFind) -> Result<Vec<Task>> {
        let ids = find.ids.as_ref().map(|ids| uuids(ids, |id| *id.as_uuid()));
        let statuses: Option<Vec<String>> = find
            .statuses
            .as_ref()
            .map(|s| s.iter().map(|s| s.as_str().to_string()).collect());
        let task_types: Option<Vec<String>> = find
            .task_types
            .as_ref()
            .map(|t| t.iter().map(|t| t.as_str().to_string()).collect());

        let rows = sqlx::query(&format!(
            r#"SELECT {TASK_COLUMNS} FROM tasks
               WHERE ($1::uuid[] IS NULL OR id = ANY($1))
                 AND ($2::uuid IS NULL OR pipeline_id = $2)
                 AND ($3::uuid IS NULL OR stage_id = $3)
                 AND ($4::text[] IS NULL OR status = ANY($4))
                 AND ($5::text[] IS NULL OR task_type = ANY($5))
               ORDER BY seq"#
        ))
        .bind(ids)
        .bind(find.pipeline_id.map(|id| *id.as_uuid()))
        .bind(find.stage_id.map(|id| *id.as_uuid()))
        .bind(statuses)
        .bind(task_types)
        .fetch_all(self.pool())
        .await
        .map_err(db_err)?;

        rows.iter().map(row_to_task).collect()
    }

    async fn patch_task_status(&self, patch: &TaskStatusPatch) -> Result<Vec<Task>> {
        let result = patch
            .result
            .as_ref()
            .map(serde_json::to_value)
            .transpose()?;

        let rows = sqlx::query(&format!(
            r#"UPDATE tasks
               SET status = $1, updater_id = $2, result = COALESCE($3, result), updated_at = NOW()
               WHERE id = ANY($4) AND ($5::text IS NULL OR status = $5)
               RETURNING {TASK_COLUMNS}"#
        ))
        .bind(patch.status.as_str())
        .bind(patch.updater_id.as_uuid())
        .bind(result)
        .bind(uuids(&patch.ids, |id| *id.as_uuid()))
        .bind(patch.expected_status.map(|s| s.as_str()))
        .fetch_all(self.pool())
        .await
        .map_err(db_err)?;

        rows.iter().map(row_to_task).collect()
    }
}
