//! PostgreSQL implementation of PipelineRepository.

use super::task::{TASK_COLUMNS, row_to_task};
use super::{PgStore, db_err, parse_col};
use async_trait::async_trait;
use sqlx::Row;
use strata_core::ids::*;
use strata_core::pipeline::{Pipeline, PipelineCreate, PipelineStatus, Stage};
use strata_core::ports::PipelineRepository;
use strata_core::{Error, Result};
use tracing::debug;
use uuid::Uuid;

#[async_trait]
impl PipelineRepository for PgStore {
    async fn create_pipeline(&self, create: PipelineCreate) -> Result<Pipeline> {
        let pipeline = create.materialize()?;
        let mut tx = self.pool().begin().await.map_err(db_err)?;

        sqlx::query(
            r#"INSERT INTO pipelines (id, name, status, creator_id, updater_id, created_at, updated_at)
               VALUES ($1, $2, $3, $4, $4, $5, $5)"#,
        )
        .bind(pipeline.id.as_uuid())
        .bind(&pipeline.name)
        .bind(pipeline.status.as_str())
        .bind(pipeline.creator_id.as_uuid())
        .bind(pipeline.created_at)
        .execute(&mut *tx)
        .await
        .map_err(db_err)?;

        for stage in &pipeline.stages {
            sqlx::query(
                r#"INSERT INTO stages (id, pipeline_id, environment_id, name, position)
                   VALUES ($1, $2, $3, $4, $5)"#,
            )
            .bind(stage.id.as_uuid())
            .bind(pipeline.id.as_uuid())
            .bind(stage.environment_id.as_uuid())
            .bind(&stage.name)
            .bind(stage.position as i32)
            .execute(&mut *tx)
            .await
            .map_err(db_err)?;

            for task in &stage.tasks {
                let blocked_by: Vec<Uuid> = task.blocked_by.iter().map(|id| *id.as_uuid()).collect();
                sqlx::query(
                    r#"INSERT INTO tasks (id, pipeline_id, stage_id, name, task_type, status, instance_id,
                           database_id, payload, earliest_allowed_at, blocked_by, creator_id, updater_id,
                           created_at, updated_at)
                       VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $12, $13, $13)"#,
                )
                .bind(task.id.as_uuid())
                .bind(task.pipeline_id.as_uuid())
                .bind(task.stage_id.as_uuid())
                .bind(&task.name)
                .bind(task.task_type.as_str())
                .bind(task.status.as_str())
                .bind(task.instance_id.as_uuid())
                .bind(task.database_id.map(|id| *id.as_uuid()))
                .bind(&task.payload)
                .bind(task.earliest_allowed_at)
                .bind(blocked_by)
                .bind(task.creator_id.as_uuid())
                .bind(task.created_at)
                .execute(&mut *tx)
                .await
                .map_err(db_err)?;
            }
        }

        tx.commit().await.map_err(db_err)?;
        debug!(pipeline_id = %pipeline.id, stages = pipeline.stages.len(), "Pipeline created");
        Ok(pipeline)
    }

    async fn get_pipeline(&self, id: PipelineId) -> Result<Option<Pipeline>> {
        let Some(row) = sqlx::query(
            "SELECT id, name, status, creator_id, created_at, updated_at FROM pipelines WHERE id = $1",
        )
        .bind(id.as_uuid())
        .fetch_optional(self.pool())
        .await
        .map_err(db_err)?
        else {
            return Ok(None);
        };

        let stage_rows = sqlx::query(
            "SELECT id, environment_id, name, position FROM stages WHERE pipeline_id = $1 ORDER BY position",
        )
        .bind(id.as_uuid())
        .fetch_all(self.pool())
        .await
        .map_err(db_err)?;

        let task_rows = sqlx::query(&format!(
            "SELECT {TASK_COLUMNS} FROM tasks WHERE pipeline_id = $1 ORDER BY seq"
        ))
        .bind(id.as_uuid())
        .fetch_all(self.pool())
        .await
        .map_err(db_err)?;
        let tasks = task_rows.iter().map(row_to_task).collect::<Result<Vec<_>>>()?;

        let stages = stage_rows
            .iter()
            .map(|r| {
                let stage_id = StageId::from_uuid(r.get("id"));
                Stage {
                    id: stage_id,
                    pipeline_id: id,
                    environment_id: EnvironmentId::from_uuid(r.get("environment_id")),
                    name: r.get("name"),
                    position: r.get::<i32, _>("position") as u32,
                    tasks: tasks
                        .iter()
                        .filter(|t| t.stage_id == stage_id)
                        .cloned()
                        .collect(),
                }
            })
            .collect();

        Ok(Some(Pipeline {
            id,
            name: row.get("name"),
            status: parse_col(&row, "status")?,
            stages,
            creator_id: PrincipalId::from_uuid(row.get("creator_id")),
            created_at: row.get("created_at"),
            updated_at: row.get("updated_at"),
        }))
    }

    async fn patch_pipeline_status(
        &self,
        id: PipelineId,
        updater_id: PrincipalId,
        status: PipelineStatus,
    ) -> Result<()> {
        let result = sqlx::query(
            "UPDATE pipelines SET status = $1, updater_id = $2, updated_at = NOW() WHERE id = $3",
        )
        .bind(status.as_str())
        .bind(updater_id.as_uuid())
        .bind(id.as_uuid())
        .execute(self.pool())
        .await
        .map_err(db_err)?;

        if result.rows_affected() == 0 {
            return Err(Error::PipelineNotFound(id.to_string()));
        }
        Ok(())
    }
}
