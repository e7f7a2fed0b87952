//! PostgreSQL implementation of IssueRepository.

use super::{PgStore, db_err, parse_col};
use async_trait::async_trait;
use chrono::Utc;
use sqlx::Row;
use sqlx::postgres::PgRow;
use strata_core::ids::*;
use strata_core::issue::{Issue, IssueCreate, IssuePatch, IssueStatus};
use strata_core::ports::IssueRepository;
use strata_core::{Error, Result};
use uuid::Uuid;

const ISSUE_COLUMNS: &str = "id, project_id, name, issue_type, status, creator_id, assignee_id, \
     pipeline_id, subscribers, created_at, updated_at";

fn row_to_issue(r: &PgRow) -> Result<Issue> {
    Ok(Issue {
        id: IssueId::from_uuid(r.get("id")),
        project_id: ProjectId::from_uuid(r.get("project_id")),
        name: r.get("name"),
        issue_type: parse_col(r, "issue_type")?,
        status: parse_col(r, "status")?,
        creator_id: PrincipalId::from_uuid(r.get("creator_id")),
        assignee_id: PrincipalId::from_uuid(r.get("assignee_id")),
        pipeline_id: PipelineId::from_uuid(r.get("pipeline_id")),
        subscribers: r
            .get::<Vec<Uuid>, _>("subscribers")
            .into_iter()
            .map(PrincipalId::from_uuid)
            .collect(),
        created_at: r.get("created_at"),
        updated_at: r.get("updated_at"),
    })
}

#[async_trait]
impl IssueRepository for PgStore {
    async fn create_issue(&self, create: IssueCreate) -> Result<Issue> {
        let now = Utc::now();
        let issue = Issue {
            id: IssueId::new(),
            project_id: create.project_id,
            name: create.name,
            issue_type: create.issue_type,
            status: IssueStatus::Open,
            creator_id: create.creator_id,
            assignee_id: create.assignee_id,
            pipeline_id: create.pipeline_id,
            subscribers: create.subscribers,
            created_at: now,
            updated_at: now,
        };
        let subscribers: Vec<Uuid> = issue.subscribers.iter().map(|id| *id.as_uuid()).collect();

        sqlx::query(
            r#"INSERT INTO issues (id, project_id, name, issue_type, status, creator_id, assignee_id,
                   pipeline_id, subscribers, created_at, updated_at)
               VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $10)"#,
        )
        .bind(issue.id.as_uuid())
        .bind(issue.project_id.as_uuid())
        .bind(&issue.name)
        .bind(issue.issue_type.as_str())
        .bind(issue.status.as_str())
        .bind(issue.creator_id.as_uuid())
        .bind(issue.assignee_id.as_uuid())
        .bind(issue.pipeline_id.as_uuid())
        .bind(subscribers)
        .bind(now)
        .execute(self.pool())
        .await
        .map_err(db_err)?;

        Ok(issue)
    }

    async fn get_issue(&self, id: IssueId) -> Result<Option<Issue>> {
        let row = sqlx::query(&format!("SELECT {ISSUE_COLUMNS} FROM issues WHERE id = $1"))
            .bind(id.as_uuid())
            .fetch_optional(self.pool())
            .await
            .map_err(db_err)?;

        row.as_ref().map(row_to_issue).transpose()
    }

    async fn get_issue_by_pipeline(&self, pipeline_id: PipelineId) -> Result<Option<Issue>> {
        let row = sqlx::query(&format!(
            "SELECT {ISSUE_COLUMNS} FROM issues WHERE pipeline_id = $1"
        ))
        .bind(pipeline_id.as_uuid())
        .fetch_optional(self.pool())
        .await
        .map_err(db_err)?;

        row.as_ref().map(row_to_issue).transpose()
    }

    async fn list_issues(&self, status: IssueStatus) -> Result<Vec<Issue>> {
        let rows = sqlx::query(&format!(
            "SELECT {ISSUE_COLUMNS} FROM issues WHERE status = $1 ORDER BY seq"
        ))
        .bind(status.as_str())
        .fetch_all(self.pool())
        .await
        .map_err(db_err)?;

        rows.iter().map(row_to_issue).collect()
    }

    async fn patch_issue(&self, patch: IssuePatch) -> Result<Issue> {
        let row = sqlx::query(&format!(
            r#"UPDATE issues
               SET status = COALESCE($1, status),
                   assignee_id = COALESCE($2, assignee_id),
                   updated_at = NOW()
               WHERE id = $3
               RETURNING {ISSUE_COLUMNS}"#
        ))
        .bind(patch.status.map(|s| s.as_str()))
        .bind(patch.assignee_id.map(|id| *id.as_uuid()))
        .bind(patch.id.as_uuid())
        .fetch_optional(self.pool())
        .await
        .map_err(db_err)?
        .ok_or_else(|| Error::IssueNotFound(patch.id.to_string()))?;

        row_to_issue(&row)
    }
}
