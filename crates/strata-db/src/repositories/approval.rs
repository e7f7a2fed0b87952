//! PostgreSQL implementation of ExternalApprovalRepository.

use super::{PgStore, db_err, json_col};
use async_trait::async_trait;
use chrono::Utc;
use sqlx::Row;
use sqlx::postgres::PgRow;
use strata_core::approval::{ExternalApproval, ExternalApprovalCreate, ExternalApprovalPayload};
use strata_core::ids::*;
use strata_core::ports::ExternalApprovalRepository;
use strata_core::{Error, Result};

const APPROVAL_COLUMNS: &str =
    "id, issue_id, requester_id, approver_id, payload, created_at, updated_at";

fn row_to_approval(r: &PgRow) -> Result<ExternalApproval> {
    Ok(ExternalApproval {
        id: ExternalApprovalId::from_uuid(r.get("id")),
        issue_id: IssueId::from_uuid(r.get("issue_id")),
        requester_id: PrincipalId::from_uuid(r.get("requester_id")),
        approver_id: PrincipalId::from_uuid(r.get("approver_id")),
        payload: json_col(r, "payload")?,
        created_at: r.get("created_at"),
        updated_at: r.get("updated_at"),
    })
}

#[async_trait]
impl ExternalApprovalRepository for PgStore {
    async fn create_external_approval(
        &self,
        create: ExternalApprovalCreate,
    ) -> Result<ExternalApproval> {
        let now = Utc::now();
        let approval = ExternalApproval {
            id: ExternalApprovalId::new(),
            issue_id: create.issue_id,
            requester_id: create.requester_id,
            approver_id: create.approver_id,
            payload: create.payload,
            created_at: now,
            updated_at: now,
        };

        // The partial unique index rejects a second live request for the issue.
        sqlx::query(
            r#"INSERT INTO external_approvals (id, issue_id, requester_id, approver_id, payload,
                   created_at, updated_at)
               VALUES ($1, $2, $3, $4, $5, $6, $6)"#,
        )
        .bind(approval.id.as_uuid())
        .bind(approval.issue_id.as_uuid())
        .bind(approval.requester_id.as_uuid())
        .bind(approval.approver_id.as_uuid())
        .bind(serde_json::to_value(&approval.payload)?)
        .bind(now)
        .execute(self.pool())
        .await
        .map_err(|e| match e {
            sqlx::Error::Database(ref db) if db.is_unique_violation() => Error::Conflict(format!(
                "issue {} already has a live approval request",
                approval.issue_id
            )),
            other => db_err(other),
        })?;

        Ok(approval)
    }

    async fn get_external_approval_by_issue(
        &self,
        issue_id: IssueId,
    ) -> Result<Option<ExternalApproval>> {
        let row = sqlx::query(&format!(
            "SELECT {APPROVAL_COLUMNS} FROM external_approvals WHERE issue_id = $1 AND NOT archived"
        ))
        .bind(issue_id.as_uuid())
        .fetch_optional(self.pool())
        .await
        .map_err(db_err)?;

        row.as_ref().map(row_to_approval).transpose()
    }

    async fn list_external_approvals(&self) -> Result<Vec<ExternalApproval>> {
        let rows = sqlx::query(&format!(
            "SELECT {APPROVAL_COLUMNS} FROM external_approvals WHERE NOT archived ORDER BY seq"
        ))
        .fetch_all(self.pool())
        .await
        .map_err(db_err)?;

        rows.iter().map(row_to_approval).collect()
    }

    async fn update_external_approval_payload(
        &self,
        id: ExternalApprovalId,
        payload: &ExternalApprovalPayload,
    ) -> Result<()> {
        sqlx::query("UPDATE external_approvals SET payload = $1, updated_at = NOW() WHERE id = $2")
            .bind(serde_json::to_value(payload)?)
            .bind(id.as_uuid())
            .execute(self.pool())
            .await
            .map_err(db_err)?;
        Ok(())
    }

    async fn archive_external_approval(&self, id: ExternalApprovalId) -> Result<()> {
        sqlx::query("UPDATE external_approvals SET archived = TRUE, updated_at = NOW() WHERE id = $1")
            .bind(id.as_uuid())
            .execute(self.pool())
            .await
            .map_err(db_err)?;
        Ok(())
    }
}
