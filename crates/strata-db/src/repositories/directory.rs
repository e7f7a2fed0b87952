//! PostgreSQL implementation of DirectoryRepository.

use super::{PgStore, db_err, json_col, parse_col};
use async_trait::async_trait;
use sqlx::Row;
use sqlx::postgres::PgRow;
use strata_core::Result;
use strata_core::approval::ApprovalPolicy;
use strata_core::ids::*;
use strata_core::ports::DirectoryRepository;
use strata_core::principal::{Principal, ProjectMember};

fn row_to_principal(r: &PgRow) -> Result<Principal> {
    Ok(Principal {
        id: PrincipalId::from_uuid(r.get("id")),
        name: r.get("name"),
        email: r.get("email"),
        role: parse_col(r, "role")?,
    })
}

#[async_trait]
impl DirectoryRepository for PgStore {
    async fn create_principal(&self, principal: &Principal) -> Result<()> {
        sqlx::query(
            r#"INSERT INTO principals (id, name, email, role) VALUES ($1, $2, $3, $4)
               ON CONFLICT (id) DO UPDATE SET name = $2, email = $3, role = $4"#,
        )
        .bind(principal.id.as_uuid())
        .bind(&principal.name)
        .bind(&principal.email)
        .bind(principal.role.as_str())
        .execute(self.pool())
        .await
        .map_err(db_err)?;
        Ok(())
    }

    async fn get_principal(&self, id: PrincipalId) -> Result<Option<Principal>> {
        let row = sqlx::query("SELECT id, name, email, role FROM principals WHERE id = $1")
            .bind(id.as_uuid())
            .fetch_optional(self.pool())
            .await
            .map_err(db_err)?;

        row.as_ref().map(row_to_principal).transpose()
    }

    async fn list_principals(&self) -> Result<Vec<Principal>> {
        let rows = sqlx::query("SELECT id, name, email, role FROM principals ORDER BY name")
            .fetch_all(self.pool())
            .await
            .map_err(db_err)?;

        rows.iter().map(row_to_principal).collect()
    }

    async fn add_project_member(&self, member: &ProjectMember) -> Result<()> {
        sqlx::query(
            r#"INSERT INTO project_members (project_id, principal_id, role) VALUES ($1, $2, $3)
               ON CONFLICT (project_id, principal_id) DO UPDATE SET role = $3"#,
        )
        .bind(member.project_id.as_uuid())
        .bind(member.principal_id.as_uuid())
        .bind(member.role.as_str())
        .execute(self.pool())
        .await
        .map_err(db_err)?;
        Ok(())
    }

    async fn list_project_members(&self, project_id: ProjectId) -> Result<Vec<ProjectMember>> {
        let rows = sqlx::query(
            "SELECT project_id, principal_id, role FROM project_members WHERE project_id = $1",
        )
        .bind(project_id.as_uuid())
        .fetch_all(self.pool())
        .await
        .map_err(db_err)?;

        rows.iter()
            .map(|r| {
                Ok(ProjectMember {
                    project_id: ProjectId::from_uuid(r.get("project_id")),
                    principal_id: PrincipalId::from_uuid(r.get("principal_id")),
                    role: parse_col(r, "role")?,
                })
            })
            .collect()
    }

    async fn set_approval_policy(&self, policy: &ApprovalPolicy) -> Result<()> {
        sqlx::query(
            r#"INSERT INTO approval_policies (environment_id, mode, assignee_groups)
               VALUES ($1, $2, $3)
               ON CONFLICT (environment_id) DO UPDATE SET mode = $2, assignee_groups = $3"#,
        )
        .bind(policy.environment_id.as_uuid())
        .bind(policy.mode.as_str())
        .bind(serde_json::to_value(&policy.assignee_groups)?)
        .execute(self.pool())
        .await
        .map_err(db_err)?;
        Ok(())
    }

    async fn get_approval_policy(&self, environment_id: EnvironmentId) -> Result<ApprovalPolicy> {
        let row = sqlx::query(
            "SELECT mode, assignee_groups FROM approval_policies WHERE environment_id = $1",
        )
        .bind(environment_id.as_uuid())
        .fetch_optional(self.pool())
        .await
        .map_err(db_err)?;

        let Some(row) = row else {
            return Ok(ApprovalPolicy::manual(environment_id));
        };

        Ok(ApprovalPolicy {
            environment_id,
            mode: parse_col(&row, "mode")?,
            assignee_groups: json_col(&row, "assignee_groups")?,
        })
    }
}
