//! PostgreSQL implementation of ActivityRepository.

use super::{PgStore, db_err, parse_col};
use async_trait::async_trait;
use chrono::Utc;
use sqlx::Row;
use sqlx::postgres::PgRow;
use strata_core::Result;
use strata_core::activity::{Activity, ActivityCreate, ActivityType, InboxEntry, Webhook};
use strata_core::ids::*;
use strata_core::ports::ActivityRepository;
use uuid::Uuid;

fn row_to_activity(r: &PgRow) -> Result<Activity> {
    Ok(Activity {
        id: ActivityId::from_uuid(r.get("id")),
        creator_id: PrincipalId::from_uuid(r.get("creator_id")),
        container_id: r.get("container_id"),
        activity_type: parse_col(r, "activity_type")?,
        level: parse_col(r, "level")?,
        comment: r.get("comment"),
        payload: r.get("payload"),
        created_at: r.get("created_at"),
    })
}

fn row_to_webhook(r: &PgRow) -> Result<Webhook> {
    let activity_types = r
        .get::<Vec<String>, _>("activity_types")
        .iter()
        .map(|s| s.parse::<ActivityType>())
        .collect::<Result<Vec<_>>>()?;

    Ok(Webhook {
        id: WebhookId::from_uuid(r.get("id")),
        project_id: ProjectId::from_uuid(r.get("project_id")),
        name: r.get("name"),
        kind: parse_col(r, "kind")?,
        url: r.get("url"),
        activity_types,
    })
}

#[async_trait]
impl ActivityRepository for PgStore {
    async fn insert_activity(&self, create: &ActivityCreate) -> Result<Activity> {
        let activity = Activity {
            id: ActivityId::new(),
            creator_id: create.creator_id,
            container_id: create.container_id,
            activity_type: create.activity_type,
            level: create.level,
            comment: create.comment.clone(),
            payload: create.payload.clone(),
            created_at: Utc::now(),
        };

        sqlx::query(
            r#"INSERT INTO activities (id, creator_id, container_id, activity_type, level, comment,
                   payload, created_at)
               VALUES ($1, $2, $3, $4, $5, $6, $7, $8)"#,
        )
        .bind(activity.id.as_uuid())
        .bind(activity.creator_id.as_uuid())
        .bind(activity.container_id)
        .bind(activity.activity_type.as_str())
        .bind(activity.level.as_str())
        .bind(&activity.comment)
        .bind(&activity.payload)
        .bind(activity.created_at)
        .execute(self.pool())
        .await
        .map_err(db_err)?;

        Ok(activity)
    }

    async fn list_activities(&self, container_id: Uuid) -> Result<Vec<Activity>> {
        let rows = sqlx::query(
            r#"SELECT id, creator_id, container_id, activity_type, level, comment, payload, created_at
               FROM activities WHERE container_id = $1 ORDER BY seq"#,
        )
        .bind(container_id)
        .fetch_all(self.pool())
        .await
        .map_err(db_err)?;

        rows.iter().map(row_to_activity).collect()
    }

    async fn insert_inbox(&self, receiver_id: PrincipalId, activity_id: ActivityId) -> Result<()> {
        sqlx::query(
            r#"INSERT INTO inbox (receiver_id, activity_id) VALUES ($1, $2)
               ON CONFLICT DO NOTHING"#,
        )
        .bind(receiver_id.as_uuid())
        .bind(activity_id.as_uuid())
        .execute(self.pool())
        .await
        .map_err(db_err)?;
        Ok(())
    }

    async fn list_inbox(&self, receiver_id: PrincipalId) -> Result<Vec<InboxEntry>> {
        let rows = sqlx::query(
            r#"SELECT i.receiver_id, i.activity_id, i.read FROM inbox i
               JOIN activities a ON a.id = i.activity_id
               WHERE i.receiver_id = $1 ORDER BY a.seq"#,
        )
        .bind(receiver_id.as_uuid())
        .fetch_all(self.pool())
        .await
        .map_err(db_err)?;

        Ok(rows
            .iter()
            .map(|r| InboxEntry {
                receiver_id: PrincipalId::from_uuid(r.get("receiver_id")),
                activity_id: ActivityId::from_uuid(r.get("activity_id")),
                read: r.get("read"),
            })
            .collect())
    }

    async fn create_webhook(&self, webhook: &Webhook) -> Result<()> {
        let activity_types: Vec<&str> = webhook.activity_types.iter().map(|t| t.as_str()).collect();
        sqlx::query(
            r#"INSERT INTO webhooks (id, project_id, name, kind, url, activity_types)
               VALUES ($1, $2, $3, $4, $5, $6)"#,
        )
        .bind(webhook.id.as_uuid())
        .bind(webhook.project_id.as_uuid())
        .bind(&webhook.name)
        .bind(webhook.kind.as_str())
        .bind(&webhook.url)
        .bind(activity_types)
        .execute(self.pool())
        .await
        .map_err(db_err)?;
        Ok(())
    }

    async fn list_webhooks(&self, project_id: ProjectId) -> Result<Vec<Webhook>> {
        let rows = sqlx::query(
            "SELECT id, project_id, name, kind, url, activity_types FROM webhooks WHERE project_id = $1",
        )
        .bind(project_id.as_uuid())
        .fetch_all(self.pool())
        .await
        .map_err(db_err)?;

        rows.iter().map(row_to_webhook).collect()
    }
}
