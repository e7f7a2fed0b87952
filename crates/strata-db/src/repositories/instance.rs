//! PostgreSQL implementation of InstanceRepository.

use super::{PgStore, db_err, parse_col};
use async_trait::async_trait;
use chrono::Utc;
use sqlx::Row;
use sqlx::postgres::PgRow;
use strata_core::ids::*;
use strata_core::instance::{
    Backup, BackupCreate, BackupPatch, BackupStatus, Database, DatabaseUpsert, Instance,
};
use strata_core::ports::InstanceRepository;
use strata_core::{Error, Result};

const DATABASE_COLUMNS: &str =
    "id, instance_id, project_id, name, schema_version, created_at, updated_at";

const BACKUP_COLUMNS: &str =
    "id, database_id, name, status, storage_path, size_bytes, comment, created_at, updated_at";

fn row_to_database(r: &PgRow) -> Database {
    Database {
        id: DatabaseId::from_uuid(r.get("id")),
        instance_id: InstanceId::from_uuid(r.get("instance_id")),
        project_id: ProjectId::from_uuid(r.get("project_id")),
        name: r.get("name"),
        schema_version: r.get("schema_version"),
        created_at: r.get("created_at"),
        updated_at: r.get("updated_at"),
    }
}

fn row_to_backup(r: &PgRow) -> Result<Backup> {
    Ok(Backup {
        id: BackupId::from_uuid(r.get("id")),
        database_id: DatabaseId::from_uuid(r.get("database_id")),
        name: r.get("name"),
        status: parse_col(r, "status")?,
        storage_path: r.get("storage_path"),
        size_bytes: r.get::<Option<i64>, _>("size_bytes").map(|n| n as u64),
        comment: r.get("comment"),
        created_at: r.get("created_at"),
        updated_at: r.get("updated_at"),
    })
}

#[async_trait]
impl InstanceRepository for PgStore {
    async fn create_instance(&self, instance: &Instance) -> Result<()> {
        sqlx::query(
            r#"INSERT INTO instances (id, environment_id, name, engine, host, port, username,
                   password, archived)
               VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)"#,
        )
        .bind(instance.id.as_uuid())
        .bind(instance.environment_id.as_uuid())
        .bind(&instance.name)
        .bind(instance.engine.as_str())
        .bind(&instance.host)
        .bind(instance.port as i32)
        .bind(&instance.username)
        .bind(&instance.password)
        .bind(instance.archived)
        .execute(self.pool())
        .await
        .map_err(db_err)?;
        Ok(())
    }

    async fn get_instance(&self, id: InstanceId) -> Result<Option<Instance>> {
        let row = sqlx::query(
            r#"SELECT id, environment_id, name, engine, host, port, username, password, archived
               FROM instances WHERE id = $1"#,
        )
        .bind(id.as_uuid())
        .fetch_optional(self.pool())
        .await
        .map_err(db_err)?;

        row.map(|r| {
            Ok(Instance {
                id: InstanceId::from_uuid(r.get("id")),
                environment_id: EnvironmentId::from_uuid(r.get("environment_id")),
                name: r.get("name"),
                engine: parse_col(&r, "engine")?,
                host: r.get("host"),
                port: r.get::<i32, _>("port") as u16,
                username: r.get("username"),
                password: r.get("password"),
                archived: r.get("archived"),
            })
        })
        .transpose()
    }

    async fn get_database(&self, id: DatabaseId) -> Result<Option<Database>> {
        let row = sqlx::query(&format!(
            "SELECT {DATABASE_COLUMNS} FROM databases WHERE id = $1"
        ))
        .bind(id.as_uuid())
        .fetch_optional(self.pool())
        .await
        .map_err(db_err)?;

        Ok(row.as_ref().map(row_to_database))
    }

    async fn find_database(
        &self,
        instance_id: InstanceId,
        name: &str,
    ) -> Result<Option<Database>> {
        let row = sqlx::query(&format!(
            "SELECT {DATABASE_COLUMNS} FROM databases WHERE instance_id = $1 AND name = $2"
        ))
        .bind(instance_id.as_uuid())
        .bind(name)
        .fetch_optional(self.pool())
        .await
        .map_err(db_err)?;

        Ok(row.as_ref().map(row_to_database))
    }

    async fn upsert_database(&self, upsert: DatabaseUpsert) -> Result<Database> {
        let row = sqlx::query(&format!(
            r#"INSERT INTO databases (id, instance_id, project_id, name, schema_version)
               VALUES ($1, $2, $3, $4, $5)
               ON CONFLICT (instance_id, name) DO UPDATE
                   SET project_id = $3,
                       schema_version = COALESCE($5, databases.schema_version),
                       updated_at = NOW()
               RETURNING {DATABASE_COLUMNS}"#
        ))
        .bind(DatabaseId::new().as_uuid())
        .bind(upsert.instance_id.as_uuid())
        .bind(upsert.project_id.as_uuid())
        .bind(&upsert.name)
        .bind(upsert.schema_version.as_deref())
        .fetch_one(self.pool())
        .await
        .map_err(db_err)?;

        Ok(row_to_database(&row))
    }

    async fn create_backup(&self, create: BackupCreate) -> Result<Backup> {
        let now = Utc::now();
        let backup = Backup {
            id: BackupId::new(),
            database_id: create.database_id,
            name: create.name,
            status: BackupStatus::PendingCreate,
            storage_path: create.storage_path,
            size_bytes: None,
            comment: None,
            created_at: now,
            updated_at: now,
        };

        sqlx::query(
            r#"INSERT INTO backups (id, database_id, name, status, storage_path, created_at, updated_at)
               VALUES ($1, $2, $3, $4, $5, $6, $6)"#,
        )
        .bind(backup.id.as_uuid())
        .bind(backup.database_id.as_uuid())
        .bind(&backup.name)
        .bind(backup.status.as_str())
        .bind(&backup.storage_path)
        .bind(now)
        .execute(self.pool())
        .await
        .map_err(db_err)?;

        Ok(backup)
    }

    async fn get_backup(&self, id: BackupId) -> Result<Option<Backup>> {
        let row = sqlx::query(&format!("SELECT {BACKUP_COLUMNS} FROM backups WHERE id = $1"))
            .bind(id.as_uuid())
            .fetch_optional(self.pool())
            .await
            .map_err(db_err)?;

        row.as_ref().map(row_to_backup).transpose()
    }

    async fn list_backups(&self, database_id: DatabaseId) -> Result<Vec<Backup>> {
        let rows = sqlx::query(&format!(
            "SELECT {BACKUP_COLUMNS} FROM backups WHERE database_id = $1 ORDER BY seq"
        ))
        .bind(database_id.as_uuid())
        .fetch_all(self.pool())
        .await
        .map_err(db_err)?;

        rows.iter().map(row_to_backup).collect()
    }

    async fn patch_backup(&self, patch: BackupPatch) -> Result<Backup> {
        let row = sqlx::query(&format!(
            r#"UPDATE backups
               SET status = $1, size_bytes = COALESCE($2, size_bytes),
                   comment = COALESCE($3, comment), updated_at = NOW()
               WHERE id = $4
               RETURNING {BACKUP_COLUMNS}"#
        ))
        .bind(patch.status.as_str())
        .bind(patch.size_bytes.map(|n| n as i64))
        .bind(patch.comment.as_deref())
        .bind(patch.id.as_uuid())
        .fetch_optional(self.pool())
        .await
        .map_err(db_err)?
        .ok_or_else(|| Error::BackupNotFound(patch.id.to_string()))?;

        row_to_backup(&row)
    }
}
