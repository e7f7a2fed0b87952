//! PostgreSQL driver.
//!
//! Catalog operations go through sqlx. Dumps and restores shell out to
//! `pg_dump` and `psql`, which must be on `PATH` or configured explicitly.

use crate::driver::{Driver, DriverError, DriverFactory, MigrationInfo, MigrationKind, MigrationRecord};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::{PgConnectOptions, PgPoolOptions};
use sqlx::{Connection, PgConnection, PgPool, Row};
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::str::FromStr;
use std::time::Duration;
use strata_core::ids::TaskId;
use strata_core::instance::{Engine, Instance};
use tokio::process::Command;
use tracing::{debug, info};
use uuid::Uuid;

const HISTORY_TABLE: &str = "strata_migration_history";
const MAINTENANCE_DATABASE: &str = "postgres";

/// SQLSTATE for duplicate_database.
const DUPLICATE_DATABASE: &str = "42P04";
/// SQLSTATE for unique_violation.
const UNIQUE_VIOLATION: &str = "23505";

/// Where the client tools live.
#[derive(Debug, Clone)]
pub struct PgTools {
    pub pg_dump: PathBuf,
    pub psql: PathBuf,
}

impl Default for PgTools {
    fn default() -> Self {
        Self {
            pg_dump: PathBuf::from("pg_dump"),
            psql: PathBuf::from("psql"),
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct PgDriverFactory {
    tools: PgTools,
}

impl PgDriverFactory {
    pub fn new(tools: PgTools) -> Self {
        Self { tools }
    }
}

#[async_trait]
impl DriverFactory for PgDriverFactory {
    async fn connect(&self, instance: &Instance) -> Result<Box<dyn Driver>, DriverError> {
        if instance.engine != Engine::Postgres {
            return Err(DriverError::NotSupported(format!(
                "no driver for engine {}",
                instance.engine.as_str()
            )));
        }

        let options = PgConnectOptions::new()
            .host(&instance.host)
            .port(instance.port)
            .username(&instance.username)
            .password(&instance.password);
        let pool = PgPoolOptions::new()
            .max_connections(2)
            .acquire_timeout(Duration::from_secs(10))
            .connect_with(options.clone().database(MAINTENANCE_DATABASE))
            .await
            .map_err(|e| DriverError::Connection(e.to_string()))?;

        debug!(instance = %instance.name, "Connected to instance");
        Ok(Box::new(PgDriver {
            pool,
            options,
            instance: instance.clone(),
            tools: self.tools.clone(),
        }))
    }
}

pub struct PgDriver {
    /// Connected to the maintenance database.
    pool: PgPool,
    options: PgConnectOptions,
    instance: Instance,
    tools: PgTools,
}

impl PgDriver {
    async fn connect_to(&self, database: &str) -> Result<PgConnection, DriverError> {
        PgConnection::connect_with(&self.options.clone().database(database))
            .await
            .map_err(|e| DriverError::Connection(e.to_string()))
    }

    async fn run_tool(&self, program: &Path, args: &[&str], database: &str) -> Result<(), DriverError> {
        let output = Command::new(program)
            .args(args)
            .env("PGHOST", &self.instance.host)
            .env("PGPORT", self.instance.port.to_string())
            .env("PGUSER", &self.instance.username)
            .env("PGPASSWORD", &self.instance.password)
            .env("PGDATABASE", database)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .output()
            .await
            .map_err(|e| DriverError::Tool(format!("failed to spawn {}: {e}", program.display())))?;

        if output.status.success() {
            Ok(())
        } else {
            Err(DriverError::Tool(format!(
                "{} exited with {}: {}",
                program.display(),
                output.status.code().unwrap_or(-1),
                String::from_utf8_lossy(&output.stderr).trim()
            )))
        }
    }
}

fn quote_ident(name: &str) -> String {
    format!("\"{}\"", name.replace('"', "\"\""))
}

fn sqlstate(e: &sqlx::Error) -> Option<String> {
    e.as_database_error()
        .and_then(|d| d.code())
        .map(|c| c.into_owned())
}

fn statement_err(e: sqlx::Error) -> DriverError {
    DriverError::Statement(e.to_string())
}

fn record_from_row(row: &sqlx::postgres::PgRow) -> Result<MigrationRecord, DriverError> {
    let kind: String = row.try_get("kind").map_err(statement_err)?;
    let task_id: Uuid = row.try_get("task_id").map_err(statement_err)?;
    let id: i64 = row.try_get("id").map_err(statement_err)?;
    let created_at: DateTime<Utc> = row.try_get("created_at").map_err(statement_err)?;
    Ok(MigrationRecord {
        id: id.to_string(),
        database: row.try_get("database").map_err(statement_err)?,
        version: row.try_get("version").map_err(statement_err)?,
        kind: MigrationKind::from_str(&kind)?,
        task_id: TaskId::from_uuid(task_id),
        created_at,
    })
}

impl FromStr for MigrationKind {
    type Err = DriverError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "BASELINE" => Ok(MigrationKind::Baseline),
            "MIGRATE" => Ok(MigrationKind::Migrate),
            "DATA" => Ok(MigrationKind::Data),
            "BRANCH" => Ok(MigrationKind::Branch),
            other => Err(DriverError::Statement(format!("unknown migration kind: {other}"))),
        }
    }
}

#[async_trait]
impl Driver for PgDriver {
    async fn ping(&self) -> Result<(), DriverError> {
        sqlx::query("SELECT 1")
            .execute(&self.pool)
            .await
            .map_err(|e| DriverError::Connection(e.to_string()))?;
        Ok(())
    }

    async fn database_exists(&self, name: &str) -> Result<bool, DriverError> {
        let row = sqlx::query("SELECT 1 FROM pg_database WHERE datname = $1")
            .bind(name)
            .fetch_optional(&self.pool)
            .await
            .map_err(statement_err)?;
        Ok(row.is_some())
    }

    async fn create_database(&self, name: &str, statement: &str) -> Result<(), DriverError> {
        let sql = if statement.trim().is_empty() {
            format!("CREATE DATABASE {}", quote_ident(name))
        } else {
            statement.to_string()
        };
        match sqlx::raw_sql(&sql).execute(&self.pool).await {
            Ok(_) => {
                info!(instance = %self.instance.name, database = %name, "Database created");
                Ok(())
            }
            Err(e) if sqlstate(&e).as_deref() == Some(DUPLICATE_DATABASE) => {
                Err(DriverError::AlreadyExists(format!("database {name}")))
            }
            Err(e) => Err(statement_err(e)),
        }
    }

    async fn drop_database_if_exists(&self, name: &str) -> Result<(), DriverError> {
        sqlx::raw_sql(&format!("DROP DATABASE IF EXISTS {}", quote_ident(name)))
            .execute(&self.pool)
            .await
            .map_err(statement_err)?;
        Ok(())
    }

    async fn rename_database(&self, from: &str, to: &str) -> Result<(), DriverError> {
        sqlx::raw_sql(&format!(
            "ALTER DATABASE {} RENAME TO {}",
            quote_ident(from),
            quote_ident(to)
        ))
        .execute(&self.pool)
        .await
        .map_err(statement_err)?;
        Ok(())
    }

    async fn drop_table_if_exists(&self, database: &str, table: &str) -> Result<(), DriverError> {
        let mut conn = self.connect_to(database).await?;
        sqlx::Executor::execute(
            &mut conn,
            sqlx::raw_sql(&format!("DROP TABLE IF EXISTS {}", quote_ident(table))),
        )
        .await
            .map_err(statement_err)?;
        Ok(())
    }

    async fn migration_history_ready(&self, database: &str) -> Result<bool, DriverError> {
        let mut conn = self.connect_to(database).await?;
        let row = sqlx::query(
            "SELECT to_regclass($1) IS NOT NULL AS present, \
             has_schema_privilege('public', 'CREATE') AS can_create",
        )
        .bind(HISTORY_TABLE)
        .fetch_one(&mut conn)
        .await
        .map_err(statement_err)?;
        let present: bool = row.try_get("present").map_err(statement_err)?;
        let can_create: bool = row.try_get("can_create").map_err(statement_err)?;
        Ok(present || can_create)
    }

    async fn find_migration(
        &self,
        database: &str,
        version: &str,
    ) -> Result<Option<MigrationRecord>, DriverError> {
        let mut conn = self.connect_to(database).await?;
        let present: bool = sqlx::query_scalar("SELECT to_regclass($1) IS NOT NULL")
            .bind(HISTORY_TABLE)
            .fetch_one(&mut conn)
            .await
            .map_err(statement_err)?;
        if !present {
            return Ok(None);
        }

        let row = sqlx::query(&format!(
            "SELECT id, database, version, kind, task_id, created_at FROM {HISTORY_TABLE} \
             WHERE database = $1 AND version = $2"
        ))
        .bind(database)
        .bind(version)
        .fetch_optional(&mut conn)
        .await
        .map_err(statement_err)?;
        row.as_ref().map(record_from_row).transpose()
    }

    async fn execute_migration(
        &self,
        info: &MigrationInfo,
        statement: &str,
    ) -> Result<MigrationRecord, DriverError> {
        let mut conn = self.connect_to(&info.database).await?;
        let mut tx = conn.begin().await.map_err(statement_err)?;

        sqlx::Executor::execute(&mut *tx, sqlx::raw_sql(&format!(
            "CREATE TABLE IF NOT EXISTS {HISTORY_TABLE} (\
                id BIGSERIAL PRIMARY KEY, \
                database TEXT NOT NULL, \
                version TEXT NOT NULL, \
                kind TEXT NOT NULL, \
                description TEXT NOT NULL, \
                statement TEXT NOT NULL, \
                task_id UUID NOT NULL, \
                creator_id UUID NOT NULL, \
                created_at TIMESTAMPTZ NOT NULL DEFAULT NOW(), \
                UNIQUE (database, version))"
        )))
        .await
        .map_err(statement_err)?;

        // Recorded first so a duplicate version never runs the statement.
        let row = sqlx::query(&format!(
            "INSERT INTO {HISTORY_TABLE} (database, version, kind, description, statement, task_id, creator_id) \
             VALUES ($1, $2, $3, $4, $5, $6, $7) \
             RETURNING id, database, version, kind, task_id, created_at"
        ))
        .bind(&info.database)
        .bind(&info.version)
        .bind(info.kind.as_str())
        .bind(&info.description)
        .bind(statement)
        .bind(info.task_id.as_uuid())
        .bind(info.creator_id.as_uuid())
        .fetch_one(&mut *tx)
        .await
        .map_err(|e| {
            if sqlstate(&e).as_deref() == Some(UNIQUE_VIOLATION) {
                DriverError::AlreadyExists(format!("migration {} of {}", info.version, info.database))
            } else {
                statement_err(e)
            }
        })?;
        let record = record_from_row(&row)?;

        if !statement.trim().is_empty() {
            sqlx::Executor::execute(&mut *tx, sqlx::raw_sql(statement))
                .await
                .map_err(statement_err)?;
        }
        tx.commit().await.map_err(statement_err)?;

        info!(
            instance = %self.instance.name,
            database = %info.database,
            version = %info.version,
            kind = info.kind.as_str(),
            "Migration applied"
        );
        Ok(record)
    }

    async fn dump(&self, database: &str, path: &Path) -> Result<u64, DriverError> {
        if let Some(dir) = path.parent() {
            tokio::fs::create_dir_all(dir).await?;
        }
        let file = path.to_string_lossy();
        self.run_tool(&self.tools.pg_dump, &["--no-owner", "--file", &file], database)
            .await?;
        Ok(tokio::fs::metadata(path).await?.len())
    }

    async fn restore(&self, database: &str, path: &Path) -> Result<(), DriverError> {
        let file = path.to_string_lossy();
        self.run_tool(
            &self.tools.psql,
            &["--quiet", "-v", "ON_ERROR_STOP=1", "--file", &file],
            database,
        )
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use strata_core::ids::{EnvironmentId, InstanceId};

    #[test]
    fn test_quote_ident_escapes_quotes() {
        assert_eq!(quote_ident("shop"), "\"shop\"");
        assert_eq!(quote_ident("we\"ird"), "\"we\"\"ird\"");
    }

    #[test]
    fn test_migration_kind_round_trips_through_text() {
        for kind in [
            MigrationKind::Baseline,
            MigrationKind::Migrate,
            MigrationKind::Data,
            MigrationKind::Branch,
        ] {
            assert_eq!(MigrationKind::from_str(kind.as_str()).unwrap(), kind);
        }
        assert!(MigrationKind::from_str("SDL").is_err());
    }

    #[tokio::test]
    async fn test_factory_rejects_other_engines() {
        let instance = Instance {
            id: InstanceId::new(),
            environment_id: EnvironmentId::new(),
            name: "prod-mysql".to_string(),
            engine: Engine::Mysql,
            host: "127.0.0.1".to_string(),
            port: 3306,
            username: "root".to_string(),
            password: String::new(),
            archived: false,
        };
        let err = PgDriverFactory::default().connect(&instance).await.err().unwrap();
        assert!(matches!(err, DriverError::NotSupported(_)));
    }
}
