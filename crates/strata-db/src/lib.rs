//! Backing stores for strata.
//!
//! [`PgStore`] is the production store on top of a sqlx Postgres pool.
//! [`MemoryStore`] implements the same ports in-process for tests and dev mode.

pub mod memory;
pub mod repositories;

pub use memory::MemoryStore;
pub use repositories::PgStore;

use sqlx::PgPool;
use sqlx::postgres::PgPoolOptions;
use std::time::Duration;
use strata_core::{Error, Result};
use tracing::info;

/// Database connection pool.
#[derive(Clone)]
pub struct Database {
    pool: PgPool,
}

impl Database {
    /// Connect to the database.
    pub async fn connect(database_url: &str, max_connections: u32) -> Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(max_connections)
            .acquire_timeout(Duration::from_secs(5))
            .connect(database_url)
            .await
            .map_err(|e| Error::Database(e.to_string()))?;

        Ok(Self { pool })
    }

    /// Get the connection pool.
    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// A store sharing this pool.
    pub fn store(&self) -> PgStore {
        PgStore::new(self.pool.clone())
    }

    /// Run migrations.
    pub async fn migrate(&self) -> Result<()> {
        sqlx::migrate!("./migrations")
            .run(&self.pool)
            .await
            .map_err(|e| Error::Database(e.to_string()))?;
        info!("Database migrations applied");
        Ok(())
    }

    /// Close the pool once every background worker has drained.
    pub async fn close(&self) {
        self.pool.close().await;
    }
}
