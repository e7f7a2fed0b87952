//! Test context providing access to the test infrastructure.

use crate::containers::{self, PostgresContainer};
use crate::fixtures::World;
use std::sync::Arc;
use strata_core::instance::{Engine, Instance};
use strata_core::ids::{EnvironmentId, InstanceId};
use strata_core::ports::Store;
use strata_db::Database;

/// The metadata store lives in this database of the container.
const METADATA_DATABASE: &str = "postgres";

/// Test context with a migrated metadata store.
///
/// Drop this to stop the container.
pub struct TestContext {
    pub postgres: PostgresContainer,
    pub db: Database,
    pub store: Arc<dyn Store>,
}

impl TestContext {
    pub async fn new() -> anyhow::Result<Self> {
        crate::init_test_logging();

        let postgres = PostgresContainer::start().await?;
        let db = Database::connect(&postgres.connection_string(METADATA_DATABASE), 5).await?;
        db.migrate().await?;
        let store: Arc<dyn Store> = Arc::new(db.store());

        Ok(Self {
            postgres,
            db,
            store,
        })
    }

    /// The container itself, registered as a managed Postgres instance.
    pub fn instance(&self, environment_id: EnvironmentId) -> Instance {
        Instance {
            id: InstanceId::new(),
            environment_id,
            name: "it-postgres".to_string(),
            engine: Engine::Postgres,
            host: self.postgres.host().to_string(),
            port: self.postgres.port(),
            username: containers::USER.to_string(),
            password: containers::PASSWORD.to_string(),
            archived: false,
        }
    }

    /// Seeds principals, the instance and an empty `shop` database on it.
    pub async fn world(&self) -> anyhow::Result<World> {
        World::seed(self).await
    }
}
