//! Seed data and runner wiring for integration tests.

use crate::context::TestContext;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use strata_core::approval::ApprovalPolicy;
use strata_core::ids::{DatabaseId, EnvironmentId, PrincipalId, ProjectId};
use strata_core::instance::{DatabaseUpsert, Instance};
use strata_core::issue::{Issue, IssueCreate, IssueType};
use strata_core::payload::{MigrationPayload, TaskPayload};
use strata_core::pipeline::{Pipeline, PipelineCreate, StageCreate};
use strata_core::ports::Store;
use strata_core::principal::{Principal, Role};
use strata_core::task::{TaskCreate, TaskStatus};
use strata_executors::driver::DriverError;
use strata_executors::{
    BasicAdvisor, Driver, DriverFactory, ExecutorDeps, PgDriverFactory, check_executors,
    task_executors,
};
use strata_notify::ActivityManager;
use strata_scheduler::{Runner, RunnerConfig};

pub const TARGET_DATABASE: &str = "shop";

/// A project with one environment, one instance and one database.
pub struct World {
    pub store: Arc<dyn Store>,
    pub owner: PrincipalId,
    pub dba: PrincipalId,
    pub developer: PrincipalId,
    pub project_id: ProjectId,
    pub environment_id: EnvironmentId,
    pub instance: Instance,
    pub database_id: DatabaseId,
}

impl World {
    pub(crate) async fn seed(ctx: &TestContext) -> anyhow::Result<Self> {
        let store = Arc::clone(&ctx.store);
        let owner = principal(&store, "Olive", Role::Owner).await?;
        let dba = principal(&store, "Dana", Role::Dba).await?;
        let developer = principal(&store, "Devon", Role::Developer).await?;

        let project_id = ProjectId::new();
        let environment_id = EnvironmentId::new();
        let instance = ctx.instance(environment_id);
        store.create_instance(&instance).await?;

        match PgDriverFactory::default()
            .connect(&instance)
            .await?
            .create_database(TARGET_DATABASE, "")
            .await
        {
            Ok(()) | Err(DriverError::AlreadyExists(_)) => {}
            Err(e) => return Err(e.into()),
        }
        let database = store
            .upsert_database(DatabaseUpsert {
                instance_id: instance.id,
                project_id,
                name: TARGET_DATABASE.to_string(),
                schema_version: None,
            })
            .await?;

        Ok(Self {
            store,
            owner,
            dba,
            developer,
            project_id,
            environment_id,
            instance,
            database_id: database.id,
        })
    }

    pub async fn approve_automatically(&self) -> anyhow::Result<()> {
        self.store
            .set_approval_policy(&ApprovalPolicy::automatic(self.environment_id))
            .await?;
        Ok(())
    }

    pub async fn driver(&self) -> anyhow::Result<Box<dyn Driver>> {
        Ok(PgDriverFactory::default().connect(&self.instance).await?)
    }

    pub fn schema_update(
        &self,
        name: &str,
        statement: &str,
        version: &str,
        status: TaskStatus,
    ) -> anyhow::Result<TaskCreate> {
        Ok(TaskCreate::new(
            name,
            self.instance.id,
            Some(self.database_id),
            TaskPayload::SchemaUpdate(MigrationPayload {
                statement: statement.to_string(),
                rollback_statement: None,
                schema_version: version.to_string(),
                vcs_push_event: None,
            }),
        )?
        .with_status(status))
    }

    /// One stage per entry, in the world's environment, owned by an issue.
    pub async fn issue(&self, name: &str, stages: Vec<Vec<TaskCreate>>) -> anyhow::Result<(Issue, Pipeline)> {
        let pipeline = self
            .store
            .create_pipeline(PipelineCreate {
                name: name.to_string(),
                creator_id: self.developer,
                stages: stages
                    .into_iter()
                    .enumerate()
                    .map(|(i, tasks)| StageCreate {
                        name: format!("stage-{i}"),
                        environment_id: self.environment_id,
                        tasks,
                        dependencies: vec![],
                    })
                    .collect(),
            })
            .await?;
        let issue = self
            .store
            .create_issue(IssueCreate {
                project_id: self.project_id,
                name: name.to_string(),
                issue_type: IssueType::SchemaUpdate,
                creator_id: self.developer,
                assignee_id: self.dba,
                pipeline_id: pipeline.id,
                subscribers: vec![self.owner],
            })
            .await?;
        Ok((issue, pipeline))
    }

    /// A runner with the real executors and short intervals.
    pub fn runner(&self) -> anyhow::Result<(Runner, Arc<ActivityManager>)> {
        let deps = Arc::new(ExecutorDeps {
            store: Arc::clone(&self.store),
            drivers: Arc::new(PgDriverFactory::default()),
            advisor: Arc::new(BasicAdvisor),
            ghost: None,
            replayer: None,
            backup_dir: std::env::temp_dir().join("strata-it-backups"),
        });
        let activity = Arc::new(ActivityManager::new(Arc::clone(&self.store)));
        let runner = Runner::builder(Arc::clone(&self.store), activity.clone())
            .task_executors(task_executors(Arc::clone(&deps))?)
            .check_executors(check_executors(deps)?)
            .config(RunnerConfig {
                task_interval: Duration::from_millis(100),
                check_interval: Duration::from_millis(100),
                drain_timeout: Duration::from_secs(5),
                ..RunnerConfig::default()
            })
            .build();
        Ok((runner, activity))
    }
}

async fn principal(store: &Arc<dyn Store>, name: &str, role: Role) -> anyhow::Result<PrincipalId> {
    let id = PrincipalId::new();
    store
        .create_principal(&Principal {
            id,
            name: name.to_string(),
            email: format!("{}@example.com", name.to_lowercase()),
            role,
        })
        .await?;
    Ok(id)
}

/// Polls `condition` until it returns true or `timeout` passes.
pub async fn eventually<F, Fut>(timeout: Duration, mut condition: F) -> anyhow::Result<()>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = anyhow::Result<bool>>,
{
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        if condition().await? {
            return Ok(());
        }
        if tokio::time::Instant::now() >= deadline {
            anyhow::bail!("condition not met within {timeout:?}");
        }
        tokio::time::sleep(Duration::from_millis(100)).await;
    }
}
