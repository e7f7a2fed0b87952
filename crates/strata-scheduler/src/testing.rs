//! Shared fixtures for the scheduler's unit tests.

use crate::inflight::InFlight;
use crate::status::StatusService;
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use strata_core::activity::{Activity, ActivityCreate, ActivityMeta};
use strata_core::approval::{ApprovalRequest, CancelReason, ExternalApprovalStatus};
use strata_core::check::{
    Finding, TaskCheckRun, TaskCheckRunResult, TaskCheckRunStatus, TaskCheckRunStatusPatch,
};
use strata_core::ids::*;
use strata_core::instance::{DatabaseUpsert, Engine, Instance};
use strata_core::issue::{Issue, IssueCreate, IssueType};
use strata_core::payload::{MigrationPayload, TaskPayload};
use strata_core::pipeline::{Pipeline, PipelineCreate, StageCreate, TaskIndexDag};
use strata_core::ports::{ActivitySink, ExternalApprovalProvider, Store};
use strata_core::principal::{Principal, Role};
use strata_core::task::{Task, TaskCreate, TaskStatus};
use strata_core::{Error, Result};
use strata_db::MemoryStore;

/// Persists activities without fan-out.
pub struct RecordingSink {
    store: Arc<dyn Store>,
}

#[async_trait]
impl ActivitySink for RecordingSink {
    async fn create_activity(
        &self,
        create: ActivityCreate,
        _meta: ActivityMeta,
    ) -> Result<Activity> {
        self.store.insert_activity(&create).await
    }
}

/// Approval provider whose verdicts are set by the test.
#[derive(Default)]
pub struct FakeApprovalProvider {
    next: AtomicUsize,
    pub created: Mutex<Vec<ApprovalRequest>>,
    pub statuses: Mutex<HashMap<String, ExternalApprovalStatus>>,
    pub canceled: Mutex<Vec<(String, CancelReason)>>,
}

impl FakeApprovalProvider {
    pub fn set_status(&self, code: &str, status: ExternalApprovalStatus) {
        self.statuses.lock().unwrap().insert(code.to_string(), status);
    }

    pub fn canceled(&self) -> Vec<(String, CancelReason)> {
        self.canceled.lock().unwrap().clone()
    }

    pub fn created_count(&self) -> usize {
        self.created.lock().unwrap().len()
    }
}

#[async_trait]
impl ExternalApprovalProvider for FakeApprovalProvider {
    async fn create_approval(&self, request: &ApprovalRequest) -> Result<String> {
        let code = format!("code-{}", self.next.fetch_add(1, Ordering::SeqCst));
        self.created.lock().unwrap().push(request.clone());
        self.set_status(&code, ExternalApprovalStatus::Pending);
        Ok(code)
    }

    async fn get_approval_status(&self, instance_code: &str) -> Result<ExternalApprovalStatus> {
        self.statuses
            .lock()
            .unwrap()
            .get(instance_code)
            .copied()
            .ok_or_else(|| Error::ApprovalProvider(format!("unknown code {instance_code}")))
    }

    async fn cancel_approval(&self, instance_code: &str, reason: CancelReason) -> Result<()> {
        self.canceled
            .lock()
            .unwrap()
            .push((instance_code.to_string(), reason));
        Ok(())
    }
}

pub struct Fixture {
    pub store: Arc<dyn Store>,
    pub sink: Arc<RecordingSink>,
    pub owner: PrincipalId,
    pub dba: PrincipalId,
    pub developer: PrincipalId,
    pub project_id: ProjectId,
    pub environment_id: EnvironmentId,
    pub instance_id: InstanceId,
    pub database_id: DatabaseId,
}

impl Fixture {
    pub async fn new() -> Self {
        let store: Arc<dyn Store> = Arc::new(MemoryStore::new());
        let sink = Arc::new(RecordingSink {
            store: store.clone(),
        });

        let owner = principal(&store, "Olive", Role::Owner).await;
        let dba = principal(&store, "Dana", Role::Dba).await;
        let developer = principal(&store, "Devon", Role::Developer).await;

        let project_id = ProjectId::new();
        let environment_id = EnvironmentId::new();
        let instance_id = InstanceId::new();
        store
            .create_instance(&Instance {
                id: instance_id,
                environment_id,
                name: "prod-pg".to_string(),
                engine: Engine::Postgres,
                host: "127.0.0.1".to_string(),
                port: 5432,
                username: "strata".to_string(),
                password: String::new(),
                archived: false,
            })
            .await
            .unwrap();
        let database = store
            .upsert_database(DatabaseUpsert {
                instance_id,
                project_id,
                name: "shop".to_string(),
                schema_version: None,
            })
            .await
            .unwrap();

        Self {
            store,
            sink,
            owner,
            dba,
            developer,
            project_id,
            environment_id,
            instance_id,
            database_id: database.id,
        }
    }

    pub fn status(&self) -> Arc<StatusService> {
        self.status_with(InFlight::unbounded(), None)
    }

    pub fn status_with(
        &self,
        running: InFlight<TaskId>,
        provider: Option<Arc<FakeApprovalProvider>>,
    ) -> Arc<StatusService> {
        let mut service = StatusService::new(self.store.clone(), self.sink.clone(), running);
        if let Some(provider) = provider {
            service = service.with_approval_provider(provider);
        }
        Arc::new(service)
    }

    pub fn general(&self, name: &str, status: TaskStatus) -> TaskCreate {
        TaskCreate::new(name, self.instance_id, None, TaskPayload::General)
            .unwrap()
            .with_status(status)
    }

    pub fn schema_update(&self, status: TaskStatus) -> TaskCreate {
        TaskCreate::new(
            "Add column",
            self.instance_id,
            Some(self.database_id),
            TaskPayload::SchemaUpdate(MigrationPayload {
                statement: "ALTER TABLE orders ADD COLUMN note TEXT".to_string(),
                rollback_statement: None,
                schema_version: "20240101000000".to_string(),
                vcs_push_event: None,
            }),
        )
        .unwrap()
        .with_status(status)
    }

    /// One stage per entry, all in the fixture environment.
    pub async fn pipeline(&self, stages: Vec<Vec<TaskCreate>>) -> Pipeline {
        self.pipeline_with(
            stages
                .into_iter()
                .map(|tasks| (self.environment_id, tasks, vec![]))
                .collect(),
        )
        .await
    }

    pub async fn pipeline_with(
        &self,
        stages: Vec<(EnvironmentId, Vec<TaskCreate>, Vec<TaskIndexDag>)>,
    ) -> Pipeline {
        let stages = stages
            .into_iter()
            .enumerate()
            .map(|(i, (environment_id, tasks, dependencies))| StageCreate {
                name: format!("stage-{i}"),
                environment_id,
                tasks,
                dependencies,
            })
            .collect();
        self.store
            .create_pipeline(PipelineCreate {
                name: "pipeline".to_string(),
                creator_id: self.developer,
                stages,
            })
            .await
            .unwrap()
    }

    pub async fn issue(&self, pipeline: &Pipeline, issue_type: IssueType, assignee: PrincipalId) -> Issue {
        self.store
            .create_issue(IssueCreate {
                project_id: self.project_id,
                name: "Add note column".to_string(),
                issue_type,
                creator_id: self.developer,
                assignee_id: assignee,
                pipeline_id: pipeline.id,
                subscribers: vec![],
            })
            .await
            .unwrap()
    }

    /// A detached single-task pipeline.
    pub async fn schema_update_task(&self, status: TaskStatus) -> Task {
        let pipeline = self.pipeline(vec![vec![self.schema_update(status)]]).await;
        pipeline.stages[0].tasks[0].clone()
    }

    pub async fn task(&self, id: TaskId) -> Task {
        self.store.get_task(id).await.unwrap().unwrap()
    }

    pub async fn settle(&self, run: &TaskCheckRun, status: TaskCheckRunStatus, findings: Vec<Finding>) {
        self.store
            .patch_task_check_run_status(&TaskCheckRunStatusPatch {
                id: run.id,
                updater_id: PrincipalId::SYSTEM_BOT,
                status,
                result: TaskCheckRunResult {
                    findings,
                    detail: None,
                },
                comment: None,
            })
            .await
            .unwrap();
    }
}

pub async fn principal(store: &Arc<dyn Store>, name: &str, role: Role) -> PrincipalId {
    let id = PrincipalId::new();
    store
        .create_principal(&Principal {
            id,
            name: name.to_string(),
            email: format!("{}@example.com", name.to_lowercase()),
            role,
        })
        .await
        .unwrap();
    id
}
