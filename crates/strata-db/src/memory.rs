//! In-memory store for tests and `--memory` dev mode.
//!
//! Rows live in insertion-ordered vectors so listing order matches the
//! `ORDER BY seq` of the Postgres store.

use async_trait::async_trait;
use chrono::Utc;
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};
use strata_core::activity::{Activity, ActivityCreate, InboxEntry, Webhook};
use strata_core::approval::{
    ApprovalPolicy, ExternalApproval, ExternalApprovalCreate, ExternalApprovalPayload,
};
use strata_core::check::{
    TaskCheckRun, TaskCheckRunCreate, TaskCheckRunFind, TaskCheckRunResult, TaskCheckRunStatus,
    TaskCheckRunStatusPatch,
};
use strata_core::ids::*;
use strata_core::instance::{
    Backup, BackupCreate, BackupPatch, BackupStatus, Database, DatabaseUpsert, Instance,
};
use strata_core::issue::{Issue, IssueCreate, IssuePatch, IssueStatus};
use strata_core::pipeline::{Pipeline, PipelineCreate, PipelineStatus};
use strata_core::ports::*;
use strata_core::principal::{Principal, ProjectMember};
use strata_core::task::{Task, TaskFind, TaskStatusPatch};
use strata_core::{Error, Result};
use uuid::Uuid;

/// Thread-safe in-memory implementation of every repository port.
#[derive(Debug, Clone, Default)]
pub struct MemoryStore {
    state: Arc<RwLock<State>>,
}

#[derive(Debug, Default)]
struct State {
    issues: Vec<Issue>,
    /// Pipelines with empty stage task lists; tasks live in `tasks`.
    pipelines: Vec<Pipeline>,
    tasks: Vec<Task>,
    check_runs: Vec<TaskCheckRun>,
    approvals: Vec<(ExternalApproval, bool)>,
    activities: Vec<Activity>,
    inbox: Vec<InboxEntry>,
    webhooks: Vec<Webhook>,
    principals: Vec<Principal>,
    members: Vec<ProjectMember>,
    policies: HashMap<EnvironmentId, ApprovalPolicy>,
    instances: Vec<Instance>,
    databases: Vec<Database>,
    backups: Vec<Backup>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn read(&self) -> Result<RwLockReadGuard<'_, State>> {
        self.state
            .read()
            .map_err(|e| Error::Internal(format!("memory store poisoned: {e}")))
    }

    fn write(&self) -> Result<RwLockWriteGuard<'_, State>> {
        self.state
            .write()
            .map_err(|e| Error::Internal(format!("memory store poisoned: {e}")))
    }
}

impl State {
    fn assemble_pipeline(&self, id: PipelineId) -> Option<Pipeline> {
        let mut pipeline = self.pipelines.iter().find(|p| p.id == id)?.clone();
        for stage in &mut pipeline.stages {
            stage.tasks = self
                .tasks
                .iter()
                .filter(|t| t.stage_id == stage.id)
                .cloned()
                .collect();
        }
        Some(pipeline)
    }
}

#[async_trait]
impl IssueRepository for MemoryStore {
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
        self.write()?.issues.push(issue.clone());
        Ok(issue)
    }

    async fn get_issue(&self, id: IssueId) -> Result<Option<Issue>> {
        Ok(self.read()?.issues.iter().find(|i| i.id == id).cloned())
    }

    async fn get_issue_by_pipeline(&self, pipeline_id: PipelineId) -> Result<Option<Issue>> {
        Ok(self
            .read()?
            .issues
            .iter()
            .find(|i| i.pipeline_id == pipeline_id)
            .cloned())
    }

    async fn list_issues(&self, status: IssueStatus) -> Result<Vec<Issue>> {
        Ok(self
            .read()?
            .issues
            .iter()
            .filter(|i| i.status == status)
            .cloned()
            .collect())
    }

    async fn patch_issue(&self, patch: IssuePatch) -> Result<Issue> {
        let mut state = self.write()?;
        let issue = state
            .issues
            .iter_mut()
            .find(|i| i.id == patch.id)
            .ok_or_else(|| Error::IssueNotFound(patch.id.to_string()))?;

        if let Some(status) = patch.status {
            issue.status = status;
        }
        if let Some(assignee_id) = patch.assignee_id {
            issue.assignee_id = assignee_id;
        }
        issue.updated_at = Utc::now();
        Ok(issue.clone())
    }
}

#[async_trait]
impl PipelineRepository for MemoryStore {
    async fn create_pipeline(&self, create: PipelineCreate) -> Result<Pipeline> {
        let pipeline = create.materialize()?;
        let mut state = self.write()?;

        let mut header = pipeline.clone();
        for stage in &mut header.stages {
            state.tasks.append(&mut stage.tasks);
        }
        state.pipelines.push(header);
        Ok(pipeline)
    }

    async fn get_pipeline(&self, id: PipelineId) -> Result<Option<Pipeline>> {
        Ok(self.read()?.assemble_pipeline(id))
    }

    async fn patch_pipeline_status(
        &self,
        id: PipelineId,
        _updater_id: PrincipalId,
        status: PipelineStatus,
    ) -> Result<()> {
        let mut state = self.write()?;
        let pipeline = state
            .pipelines
            .iter_mut()
            .find(|p| p.id == id)
            .ok_or_else(|| Error::PipelineNotFound(id.to_string()))?;
        pipeline.status = status;
        pipeline.updated_at = Utc::now();
        Ok(())
    }
}

#[async_trait]
impl TaskRepository for MemoryStore {
    async fn get_task(&self, id: TaskId) -> Result<Option<Task>> {
        Ok(self.read()?.tasks.iter().find(|t| t.id == id).cloned())
    }

    async fn list_tasks(&self, find: &TaskFind) -> Result<Vec<Task>> {
        Ok(self
            .read()?
            .tasks
            .iter()
            .filter(|t| find.matches(t))
            .cloned()
            .collect())
    }

    async fn patch_task_status(&self, patch: &TaskStatusPatch) -> Result<Vec<Task>> {
        let ids: HashSet<TaskId> = patch.ids.iter().copied().collect();
        let now = Utc::now();
        let mut state = self.write()?;
        let mut updated = Vec::new();

        for task in state.tasks.iter_mut().filter(|t| ids.contains(&t.id)) {
            if patch.expected_status.is_some_and(|s| s != task.status) {
                continue;
            }
            task.status = patch.status;
            task.updater_id = patch.updater_id;
            if let Some(result) = &patch.result {
                task.result = Some(result.clone());
            }
            task.updated_at = now;
            updated.push(task.clone());
        }
        Ok(updated)
    }
}

#[async_trait]
impl TaskCheckRunRepository for MemoryStore {
    async fn create_task_check_runs(
        &self,
        creates: Vec<TaskCheckRunCreate>,
    ) -> Result<Vec<TaskCheckRun>> {
        let now = Utc::now();
        let runs: Vec<TaskCheckRun> = creates
            .into_iter()
            .map(|c| TaskCheckRun {
                id: TaskCheckRunId::new(),
                task_id: c.task_id,
                check_type: c.check_type,
                status: TaskCheckRunStatus::Running,
                result: TaskCheckRunResult::default(),
                comment: None,
                creator_id: c.creator_id,
                updater_id: c.creator_id,
                created_at: now,
                updated_at: now,
            })
            .collect();
        self.write()?.check_runs.extend(runs.iter().cloned());
        Ok(runs)
    }

    async fn get_task_check_run(&self, id: TaskCheckRunId) -> Result<Option<TaskCheckRun>> {
        Ok(self.read()?.check_runs.iter().find(|r| r.id == id).cloned())
    }

    async fn list_task_check_runs(&self, find: &TaskCheckRunFind) -> Result<Vec<TaskCheckRun>> {
        Ok(self
            .read()?
            .check_runs
            .iter()
            .filter(|r| find.matches(r))
            .cloned()
            .collect())
    }

    async fn patch_task_check_run_status(
        &self,
        patch: &TaskCheckRunStatusPatch,
    ) -> Result<Option<TaskCheckRun>> {
        let mut state = self.write()?;
        let Some(run) = state
            .check_runs
            .iter_mut()
            .find(|r| r.id == patch.id && r.status == TaskCheckRunStatus::Running)
        else {
            return Ok(None);
        };

        run.status = patch.status;
        run.result = patch.result.clone();
        run.comment = patch.comment.clone();
        run.updater_id = patch.updater_id;
        run.updated_at = Utc::now();
        Ok(Some(run.clone()))
    }
}

#[async_trait]
impl ExternalApprovalRepository for MemoryStore {
    async fn create_external_approval(
        &self,
        create: ExternalApprovalCreate,
    ) -> Result<ExternalApproval> {
        let mut state = self.write()?;
        if state
            .approvals
            .iter()
            .any(|(a, archived)| !archived && a.issue_id == create.issue_id)
        {
            return Err(Error::Conflict(format!(
                "issue {} already has a live approval request",
                create.issue_id
            )));
        }

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
        state.approvals.push((approval.clone(), false));
        Ok(approval)
    }

    async fn get_external_approval_by_issue(
        &self,
        issue_id: IssueId,
    ) -> Result<Option<ExternalApproval>> {
        Ok(self
            .read()?
            .approvals
            .iter()
            .find(|(a, archived)| !archived && a.issue_id == issue_id)
            .map(|(a, _)| a.clone()))
    }

    async fn list_external_approvals(&self) -> Result<Vec<ExternalApproval>> {
        Ok(self
            .read()?
            .approvals
            .iter()
            .filter(|(_, archived)| !archived)
            .map(|(a, _)| a.clone())
            .collect())
    }

    async fn update_external_approval_payload(
        &self,
        id: ExternalApprovalId,
        payload: &ExternalApprovalPayload,
    ) -> Result<()> {
        let mut state = self.write()?;
        if let Some((approval, _)) = state.approvals.iter_mut().find(|(a, _)| a.id == id) {
            approval.payload = payload.clone();
            approval.updated_at = Utc::now();
        }
        Ok(())
    }

    async fn archive_external_approval(&self, id: ExternalApprovalId) -> Result<()> {
        let mut state = self.write()?;
        if let Some((_, archived)) = state.approvals.iter_mut().find(|(a, _)| a.id == id) {
            *archived = true;
        }
        Ok(())
    }
}

#[async_trait]
impl ActivityRepository for MemoryStore {
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
        self.write()?.activities.push(activity.clone());
        Ok(activity)
    }

    async fn list_activities(&self, container_id: Uuid) -> Result<Vec<Activity>> {
        Ok(self
            .read()?
            .activities
            .iter()
            .filter(|a| a.container_id == container_id)
            .cloned()
            .collect())
    }

    async fn insert_inbox(&self, receiver_id: PrincipalId, activity_id: ActivityId) -> Result<()> {
        let mut state = self.write()?;
        if !state
            .inbox
            .iter()
            .any(|e| e.receiver_id == receiver_id && e.activity_id == activity_id)
        {
            state.inbox.push(InboxEntry {
                receiver_id,
                activity_id,
                read: false,
            });
        }
        Ok(())
    }

    async fn list_inbox(&self, receiver_id: PrincipalId) -> Result<Vec<InboxEntry>> {
        Ok(self
            .read()?
            .inbox
            .iter()
            .filter(|e| e.receiver_id == receiver_id)
            .cloned()
            .collect())
    }

    async fn create_webhook(&self, webhook: &Webhook) -> Result<()> {
        self.write()?.webhooks.push(webhook.clone());
        Ok(())
    }

    async fn list_webhooks(&self, project_id: ProjectId) -> Result<Vec<Webhook>> {
        Ok(self
            .read()?
            .webhooks
            .iter()
            .filter(|w| w.project_id == project_id)
            .cloned()
            .collect())
    }
}

#[async_trait]
impl DirectoryRepository for MemoryStore {
    async fn create_principal(&self, principal: &Principal) -> Result<()> {
        let mut state = self.write()?;
        state.principals.retain(|p| p.id != principal.id);
        state.principals.push(principal.clone());
        Ok(())
    }

    async fn get_principal(&self, id: PrincipalId) -> Result<Option<Principal>> {
        Ok(self.read()?.principals.iter().find(|p| p.id == id).cloned())
    }

    async fn list_principals(&self) -> Result<Vec<Principal>> {
        let mut principals = self.read()?.principals.clone();
        principals.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(principals)
    }

    async fn add_project_member(&self, member: &ProjectMember) -> Result<()> {
        let mut state = self.write()?;
        state.members.retain(|m| {
            !(m.project_id == member.project_id && m.principal_id == member.principal_id)
        });
        state.members.push(member.clone());
        Ok(())
    }

    async fn list_project_members(&self, project_id: ProjectId) -> Result<Vec<ProjectMember>> {
        Ok(self
            .read()?
            .members
            .iter()
            .filter(|m| m.project_id == project_id)
            .cloned()
            .collect())
    }

    async fn set_approval_policy(&self, policy: &ApprovalPolicy) -> Result<()> {
        self.write()?
            .policies
            .insert(policy.environment_id, policy.clone());
        Ok(())
    }

    async fn get_approval_policy(&self, environment_id: EnvironmentId) -> Result<ApprovalPolicy> {
        Ok(self
            .read()?
            .policies
            .get(&environment_id)
            .cloned()
            .unwrap_or_else(|| ApprovalPolicy::manual(environment_id)))
    }
}

#[async_trait]
impl InstanceRepository for MemoryStore {
    async fn create_instance(&self, instance: &Instance) -> Result<()> {
        let mut state = self.write()?;
        if state.instances.iter().any(|i| i.id == instance.id) {
            return Err(Error::Conflict(format!("instance {} already exists", instance.id)));
        }
        state.instances.push(instance.clone());
        Ok(())
    }

    async fn get_instance(&self, id: InstanceId) -> Result<Option<Instance>> {
        Ok(self.read()?.instances.iter().find(|i| i.id == id).cloned())
    }

    async fn get_database(&self, id: DatabaseId) -> Result<Option<Database>> {
        Ok(self.read()?.databases.iter().find(|d| d.id == id).cloned())
    }

    async fn find_database(
        &self,
        instance_id: InstanceId,
        name: &str,
    ) -> Result<Option<Database>> {
        Ok(self
            .read()?
            .databases
            .iter()
            .find(|d| d.instance_id == instance_id && d.name == name)
            .cloned())
    }

    async fn upsert_database(&self, upsert: DatabaseUpsert) -> Result<Database> {
        let now = Utc::now();
        let mut state = self.write()?;

        if let Some(db) = state
            .databases
            .iter_mut()
            .find(|d| d.instance_id == upsert.instance_id && d.name == upsert.name)
        {
            db.project_id = upsert.project_id;
            if upsert.schema_version.is_some() {
                db.schema_version = upsert.schema_version;
            }
            db.updated_at = now;
            return Ok(db.clone());
        }

        let db = Database {
            id: DatabaseId::new(),
            instance_id: upsert.instance_id,
            project_id: upsert.project_id,
            name: upsert.name,
            schema_version: upsert.schema_version,
            created_at: now,
            updated_at: now,
        };
        state.databases.push(db.clone());
        Ok(db)
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
        self.write()?.backups.push(backup.clone());
        Ok(backup)
    }

    async fn get_backup(&self, id: BackupId) -> Result<Option<Backup>> {
        Ok(self.read()?.backups.iter().find(|b| b.id == id).cloned())
    }

    async fn list_backups(&self, database_id: DatabaseId) -> Result<Vec<Backup>> {
        Ok(self
            .read()?
            .backups
            .iter()
            .filter(|b| b.database_id == database_id)
            .cloned()
            .collect())
    }

    async fn patch_backup(&self, patch: BackupPatch) -> Result<Backup> {
        let mut state = self.write()?;
        let backup = state
            .backups
            .iter_mut()
            .find(|b| b.id == patch.id)
            .ok_or_else(|| Error::BackupNotFound(patch.id.to_string()))?;

        backup.status = patch.status;
        if patch.size_bytes.is_some() {
            backup.size_bytes = patch.size_bytes;
        }
        if patch.comment.is_some() {
            backup.comment = patch.comment;
        }
        backup.updated_at = Utc::now();
        Ok(backup.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use strata_core::payload::{MigrationPayload, TaskPayload};
    use strata_core::pipeline::{StageCreate, TaskIndexDag};
    use strata_core::task::{TaskCreate, TaskStatus};

    fn migration(name: &str, instance_id: InstanceId) -> TaskCreate {
        TaskCreate::new(
            name,
            instance_id,
            None,
            TaskPayload::SchemaUpdate(MigrationPayload {
                statement: "CREATE TABLE t (id INT)".to_string(),
                rollback_statement: None,
                schema_version: "0001".to_string(),
                vcs_push_event: None,
            }),
        )
        .unwrap()
        .with_status(TaskStatus::Pending)
    }

    async fn seeded() -> (MemoryStore, Pipeline) {
        let store = MemoryStore::new();
        let instance_id = InstanceId::new();
        let pipeline = store
            .create_pipeline(PipelineCreate {
                name: "deploy".to_string(),
                creator_id: PrincipalId::SYSTEM_BOT,
                stages: vec![
                    StageCreate {
                        name: "test".to_string(),
                        environment_id: EnvironmentId::new(),
                        tasks: vec![migration("a", instance_id), migration("b", instance_id)],
                        dependencies: vec![TaskIndexDag::new(0, 1)],
                    },
                    StageCreate {
                        name: "prod".to_string(),
                        environment_id: EnvironmentId::new(),
                        tasks: vec![migration("c", instance_id)],
                        dependencies: vec![],
                    },
                ],
            })
            .await
            .unwrap();
        (store, pipeline)
    }

    #[tokio::test]
    async fn test_pipeline_round_trips_through_task_table() {
        let (store, created) = seeded().await;
        let loaded = store.get_pipeline(created.id).await.unwrap().unwrap();

        assert_eq!(loaded.stages.len(), 2);
        assert_eq!(loaded.stages[0].tasks.len(), 2);
        assert_eq!(loaded.stages[1].tasks[0].name, "c");

        let b = &loaded.stages[0].tasks[1];
        assert_eq!(b.blocked_by, vec![loaded.stages[0].tasks[0].id]);
    }

    #[tokio::test]
    async fn test_conditional_patch_skips_moved_rows() {
        let (store, pipeline) = seeded().await;
        let id = pipeline.stages[0].tasks[0].id;

        let first = TaskStatusPatch::new(vec![id], PrincipalId::SYSTEM_BOT, TaskStatus::Running)
            .expecting(TaskStatus::Pending);
        assert_eq!(store.patch_task_status(&first).await.unwrap().len(), 1);
        // Same precondition again: the row is Running now.
        assert!(store.patch_task_status(&first).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_check_run_settles_once() {
        let (store, pipeline) = seeded().await;
        let task_id = pipeline.stages[0].tasks[0].id;
        let runs = store
            .create_task_check_runs(vec![TaskCheckRunCreate {
                task_id,
                check_type: strata_core::check::TaskCheckType::Timing,
                creator_id: PrincipalId::SYSTEM_BOT,
            }])
            .await
            .unwrap();
        assert_eq!(runs[0].status, TaskCheckRunStatus::Running);

        let patch = TaskCheckRunStatusPatch {
            id: runs[0].id,
            updater_id: PrincipalId::SYSTEM_BOT,
            status: TaskCheckRunStatus::Done,
            result: TaskCheckRunResult::default(),
            comment: None,
        };
        assert!(store.patch_task_check_run_status(&patch).await.unwrap().is_some());
        assert!(store.patch_task_check_run_status(&patch).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_single_live_approval_per_issue() {
        let store = MemoryStore::new();
        let issue_id = IssueId::new();
        let create = ExternalApprovalCreate {
            issue_id,
            requester_id: PrincipalId::SYSTEM_BOT,
            approver_id: PrincipalId::new(),
            payload: ExternalApprovalPayload {
                stage_id: StageId::new(),
                assignee_id: PrincipalId::new(),
                instance_code: "code-1".to_string(),
                requester_id: PrincipalId::SYSTEM_BOT,
                rejected: false,
            },
        };

        let first = store.create_external_approval(create.clone()).await.unwrap();
        assert!(matches!(
            store.create_external_approval(create.clone()).await,
            Err(Error::Conflict(_))
        ));

        store.archive_external_approval(first.id).await.unwrap();
        assert!(store.get_external_approval_by_issue(issue_id).await.unwrap().is_none());
        assert!(store.create_external_approval(create).await.is_ok());
    }

    #[tokio::test]
    async fn test_missing_policy_defaults_to_manual() {
        let store = MemoryStore::new();
        let policy = store.get_approval_policy(EnvironmentId::new()).await.unwrap();
        assert!(!policy.is_automatic());
    }
}
