//! Port traits (hexagonal architecture).
//!
//! The schedulers only talk to the backing store and to collaborators through
//! these traits. Status updates are conditional single-row writes; callers treat
//! an empty result as "the row moved on", not as an error.

use crate::Result;
use crate::activity::{Activity, ActivityCreate, ActivityMeta, InboxEntry, Webhook};
use crate::approval::{
    ApprovalPolicy, ApprovalRequest, CancelReason, ExternalApproval, ExternalApprovalCreate,
    ExternalApprovalPayload, ExternalApprovalStatus,
};
use crate::check::{TaskCheckRun, TaskCheckRunCreate, TaskCheckRunFind, TaskCheckRunStatusPatch};
use crate::ids::*;
use crate::instance::{Backup, BackupCreate, BackupPatch, Database, DatabaseUpsert, Instance};
use crate::issue::{Issue, IssueCreate, IssuePatch, IssueStatus};
use crate::pipeline::{Pipeline, PipelineCreate, PipelineStatus};
use crate::principal::{Principal, ProjectMember};
use crate::task::{Task, TaskFind, TaskStatusPatch};
use async_trait::async_trait;
use uuid::Uuid;

/// Repository for issues.
#[async_trait]
pub trait IssueRepository: Send + Sync {
    async fn create_issue(&self, create: IssueCreate) -> Result<Issue>;

    async fn get_issue(&self, id: IssueId) -> Result<Option<Issue>>;

    /// The issue owning a pipeline; detached pipelines have none.
    async fn get_issue_by_pipeline(&self, pipeline_id: PipelineId) -> Result<Option<Issue>>;

    async fn list_issues(&self, status: IssueStatus) -> Result<Vec<Issue>>;

    async fn patch_issue(&self, patch: IssuePatch) -> Result<Issue>;
}

/// Repository for pipelines, their stages and tasks.
#[async_trait]
pub trait PipelineRepository: Send + Sync {
    /// Materialize a pipeline. Stage dependency edges become `blocked_by` ids.
    async fn create_pipeline(&self, create: PipelineCreate) -> Result<Pipeline>;

    /// A pipeline with its stages (by position) and their tasks.
    async fn get_pipeline(&self, id: PipelineId) -> Result<Option<Pipeline>>;

    async fn patch_pipeline_status(
        &self,
        id: PipelineId,
        updater_id: PrincipalId,
        status: PipelineStatus,
    ) -> Result<()>;
}

/// Repository for tasks.
#[async_trait]
pub trait TaskRepository: Send + Sync {
    async fn get_task(&self, id: TaskId) -> Result<Option<Task>>;

    /// Tasks in creation order.
    async fn list_tasks(&self, find: &TaskFind) -> Result<Vec<Task>>;

    /// Returns the tasks that were actually updated.
    async fn patch_task_status(&self, patch: &TaskStatusPatch) -> Result<Vec<Task>>;
}

/// Repository for task check runs.
#[async_trait]
pub trait TaskCheckRunRepository: Send + Sync {
    /// Runs are created in `Running` status.
    async fn create_task_check_runs(
        &self,
        creates: Vec<TaskCheckRunCreate>,
    ) -> Result<Vec<TaskCheckRun>>;

    async fn get_task_check_run(&self, id: TaskCheckRunId) -> Result<Option<TaskCheckRun>>;

    /// Runs in creation order.
    async fn list_task_check_runs(&self, find: &TaskCheckRunFind) -> Result<Vec<TaskCheckRun>>;

    /// `None` when the run is no longer `Running`.
    async fn patch_task_check_run_status(
        &self,
        patch: &TaskCheckRunStatusPatch,
    ) -> Result<Option<TaskCheckRun>>;
}

/// Repository for live external approval records.
#[async_trait]
pub trait ExternalApprovalRepository: Send + Sync {
    async fn create_external_approval(
        &self,
        create: ExternalApprovalCreate,
    ) -> Result<ExternalApproval>;

    async fn get_external_approval_by_issue(
        &self,
        issue_id: IssueId,
    ) -> Result<Option<ExternalApproval>>;

    async fn list_external_approvals(&self) -> Result<Vec<ExternalApproval>>;

    async fn update_external_approval_payload(
        &self,
        id: ExternalApprovalId,
        payload: &ExternalApprovalPayload,
    ) -> Result<()>;

    /// Soft-delete; archived records are no longer listed.
    async fn archive_external_approval(&self, id: ExternalApprovalId) -> Result<()>;
}

/// Repository for activities, inboxes and webhooks.
#[async_trait]
pub trait ActivityRepository: Send + Sync {
    async fn insert_activity(&self, create: &ActivityCreate) -> Result<Activity>;

    async fn list_activities(&self, container_id: Uuid) -> Result<Vec<Activity>>;

    async fn insert_inbox(&self, receiver_id: PrincipalId, activity_id: ActivityId) -> Result<()>;

    async fn list_inbox(&self, receiver_id: PrincipalId) -> Result<Vec<InboxEntry>>;

    async fn create_webhook(&self, webhook: &Webhook) -> Result<()>;

    async fn list_webhooks(&self, project_id: ProjectId) -> Result<Vec<Webhook>>;
}

/// Repository for principals, project membership and approval policies.
#[async_trait]
pub trait DirectoryRepository: Send + Sync {
    async fn create_principal(&self, principal: &Principal) -> Result<()>;

    async fn get_principal(&self, id: PrincipalId) -> Result<Option<Principal>>;

    async fn list_principals(&self) -> Result<Vec<Principal>>;

    async fn add_project_member(&self, member: &ProjectMember) -> Result<()>;

    async fn list_project_members(&self, project_id: ProjectId) -> Result<Vec<ProjectMember>>;

    async fn set_approval_policy(&self, policy: &ApprovalPolicy) -> Result<()>;

    /// Environments without a configured policy approve manually.
    async fn get_approval_policy(&self, environment_id: EnvironmentId) -> Result<ApprovalPolicy>;
}

/// Repository for instances, databases and backups.
#[async_trait]
pub trait InstanceRepository: Send + Sync {
    async fn create_instance(&self, instance: &Instance) -> Result<()>;

    async fn get_instance(&self, id: InstanceId) -> Result<Option<Instance>>;

    async fn get_database(&self, id: DatabaseId) -> Result<Option<Database>>;

    async fn find_database(&self, instance_id: InstanceId, name: &str)
    -> Result<Option<Database>>;

    async fn upsert_database(&self, upsert: DatabaseUpsert) -> Result<Database>;

    async fn create_backup(&self, create: BackupCreate) -> Result<Backup>;

    async fn get_backup(&self, id: BackupId) -> Result<Option<Backup>>;

    /// Backups of a database, oldest first.
    async fn list_backups(&self, database_id: DatabaseId) -> Result<Vec<Backup>>;

    async fn patch_backup(&self, patch: BackupPatch) -> Result<Backup>;
}

/// Everything the engine needs from the backing store.
pub trait Store:
    IssueRepository
    + PipelineRepository
    + TaskRepository
    + TaskCheckRunRepository
    + ExternalApprovalRepository
    + ActivityRepository
    + DirectoryRepository
    + InstanceRepository
{
}

impl<T> Store for T where
    T: IssueRepository
        + PipelineRepository
        + TaskRepository
        + TaskCheckRunRepository
        + ExternalApprovalRepository
        + ActivityRepository
        + DirectoryRepository
        + InstanceRepository
{
}

/// Records user-visible state transitions and fans them out.
#[async_trait]
pub trait ActivitySink: Send + Sync {
    async fn create_activity(&self, create: ActivityCreate, meta: ActivityMeta)
    -> Result<Activity>;
}

/// Third-party (chat-based) approval service, keyed by an opaque instance code.
#[async_trait]
pub trait ExternalApprovalProvider: Send + Sync {
    /// Returns the instance code of the new approval.
    async fn create_approval(&self, request: &ApprovalRequest) -> Result<String>;

    async fn get_approval_status(&self, instance_code: &str) -> Result<ExternalApprovalStatus>;

    async fn cancel_approval(&self, instance_code: &str, reason: CancelReason) -> Result<()>;
}
