//! Task, check run and issue status transitions.
//!
//! Every transition, whether a scheduler or an actor initiates it, goes
//! through [`StatusService`]: it validates the transition, writes one
//! conditional row per task, records the activity and advances the owning
//! stage, pipeline and issue. Activity failures are logged and never undo a
//! committed transition.

use crate::inflight::InFlight;
use crate::plan;
use serde::Serialize;
use serde_json::json;
use std::collections::HashSet;
use std::sync::Arc;
use strata_core::activity::{
    ActivityCreate, ActivityLevel, ActivityMeta, ActivityType, IssueStatusUpdatePayload,
    TaskStatusUpdatePayload,
};
use strata_core::approval::{AssigneeGroupValue, CancelReason};
use strata_core::check::{FindingStatus, TaskCheckRun, TaskCheckRunStatus, TaskCheckRunStatusPatch};
use strata_core::ids::*;
use strata_core::instance::{BackupPatch, BackupStatus};
use strata_core::issue::{Issue, IssuePatch, IssueStatus, IssueType};
use strata_core::payload::BackupPayload;
use strata_core::pipeline::{Pipeline, PipelineStatus, Stage};
use strata_core::ports::{ActivitySink, ExternalApprovalProvider, Store};
use strata_core::principal::{ProjectRole, Role};
use strata_core::task::{Task, TaskFind, TaskRunResult, TaskStatus, TaskStatusPatch, TaskType};
use strata_core::{Error, Result};
use tracing::{debug, info, warn};

const CANCELLATION_REQUESTED: &str = "Task cancellation requested.";

pub struct StatusService {
    store: Arc<dyn Store>,
    activity: Arc<dyn ActivitySink>,
    approval_provider: Option<Arc<dyn ExternalApprovalProvider>>,
    running: InFlight<TaskId>,
}

impl StatusService {
    /// `running` is the task scheduler's in-flight set; canceling a task fires
    /// the token of its executing worker.
    pub fn new(
        store: Arc<dyn Store>,
        activity: Arc<dyn ActivitySink>,
        running: InFlight<TaskId>,
    ) -> Self {
        Self {
            store,
            activity,
            approval_provider: None,
            running,
        }
    }

    pub fn with_approval_provider(mut self, provider: Arc<dyn ExternalApprovalProvider>) -> Self {
        self.approval_provider = Some(provider);
        self
    }

    pub fn store(&self) -> &Arc<dyn Store> {
        &self.store
    }

    pub fn activity_sink(&self) -> &Arc<dyn ActivitySink> {
        &self.activity
    }

    /// Scheduler-initiated transition; no actor authorization.
    ///
    /// Returns the tasks that actually moved. Tasks already in the target
    /// status, or no longer in `expected_status`, are skipped.
    pub async fn patch_task_status(&self, patch: TaskStatusPatch) -> Result<Vec<Task>> {
        let changes = self.apply_task_status(patch).await?;
        for task in changes.iter().filter(|t| t.status == TaskStatus::Done) {
            self.advance_after_done(task).await?;
        }
        Ok(changes)
    }

    /// Actor-initiated transition. Authorization and the approval gate are
    /// evaluated for every task before anything is written.
    pub async fn patch_task_status_by_actor(
        &self,
        actor: PrincipalId,
        patch: TaskStatusPatch,
    ) -> Result<Vec<Task>> {
        let tasks = self.load_tasks(&patch.ids).await?;

        for task in &tasks {
            if !self
                .can_principal_change_task_status(actor, task, patch.status)
                .await?
            {
                return Err(Error::AuthorizationDenied(format!(
                    "{actor} may not move task {} to {}",
                    task.id, patch.status
                )));
            }
        }

        if patch.status == TaskStatus::Pending {
            for task in tasks.iter().filter(|t| t.status == TaskStatus::PendingApproval) {
                if !plan::checks_pass(self.store.as_ref(), task, FindingStatus::Warn).await? {
                    return Err(Error::ApprovalBlocked(format!(
                        "task {} has checks that are unfinished or report errors",
                        task.id
                    )));
                }
            }
        }

        self.patch_task_status(TaskStatusPatch {
            updater_id: actor,
            ..patch
        })
        .await
    }

    async fn load_tasks(&self, ids: &[TaskId]) -> Result<Vec<Task>> {
        let tasks = self
            .store
            .list_tasks(&TaskFind {
                ids: Some(ids.to_vec()),
                ..Default::default()
            })
            .await?;

        let found: HashSet<TaskId> = tasks.iter().map(|t| t.id).collect();
        if let Some(missing) = ids.iter().find(|id| !found.contains(id)) {
            return Err(Error::TaskNotFound(missing.to_string()));
        }
        Ok(tasks)
    }

    /// Validates and writes the transition without advancing the pipeline.
    pub(crate) async fn apply_task_status(&self, patch: TaskStatusPatch) -> Result<Vec<Task>> {
        let candidates: Vec<Task> = self
            .load_tasks(&patch.ids)
            .await?
            .into_iter()
            .filter(|t| patch.expected_status.is_none_or(|s| s == t.status))
            .filter(|t| t.status != patch.status)
            .collect();

        for task in &candidates {
            task.status.check_transition(patch.status)?;
        }

        let result = match (&patch.result, patch.status) {
            (None, TaskStatus::Canceled) => Some(TaskRunResult::detail(CANCELLATION_REQUESTED)),
            (result, _) => result.clone(),
        };

        let mut changed = Vec::with_capacity(candidates.len());
        for task in candidates {
            if patch.status == TaskStatus::Canceled && self.running.cancel(&task.id) {
                info!(task_id = %task.id, "Signalled running executor to stop");
            }

            let single = TaskStatusPatch {
                ids: vec![task.id],
                updater_id: patch.updater_id,
                status: patch.status,
                expected_status: Some(task.status),
                result: result.clone(),
                comment: patch.comment.clone(),
            };
            let Some(updated) = self.store.patch_task_status(&single).await?.into_iter().next()
            else {
                debug!(task_id = %task.id, "Task moved on before the patch applied");
                continue;
            };

            info!(
                task_id = %updated.id,
                from = %task.status,
                to = %updated.status,
                "Task status changed"
            );
            self.record_task_transition(&task, &updated, patch.comment.as_deref())
                .await;
            changed.push(updated);
        }
        Ok(changed)
    }

    async fn record_task_transition(&self, old: &Task, new: &Task, comment: Option<&str>) {
        let issue = match self.store.get_issue_by_pipeline(new.pipeline_id).await {
            Ok(issue) => issue,
            Err(e) => {
                warn!(task_id = %new.id, error = %e, "Failed to load issue for task activity");
                None
            }
        };

        let payload = TaskStatusUpdatePayload {
            task_id: new.id,
            old_status: old.status,
            new_status: new.status,
            issue_name: issue.as_ref().map(|i| i.name.clone()).unwrap_or_default(),
            task_name: new.name.clone(),
        };
        let level = if new.status == TaskStatus::Failed {
            ActivityLevel::Error
        } else {
            ActivityLevel::Info
        };
        let create = ActivityCreate {
            creator_id: new.updater_id,
            container_id: *new.pipeline_id.as_uuid(),
            activity_type: ActivityType::TaskStatusUpdate,
            level,
            comment: comment.unwrap_or_default().to_string(),
            payload: to_payload(&payload),
        };
        let meta = issue.map(ActivityMeta::issue).unwrap_or_default();

        if let Err(e) = self.activity.create_activity(create, meta).await {
            warn!(task_id = %new.id, error = %e, "Failed to record task status activity");
        }
    }

    /// Follow-up after a task reaches `Done`.
    pub(crate) async fn advance_after_done(&self, task: &Task) -> Result<()> {
        let Some(pipeline) = self.store.get_pipeline(task.pipeline_id).await? else {
            return Ok(());
        };
        let issue = self.store.get_issue_by_pipeline(pipeline.id).await?;

        if let Some(issue) = &issue {
            if let Some(active) = pipeline.active_stage()
                && active.id != task.stage_id
            {
                self.revalidate_assignee(issue, active).await?;
            }

            if pipeline.stage(task.stage_id).is_some_and(Stage::is_done)
                && let Err(e) = self
                    .cancel_external_approval(issue.id, CancelReason::NoTaskPendingApproval)
                    .await
            {
                warn!(issue_id = %issue.id, error = %e, "Failed to cancel external approval");
            }
        }

        if pipeline.is_done() {
            match issue {
                None => {
                    self.store
                        .patch_pipeline_status(
                            pipeline.id,
                            PrincipalId::SYSTEM_BOT,
                            PipelineStatus::Done,
                        )
                        .await?;
                    info!(pipeline_id = %pipeline.id, "Pipeline done");
                }
                Some(issue) if issue.status == IssueStatus::Open => {
                    self.change_issue_status(&issue, IssueStatus::Done, PrincipalId::SYSTEM_BOT, None)
                        .await?;
                }
                Some(_) => {}
            }
        }
        Ok(())
    }

    /// Reassigns the issue when its assignee may not approve the newly active stage.
    async fn revalidate_assignee(&self, issue: &Issue, stage: &Stage) -> Result<()> {
        if self
            .can_principal_be_assignee(
                issue.assignee_id,
                stage.environment_id,
                issue.project_id,
                issue.issue_type,
            )
            .await?
        {
            return Ok(());
        }

        let assignee = self
            .default_assignee(stage.environment_id, issue.project_id, issue.issue_type)
            .await?;
        let updated = self
            .store
            .patch_issue(IssuePatch::assignee(issue.id, PrincipalId::SYSTEM_BOT, assignee))
            .await?;
        info!(
            issue_id = %issue.id,
            old_assignee = %issue.assignee_id,
            new_assignee = %assignee,
            "Issue reassigned for the next stage"
        );

        let create = ActivityCreate {
            creator_id: PrincipalId::SYSTEM_BOT,
            container_id: *issue.id.as_uuid(),
            activity_type: ActivityType::IssueFieldUpdate,
            level: ActivityLevel::Info,
            comment: String::new(),
            payload: json!({
                "fieldId": "assignee",
                "oldValue": issue.assignee_id,
                "newValue": assignee,
                "issueName": issue.name,
            }),
        };
        if let Err(e) = self
            .activity
            .create_activity(create, ActivityMeta::issue(updated))
            .await
        {
            warn!(issue_id = %issue.id, error = %e, "Failed to record reassignment activity");
        }
        Ok(())
    }

    /// Whether `principal_id` may move `task` to `to`.
    ///
    /// Workspace owners and DBAs always may; the task creator may cancel; the
    /// issue assignee may; with a project-owner assignee group, project owners may.
    pub async fn can_principal_change_task_status(
        &self,
        principal_id: PrincipalId,
        task: &Task,
        to: TaskStatus,
    ) -> Result<bool> {
        if principal_id.is_system_bot() {
            return Ok(true);
        }

        let principal = self
            .store
            .get_principal(principal_id)
            .await?
            .ok_or_else(|| Error::PrincipalNotFound(principal_id.to_string()))?;
        if principal.role.is_owner_or_dba() {
            return Ok(true);
        }
        if to == TaskStatus::Canceled && principal_id == task.creator_id {
            return Ok(true);
        }

        let Some(issue) = self.store.get_issue_by_pipeline(task.pipeline_id).await? else {
            return Ok(false);
        };
        if issue.assignee_id == principal_id {
            return Ok(true);
        }

        let pipeline = self.load_pipeline(task.pipeline_id).await?;
        let Some(stage) = pipeline.stage(task.stage_id) else {
            return Ok(false);
        };
        let policy = self.store.get_approval_policy(stage.environment_id).await?;
        if policy.is_automatic() {
            return Ok(false);
        }

        match policy.assignee_group(issue.issue_type) {
            AssigneeGroupValue::ProjectOwner => {
                self.is_project_owner(issue.project_id, principal_id).await
            }
            AssigneeGroupValue::WorkspaceOwnerOrDba => Ok(false),
        }
    }

    /// Whether `principal_id` belongs to the environment's assignee group.
    pub async fn can_principal_be_assignee(
        &self,
        principal_id: PrincipalId,
        environment_id: EnvironmentId,
        project_id: ProjectId,
        issue_type: IssueType,
    ) -> Result<bool> {
        let policy = self.store.get_approval_policy(environment_id).await?;
        if policy.is_automatic() {
            return Ok(true);
        }

        match policy.assignee_group(issue_type) {
            AssigneeGroupValue::WorkspaceOwnerOrDba => {
                let principal = self
                    .store
                    .get_principal(principal_id)
                    .await?
                    .ok_or_else(|| Error::PrincipalNotFound(principal_id.to_string()))?;
                Ok(principal.role.is_owner_or_dba())
            }
            AssigneeGroupValue::ProjectOwner => self.is_project_owner(project_id, principal_id).await,
        }
    }

    /// The assignee an issue falls back to in an environment.
    pub async fn default_assignee(
        &self,
        environment_id: EnvironmentId,
        project_id: ProjectId,
        issue_type: IssueType,
    ) -> Result<PrincipalId> {
        let policy = self.store.get_approval_policy(environment_id).await?;
        if policy.is_automatic() {
            return Ok(PrincipalId::SYSTEM_BOT);
        }

        match policy.assignee_group(issue_type) {
            AssigneeGroupValue::WorkspaceOwnerOrDba => {
                let principals = self.store.list_principals().await?;
                principals
                    .iter()
                    .find(|p| p.role == Role::Owner)
                    .or_else(|| principals.iter().find(|p| p.role == Role::Dba))
                    .map(|p| p.id)
                    .ok_or_else(|| {
                        Error::PrincipalNotFound("no workspace owner or DBA".to_string())
                    })
            }
            AssigneeGroupValue::ProjectOwner => self
                .store
                .list_project_members(project_id)
                .await?
                .into_iter()
                .find(|m| m.role == ProjectRole::Owner)
                .map(|m| m.principal_id)
                .ok_or_else(|| Error::PrincipalNotFound(format!("no owner in project {project_id}"))),
        }
    }

    async fn is_project_owner(&self, project_id: ProjectId, principal_id: PrincipalId) -> Result<bool> {
        Ok(self
            .store
            .list_project_members(project_id)
            .await?
            .iter()
            .any(|m| m.principal_id == principal_id && m.role == ProjectRole::Owner))
    }

    async fn load_pipeline(&self, id: PipelineId) -> Result<Pipeline> {
        self.store
            .get_pipeline(id)
            .await?
            .ok_or_else(|| Error::PipelineNotFound(id.to_string()))
    }

    /// Settles a running check run. `None` when it had already settled.
    pub async fn patch_task_check_run_status(
        &self,
        patch: TaskCheckRunStatusPatch,
    ) -> Result<Option<TaskCheckRun>> {
        let Some(run) = self.store.patch_task_check_run_status(&patch).await? else {
            return Ok(None);
        };

        let worst = run.result.findings.iter().map(|f| f.status).min();
        let level = match (run.status, worst) {
            (TaskCheckRunStatus::Failed, _) | (_, Some(FindingStatus::Error)) => ActivityLevel::Error,
            (_, Some(FindingStatus::Warn)) => ActivityLevel::Warn,
            _ => ActivityLevel::Info,
        };
        debug!(
            check_run_id = %run.id,
            check_type = %run.check_type,
            status = run.status.as_str(),
            "Task check run settled"
        );

        if level != ActivityLevel::Info {
            self.record_check_activity(&run, level, patch.comment.as_deref())
                .await;
        }
        Ok(Some(run))
    }

    async fn record_check_activity(&self, run: &TaskCheckRun, level: ActivityLevel, comment: Option<&str>) {
        let task = match self.store.get_task(run.task_id).await {
            Ok(Some(task)) => task,
            Ok(None) => return,
            Err(e) => {
                warn!(check_run_id = %run.id, error = %e, "Failed to load task for check activity");
                return;
            }
        };
        let issue = self
            .store
            .get_issue_by_pipeline(task.pipeline_id)
            .await
            .ok()
            .flatten();

        let create = ActivityCreate {
            creator_id: run.updater_id,
            container_id: *task.pipeline_id.as_uuid(),
            activity_type: ActivityType::TaskCheckRunStatusUpdate,
            level,
            comment: comment.unwrap_or_default().to_string(),
            payload: json!({
                "taskId": task.id,
                "taskName": task.name,
                "checkRunId": run.id,
                "checkType": run.check_type.as_str(),
                "status": run.status.as_str(),
            }),
        };
        let meta = issue.map(ActivityMeta::issue).unwrap_or_default();
        if let Err(e) = self.activity.create_activity(create, meta).await {
            warn!(check_run_id = %run.id, error = %e, "Failed to record check run activity");
        }
    }

    /// Moves the issue and its pipeline to `status`.
    ///
    /// `Done` requires every task to be `Done`. `Canceled` cancels only the
    /// `Running` tasks; pending and failed tasks keep their last outcome so the
    /// issue can be reopened.
    pub async fn change_issue_status(
        &self,
        issue: &Issue,
        status: IssueStatus,
        updater_id: PrincipalId,
        comment: Option<&str>,
    ) -> Result<Issue> {
        let pipeline = self.load_pipeline(issue.pipeline_id).await?;

        let pipeline_status = match status {
            IssueStatus::Open => PipelineStatus::Open,
            IssueStatus::Done => {
                if let Some(task) = pipeline.tasks().find(|t| t.status != TaskStatus::Done) {
                    return Err(Error::Conflict(format!(
                        "issue {} has task {} in status {}",
                        issue.id, task.id, task.status
                    )));
                }
                PipelineStatus::Done
            }
            IssueStatus::Canceled => {
                let running: Vec<TaskId> = pipeline
                    .tasks()
                    .filter(|t| t.status == TaskStatus::Running)
                    .map(|t| t.id)
                    .collect();
                if !running.is_empty() {
                    let mut patch = TaskStatusPatch::new(running, updater_id, TaskStatus::Canceled)
                        .expecting(TaskStatus::Running);
                    if let Some(comment) = comment {
                        patch = patch.with_comment(comment);
                    }
                    self.apply_task_status(patch).await?;
                }
                PipelineStatus::Canceled
            }
        };

        self.store
            .patch_pipeline_status(pipeline.id, updater_id, pipeline_status)
            .await?;
        let updated = self
            .store
            .patch_issue(IssuePatch::status(issue.id, updater_id, status))
            .await?;
        info!(
            issue_id = %issue.id,
            from = issue.status.as_str(),
            to = status.as_str(),
            "Issue status changed"
        );

        if status != IssueStatus::Open
            && let Err(e) = self
                .cancel_external_approval(issue.id, CancelReason::IssueNotOpen)
                .await
        {
            warn!(issue_id = %issue.id, error = %e, "Failed to cancel external approval");
        }

        let create = ActivityCreate {
            creator_id: updater_id,
            container_id: *issue.id.as_uuid(),
            activity_type: ActivityType::IssueStatusUpdate,
            level: ActivityLevel::Info,
            comment: comment.unwrap_or_default().to_string(),
            payload: to_payload(&IssueStatusUpdatePayload {
                old_status: issue.status,
                new_status: status,
                issue_name: issue.name.clone(),
            }),
        };
        if let Err(e) = self
            .activity
            .create_activity(create, ActivityMeta::issue(updated.clone()))
            .await
        {
            warn!(issue_id = %issue.id, error = %e, "Failed to record issue status activity");
        }

        Ok(updated)
    }

    /// Cancels every `Running` task and fails the backups of running backup
    /// tasks. Operator command; never run implicitly.
    pub async fn clear_running_tasks(&self) -> Result<Vec<Task>> {
        let running = self
            .store
            .list_tasks(&TaskFind::with_status(TaskStatus::Running))
            .await?;
        if running.is_empty() {
            return Ok(vec![]);
        }

        for task in running.iter().filter(|t| t.task_type == TaskType::DatabaseBackup) {
            let payload: BackupPayload = match task.payload() {
                Ok(payload) => payload,
                Err(e) => {
                    warn!(task_id = %task.id, error = %e, "Skipping backup with unreadable payload");
                    continue;
                }
            };
            self.store
                .patch_backup(BackupPatch {
                    id: payload.backup_id,
                    status: BackupStatus::Failed,
                    size_bytes: None,
                    comment: Some("Backup interrupted by an operator".to_string()),
                })
                .await?;
        }

        let ids = running.iter().map(|t| t.id).collect();
        let cleared = self
            .apply_task_status(
                TaskStatusPatch::new(ids, PrincipalId::SYSTEM_BOT, TaskStatus::Canceled)
                    .expecting(TaskStatus::Running)
                    .with_comment("Cleared by an operator"),
            )
            .await?;
        info!(count = cleared.len(), "Cleared running tasks");
        Ok(cleared)
    }

    /// Archives the issue's live approval and cancels it at the provider.
    /// Returns whether there was one.
    pub async fn cancel_external_approval(
        &self,
        issue_id: IssueId,
        reason: CancelReason,
    ) -> Result<bool> {
        let Some(approval) = self.store.get_external_approval_by_issue(issue_id).await? else {
            return Ok(false);
        };

        self.store.archive_external_approval(approval.id).await?;
        if let Some(provider) = &self.approval_provider {
            provider
                .cancel_approval(&approval.payload.instance_code, reason)
                .await?;
        }
        info!(
            issue_id = %issue_id,
            instance_code = %approval.payload.instance_code,
            reason = reason.as_str(),
            "External approval canceled"
        );
        Ok(true)
    }
}

fn to_payload<T: Serialize>(payload: &T) -> serde_json::Value {
    serde_json::to_value(payload).unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::inflight::Claim;
    use crate::testing::{FakeApprovalProvider, Fixture, principal};
    use strata_core::approval::{
        ApprovalPolicy, AssigneeGroup, ExternalApprovalCreate, ExternalApprovalPayload,
    };
    use strata_core::check::{Finding, TaskCheckRunFind};
    use strata_core::instance::BackupCreate;
    use strata_core::payload::TaskPayload;
    use strata_core::principal::ProjectMember;
    use strata_core::task::TaskCreate;

    #[tokio::test]
    async fn test_cancel_issue_cancels_only_running_tasks() {
        let fx = Fixture::new().await;
        let running = InFlight::unbounded();
        let status = fx.status_with(running.clone(), None);
        let pipeline = fx
            .pipeline(vec![vec![
                fx.general("migrate", TaskStatus::Running),
                fx.general("verify", TaskStatus::Pending),
            ]])
            .await;
        let issue = fx
            .issue(&pipeline, IssueType::General, fx.dba)
            .await;
        let running_id = pipeline.stages[0].tasks[0].id;
        let pending_id = pipeline.stages[0].tasks[1].id;

        let Claim::Claimed(guard) = running.try_claim(running_id, fx.instance_id) else {
            panic!("expected claim");
        };
        let token = guard.cancel_token();

        let updated = status
            .change_issue_status(&issue, IssueStatus::Canceled, fx.dba, Some("wrong change"))
            .await
            .unwrap();

        assert_eq!(updated.status, IssueStatus::Canceled);
        assert!(token.is_cancelled());

        let canceled = fx.task(running_id).await;
        assert_eq!(canceled.status, TaskStatus::Canceled);
        assert_eq!(canceled.result.unwrap().detail, CANCELLATION_REQUESTED);
        assert_eq!(fx.task(pending_id).await.status, TaskStatus::Pending);

        let pipeline = fx.store.get_pipeline(pipeline.id).await.unwrap().unwrap();
        assert_eq!(pipeline.status, PipelineStatus::Canceled);

        let issue_activities = fx.store.list_activities(*issue.id.as_uuid()).await.unwrap();
        assert_eq!(issue_activities.len(), 1);
        assert_eq!(issue_activities[0].activity_type, ActivityType::IssueStatusUpdate);
        assert_eq!(issue_activities[0].comment, "wrong change");

        let task_activities = fx.store.list_activities(*pipeline.id.as_uuid()).await.unwrap();
        assert_eq!(task_activities.len(), 1);
        assert_eq!(task_activities[0].payload["newStatus"], "canceled");
    }

    #[tokio::test]
    async fn test_done_requires_every_task_done() {
        let fx = Fixture::new().await;
        let status = fx.status();
        let pipeline = fx
            .pipeline(vec![vec![
                fx.general("a", TaskStatus::Done),
                fx.general("b", TaskStatus::Failed),
            ]])
            .await;
        let issue = fx.issue(&pipeline, IssueType::General, fx.dba).await;

        let err = status
            .change_issue_status(&issue, IssueStatus::Done, fx.dba, None)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Conflict(_)));

        let unchanged = fx.store.get_issue(issue.id).await.unwrap().unwrap();
        assert_eq!(unchanged.status, IssueStatus::Open);
    }

    #[tokio::test]
    async fn test_illegal_transition_writes_nothing() {
        let fx = Fixture::new().await;
        let status = fx.status();
        let pipeline = fx
            .pipeline(vec![vec![
                fx.general("pending", TaskStatus::Pending),
                fx.general("done", TaskStatus::Done),
            ]])
            .await;
        let ids: Vec<TaskId> = pipeline.tasks().map(|t| t.id).collect();

        let err = status
            .patch_task_status(TaskStatusPatch::new(
                ids.clone(),
                PrincipalId::SYSTEM_BOT,
                TaskStatus::Running,
            ))
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            Error::InvalidStatusTransition {
                from: TaskStatus::Done,
                to: TaskStatus::Running
            }
        ));
        assert_eq!(fx.task(ids[0]).await.status, TaskStatus::Pending);
    }

    #[tokio::test]
    async fn test_same_status_patch_is_a_no_op() {
        let fx = Fixture::new().await;
        let status = fx.status();
        let pipeline = fx
            .pipeline(vec![vec![fx.general("a", TaskStatus::Pending)]])
            .await;
        let id = pipeline.stages[0].tasks[0].id;

        let moved = status
            .patch_task_status(TaskStatusPatch::new(
                vec![id],
                PrincipalId::SYSTEM_BOT,
                TaskStatus::Pending,
            ))
            .await
            .unwrap();
        assert!(moved.is_empty());
        assert!(fx.store.list_activities(*pipeline.id.as_uuid()).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_unknown_task_is_not_found() {
        let fx = Fixture::new().await;
        let err = fx
            .status()
            .patch_task_status(TaskStatusPatch::new(
                vec![TaskId::new()],
                PrincipalId::SYSTEM_BOT,
                TaskStatus::Pending,
            ))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::TaskNotFound(_)));
    }

    #[tokio::test]
    async fn test_approval_waits_for_clean_checks_and_is_idempotent() {
        let fx = Fixture::new().await;
        let status = fx.status();
        let pipeline = fx
            .pipeline(vec![vec![fx.schema_update(TaskStatus::PendingApproval)]])
            .await;
        fx.issue(&pipeline, IssueType::SchemaUpdate, fx.dba).await;
        let task = pipeline.stages[0].tasks[0].clone();
        let approve = || TaskStatusPatch::new(vec![task.id], fx.owner, TaskStatus::Pending);

        let err = status
            .patch_task_status_by_actor(fx.owner, approve())
            .await
            .unwrap_err();
        assert!(matches!(err, Error::ApprovalBlocked(_)));

        let runs = plan::schedule_check_if_needed(fx.store.as_ref(), &task, fx.owner, false)
            .await
            .unwrap();
        let err = status
            .patch_task_status_by_actor(fx.owner, approve())
            .await
            .unwrap_err();
        assert!(matches!(err, Error::ApprovalBlocked(_)));

        for run in &runs {
            fx.settle(run, TaskCheckRunStatus::Done, vec![Finding::success("OK")])
                .await;
        }
        let approved = status
            .patch_task_status_by_actor(fx.owner, approve())
            .await
            .unwrap();
        assert_eq!(approved.len(), 1);
        assert_eq!(approved[0].status, TaskStatus::Pending);
        assert_eq!(approved[0].updater_id, fx.owner);

        let again = status
            .patch_task_status_by_actor(fx.owner, approve())
            .await
            .unwrap();
        assert!(again.is_empty());
        assert_eq!(fx.task(task.id).await.status, TaskStatus::Pending);
    }

    #[tokio::test]
    async fn test_error_finding_blocks_approval() {
        let fx = Fixture::new().await;
        let status = fx.status();
        let task = fx.schema_update_task(TaskStatus::PendingApproval).await;
        let runs = plan::schedule_check_if_needed(fx.store.as_ref(), &task, fx.owner, false)
            .await
            .unwrap();
        for run in &runs {
            let findings = if run.check_type == strata_core::check::TaskCheckType::StatementAdvise {
                vec![Finding::error(401, "DROP without backup", "DROP TABLE orders")]
            } else {
                vec![]
            };
            fx.settle(run, TaskCheckRunStatus::Done, findings).await;
        }

        let err = status
            .patch_task_status_by_actor(
                fx.owner,
                TaskStatusPatch::new(vec![task.id], fx.owner, TaskStatus::Pending),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, Error::ApprovalBlocked(_)));
        assert_eq!(fx.task(task.id).await.status, TaskStatus::PendingApproval);
    }

    #[tokio::test]
    async fn test_authorization_rules() {
        let fx = Fixture::new().await;
        let status = fx.status();
        let pipeline = fx
            .pipeline(vec![vec![
                fx.general("approve me", TaskStatus::PendingApproval),
                fx.general("cancel me", TaskStatus::Pending),
            ]])
            .await;
        fx.issue(&pipeline, IssueType::General, fx.dba).await;
        let approve_id = pipeline.stages[0].tasks[0].id;
        let cancel_id = pipeline.stages[0].tasks[1].id;
        let outsider = principal(&fx.store, "Oscar", Role::Developer).await;

        let err = status
            .patch_task_status_by_actor(
                outsider,
                TaskStatusPatch::new(vec![approve_id], outsider, TaskStatus::Pending),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, Error::AuthorizationDenied(_)));
        assert_eq!(fx.task(approve_id).await.status, TaskStatus::PendingApproval);

        // The developer created the pipeline and may cancel, not approve.
        let canceled = status
            .patch_task_status_by_actor(
                fx.developer,
                TaskStatusPatch::new(vec![cancel_id], fx.developer, TaskStatus::Canceled),
            )
            .await
            .unwrap();
        assert_eq!(canceled.len(), 1);
        assert!(
            status
                .patch_task_status_by_actor(
                    fx.developer,
                    TaskStatusPatch::new(vec![approve_id], fx.developer, TaskStatus::Pending),
                )
                .await
                .is_err()
        );

        // A project owner may approve once the environment says so.
        fx.store
            .set_approval_policy(&ApprovalPolicy {
                environment_id: fx.environment_id,
                mode: strata_core::approval::ApprovalMode::Manual,
                assignee_groups: vec![AssigneeGroup {
                    issue_type: IssueType::General,
                    value: AssigneeGroupValue::ProjectOwner,
                }],
            })
            .await
            .unwrap();
        fx.store
            .add_project_member(&ProjectMember {
                project_id: fx.project_id,
                principal_id: outsider,
                role: ProjectRole::Owner,
            })
            .await
            .unwrap();
        let approved = status
            .patch_task_status_by_actor(
                outsider,
                TaskStatusPatch::new(vec![approve_id], outsider, TaskStatus::Pending),
            )
            .await
            .unwrap();
        assert_eq!(approved.len(), 1);
    }

    #[tokio::test]
    async fn test_finishing_a_stage_advances_the_issue() {
        let fx = Fixture::new().await;
        let provider = Arc::new(FakeApprovalProvider::default());
        let status = fx.status_with(InFlight::unbounded(), Some(provider.clone()));

        let lead = principal(&fx.store, "Lee", Role::Developer).await;
        fx.store
            .add_project_member(&ProjectMember {
                project_id: fx.project_id,
                principal_id: lead,
                role: ProjectRole::Owner,
            })
            .await
            .unwrap();
        let prod = EnvironmentId::new();
        fx.store
            .set_approval_policy(&ApprovalPolicy {
                environment_id: prod,
                mode: strata_core::approval::ApprovalMode::Manual,
                assignee_groups: vec![AssigneeGroup {
                    issue_type: IssueType::General,
                    value: AssigneeGroupValue::ProjectOwner,
                }],
            })
            .await
            .unwrap();

        let pipeline = fx
            .pipeline_with(vec![
                (fx.environment_id, vec![fx.general("test", TaskStatus::Running)], vec![]),
                (prod, vec![fx.general("prod", TaskStatus::PendingApproval)], vec![]),
            ])
            .await;
        let issue = fx.issue(&pipeline, IssueType::General, fx.dba).await;
        fx.store
            .create_external_approval(ExternalApprovalCreate {
                issue_id: issue.id,
                requester_id: fx.developer,
                approver_id: fx.dba,
                payload: ExternalApprovalPayload {
                    stage_id: pipeline.stages[0].id,
                    assignee_id: fx.dba,
                    instance_code: "code-test".to_string(),
                    requester_id: fx.developer,
                    rejected: false,
                },
            })
            .await
            .unwrap();

        let first = pipeline.stages[0].tasks[0].id;
        status
            .patch_task_status(
                TaskStatusPatch::new(vec![first], PrincipalId::SYSTEM_BOT, TaskStatus::Done)
                    .expecting(TaskStatus::Running),
            )
            .await
            .unwrap();

        let issue_now = fx.store.get_issue(issue.id).await.unwrap().unwrap();
        assert_eq!(issue_now.assignee_id, lead);
        assert_eq!(issue_now.status, IssueStatus::Open);
        assert!(
            fx.store
                .get_external_approval_by_issue(issue.id)
                .await
                .unwrap()
                .is_none()
        );
        assert_eq!(
            provider.canceled(),
            vec![("code-test".to_string(), CancelReason::NoTaskPendingApproval)]
        );

        // Finishing the last task closes the issue.
        let last = pipeline.stages[1].tasks[0].id;
        for next in [TaskStatus::Pending, TaskStatus::Running, TaskStatus::Done] {
            status
                .patch_task_status(TaskStatusPatch::new(vec![last], PrincipalId::SYSTEM_BOT, next))
                .await
                .unwrap();
        }
        let closed = fx.store.get_issue(issue.id).await.unwrap().unwrap();
        assert_eq!(closed.status, IssueStatus::Done);
        let pipeline = fx.store.get_pipeline(pipeline.id).await.unwrap().unwrap();
        assert_eq!(pipeline.status, PipelineStatus::Done);
    }

    #[tokio::test]
    async fn test_detached_pipeline_is_marked_done() {
        let fx = Fixture::new().await;
        let status = fx.status();
        let pipeline = fx
            .pipeline(vec![vec![fx.general("backup", TaskStatus::Running)]])
            .await;

        status
            .patch_task_status(TaskStatusPatch::new(
                vec![pipeline.stages[0].tasks[0].id],
                PrincipalId::SYSTEM_BOT,
                TaskStatus::Done,
            ))
            .await
            .unwrap();

        let pipeline = fx.store.get_pipeline(pipeline.id).await.unwrap().unwrap();
        assert_eq!(pipeline.status, PipelineStatus::Done);
    }

    #[tokio::test]
    async fn test_clear_running_tasks_fails_backups() {
        let fx = Fixture::new().await;
        let status = fx.status();
        let backup = fx
            .store
            .create_backup(BackupCreate {
                database_id: fx.database_id,
                name: "nightly".to_string(),
                storage_path: "shop/nightly.sql".to_string(),
            })
            .await
            .unwrap();
        let backup_task = TaskCreate::new(
            "Backup shop",
            fx.instance_id,
            Some(fx.database_id),
            TaskPayload::DatabaseBackup(BackupPayload {
                backup_id: backup.id,
            }),
        )
        .unwrap()
        .with_status(TaskStatus::Running);
        let pipeline = fx
            .pipeline(vec![vec![backup_task, fx.general("idle", TaskStatus::Pending)]])
            .await;

        let cleared = status.clear_running_tasks().await.unwrap();
        assert_eq!(cleared.len(), 1);
        assert_eq!(cleared[0].status, TaskStatus::Canceled);

        let backup = fx.store.get_backup(backup.id).await.unwrap().unwrap();
        assert_eq!(backup.status, BackupStatus::Failed);
        assert_eq!(
            fx.task(pipeline.stages[0].tasks[1].id).await.status,
            TaskStatus::Pending
        );
    }

    #[tokio::test]
    async fn test_failed_check_run_is_recorded_as_error_activity() {
        let fx = Fixture::new().await;
        let status = fx.status();
        let task = fx.schema_update_task(TaskStatus::PendingApproval).await;
        let runs = plan::schedule_check_if_needed(fx.store.as_ref(), &task, fx.owner, false)
            .await
            .unwrap();

        let settled = status
            .patch_task_check_run_status(TaskCheckRunStatusPatch {
                id: runs[0].id,
                updater_id: PrincipalId::SYSTEM_BOT,
                status: TaskCheckRunStatus::Failed,
                result: Default::default(),
                comment: Some("connection refused".to_string()),
            })
            .await
            .unwrap();
        assert!(settled.is_some());

        let again = status
            .patch_task_check_run_status(TaskCheckRunStatusPatch {
                id: runs[0].id,
                updater_id: PrincipalId::SYSTEM_BOT,
                status: TaskCheckRunStatus::Done,
                result: Default::default(),
                comment: None,
            })
            .await
            .unwrap();
        assert!(again.is_none());

        let activities = fx.store.list_activities(*task.pipeline_id.as_uuid()).await.unwrap();
        assert_eq!(activities.len(), 1);
        assert_eq!(activities[0].level, ActivityLevel::Error);
        assert_eq!(activities[0].comment, "connection refused");

        let remaining = fx
            .store
            .list_task_check_runs(&TaskCheckRunFind::with_status(TaskCheckRunStatus::Running))
            .await
            .unwrap();
        assert_eq!(remaining.len(), runs.len() - 1);
    }
}
