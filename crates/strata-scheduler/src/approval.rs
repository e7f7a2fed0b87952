//! External approval runner.
//!
//! Keeps at most one live approval request per open issue at the external
//! provider, in step with the issue's active stage and assignee, and applies
//! the provider's verdicts.

use crate::executor::catch_panic;
use crate::plan;
use crate::status::StatusService;
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use strata_core::Result;
use strata_core::activity::{ActivityCreate, ActivityLevel, ActivityMeta, ActivityType};
use strata_core::approval::{
    ApprovalRequest, ApprovalTaskSummary, CancelReason, ExternalApproval, ExternalApprovalCreate,
    ExternalApprovalPayload, ExternalApprovalStatus,
};
use strata_core::check::FindingStatus;
use strata_core::ids::{PipelineId, PrincipalId};
use strata_core::issue::{Issue, IssueStatus};
use strata_core::payload::TaskPayload;
use strata_core::pipeline::{Pipeline, Stage};
use strata_core::ports::{ActivitySink, ExternalApprovalProvider, Store};
use strata_core::task::{TaskStatus, TaskStatusPatch};
use tokio::sync::watch;
use tokio::time::interval;
use tracing::{debug, error, info, warn};

pub struct ApprovalRunner {
    store: Arc<dyn Store>,
    status: Arc<StatusService>,
    activity: Arc<dyn ActivitySink>,
    provider: Arc<dyn ExternalApprovalProvider>,
    interval: Duration,
}

impl ApprovalRunner {
    pub fn new(
        status: Arc<StatusService>,
        provider: Arc<dyn ExternalApprovalProvider>,
        interval: Duration,
    ) -> Self {
        Self {
            store: Arc::clone(status.store()),
            activity: Arc::clone(status.activity_sink()),
            status,
            provider,
            interval,
        }
    }

    /// Run the polling loop until shutdown.
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        let mut ticker = interval(self.interval);

        info!(
            interval_secs = self.interval.as_secs(),
            "Starting external approval runner"
        );

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    self.tick().await;
                }
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        info!("External approval runner shutting down");
                        break;
                    }
                }
            }
        }
    }

    /// Requests approvals for open issues, then settles the live ones. Never panics.
    pub async fn tick(&self) {
        let pass = async {
            self.request_approvals().await?;
            self.settle_approvals().await
        };
        match catch_panic(pass).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => error!(error = %e, "External approval tick failed"),
            Err(panic) => error!(panic = %panic, "External approval tick panicked"),
        }
    }

    async fn request_approvals(&self) -> Result<()> {
        for issue in self.store.list_issues(IssueStatus::Open).await? {
            if let Err(e) = self.refresh_issue(&issue).await {
                warn!(issue_id = %issue.id, error = %e, "Failed to refresh external approval");
            }
        }
        Ok(())
    }

    /// Cancels and re-requests the approval of the pipeline's issue when it is stale.
    pub async fn schedule_approval(&self, pipeline_id: PipelineId) -> Result<()> {
        match self.store.get_issue_by_pipeline(pipeline_id).await? {
            Some(issue) if issue.status == IssueStatus::Open => self.refresh_issue(&issue).await,
            _ => Ok(()),
        }
    }

    async fn refresh_issue(&self, issue: &Issue) -> Result<()> {
        let pipeline = self.load_pipeline(issue.pipeline_id).await?;
        let Some(stage) = current_stage(&pipeline) else {
            return Ok(());
        };

        let mut live = self.store.get_external_approval_by_issue(issue.id).await?;
        if let Some(approval) = &live
            && let Some(reason) = stale_reason(&approval.payload, issue, stage)
        {
            self.status.cancel_external_approval(issue.id, reason).await?;
            live = None;
        }

        if live.is_none() && self.should_create(issue, stage).await? {
            self.create(issue, stage).await?;
        }
        Ok(())
    }

    async fn should_create(&self, issue: &Issue, stage: &Stage) -> Result<bool> {
        let policy = self.store.get_approval_policy(stage.environment_id).await?;
        if policy.is_automatic() || issue.assignee_id.is_system_bot() {
            return Ok(false);
        }

        let waiting: Vec<_> = stage
            .tasks
            .iter()
            .filter(|t| t.status == TaskStatus::PendingApproval)
            .collect();
        if waiting.is_empty() {
            return Ok(false);
        }
        for task in waiting {
            if !plan::checks_pass(self.store.as_ref(), task, FindingStatus::Warn).await? {
                return Ok(false);
            }
        }
        Ok(true)
    }

    async fn create(&self, issue: &Issue, stage: &Stage) -> Result<ExternalApproval> {
        let requester = self.principal_email(issue.creator_id).await?;
        let approver = self.principal_email(issue.assignee_id).await?;
        let tasks = stage
            .tasks
            .iter()
            .map(|task| ApprovalTaskSummary {
                name: task.name.clone(),
                statement: TaskPayload::decode(task.task_type, &task.payload)
                    .ok()
                    .and_then(|p| p.statement().map(str::to_string)),
            })
            .collect();

        let instance_code = self
            .provider
            .create_approval(&ApprovalRequest {
                issue_name: issue.name.clone(),
                stage_name: stage.name.clone(),
                requester_email: requester,
                approver_email: approver,
                tasks,
            })
            .await?;

        let approval = self
            .store
            .create_external_approval(ExternalApprovalCreate {
                issue_id: issue.id,
                requester_id: issue.creator_id,
                approver_id: issue.assignee_id,
                payload: ExternalApprovalPayload {
                    stage_id: stage.id,
                    assignee_id: issue.assignee_id,
                    instance_code: instance_code.clone(),
                    requester_id: issue.creator_id,
                    rejected: false,
                },
            })
            .await?;
        info!(issue_id = %issue.id, stage_id = %stage.id, instance_code = %instance_code, "External approval requested");
        Ok(approval)
    }

    async fn settle_approvals(&self) -> Result<()> {
        for approval in self.store.list_external_approvals().await? {
            if approval.payload.rejected {
                continue;
            }
            if let Err(e) = self.settle(&approval).await {
                warn!(
                    issue_id = %approval.issue_id,
                    instance_code = %approval.payload.instance_code,
                    error = %e,
                    "Failed to settle external approval"
                );
            }
        }
        Ok(())
    }

    async fn settle(&self, approval: &ExternalApproval) -> Result<()> {
        let Some(issue) = self.store.get_issue(approval.issue_id).await? else {
            self.store.archive_external_approval(approval.id).await?;
            return Ok(());
        };
        if issue.status != IssueStatus::Open {
            self.status
                .cancel_external_approval(issue.id, CancelReason::IssueNotOpen)
                .await?;
            return Ok(());
        }

        match self
            .provider
            .get_approval_status(&approval.payload.instance_code)
            .await?
        {
            ExternalApprovalStatus::Pending => Ok(()),
            ExternalApprovalStatus::Approved => self.approve(approval, &issue).await,
            ExternalApprovalStatus::Rejected => self.reject(approval, &issue).await,
        }
    }

    async fn approve(&self, approval: &ExternalApproval, issue: &Issue) -> Result<()> {
        let pipeline = self.load_pipeline(issue.pipeline_id).await?;
        let stage = current_stage(&pipeline);

        let still_current = stage.is_some_and(|s| s.id == approval.payload.stage_id)
            && issue.assignee_id == approval.payload.assignee_id;
        if let Some(stage) = stage.filter(|_| still_current) {
            let ids: Vec<_> = stage
                .tasks
                .iter()
                .filter(|t| t.status == TaskStatus::PendingApproval)
                .map(|t| t.id)
                .collect();
            if !ids.is_empty() {
                let approved = self
                    .status
                    .patch_task_status_by_actor(
                        approval.approver_id,
                        TaskStatusPatch::new(ids, approval.approver_id, TaskStatus::Pending)
                            .expecting(TaskStatus::PendingApproval)
                            .with_comment("Approved through external approval"),
                    )
                    .await?;
                info!(issue_id = %issue.id, stage_id = %stage.id, tasks = approved.len(), "Stage approved externally");
            }
            self.comment(issue, approval.approver_id, "approve", &stage.name)
                .await;
        } else {
            debug!(issue_id = %issue.id, "Approved request no longer matches the issue");
        }

        self.store.archive_external_approval(approval.id).await
    }

    async fn reject(&self, approval: &ExternalApproval, issue: &Issue) -> Result<()> {
        let payload = ExternalApprovalPayload {
            rejected: true,
            ..approval.payload.clone()
        };
        self.store
            .update_external_approval_payload(approval.id, &payload)
            .await?;

        let pipeline = self.load_pipeline(issue.pipeline_id).await?;
        let stage_name = pipeline
            .stage(payload.stage_id)
            .map(|s| s.name.as_str())
            .unwrap_or("UNKNOWN");
        info!(issue_id = %issue.id, instance_code = %payload.instance_code, "External approval rejected");
        self.comment(issue, payload.assignee_id, "reject", stage_name)
            .await;
        Ok(())
    }

    async fn comment(&self, issue: &Issue, creator_id: PrincipalId, action: &str, stage_name: &str) {
        let create = ActivityCreate {
            creator_id,
            container_id: *issue.id.as_uuid(),
            activity_type: ActivityType::IssueCommentCreate,
            level: ActivityLevel::Info,
            comment: String::new(),
            payload: json!({
                "externalApprovalEvent": {
                    "action": action,
                    "stageName": stage_name,
                }
            }),
        };
        if let Err(e) = self
            .activity
            .create_activity(create, ActivityMeta::issue(issue.clone()))
            .await
        {
            warn!(issue_id = %issue.id, error = %e, "Failed to record external approval activity");
        }
    }

    async fn principal_email(&self, id: PrincipalId) -> Result<String> {
        self.store
            .get_principal(id)
            .await?
            .map(|p| p.email)
            .ok_or_else(|| strata_core::Error::PrincipalNotFound(id.to_string()))
    }

    async fn load_pipeline(&self, id: PipelineId) -> Result<Pipeline> {
        self.store
            .get_pipeline(id)
            .await?
            .ok_or_else(|| strata_core::Error::PipelineNotFound(id.to_string()))
    }
}

/// The active stage, or the last one once every stage is done.
fn current_stage(pipeline: &Pipeline) -> Option<&Stage> {
    pipeline.active_stage().or_else(|| pipeline.stages.last())
}

fn stale_reason(payload: &ExternalApprovalPayload, issue: &Issue, stage: &Stage) -> Option<CancelReason> {
    if payload.stage_id != stage.id {
        Some(CancelReason::NoTaskPendingApproval)
    } else if payload.assignee_id != issue.assignee_id {
        Some(CancelReason::Reassigned)
    } else if !stage.has_status(TaskStatus::PendingApproval) {
        Some(CancelReason::NoTaskPendingApproval)
    } else {
        None
    }
}
