//! Polling loop that moves tasks through approval, promotion and execution.
//!
//! Each tick runs three phases over the store:
//!
//! 1. auto-approve `PendingApproval` tasks of the active stage when the
//!    environment approves automatically and every check is clean;
//! 2. promote eligible `Pending` tasks to `Running`;
//! 3. dispatch every `Running` task that is not already executing in this
//!    process, which also re-invokes tasks left `Running` by a restart.

use crate::executor::{ExecutionContext, RunOnce, TaskExecutor, catch_panic};
use crate::inflight::{Claim, InFlight, InFlightGuard};
use crate::plan;
use crate::registry::TaskExecutorRegistry;
use crate::status::StatusService;
use chrono::Utc;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;
use strata_core::Result;
use strata_core::check::FindingStatus;
use strata_core::ids::{DatabaseId, InstanceId, PipelineId, PrincipalId, TaskId};
use strata_core::pipeline::{Pipeline, PipelineStatus, Stage};
use strata_core::ports::Store;
use strata_core::task::{Progress, Task, TaskFind, TaskRunResult, TaskStatus, TaskStatusPatch};
use tokio::sync::{Notify, watch};
use tokio::time::interval;
use tokio_util::task::TaskTracker;
use tracing::{debug, error, info, warn};

struct Shared {
    store: Arc<dyn Store>,
    status: Arc<StatusService>,
    executors: Arc<TaskExecutorRegistry>,
    running: InFlight<TaskId>,
    /// Wakes the loop early after a task finishes.
    wake: Notify,
}

pub struct TaskScheduler {
    shared: Arc<Shared>,
    tracker: TaskTracker,
    interval: Duration,
}

impl TaskScheduler {
    /// `running` must be the same set the status service cancels through.
    pub fn new(
        status: Arc<StatusService>,
        executors: Arc<TaskExecutorRegistry>,
        running: InFlight<TaskId>,
        tracker: TaskTracker,
        interval: Duration,
    ) -> Self {
        Self {
            shared: Arc::new(Shared {
                store: Arc::clone(status.store()),
                status,
                executors,
                running,
                wake: Notify::new(),
            }),
            tracker,
            interval,
        }
    }

    /// Run the polling loop until shutdown.
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        let mut ticker = interval(self.interval);

        info!(
            interval_ms = self.interval.as_millis() as u64,
            executors = self.shared.executors.len(),
            "Starting task scheduler"
        );

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    self.tick().await;
                }
                _ = self.shared.wake.notified() => {
                    self.tick().await;
                }
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        info!("Task scheduler shutting down");
                        break;
                    }
                }
            }
        }
    }

    /// One pass of all three phases. Never panics.
    pub async fn tick(&self) {
        match catch_panic(self.schedule()).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => error!(error = %e, "Task scheduler tick failed"),
            Err(panic) => error!(panic = %panic, "Task scheduler tick panicked"),
        }
    }

    async fn schedule(&self) -> Result<()> {
        self.shared.auto_approve(None).await?;
        self.shared.promote_pending(None).await?;
        self.dispatch_running().await
    }

    async fn dispatch_running(&self) -> Result<()> {
        let tasks = self
            .shared
            .store
            .list_tasks(&TaskFind::with_status(TaskStatus::Running))
            .await?;

        // Tasks come back in creation order; the earliest per database wins.
        let mut databases: HashSet<DatabaseId> = HashSet::new();
        let mut instances: HashMap<InstanceId, bool> = HashMap::new();
        for task in tasks {
            if let Some(database_id) = task.database_id
                && !databases.insert(database_id)
            {
                debug!(task_id = %task.id, database_id = %database_id, "Database busy with an earlier task");
                continue;
            }

            let usable = match instances.get(&task.instance_id) {
                Some(usable) => *usable,
                None => {
                    let usable = self.shared.instance_usable(&task).await?;
                    instances.insert(task.instance_id, usable);
                    usable
                }
            };
            if !usable {
                continue;
            }

            let Some(executor) = self.shared.executors.get(&task.task_type) else {
                error!(task_id = %task.id, task_type = %task.task_type, "No executor registered for task type");
                continue;
            };

            let guard = match self.shared.running.try_claim(task.id, task.instance_id) {
                Claim::Claimed(guard) => guard,
                Claim::Busy => continue,
                Claim::AtCapacity => {
                    debug!(task_id = %task.id, instance_id = %task.instance_id, "Instance at capacity");
                    continue;
                }
            };

            debug!(task_id = %task.id, task_type = %task.task_type, "Dispatching task");
            let shared = Arc::clone(&self.shared);
            self.tracker
                .spawn(async move { shared.execute(executor, task, guard).await });
        }
        Ok(())
    }

    /// Granular progress of a running task, when its executor reports any.
    pub async fn task_progress(&self, task_id: TaskId) -> Result<Option<Progress>> {
        let Some(task) = self.shared.store.get_task(task_id).await? else {
            return Ok(None);
        };
        Ok(self
            .shared
            .executors
            .get(&task.task_type)
            .and_then(|executor| executor.progress(task_id)))
    }

    pub fn in_flight(&self) -> usize {
        self.shared.running.len()
    }

    /// Waits for every worker spawned on the tracker so far.
    pub async fn wait_idle(&self) {
        self.tracker.close();
        self.tracker.wait().await;
        self.tracker.reopen();
    }
}

/// Pipelines looked up during one phase.
struct PipelineCache<'a> {
    store: &'a dyn Store,
    pipelines: HashMap<PipelineId, Option<Pipeline>>,
}

impl<'a> PipelineCache<'a> {
    fn new(store: &'a dyn Store) -> Self {
        Self {
            store,
            pipelines: HashMap::new(),
        }
    }

    /// The active stage of the task's pipeline, if the pipeline is open and
    /// that stage is the task's own.
    async fn active_stage_of(&mut self, task: &Task) -> Result<Option<&Stage>> {
        if !self.pipelines.contains_key(&task.pipeline_id) {
            let pipeline = self.store.get_pipeline(task.pipeline_id).await?;
            self.pipelines.insert(task.pipeline_id, pipeline);
        }
        Ok(self
            .pipelines
            .get(&task.pipeline_id)
            .and_then(Option::as_ref)
            .filter(|p| p.status == PipelineStatus::Open)
            .and_then(Pipeline::active_stage)
            .filter(|stage| stage.id == task.stage_id))
    }
}

impl Shared {
    fn find(pipeline_id: Option<PipelineId>, status: TaskStatus) -> TaskFind {
        TaskFind {
            pipeline_id,
            ..TaskFind::with_status(status)
        }
    }

    /// Whether the task's instance exists and is not archived.
    async fn instance_usable(&self, task: &Task) -> Result<bool> {
        match self.store.get_instance(task.instance_id).await? {
            Some(instance) if !instance.archived => Ok(true),
            Some(_) => {
                debug!(task_id = %task.id, instance_id = %task.instance_id, "Instance archived");
                Ok(false)
            }
            None => {
                warn!(task_id = %task.id, instance_id = %task.instance_id, "Task references a missing instance");
                Ok(false)
            }
        }
    }

    async fn auto_approve(&self, pipeline_id: Option<PipelineId>) -> Result<()> {
        let store = self.store.as_ref();
        let tasks = store
            .list_tasks(&Self::find(pipeline_id, TaskStatus::PendingApproval))
            .await?;
        let mut cache = PipelineCache::new(store);

        for task in tasks {
            let Some(stage) = cache.active_stage_of(&task).await? else {
                continue;
            };
            let environment_id = stage.environment_id;

            plan::schedule_check_if_needed(store, &task, PrincipalId::SYSTEM_BOT, true).await?;

            let policy = store.get_approval_policy(environment_id).await?;
            if !policy.is_automatic()
                || !plan::checks_pass(store, &task, FindingStatus::Success).await?
            {
                continue;
            }

            let approved = self
                .status
                .patch_task_status(
                    TaskStatusPatch::new(vec![task.id], PrincipalId::SYSTEM_BOT, TaskStatus::Pending)
                        .expecting(TaskStatus::PendingApproval)
                        .with_comment("Automatically approved"),
                )
                .await?;
            if !approved.is_empty() {
                info!(task_id = %task.id, "Task automatically approved");
            }
        }
        Ok(())
    }

    async fn promote_pending(&self, pipeline_id: Option<PipelineId>) -> Result<()> {
        let store = self.store.as_ref();
        let tasks = store
            .list_tasks(&Self::find(pipeline_id, TaskStatus::Pending))
            .await?;
        let mut cache = PipelineCache::new(store);
        let now = Utc::now();

        for task in tasks {
            let Some(stage) = cache.active_stage_of(&task).await? else {
                continue;
            };
            let blocked = task.blocked_by.iter().any(|blocker| {
                stage
                    .tasks
                    .iter()
                    .find(|t| t.id == *blocker)
                    .is_none_or(|t| t.status != TaskStatus::Done)
            });
            if blocked || !task.is_time_allowed(now) {
                continue;
            }

            if !self.executors.contains(&task.task_type) {
                error!(task_id = %task.id, task_type = %task.task_type, "No executor registered for task type");
                continue;
            }

            if !self.instance_usable(&task).await? {
                continue;
            }

            plan::schedule_check_if_needed(store, &task, PrincipalId::SYSTEM_BOT, true).await?;
            if !plan::checks_pass(store, &task, FindingStatus::Warn).await? {
                continue;
            }

            self.status
                .patch_task_status(
                    TaskStatusPatch::new(vec![task.id], PrincipalId::SYSTEM_BOT, TaskStatus::Running)
                        .expecting(TaskStatus::Pending),
                )
                .await?;
        }
        Ok(())
    }

    async fn execute(
        &self,
        executor: Arc<dyn TaskExecutor>,
        task: Task,
        guard: InFlightGuard<TaskId>,
    ) {
        let ctx = ExecutionContext::new(guard.cancel_token());
        let outcome = catch_panic(executor.run_once(&ctx, &task)).await;

        if ctx.is_canceled() {
            info!(task_id = %task.id, "Task canceled while executing");
            executor.forget(task.id);
            return;
        }

        let settled = match outcome {
            Ok(Ok(RunOnce::Completed(result))) => self.complete(&task, result).await,
            Ok(Ok(RunOnce::Pending)) => {
                debug!(task_id = %task.id, "Task still in flight");
                false
            }
            Ok(Err(e)) if e.is_transient() => {
                debug!(task_id = %task.id, error = %e, "Task not finished, will retry");
                false
            }
            Ok(Err(e)) => self.fail(&task, e.to_string()).await,
            Err(panic) => {
                error!(task_id = %task.id, task_type = %task.task_type, panic = %panic, "Task executor panicked");
                self.fail(&task, format!("executor panicked: {panic}")).await
            }
        };
        if settled {
            executor.forget(task.id);
        }
        drop(guard);
    }

    /// Records `Done` and advances the pipeline. Returns whether the task
    /// left `Running`.
    async fn complete(&self, task: &Task, result: TaskRunResult) -> bool {
        let patch = TaskStatusPatch::new(vec![task.id], PrincipalId::SYSTEM_BOT, TaskStatus::Done)
            .expecting(TaskStatus::Running)
            .with_result(result);
        let done = match self.status.apply_task_status(patch).await {
            Ok(done) => done,
            Err(e) => {
                error!(task_id = %task.id, error = %e, "Failed to mark task done");
                return false;
            }
        };
        if done.is_empty() {
            debug!(task_id = %task.id, "Task left Running before its result was recorded");
            return true;
        }
        for task in &done {
            if let Err(e) = self.status.advance_after_done(task).await {
                error!(task_id = %task.id, pipeline_id = %task.pipeline_id, error = %e, "Failed to advance pipeline after task completion");
            }
        }

        // Make the next tasks of the pipeline schedulable right away.
        if let Err(e) = self.auto_approve(Some(task.pipeline_id)).await {
            warn!(pipeline_id = %task.pipeline_id, error = %e, "Failed to auto-approve after task completion");
        }
        if let Err(e) = self.promote_pending(Some(task.pipeline_id)).await {
            warn!(pipeline_id = %task.pipeline_id, error = %e, "Failed to promote after task completion");
        }
        self.wake.notify_one();
        true
    }

    async fn fail(&self, task: &Task, error: String) -> bool {
        warn!(task_id = %task.id, task_type = %task.task_type, error = %error, "Task failed");
        let patch = TaskStatusPatch::new(vec![task.id], PrincipalId::SYSTEM_BOT, TaskStatus::Failed)
            .expecting(TaskStatus::Running)
            .with_result(TaskRunResult::detail(error.clone()))
            .with_comment(error);
        match self.status.patch_task_status(patch).await {
            Ok(_) => true,
            Err(e) => {
                error!(task_id = %task.id, error = %e, "Failed to mark task failed");
                false
            }
        }
    }
}
