//! Polling loop that drives task check runs to a settled status.

use crate::executor::{ExecutionContext, catch_panic};
use crate::inflight::{Claim, InFlight};
use crate::registry::CheckExecutorRegistry;
use crate::status::StatusService;
use std::sync::Arc;
use std::time::Duration;
use strata_core::Result;
use strata_core::check::{
    Finding, TaskCheckRun, TaskCheckRunFind, TaskCheckRunResult, TaskCheckRunStatus,
    TaskCheckRunStatusPatch,
};
use strata_core::ids::{PrincipalId, TaskCheckRunId};
use strata_core::ports::Store;
use tokio::sync::watch;
use tokio::time::interval;
use tokio_util::task::TaskTracker;
use tracing::{debug, error, info, warn};

pub struct CheckScheduler {
    store: Arc<dyn Store>,
    status: Arc<StatusService>,
    executors: Arc<CheckExecutorRegistry>,
    running: InFlight<TaskCheckRunId>,
    tracker: TaskTracker,
    interval: Duration,
}

impl CheckScheduler {
    pub fn new(
        status: Arc<StatusService>,
        executors: Arc<CheckExecutorRegistry>,
        running: InFlight<TaskCheckRunId>,
        tracker: TaskTracker,
        interval: Duration,
    ) -> Self {
        Self {
            store: Arc::clone(status.store()),
            status,
            executors,
            running,
            tracker,
            interval,
        }
    }

    /// Run the polling loop until shutdown.
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        let mut ticker = interval(self.interval);

        info!(
            interval_ms = self.interval.as_millis() as u64,
            executors = self.executors.len(),
            "Starting task check scheduler"
        );

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    self.tick().await;
                }
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        info!("Task check scheduler shutting down");
                        break;
                    }
                }
            }
        }
    }

    /// One pass over the running check runs. Never panics.
    pub async fn tick(&self) {
        match catch_panic(self.dispatch()).await {
            Ok(Ok(spawned)) if spawned > 0 => debug!(spawned, "Dispatched task check runs"),
            Ok(Ok(_)) => {}
            Ok(Err(e)) => error!(error = %e, "Task check scheduler tick failed"),
            Err(panic) => error!(panic = %panic, "Task check scheduler tick panicked"),
        }
    }

    async fn dispatch(&self) -> Result<usize> {
        let runs = self
            .store
            .list_task_check_runs(&TaskCheckRunFind::with_status(TaskCheckRunStatus::Running))
            .await?;

        let mut spawned = 0;
        for run in runs {
            let Some(executor) = self.executors.get(&run.check_type) else {
                error!(
                    check_run_id = %run.id,
                    check_type = %run.check_type,
                    "No executor registered for check type"
                );
                continue;
            };
            let task = match self.store.get_task(run.task_id).await {
                Ok(Some(task)) => task,
                Ok(None) => {
                    warn!(check_run_id = %run.id, task_id = %run.task_id, "Check run references a missing task");
                    self.settle_unrunnable(&run, format!("task {} not found", run.task_id))
                        .await;
                    continue;
                }
                Err(e) => {
                    error!(check_run_id = %run.id, task_id = %run.task_id, error = %e, "Failed to load task of check run");
                    self.settle_unrunnable(&run, format!("failed to load task {}: {e}", run.task_id))
                        .await;
                    continue;
                }
            };

            let guard = match self.running.try_claim(run.id, task.instance_id) {
                Claim::Claimed(guard) => guard,
                Claim::Busy => continue,
                Claim::AtCapacity => {
                    debug!(check_run_id = %run.id, instance_id = %task.instance_id, "Instance at capacity");
                    continue;
                }
            };

            let status = Arc::clone(&self.status);
            self.tracker.spawn(async move {
                let ctx = ExecutionContext::new(guard.cancel_token());
                let patch = match catch_panic(executor.run(&ctx, &run, &task)).await {
                    Ok(Ok(findings)) => settled(&run, TaskCheckRunStatus::Done, findings, None),
                    Ok(Err(e)) => {
                        warn!(check_run_id = %run.id, check_type = %run.check_type, error = %e, "Task check failed");
                        settled(&run, TaskCheckRunStatus::Failed, vec![], Some(e.to_string()))
                    }
                    Err(panic) => {
                        error!(check_run_id = %run.id, check_type = %run.check_type, panic = %panic, "Task check executor panicked");
                        settled(
                            &run,
                            TaskCheckRunStatus::Failed,
                            vec![],
                            Some(format!("executor panicked: {panic}")),
                        )
                    }
                };

                match status.patch_task_check_run_status(patch).await {
                    Ok(Some(_)) => {}
                    Ok(None) => debug!(check_run_id = %run.id, "Check run already settled"),
                    Err(e) => error!(check_run_id = %run.id, error = %e, "Failed to settle check run"),
                }
                drop(guard);
            });
            spawned += 1;
        }
        Ok(spawned)
    }

    /// Fails a run whose task cannot be loaded so it stops being polled.
    async fn settle_unrunnable(&self, run: &TaskCheckRun, detail: String) {
        let patch = settled(run, TaskCheckRunStatus::Failed, vec![], Some(detail));
        if let Err(e) = self.status.patch_task_check_run_status(patch).await {
            error!(check_run_id = %run.id, error = %e, "Failed to settle check run");
        }
    }

    pub fn in_flight(&self) -> usize {
        self.running.len()
    }

    /// Waits for every worker spawned on the tracker so far.
    pub async fn wait_idle(&self) {
        self.tracker.close();
        self.tracker.wait().await;
        self.tracker.reopen();
    }
}

fn settled(
    run: &TaskCheckRun,
    status: TaskCheckRunStatus,
    findings: Vec<Finding>,
    error: Option<String>,
) -> TaskCheckRunStatusPatch {
    TaskCheckRunStatusPatch {
        id: run.id,
        updater_id: PrincipalId::SYSTEM_BOT,
        status,
        result: TaskCheckRunResult {
            findings,
            detail: error.clone(),
        },
        comment: error,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::executor::{ExecutorError, THIRD_PARTY_PANIC_CODE, TaskCheckExecutor, run_isolated};
    use crate::plan;
    use crate::testing::Fixture;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use strata_core::check::{FindingStatus, TaskCheckRunCreate, TaskCheckType};
    use strata_core::ids::TaskId;
    use strata_core::task::{Task, TaskStatus};

    struct Clean;

    #[async_trait]
    impl TaskCheckExecutor for Clean {
        async fn run(
            &self,
            _ctx: &ExecutionContext,
            _run: &TaskCheckRun,
            _task: &Task,
        ) -> std::result::Result<Vec<Finding>, ExecutorError> {
            Ok(vec![Finding::success("OK")])
        }
    }

    /// Crashes inside the third-party call on its first invocation only.
    #[derive(Default)]
    struct CrashingDryRun {
        calls: AtomicUsize,
    }

    #[async_trait]
    impl TaskCheckExecutor for CrashingDryRun {
        async fn run(
            &self,
            _ctx: &ExecutionContext,
            _run: &TaskCheckRun,
            _task: &Task,
        ) -> std::result::Result<Vec<Finding>, ExecutorError> {
            let call = self.calls.fetch_add(1, Ordering::SeqCst);
            run_isolated("gh-ost", async move {
                if call == 0 {
                    panic!("segfault in binlog reader");
                }
                Ok(vec![])
            })
            .await
        }
    }

    struct Unreachable;

    #[async_trait]
    impl TaskCheckExecutor for Unreachable {
        async fn run(
            &self,
            _ctx: &ExecutionContext,
            _run: &TaskCheckRun,
            _task: &Task,
        ) -> std::result::Result<Vec<Finding>, ExecutorError> {
            Err(ExecutorError::Driver("connection refused".to_string()))
        }
    }

    fn scheduler(fx: &Fixture, registry: CheckExecutorRegistry) -> CheckScheduler {
        CheckScheduler::new(
            fx.status(),
            Arc::new(registry),
            InFlight::unbounded(),
            TaskTracker::new(),
            Duration::from_millis(10),
        )
    }

    async fn run_of(fx: &Fixture, id: TaskCheckRunId) -> TaskCheckRun {
        fx.store.get_task_check_run(id).await.unwrap().unwrap()
    }

    #[tokio::test]
    async fn test_third_party_panic_becomes_one_error_finding() {
        let fx = Fixture::new().await;
        let dry_run = Arc::new(CrashingDryRun::default());
        let scheduler = scheduler(
            &fx,
            CheckExecutorRegistry::new()
                .with(TaskCheckType::GhostDryRun, dry_run.clone())
                .unwrap(),
        );

        let task = fx.schema_update_task(TaskStatus::PendingApproval).await;
        let first = fx
            .store
            .create_task_check_runs(vec![TaskCheckRunCreate {
                task_id: task.id,
                check_type: TaskCheckType::GhostDryRun,
                creator_id: fx.owner,
            }])
            .await
            .unwrap()
            .remove(0);

        scheduler.tick().await;
        scheduler.wait_idle().await;

        let crashed = run_of(&fx, first.id).await;
        assert_eq!(crashed.status, TaskCheckRunStatus::Done);
        assert_eq!(crashed.result.findings.len(), 1);
        assert_eq!(crashed.result.findings[0].status, FindingStatus::Error);
        assert_eq!(crashed.result.findings[0].code, THIRD_PARTY_PANIC_CODE);

        // The next tick proceeds normally.
        let second = fx
            .store
            .create_task_check_runs(vec![TaskCheckRunCreate {
                task_id: task.id,
                check_type: TaskCheckType::GhostDryRun,
                creator_id: fx.owner,
            }])
            .await
            .unwrap()
            .remove(0);
        scheduler.tick().await;
        scheduler.wait_idle().await;

        let clean = run_of(&fx, second.id).await;
        assert_eq!(clean.status, TaskCheckRunStatus::Done);
        assert!(clean.result.findings.is_empty());
        assert_eq!(dry_run.calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_executor_error_marks_run_failed() {
        let fx = Fixture::new().await;
        let mut registry = CheckExecutorRegistry::new();
        registry
            .register(TaskCheckType::DatabaseConnect, Arc::new(Unreachable))
            .unwrap();
        for t in [
            TaskCheckType::MigrationSchema,
            TaskCheckType::StatementSyntax,
            TaskCheckType::StatementAdvise,
            TaskCheckType::StatementType,
        ] {
            registry.register(t, Arc::new(Clean)).unwrap();
        }
        let scheduler = scheduler(&fx, registry);

        let task = fx.schema_update_task(TaskStatus::PendingApproval).await;
        let runs = plan::schedule_check_if_needed(fx.store.as_ref(), &task, fx.owner, false)
            .await
            .unwrap();

        scheduler.tick().await;
        scheduler.wait_idle().await;

        for run in runs {
            let settled = run_of(&fx, run.id).await;
            if run.check_type == TaskCheckType::DatabaseConnect {
                assert_eq!(settled.status, TaskCheckRunStatus::Failed);
                assert!(settled.comment.unwrap().contains("connection refused"));
            } else {
                assert_eq!(settled.status, TaskCheckRunStatus::Done);
            }
        }
        assert!(!plan::checks_pass(fx.store.as_ref(), &task, FindingStatus::Warn).await.unwrap());
        assert_eq!(scheduler.in_flight(), 0);
    }

    #[tokio::test]
    async fn test_unknown_check_type_is_skipped() {
        let fx = Fixture::new().await;
        let scheduler = scheduler(&fx, CheckExecutorRegistry::new());
        let task = fx.schema_update_task(TaskStatus::PendingApproval).await;
        let runs = plan::schedule_check_if_needed(fx.store.as_ref(), &task, fx.owner, false)
            .await
            .unwrap();

        scheduler.tick().await;
        scheduler.wait_idle().await;

        for run in runs {
            assert_eq!(run_of(&fx, run.id).await.status, TaskCheckRunStatus::Running);
        }
    }

    #[tokio::test]
    async fn test_run_of_missing_task_fails_without_starving_others() {
        let fx = Fixture::new().await;
        let scheduler = scheduler(
            &fx,
            CheckExecutorRegistry::new()
                .with(TaskCheckType::DatabaseConnect, Arc::new(Clean))
                .unwrap(),
        );
        let task = fx.schema_update_task(TaskStatus::PendingApproval).await;
        let runs = fx
            .store
            .create_task_check_runs(vec![
                TaskCheckRunCreate {
                    task_id: TaskId::new(),
                    check_type: TaskCheckType::DatabaseConnect,
                    creator_id: fx.owner,
                },
                TaskCheckRunCreate {
                    task_id: task.id,
                    check_type: TaskCheckType::DatabaseConnect,
                    creator_id: fx.owner,
                },
            ])
            .await
            .unwrap();

        scheduler.tick().await;
        scheduler.wait_idle().await;

        let orphan = run_of(&fx, runs[0].id).await;
        assert_eq!(orphan.status, TaskCheckRunStatus::Failed);
        assert!(orphan.comment.unwrap().contains("not found"));
        assert_eq!(run_of(&fx, runs[1].id).await.status, TaskCheckRunStatus::Done);
    }
}
