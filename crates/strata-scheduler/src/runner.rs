//! Wires the schedulers together and owns their lifecycle.

use crate::approval::ApprovalRunner;
use crate::check_scheduler::CheckScheduler;
use crate::inflight::InFlight;
use crate::registry::{CheckExecutorRegistry, TaskExecutorRegistry};
use crate::status::StatusService;
use crate::task_scheduler::TaskScheduler;
use std::sync::Arc;
use std::time::Duration;
use strata_core::Result;
use strata_core::ids::TaskId;
use strata_core::ports::{ActivitySink, ExternalApprovalProvider, Store};
use strata_core::task::Progress;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_util::task::TaskTracker;
use tracing::{info, warn};

/// Scheduler timing and limits.
#[derive(Debug, Clone)]
pub struct RunnerConfig {
    pub task_interval: Duration,
    pub check_interval: Duration,
    pub approval_interval: Duration,
    /// Concurrent executions per instance, counted separately for tasks and checks.
    pub max_connections_per_instance: usize,
    /// How long shutdown waits for in-flight executors.
    pub drain_timeout: Duration,
}

impl Default for RunnerConfig {
    fn default() -> Self {
        Self {
            task_interval: Duration::from_secs(1),
            check_interval: Duration::from_secs(1),
            approval_interval: Duration::from_secs(60),
            max_connections_per_instance: 10,
            drain_timeout: Duration::from_secs(30),
        }
    }
}

pub struct RunnerBuilder {
    store: Arc<dyn Store>,
    activity: Arc<dyn ActivitySink>,
    task_executors: TaskExecutorRegistry,
    check_executors: CheckExecutorRegistry,
    approval_provider: Option<Arc<dyn ExternalApprovalProvider>>,
    config: RunnerConfig,
}

impl RunnerBuilder {
    pub fn new(store: Arc<dyn Store>, activity: Arc<dyn ActivitySink>) -> Self {
        Self {
            store,
            activity,
            task_executors: TaskExecutorRegistry::new(),
            check_executors: CheckExecutorRegistry::new(),
            approval_provider: None,
            config: RunnerConfig::default(),
        }
    }

    pub fn task_executors(mut self, registry: TaskExecutorRegistry) -> Self {
        self.task_executors = registry;
        self
    }

    pub fn check_executors(mut self, registry: CheckExecutorRegistry) -> Self {
        self.check_executors = registry;
        self
    }

    pub fn approval_provider(mut self, provider: Arc<dyn ExternalApprovalProvider>) -> Self {
        self.approval_provider = Some(provider);
        self
    }

    pub fn config(mut self, config: RunnerConfig) -> Self {
        self.config = config;
        self
    }

    pub fn build(self) -> Runner {
        let cap = self.config.max_connections_per_instance;
        let running_tasks: InFlight<TaskId> = InFlight::new(cap);

        let mut status = StatusService::new(self.store, self.activity, running_tasks.clone());
        if let Some(provider) = &self.approval_provider {
            status = status.with_approval_provider(Arc::clone(provider));
        }
        let status = Arc::new(status);
        let tracker = TaskTracker::new();

        let tasks = TaskScheduler::new(
            Arc::clone(&status),
            Arc::new(self.task_executors),
            running_tasks,
            tracker.clone(),
            self.config.task_interval,
        );
        let checks = CheckScheduler::new(
            Arc::clone(&status),
            Arc::new(self.check_executors),
            InFlight::new(cap),
            tracker.clone(),
            self.config.check_interval,
        );
        let approvals = self.approval_provider.map(|provider| {
            ApprovalRunner::new(Arc::clone(&status), provider, self.config.approval_interval)
        });

        Runner {
            status,
            tasks: Arc::new(tasks),
            checks: Arc::new(checks),
            approvals: approvals.map(Arc::new),
            tracker,
            drain_timeout: self.config.drain_timeout,
            shutdown_tx: None,
            handles: Vec::new(),
        }
    }
}

/// The background runners of one server process.
pub struct Runner {
    status: Arc<StatusService>,
    tasks: Arc<TaskScheduler>,
    checks: Arc<CheckScheduler>,
    approvals: Option<Arc<ApprovalRunner>>,
    tracker: TaskTracker,
    drain_timeout: Duration,
    shutdown_tx: Option<watch::Sender<bool>>,
    handles: Vec<JoinHandle<()>>,
}

impl Runner {
    pub fn builder(store: Arc<dyn Store>, activity: Arc<dyn ActivitySink>) -> RunnerBuilder {
        RunnerBuilder::new(store, activity)
    }

    /// Spawns the polling loops. Calling it twice is a no-op.
    pub fn start(&mut self) {
        if self.shutdown_tx.is_some() {
            return;
        }
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let tasks = Arc::clone(&self.tasks);
        let rx = shutdown_rx.clone();
        self.handles
            .push(tokio::spawn(async move { tasks.run(rx).await }));

        let checks = Arc::clone(&self.checks);
        let rx = shutdown_rx.clone();
        self.handles
            .push(tokio::spawn(async move { checks.run(rx).await }));

        if let Some(approvals) = &self.approvals {
            let approvals = Arc::clone(approvals);
            let rx = shutdown_rx;
            self.handles
                .push(tokio::spawn(async move { approvals.run(rx).await }));
        }

        info!(loops = self.handles.len(), "Runners started");
        self.shutdown_tx = Some(shutdown_tx);
    }

    /// Stops the loops, then waits up to the drain timeout for in-flight executors.
    pub async fn shutdown(&mut self) {
        if let Some(tx) = self.shutdown_tx.take() {
            let _ = tx.send(true);
        }
        for handle in self.handles.drain(..) {
            if let Err(e) = handle.await {
                warn!(error = %e, "Runner loop ended abnormally");
            }
        }

        self.tracker.close();
        let in_flight = self.tracker.len();
        if tokio::time::timeout(self.drain_timeout, self.tracker.wait())
            .await
            .is_err()
        {
            warn!(
                in_flight = self.tracker.len(),
                timeout_secs = self.drain_timeout.as_secs(),
                "Executors still running at shutdown; they resume on next start"
            );
        } else {
            info!(drained = in_flight, "Runners stopped");
        }
    }

    pub fn status(&self) -> &Arc<StatusService> {
        &self.status
    }

    pub fn task_scheduler(&self) -> &Arc<TaskScheduler> {
        &self.tasks
    }

    pub fn check_scheduler(&self) -> &Arc<CheckScheduler> {
        &self.checks
    }

    pub fn approval_runner(&self) -> Option<&Arc<ApprovalRunner>> {
        self.approvals.as_ref()
    }

    pub async fn task_progress(&self, task_id: TaskId) -> Result<Option<Progress>> {
        self.tasks.task_progress(task_id).await
    }
}
