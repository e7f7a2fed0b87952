//! Online schema change through gh-ost.
//!
//! The sync task starts gh-ost with a postponed cut-over and completes once
//! the ghost table has caught up; canceling it kills gh-ost. The cutover task
//! releases the postpone flag and waits for gh-ost to swap the tables. The
//! drop task removes the table gh-ost renamed out of the way and releases the
//! migration's state.

use crate::deps::ExecutorDeps;
use crate::driver::{DriverError, MigrationInfo, MigrationKind};
use async_trait::async_trait;
use dashmap::DashMap;
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;
use strata_core::check::{Finding, TaskCheckRun};
use strata_core::ids::TaskId;
use strata_core::instance::Instance;
use strata_core::payload::{GhostDropOriginalTablePayload, GhostSyncPayload};
use strata_core::task::{Task, TaskFind, TaskRunResult, TaskType};
use strata_scheduler::{
    ExecutionContext, ExecutorError, RunOnce, TaskCheckExecutor, TaskExecutor, run_isolated,
};
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::Command;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

pub const GHOST_DRY_RUN_FAILED: i32 = 501;
pub const GHOST_UNAVAILABLE: i32 = 502;

/// gh-ost prints this while it holds the cut-over back.
const CUT_OVER_POSTPONED: &str = "postponing cut-over";

const SYNC_POLL_INTERVAL: Duration = Duration::from_secs(1);

type OutputStream = Box<dyn AsyncRead + Send + Unpin>;

/// What gh-ost should change.
#[derive(Debug, Clone)]
pub struct GhostConfig {
    pub instance: Instance,
    pub database: String,
    pub table: String,
    /// The ALTER clause without the `ALTER TABLE <name>` prefix.
    pub alter: String,
}

impl GhostConfig {
    pub fn new(instance: Instance, database: String, sync: &GhostSyncPayload) -> Self {
        Self {
            alter: alter_clause(&sync.statement, &sync.table_name),
            instance,
            database,
            table: sync.table_name.clone(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GhostState {
    Syncing,
    /// Caught up; waiting for the postpone flag to go away.
    ReadyForCutover,
    Completed,
    Failed(String),
}

/// Runs and tracks gh-ost migrations, keyed by the sync task.
#[async_trait]
pub trait GhostMigrator: Send + Sync {
    async fn dry_run(&self, config: &GhostConfig) -> Result<(), DriverError>;

    async fn start(&self, key: TaskId, config: GhostConfig) -> Result<(), DriverError>;

    /// `None` when no migration for `key` is known to this process.
    fn state(&self, key: TaskId) -> Option<GhostState>;

    async fn cut_over(&self, key: TaskId) -> Result<(), DriverError>;

    /// Stops the migration of `key` and forgets it.
    async fn abort(&self, key: TaskId);

    /// Drops what is known about `key`.
    fn forget(&self, key: TaskId);
}

/// Strips `ALTER TABLE <table>` and a trailing semicolon.
pub fn alter_clause(statement: &str, table: &str) -> String {
    let trimmed = statement.trim().trim_end_matches(';').trim();
    let mut words = trimmed.splitn(4, char::is_whitespace);
    let head: Vec<&str> = words.by_ref().take(3).collect();
    let is_prefix = head.len() == 3
        && head[0].eq_ignore_ascii_case("ALTER")
        && head[1].eq_ignore_ascii_case("TABLE")
        && head[2].trim_matches(|c| c == '`' || c == '"') == table;
    if is_prefix {
        words.next().unwrap_or_default().trim().to_string()
    } else {
        trimmed.to_string()
    }
}

/// The table gh-ost leaves behind after cut-over.
pub fn original_table_name(table: &str) -> String {
    format!("_{table}_del")
}

/// Runs the `gh-ost` binary.
pub struct GhostCli {
    binary: PathBuf,
    work_dir: PathBuf,
    states: Arc<DashMap<TaskId, GhostState>>,
    aborts: Arc<DashMap<TaskId, CancellationToken>>,
}

impl GhostCli {
    pub fn new(binary: impl Into<PathBuf>, work_dir: impl Into<PathBuf>) -> Self {
        Self {
            binary: binary.into(),
            work_dir: work_dir.into(),
            states: Arc::new(DashMap::new()),
            aborts: Arc::new(DashMap::new()),
        }
    }

    fn flag_file(&self, key: TaskId) -> PathBuf {
        self.work_dir.join(format!("{key}.postpone"))
    }

    fn command(&self, config: &GhostConfig) -> Command {
        let mut cmd = Command::new(&self.binary);
        cmd.arg(format!("--host={}", config.instance.host))
            .arg(format!("--port={}", config.instance.port))
            .arg(format!("--user={}", config.instance.username))
            .arg(format!("--password={}", config.instance.password))
            .arg(format!("--database={}", config.database))
            .arg(format!("--table={}", config.table))
            .arg(format!("--alter={}", config.alter))
            .arg("--allow-on-master")
            .arg("--initially-drop-ghost-table")
            .arg("--initially-drop-old-table")
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        cmd
    }
}

#[async_trait]
impl GhostMigrator for GhostCli {
    async fn dry_run(&self, config: &GhostConfig) -> Result<(), DriverError> {
        let output = self
            .command(config)
            .output()
            .await
            .map_err(|e| DriverError::Tool(format!("failed to spawn gh-ost: {e}")))?;
        if output.status.success() {
            Ok(())
        } else {
            Err(DriverError::Tool(
                String::from_utf8_lossy(&output.stderr).trim().to_string(),
            ))
        }
    }

    async fn start(&self, key: TaskId, config: GhostConfig) -> Result<(), DriverError> {
        tokio::fs::create_dir_all(&self.work_dir).await?;
        let flag = self.flag_file(key);
        tokio::fs::write(&flag, b"").await?;

        let mut child = self
            .command(&config)
            .arg(format!("--postpone-cut-over-flag-file={}", flag.display()))
            .arg("--execute")
            .spawn()
            .map_err(|e| DriverError::Tool(format!("failed to spawn gh-ost: {e}")))?;
        self.states.insert(key, GhostState::Syncing);
        let abort = CancellationToken::new();
        self.aborts.insert(key, abort.clone());
        info!(task_id = %key, database = %config.database, table = %config.table, "gh-ost started");

        let stdout = child.stdout.take();
        let stderr = child.stderr.take();
        let states = Arc::clone(&self.states);
        let aborts = Arc::clone(&self.aborts);
        tokio::spawn(async move {
            let watch = |stream: Option<OutputStream>| {
                let states = Arc::clone(&states);
                async move {
                    let mut tail = String::new();
                    let Some(stream) = stream else {
                        return tail;
                    };
                    let mut lines = BufReader::new(stream).lines();
                    while let Ok(Some(line)) = lines.next_line().await {
                        if line.to_ascii_lowercase().contains(CUT_OVER_POSTPONED) {
                            states.insert(key, GhostState::ReadyForCutover);
                        }
                        tail = line;
                    }
                    tail
                }
            };
            let output = async {
                let (_, tail) = tokio::join!(
                    watch(stdout.map(|s| Box::new(s) as OutputStream)),
                    watch(stderr.map(|s| Box::new(s) as OutputStream)),
                );
                tail
            };
            let state = tokio::select! {
                tail = output => match child.wait().await {
                    Ok(status) if status.success() => Some(GhostState::Completed),
                    Ok(status) => Some(GhostState::Failed(format!(
                        "gh-ost exited with {}: {tail}",
                        status.code().unwrap_or(-1)
                    ))),
                    Err(e) => Some(GhostState::Failed(e.to_string())),
                },
                _ = abort.cancelled() => {
                    if let Err(e) = child.kill().await {
                        warn!(task_id = %key, error = %e, "Failed to kill gh-ost");
                    }
                    None
                }
            };
            aborts.remove(&key);
            match state {
                Some(state) => {
                    debug!(task_id = %key, state = ?state, "gh-ost finished");
                    states.insert(key, state);
                }
                None => {
                    info!(task_id = %key, "gh-ost aborted");
                    states.remove(&key);
                }
            }
        });
        Ok(())
    }

    fn state(&self, key: TaskId) -> Option<GhostState> {
        self.states.get(&key).map(|s| s.clone())
    }

    async fn cut_over(&self, key: TaskId) -> Result<(), DriverError> {
        match tokio::fs::remove_file(self.flag_file(key)).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    async fn abort(&self, key: TaskId) {
        match self.aborts.get(&key) {
            Some(abort) => abort.cancel(),
            None => {
                self.states.remove(&key);
            }
        }
        if let Err(e) = tokio::fs::remove_file(self.flag_file(key)).await
            && e.kind() != std::io::ErrorKind::NotFound
        {
            warn!(task_id = %key, error = %e, "Failed to remove gh-ost flag file");
        }
    }

    fn forget(&self, key: TaskId) {
        self.states.remove(&key);
    }
}

fn migrator(deps: &ExecutorDeps) -> Result<&Arc<dyn GhostMigrator>, ExecutorError> {
    deps.ghost
        .as_ref()
        .ok_or_else(|| ExecutorError::Unsupported("gh-ost is not configured".to_string()))
}

/// The sync task of the same stage and database as `task`.
async fn stage_sync_task(deps: &ExecutorDeps, task: &Task) -> Result<Option<Task>, ExecutorError> {
    Ok(deps
        .store
        .list_tasks(&TaskFind {
            pipeline_id: Some(task.pipeline_id),
            stage_id: Some(task.stage_id),
            task_types: Some(vec![TaskType::SchemaUpdateGhostSync]),
            ..Default::default()
        })
        .await?
        .into_iter()
        .find(|t| t.database_id == task.database_id))
}

async fn ghost_config(deps: &ExecutorDeps, task: &Task) -> Result<(GhostConfig, GhostSyncPayload), ExecutorError> {
    let sync: GhostSyncPayload = task.payload()?;
    let instance = deps.instance(task.instance_id).await?;
    let database = deps.database(task).await?;
    Ok((GhostConfig::new(instance, database.name, &sync), sync))
}

/// Starts gh-ost and holds the worker until the ghost table has caught up.
pub struct GhostSyncExecutor {
    deps: Arc<ExecutorDeps>,
    poll: Duration,
}

impl GhostSyncExecutor {
    pub fn new(deps: Arc<ExecutorDeps>) -> Self {
        Self {
            deps,
            poll: SYNC_POLL_INTERVAL,
        }
    }
}

#[async_trait]
impl TaskExecutor for GhostSyncExecutor {
    async fn run_once(&self, ctx: &ExecutionContext, task: &Task) -> Result<RunOnce, ExecutorError> {
        let ghost = migrator(&self.deps)?;
        if ghost.state(task.id).is_none() {
            let (config, _) = ghost_config(&self.deps, task).await?;
            ghost.start(task.id, config).await?;
        }

        let mut ticker = tokio::time::interval(self.poll);
        loop {
            match ghost.state(task.id) {
                Some(GhostState::Syncing) => {}
                Some(GhostState::ReadyForCutover | GhostState::Completed) => {
                    return Ok(RunOnce::Completed(TaskRunResult::detail(
                        "Ghost table is in sync, ready for cutover",
                    )));
                }
                Some(GhostState::Failed(msg)) => return Err(ExecutorError::Driver(msg)),
                None => {
                    return Err(ExecutorError::Other("gh-ost migration was aborted".to_string()));
                }
            }
            tokio::select! {
                _ = ticker.tick() => {}
                _ = ctx.canceled() => {
                    info!(task_id = %task.id, "Aborting gh-ost for canceled task");
                    ghost.abort(task.id).await;
                    return Err(ExecutorError::Other("gh-ost sync canceled".to_string()));
                }
            }
        }
    }

    fn forget(&self, task_id: TaskId) {
        // A finished sync stays known until the drop task; a failed one is
        // forgotten so a retry starts gh-ost again.
        if let Some(ghost) = &self.deps.ghost
            && matches!(ghost.state(task_id), Some(GhostState::Failed(_)))
        {
            ghost.forget(task_id);
        }
    }
}

pub struct GhostCutoverExecutor {
    deps: Arc<ExecutorDeps>,
}

impl GhostCutoverExecutor {
    pub fn new(deps: Arc<ExecutorDeps>) -> Self {
        Self { deps }
    }

    async fn sync_task(&self, task: &Task) -> Result<Task, ExecutorError> {
        stage_sync_task(&self.deps, task)
            .await?
            .ok_or_else(|| ExecutorError::NotFound(format!("gh-ost sync task for {}", task.id)))
    }

    async fn record_history(&self, task: &Task, sync: &Task) -> Result<TaskRunResult, ExecutorError> {
        let (config, payload) = ghost_config(&self.deps, sync).await?;
        let driver = self.deps.driver(&config.instance).await?;
        let info = MigrationInfo {
            database: config.database.clone(),
            version: payload.schema_version.clone(),
            kind: MigrationKind::Migrate,
            description: format!("gh-ost: {}", payload.statement),
            task_id: sync.id,
            creator_id: task.creator_id,
        };
        let record = match driver.execute_migration(&info, "").await {
            Ok(record) => Some(record),
            Err(DriverError::AlreadyExists(_)) => {
                driver.find_migration(&info.database, &info.version).await?
            }
            Err(e) => return Err(e.into()),
        };
        Ok(TaskRunResult {
            detail: format!("Switched {} to the migrated table", config.table),
            change_history_id: record.map(|r| r.id),
            version: Some(payload.schema_version),
        })
    }
}

#[async_trait]
impl TaskExecutor for GhostCutoverExecutor {
    async fn run_once(&self, _ctx: &ExecutionContext, task: &Task) -> Result<RunOnce, ExecutorError> {
        let ghost = migrator(&self.deps)?;
        let sync = self.sync_task(task).await?;
        match ghost.state(sync.id) {
            Some(GhostState::ReadyForCutover) => {
                ghost.cut_over(sync.id).await?;
                debug!(task_id = %task.id, sync_task_id = %sync.id, "Released gh-ost cut-over");
                Ok(RunOnce::Pending)
            }
            Some(GhostState::Syncing) => Ok(RunOnce::Pending),
            Some(GhostState::Completed) => Ok(RunOnce::Completed(self.record_history(task, &sync).await?)),
            Some(GhostState::Failed(msg)) => Err(ExecutorError::Driver(msg)),
            None => Err(ExecutorError::Other(format!(
                "gh-ost migration of sync task {} is not running in this process; rerun the sync task",
                sync.id
            ))),
        }
    }
}

pub struct GhostDropOriginalTableExecutor {
    deps: Arc<ExecutorDeps>,
}

impl GhostDropOriginalTableExecutor {
    pub fn new(deps: Arc<ExecutorDeps>) -> Self {
        Self { deps }
    }
}

#[async_trait]
impl TaskExecutor for GhostDropOriginalTableExecutor {
    async fn run_once(&self, _ctx: &ExecutionContext, task: &Task) -> Result<RunOnce, ExecutorError> {
        let payload: GhostDropOriginalTablePayload = task.payload()?;
        let instance = self.deps.instance(task.instance_id).await?;
        let driver = self.deps.driver(&instance).await?;
        let table = original_table_name(&payload.table_name);
        driver
            .drop_table_if_exists(&payload.database_name, &table)
            .await?;

        if let Some(ghost) = &self.deps.ghost
            && let Some(sync) = stage_sync_task(&self.deps, task).await?
        {
            ghost.forget(sync.id);
        }
        Ok(RunOnce::Completed(TaskRunResult::detail(format!(
            "Dropped original table {table}"
        ))))
    }
}

/// Dry-runs the gh-ost migration of a sync task.
pub struct GhostDryRunCheck {
    deps: Arc<ExecutorDeps>,
}

impl GhostDryRunCheck {
    pub fn new(deps: Arc<ExecutorDeps>) -> Self {
        Self { deps }
    }
}

#[async_trait]
impl TaskCheckExecutor for GhostDryRunCheck {
    async fn run(
        &self,
        _ctx: &ExecutionContext,
        _run: &TaskCheckRun,
        task: &Task,
    ) -> Result<Vec<Finding>, ExecutorError> {
        let Some(ghost) = self.deps.ghost.clone() else {
            return Ok(vec![Finding::error(
                GHOST_UNAVAILABLE,
                "gh-ost unavailable",
                "No gh-ost binary is configured on this server",
            )]);
        };
        let (config, _) = ghost_config(&self.deps, task).await?;

        run_isolated("gh-ost", async move {
            match ghost.dry_run(&config).await {
                Ok(()) => Ok(vec![Finding::success("OK")]),
                Err(e) => {
                    warn!(task_id = %task.id, error = %e, "gh-ost dry run failed");
                    Ok(vec![Finding::error(
                        GHOST_DRY_RUN_FAILED,
                        "gh-ost dry run failed",
                        e.to_string(),
                    )])
                }
            }
        })
        .await
    }
}
