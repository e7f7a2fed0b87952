//! In-memory instance, gh-ost and binlog fakes for executor tests.

use crate::advisor::{BasicAdvisor, SqlAdvisor};
use crate::deps::ExecutorDeps;
use crate::driver::{Driver, DriverError, DriverFactory, MigrationInfo, MigrationRecord};
use crate::ghost::{GhostConfig, GhostMigrator, GhostState};
use crate::tasks::pitr::{BinlogReplayer, ReplayRequest};
use async_trait::async_trait;
use chrono::Utc;
use std::collections::{BTreeSet, HashMap};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use strata_core::check::{TaskCheckRun, TaskCheckRunResult, TaskCheckRunStatus, TaskCheckType};
use strata_core::ids::*;
use strata_core::instance::{
    Backup, BackupCreate, BackupPatch, BackupStatus, DatabaseUpsert, Engine, Instance,
};
use strata_core::payload::{
    GhostCutoverPayload, GhostDropOriginalTablePayload, GhostSyncPayload, MigrationPayload,
    TaskPayload,
};
use strata_core::pipeline::{PipelineCreate, StageCreate};
use strata_core::ports::Store;
use strata_core::principal::{Principal, Role};
use strata_core::task::{Task, TaskCreate, TaskStatus};
use strata_db::MemoryStore;
use tempfile::TempDir;

#[derive(Default)]
struct DriverState {
    databases: BTreeSet<String>,
    history: Vec<MigrationRecord>,
    statements: Vec<(String, String)>,
    dropped_tables: Vec<(String, String)>,
    renames: Vec<(String, String)>,
    restores: Vec<(String, PathBuf)>,
    refuse_connections: bool,
    history_unavailable: bool,
    fail_dumps: bool,
    fail_containing: Option<String>,
}

/// Shared state behind every [`FakeDriver`] the factory hands out.
#[derive(Default)]
pub struct FakeInstance {
    state: Mutex<DriverState>,
}

impl FakeInstance {
    fn lock(&self) -> std::sync::MutexGuard<'_, DriverState> {
        self.state.lock().unwrap()
    }

    pub fn add_database(&self, name: &str) {
        self.lock().databases.insert(name.to_string());
    }

    pub fn has_database(&self, name: &str) -> bool {
        self.lock().databases.contains(name)
    }

    pub fn history(&self, database: &str) -> Vec<MigrationRecord> {
        self.lock()
            .history
            .iter()
            .filter(|r| r.database == database)
            .cloned()
            .collect()
    }

    pub fn statements(&self, database: &str) -> Vec<String> {
        self.lock()
            .statements
            .iter()
            .filter(|(db, _)| db == database)
            .map(|(_, s)| s.clone())
            .collect()
    }

    pub fn dropped_tables(&self) -> Vec<(String, String)> {
        self.lock().dropped_tables.clone()
    }

    pub fn renames(&self) -> Vec<(String, String)> {
        self.lock().renames.clone()
    }

    pub fn restores(&self) -> Vec<(String, PathBuf)> {
        self.lock().restores.clone()
    }

    pub fn refuse_connections(&self) {
        self.lock().refuse_connections = true;
    }

    pub fn set_history_ready(&self, ready: bool) {
        self.lock().history_unavailable = !ready;
    }

    pub fn fail_dumps(&self) {
        self.lock().fail_dumps = true;
    }

    pub fn fail_statements_containing(&self, needle: &str) {
        self.lock().fail_containing = Some(needle.to_string());
    }
}

pub struct FakeDriverFactory {
    pub instance: Arc<FakeInstance>,
}

#[async_trait]
impl DriverFactory for FakeDriverFactory {
    async fn connect(&self, instance: &Instance) -> Result<Box<dyn Driver>, DriverError> {
        if self.instance.lock().refuse_connections {
            return Err(DriverError::Connection(format!(
                "{}:{} refused the connection",
                instance.host, instance.port
            )));
        }
        Ok(Box::new(FakeDriver {
            instance: self.instance.clone(),
        }))
    }
}

pub struct FakeDriver {
    instance: Arc<FakeInstance>,
}

fn missing(database: &str) -> DriverError {
    DriverError::Statement(format!("database \"{database}\" does not exist"))
}

#[async_trait]
impl Driver for FakeDriver {
    async fn ping(&self) -> Result<(), DriverError> {
        Ok(())
    }

    async fn database_exists(&self, name: &str) -> Result<bool, DriverError> {
        Ok(self.instance.has_database(name))
    }

    async fn create_database(&self, name: &str, _statement: &str) -> Result<(), DriverError> {
        if !self.instance.lock().databases.insert(name.to_string()) {
            return Err(DriverError::AlreadyExists(name.to_string()));
        }
        Ok(())
    }

    async fn drop_database_if_exists(&self, name: &str) -> Result<(), DriverError> {
        self.instance.lock().databases.remove(name);
        Ok(())
    }

    async fn rename_database(&self, from: &str, to: &str) -> Result<(), DriverError> {
        let mut state = self.instance.lock();
        if state.databases.contains(to) {
            return Err(DriverError::AlreadyExists(to.to_string()));
        }
        if !state.databases.remove(from) {
            return Err(missing(from));
        }
        state.databases.insert(to.to_string());
        state.renames.push((from.to_string(), to.to_string()));
        Ok(())
    }

    async fn drop_table_if_exists(&self, database: &str, table: &str) -> Result<(), DriverError> {
        self.instance
            .lock()
            .dropped_tables
            .push((database.to_string(), table.to_string()));
        Ok(())
    }

    async fn migration_history_ready(&self, _database: &str) -> Result<bool, DriverError> {
        Ok(!self.instance.lock().history_unavailable)
    }

    async fn find_migration(
        &self,
        database: &str,
        version: &str,
    ) -> Result<Option<MigrationRecord>, DriverError> {
        Ok(self
            .instance
            .lock()
            .history
            .iter()
            .find(|r| r.database == database && r.version == version)
            .cloned())
    }

    async fn execute_migration(
        &self,
        info: &MigrationInfo,
        statement: &str,
    ) -> Result<MigrationRecord, DriverError> {
        let mut state = self.instance.lock();
        if !state.databases.contains(&info.database) {
            return Err(missing(&info.database));
        }
        if state
            .history
            .iter()
            .any(|r| r.database == info.database && r.version == info.version)
        {
            return Err(DriverError::AlreadyExists(info.version.clone()));
        }
        if let Some(needle) = &state.fail_containing
            && statement.contains(needle.as_str())
        {
            return Err(DriverError::Statement(format!("cannot run \"{statement}\"")));
        }

        let record = MigrationRecord {
            id: (state.history.len() + 1).to_string(),
            database: info.database.clone(),
            version: info.version.clone(),
            kind: info.kind,
            task_id: info.task_id,
            created_at: Utc::now(),
        };
        state.history.push(record.clone());
        if !statement.is_empty() {
            state
                .statements
                .push((info.database.clone(), statement.to_string()));
        }
        Ok(record)
    }

    async fn dump(&self, database: &str, path: &Path) -> Result<u64, DriverError> {
        if self.instance.lock().fail_dumps {
            return Err(DriverError::Tool("pg_dump: permission denied".to_string()));
        }
        let contents = format!("-- dump of {database}\n");
        tokio::fs::write(path, &contents).await?;
        Ok(contents.len() as u64)
    }

    async fn restore(&self, database: &str, path: &Path) -> Result<(), DriverError> {
        let mut state = self.instance.lock();
        if !state.databases.contains(database) {
            return Err(missing(database));
        }
        state.restores.push((database.to_string(), path.to_path_buf()));
        Ok(())
    }
}

#[derive(Default)]
pub struct FakeGhost {
    states: Mutex<HashMap<TaskId, GhostState>>,
    started: Mutex<Vec<TaskId>>,
    cut_over: Mutex<Vec<TaskId>>,
    aborted: Mutex<Vec<TaskId>>,
    panic_on_dry_run: AtomicBool,
}

impl FakeGhost {
    pub fn set_state(&self, key: TaskId, state: GhostState) {
        self.states.lock().unwrap().insert(key, state);
    }

    pub fn started(&self) -> Vec<TaskId> {
        self.started.lock().unwrap().clone()
    }

    pub fn cut_over_keys(&self) -> Vec<TaskId> {
        self.cut_over.lock().unwrap().clone()
    }

    pub fn aborted(&self) -> Vec<TaskId> {
        self.aborted.lock().unwrap().clone()
    }

    pub fn panic_on_dry_run(&self) {
        self.panic_on_dry_run.store(true, Ordering::SeqCst);
    }
}

#[async_trait]
impl GhostMigrator for FakeGhost {
    async fn dry_run(&self, _config: &GhostConfig) -> Result<(), DriverError> {
        if self.panic_on_dry_run.load(Ordering::SeqCst) {
            panic!("gh-ost inspector crashed");
        }
        Ok(())
    }

    async fn start(&self, key: TaskId, _config: GhostConfig) -> Result<(), DriverError> {
        self.started.lock().unwrap().push(key);
        self.set_state(key, GhostState::Syncing);
        Ok(())
    }

    fn state(&self, key: TaskId) -> Option<GhostState> {
        self.states.lock().unwrap().get(&key).cloned()
    }

    async fn cut_over(&self, key: TaskId) -> Result<(), DriverError> {
        self.cut_over.lock().unwrap().push(key);
        Ok(())
    }

    async fn abort(&self, key: TaskId) {
        self.aborted.lock().unwrap().push(key);
        self.forget(key);
    }

    fn forget(&self, key: TaskId) {
        self.states.lock().unwrap().remove(&key);
    }
}

/// Replays `size` bytes instantly.
pub struct FakeReplayer {
    size: u64,
    requests: Mutex<Vec<ReplayRequest>>,
}

impl FakeReplayer {
    pub fn new(size: u64) -> Self {
        Self {
            size,
            requests: Mutex::new(Vec::new()),
        }
    }

    pub fn requests(&self) -> Vec<ReplayRequest> {
        self.requests.lock().unwrap().clone()
    }
}

#[async_trait]
impl BinlogReplayer for FakeReplayer {
    async fn replay_size(&self, _request: &ReplayRequest) -> Result<u64, DriverError> {
        Ok(self.size)
    }

    async fn replay(&self, request: &ReplayRequest, applied: &AtomicU64) -> Result<(), DriverError> {
        self.requests.lock().unwrap().push(request.clone());
        applied.store(self.size, Ordering::Relaxed);
        Ok(())
    }
}

#[derive(Default)]
pub struct HarnessBuilder {
    engine: Option<Engine>,
    ghost: Option<Arc<dyn GhostMigrator>>,
    replayer: Option<Arc<dyn BinlogReplayer>>,
    advisor: Option<Arc<dyn SqlAdvisor>>,
}

impl HarnessBuilder {
    pub fn engine(mut self, engine: Engine) -> Self {
        self.engine = Some(engine);
        self
    }

    pub fn ghost(mut self, ghost: Arc<dyn GhostMigrator>) -> Self {
        self.ghost = Some(ghost);
        self
    }

    pub fn replayer(mut self, replayer: Arc<dyn BinlogReplayer>) -> Self {
        self.replayer = Some(replayer);
        self
    }

    pub fn advisor(mut self, advisor: Arc<dyn SqlAdvisor>) -> Self {
        self.advisor = Some(advisor);
        self
    }

    pub async fn build(self) -> Harness {
        let store: Arc<dyn Store> = Arc::new(MemoryStore::new());
        let creator = PrincipalId::new();
        store
            .create_principal(&Principal {
                id: creator,
                name: "Devon".to_string(),
                email: "devon@example.com".to_string(),
                role: Role::Developer,
            })
            .await
            .unwrap();

        let project_id = ProjectId::new();
        let environment_id = EnvironmentId::new();
        let instance_id = InstanceId::new();
        store
            .create_instance(&Instance {
                id: instance_id,
                environment_id,
                name: "prod".to_string(),
                engine: self.engine.unwrap_or(Engine::Postgres),
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

        let driver = Arc::new(FakeInstance::default());
        driver.add_database("shop");
        let backups = TempDir::new().unwrap();

        let deps = Arc::new(ExecutorDeps {
            store: store.clone(),
            drivers: Arc::new(FakeDriverFactory {
                instance: driver.clone(),
            }),
            advisor: self.advisor.unwrap_or_else(|| Arc::new(BasicAdvisor)),
            ghost: self.ghost,
            replayer: self.replayer,
            backup_dir: backups.path().to_path_buf(),
        });

        Harness {
            store,
            deps,
            driver,
            creator,
            project_id,
            environment_id,
            instance_id,
            database_id: database.id,
            _backups: backups,
        }
    }
}

pub struct Harness {
    pub store: Arc<dyn Store>,
    pub deps: Arc<ExecutorDeps>,
    pub driver: Arc<FakeInstance>,
    pub creator: PrincipalId,
    pub project_id: ProjectId,
    pub environment_id: EnvironmentId,
    pub instance_id: InstanceId,
    pub database_id: DatabaseId,
    _backups: TempDir,
}

impl Harness {
    pub fn builder() -> HarnessBuilder {
        HarnessBuilder::default()
    }

    pub async fn new() -> Self {
        Self::builder().build().await
    }

    pub async fn with_ghost(ghost: Arc<FakeGhost>) -> Self {
        Self::builder().ghost(ghost).build().await
    }

    /// One stage holding the given tasks, all against the fixture database.
    pub async fn stage(&self, payloads: Vec<TaskPayload>) -> Vec<Task> {
        let tasks = payloads
            .into_iter()
            .enumerate()
            .map(|(i, payload)| {
                TaskCreate::new(format!("task-{i}"), self.instance_id, Some(self.database_id), payload)
                    .unwrap()
                    .with_status(TaskStatus::Pending)
            })
            .collect();
        let pipeline = self
            .store
            .create_pipeline(PipelineCreate {
                name: "pipeline".to_string(),
                creator_id: self.creator,
                stages: vec![StageCreate {
                    name: "stage".to_string(),
                    environment_id: self.environment_id,
                    tasks,
                    dependencies: vec![],
                }],
            })
            .await
            .unwrap();
        pipeline.stages[0].tasks.clone()
    }

    pub async fn task(&self, payload: TaskPayload, database_id: Option<DatabaseId>) -> Task {
        let mut task = self.stage(vec![payload]).await.remove(0);
        task.database_id = database_id;
        task
    }

    pub async fn schema_update_task(&self, statement: &str) -> Task {
        self.task(
            TaskPayload::SchemaUpdate(MigrationPayload {
                statement: statement.to_string(),
                rollback_statement: None,
                schema_version: "20240101000000".to_string(),
                vcs_push_event: None,
            }),
            Some(self.database_id),
        )
        .await
    }

    /// Sync, cutover and drop-original tasks for `orders`.
    pub async fn ghost_stage(&self) -> Vec<Task> {
        self.stage(vec![
            TaskPayload::SchemaUpdateGhostSync(GhostSyncPayload {
                statement: "ALTER TABLE orders ADD COLUMN note TEXT".to_string(),
                schema_version: "20240101".to_string(),
                table_name: "orders".to_string(),
            }),
            TaskPayload::SchemaUpdateGhostCutover(GhostCutoverPayload::default()),
            TaskPayload::SchemaUpdateGhostDropOriginalTable(GhostDropOriginalTablePayload {
                database_name: "shop".to_string(),
                table_name: "orders".to_string(),
            }),
        ])
        .await
    }

    pub fn check_run(&self, task: &Task) -> TaskCheckRun {
        let now = Utc::now();
        TaskCheckRun {
            id: TaskCheckRunId::new(),
            task_id: task.id,
            check_type: TaskCheckType::StatementSyntax,
            status: TaskCheckRunStatus::Running,
            result: TaskCheckRunResult::default(),
            comment: None,
            creator_id: PrincipalId::SYSTEM_BOT,
            updater_id: PrincipalId::SYSTEM_BOT,
            created_at: now,
            updated_at: now,
        }
    }

    /// A finished backup of the fixture database with a dump on disk.
    pub async fn done_backup(&self, name: &str) -> Backup {
        let backup = self
            .store
            .create_backup(BackupCreate {
                database_id: self.database_id,
                name: name.to_string(),
                storage_path: format!("shop/{name}.sql"),
            })
            .await
            .unwrap();
        let path = self.deps.backup_path(&backup);
        tokio::fs::create_dir_all(path.parent().unwrap()).await.unwrap();
        tokio::fs::write(&path, b"-- dump\n").await.unwrap();
        self.store
            .patch_backup(BackupPatch {
                id: backup.id,
                status: BackupStatus::Done,
                size_bytes: Some(8),
                comment: None,
            })
            .await
            .unwrap()
    }
}
