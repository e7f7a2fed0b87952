//! Command handlers.

use crate::config::ServerConfig;
use anyhow::Context;
use std::sync::Arc;
use std::time::Duration;
use strata_core::ports::Store;
use strata_db::{Database, MemoryStore};
use strata_executors::{
    BasicAdvisor, ExecutorDeps, GhostCli, GhostMigrator, PgDriverFactory, check_executors,
    task_executors,
};
use strata_notify::{ActivityManager, HttpApprovalProvider};
use strata_scheduler::Runner;
use tracing::{info, warn};

/// Run the schedulers until ctrl-c or SIGTERM.
pub async fn serve(config: &ServerConfig, memory: bool) -> anyhow::Result<()> {
    let (store, db): (Arc<dyn Store>, Option<Database>) = if memory {
        warn!("Using the in-memory store; nothing is persisted");
        (Arc::new(MemoryStore::new()), None)
    } else {
        let db = connect(config).await?;
        db.migrate().await.context("failed to migrate the metadata store")?;
        (Arc::new(db.store()), Some(db))
    };

    let activity = Arc::new(activity_manager(config, Arc::clone(&store))?);
    let mut runner = build_runner(config, store, Arc::clone(&activity))?;
    runner.start();
    info!(
        memory,
        approvals = runner.approval_runner().is_some(),
        ghost = config.ghost.is_some(),
        "strata is running"
    );

    shutdown_signal().await;
    info!("Shutdown signal received");

    runner.shutdown().await;
    activity.flush().await;
    if let Some(db) = db {
        db.close().await;
    }
    info!("strata stopped");
    Ok(())
}

/// Apply migrations and exit.
pub async fn migrate(config: &ServerConfig) -> anyhow::Result<()> {
    let db = connect(config).await?;
    db.migrate().await.context("failed to migrate the metadata store")?;
    db.close().await;
    println!("Metadata store is up to date");
    Ok(())
}

/// Cancel every running task. Meant for an operator after a crash, with no
/// server running against the same store.
pub async fn clear_running(config: &ServerConfig) -> anyhow::Result<()> {
    let db = connect(config).await?;
    let store: Arc<dyn Store> = Arc::new(db.store());
    let activity = Arc::new(activity_manager(config, Arc::clone(&store))?);
    let runner = Runner::builder(store, activity.clone()).build();

    let cleared = runner.status().clear_running_tasks().await?;
    activity.flush().await;
    db.close().await;

    if cleared.is_empty() {
        println!("No running tasks");
    }
    for task in &cleared {
        println!("Canceled {} ({})", task.id, task.name);
    }
    Ok(())
}

/// Print the effective configuration as YAML, without secrets.
pub fn show_config(config: &ServerConfig) -> anyhow::Result<()> {
    let mut shown = config.clone();
    shown.database_url = redact_url(&shown.database_url);
    if let Some(approval) = shown.approval.as_mut()
        && approval.token.is_some()
    {
        approval.token = Some("********".to_string());
    }
    print!("{}", serde_yaml::to_string(&shown)?);
    Ok(())
}

async fn connect(config: &ServerConfig) -> anyhow::Result<Database> {
    let db = Database::connect(&config.database_url, config.max_connections)
        .await
        .with_context(|| format!("failed to connect to {}", redact_url(&config.database_url)))?;
    info!("Connected to the metadata store");
    Ok(db)
}

fn activity_manager(config: &ServerConfig, store: Arc<dyn Store>) -> anyhow::Result<ActivityManager> {
    let client = reqwest::Client::builder()
        .timeout(Duration::from_secs(config.webhooks.timeout_secs))
        .build()?;
    Ok(ActivityManager::with_client(store, client))
}

fn build_runner(
    config: &ServerConfig,
    store: Arc<dyn Store>,
    activity: Arc<ActivityManager>,
) -> anyhow::Result<Runner> {
    let ghost = config.ghost.as_ref().map(|g| {
        Arc::new(GhostCli::new(&g.binary, &g.work_dir)) as Arc<dyn GhostMigrator>
    });
    let deps = Arc::new(ExecutorDeps {
        store: Arc::clone(&store),
        drivers: Arc::new(PgDriverFactory::new(config.postgres.tools())),
        advisor: Arc::new(BasicAdvisor),
        ghost,
        replayer: None,
        backup_dir: config.backup_dir.clone(),
    });

    let mut builder = Runner::builder(store, activity)
        .task_executors(task_executors(Arc::clone(&deps))?)
        .check_executors(check_executors(deps)?)
        .config(config.scheduler.runner_config());
    if let Some(approval) = &config.approval {
        let provider = HttpApprovalProvider::new(&approval.base_url, approval.token.clone())?;
        builder = builder.approval_provider(Arc::new(provider));
    }
    Ok(builder.build())
}

/// Keeps user and password out of logs.
fn redact_url(url: &str) -> String {
    match url.split_once("://").zip(url.rfind('@')) {
        Some(((scheme, _), at)) => format!("{scheme}://****{}", &url[at..]),
        None => url.to_string(),
    }
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!(error = %e, "Failed to listen for ctrl-c");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                warn!(error = %e, "Failed to listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };
    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
