//! End-to-end runner tests against a real Postgres instance.
//!
//! Run with: `cargo test -p strata-tests --test pipeline_tests --features integration`

#![cfg(feature = "integration")]

use pretty_assertions::assert_eq;
use std::time::Duration;
use strata_core::activity::ActivityType;
use strata_core::ids::PrincipalId;
use strata_core::issue::IssueStatus;
use strata_core::pipeline::PipelineStatus;
use strata_core::task::{TaskStatus, TaskStatusPatch};
use strata_tests::TestContext;
use strata_tests::fixtures::{TARGET_DATABASE, eventually};

const TIMEOUT: Duration = Duration::from_secs(60);

#[tokio::test]
async fn test_pipeline_runs_to_done_with_automatic_approval() {
    let ctx = TestContext::new().await.expect("Failed to create context");
    let world = ctx.world().await.expect("Failed to seed");
    world.approve_automatically().await.unwrap();

    let (issue, pipeline) = world
        .issue(
            "Add orders",
            vec![
                vec![world
                    .schema_update(
                        "Create orders",
                        "CREATE TABLE orders (id BIGINT PRIMARY KEY)",
                        "0001",
                        TaskStatus::PendingApproval,
                    )
                    .unwrap()],
                vec![world
                    .schema_update(
                        "Add note",
                        "ALTER TABLE orders ADD COLUMN note TEXT",
                        "0002",
                        TaskStatus::PendingApproval,
                    )
                    .unwrap()],
            ],
        )
        .await
        .unwrap();

    let (mut runner, activity) = world.runner().unwrap();
    runner.start();

    let store = ctx.store.clone();
    let pipeline_id = pipeline.id;
    eventually(TIMEOUT, || {
        let store = store.clone();
        async move {
            let pipeline = store.get_pipeline(pipeline_id).await?;
            Ok(pipeline.is_some_and(|p| p.status == PipelineStatus::Done))
        }
    })
    .await
    .expect("Pipeline did not finish");

    runner.shutdown().await;
    activity.flush().await;

    let finished = ctx.store.get_pipeline(pipeline.id).await.unwrap().unwrap();
    for task in finished.stages.iter().flat_map(|s| &s.tasks) {
        assert_eq!(task.status, TaskStatus::Done, "task {}", task.name);
        assert!(task.result.as_ref().is_some_and(|r| r.version.is_some()));
    }
    let issue = ctx.store.get_issue(issue.id).await.unwrap().unwrap();
    assert_eq!(issue.status, IssueStatus::Done);

    let driver = world.driver().await.unwrap();
    for version in ["0001", "0002"] {
        assert!(
            driver
                .find_migration(TARGET_DATABASE, version)
                .await
                .unwrap()
                .is_some(),
            "version {version} not recorded"
        );
    }
    let database = ctx.store.get_database(world.database_id).await.unwrap().unwrap();
    assert_eq!(database.schema_version.as_deref(), Some("0002"));

    let activities = ctx.store.list_activities(*issue.id.as_uuid()).await.unwrap();
    assert!(
        activities
            .iter()
            .any(|a| a.activity_type == ActivityType::TaskStatusUpdate)
    );
    assert!(!ctx.store.list_inbox(world.owner).await.unwrap().is_empty());
}

#[tokio::test]
async fn test_failing_statement_fails_task() {
    let ctx = TestContext::new().await.expect("Failed to create context");
    let world = ctx.world().await.expect("Failed to seed");

    let (_, pipeline) = world
        .issue(
            "Alter missing table",
            vec![vec![world
                .schema_update(
                    "Add note",
                    "ALTER TABLE missing ADD COLUMN note TEXT",
                    "0001",
                    TaskStatus::Pending,
                )
                .unwrap()],
            ],
        )
        .await
        .unwrap();
    let task_id = pipeline.stages[0].tasks[0].id;

    let (mut runner, activity) = world.runner().unwrap();
    runner.start();

    let store = ctx.store.clone();
    eventually(TIMEOUT, || {
        let store = store.clone();
        async move {
            let task = store.get_task(task_id).await?;
            Ok(task.is_some_and(|t| t.status == TaskStatus::Failed))
        }
    })
    .await
    .expect("Task did not fail");

    runner.shutdown().await;
    activity.flush().await;

    let task = ctx.store.get_task(task_id).await.unwrap().unwrap();
    let detail = task.result.map(|r| r.detail).unwrap_or_default();
    assert!(detail.contains("missing"), "unexpected detail: {detail}");
    // The failed statement rolled back its history row.
    let driver = world.driver().await.unwrap();
    assert!(driver.find_migration(TARGET_DATABASE, "0001").await.unwrap().is_none());
}

#[tokio::test]
async fn test_clear_running_cancels_stuck_tasks() {
    let ctx = TestContext::new().await.expect("Failed to create context");
    let world = ctx.world().await.expect("Failed to seed");
    let (_, pipeline) = world
        .issue(
            "Stuck",
            vec![vec![world
                .schema_update("Create t", "CREATE TABLE t (id INT)", "0001", TaskStatus::Pending)
                .unwrap()],
            ],
        )
        .await
        .unwrap();
    let task_id = pipeline.stages[0].tasks[0].id;
    ctx.store
        .patch_task_status(&TaskStatusPatch::new(
            vec![task_id],
            PrincipalId::SYSTEM_BOT,
            TaskStatus::Running,
        ))
        .await
        .unwrap();

    // Not started: only the status service is used.
    let (runner, activity) = world.runner().unwrap();
    let cleared = runner.status().clear_running_tasks().await.unwrap();
    activity.flush().await;

    assert_eq!(cleared.iter().map(|t| t.id).collect::<Vec<_>>(), vec![task_id]);
    let task = ctx.store.get_task(task_id).await.unwrap().unwrap();
    assert_eq!(task.status, TaskStatus::Canceled);
}
