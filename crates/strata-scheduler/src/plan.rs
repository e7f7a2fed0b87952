//! Which checks a task needs, and whether they let it proceed.

use strata_core::check::{
    FindingStatus, TaskCheckRun, TaskCheckRunCreate, TaskCheckRunFind, TaskCheckRunStatus,
    TaskCheckType, latest_by_type,
};
use strata_core::ids::PrincipalId;
use strata_core::instance::Engine;
use strata_core::ports::Store;
use strata_core::task::{Task, TaskType};
use strata_core::{Error, Result};
use tracing::debug;

/// The check bundle for a task on an instance of `engine`.
pub fn check_types_for(task: &Task, engine: Engine) -> Vec<TaskCheckType> {
    let mut types = Vec::new();

    if task.task_type.carries_statement() {
        types.push(TaskCheckType::DatabaseConnect);
        types.push(TaskCheckType::MigrationSchema);
        if engine.supports_syntax_check() {
            types.push(TaskCheckType::StatementSyntax);
        }
        if engine.supports_sql_review() {
            types.push(TaskCheckType::StatementAdvise);
        }
        if engine.supports_statement_type_check() {
            types.push(TaskCheckType::StatementType);
        }
    }
    if task.task_type == TaskType::SchemaUpdateGhostSync {
        types.push(TaskCheckType::GhostDryRun);
    }
    if task.task_type == TaskType::PitrRestore {
        types.push(TaskCheckType::PitrPreflight);
    }
    if task.earliest_allowed_at.is_some() {
        types.push(TaskCheckType::Timing);
    }

    types
}

pub async fn required_check_types(store: &dyn Store, task: &Task) -> Result<Vec<TaskCheckType>> {
    let instance = store
        .get_instance(task.instance_id)
        .await?
        .ok_or_else(|| Error::InstanceNotFound(task.instance_id.to_string()))?;
    Ok(check_types_for(task, instance.engine))
}

/// Whether the task's checks allow it to proceed at `min` severity.
///
/// Every required type needs a latest run, and the latest run of every type
/// that ever ran must be `Done` with no finding below `min`. The timing check
/// is judged at `Warn` at most: the scheduler enforces the time floor itself.
pub async fn checks_pass(store: &dyn Store, task: &Task, min: FindingStatus) -> Result<bool> {
    let required = required_check_types(store, task).await?;
    let runs = store
        .list_task_check_runs(&TaskCheckRunFind::for_task(task.id))
        .await?;
    Ok(evaluate(&runs, &required, min))
}

fn evaluate(runs: &[TaskCheckRun], required: &[TaskCheckType], min: FindingStatus) -> bool {
    let latest = latest_by_type(runs);
    let passes = |run: &TaskCheckRun| {
        let level = if run.check_type == TaskCheckType::Timing {
            min.min(FindingStatus::Warn)
        } else {
            min
        };
        run.passes(level)
    };

    required.iter().all(|t| latest.contains_key(t)) && latest.values().all(|run| passes(run))
}

/// Creates the runs of the task's check bundle that are not already covered.
///
/// A type whose latest run is still `Running` is never duplicated. With
/// `skip_if_done`, a type whose latest run is `Done` is not re-run either;
/// a `Failed` latest run is always retried.
pub async fn schedule_check_if_needed(
    store: &dyn Store,
    task: &Task,
    creator_id: PrincipalId,
    skip_if_done: bool,
) -> Result<Vec<TaskCheckRun>> {
    let required = required_check_types(store, task).await?;
    if required.is_empty() {
        return Ok(vec![]);
    }

    let runs = store
        .list_task_check_runs(&TaskCheckRunFind::for_task(task.id))
        .await?;
    let latest = latest_by_type(&runs);

    let creates: Vec<TaskCheckRunCreate> = required
        .into_iter()
        .filter(|t| match latest.get(t).map(|run| run.status) {
            None => true,
            Some(TaskCheckRunStatus::Running) => false,
            Some(TaskCheckRunStatus::Done) => !skip_if_done,
            Some(TaskCheckRunStatus::Failed) => true,
        })
        .map(|check_type| TaskCheckRunCreate {
            task_id: task.id,
            check_type,
            creator_id,
        })
        .collect();

    if creates.is_empty() {
        return Ok(vec![]);
    }

    debug!(task_id = %task.id, count = creates.len(), "Scheduling task checks");
    store.create_task_check_runs(creates).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::Fixture;
    use strata_core::check::{Finding, TaskCheckRunResult};
    use strata_core::task::TaskStatus;

    #[tokio::test]
    async fn test_bundle_depends_on_engine_and_type() {
        let fx = Fixture::new().await;
        let pg = fx.schema_update_task(TaskStatus::PendingApproval).await;

        let types = check_types_for(&pg, Engine::Postgres);
        assert_eq!(
            types,
            vec![
                TaskCheckType::DatabaseConnect,
                TaskCheckType::MigrationSchema,
                TaskCheckType::StatementSyntax,
                TaskCheckType::StatementAdvise,
                TaskCheckType::StatementType,
            ]
        );

        let on_clickhouse = check_types_for(&pg, Engine::Clickhouse);
        assert_eq!(
            on_clickhouse,
            vec![TaskCheckType::DatabaseConnect, TaskCheckType::MigrationSchema]
        );

        let mut scheduled = pg.clone();
        scheduled.task_type = TaskType::SchemaUpdateGhostSync;
        scheduled.earliest_allowed_at = Some(chrono::Utc::now());
        let types = check_types_for(&scheduled, Engine::Mysql);
        assert!(types.contains(&TaskCheckType::GhostDryRun));
        assert!(types.contains(&TaskCheckType::Timing));
        assert!(!types.contains(&TaskCheckType::StatementType));
    }

    #[tokio::test]
    async fn test_running_checks_are_not_duplicated() {
        let fx = Fixture::new().await;
        let task = fx.schema_update_task(TaskStatus::PendingApproval).await;

        let first = schedule_check_if_needed(fx.store.as_ref(), &task, fx.owner, false)
            .await
            .unwrap();
        assert_eq!(first.len(), 5);

        let second = schedule_check_if_needed(fx.store.as_ref(), &task, fx.owner, false)
            .await
            .unwrap();
        assert!(second.is_empty());
    }

    #[tokio::test]
    async fn test_skip_if_done_only_skips_settled_types() {
        let fx = Fixture::new().await;
        let task = fx.schema_update_task(TaskStatus::PendingApproval).await;
        let runs = schedule_check_if_needed(fx.store.as_ref(), &task, fx.owner, false)
            .await
            .unwrap();
        fx.settle(&runs[0], TaskCheckRunStatus::Done, vec![Finding::success("OK")])
            .await;

        let skipped = schedule_check_if_needed(fx.store.as_ref(), &task, fx.owner, true)
            .await
            .unwrap();
        assert!(skipped.is_empty());

        let rerun = schedule_check_if_needed(fx.store.as_ref(), &task, fx.owner, false)
            .await
            .unwrap();
        assert_eq!(rerun.len(), 1);
        assert_eq!(rerun[0].check_type, runs[0].check_type);
    }

    #[tokio::test]
    async fn test_failed_check_is_recreated_even_when_skipping_done() {
        let fx = Fixture::new().await;
        let task = fx.schema_update_task(TaskStatus::PendingApproval).await;
        let runs = schedule_check_if_needed(fx.store.as_ref(), &task, fx.owner, true)
            .await
            .unwrap();
        for run in &runs[1..] {
            fx.settle(run, TaskCheckRunStatus::Done, vec![]).await;
        }
        fx.settle(&runs[0], TaskCheckRunStatus::Failed, vec![]).await;

        let rerun = schedule_check_if_needed(fx.store.as_ref(), &task, fx.owner, true)
            .await
            .unwrap();
        assert_eq!(rerun.len(), 1);
        assert_eq!(rerun[0].check_type, runs[0].check_type);
        assert_eq!(rerun[0].status, TaskCheckRunStatus::Running);
    }

    #[tokio::test]
    async fn test_checks_pass_levels() {
        let fx = Fixture::new().await;
        let task = fx.schema_update_task(TaskStatus::PendingApproval).await;
        let store = fx.store.as_ref();

        assert!(!checks_pass(store, &task, FindingStatus::Warn).await.unwrap());

        let runs = schedule_check_if_needed(store, &task, fx.owner, false)
            .await
            .unwrap();
        for run in &runs[1..] {
            fx.settle(run, TaskCheckRunStatus::Done, vec![]).await;
        }
        // One run still Running.
        assert!(!checks_pass(store, &task, FindingStatus::Warn).await.unwrap());

        fx.settle(
            &runs[0],
            TaskCheckRunStatus::Done,
            vec![Finding::warn(101, "Large table", "ALTER on a big table")],
        )
        .await;
        assert!(checks_pass(store, &task, FindingStatus::Warn).await.unwrap());
        assert!(!checks_pass(store, &task, FindingStatus::Success).await.unwrap());
    }

    #[test]
    fn test_timing_warning_does_not_block_auto_approval() {
        let now = chrono::Utc::now();
        let run = TaskCheckRun {
            id: Default::default(),
            task_id: Default::default(),
            check_type: TaskCheckType::Timing,
            status: TaskCheckRunStatus::Done,
            result: TaskCheckRunResult {
                findings: vec![Finding::warn(301, "Scheduled", "runs later")],
                detail: None,
            },
            comment: None,
            creator_id: PrincipalId::SYSTEM_BOT,
            updater_id: PrincipalId::SYSTEM_BOT,
            created_at: now,
            updated_at: now,
        };
        assert!(evaluate(
            std::slice::from_ref(&run),
            &[TaskCheckType::Timing],
            FindingStatus::Success
        ));

        let mut failed = run;
        failed.status = TaskCheckRunStatus::Failed;
        assert!(!evaluate(&[failed], &[TaskCheckType::Timing], FindingStatus::Warn));
    }
}
