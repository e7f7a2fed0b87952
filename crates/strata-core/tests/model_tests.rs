//! Pipeline model tests for strata-core types.

use chrono::{Duration, Utc};
use strata_core::ids::*;
use strata_core::pipeline::*;
use strata_core::task::*;

fn task(pipeline_id: PipelineId, stage_id: StageId, status: TaskStatus) -> Task {
    let now = Utc::now();
    Task {
        id: TaskId::new(),
        pipeline_id,
        stage_id,
        name: "task".to_string(),
        task_type: TaskType::General,
        status,
        instance_id: InstanceId::new(),
        database_id: None,
        payload: serde_json::json!({}),
        earliest_allowed_at: None,
        blocked_by: vec![],
        result: None,
        creator_id: PrincipalId::SYSTEM_BOT,
        updater_id: PrincipalId::SYSTEM_BOT,
        created_at: now,
        updated_at: now,
    }
}

fn pipeline(stages: &[&[TaskStatus]]) -> Pipeline {
    let id = PipelineId::new();
    let now = Utc::now();
    Pipeline {
        id,
        name: "deploy".to_string(),
        status: PipelineStatus::Open,
        stages: stages
            .iter()
            .enumerate()
            .map(|(i, statuses)| {
                let stage_id = StageId::new();
                Stage {
                    id: stage_id,
                    pipeline_id: id,
                    environment_id: EnvironmentId::new(),
                    name: format!("stage-{i}"),
                    position: i as u32,
                    tasks: statuses.iter().map(|s| task(id, stage_id, *s)).collect(),
                }
            })
            .collect(),
        creator_id: PrincipalId::SYSTEM_BOT,
        created_at: now,
        updated_at: now,
    }
}

#[test]
fn test_active_stage_is_first_with_unfinished_task() {
    let p = pipeline(&[
        &[TaskStatus::Done, TaskStatus::Done],
        &[TaskStatus::Done, TaskStatus::Running],
        &[TaskStatus::Pending],
    ]);
    assert_eq!(p.active_stage().unwrap().position, 1);
    assert!(!p.is_done());
}

#[test]
fn test_failed_task_holds_its_stage_active() {
    let p = pipeline(&[&[TaskStatus::Failed], &[TaskStatus::Pending]]);
    assert_eq!(p.active_stage().unwrap().position, 0);
}

#[test]
fn test_finished_pipeline_has_no_active_stage() {
    let p = pipeline(&[&[TaskStatus::Done], &[TaskStatus::Done]]);
    assert!(p.active_stage().is_none());
    assert!(p.is_done());
}

#[test]
fn test_task_lookup_across_stages() {
    let p = pipeline(&[&[TaskStatus::Done], &[TaskStatus::Pending]]);
    let last = p.stages[1].tasks[0].id;
    assert_eq!(p.task(last).unwrap().status, TaskStatus::Pending);
    assert_eq!(p.tasks().count(), 2);
}

#[test]
fn test_earliest_allowed_time_gate() {
    let p = pipeline(&[&[TaskStatus::Pending]]);
    let mut t = p.stages[0].tasks[0].clone();
    let now = Utc::now();
    assert!(t.is_time_allowed(now));

    t.earliest_allowed_at = Some(now + Duration::minutes(5));
    assert!(!t.is_time_allowed(now));
    assert!(t.is_time_allowed(now + Duration::minutes(6)));
}

#[test]
fn test_out_of_range_dependency_is_rejected() {
    let create = PipelineCreate {
        name: "p".to_string(),
        creator_id: PrincipalId::SYSTEM_BOT,
        stages: vec![StageCreate {
            name: "s".to_string(),
            environment_id: EnvironmentId::new(),
            tasks: vec![],
            dependencies: vec![TaskIndexDag::new(0, 1)],
        }],
    };
    assert!(create.validate().is_err());
}

#[test]
fn test_task_payload_decodes_into_executor_shape() {
    let p = pipeline(&[&[TaskStatus::Pending]]);
    let mut t = p.stages[0].tasks[0].clone();
    t.task_type = TaskType::SchemaUpdate;
    t.payload = serde_json::json!({
        "statement": "CREATE TABLE t (id INT)",
        "schemaVersion": "0001",
    });

    let payload: strata_core::payload::MigrationPayload = t.payload().unwrap();
    assert_eq!(payload.schema_version, "0001");
    assert!(payload.rollback_statement.is_none());

    t.payload = serde_json::json!({ "statement": 1 });
    assert!(t.payload::<strata_core::payload::MigrationPayload>().is_err());
}
