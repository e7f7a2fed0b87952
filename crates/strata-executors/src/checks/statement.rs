use super::statement_of;
use crate::advisor::{StatementKind, codes, split_statements, statement_kind};
use crate::deps::ExecutorDeps;
use async_trait::async_trait;
use std::sync::Arc;
use strata_core::check::{Finding, TaskCheckRun};
use strata_core::task::{Task, TaskType};
use strata_scheduler::{ExecutionContext, ExecutorError, TaskCheckExecutor, run_isolated};

fn nothing_to_check() -> Vec<Finding> {
    vec![Finding::success("No statement")]
}

/// Whether the task's SQL parses.
pub struct StatementSyntaxCheck {
    deps: Arc<ExecutorDeps>,
}

impl StatementSyntaxCheck {
    pub fn new(deps: Arc<ExecutorDeps>) -> Self {
        Self { deps }
    }
}

#[async_trait]
impl TaskCheckExecutor for StatementSyntaxCheck {
    async fn run(
        &self,
        _ctx: &ExecutionContext,
        _run: &TaskCheckRun,
        task: &Task,
    ) -> Result<Vec<Finding>, ExecutorError> {
        let (instance, statement) = statement_of(&self.deps, task).await?;
        let Some(statement) = statement else {
            return Ok(nothing_to_check());
        };
        let advisor = self.deps.advisor.clone();
        run_isolated("sql-advisor", async move {
            Ok(advisor.check_syntax(instance.engine, &statement).await)
        })
        .await
    }
}

/// SQL review rules.
pub struct StatementAdviseCheck {
    deps: Arc<ExecutorDeps>,
}

impl StatementAdviseCheck {
    pub fn new(deps: Arc<ExecutorDeps>) -> Self {
        Self { deps }
    }
}

#[async_trait]
impl TaskCheckExecutor for StatementAdviseCheck {
    async fn run(
        &self,
        _ctx: &ExecutionContext,
        _run: &TaskCheckRun,
        task: &Task,
    ) -> Result<Vec<Finding>, ExecutorError> {
        let (instance, statement) = statement_of(&self.deps, task).await?;
        let Some(statement) = statement else {
            return Ok(nothing_to_check());
        };
        let advisor = self.deps.advisor.clone();
        run_isolated("sql-advisor", async move {
            Ok(advisor.review(instance.engine, &statement).await)
        })
        .await
    }
}

/// Keeps DDL out of data updates and DML out of schema updates.
pub struct StatementTypeCheck {
    deps: Arc<ExecutorDeps>,
}

impl StatementTypeCheck {
    pub fn new(deps: Arc<ExecutorDeps>) -> Self {
        Self { deps }
    }

    fn classify(task_type: TaskType, statement: &str) -> Option<Finding> {
        match (task_type, statement_kind(statement)) {
            (_, StatementKind::CreateDatabase) => Some(Finding::error(
                codes::CREATE_DATABASE,
                "CREATE DATABASE in a migration",
                format!("\"{statement}\" must be a database creation task"),
            )),
            (TaskType::SchemaUpdate | TaskType::SchemaUpdateGhostSync, StatementKind::Dml) => {
                Some(Finding::error(
                    codes::DML_IN_SCHEMA_UPDATE,
                    "Data change in a schema update",
                    format!("\"{statement}\" belongs in a data update"),
                ))
            }
            (TaskType::DataUpdate, StatementKind::Ddl) => Some(Finding::error(
                codes::DDL_IN_DATA_UPDATE,
                "Schema change in a data update",
                format!("\"{statement}\" belongs in a schema update"),
            )),
            _ => None,
        }
    }
}

#[async_trait]
impl TaskCheckExecutor for StatementTypeCheck {
    async fn run(
        &self,
        _ctx: &ExecutionContext,
        _run: &TaskCheckRun,
        task: &Task,
    ) -> Result<Vec<Finding>, ExecutorError> {
        let (_, statement) = statement_of(&self.deps, task).await?;
        let Some(statement) = statement else {
            return Ok(nothing_to_check());
        };
        // Unparseable SQL is reported by the syntax check.
        let Ok(statements) = split_statements(&statement) else {
            return Ok(vec![]);
        };
        let findings: Vec<Finding> = statements
            .iter()
            .filter_map(|s| Self::classify(task.task_type, s))
            .collect();
        if findings.is_empty() {
            Ok(vec![Finding::success("OK")])
        } else {
            Ok(findings)
        }
    }
}
