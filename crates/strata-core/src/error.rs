//! Error types for strata.

use crate::task::TaskStatus;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    // Lookup errors
    #[error("Issue not found: {0}")]
    IssueNotFound(String),

    #[error("Pipeline not found: {0}")]
    PipelineNotFound(String),

    #[error("Task not found: {0}")]
    TaskNotFound(String),

    #[error("Task check run not found: {0}")]
    TaskCheckRunNotFound(String),

    #[error("Instance not found: {0}")]
    InstanceNotFound(String),

    #[error("Database not found: {0}")]
    DatabaseNotFound(String),

    #[error("Backup not found: {0}")]
    BackupNotFound(String),

    #[error("Principal not found: {0}")]
    PrincipalNotFound(String),

    // State machine errors
    #[error("Invalid task status transition from {from} to {to}")]
    InvalidStatusTransition { from: TaskStatus, to: TaskStatus },

    #[error("Conflict: {0}")]
    Conflict(String),

    #[error("Invalid payload: {0}")]
    InvalidPayload(String),

    #[error("Invalid task dependency: {0}")]
    InvalidDependency(String),

    // Auth errors
    #[error("Authorization denied: {0}")]
    AuthorizationDenied(String),

    // Approval errors
    #[error("Approval blocked: {0}")]
    ApprovalBlocked(String),

    #[error("External approval provider error: {0}")]
    ApprovalProvider(String),

    // Infrastructure errors
    #[error("Database error: {0}")]
    Database(String),

    #[error("Network error: {0}")]
    Network(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(String),

    // Generic
    #[error("Internal error: {0}")]
    Internal(String),
}

pub type Result<T> = std::result::Result<T, Error>;

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Error::Serialization(err.to_string())
    }
}
