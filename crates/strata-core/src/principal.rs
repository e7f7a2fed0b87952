//! Principals and project membership.

use crate::error::{Error, Result};
use crate::ids::{PrincipalId, ProjectId};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::str::FromStr;

/// Workspace-level role.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    Owner,
    Dba,
    Developer,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::Owner => "owner",
            Role::Dba => "dba",
            Role::Developer => "developer",
        }
    }

    pub fn is_owner_or_dba(&self) -> bool {
        matches!(self, Role::Owner | Role::Dba)
    }
}

impl FromStr for Role {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "owner" => Ok(Role::Owner),
            "dba" => Ok(Role::Dba),
            "developer" => Ok(Role::Developer),
            other => Err(Error::InvalidPayload(format!("unknown role: {other}"))),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum ProjectRole {
    Owner,
    Developer,
}

impl ProjectRole {
    pub fn as_str(&self) -> &'static str {
        match self {
            ProjectRole::Owner => "owner",
            ProjectRole::Developer => "developer",
        }
    }
}

impl FromStr for ProjectRole {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "owner" => Ok(ProjectRole::Owner),
            "developer" => Ok(ProjectRole::Developer),
            other => Err(Error::InvalidPayload(format!("unknown project role: {other}"))),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct Principal {
    pub id: PrincipalId,
    pub name: String,
    pub email: String,
    pub role: Role,
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct ProjectMember {
    pub project_id: ProjectId,
    pub principal_id: PrincipalId,
    pub role: ProjectRole,
}
