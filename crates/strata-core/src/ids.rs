//! Strongly-typed identifiers for domain entities.

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

macro_rules! define_id {
    ($name:ident, $prefix:expr) => {
        #[derive(
            Debug,
            Clone,
            Copy,
            PartialEq,
            Eq,
            PartialOrd,
            Ord,
            Hash,
            Serialize,
            Deserialize,
            JsonSchema,
        )]
        #[serde(transparent)]
        pub struct $name(Uuid);

        impl $name {
            pub fn new() -> Self {
                Self(Uuid::now_v7())
            }

            pub const fn from_uuid(uuid: Uuid) -> Self {
                Self(uuid)
            }

            pub fn as_uuid(&self) -> &Uuid {
                &self.0
            }
        }

        impl Default for $name {
            fn default() -> Self {
                Self::new()
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}_{}", $prefix, self.0)
            }
        }

        impl std::str::FromStr for $name {
            type Err = uuid::Error;

            fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
                let uuid_str = s.strip_prefix(concat!($prefix, "_")).unwrap_or(s);
                Ok(Self(Uuid::parse_str(uuid_str)?))
            }
        }
    };
}

define_id!(IssueId, "iss");
define_id!(PipelineId, "pip");
define_id!(StageId, "stg");
define_id!(TaskId, "tsk");
define_id!(TaskCheckRunId, "tcr");
define_id!(ProjectId, "prj");
define_id!(EnvironmentId, "env");
define_id!(InstanceId, "ins");
define_id!(DatabaseId, "db");
define_id!(BackupId, "bak");
define_id!(PrincipalId, "usr");
define_id!(ExternalApprovalId, "eap");
define_id!(ActivityId, "act");
define_id!(WebhookId, "whk");

impl PrincipalId {
    /// The built-in actor the schedulers act as. Never receives inbox entries.
    pub const SYSTEM_BOT: PrincipalId = PrincipalId::from_uuid(Uuid::from_u128(1));

    pub fn is_system_bot(&self) -> bool {
        *self == Self::SYSTEM_BOT
    }
}
