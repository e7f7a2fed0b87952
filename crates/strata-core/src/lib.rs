//! Strata Core
//!
//! Domain model for the migration task engine: the Issue → Pipeline → Stage → Task
//! hierarchy, task check runs, external approvals and activities, together with the
//! repository and collaborator ports the schedulers are written against.

pub mod activity;
pub mod approval;
pub mod check;
pub mod error;
pub mod ids;
pub mod instance;
pub mod issue;
pub mod payload;
pub mod pipeline;
pub mod ports;
pub mod principal;
pub mod task;

pub use error::{Error, Result};
pub use ids::*;
