//! PostgreSQL implementations of the repository ports.

mod activity;
mod approval;
mod check;
mod directory;
mod instance;
mod issue;
mod pipeline;
mod task;

use sqlx::postgres::PgRow;
use sqlx::{PgPool, Row};
use std::str::FromStr;
use strata_core::{Error, Result};

/// PostgreSQL implementation of every repository port.
#[derive(Clone)]
pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

pub(crate) fn db_err(e: sqlx::Error) -> Error {
    Error::Database(e.to_string())
}

/// Decode a text column through the domain enum's `FromStr`.
pub(crate) fn parse_col<T>(r: &PgRow, col: &str) -> Result<T>
where
    T: FromStr<Err = Error>,
{
    r.try_get::<String, _>(col).map_err(db_err)?.parse()
}

pub(crate) fn json_col<T>(r: &PgRow, col: &str) -> Result<T>
where
    T: serde::de::DeserializeOwned,
{
    let value: serde_json::Value = r.try_get(col).map_err(db_err)?;
    Ok(serde_json::from_value(value)?)
}
