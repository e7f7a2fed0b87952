//! Integration test infrastructure for strata.
//!
//! One Postgres container serves twice: as the metadata store behind
//! [`strata_db::PgStore`] and as the managed instance the executors change.
//!
//! ```ignore
//! use strata_tests::TestContext;
//!
//! #[tokio::test]
//! async fn test_something() {
//!     let ctx = TestContext::new().await.unwrap();
//!     let world = ctx.world().await.unwrap();
//! }
//! ```
//!
//! Run with `cargo test -p strata-tests --features integration`.

pub mod containers;
pub mod context;
pub mod fixtures;

pub use context::TestContext;
pub use fixtures::World;

/// Initialize test logging (safe to call from every test).
pub fn init_test_logging() {
    use tracing_subscriber::{EnvFilter, fmt};

    let _ = fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("warn,strata_scheduler=info,strata_tests=debug")),
        )
        .with_test_writer()
        .try_init();
}
