//! Stormeter shared plumbing
//!
//! Database pools, embedded migrations and tracing setup used by every
//! binary in the workspace.

pub mod db;
pub mod telemetry;

pub use db::{create_pool, run_migrations, DbError};
pub use telemetry::init_tracing;
