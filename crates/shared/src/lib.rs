#![cfg_attr(test, allow(clippy::unwrap_used))]

//! Shared infrastructure for the Billbridge workspace.
//!
//! Holds the pieces both the API server and the billing crate need:
//! database pool construction, embedded migrations, and the small set of
//! cross-crate types.

pub mod db;
pub mod types;

pub use db::{create_migration_pool, create_pool, run_migrations};
pub use types::SubscriptionStatus;
