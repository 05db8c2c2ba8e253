//! PostgreSQL integration tests.
//!
//! Each test runs against its own migrated database; see `test-utils`.

#[path = "../support/mod.rs"]
mod support;

mod manager;
