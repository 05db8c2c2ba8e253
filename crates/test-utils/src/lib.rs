//! Shared helpers for database-backed stageflow tests.

pub mod db;
