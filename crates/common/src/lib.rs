//! Shared types, error definitions, and utilities used across all opsentry crates.

pub mod error;
pub mod types;

pub use error::{Error, Result, collector_failure_map};
