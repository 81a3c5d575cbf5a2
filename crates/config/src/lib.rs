//! Configuration loading and validation.
//!
//! Config files: `opsentry.toml`, `opsentry.yaml`, or `opsentry.json`.
//! Searched in `./` then `~/.config/opsentry/`.
//!
//! Supports `${ENV_VAR}` substitution in all string values.

pub mod env_subst;
pub mod loader;
pub mod schema;

pub use {
    loader::{config_dir, data_dir, discover_and_load, find_or_default_config_path, save_config},
    schema::{ModelEntry, OpsentryConfig},
};
