//! Cross-cutting error taxonomy shared by every crate that doesn't own a
//! narrower `thiserror` enum of its own (C1-C9 each define their own —
//! see `opsentry-risk`, `opsentry-approval`, `opsentry-modelgw`,
//! `opsentry-sandbox`, `opsentry-engine::error`). This module covers the
//! two failure modes that sit outside any single component: configuration
//! loading and context-collector failures.

use std::collections::HashMap;

use serde_json::Value;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    /// `opsentry-config`'s `discover_and_load`/`load_config` failed to
    /// parse a found config file.
    #[error("configuration error: {0}")]
    Config(String),

    /// A [`crate::types::ContextCollector`] failed to produce a summary.
    /// Per §6, this must never propagate to the job engine — callers fold
    /// it into the snapshot via [`collector_failure_map`] instead of
    /// returning this variant upward.
    #[error("context collector failed: {0}")]
    Collector(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error("{0}")]
    Other(String),
}

pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    #[must_use]
    pub fn config(message: impl Into<String>) -> Self {
        Self::Config(message.into())
    }

    #[must_use]
    pub fn collector(message: impl Into<String>) -> Self {
        Self::Collector(message.into())
    }
}

/// Encodes a collector failure as the `{error: string}` map entry §6
/// mandates in place of the collector's normal opaque summary.
#[must_use]
pub fn collector_failure_map(err: &Error) -> HashMap<String, Value> {
    let mut map = HashMap::with_capacity(1);
    map.insert("error".to_string(), Value::String(err.to_string()));
    map
}
