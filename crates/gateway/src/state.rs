//! Shared state handed to every route handler.

use std::sync::Arc;

use opsentry_common::types::ContextCollector;
use opsentry_engine::JobEngine;

/// Cheap to clone: both fields are themselves `Arc`-backed.
#[derive(Clone)]
pub struct AppState {
    pub engine: JobEngine,
    pub collector: Arc<dyn ContextCollector>,
    pub default_approval_timeout: u64,
}
