//! Wire DTOs for the HTTP/WS surface (§6). Kept separate from
//! `opsentry_common::types` so internal Job Lifecycle Engine types can
//! evolve without dragging every field across the wire verbatim.

use chrono::{DateTime, Utc};
use opsentry_common::types::{ContextSnapshot, Job};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Body of `POST /api/v1/command`.
#[derive(Debug, Deserialize)]
pub struct SubmitCommandRequest {
    pub command: String,
    pub user_id: String,
    #[serde(default)]
    pub context: Option<SubmitContext>,
    /// Per-request override of the approval manager's default timeout, in
    /// seconds (§6's `approval_timeout?`).
    #[serde(default)]
    pub approval_timeout: Option<u64>,
}

/// The caller-supplied half of a [`ContextSnapshot`] — `cwd` is the only
/// field a client can reasonably know; the rest is collector-populated.
#[derive(Debug, Deserialize)]
pub struct SubmitContext {
    #[serde(default)]
    pub cwd: Option<String>,
}

/// Response body of `POST /api/v1/command`, matching §6 exactly.
#[derive(Debug, Serialize)]
pub struct SubmitCommandResponse {
    pub job_id: Uuid,
    pub status: &'static str,
    pub requires_approval: bool,
    pub estimated_cost: f64,
    pub model_used: String,
}

/// Body of `POST /api/v1/command/{id}/approve`.
#[derive(Debug, Deserialize)]
pub struct ApproveCommandRequest {
    pub approved: bool,
    #[serde(default)]
    pub remember: bool,
    #[serde(default)]
    pub note: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct ApproveCommandResponse {
    pub ok: bool,
}

/// Query params for `GET /api/v1/jobs`.
#[derive(Debug, Deserialize)]
pub struct ListJobsQuery {
    pub user_id: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
    pub version: &'static str,
    pub jobs_tracked: usize,
}

#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub error: String,
}

/// Envelope pushed over `/ws/events`: a `job_update` for every Job
/// snapshot change, carrying a timestamp per §6.
#[derive(Debug, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum EventEnvelope {
    JobUpdate { timestamp: DateTime<Utc>, job: Box<Job> },
    Notification { timestamp: DateTime<Utc>, message: String },
}

impl EventEnvelope {
    #[must_use]
    pub fn job_update(job: Job) -> Self {
        Self::JobUpdate { timestamp: Utc::now(), job: Box::new(job) }
    }

    #[must_use]
    pub fn notification(message: impl Into<String>) -> Self {
        Self::Notification { timestamp: Utc::now(), message: message.into() }
    }
}

impl SubmitContext {
    /// Fills in the fields a client can't reasonably supply (env, captured
    /// time) and defers to the collector-populated halves via `collector`.
    #[must_use]
    pub fn into_snapshot(self, user_id: &str, default_cwd: &str) -> ContextSnapshot {
        ContextSnapshot::empty(user_id, self.cwd.unwrap_or_else(|| default_cwd.to_string()), Utc::now())
    }
}
