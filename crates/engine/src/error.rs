//! Error kinds a Job's terminal or step-level failure can carry (§7).

use serde::Serialize;

/// The §7 error kinds. `RiskTooHigh` never reaches here as a `JobError` —
/// it surfaces implicitly as a required approval, never as a Job failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum JobErrorKind {
    ValidationRejected,
    ApprovalTimeout,
    ApprovalNotFound,
    ModelInvocationFailed,
    ModelResponseUnparseable,
    ExecutionTimeout,
    StepFailed,
    DestructiveAborted,
}

/// User-visible failure payload: kind label, message, and — where
/// applicable — the offending step and its captured stderr (§7).
#[derive(Debug, Clone, thiserror::Error, Serialize)]
#[error("{kind:?}: {message}")]
pub struct JobError {
    pub kind: JobErrorKind,
    pub message: String,
    pub step: Option<String>,
    pub stderr: Option<String>,
}

impl JobError {
    #[must_use]
    pub fn new(kind: JobErrorKind, message: impl Into<String>) -> Self {
        Self { kind, message: message.into(), step: None, stderr: None }
    }

    #[must_use]
    pub fn with_step(mut self, step: impl Into<String>) -> Self {
        self.step = Some(step.into());
        self
    }

    #[must_use]
    pub fn with_stderr(mut self, stderr: impl Into<String>) -> Self {
        self.stderr = Some(stderr.into());
        self
    }
}
