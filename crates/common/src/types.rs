//! Data model shared by every Job Lifecycle Engine component.
//!
//! Types owned by a single component (`RiskReport`, `PendingApproval`, the
//! preference/pattern entries) live in that component's crate and are
//! re-exported from there; this module holds the types that flow through
//! every stage of a job's life: the job itself, its context snapshot, and
//! the plan produced by the model.

use std::collections::HashMap;

use {
    chrono::{DateTime, Utc},
    serde::{Deserialize, Serialize},
    serde_json::Value,
    uuid::Uuid,
};

/// Where a [`Job`] currently sits in its lifecycle. See the state machine
/// in the job engine: `Pending -> Approved -> Executing -> Completed`, with
/// `Rejected` and `Failed` as terminal off-ramps.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Pending,
    Approved,
    Executing,
    Completed,
    Rejected,
    Failed,
}

impl JobStatus {
    /// A Job in any of these states must never be mutated again (invariant I1).
    #[must_use]
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Rejected | Self::Failed)
    }
}

/// A single timestamped entry in a Job's event log.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobLogEntry {
    pub timestamp: DateTime<Utc>,
    pub level: LogLevel,
    pub message: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Info,
    Warn,
    Error,
}

/// The recorded outcome of an approval decision, attached to a Job once one
/// has been made (explicitly or automatically).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApprovalDecisionRecord {
    pub approved_by: String,
    pub decided_at: DateTime<Utc>,
    pub remembered: bool,
    pub note: Option<String>,
}

/// The central entity: one user request tracked end to end.
///
/// Mutated only by the job engine that owns it (invariant I1/I3); every
/// other component observes a cloned snapshot.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Job {
    pub id: Uuid,
    pub user_id: String,
    pub command: String,
    pub context: ContextSnapshot,
    pub status: JobStatus,
    pub progress: u8,
    pub log: Vec<JobLogEntry>,
    pub approval: Option<ApprovalDecisionRecord>,
    /// Value, not an owning reference — see the design note on avoiding a
    /// cyclic Job<->approval relationship.
    pub approval_id: Option<Uuid>,
    pub model_used: Option<String>,
    pub plan: Option<Plan>,
    pub input_tokens: u64,
    pub output_tokens: u64,
    pub cost_usd: f64,
    pub result: Option<Value>,
    pub error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Job {
    #[must_use]
    pub fn new(user_id: impl Into<String>, command: impl Into<String>, context: ContextSnapshot) -> Self {
        let now = context.captured_at;
        Self {
            id: Uuid::new_v4(),
            user_id: user_id.into(),
            command: command.into(),
            context,
            status: JobStatus::Pending,
            progress: 0,
            log: Vec::new(),
            approval: None,
            approval_id: None,
            model_used: None,
            plan: None,
            input_tokens: 0,
            output_tokens: 0,
            cost_usd: 0.0,
            result: None,
            error: None,
            created_at: now,
            updated_at: now,
        }
    }
}

/// Immutable once attached to a Job. Collector summaries are opaque maps —
/// the engine never interprets their shape, only forwards them to the
/// prompt assembler.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ContextSnapshot {
    pub cwd: String,
    pub user_id: String,
    pub captured_at: DateTime<Utc>,
    pub files: Option<HashMap<String, Value>>,
    pub processes: Option<HashMap<String, Value>>,
    pub git: Option<HashMap<String, Value>>,
    /// Filtered to the allow list in the configuration section: PATH, HOME,
    /// USER, SHELL, LANG, PWD. Never secrets.
    pub env: HashMap<String, String>,
}

impl ContextSnapshot {
    #[must_use]
    pub fn empty(user_id: impl Into<String>, cwd: impl Into<String>, captured_at: DateTime<Utc>) -> Self {
        Self {
            cwd: cwd.into(),
            user_id: user_id.into(),
            captured_at,
            files: None,
            processes: None,
            git: None,
            env: HashMap::new(),
        }
    }

    /// Rough serialized size, used by the router's "large context" signal.
    #[must_use]
    pub fn approx_byte_len(&self) -> usize {
        serde_json::to_vec(self).map(|v| v.len()).unwrap_or(0)
    }
}

/// The kind of operation a [`PlannedStep`] performs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum StepKind {
    Shell,
    EmbeddedScripting,
    Query,
}

/// Self-declared risk the model attaches to a step; the validator and
/// executor both consult it to decide what they'll permit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SafetyLevel {
    Safe,
    Moderate,
    Destructive,
}

/// One operation emitted by the model gateway.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlannedStep {
    #[serde(rename = "type")]
    pub kind: StepKind,
    pub command: String,
    pub description: String,
    pub safety_level: SafetyLevel,
}

/// An ordered sequence of steps produced by the model for one command.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Plan {
    pub interpretation: String,
    pub commands: Vec<PlannedStep>,
    pub explanation: String,
    #[serde(default)]
    pub risks: Vec<String>,
}

/// Read-only accessor for context collectors (file/process/git summaries).
///
/// The HTTP transport, filesystem watcher, and git integration that feed
/// real data into this trait are external collaborators (§1); this crate
/// ships only the trait and a [`NullCollector`] so the rest of the engine
/// can be built and tested without them.
#[async_trait::async_trait]
pub trait ContextCollector: Send + Sync {
    async fn collect(&self, cwd: &str) -> HashMap<String, Value>;
}

/// A collector that always returns an empty summary. Collector failure must
/// never propagate to the engine (§6) — this is the degenerate case of
/// "always succeeds, with nothing to report".
#[derive(Debug, Clone, Copy, Default)]
pub struct NullCollector;

#[async_trait::async_trait]
impl ContextCollector for NullCollector {
    async fn collect(&self, _cwd: &str) -> HashMap<String, Value> {
        HashMap::new()
    }
}

/// A collector whose query can fail (e.g. the git/process/filesystem
/// collectors §1 leaves external). Real implementations return this
/// instead of [`ContextCollector`] directly so [`Fallible`] can give them
/// the §6-mandated "never raised to the engine" behavior for free.
#[async_trait::async_trait]
pub trait FallibleContextCollector: Send + Sync {
    async fn try_collect(&self, cwd: &str) -> crate::error::Result<HashMap<String, Value>>;
}

/// Adapts a [`FallibleContextCollector`] into a [`ContextCollector`] by
/// folding a failure into the `{error: string}` map §6 requires instead of
/// propagating it.
pub struct Fallible<C>(pub C);

#[async_trait::async_trait]
impl<C: FallibleContextCollector> ContextCollector for Fallible<C> {
    async fn collect(&self, cwd: &str) -> HashMap<String, Value> {
        match self.0.try_collect(cwd).await {
            Ok(summary) => summary,
            Err(err) => {
                tracing::warn!(%err, "context collector failed, reporting inline");
                crate::error::collector_failure_map(&err)
            },
        }
    }
}
