//! Approval Manager (C8): decides whether a command needs a human decision,
//! holds pending requests with a timeout, and resolves them.

use std::{
    collections::HashMap,
    panic::AssertUnwindSafe,
    sync::{Arc, Mutex},
    time::Duration,
};

use {
    chrono::{DateTime, Utc},
    opsentry_common::types::ContextSnapshot,
    opsentry_preferences::{PreferenceLookup, PreferenceStore},
    opsentry_risk::{RiskLevel, RiskReport},
    tokio::sync::{RwLock, oneshot},
    tracing::warn,
    uuid::Uuid,
};

const DEFAULT_APPROVAL_TIMEOUT: Duration = Duration::from_secs(300);

/// Assesses risk for a command. A trait so tests can inject a panicking
/// assessor to exercise the fail-closed path (P7) without touching
/// `opsentry-risk` itself.
pub trait RiskAssessor: Send + Sync {
    fn assess(&self, command: &str, context: &ContextSnapshot) -> RiskReport;
}

/// The production assessor, delegating to C1.
pub struct DefaultRiskAssessor;

impl RiskAssessor for DefaultRiskAssessor {
    fn assess(&self, command: &str, context: &ContextSnapshot) -> RiskReport {
        opsentry_risk::assess(command, context)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ApprovalStatus {
    Pending,
    Approved,
    Rejected,
    Timeout,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApprovalDecision {
    Approved,
    Rejected,
}

/// A request for human sign-off, with the risk snapshot that produced it.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct PendingApproval {
    pub approval_id: Uuid,
    pub user_id: String,
    pub job_id: Uuid,
    pub command: String,
    pub risk: RiskReport,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub status: ApprovalStatus,
}

impl PendingApproval {
    #[must_use]
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        now >= self.expires_at
    }
}

struct PendingEntry {
    snapshot: PendingApproval,
    tx: Option<oneshot::Sender<ApprovalDecision>>,
}

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("approval request {0} not found")]
    NotFound(Uuid),
    #[error("approval request {0} already expired")]
    Expired(Uuid),
}

pub type Result<T> = std::result::Result<T, Error>;

/// Decides whether commands need approval, and tracks outstanding requests
/// until a human responds or the request times out.
pub struct ApprovalManager {
    risk_assessor: Box<dyn RiskAssessor>,
    preferences: Mutex<PreferenceStore>,
    auto_approve_safe: bool,
    learn_preferences: bool,
    default_timeout: Duration,
    pending: Arc<RwLock<HashMap<Uuid, PendingEntry>>>,
}

impl ApprovalManager {
    /// `learn_preferences` gates whether a `remember=true` response in
    /// [`Self::respond`] actually writes to the preference store — the
    /// config key of the same name (§6) lets an operator disable pattern
    /// learning entirely while still allowing one-off remembered approvals
    /// to take effect for the current session.
    #[must_use]
    pub fn new(preferences: PreferenceStore, auto_approve_safe: bool, learn_preferences: bool) -> Self {
        Self {
            risk_assessor: Box::new(DefaultRiskAssessor),
            preferences: Mutex::new(preferences),
            auto_approve_safe,
            learn_preferences,
            default_timeout: DEFAULT_APPROVAL_TIMEOUT,
            pending: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    #[must_use]
    pub fn with_risk_assessor(mut self, assessor: Box<dyn RiskAssessor>) -> Self {
        self.risk_assessor = assessor;
        self
    }

    #[must_use]
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.default_timeout = timeout;
        self
    }

    /// Decision logic from §4.7. Fail-closed: any panic while assessing
    /// risk (modeling "any exception in the chain") returns `true`.
    #[must_use]
    pub fn requires_approval(&self, command: &str, context: &ContextSnapshot, user_id: &str) -> bool {
        let risk = match std::panic::catch_unwind(AssertUnwindSafe(|| self.risk_assessor.assess(command, context))) {
            Ok(report) => report,
            Err(_) => {
                warn!(user_id, "risk assessment panicked, failing closed");
                return true;
            },
        };

        let Ok(store) = self.preferences.lock() else {
            warn!(user_id, "preference store lock poisoned, failing closed");
            return true;
        };
        let lookup = store.lookup(user_id, command);
        drop(store);

        if self.auto_approve_safe && risk.level == RiskLevel::Safe && !matches!(lookup, PreferenceLookup::AlwaysDeny { .. }) {
            return false;
        }

        if matches!(lookup, PreferenceLookup::AlwaysApprove { .. }) && risk.level < RiskLevel::High {
            return false;
        }

        true
    }

    /// Creates a pending approval and schedules a real-time timer that
    /// flips its status to `Timeout` if it is still pending at expiry.
    /// Removal from the table happens lazily, the next time `status` or
    /// `list_pending` encounters it (§4.7). `timeout_override` lets a single
    /// request ask for a longer or shorter window than the manager's
    /// default (§6's per-request `approval_timeout`).
    pub async fn request(
        &self,
        job_id: Uuid,
        user_id: &str,
        command: &str,
        risk: RiskReport,
        now: DateTime<Utc>,
        timeout_override: Option<Duration>,
    ) -> Uuid {
        let approval_id = Uuid::new_v4();
        let timeout = timeout_override.unwrap_or(self.default_timeout);
        let (tx, _rx) = oneshot::channel();
        let snapshot = PendingApproval {
            approval_id,
            user_id: user_id.to_string(),
            job_id,
            command: command.to_string(),
            risk,
            created_at: now,
            expires_at: now + timeout,
            status: ApprovalStatus::Pending,
        };

        self.pending.write().await.insert(approval_id, PendingEntry { snapshot, tx: Some(tx) });

        let pending = Arc::clone(&self.pending);
        tokio::spawn(async move {
            tokio::time::sleep(timeout).await;
            if let Some(entry) = pending.write().await.get_mut(&approval_id) {
                if entry.snapshot.status == ApprovalStatus::Pending {
                    entry.snapshot.status = ApprovalStatus::Timeout;
                    entry.tx = None;
                }
            }
        });

        approval_id
    }

    /// Resolves a pending request. If `remember` is set, forwards the
    /// decision to the preference store.
    pub async fn respond(&self, approval_id: Uuid, decision: ApprovalDecision, remember: bool, now: DateTime<Utc>) -> Result<()> {
        let mut table = self.pending.write().await;
        let Some(entry) = table.get_mut(&approval_id) else {
            return Err(Error::NotFound(approval_id));
        };
        if entry.snapshot.is_expired(now) {
            table.remove(&approval_id);
            return Err(Error::Expired(approval_id));
        }

        entry.snapshot.status = match decision {
            ApprovalDecision::Approved => ApprovalStatus::Approved,
            ApprovalDecision::Rejected => ApprovalStatus::Rejected,
        };
        if let Some(tx) = entry.tx.take() {
            let _ = tx.send(decision);
        }
        let user_id = entry.snapshot.user_id.clone();
        let command = entry.snapshot.command.clone();
        table.remove(&approval_id);
        drop(table);

        if remember && self.learn_preferences {
            if let Ok(mut store) = self.preferences.lock() {
                store.learn(&user_id, &command, decision == ApprovalDecision::Approved, "remembered from approval response");
                let _ = store.save();
            }
        }

        Ok(())
    }

    /// Snapshot of a request, lazily evicting it first if expired.
    pub async fn status(&self, approval_id: Uuid, now: DateTime<Utc>) -> Option<PendingApproval> {
        let mut table = self.pending.write().await;
        let expired = table.get(&approval_id).is_some_and(|e| e.snapshot.is_expired(now));
        if expired {
            if let Some(mut entry) = table.remove(&approval_id) {
                entry.snapshot.status = ApprovalStatus::Timeout;
                return Some(entry.snapshot);
            }
        }
        table.get(&approval_id).map(|e| e.snapshot.clone())
    }

    /// All pending snapshots for a user (or everyone, if `user_id` is
    /// `None`), lazily evicting any expired entries encountered.
    pub async fn list_pending(&self, user_id: Option<&str>, now: DateTime<Utc>) -> Vec<PendingApproval> {
        let mut table = self.pending.write().await;
        let expired_ids: Vec<Uuid> =
            table.iter().filter(|(_, e)| e.snapshot.is_expired(now)).map(|(id, _)| *id).collect();
        for id in expired_ids {
            table.remove(&id);
        }
        table
            .values()
            .map(|e| &e.snapshot)
            .filter(|s| user_id.is_none_or(|u| s.user_id == u))
            .cloned()
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use chrono::Duration as ChronoDuration;
    use opsentry_risk::{RiskFactors, assess};

    use super::*;

    fn ctx() -> ContextSnapshot {
        ContextSnapshot::empty("dev", "/home/dev", Utc::now())
    }

    fn manager(auto_approve_safe: bool) -> ApprovalManager {
        manager_with_learning(auto_approve_safe, true)
    }

    fn manager_with_learning(auto_approve_safe: bool, learn_preferences: bool) -> ApprovalManager {
        ApprovalManager::new(
            PreferenceStore::load(std::env::temp_dir().join(format!("opsentry-test-nonexistent-{}.json", Uuid::new_v4()))),
            auto_approve_safe,
            learn_preferences,
        )
    }

    struct PanickingAssessor;
    impl RiskAssessor for PanickingAssessor {
        fn assess(&self, _command: &str, _context: &ContextSnapshot) -> RiskReport {
            panic!("boom")
        }
    }

    #[test]
    fn auto_approve_safe_skips_approval() {
        let mgr = manager(true);
        assert!(!mgr.requires_approval("ls -la", &ctx(), "alice"));
    }

    #[test]
    fn medium_risk_requires_approval_even_with_auto_approve_safe() {
        let mgr = manager(true);
        assert!(mgr.requires_approval("rm file.txt", &ctx(), "alice"));
    }

    #[test]
    fn fail_closed_when_risk_assessor_panics() {
        let mgr = manager(true).with_risk_assessor(Box::new(PanickingAssessor));
        assert!(mgr.requires_approval("ls -la", &ctx(), "alice"));
    }

    #[tokio::test]
    async fn request_then_respond_resolves_and_removes() {
        let mgr = manager(false);
        let now = Utc::now();
        let risk = assess("rm file.txt", &ctx());
        let job_id = Uuid::new_v4();
        let approval_id = mgr.request(job_id, "alice", "rm file.txt", risk, now, None).await;

        assert!(mgr.status(approval_id, now).await.is_some());
        assert!(mgr.respond(approval_id, ApprovalDecision::Approved, false, now).await.is_ok());
        assert!(mgr.status(approval_id, now).await.is_none());
    }

    #[tokio::test]
    async fn remembered_decision_is_learned_when_learning_enabled() {
        let mgr = manager_with_learning(false, true);
        let now = Utc::now();
        let risk = assess("ls -la", &ctx());
        let job_id = Uuid::new_v4();
        let approval_id = mgr.request(job_id, "alice", "ls -la", risk, now, None).await;
        mgr.respond(approval_id, ApprovalDecision::Approved, true, now).await.expect("respond");

        assert!(!mgr.requires_approval("ls -la", &ctx(), "alice"));
    }

    #[tokio::test]
    async fn remembered_decision_is_ignored_when_learning_disabled() {
        let mgr = manager_with_learning(false, false);
        let now = Utc::now();
        let risk = assess("ls -la", &ctx());
        let job_id = Uuid::new_v4();
        let approval_id = mgr.request(job_id, "alice", "ls -la", risk, now, None).await;
        mgr.respond(approval_id, ApprovalDecision::Approved, true, now).await.expect("respond");

        assert!(mgr.requires_approval("ls -la", &ctx(), "alice"));
    }

    #[tokio::test]
    async fn respond_to_unknown_id_errors() {
        let mgr = manager(false);
        let result = mgr.respond(Uuid::new_v4(), ApprovalDecision::Approved, false, Utc::now()).await;
        assert!(matches!(result, Err(Error::NotFound(_))));
    }

    #[tokio::test]
    async fn list_pending_evicts_expired_entries() {
        let mgr = manager(false);
        let now = Utc::now();
        let risk = RiskReport {
            level: RiskLevel::Medium,
            score: 2,
            factors: RiskFactors { base_command: RiskLevel::Medium, patterns: RiskLevel::Safe, context: RiskLevel::Safe, paths: RiskLevel::Safe },
            reasons: Vec::new(),
            recommendations: Vec::new(),
        };
        let job_id = Uuid::new_v4();
        let approval_id = mgr.request(job_id, "alice", "rm file.txt", risk, now, None).await;

        let later = now + ChronoDuration::seconds(301);
        assert!(mgr.list_pending(Some("alice"), later).await.is_empty());
        assert!(mgr.status(approval_id, later).await.is_none());
    }
}
