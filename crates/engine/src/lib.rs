//! Job Engine (C9): coordinates C1 (via C8), C2 (via C8), C3, C4, C5/C6, C7,
//! and C8 across a Job's whole lifecycle (§4.8).

pub mod error;

pub use error::{JobError, JobErrorKind};

use std::{collections::HashMap, path::PathBuf, sync::Arc, time::Duration};

use {
    chrono::Utc,
    opsentry_approval::{ApprovalDecision, ApprovalManager},
    opsentry_common::types::{ApprovalDecisionRecord, ContextSnapshot, Job, JobLogEntry, JobStatus, LogLevel},
    opsentry_config::OpsentryConfig,
    opsentry_modelgw::ModelGateway,
    opsentry_sandbox::SandboxExecutor,
    opsentry_validator::CommandValidator,
    serde_json::json,
    tokio::sync::{RwLock, broadcast},
    tracing::warn,
    uuid::Uuid,
};

/// What `JobEngine::submit` hands back immediately: the §6 response shape
/// for `POST /api/v1/command`.
#[derive(Debug, Clone)]
pub struct SubmitOutcome {
    pub job_id: Uuid,
    pub status: JobStatus,
    pub requires_approval: bool,
    pub estimated_cost: f64,
    pub model_used: String,
}

/// Published every time a Job's status, progress, or log changes — the
/// "publishes a snapshot to any subscribers" half of §4.8. `opsentry-gateway`'s
/// WS layer is the reference subscriber.
#[derive(Debug, Clone)]
pub struct JobEvent {
    pub job_id: Uuid,
    pub job: Job,
}

fn log_entry(level: LogLevel, message: impl Into<String>) -> JobLogEntry {
    JobLogEntry { timestamp: Utc::now(), level, message: message.into() }
}

/// The shared concurrent map of live Jobs (§5). A write lock is held only
/// across a single field update on one entry, never across an `.await`.
#[derive(Default)]
struct JobRegistry {
    jobs: RwLock<HashMap<Uuid, Job>>,
}

impl JobRegistry {
    async fn insert(&self, job: Job) {
        self.jobs.write().await.insert(job.id, job);
    }

    async fn get(&self, id: Uuid) -> Option<Job> {
        self.jobs.read().await.get(&id).cloned()
    }

    async fn list(&self, user_id: Option<&str>) -> Vec<Job> {
        let jobs = self.jobs.read().await;
        let mut out: Vec<Job> = jobs.values().filter(|j| user_id.is_none_or(|u| j.user_id == u)).cloned().collect();
        out.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        out
    }

    /// Applies `mutate` to a non-terminal Job (P2) and returns the updated
    /// snapshot for broadcasting. A terminal Job is left untouched.
    async fn mutate(&self, id: Uuid, mutate: impl FnOnce(&mut Job)) -> Option<Job> {
        let mut jobs = self.jobs.write().await;
        let job = jobs.get_mut(&id)?;
        if job.status.is_terminal() {
            warn!(job_id = %id, "attempted mutation of a terminal job, ignored");
            return Some(job.clone());
        }
        mutate(job);
        job.updated_at = Utc::now();
        Some(job.clone())
    }
}

struct Inner {
    registry: JobRegistry,
    events: broadcast::Sender<JobEvent>,
    approvals: Arc<ApprovalManager>,
    validator: CommandValidator,
    config: OpsentryConfig,
    model_gateway: Arc<dyn ModelGateway>,
    sandbox: SandboxExecutor,
}

impl Inner {
    fn publish(&self, job: Job) {
        let _ = self.events.send(JobEvent { job_id: job.id, job });
    }

    async fn fail(&self, job_id: Uuid, error: JobError) {
        warn!(job_id = %job_id, kind = ?error.kind, "job failed: {}", error.message);
        if let Some(job) = self
            .registry
            .mutate(job_id, |job| {
                job.status = JobStatus::Failed;
                job.error = Some(error.message.clone());
                job.log.push(log_entry(LogLevel::Error, error.message.clone()));
            })
            .await
        {
            self.publish(job);
        }
    }

    /// Execution path from §4.8: select a model, invoke it (-> 30%),
    /// validate every step, run the plan (-> 90%), store the outcome and
    /// transition to a terminal state.
    async fn execute(&self, job_id: Uuid) {
        let Some(job) = self.registry.get(job_id).await else { return };
        if job.status != JobStatus::Approved {
            return;
        }

        if let Some(job) = self
            .registry
            .mutate(job_id, |job| {
                job.status = JobStatus::Executing;
                job.log.push(log_entry(LogLevel::Info, "execution started"));
            })
            .await
        {
            self.publish(job);
        }

        // The model was already chosen at submission time (so the submit
        // response can report it); re-running C4.select here would risk
        // disagreeing with what the caller was told.
        let model_id = job.model_used.clone().unwrap_or_else(|| "cheap-small".to_string());
        let prompt = opsentry_modelgw::build_prompt(&job.command, &job.context);

        let response = match self.model_gateway.invoke(&model_id, &prompt).await {
            Ok(response) => response,
            Err(e) => {
                self.fail(job_id, JobError::new(JobErrorKind::ModelInvocationFailed, e.to_string())).await;
                return;
            },
        };
        let plan = response.plan;

        if let Some(job) = self
            .registry
            .mutate(job_id, |job| {
                job.input_tokens += response.input_tokens;
                job.output_tokens += response.output_tokens;
                job.plan = Some(plan.clone());
                job.progress = 30;
                job.log.push(log_entry(LogLevel::Info, format!("model {model_id} invoked")));
            })
            .await
        {
            self.publish(job);
        }

        for step in &plan.commands {
            let result = self.validator.validate(step);
            if !result.valid {
                self.fail(
                    job_id,
                    JobError::new(JobErrorKind::ValidationRejected, result.reason).with_step(step.command.clone()),
                )
                .await;
                return;
            }
        }

        let cwd = PathBuf::from(&job.context.cwd);
        let execution = self.sandbox.execute(&plan, &cwd).await;

        if let Some(job) = self
            .registry
            .mutate(job_id, |job| {
                job.progress = 90;
                job.log.push(log_entry(LogLevel::Info, "execution finished"));
            })
            .await
        {
            self.publish(job);
        }

        if execution.success {
            if let Some(job) = self
                .registry
                .mutate(job_id, |job| {
                    job.status = JobStatus::Completed;
                    job.progress = 100;
                    job.result = Some(json!({
                        "output": execution.combined_output,
                        "exit_code": execution.exit_code,
                        "elapsed_ms": execution.elapsed_ms,
                        "commands_executed": execution.commands_executed,
                        "files_affected": execution.files_affected,
                    }));
                    job.log.push(log_entry(LogLevel::Info, "job completed"));
                })
                .await
            {
                self.publish(job);
            }
            return;
        }

        let aborted = execution.commands_executed.len() < plan.commands.len();
        let (kind, message) = if execution.exit_code == 124 {
            (JobErrorKind::ExecutionTimeout, "step execution timed out before completing (exit code 124)".to_string())
        } else if aborted {
            (JobErrorKind::DestructiveAborted, "a destructive step failed, remaining plan was aborted".to_string())
        } else if !execution.combined_error.is_empty() {
            (JobErrorKind::StepFailed, execution.combined_error.clone())
        } else {
            (JobErrorKind::StepFailed, "a step in the plan failed".to_string())
        };

        self.fail(job_id, JobError::new(kind, message).with_stderr(execution.combined_error)).await;
    }
}

/// Coordinates every other component across a Job's lifecycle. Cheap to
/// clone: internal state lives behind an `Arc`.
#[derive(Clone)]
pub struct JobEngine {
    inner: Arc<Inner>,
}

impl JobEngine {
    #[must_use]
    pub fn new(
        approvals: Arc<ApprovalManager>,
        validator: CommandValidator,
        config: OpsentryConfig,
        model_gateway: Arc<dyn ModelGateway>,
        sandbox: SandboxExecutor,
    ) -> Self {
        let (events, _rx) = broadcast::channel(256);
        Self {
            inner: Arc::new(Inner {
                registry: JobRegistry::default(),
                events,
                approvals,
                validator,
                config,
                model_gateway,
                sandbox,
            }),
        }
    }

    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<JobEvent> {
        self.inner.events.subscribe()
    }

    pub async fn job(&self, id: Uuid) -> Option<Job> {
        self.inner.registry.get(id).await
    }

    pub async fn list_jobs(&self, user_id: Option<&str>) -> Vec<Job> {
        self.inner.registry.list(user_id).await
    }

    fn dispatch(&self, job_id: Uuid) {
        let inner = Arc::clone(&self.inner);
        tokio::spawn(async move { inner.execute(job_id).await });
    }

    /// Submits a new command (§4.8): allocates the Job, picks a model tier
    /// up front (so the caller sees a cost estimate immediately), decides
    /// whether approval is required, and either dispatches execution right
    /// away or opens a `PendingApproval`.
    pub async fn submit(
        &self,
        user_id: &str,
        command: &str,
        context: ContextSnapshot,
        approval_timeout_override: Option<Duration>,
    ) -> SubmitOutcome {
        let choice = opsentry_router::select(command, &context, &self.inner.config);

        let mut job = Job::new(user_id, command, context.clone());
        job.model_used = Some(choice.name.clone());
        job.cost_usd = choice.estimated_cost;
        job.log.push(log_entry(LogLevel::Info, format!("job created, routed to {}", choice.name)));
        let job_id = job.id;
        self.inner.registry.insert(job.clone()).await;
        self.inner.publish(job);

        let requires_approval = self.inner.approvals.requires_approval(command, &context, user_id);
        let status = if requires_approval {
            let risk = opsentry_risk::assess(command, &context);
            let approval_id =
                self.inner.approvals.request(job_id, user_id, command, risk, Utc::now(), approval_timeout_override).await;
            if let Some(job) = self
                .inner
                .registry
                .mutate(job_id, |job| {
                    job.status = JobStatus::Pending;
                    job.approval_id = Some(approval_id);
                    job.log.push(log_entry(LogLevel::Info, "awaiting approval"));
                })
                .await
            {
                self.inner.publish(job);
            }
            JobStatus::Pending
        } else {
            if let Some(job) = self
                .inner
                .registry
                .mutate(job_id, |job| {
                    job.status = JobStatus::Approved;
                    job.log.push(log_entry(LogLevel::Info, "auto-approved"));
                })
                .await
            {
                self.inner.publish(job);
            }
            self.dispatch(job_id);
            JobStatus::Approved
        };

        SubmitOutcome { job_id, status, requires_approval, estimated_cost: choice.estimated_cost, model_used: choice.name }
    }

    /// Resolves a pending approval and, if it was approved, dispatches
    /// execution. A duplicate response on an already-resolved id fails with
    /// the same `ApprovalNotFound`/expiry error `opsentry-approval` reports.
    pub async fn respond_to_approval(
        &self,
        approval_id: Uuid,
        approved: bool,
        remember: bool,
        note: Option<String>,
    ) -> opsentry_approval::Result<()> {
        let now = Utc::now();
        let Some(snapshot) = self.inner.approvals.status(approval_id, now).await else {
            return Err(opsentry_approval::Error::NotFound(approval_id));
        };
        let decision = if approved { ApprovalDecision::Approved } else { ApprovalDecision::Rejected };
        self.inner.approvals.respond(approval_id, decision, remember, now).await?;

        let job_id = snapshot.job_id;
        let record = ApprovalDecisionRecord { approved_by: snapshot.user_id, decided_at: now, remembered: remember, note };

        if approved {
            if let Some(job) = self
                .inner
                .registry
                .mutate(job_id, |job| {
                    job.status = JobStatus::Approved;
                    job.approval = Some(record.clone());
                    job.log.push(log_entry(LogLevel::Info, "approved"));
                })
                .await
            {
                self.inner.publish(job);
                self.dispatch(job_id);
            }
        } else if let Some(job) = self
            .inner
            .registry
            .mutate(job_id, |job| {
                job.status = JobStatus::Rejected;
                job.approval = Some(record.clone());
                job.log.push(log_entry(LogLevel::Info, "rejected"));
            })
            .await
        {
            self.inner.publish(job);
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::{collections::HashSet, time::Duration};

    use chrono::Utc;
    use opsentry_modelgw::FakeModelGateway;
    use opsentry_preferences::PreferenceStore;

    use super::*;

    fn ctx() -> ContextSnapshot {
        ContextSnapshot::empty("dev", "/tmp", Utc::now())
    }

    fn engine(content: &str, allowed: &[&str], max_execution_time: Duration) -> JobEngine {
        let preferences = PreferenceStore::load(std::env::temp_dir().join(format!("opsentry-engine-test-{}.json", Uuid::new_v4())));
        let approvals = Arc::new(ApprovalManager::new(preferences, true, true).with_timeout(Duration::from_millis(200)));
        let validator = CommandValidator::new(allowed.iter().map(|s| (*s).to_string()).collect::<HashSet<_>>(), HashSet::new());
        let config = OpsentryConfig::default();
        let gateway: Arc<dyn ModelGateway> = Arc::new(FakeModelGateway::new(content));
        let sandbox = SandboxExecutor::new(validator.clone(), max_execution_time);
        JobEngine::new(approvals, validator, config, gateway, sandbox)
    }

    #[tokio::test]
    async fn safe_command_auto_approves_and_completes() {
        let engine = engine("echo hi", &["echo"], Duration::from_secs(5));
        let job_id = engine.submit("dev", "echo hi", ctx(), None).await.job_id;

        for _ in 0..50 {
            let job = engine.job(job_id).await.expect("job exists");
            if job.status.is_terminal() {
                assert_eq!(job.status, JobStatus::Completed);
                assert_eq!(job.progress, 100);
                let output = job.result.as_ref().and_then(|r| r.get("output")).and_then(|v| v.as_str()).unwrap_or_default();
                assert!(output.contains("hi"));
                return;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        panic!("job never reached a terminal state");
    }

    #[tokio::test]
    async fn disallowed_step_fails_validation() {
        let engine = engine("curl http://example.com", &["echo"], Duration::from_secs(5));
        let job_id = engine.submit("dev", "curl http://example.com", ctx(), None).await.job_id;

        for _ in 0..50 {
            let job = engine.job(job_id).await.expect("job exists");
            if job.status.is_terminal() {
                assert_eq!(job.status, JobStatus::Failed);
                assert!(job.error.is_some_and(|e| e.contains("allowlist")));
                return;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        panic!("job never reached a terminal state");
    }

    #[tokio::test]
    async fn execution_timeout_fails_job() {
        let engine = engine("sleep 5", &["sleep"], Duration::from_millis(50));
        let job_id = engine.submit("dev", "sleep 5", ctx(), None).await.job_id;

        for _ in 0..100 {
            let job = engine.job(job_id).await.expect("job exists");
            if job.status.is_terminal() {
                assert_eq!(job.status, JobStatus::Failed);
                assert!(job.error.is_some_and(|e| e.contains("timed out")));
                return;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        panic!("job never reached a terminal state");
    }

    #[tokio::test]
    async fn medium_risk_command_requires_approval_then_times_out() {
        let engine = engine("rm file.txt", &["rm"], Duration::from_secs(5));
        let job_id = engine.submit("dev", "rm file.txt", ctx(), None).await.job_id;

        let job = engine.job(job_id).await.expect("job exists");
        assert_eq!(job.status, JobStatus::Pending);
        let approval_id = job.approval_id.expect("approval id recorded");

        assert!(engine.inner.approvals.list_pending(Some("dev"), Utc::now()).await.iter().any(|p| p.approval_id == approval_id));

        tokio::time::sleep(Duration::from_millis(250)).await;
        let timed_out = engine.inner.approvals.status(approval_id, Utc::now()).await;
        assert_eq!(timed_out.map(|s| s.status), Some(opsentry_approval::ApprovalStatus::Timeout));
        assert!(engine.inner.approvals.status(approval_id, Utc::now()).await.is_none());

        let job = engine.job(job_id).await.expect("job still exists");
        assert_eq!(job.status, JobStatus::Pending);
    }
}
