use std::{
    path::Path,
    process::Stdio,
    time::{Duration, Instant},
};

use {
    opsentry_common::types::{Plan, PlannedStep, SafetyLevel, StepKind},
    opsentry_validator::CommandValidator,
    tokio::{io::AsyncReadExt, process::Command},
    tracing::{debug, warn},
};

/// Substrings refused even if the command validator already passed the
/// step — a second, independent gate in front of the subprocess boundary.
/// This is pattern matching, not a sandbox: nothing here claims kernel-level
/// isolation, resource limits, or a restricted filesystem view.
const DOUBLE_GATE_SUBSTRINGS: &[&str] =
    &["rm -rf /", "mkfs", "dd if=/dev/zero", "chmod 777 /", ":(){ :|:& };:"];

/// Result of executing a single [`PlannedStep`].
#[derive(Debug, Clone)]
pub struct StepOutcome {
    pub command: String,
    pub kind: StepKind,
    pub stdout: String,
    pub stderr: String,
    pub exit_code: i32,
    pub timed_out: bool,
}

impl StepOutcome {
    fn failed(step: &PlannedStep, message: impl Into<String>) -> Self {
        Self {
            command: step.command.clone(),
            kind: step.kind,
            stdout: String::new(),
            stderr: message.into(),
            exit_code: 1,
            timed_out: false,
        }
    }
}

/// Outcome of running an entire [`Plan`].
#[derive(Debug, Clone)]
pub struct ExecutionResult {
    pub success: bool,
    pub combined_output: String,
    pub combined_error: String,
    pub exit_code: i32,
    pub elapsed_ms: u64,
    pub commands_executed: Vec<String>,
    pub files_affected: Vec<String>,
}

/// Runs a plan's steps sequentially under a configured deadline.
pub struct SandboxExecutor {
    validator: CommandValidator,
    max_execution_time: Duration,
    interpreter: String,
}

impl SandboxExecutor {
    #[must_use]
    pub fn new(validator: CommandValidator, max_execution_time: Duration) -> Self {
        Self { validator, max_execution_time, interpreter: "python3".to_string() }
    }

    #[must_use]
    pub fn with_interpreter(mut self, interpreter: impl Into<String>) -> Self {
        self.interpreter = interpreter.into();
        self
    }

    /// Executes every step in declared order. A destructive step that fails
    /// aborts the remaining plan; a non-destructive failure is recorded but
    /// the plan continues (§4.6).
    pub async fn execute(&self, plan: &Plan, cwd: &Path) -> ExecutionResult {
        let started = Instant::now();
        let mut outcomes = Vec::new();
        let mut commands_executed = Vec::new();
        let mut files_affected = Vec::new();
        let mut aborted = false;

        for step in &plan.commands {
            if aborted {
                break;
            }

            let outcome = match step.kind {
                StepKind::Shell => self.run_shell_step(step, cwd).await,
                StepKind::EmbeddedScripting => self.run_embedded_step(step, cwd).await,
                StepKind::Query => {
                    StepOutcome::failed(step, "query execution is not supported")
                },
            };

            commands_executed.push(outcome.command.clone());
            if outcome.exit_code == 0 {
                files_affected.extend(detect_affected_files(&outcome.command));
            }
            if outcome.exit_code != 0 && step.safety_level == SafetyLevel::Destructive {
                aborted = true;
            }
            outcomes.push(outcome);
        }

        files_affected.sort();
        files_affected.dedup();

        let success = outcomes.iter().all(|o| o.exit_code == 0);
        let exit_code = outcomes.iter().rev().find(|o| o.exit_code != 0).map_or(0, |o| o.exit_code);
        let combined_output = outcomes.iter().map(|o| o.stdout.trim()).filter(|s| !s.is_empty()).collect::<Vec<_>>().join("\n");
        let combined_error = outcomes.iter().map(|o| o.stderr.trim()).filter(|s| !s.is_empty()).collect::<Vec<_>>().join("\n");

        ExecutionResult {
            success,
            combined_output,
            combined_error,
            exit_code,
            elapsed_ms: started.elapsed().as_millis() as u64,
            commands_executed,
            files_affected,
        }
    }

    async fn run_shell_step(&self, step: &PlannedStep, cwd: &Path) -> StepOutcome {
        let revalidated = self.validator.validate(step);
        if !revalidated.valid {
            return StepOutcome::failed(step, format!("rejected on re-validation: {}", revalidated.reason));
        }

        let lower = step.command.to_lowercase();
        if let Some(hit) = DOUBLE_GATE_SUBSTRINGS.iter().find(|s| lower.contains(**s)) {
            warn!(command = %step.command, pattern = hit, "refused by double-gate hardening");
            return StepOutcome::failed(step, format!("refused: matches hardened deny pattern '{hit}'"));
        }

        let hardened = harden_rm(&step.command);
        self.spawn_with_deadline("sh", &["-c", &hardened], cwd, step).await
    }

    async fn run_embedded_step(&self, step: &PlannedStep, cwd: &Path) -> StepOutcome {
        let revalidated = self.validator.validate(step);
        if !revalidated.valid {
            return StepOutcome::failed(step, format!("rejected on re-validation: {}", revalidated.reason));
        }

        let script = format!(
            "{interp} -c {code} && echo '{{\"ok\":true}}' || echo '{{\"ok\":false}}'",
            interp = self.interpreter,
            code = shell_quote(&step.command),
        );
        self.spawn_with_deadline("sh", &["-c", &script], cwd, step).await
    }

    async fn spawn_with_deadline(&self, program: &str, args: &[&str], cwd: &Path, step: &PlannedStep) -> StepOutcome {
        debug!(command = %step.command, timeout_secs = self.max_execution_time.as_secs(), "executing step");

        let mut cmd = Command::new(program);
        cmd.args(args);
        cmd.current_dir(cwd);
        cmd.stdin(Stdio::null());
        cmd.stdout(Stdio::piped());
        cmd.stderr(Stdio::piped());

        let mut child = match cmd.spawn() {
            Ok(child) => child,
            Err(e) => return StepOutcome::failed(step, format!("failed to start command: {e}")),
        };

        let Some(mut stdout_pipe) = child.stdout.take() else {
            return StepOutcome::failed(step, "missing stdout pipe");
        };
        let Some(mut stderr_pipe) = child.stderr.take() else {
            return StepOutcome::failed(step, "missing stderr pipe");
        };

        let stdout_task = tokio::spawn(async move {
            let mut buf = Vec::new();
            let _ = stdout_pipe.read_to_end(&mut buf).await;
            buf
        });
        let stderr_task = tokio::spawn(async move {
            let mut buf = Vec::new();
            let _ = stderr_pipe.read_to_end(&mut buf).await;
            buf
        });

        let wait_result = tokio::select! {
            status = child.wait() => Some(status),
            () = tokio::time::sleep(self.max_execution_time) => None,
        };

        let (exit_code, timed_out) = match wait_result {
            Some(Ok(status)) => (status.code().unwrap_or(-1), false),
            Some(Err(e)) => {
                warn!(command = %step.command, error = %e, "step wait failed");
                (-1, false)
            },
            None => {
                warn!(command = %step.command, "step exceeded deadline, sending kill");
                let _ = child.kill().await;
                let _ = child.wait().await;
                (124, true)
            },
        };

        let stdout = String::from_utf8_lossy(&stdout_task.await.unwrap_or_default()).trim().to_string();
        let stderr = String::from_utf8_lossy(&stderr_task.await.unwrap_or_default()).trim().to_string();

        StepOutcome { command: step.command.clone(), kind: step.kind, stdout, stderr, exit_code, timed_out }
    }
}

/// `rm` without an interactive flag is rewritten to include one.
fn harden_rm(command: &str) -> String {
    let trimmed = command.trim_start();
    if !trimmed.starts_with("rm ") && trimmed != "rm" {
        return command.to_string();
    }
    if command.contains("-i") {
        return command.to_string();
    }
    command.replacen("rm ", "rm -i ", 1)
}

fn shell_quote(value: &str) -> String {
    format!("'{}'", value.replace('\'', r"'\''"))
}

/// Best-effort file-path extraction for `cp`/`mv`/`rm`/`touch` and output
/// redirection, used to populate `files_affected`. Not a substitute for a
/// real shell-argument parser.
fn detect_affected_files(command: &str) -> Vec<String> {
    let tokens: Vec<&str> = command.split_whitespace().collect();
    let mut affected = Vec::new();

    if let Some(&head) = tokens.first() {
        if matches!(head, "cp" | "mv" | "rm" | "touch") {
            affected.extend(tokens[1..].iter().filter(|t| !t.starts_with('-')).map(|t| (*t).to_string()));
        }
    }

    if let Some(pos) = command.find('>') {
        let rest = command[pos..].trim_start_matches('>').trim();
        if let Some(path) = rest.split_whitespace().next() {
            affected.push(path.to_string());
        }
    }

    affected
}

#[cfg(test)]
mod tests {
    use std::collections::HashSet;

    use opsentry_common::types::Plan;

    use super::*;

    fn validator() -> CommandValidator {
        let allowed: HashSet<String> =
            ["echo", "sleep", "rm", "true", "false"].into_iter().map(String::from).collect();
        CommandValidator::new(allowed, HashSet::new())
    }

    fn plan_with(steps: Vec<PlannedStep>) -> Plan {
        Plan { interpretation: "test".to_string(), commands: steps, explanation: "test".to_string(), risks: Vec::new() }
    }

    #[tokio::test]
    async fn runs_a_safe_step_successfully() {
        let executor = SandboxExecutor::new(validator(), Duration::from_secs(5));
        let plan = plan_with(vec![PlannedStep {
            kind: StepKind::Shell,
            command: "echo hello".to_string(),
            description: "say hello".to_string(),
            safety_level: SafetyLevel::Safe,
        }]);

        let result = executor.execute(&plan, Path::new("/tmp")).await;
        assert!(result.success);
        assert_eq!(result.exit_code, 0);
        assert!(result.combined_output.contains("hello"));
    }

    #[tokio::test]
    async fn expired_deadline_is_recorded_as_124() {
        let executor = SandboxExecutor::new(validator(), Duration::from_millis(100));
        let plan = plan_with(vec![PlannedStep {
            kind: StepKind::Shell,
            command: "sleep 5".to_string(),
            description: "sleep".to_string(),
            safety_level: SafetyLevel::Safe,
        }]);

        let result = executor.execute(&plan, Path::new("/tmp")).await;
        assert!(!result.success);
        assert_eq!(result.exit_code, 124);
    }

    #[tokio::test]
    async fn destructive_failure_aborts_remaining_plan() {
        let executor = SandboxExecutor::new(validator(), Duration::from_secs(5));
        let plan = plan_with(vec![
            PlannedStep {
                kind: StepKind::Shell,
                command: "false".to_string(),
                description: "always fails".to_string(),
                safety_level: SafetyLevel::Destructive,
            },
            PlannedStep {
                kind: StepKind::Shell,
                command: "echo should-not-run".to_string(),
                description: "never reached".to_string(),
                safety_level: SafetyLevel::Safe,
            },
        ]);

        let result = executor.execute(&plan, Path::new("/tmp")).await;
        assert!(!result.success);
        assert_eq!(result.commands_executed.len(), 1);
    }

    #[tokio::test]
    async fn non_destructive_failure_continues_plan() {
        let executor = SandboxExecutor::new(validator(), Duration::from_secs(5));
        let plan = plan_with(vec![
            PlannedStep {
                kind: StepKind::Shell,
                command: "false".to_string(),
                description: "always fails".to_string(),
                safety_level: SafetyLevel::Safe,
            },
            PlannedStep {
                kind: StepKind::Shell,
                command: "echo still-runs".to_string(),
                description: "reached anyway".to_string(),
                safety_level: SafetyLevel::Safe,
            },
        ]);

        let result = executor.execute(&plan, Path::new("/tmp")).await;
        assert_eq!(result.commands_executed.len(), 2);
        assert!(result.combined_output.contains("still-runs"));
    }

    #[tokio::test]
    async fn query_step_is_not_supported() {
        let executor = SandboxExecutor::new(validator(), Duration::from_secs(5));
        let plan = plan_with(vec![PlannedStep {
            kind: StepKind::Query,
            command: "SELECT 1".to_string(),
            description: "query".to_string(),
            safety_level: SafetyLevel::Safe,
        }]);

        let result = executor.execute(&plan, Path::new("/tmp")).await;
        assert!(!result.success);
        assert!(result.combined_error.contains("not supported"));
    }

    #[test]
    fn rm_without_interactive_flag_is_rewritten() {
        assert_eq!(harden_rm("rm file.txt"), "rm -i file.txt");
        assert_eq!(harden_rm("rm -i file.txt"), "rm -i file.txt");
        assert_eq!(harden_rm("echo rm"), "echo rm");
    }

    #[test]
    fn affected_files_detected_for_cp_and_redirect() {
        assert_eq!(detect_affected_files("cp a.txt b.txt"), vec!["a.txt", "b.txt"]);
        assert_eq!(detect_affected_files("echo hi > out.txt"), vec!["out.txt"]);
    }
}
