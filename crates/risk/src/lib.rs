//! Risk Classifier (C1): maps `(command, context)` to a [`RiskReport`].
//!
//! The final score is the **maximum** of four independently computed
//! sub-scores, never a sum, so that a single critical signal dominates.
//! `assess` is synchronous and non-suspending — it is never awaited
//! anywhere in this crate or its callers.

use std::sync::LazyLock;

use {
    opsentry_common::types::ContextSnapshot,
    regex::{Regex, RegexSet},
    serde::{Deserialize, Serialize},
};

/// Ordered risk level, `safe` the lowest, `critical` the highest. The
/// discriminant doubles as the integer score described in §3/§4.1.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RiskLevel {
    Safe = 0,
    Low = 1,
    Medium = 2,
    High = 3,
    Critical = 4,
}

impl RiskLevel {
    #[must_use]
    pub fn score(self) -> u8 {
        self as u8
    }

    fn from_score(score: u8) -> Self {
        match score {
            0 => Self::Safe,
            1 => Self::Low,
            2 => Self::Medium,
            3 => Self::High,
            _ => Self::Critical,
        }
    }
}

/// Which sub-score contributed the overall level, for the `factors` field.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RiskFactors {
    pub base_command: RiskLevel,
    pub patterns: RiskLevel,
    pub context: RiskLevel,
    pub paths: RiskLevel,
}

/// Structured output of the classifier.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RiskReport {
    pub level: RiskLevel,
    pub score: u8,
    pub factors: RiskFactors,
    pub reasons: Vec<String>,
    pub recommendations: Vec<String>,
}

impl RiskReport {
    /// A command is auto-approvable iff the final level is `safe` (§4.1).
    #[must_use]
    pub fn is_auto_approvable(&self) -> bool {
        self.level == RiskLevel::Safe
    }
}

// ── Base command table ──────────────────────────────────────────────────────

const SAFE_TOKENS: &[&str] =
    &["ls", "cat", "grep", "find", "head", "tail", "pwd", "whoami", "date", "uptime", "which", "whereis"];
const LOW_TOKENS: &[&str] = &["mkdir", "touch", "cp", "mv"];
const MEDIUM_TOKENS: &[&str] = &["rm", "rmdir", "chmod", "chown", "pip", "npm"];
const HIGH_TOKENS: &[&str] = &["sudo", "su", "passwd", "systemctl", "service", "iptables", "ufw"];
const CRITICAL_TOKENS: &[&str] = &["dd", "mkfs", "fdisk", "cfdisk", "parted"];

/// Two-token git subcommands that carry their own risk level, checked before
/// falling back to the single-token table.
const GIT_SUBCOMMAND_RISKS: &[(&str, RiskLevel)] = &[
    ("status", RiskLevel::Low),
    ("log", RiskLevel::Low),
    ("show", RiskLevel::Low),
    ("diff", RiskLevel::Low),
    ("add", RiskLevel::Medium),
    ("commit", RiskLevel::Medium),
    ("push", RiskLevel::Medium),
];

/// Critical system paths; read access is medium, destructive access is
/// critical (§4.1 path score).
pub const PROTECTED_PATHS: &[&str] =
    &["/boot", "/sys", "/proc", "/dev", "/etc/passwd", "/etc/shadow", "/etc/sudoers", "/var/log", "/etc/ssh", "/root"];

const DESTRUCTIVE_OPS: &[&str] = &["rm", "mv", "cp", "chmod", "chown"];

/// `(regex, raises-to)` — destruction signatures that force `critical`.
static CRITICAL_PATTERN_DEFS: &[&str] = &[
    r"rm\s+(-\S*[rR]\S*\s+)+/(\s|$)",
    r"rm\s+(-\S*[rR]\S*\s+)+\*",
    r">\s*/dev/sd[a-z]",
    r"chmod\s+777\s+/",
    r"chown\s+\S+\s+/",
    r"curl[^|]*\|\s*sh",
    r"wget[^|]*\|\s*sh",
    r":\(\)\{\s*:\|:&\s*\}",
];

static CRITICAL_PATTERN_SET: LazyLock<RegexSet> = LazyLock::new(|| {
    RegexSet::new(CRITICAL_PATTERN_DEFS).unwrap_or_else(|e| panic!("built-in risk patterns must be valid regex: {e}"))
});

static EVAL_PATTERN: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"eval\s*\$\(").unwrap_or_else(|e| panic!("eval pattern must be valid regex: {e}")));

/// Pure, non-suspending risk assessment (spec §9 open question (b): this is
/// the only signature — it is never wrapped in `async`).
#[must_use]
pub fn assess(command: &str, context: &ContextSnapshot) -> RiskReport {
    let base = assess_base_command(command);
    let pattern = assess_pattern(command);
    let ctx = assess_context(command, context);
    let path = assess_path(command);

    let overall = base.max(pattern).max(ctx).max(path);

    RiskReport {
        level: overall,
        score: overall.score(),
        factors: RiskFactors { base_command: base, patterns: pattern, context: ctx, paths: path },
        reasons: generate_reasons(command, overall),
        recommendations: generate_recommendations(overall),
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

fn assess_base_command(command: &str) -> RiskLevel {
    let trimmed = command.trim();
    if let Some(rest) = trimmed.strip_prefix("sudo ") {
        // A command prefixed with a privilege-elevation verb takes at least
        // `high`, no matter what the wrapped command scores on its own.
        return assess_base_command(rest).max(RiskLevel::High);
    }

    let Some(main) = extract_main_command(command) else {
        return RiskLevel::Low;
    };

    if main == "git" {
        if let Some(sub) = command.split_whitespace().nth(1) {
            if let Some((_, level)) = GIT_SUBCOMMAND_RISKS.iter().find(|(name, _)| *name == sub) {
                return *level;
            }
        }
    }

    if main == "pip" || main == "npm" {
        if command.contains("install") {
            return RiskLevel::Medium;
        }
    }

    if SAFE_TOKENS.contains(&main) {
        RiskLevel::Safe
    } else if LOW_TOKENS.contains(&main) {
        RiskLevel::Low
    } else if MEDIUM_TOKENS.contains(&main) {
        RiskLevel::Medium
    } else if HIGH_TOKENS.contains(&main) {
        RiskLevel::High
    } else if CRITICAL_TOKENS.contains(&main) {
        RiskLevel::Critical
    } else {
        // Unknown tokens default to medium (§4.1).
        RiskLevel::Medium
    }
}

fn assess_pattern(command: &str) -> RiskLevel {
    if CRITICAL_PATTERN_SET.is_match(command) {
        return RiskLevel::Critical;
    }

    let mut level = RiskLevel::Safe;

    if command.contains('|') && ["sh", "bash", "zsh"].iter().any(|s| command.contains(s)) {
        level = level.max(RiskLevel::High);
    }
    if EVAL_PATTERN.is_match(command) {
        level = level.max(RiskLevel::High);
    }

    level
}

fn assess_context(command: &str, context: &ContextSnapshot) -> RiskLevel {
    let mut level = RiskLevel::Safe;

    if PROTECTED_PATHS.iter().take(4).any(|p| context.cwd == *p) || context.cwd == "/etc" {
        level = level.max(RiskLevel::High);
    }

    if context.env.get("USER").map(String::as_str) == Some("root") || context.user_id == "root" {
        level = level.max(RiskLevel::Medium);
    }

    let _ = command;
    level
}

fn assess_path(command: &str) -> RiskLevel {
    let mut level = RiskLevel::Safe;

    for protected in PROTECTED_PATHS {
        if command.contains(protected) {
            if DESTRUCTIVE_OPS.iter().any(|op| command.contains(op)) {
                level = level.max(RiskLevel::Critical);
            } else {
                level = level.max(RiskLevel::Medium);
            }
        }
    }

    level
}

fn generate_reasons(command: &str, overall: RiskLevel) -> Vec<String> {
    let mut reasons = Vec::new();

    reasons.push(
        match overall {
            RiskLevel::Critical => "command could cause irreversible system damage",
            RiskLevel::High => "command requires elevated privileges or system access",
            RiskLevel::Medium => "command modifies files or system state",
            RiskLevel::Low => "command has minor side effects",
            RiskLevel::Safe => "command appears safe for execution",
        }
        .to_string(),
    );

    if command.contains("rm") {
        reasons.push("command deletes files or directories".to_string());
    }
    if command.contains("sudo") {
        reasons.push("command uses elevated privileges".to_string());
    }
    if PROTECTED_PATHS.iter().any(|p| command.contains(p)) {
        reasons.push("command accesses critical system paths".to_string());
    }

    reasons
}

fn generate_recommendations(overall: RiskLevel) -> Vec<String> {
    match overall {
        RiskLevel::Critical => vec![
            "consider alternatives to this command".to_string(),
            "review the command carefully before execution".to_string(),
            "ensure you have system backups".to_string(),
            "consider running in a test environment first".to_string(),
        ],
        RiskLevel::High => vec![
            "review command parameters carefully".to_string(),
            "ensure you have the necessary permissions".to_string(),
            "consider the impact on system stability".to_string(),
        ],
        RiskLevel::Medium => vec![
            "verify target files/directories exist".to_string(),
            "consider backing up affected files".to_string(),
        ],
        RiskLevel::Low => vec!["command should be safe to execute".to_string()],
        RiskLevel::Safe => Vec::new(),
    }
}
