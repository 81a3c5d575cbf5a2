//! Model Router (C4): scores command complexity, picks a model tier, and
//! estimates cost.

pub mod error;

pub use error::{Error, Result};
use {
    opsentry_common::types::ContextSnapshot,
    opsentry_config::{ModelEntry, OpsentryConfig},
};

/// Signals and their weights, summed to get the complexity score (§4.4).
const FILE_OP_KEYWORDS: &[&str] = &["list", "copy", "move", "delete", "organize", "find"];
const GIT_OP_KEYWORDS: &[&str] = &["git", "commit", "branch", "merge", "push", "pull"];
const PROCESS_KEYWORDS: &[&str] = &["process", "kill", "start", "stop", "monitor"];
const CODE_ANALYSIS_KEYWORDS: &[&str] = &["analyze", "refactor", "debug", "test", "review"];
const MULTI_STEP_KEYWORDS: &[&str] = &["and", "then", "after", "setup", "configure", "deploy"];

const LARGE_CONTEXT_BYTES: usize = 10 * 1024;

/// `name`, `complexity_score`, `estimated_cost` for the model a command is
/// routed to.
#[derive(Debug, Clone)]
pub struct ModelChoice {
    pub name: String,
    pub complexity_score: u32,
    pub estimated_cost: f64,
}

/// Sum weighted signals found in the lowered command (§4.4).
#[must_use]
pub fn analyze_complexity(command: &str, context: &ContextSnapshot) -> u32 {
    let lower = command.to_lowercase();
    let mut score = 0;

    if FILE_OP_KEYWORDS.iter().any(|k| lower.contains(k)) {
        score += 1;
    }
    if GIT_OP_KEYWORDS.iter().any(|k| lower.contains(k)) {
        score += 2;
    }
    if PROCESS_KEYWORDS.iter().any(|k| lower.contains(k)) {
        score += 3;
    }
    if CODE_ANALYSIS_KEYWORDS.iter().any(|k| lower.contains(k)) {
        score += 4;
    }
    if MULTI_STEP_KEYWORDS.iter().any(|k| lower.contains(k)) {
        score += 6;
    }
    if context.approx_byte_len() > LARGE_CONTEXT_BYTES {
        score += 2;
    }

    score
}

fn tier_for_score(score: u32) -> &'static str {
    if score < 3 {
        "cheap-small"
    } else if score < 7 {
        "balanced"
    } else {
        "strongest"
    }
}

fn estimate_cost(entry: &ModelEntry, prompt_len: usize) -> f64 {
    ((prompt_len + 500) as f64 / 1000.0) * entry.rate_per_1k_tokens
}

/// `select(command, context) -> ModelChoice`. A configured default model
/// overrides the tier pick only if it exists in the registry.
#[must_use]
pub fn select(command: &str, context: &ContextSnapshot, config: &OpsentryConfig) -> ModelChoice {
    let complexity_score = analyze_complexity(command, context);
    let mut model_name = tier_for_score(complexity_score).to_string();

    if let Some(default_model) = &config.default_model {
        if config.model_registry.contains_key(default_model) {
            model_name = default_model.clone();
        }
    }

    let estimated_cost = config.model_registry.get(&model_name).map_or(0.0, |entry| estimate_cost(entry, command.len()));

    ModelChoice { name: model_name, complexity_score, estimated_cost }
}

#[cfg(test)]
mod tests {
    use chrono::Utc;

    use super::*;

    fn ctx() -> ContextSnapshot {
        ContextSnapshot::empty("dev", "/home/dev", Utc::now())
    }

    #[test]
    fn simple_command_picks_cheap_tier() {
        let config = OpsentryConfig::default();
        let choice = select("list files", &ctx(), &config);
        assert_eq!(choice.name, "cheap-small");
        assert_eq!(choice.complexity_score, 1);
    }

    #[test]
    fn multi_step_pushes_to_strongest() {
        let config = OpsentryConfig::default();
        let choice = select("analyze the repo and then refactor it", &ctx(), &config);
        assert_eq!(choice.name, "strongest");
        assert!(choice.complexity_score >= 7);
    }

    #[test]
    fn git_operation_picks_cheap_tier() {
        let config = OpsentryConfig::default();
        let choice = select("git commit the changes", &ctx(), &config);
        assert_eq!(choice.complexity_score, 2);
        assert_eq!(choice.name, "cheap-small");
    }

    #[test]
    fn configured_default_overrides_tier_pick() {
        let mut config = OpsentryConfig::default();
        config.default_model = Some("strongest".to_string());
        let choice = select("list files", &ctx(), &config);
        assert_eq!(choice.name, "strongest");
    }

    #[test]
    fn unknown_default_model_is_ignored() {
        let mut config = OpsentryConfig::default();
        config.default_model = Some("nonexistent".to_string());
        let choice = select("list files", &ctx(), &config);
        assert_eq!(choice.name, "cheap-small");
    }
}
