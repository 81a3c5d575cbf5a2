//! Configuration schema: every option recognized by the daemon (§6).
use std::collections::{HashMap, HashSet};

use serde::{Deserialize, Serialize};

/// One entry in the model registry: `name -> {endpoint id, max tokens, $/1k tokens}`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelEntry {
    pub endpoint_id: String,
    pub max_tokens: u32,
    pub rate_per_1k_tokens: f64,
}

/// Root configuration record. Every key named in §6 has a field here with
/// the spec's stated default, so no component falls back to an ad hoc
/// dynamic dict.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct OpsentryConfig {
    pub api_host: String,
    pub api_port: u16,
    pub model_registry: HashMap<String, ModelEntry>,
    pub default_model: Option<String>,
    pub auto_approve_safe: bool,
    pub approval_timeout: u64,
    pub learn_preferences: bool,
    pub sandbox_enabled: bool,
    pub max_execution_time: u64,
    pub allowed_commands: HashSet<String>,
    pub blocked_commands: HashSet<String>,
    pub watch_paths: Vec<String>,
    pub process_update_interval: u64,
    pub git_repo_paths: Vec<String>,
    pub log_level: String,
    pub log_file: Option<String>,
}

impl Default for OpsentryConfig {
    fn default() -> Self {
        let mut model_registry = HashMap::new();
        model_registry.insert(
            "cheap-small".to_string(),
            ModelEntry { endpoint_id: "cheap-small".into(), max_tokens: 4_096, rate_per_1k_tokens: 0.001 },
        );
        model_registry.insert(
            "balanced".to_string(),
            ModelEntry { endpoint_id: "balanced".into(), max_tokens: 32_000, rate_per_1k_tokens: 0.01 },
        );
        model_registry.insert(
            "strongest".to_string(),
            ModelEntry { endpoint_id: "strongest".into(), max_tokens: 200_000, rate_per_1k_tokens: 0.03 },
        );

        Self {
            api_host: "127.0.0.1".into(),
            api_port: 8787,
            model_registry,
            default_model: None,
            auto_approve_safe: true,
            approval_timeout: 300,
            learn_preferences: true,
            sandbox_enabled: true,
            max_execution_time: 120,
            allowed_commands: default_allowed_commands(),
            blocked_commands: HashSet::new(),
            watch_paths: Vec::new(),
            process_update_interval: 5,
            git_repo_paths: Vec::new(),
            log_level: "info".into(),
            log_file: None,
        }
    }
}

fn default_allowed_commands() -> HashSet<String> {
    [
        "ls", "cp", "mv", "mkdir", "rmdir", "touch", "cat", "grep", "find", "git", "npm", "pip",
        "python", "python3", "node", "docker", "kubectl", "helm", "terraform", "aws",
    ]
    .into_iter()
    .map(String::from)
    .collect()
}
