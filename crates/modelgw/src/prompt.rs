//! Prompt Assembler (C5): builds the model prompt from a command and its
//! context snapshot.

use opsentry_common::types::ContextSnapshot;

/// Environment variables allowed into the prompt; never secrets (§4.5/§6).
const ENV_ALLOWLIST: &[&str] = &["PATH", "HOME", "USER", "SHELL", "LANG", "PWD"];

fn format_map(label: &str, map: &Option<std::collections::HashMap<String, serde_json::Value>>) -> String {
    match map {
        Some(m) if !m.is_empty() => serde_json::to_string_pretty(m).unwrap_or_else(|_| format!("<{label} unavailable>")),
        _ => "(none)".to_string(),
    }
}

fn format_env(context: &ContextSnapshot) -> String {
    let filtered: Vec<String> = ENV_ALLOWLIST
        .iter()
        .filter_map(|key| context.env.get(*key).map(|v| format!("{key}={v}")))
        .collect();
    if filtered.is_empty() {
        "(none)".to_string()
    } else {
        filtered.join("\n")
    }
}

/// Compose a single prompt containing working directory, timestamp, user
/// id, formatted collector summaries, the filtered environment, and the
/// original command — instructing the model to return the JSON schema from
/// §4.5.
#[must_use]
pub fn build_prompt(command: &str, context: &ContextSnapshot) -> String {
    format!(
        "You are opsentry, an assistant that translates natural-language developer \
requests into validated shell operations.

Current System Context:
- Working Directory: {cwd}
- Timestamp: {timestamp}
- User: {user_id}

File System Context:
{files}

Process Context:
{processes}

Git Context:
{git}

Environment Context:
{env}

User Command: {command}

Respond with a single JSON object of exactly this shape:
{{
  \"interpretation\": \"what the user wants to accomplish\",
  \"commands\": [
    {{
      \"type\": \"shell|embedded-scripting|query\",
      \"command\": \"actual command to execute\",
      \"description\": \"what this command does\",
      \"safety_level\": \"safe|moderate|destructive\"
    }}
  ],
  \"explanation\": \"brief explanation of what will happen\",
  \"risks\": [\"any potential risks or side effects\"]
}}

Guidelines:
- Only provide commands that are safe and follow security best practices.
- Never include commands that could harm the system or compromise security.
- For destructive operations, mark safety_level as \"destructive\".
- Prefer relative paths over absolute paths when possible.",
        cwd = context.cwd,
        timestamp = context.captured_at,
        user_id = context.user_id,
        files = format_map("file context", &context.files),
        processes = format_map("process context", &context.processes),
        git = format_map("git context", &context.git),
        env = format_env(context),
        command = command,
    )
}

#[cfg(test)]
mod tests {
    use chrono::Utc;

    use super::*;

    #[test]
    fn includes_command_and_cwd() {
        let ctx = ContextSnapshot::empty("dev", "/home/dev/project", Utc::now());
        let prompt = build_prompt("list the files here", &ctx);
        assert!(prompt.contains("/home/dev/project"));
        assert!(prompt.contains("list the files here"));
    }

    #[test]
    fn filters_environment_to_allowlist() {
        let mut ctx = ContextSnapshot::empty("dev", "/home/dev", Utc::now());
        ctx.env.insert("PATH".to_string(), "/usr/bin".to_string());
        ctx.env.insert("AWS_SECRET_ACCESS_KEY".to_string(), "shhh".to_string());
        let prompt = build_prompt("ls", &ctx);
        assert!(prompt.contains("PATH=/usr/bin"));
        assert!(!prompt.contains("shhh"));
    }
}
