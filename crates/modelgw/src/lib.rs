//! Prompt Assembler (C5) & Model Gateway (C6).

pub mod error;
pub mod prompt;

use std::time::Instant;

use {
    async_trait::async_trait,
    opsentry_common::types::{Plan, PlannedStep, SafetyLevel, StepKind},
    serde::Deserialize,
    tracing::warn,
};

pub use {
    error::{Error, Result},
    prompt::build_prompt,
};

/// Wall-clock latency and token usage recorded alongside the parsed [`Plan`].
#[derive(Debug, Clone)]
pub struct ModelResponse {
    pub plan: Plan,
    pub input_tokens: u64,
    pub output_tokens: u64,
    pub latency_ms: u64,
}

/// Invokes a remote model and returns its raw text content plus usage.
/// A trait so a real HTTP-backed implementation and an in-memory test
/// double can share call sites.
#[async_trait]
pub trait ModelGateway: Send + Sync {
    async fn invoke(&self, model_id: &str, prompt: &str) -> Result<ModelResponse>;
}

/// Production gateway: one vendor-agnostic JSON envelope posted to the
/// configured endpoint for the model.
pub struct HttpModelGateway {
    client: reqwest::Client,
    base_url: String,
}

impl HttpModelGateway {
    #[must_use]
    pub fn new(base_url: impl Into<String>) -> Self {
        Self { client: reqwest::Client::new(), base_url: base_url.into() }
    }
}

#[derive(serde::Serialize)]
struct InvokeRequest<'a> {
    model: &'a str,
    prompt: &'a str,
}

#[derive(Deserialize)]
struct InvokeResponseBody {
    content: String,
    #[serde(default)]
    input_tokens: u64,
    #[serde(default)]
    output_tokens: u64,
}

#[async_trait]
impl ModelGateway for HttpModelGateway {
    async fn invoke(&self, model_id: &str, prompt: &str) -> Result<ModelResponse> {
        let started = Instant::now();

        let response = self
            .client
            .post(format!("{}/v1/models/{model_id}/invoke", self.base_url))
            .json(&InvokeRequest { model: model_id, prompt })
            .send()
            .await
            .map_err(|e| Error::InvocationFailed(e.to_string()))?;

        let body: InvokeResponseBody =
            response.json().await.map_err(|e| Error::InvocationFailed(e.to_string()))?;

        let plan = parse_model_response(&body.content);

        Ok(ModelResponse {
            plan,
            input_tokens: body.input_tokens,
            output_tokens: body.output_tokens,
            latency_ms: started.elapsed().as_millis() as u64,
        })
    }
}

/// Degrade gracefully through three parse strategies (§4.5):
/// 1. strict JSON matching the `Plan` schema;
/// 2. a line scanner recognizing `Commands:`/`Interpretation:`/
///    `Explanation:` sections and fenced code blocks;
/// 3. wrap the entire response as a single safe shell step.
#[must_use]
pub fn parse_model_response(text: &str) -> Plan {
    let trimmed = text.trim();

    if trimmed.starts_with('{') {
        if let Ok(plan) = serde_json::from_str::<Plan>(trimmed) {
            return plan;
        }
    }

    if let Some(plan) = parse_structured_text(trimmed) {
        return plan;
    }

    warn!("model response parse degraded to single-shell-step fallback");
    Plan {
        interpretation: "execute user command".to_string(),
        commands: vec![PlannedStep {
            kind: StepKind::Shell,
            command: trimmed.to_string(),
            description: "execute user command".to_string(),
            safety_level: SafetyLevel::Safe,
        }],
        explanation: "executing user command as interpreted".to_string(),
        risks: Vec::new(),
    }
}

fn parse_structured_text(text: &str) -> Option<Plan> {
    #[derive(PartialEq)]
    enum Section {
        None,
        Commands,
        Interpretation,
        Explanation,
    }

    let mut section = Section::None;
    let mut commands = Vec::new();
    let mut interpretation = String::new();
    let mut explanation = String::new();
    let mut saw_section_marker = false;

    for raw_line in text.lines() {
        let line = raw_line.trim();
        if line.is_empty() {
            continue;
        }

        if line.starts_with("Commands:") || line.starts_with("```bash") || line.starts_with("```sh") {
            section = Section::Commands;
            saw_section_marker = true;
            continue;
        }
        if let Some(rest) = line.strip_prefix("Interpretation:") {
            section = Section::Interpretation;
            saw_section_marker = true;
            interpretation = rest.trim().to_string();
            continue;
        }
        if let Some(rest) = line.strip_prefix("Explanation:") {
            section = Section::Explanation;
            saw_section_marker = true;
            explanation = rest.trim().to_string();
            continue;
        }
        if line.starts_with("```") {
            section = Section::None;
            continue;
        }

        match section {
            Section::Commands => {
                let cmd = line.strip_prefix('$').or_else(|| line.strip_prefix('#')).unwrap_or(line).trim();
                if !cmd.is_empty() {
                    commands.push(PlannedStep {
                        kind: StepKind::Shell,
                        command: cmd.to_string(),
                        description: format!("execute: {cmd}"),
                        safety_level: SafetyLevel::Safe,
                    });
                }
            },
            Section::Interpretation => {
                interpretation.push(' ');
                interpretation.push_str(line);
            },
            Section::Explanation => {
                explanation.push(' ');
                explanation.push_str(line);
            },
            Section::None => {},
        }
    }

    if !saw_section_marker || commands.is_empty() {
        return None;
    }

    Some(Plan {
        interpretation: if interpretation.is_empty() { "execute the requested command".to_string() } else { interpretation },
        commands,
        explanation: if explanation.is_empty() { "command will be executed as requested".to_string() } else { explanation },
        risks: Vec::new(),
    })
}

/// An in-memory gateway for tests: returns a canned body for every call.
pub struct FakeModelGateway {
    pub content: String,
}

impl FakeModelGateway {
    #[must_use]
    pub fn new(content: impl Into<String>) -> Self {
        Self { content: content.into() }
    }
}

#[async_trait]
impl ModelGateway for FakeModelGateway {
    async fn invoke(&self, _model_id: &str, _prompt: &str) -> Result<ModelResponse> {
        Ok(ModelResponse { plan: parse_model_response(&self.content), input_tokens: 0, output_tokens: 0, latency_ms: 0 })
    }
}
