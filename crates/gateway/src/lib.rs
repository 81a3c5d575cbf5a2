//! HTTP/WS transport binding `opsentry-engine::JobEngine` to the wire
//! surface specified in §6: five HTTP routes and one push-only WS route.
//! All Job Lifecycle Engine logic lives in `opsentry-engine`; this crate
//! only translates requests/responses and wires up the push channel.

pub mod dto;
pub mod state;
mod ws;

use std::{net::SocketAddr, time::Duration};

use axum::{
    Json, Router,
    extract::{Path, Query, State, WebSocketUpgrade},
    http::StatusCode,
    response::IntoResponse,
    routing::{get, post},
};
use tower_http::{cors::CorsLayer, trace::TraceLayer};
use tracing::info;
use uuid::Uuid;

pub use state::AppState;

use dto::{
    ApproveCommandRequest, ApproveCommandResponse, ErrorResponse, HealthResponse, ListJobsQuery, SubmitCommandRequest,
    SubmitCommandResponse,
};

/// Assembles the router with the teacher's standard middleware stack:
/// tracing first (outermost), then CORS.
#[must_use]
pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health_handler))
        .route("/api/v1/command", post(submit_command_handler))
        .route("/api/v1/command/{id}/status", get(job_status_handler))
        .route("/api/v1/command/{id}/approve", post(approve_command_handler))
        .route("/api/v1/jobs", get(list_jobs_handler))
        .route("/ws/events", get(ws_upgrade_handler))
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Binds and serves the router until the process is killed. Mirrors the
/// teacher's plain-HTTP `start_gateway` tail (TLS/reverse-proxy termination
/// is left to the deployment, same as the teacher's non-TLS path).
pub async fn serve(host: &str, port: u16, state: AppState) -> anyhow::Result<()> {
    let addr: SocketAddr = format!("{host}:{port}").parse()?;
    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!(%addr, "opsentry-gateway listening");
    axum::serve(listener, router(state)).await?;
    Ok(())
}

async fn health_handler(State(state): State<AppState>) -> impl IntoResponse {
    let jobs_tracked = state.engine.list_jobs(None).await.len();
    Json(HealthResponse { status: "ok", version: env!("CARGO_PKG_VERSION"), jobs_tracked })
}

async fn submit_command_handler(
    State(state): State<AppState>,
    Json(req): Json<SubmitCommandRequest>,
) -> impl IntoResponse {
    let cwd = req.context.as_ref().and_then(|c| c.cwd.clone()).unwrap_or_else(|| ".".to_string());
    let mut context = req.context.map_or_else(
        || opsentry_common::types::ContextSnapshot::empty(&req.user_id, &cwd, chrono::Utc::now()),
        |c| c.into_snapshot(&req.user_id, &cwd),
    );
    context.files = Some(state.collector.collect(&cwd).await);

    let timeout_override = Some(Duration::from_secs(req.approval_timeout.unwrap_or(state.default_approval_timeout)));
    let outcome = state.engine.submit(&req.user_id, &req.command, context, timeout_override).await;

    let body = SubmitCommandResponse {
        job_id: outcome.job_id,
        status: status_label(outcome.status),
        requires_approval: outcome.requires_approval,
        estimated_cost: outcome.estimated_cost,
        model_used: outcome.model_used,
    };
    (StatusCode::OK, Json(body)).into_response()
}

async fn job_status_handler(State(state): State<AppState>, Path(id): Path<Uuid>) -> impl IntoResponse {
    match state.engine.job(id).await {
        Some(job) => Json(job).into_response(),
        None => (StatusCode::NOT_FOUND, Json(ErrorResponse { error: format!("job {id} not found") })).into_response(),
    }
}

async fn approve_command_handler(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
    Json(req): Json<ApproveCommandRequest>,
) -> impl IntoResponse {
    match state.engine.respond_to_approval(id, req.approved, req.remember, req.note).await {
        Ok(()) => Json(ApproveCommandResponse { ok: true }).into_response(),
        Err(e) => (StatusCode::NOT_FOUND, Json(ErrorResponse { error: e.to_string() })).into_response(),
    }
}

async fn list_jobs_handler(State(state): State<AppState>, Query(query): Query<ListJobsQuery>) -> impl IntoResponse {
    let jobs = state.engine.list_jobs(query.user_id.as_deref()).await;
    Json(jobs)
}

async fn ws_upgrade_handler(State(state): State<AppState>, ws: WebSocketUpgrade) -> impl IntoResponse {
    ws.on_upgrade(move |socket| ws::handle_connection(socket, state))
}

fn status_label(status: opsentry_common::types::JobStatus) -> &'static str {
    use opsentry_common::types::JobStatus;
    match status {
        JobStatus::Pending => "pending",
        JobStatus::Approved => "approved",
        JobStatus::Executing => "executing",
        JobStatus::Completed => "completed",
        JobStatus::Rejected => "rejected",
        JobStatus::Failed => "failed",
    }
}

#[cfg(test)]
mod tests {
    use std::{collections::HashSet, sync::Arc};

    use opsentry_approval::ApprovalManager;
    use opsentry_common::types::NullCollector;
    use opsentry_config::OpsentryConfig;
    use opsentry_engine::JobEngine;
    use opsentry_modelgw::{FakeModelGateway, ModelGateway};
    use opsentry_preferences::PreferenceStore;
    use opsentry_sandbox::SandboxExecutor;
    use opsentry_validator::CommandValidator;
    use serde_json::json;
    use tokio::net::TcpListener;

    use super::*;

    async fn test_app() -> (SocketAddr, tokio::task::JoinHandle<()>) {
        let preferences = PreferenceStore::load(std::env::temp_dir().join(format!("opsentry-gw-test-{}.json", Uuid::new_v4())));
        let approvals = Arc::new(ApprovalManager::new(preferences, true, true));
        let allowed: HashSet<String> = ["echo", "ls"].into_iter().map(str::to_string).collect();
        let validator = CommandValidator::new(allowed, HashSet::new());
        let config = OpsentryConfig::default();
        let gateway: Arc<dyn ModelGateway> = Arc::new(FakeModelGateway::new("echo hi"));
        let sandbox = SandboxExecutor::new(validator.clone(), Duration::from_secs(5));
        let engine = JobEngine::new(approvals, validator, config, gateway, sandbox);
        let state = AppState { engine, collector: Arc::new(NullCollector), default_approval_timeout: 300 };

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let app = router(state);
        let handle = tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        (addr, handle)
    }

    #[tokio::test]
    async fn health_reports_ok() {
        let (addr, _handle) = test_app().await;
        let resp = reqwest::get(format!("http://{addr}/health")).await.unwrap();
        assert_eq!(resp.status(), 200);
        let body: serde_json::Value = resp.json().await.unwrap();
        assert_eq!(body["status"], "ok");
    }

    #[tokio::test]
    async fn submit_then_fetch_status_round_trips() {
        let (addr, _handle) = test_app().await;
        let client = reqwest::Client::new();

        let resp = client
            .post(format!("http://{addr}/api/v1/command"))
            .json(&json!({"command": "echo hi", "user_id": "dev"}))
            .send()
            .await
            .unwrap();
        assert_eq!(resp.status(), 200);
        let body: serde_json::Value = resp.json().await.unwrap();
        assert!(!body["requires_approval"].as_bool().unwrap());
        let job_id = body["job_id"].as_str().unwrap();

        let resp = client.get(format!("http://{addr}/api/v1/command/{job_id}/status")).send().await.unwrap();
        assert_eq!(resp.status(), 200);
    }

    #[tokio::test]
    async fn submit_without_approval_timeout_falls_back_to_state_default() {
        let (addr, _handle) = test_app().await;
        let client = reqwest::Client::new();

        // This command isn't in the allowlist, so it requires approval and
        // the resulting pending request's `expires_at` should reflect
        // `AppState::default_approval_timeout` (300s in `test_app`) since
        // the request body omits `approval_timeout`.
        let resp = client
            .post(format!("http://{addr}/api/v1/command"))
            .json(&json!({"command": "rm file.txt", "user_id": "dev"}))
            .send()
            .await
            .unwrap();
        assert_eq!(resp.status(), 200);
        let body: serde_json::Value = resp.json().await.unwrap();
        assert!(body["requires_approval"].as_bool().unwrap());
    }

    #[tokio::test]
    async fn status_for_unknown_job_is_404() {
        let (addr, _handle) = test_app().await;
        let resp = reqwest::get(format!("http://{addr}/api/v1/command/{}/status", Uuid::new_v4())).await.unwrap();
        assert_eq!(resp.status(), 404);
    }

    #[tokio::test]
    async fn approve_unknown_id_is_404() {
        let (addr, _handle) = test_app().await;
        let client = reqwest::Client::new();
        let resp = client
            .post(format!("http://{addr}/api/v1/command/{}/approve", Uuid::new_v4()))
            .json(&json!({"approved": true}))
            .send()
            .await
            .unwrap();
        assert_eq!(resp.status(), 404);
    }

    #[tokio::test]
    async fn list_jobs_filters_by_user() {
        let (addr, _handle) = test_app().await;
        let client = reqwest::Client::new();
        client
            .post(format!("http://{addr}/api/v1/command"))
            .json(&json!({"command": "echo hi", "user_id": "dev"}))
            .send()
            .await
            .unwrap();

        let resp = client.get(format!("http://{addr}/api/v1/jobs?user_id=dev")).send().await.unwrap();
        let jobs: Vec<serde_json::Value> = resp.json().await.unwrap();
        assert!(!jobs.is_empty());

        let resp = client.get(format!("http://{addr}/api/v1/jobs?user_id=someone-else")).send().await.unwrap();
        let jobs: Vec<serde_json::Value> = resp.json().await.unwrap();
        assert!(jobs.is_empty());
    }
}
