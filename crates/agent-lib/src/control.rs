//! Local control API
//!
//! Process-local JSON API that lets an operator drive the inference
//! subsystem and inspect agent state while keepalives continue unbothered.
//! Binds `0.0.0.0:9999` by default.

use crate::inference::InferenceManager;
use crate::state::{AgentState, InferenceState};
use axum::extract::State;
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::routing::{get, post};
use axum::{Json, Router};
use prometheus::{Encoder, TextEncoder};
use serde::Deserialize;
use serde_json::json;
use std::future::IntoFuture;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tracing::{error, info, warn};

pub const DEFAULT_CONTROL_PORT: u16 = 9999;
const SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

/// Shared state handed to every control handler
#[derive(Clone)]
pub struct ControlState {
    pub state: AgentState,
    pub inference: Arc<InferenceManager>,
}

/// Build the control API router
pub fn router(control: ControlState) -> Router {
    Router::new()
        .route("/inference/start", post(inference_start))
        .route("/inference/stop", post(inference_stop))
        .route("/inference/pull", post(inference_pull))
        .route("/inference/status", get(inference_status))
        .route("/status", get(status))
        .route("/health", get(health))
        .route("/metrics", get(metrics))
        .with_state(Arc::new(control))
}

/// Serve the control API until the shutdown signal fires.
///
/// Open connections get a 5 s grace window on shutdown.
pub async fn serve(
    port: u16,
    control: ControlState,
    mut shutdown: broadcast::Receiver<()>,
) -> anyhow::Result<()> {
    let app = router(control);
    let addr = format!("0.0.0.0:{port}");

    info!(addr = %addr, "Control server starting");
    let listener = tokio::net::TcpListener::bind(&addr).await?;

    let mut grace = shutdown.resubscribe();
    let server = axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            let _ = shutdown.recv().await;
        })
        .into_future();
    tokio::pin!(server);

    tokio::select! {
        result = &mut server => result?,
        // Stop waiting for stragglers once the grace window passes
        _ = async {
            let _ = grace.recv().await;
            tokio::time::sleep(SHUTDOWN_GRACE).await;
        } => {
            warn!("Control server did not stop within grace period");
        }
    }

    info!("Control server stopped");
    Ok(())
}

async fn inference_start(State(control): State<Arc<ControlState>>) -> impl IntoResponse {
    info!("Control: start-inference command received");

    if let Err(e) = control.inference.start().await {
        error!(error = %e, "Failed to start inference");
        return (
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(json!({"status": "error", "error": e.to_string()})),
        );
    }

    let models = control.inference.installed_models().await;
    control
        .state
        .update_inference(
            InferenceState::Running,
            control.inference.advertise_ip(),
            control.inference.port(),
            &models,
        )
        .await;

    (
        StatusCode::OK,
        Json(json!({
            "status": "ok",
            "message": "Inference server started",
            "endpoint": control.inference.endpoint_url(),
        })),
    )
}

async fn inference_stop(State(control): State<Arc<ControlState>>) -> impl IntoResponse {
    info!("Control: stop-inference command received");

    control.inference.stop().await;
    control
        .state
        .update_inference(InferenceState::Stopped, "", 0, &[])
        .await;

    Json(json!({
        "status": "ok",
        "message": "Inference server stopped",
    }))
}

#[derive(Debug, Deserialize)]
struct PullRequest {
    #[serde(default)]
    model: String,
}

#[derive(Debug, Default, Deserialize)]
struct PullProgress {
    #[serde(default)]
    status: String,
    #[serde(default)]
    digest: String,
    #[serde(default)]
    total: u64,
    #[serde(default)]
    completed: u64,
}

async fn inference_pull(
    State(control): State<Arc<ControlState>>,
    body: Result<Json<PullRequest>, axum::extract::rejection::JsonRejection>,
) -> impl IntoResponse {
    let model = match body {
        Ok(Json(req)) if !req.model.is_empty() => req.model,
        Ok(_) => {
            return (
                StatusCode::BAD_REQUEST,
                Json(json!({"status": "error", "error": "Model name required"})),
            );
        }
        Err(_) => {
            return (
                StatusCode::BAD_REQUEST,
                Json(json!({"status": "error", "error": "Invalid request body"})),
            );
        }
    };

    info!(model = %model, "Control: pull model command received");
    control.state.add_log(format!("Pulling model: {model}")).await;

    if let Err(e) = stream_pull_progress(&control, &model).await {
        control.state.add_log(format!("Pull failed: {e}")).await;
        return (
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(json!({"status": "error", "error": e.to_string()})),
        );
    }

    control.state.add_log(format!("Model {model} ready")).await;

    let models = control.inference.installed_models().await;
    control
        .state
        .update_inference(
            InferenceState::Running,
            control.inference.advertise_ip(),
            control.inference.port(),
            &models,
        )
        .await;

    (
        StatusCode::OK,
        Json(json!({
            "status": "ok",
            "message": format!("Model {model} pulled successfully"),
        })),
    )
}

/// Stream NDJSON pull progress from the daemon into the state log ring.
///
/// Consecutive identical (status, percent) lines are collapsed so a tight
/// stream doesn't flood the ring.
async fn stream_pull_progress(control: &ControlState, model: &str) -> anyhow::Result<()> {
    let client = reqwest::Client::new();
    let mut response = client
        .post(format!(
            "http://localhost:{}/api/pull",
            control.inference.port()
        ))
        .json(&json!({"name": model}))
        .send()
        .await?;

    if !response.status().is_success() {
        anyhow::bail!("pull rejected: status {}", response.status().as_u16());
    }

    let mut buffer = String::new();
    let mut last_status = String::new();

    while let Some(chunk) = response.chunk().await? {
        buffer.push_str(&String::from_utf8_lossy(&chunk));

        while let Some(newline) = buffer.find('\n') {
            let line: String = buffer.drain(..=newline).collect();
            let line = line.trim();
            if line.is_empty() {
                continue;
            }

            let progress: PullProgress = match serde_json::from_str(line) {
                Ok(p) => p,
                Err(_) => continue,
            };

            let status = format_pull_status(&progress);
            if status != last_status {
                control.state.add_log(format!("Pull: {status}")).await;
                last_status = status;
            }
        }
    }

    Ok(())
}

fn format_pull_status(progress: &PullProgress) -> String {
    if !progress.digest.is_empty() && progress.total > 0 {
        let pct = progress.completed as f64 / progress.total as f64 * 100.0;
        format!("{} {:.0}%", progress.status, pct)
    } else {
        progress.status.clone()
    }
}

async fn inference_status(State(control): State<Arc<ControlState>>) -> impl IntoResponse {
    let running = control.inference.is_running().await;

    let (status, endpoint) = if running {
        ("running", control.inference.endpoint_url())
    } else {
        ("stopped", String::new())
    };

    Json(json!({
        "status": status,
        "running": running,
        "endpoint": endpoint,
        "models": control.inference.installed_models().await,
    }))
}

async fn status(State(control): State<Arc<ControlState>>) -> impl IntoResponse {
    let snapshot = control.state.snapshot().await;

    Json(json!({
        "machine_id": snapshot.machine_id,
        "pool": snapshot.pool_name,
        "status": snapshot.status,
        "uptime_seconds": snapshot.uptime().as_secs(),
        "inference_status": snapshot.inference_status,
        "inference_port": snapshot.inference_port,
        "running_jobs": snapshot.running_jobs,
        "total_jobs": snapshot.total_jobs,
        "cpu_percent": snapshot.cpu_percent,
        "memory_percent": snapshot.memory_percent,
        "gpu_count": snapshot.gpu_count,
    }))
}

async fn health() -> impl IntoResponse {
    Json(json!({"status": "ok"}))
}

async fn metrics() -> impl IntoResponse {
    let encoder = TextEncoder::new();
    let metric_families = prometheus::gather();
    let mut buffer = Vec::new();

    if let Err(e) = encoder.encode(&metric_families, &mut buffer) {
        warn!(error = %e, "Failed to encode metrics");
    }

    (
        StatusCode::OK,
        [("content-type", "text/plain; charset=utf-8")],
        buffer,
    )
}
