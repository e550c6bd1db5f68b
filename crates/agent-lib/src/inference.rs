//! Inference daemon supervisor
//!
//! Owns a co-located ollama daemon: detects an already-running external
//! instance, otherwise spawns one (macOS only, where the accelerator is
//! supported), health-checks it, and brokers model loads and inference
//! requests over its HTTP API. Start is best-effort; a missing daemon
//! disables inference without blocking agent startup.

use crate::errors::InferenceError;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

pub const DEFAULT_INFERENCE_PORT: u16 = 11434;
const START_TIMEOUT: Duration = Duration::from_secs(30);
const HEALTH_CHECK_INTERVAL: Duration = Duration::from_secs(2);
/// Model loads can take minutes; the request client must outlast them
const REQUEST_TIMEOUT: Duration = Duration::from_secs(300);
const PROBE_TIMEOUT: Duration = Duration::from_secs(3);

/// Model loading status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LoadState {
    /// Not loaded, available to pull
    Idle,
    /// Currently loading weights
    Loading,
    /// Resident, ready to serve
    Ready,
    /// Failed to load
    Error,
}

/// Per-model status tracked by the supervisor
#[derive(Debug, Clone, Serialize)]
pub struct ModelState {
    pub name: String,
    pub load_state: LoadState,
    pub size_gb: f64,
    pub last_used: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub error: String,
}

impl ModelState {
    fn idle(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            load_state: LoadState::Idle,
            size_gb: 0.0,
            last_used: None,
            error: String::new(),
        }
    }
}

/// An inference request brokered to the daemon
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct InferenceJob {
    #[serde(default)]
    pub id: String,
    pub model: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub messages: Vec<ChatMessage>,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub input: String,
    #[serde(default)]
    pub options: InferenceOptions,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: String,
    pub content: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct InferenceOptions {
    #[serde(default)]
    pub temperature: f64,
    #[serde(default)]
    pub max_tokens: u32,
    #[serde(default)]
    pub stream: bool,
}

/// Inference response
#[derive(Debug, Clone, Serialize)]
pub struct InferenceResult {
    pub id: String,
    pub model: String,
    pub content: String,
}

#[derive(Debug, Default, Deserialize)]
struct DaemonResponse {
    #[serde(default)]
    message: DaemonMessage,
    #[serde(default)]
    response: String,
}

#[derive(Debug, Default, Deserialize)]
struct DaemonMessage {
    #[serde(default)]
    content: String,
}

#[derive(Debug, Default, Deserialize)]
struct TagsResponse {
    #[serde(default)]
    models: Vec<TagEntry>,
}

#[derive(Debug, Default, Deserialize)]
struct TagEntry {
    #[serde(default)]
    name: String,
}

/// Supervises the local inference daemon and its model states
pub struct InferenceManager {
    port: u16,
    advertise_ip: String,
    client: reqwest::Client,
    probe: reqwest::Client,
    models: Mutex<HashMap<String, ModelState>>,
    child: Mutex<Option<Child>>,
    started: AtomicBool,
    external: AtomicBool,
}

impl InferenceManager {
    pub fn new(advertise_ip: impl Into<String>, port: u16) -> Self {
        let port = if port == 0 { DEFAULT_INFERENCE_PORT } else { port };

        Self {
            port,
            advertise_ip: advertise_ip.into(),
            client: reqwest::Client::builder()
                .timeout(REQUEST_TIMEOUT)
                .build()
                .expect("failed to build inference HTTP client"),
            probe: reqwest::Client::builder()
                .timeout(PROBE_TIMEOUT)
                .build()
                .expect("failed to build inference probe client"),
            models: Mutex::new(HashMap::new()),
            child: Mutex::new(None),
            started: AtomicBool::new(false),
            external: AtomicBool::new(false),
        }
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    /// Address the daemon is advertised at (mesh IP or hostname)
    pub fn advertise_ip(&self) -> &str {
        &self.advertise_ip
    }

    /// Public endpoint URL for the daemon
    pub fn endpoint_url(&self) -> String {
        format!("http://{}:{}", self.advertise_ip, self.port)
    }

    fn base_url(&self) -> String {
        format!("http://localhost:{}", self.port)
    }

    /// Start the daemon or attach to an already-running one.
    ///
    /// Best-effort: a missing binary or unsupported platform leaves
    /// inference disabled and returns Ok.
    pub async fn start(&self) -> Result<(), InferenceError> {
        if self.daemon_reachable().await {
            info!(port = self.port, "Inference daemon already running, using external instance");
            self.external.store(true, Ordering::SeqCst);
            self.started.store(true, Ordering::SeqCst);
            return Ok(());
        }

        // Autospawn is limited to macOS, where the local accelerator is
        // supported; Linux hosts run their own serving stack.
        if !cfg!(target_os = "macos") {
            info!("Not on macOS, skipping inference daemon startup");
            return Ok(());
        }

        let mut cmd = Command::new("ollama");
        cmd.arg("serve")
            .env("OLLAMA_HOST", format!("0.0.0.0:{}", self.port))
            .env("OLLAMA_KEEP_ALIVE", "24h")
            .stdout(std::process::Stdio::piped())
            .stderr(std::process::Stdio::piped())
            .kill_on_drop(true);

        let mut child = match cmd.spawn() {
            Ok(child) => child,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                warn!("Inference daemon binary not found in PATH, inference disabled");
                return Ok(());
            }
            Err(e) => {
                return Err(InferenceError::Unavailable(format!(
                    "failed to start inference daemon: {e}"
                )));
            }
        };

        info!(port = self.port, "Starting inference daemon");

        if let Some(stdout) = child.stdout.take() {
            tokio::spawn(forward_daemon_output(stdout));
        }
        if let Some(stderr) = child.stderr.take() {
            tokio::spawn(forward_daemon_output(stderr));
        }

        *self.child.lock().await = Some(child);

        if let Err(e) = self.wait_for_ready().await {
            self.stop().await;
            return Err(e);
        }

        self.started.store(true, Ordering::SeqCst);
        info!(port = self.port, ip = %self.advertise_ip, "Inference daemon started");
        Ok(())
    }

    async fn wait_for_ready(&self) -> Result<(), InferenceError> {
        let deadline = tokio::time::Instant::now() + START_TIMEOUT;
        let mut ticker = tokio::time::interval(HEALTH_CHECK_INTERVAL);
        ticker.tick().await;

        loop {
            ticker.tick().await;
            if self.daemon_reachable().await {
                return Ok(());
            }
            if tokio::time::Instant::now() >= deadline {
                return Err(InferenceError::Unavailable(
                    "timeout waiting for inference daemon to start".to_string(),
                ));
            }
        }
    }

    async fn daemon_reachable(&self) -> bool {
        match self.probe.get(format!("{}/api/tags", self.base_url())).send().await {
            Ok(resp) => resp.status().is_success(),
            Err(_) => false,
        }
    }

    /// Whether the daemon is started and currently responding
    pub async fn is_running(&self) -> bool {
        self.started.load(Ordering::SeqCst) && self.daemon_reachable().await
    }

    /// Stop the daemon if we own it. External instances are left alone.
    pub async fn stop(&self) {
        let mut guard = self.child.lock().await;
        if let Some(mut child) = guard.take() {
            if !self.external.load(Ordering::SeqCst) {
                info!("Stopping inference daemon");
                interrupt_child(&child);
                let _ = child.wait().await;
            }
        }
        self.started.store(false, Ordering::SeqCst);
    }

    /// Ensure the model is resident, loading it if needed.
    ///
    /// An errored model retries from scratch; a ready one just refreshes
    /// its last-used time.
    pub async fn ensure_model_loaded(&self, model: &str) -> Result<(), InferenceError> {
        if !self.started.load(Ordering::SeqCst) {
            return Err(InferenceError::NotStarted);
        }

        {
            let mut models = self.models.lock().await;
            let state = models
                .entry(model.to_string())
                .or_insert_with(|| ModelState::idle(model));

            if state.load_state == LoadState::Ready {
                state.last_used = Some(Utc::now());
                return Ok(());
            }
            state.load_state = LoadState::Loading;
        }

        self.load_model(model).await
    }

    /// Prewarm a model with an indefinite keep-alive so it stays resident
    async fn load_model(&self, model: &str) -> Result<(), InferenceError> {
        info!(model, "Loading model into inference daemon");

        let payload = serde_json::json!({
            "model": model,
            "prompt": "",
            "keep_alive": -1,
        });

        let result = self
            .client
            .post(format!("{}/api/generate", self.base_url()))
            .json(&payload)
            .send()
            .await;

        let response = match result {
            Ok(resp) => resp,
            Err(e) => {
                self.set_model_error(model, &e.to_string()).await;
                return Err(InferenceError::Model {
                    model: model.to_string(),
                    message: e.to_string(),
                });
            }
        };

        let status = response.status();
        // Drain the streaming body either way
        let _ = response.bytes().await;

        if !status.is_success() {
            let message = format!("failed to load model: status {}", status.as_u16());
            self.set_model_error(model, &message).await;
            return Err(InferenceError::Model {
                model: model.to_string(),
                message,
            });
        }

        let mut models = self.models.lock().await;
        if let Some(state) = models.get_mut(model) {
            state.load_state = LoadState::Ready;
            state.last_used = Some(Utc::now());
            state.error.clear();
        }

        info!(model, "Model loaded successfully");
        Ok(())
    }

    async fn set_model_error(&self, model: &str, message: &str) {
        let mut models = self.models.lock().await;
        if let Some(state) = models.get_mut(model) {
            state.load_state = LoadState::Error;
            state.error = message.to_string();
        }
    }

    /// Run an inference request: chat when messages are present, generate
    /// when raw input is present.
    pub async fn infer(&self, job: &InferenceJob) -> Result<InferenceResult, InferenceError> {
        if !self.started.load(Ordering::SeqCst) {
            return Err(InferenceError::NotStarted);
        }

        self.ensure_model_loaded(&job.model).await?;

        let (endpoint, payload) = if !job.messages.is_empty() {
            let mut payload = serde_json::json!({
                "model": job.model,
                "messages": job.messages,
                "stream": false,
            });
            if job.options.temperature > 0.0 {
                payload["options"] = serde_json::json!({
                    "temperature": job.options.temperature,
                });
            }
            ("/api/chat", payload)
        } else if !job.input.is_empty() {
            (
                "/api/generate",
                serde_json::json!({
                    "model": job.model,
                    "prompt": job.input,
                    "stream": false,
                }),
            )
        } else {
            return Err(InferenceError::NoInput);
        };

        let response = self
            .client
            .post(format!("{}{}", self.base_url(), endpoint))
            .json(&payload)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(InferenceError::Rejected {
                status: status.as_u16(),
                body,
            });
        }

        let parsed: DaemonResponse = response.json().await?;
        let content = if parsed.message.content.is_empty() {
            parsed.response
        } else {
            parsed.message.content
        };

        let mut models = self.models.lock().await;
        if let Some(state) = models.get_mut(&job.model) {
            state.last_used = Some(Utc::now());
        }

        Ok(InferenceResult {
            id: job.id.clone(),
            model: job.model.clone(),
            content,
        })
    }

    /// Unload a model from daemon memory.
    ///
    /// The tracked state moves to idle even when the daemon call fails.
    pub async fn unload_model(&self, model: &str) -> Result<(), InferenceError> {
        if !self.started.load(Ordering::SeqCst) {
            return Err(InferenceError::NotStarted);
        }

        info!(model, "Unloading model");

        let payload = serde_json::json!({
            "model": model,
            "keep_alive": 0,
        });

        let result = self
            .client
            .post(format!("{}/api/generate", self.base_url()))
            .json(&payload)
            .send()
            .await;

        {
            let mut models = self.models.lock().await;
            if let Some(state) = models.get_mut(model) {
                state.load_state = LoadState::Idle;
            }
        }

        result?;
        info!(model, "Model unloaded");
        Ok(())
    }

    /// Current tracked model states
    pub async fn list_models(&self) -> Vec<ModelState> {
        let models = self.models.lock().await;
        models.values().cloned().collect()
    }

    /// Model names installed on the daemon (`/api/tags`)
    pub async fn installed_models(&self) -> Vec<String> {
        let response = match self
            .probe
            .get(format!("{}/api/tags", self.base_url()))
            .send()
            .await
        {
            Ok(resp) if resp.status().is_success() => resp,
            _ => return Vec::new(),
        };

        match response.json::<TagsResponse>().await {
            Ok(tags) => tags.models.into_iter().map(|m| m.name).collect(),
            Err(e) => {
                debug!(error = %e, "Failed to parse daemon tags response");
                Vec::new()
            }
        }
    }
}

/// Deliver SIGINT so the daemon can shut down cleanly
fn interrupt_child(child: &Child) {
    if let Some(pid) = child.id() {
        let _ = nix::sys::signal::kill(
            nix::unistd::Pid::from_raw(pid as i32),
            nix::sys::signal::Signal::SIGINT,
        );
    }
}

/// Pipe daemon output lines into debug logs
async fn forward_daemon_output(stream: impl tokio::io::AsyncRead + Unpin) {
    let mut lines = BufReader::new(stream).lines();
    while let Ok(Some(line)) = lines.next_line().await {
        if !line.trim().is_empty() {
            debug!(source = "inference-daemon", "{line}");
        }
    }
}
