//! Keepalive loop
//!
//! Periodically collects host metrics and POSTs them to the control plane
//! to refresh the machine's TTL. Tracks consecutive failures; the
//! orchestrator watchdog decides when a sustained outage is fatal.

use crate::config::AgentConfig;
use crate::hostinfo::{self, MachineMetrics};
use crate::observability::AgentMetrics;
use crate::state::{AgentState, InferenceState};
use serde::Serialize;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, RwLock};
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

const REQUEST_TIMEOUT: Duration = Duration::from_secs(10);
const MAX_FAILURES: u32 = 3;

pub const AGENT_VERSION: &str = env!("CARGO_PKG_VERSION");

/// Request body for keepalive updates
#[derive(Debug, Serialize)]
pub struct KeepalivePayload<'a> {
    pub machine_id: &'a str,
    pub provider_name: &'a str,
    pub pool_name: &'a str,
    pub agent_version: &'a str,
    pub metrics: &'a MachineMetrics,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub inference: Option<InferenceReport>,
}

/// Inference sub-status reported alongside metrics
#[derive(Debug, Serialize)]
pub struct InferenceReport {
    pub status: InferenceState,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ip: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub port: Option<u16>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub models: Vec<String>,
}

/// Periodic keepalive sender with failure tracking.
///
/// At most one request is in flight at a time; slow round-trips skip ticks
/// instead of queueing them.
pub struct KeepaliveLoop {
    config: Arc<AgentConfig>,
    state: Option<AgentState>,
    client: reqwest::Client,
    metrics: AgentMetrics,
    consecutive_failures: AtomicU32,
    max_failures: u32,
    last_metrics: RwLock<MachineMetrics>,
}

impl KeepaliveLoop {
    pub fn new(config: Arc<AgentConfig>, state: AgentState) -> Self {
        Self::build(config, Some(state))
    }

    /// Loop without a state handle (once mode)
    pub fn detached(config: Arc<AgentConfig>) -> Self {
        Self::build(config, None)
    }

    fn build(config: Arc<AgentConfig>, state: Option<AgentState>) -> Self {
        Self {
            config,
            state,
            client: reqwest::Client::builder()
                .timeout(REQUEST_TIMEOUT)
                .build()
                .expect("failed to build keepalive HTTP client"),
            metrics: AgentMetrics::new(),
            consecutive_failures: AtomicU32::new(0),
            max_failures: MAX_FAILURES,
            last_metrics: RwLock::new(MachineMetrics::default()),
        }
    }

    /// True while recent keepalives are succeeding
    pub fn is_healthy(&self) -> bool {
        self.consecutive_failures.load(Ordering::SeqCst) < self.max_failures
    }

    pub fn consecutive_failures(&self) -> u32 {
        self.consecutive_failures.load(Ordering::SeqCst)
    }

    /// Metrics collected on the most recent tick (dashboard reads)
    pub async fn last_metrics(&self) -> MachineMetrics {
        self.last_metrics.read().await.clone()
    }

    /// Run until the shutdown signal fires.
    ///
    /// Sends one keepalive immediately so the control plane can promote
    /// the machine without waiting a full period. A shutdown received
    /// mid-request cancels the request.
    pub async fn run(&self, mut shutdown: broadcast::Receiver<()>) {
        info!(
            interval_secs = self.config.keepalive_interval,
            "Started keepalive loop"
        );

        tokio::select! {
            _ = self.send_keepalive() => {}
            _ = shutdown.recv() => {
                info!("Keepalive loop stopped");
                return;
            }
        }

        let mut ticker = tokio::time::interval(self.config.keepalive_interval());
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        ticker.tick().await; // first tick completes immediately

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    tokio::select! {
                        _ = self.send_keepalive() => {}
                        _ = shutdown.recv() => break,
                    }
                }
                _ = shutdown.recv() => break,
            }
        }

        info!("Keepalive loop stopped");
    }

    /// Send a single keepalive. Returns whether it counted as a success.
    pub async fn send_keepalive(&self) -> bool {
        let metrics = hostinfo::collect_metrics().await;
        *self.last_metrics.write().await = metrics.clone();

        let inference = match &self.state {
            Some(state) => {
                let snapshot = state.snapshot().await;
                self.metrics
                    .set_job_counts(snapshot.running_jobs, snapshot.total_jobs);
                Some(InferenceReport {
                    status: snapshot.inference_status,
                    ip: (snapshot.inference_status == InferenceState::Running
                        && !snapshot.inference_ip.is_empty())
                    .then(|| snapshot.inference_ip.clone()),
                    port: (snapshot.inference_port > 0).then_some(snapshot.inference_port),
                    models: snapshot.inference_models,
                })
            }
            None => None,
        };

        let payload = KeepalivePayload {
            machine_id: &self.config.machine_id,
            provider_name: &self.config.provider_name,
            pool_name: &self.config.pool_name,
            agent_version: AGENT_VERSION,
            metrics: &metrics,
            inference,
        };

        debug!(
            cpu_pct = metrics.cpu_utilization_pct,
            mem_pct = metrics.memory_utilization_pct,
            free_gpu = metrics.free_gpu_count,
            "Sending keepalive"
        );

        if self.config.dry_run {
            info!("Dry run - skipping keepalive");
            return self.record_success().await;
        }

        self.metrics.inc_keepalives_sent();

        let response = self
            .client
            .post(self.config.keepalive_url())
            .bearer_auth(&self.config.token)
            .json(&payload)
            .send()
            .await;

        match response {
            Ok(resp) if resp.status().is_success() => {
                debug!(machine_id = %self.config.machine_id, "Keepalive successful");
                self.record_success().await
            }
            Ok(resp) => {
                let failures = self.record_failure().await;
                warn!(
                    status = resp.status().as_u16(),
                    failure_count = failures,
                    max_failures = self.max_failures,
                    "Keepalive failed"
                );
                false
            }
            Err(e) => {
                let failures = self.record_failure().await;
                warn!(
                    error = %e,
                    failure_count = failures,
                    "Keepalive connection failed"
                );
                false
            }
        }
    }

    async fn record_success(&self) -> bool {
        self.consecutive_failures.store(0, Ordering::SeqCst);
        self.metrics.set_consecutive_failures(0);
        if let Some(state) = &self.state {
            state.update_heartbeat(true).await;
        }
        true
    }

    async fn record_failure(&self) -> u32 {
        let failures = self.consecutive_failures.fetch_add(1, Ordering::SeqCst) + 1;
        self.metrics.inc_keepalive_failures();
        self.metrics.set_consecutive_failures(failures);
        if let Some(state) = &self.state {
            state.update_heartbeat(false).await;
        }
        failures
    }
}

/// Send a single keepalive (once mode)
pub async fn send_single_keepalive(config: Arc<AgentConfig>) -> bool {
    KeepaliveLoop::detached(config).send_keepalive().await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::AgentStatus;

    fn config() -> Arc<AgentConfig> {
        Arc::new(AgentConfig {
            token: "tok".to_string(),
            machine_id: "abcdef01".to_string(),
            ..AgentConfig::default()
        })
    }

    fn state() -> AgentState {
        AgentState::new("abcdef01", "external", "http://localhost:1994")
    }

    #[tokio::test]
    async fn test_healthy_until_three_failures() {
        let loop_ = KeepaliveLoop::new(config(), state());

        assert!(loop_.is_healthy());
        loop_.record_failure().await;
        assert!(loop_.is_healthy());
        loop_.record_failure().await;
        assert!(loop_.is_healthy());
        loop_.record_failure().await;
        assert!(!loop_.is_healthy());
        assert_eq!(loop_.consecutive_failures(), 3);
    }

    #[tokio::test]
    async fn test_success_resets_failure_count() {
        let loop_ = KeepaliveLoop::new(config(), state());

        loop_.record_failure().await;
        loop_.record_failure().await;
        loop_.record_failure().await;
        assert!(!loop_.is_healthy());

        loop_.record_success().await;
        assert!(loop_.is_healthy());
        assert_eq!(loop_.consecutive_failures(), 0);
    }

    #[tokio::test]
    async fn test_failure_marks_state_unhealthy() {
        let state = state();
        let loop_ = KeepaliveLoop::new(config(), state.clone());

        loop_.record_failure().await;

        let snapshot = state.snapshot().await;
        assert_eq!(snapshot.status, AgentStatus::Unhealthy);
    }

    #[tokio::test]
    async fn test_success_marks_state_ready() {
        let state = state();
        let loop_ = KeepaliveLoop::new(config(), state.clone());

        loop_.record_success().await;

        let snapshot = state.snapshot().await;
        assert_eq!(snapshot.status, AgentStatus::Ready);
    }

    #[tokio::test]
    async fn test_dry_run_tick_counts_as_success() {
        let cfg = Arc::new(AgentConfig {
            dry_run: true,
            ..(*config()).clone()
        });
        let state = state();
        let loop_ = KeepaliveLoop::new(cfg, state.clone());

        assert!(loop_.send_keepalive().await);
        assert_eq!(loop_.consecutive_failures(), 0);
        assert_eq!(state.snapshot().await.status, AgentStatus::Ready);
    }

    #[tokio::test]
    async fn test_transport_error_counts_as_failure() {
        // Nothing listens on this port; the request fails fast.
        let cfg = Arc::new(AgentConfig {
            gateway_host: "127.0.0.1".to_string(),
            gateway_port: 1,
            ..(*config()).clone()
        });
        let state = state();
        let loop_ = KeepaliveLoop::new(cfg, state.clone());

        assert!(!loop_.send_keepalive().await);
        assert_eq!(loop_.consecutive_failures(), 1);
        assert_eq!(state.snapshot().await.status, AgentStatus::Unhealthy);
    }

    #[tokio::test]
    async fn test_run_stops_on_shutdown() {
        let cfg = Arc::new(AgentConfig {
            dry_run: true,
            ..(*config()).clone()
        });
        let loop_ = Arc::new(KeepaliveLoop::new(cfg, state()));
        let (tx, rx) = broadcast::channel(1);

        let handle = {
            let loop_ = loop_.clone();
            tokio::spawn(async move { loop_.run(rx).await })
        };

        tokio::time::sleep(Duration::from_millis(300)).await;
        tx.send(()).unwrap();

        tokio::time::timeout(Duration::from_secs(5), handle)
            .await
            .expect("keepalive loop did not stop")
            .unwrap();
    }

    #[test]
    fn test_payload_omits_empty_inference() {
        let metrics = MachineMetrics::default();
        let payload = KeepalivePayload {
            machine_id: "abcdef01",
            provider_name: "generic",
            pool_name: "external",
            agent_version: AGENT_VERSION,
            metrics: &metrics,
            inference: None,
        };

        let json = serde_json::to_value(&payload).unwrap();
        assert!(json.get("inference").is_none());
        assert_eq!(json["machine_id"], "abcdef01");
        assert!(json["metrics"].get("cpu_utilization_pct").is_some());
    }

    #[test]
    fn test_inference_report_serialization() {
        let report = InferenceReport {
            status: InferenceState::Running,
            ip: Some("100.72.101.23".to_string()),
            port: Some(11434),
            models: vec!["llama3".to_string()],
        };

        let json = serde_json::to_value(&report).unwrap();
        assert_eq!(json["status"], "running");
        assert_eq!(json["ip"], "100.72.101.23");
        assert_eq!(json["port"], 11434);

        let stopped = InferenceReport {
            status: InferenceState::Stopped,
            ip: None,
            port: None,
            models: Vec::new(),
        };
        let json = serde_json::to_value(&stopped).unwrap();
        assert_eq!(json["status"], "stopped");
        assert!(json.get("ip").is_none());
        assert!(json.get("models").is_none());
    }
}
