//! Lifecycle orchestrator
//!
//! Owns the top-level state machine: validate config, start the inference
//! supervisor, register with the control plane, then supervise the
//! keepalive loop, pod watcher and control server until shutdown. Runs in
//! either logs mode (structured records + health watchdog) or dashboard
//! mode (terminal frame refreshed every second).

use crate::config::AgentConfig;
use crate::control::{self, ControlState, DEFAULT_CONTROL_PORT};
use crate::errors::KeepaliveError;
use crate::hostinfo;
use crate::inference::{InferenceManager, DEFAULT_INFERENCE_PORT};
use crate::keepalive::{self, KeepaliveLoop, AGENT_VERSION};
use crate::pods::PodWatcher;
use crate::registration;
use crate::state::{AgentState, AgentStatus};
use crate::tui::Dashboard;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

const WATCHDOG_INTERVAL: Duration = Duration::from_secs(10);
const RENDER_INTERVAL: Duration = Duration::from_secs(1);
const STOP_GRACE: Duration = Duration::from_secs(5);

/// The agent process: one lifecycle, three supervised loops
pub struct Agent {
    config: Arc<AgentConfig>,
    state: AgentState,
    inference: Arc<InferenceManager>,
    dashboard: Option<Dashboard>,
    shutdown_tx: broadcast::Sender<()>,
}

impl Agent {
    /// Build an agent. `use_dashboard` selects the terminal UI over
    /// structured logs.
    pub async fn new(config: AgentConfig, use_dashboard: bool) -> Self {
        let config = Arc::new(config);

        let state = AgentState::new(
            config.machine_id.clone(),
            config.pool_name.clone(),
            config.gateway_url(),
        );

        // Prefer the configured hostname, then the mesh-VPN address
        let advertise_ip = if config.hostname.is_empty() {
            hostinfo::detect_mesh_ip()
                .await
                .unwrap_or_else(|| "localhost".to_string())
        } else {
            config.hostname.clone()
        };
        let inference = Arc::new(InferenceManager::new(advertise_ip, DEFAULT_INFERENCE_PORT));

        let (shutdown_tx, _) = broadcast::channel(4);

        Self {
            config,
            state,
            inference,
            dashboard: use_dashboard.then(Dashboard::new),
            shutdown_tx,
        }
    }

    /// Handle that lets other components observe agent state
    pub fn state(&self) -> AgentState {
        self.state.clone()
    }

    /// Run the agent until shutdown or a terminal error
    pub async fn run(&self) -> anyhow::Result<()> {
        if let Some(dashboard) = &self.dashboard {
            dashboard.enter_full_screen();
            let result = self.run_inner().await;
            dashboard.exit_full_screen();
            return result;
        }

        info!(
            version = AGENT_VERSION,
            machine_id = %self.config.machine_id,
            pool = %self.config.pool_name,
            gateway = %self.config.gateway_url(),
            debug = self.config.debug,
            dry_run = self.config.dry_run,
            "Agent starting"
        );

        self.run_inner().await
    }

    async fn run_inner(&self) -> anyhow::Result<()> {
        self.config.validate()?;

        self.spawn_signal_handler();

        // Inference is best-effort: a missing daemon never blocks startup
        if let Err(e) = self.inference.start().await {
            warn!(error = %e, "Failed to start inference daemon, inference disabled");
        }

        self.state.set_status(AgentStatus::Registering).await;
        self.render().await;

        let registered = registration::register_machine(&self.config).await;
        if let Err(e) = registered {
            self.state.set_status(AgentStatus::Error).await;
            self.render().await;
            self.teardown(None, None).await;
            return Err(e.into());
        }

        self.state.set_status(AgentStatus::Registered).await;
        self.render().await;

        if self.config.once {
            info!("Running in --once mode, sending single keepalive");
            let success = keepalive::send_single_keepalive(self.config.clone()).await;
            self.state.update_heartbeat(success).await;
            if self.dashboard.is_some() {
                self.render().await;
                tokio::time::sleep(Duration::from_secs(2)).await;
            } else if success {
                info!("Single keepalive sent successfully");
            } else {
                warn!("Single keepalive failed");
            }
            self.teardown(None, None).await;
            return Ok(());
        }

        let watcher = Arc::new(PodWatcher::new(self.state.clone()));
        watcher.refresh().await;
        let watcher_handle = {
            let watcher = watcher.clone();
            let shutdown = self.shutdown_tx.subscribe();
            self.spawn_supervised("pod-watcher", async move { watcher.run(shutdown).await })
        };

        let keepalive = Arc::new(KeepaliveLoop::new(self.config.clone(), self.state.clone()));
        let keepalive_handle = {
            let keepalive = keepalive.clone();
            let shutdown = self.shutdown_tx.subscribe();
            self.spawn_supervised("keepalive", async move { keepalive.run(shutdown).await })
        };

        {
            let control = ControlState {
                state: self.state.clone(),
                inference: self.inference.clone(),
            };
            let shutdown = self.shutdown_tx.subscribe();
            self.spawn_supervised("control-server", async move {
                if let Err(e) = control::serve(DEFAULT_CONTROL_PORT, control, shutdown).await {
                    error!(error = %e, "Control server error");
                }
            });
        }

        let result = match &self.dashboard {
            Some(dashboard) => self.render_loop(dashboard, &keepalive).await,
            None => self.watchdog_loop(&keepalive).await,
        };

        self.teardown(Some(watcher_handle), Some(keepalive_handle))
            .await;

        result
    }

    /// Logs mode: poll keepalive health every 10 s and exit when it
    /// crosses the failure threshold
    async fn watchdog_loop(&self, keepalive: &KeepaliveLoop) -> anyhow::Result<()> {
        let mut shutdown = self.shutdown_tx.subscribe();
        let mut ticker = tokio::time::interval(WATCHDOG_INTERVAL);
        ticker.tick().await;

        loop {
            tokio::select! {
                _ = shutdown.recv() => {
                    info!("Agent shutdown requested");
                    return Ok(());
                }
                _ = ticker.tick() => {
                    if !keepalive.is_healthy() {
                        error!("Keepalive loop unhealthy (too many consecutive failures), exiting");
                        return Err(KeepaliveError::Unhealthy.into());
                    }
                }
            }
        }
    }

    /// Dashboard mode: redraw every second, sharing the watchdog check
    async fn render_loop(
        &self,
        dashboard: &Dashboard,
        keepalive: &KeepaliveLoop,
    ) -> anyhow::Result<()> {
        let mut shutdown = self.shutdown_tx.subscribe();
        let mut ticker = tokio::time::interval(RENDER_INTERVAL);

        loop {
            tokio::select! {
                _ = shutdown.recv() => return Ok(()),
                _ = ticker.tick() => {
                    let metrics = keepalive.last_metrics().await;
                    self.state
                        .update_metrics(
                            metrics.cpu_utilization_pct,
                            metrics.memory_utilization_pct,
                            metrics.free_gpu_count,
                        )
                        .await;

                    dashboard.draw(&self.state.snapshot().await);

                    if !keepalive.is_healthy() {
                        return Err(KeepaliveError::Unhealthy.into());
                    }
                }
            }
        }
    }

    async fn render(&self) {
        if let Some(dashboard) = &self.dashboard {
            dashboard.draw(&self.state.snapshot().await);
        }
    }

    /// Spawn a background loop whose panic triggers a clean shutdown
    /// instead of silently losing the task
    fn spawn_supervised<F>(&self, name: &'static str, fut: F) -> JoinHandle<()>
    where
        F: std::future::Future<Output = ()> + Send + 'static,
    {
        let shutdown_tx = self.shutdown_tx.clone();
        let inner = tokio::spawn(fut);

        tokio::spawn(async move {
            if let Err(e) = inner.await {
                if e.is_panic() {
                    error!(task = name, "Background task panicked, shutting down");
                    let _ = shutdown_tx.send(());
                }
            }
        })
    }

    fn spawn_signal_handler(&self) {
        let shutdown_tx = self.shutdown_tx.clone();
        let log_signals = self.dashboard.is_none();

        tokio::spawn(async move {
            let sigint = tokio::signal::ctrl_c();

            #[cfg(unix)]
            {
                let mut sigterm =
                    match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
                    {
                        Ok(s) => s,
                        Err(e) => {
                            warn!(error = %e, "Failed to install SIGTERM handler");
                            let _ = sigint.await;
                            let _ = shutdown_tx.send(());
                            return;
                        }
                    };

                tokio::select! {
                    _ = sigint => {
                        if log_signals {
                            info!(signal = "SIGINT", "Received shutdown signal");
                        }
                    }
                    _ = sigterm.recv() => {
                        if log_signals {
                            info!(signal = "SIGTERM", "Received shutdown signal");
                        }
                    }
                }
            }

            #[cfg(not(unix))]
            {
                let _ = sigint.await;
            }

            let _ = shutdown_tx.send(());
        });
    }

    /// Stop everything in reverse startup order
    async fn teardown(
        &self,
        watcher_handle: Option<JoinHandle<()>>,
        keepalive_handle: Option<JoinHandle<()>>,
    ) {
        let _ = self.shutdown_tx.send(());

        if let Some(handle) = watcher_handle {
            if tokio::time::timeout(STOP_GRACE, handle).await.is_err() {
                warn!("Pod watcher did not stop within timeout");
            }
        }
        if let Some(handle) = keepalive_handle {
            if tokio::time::timeout(STOP_GRACE, handle).await.is_err() {
                warn!("Keepalive loop did not stop within timeout");
            }
        }

        self.inference.stop().await;

        if self.dashboard.is_none() {
            info!("Agent shutdown complete");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config() -> AgentConfig {
        AgentConfig {
            token: "tok".to_string(),
            machine_id: "abcdef01".to_string(),
            hostname: "localhost".to_string(),
            dry_run: true,
            once: true,
            ..AgentConfig::default()
        }
    }

    #[tokio::test]
    async fn test_invalid_config_fails_fast() {
        let agent = Agent::new(
            AgentConfig {
                machine_id: "nope".to_string(),
                ..config()
            },
            false,
        )
        .await;

        let err = agent.run().await.unwrap_err();
        assert!(err.to_string().contains("machine_id"));
    }

    #[tokio::test]
    async fn test_dry_run_once_exits_cleanly() {
        let agent = Agent::new(config(), false).await;

        agent.run().await.unwrap();

        let snapshot = agent.state().snapshot().await;
        // Dry-run once mode: registered, heartbeat recorded, no jobs seen
        assert_eq!(snapshot.status, AgentStatus::Ready);
        assert!(snapshot.last_heartbeat.is_some());
        assert!(snapshot.jobs.is_empty());
        assert_eq!(snapshot.total_jobs, 0);
    }

    #[tokio::test]
    async fn test_status_progression_in_dry_run() {
        let agent = Agent::new(config(), false).await;
        let state = agent.state();

        assert_eq!(state.snapshot().await.status, AgentStatus::Starting);
        agent.run().await.unwrap();

        // Terminal state after REGISTERING -> REGISTERED -> heartbeat
        let status = state.snapshot().await.status;
        assert!(matches!(status, AgentStatus::Ready | AgentStatus::Registered));
    }
}
