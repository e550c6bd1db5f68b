//! Shared agent state
//!
//! A single aggregate of machine info, metrics, jobs, inference status and
//! a log ring buffer, shared by every long-running loop. All mutation goes
//! through the published operations here; readers get deep-copied
//! snapshots and never hold a reference into live state.

use chrono::{DateTime, Local, Utc};
use serde::Serialize;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;

/// Maximum retained jobs (newest first)
const MAX_JOBS: usize = 20;
/// Default size of the log ring buffer
const DEFAULT_MAX_LOGS: i32 = 10;
/// Log entries are truncated to this many chars after timestamping
const MAX_LOG_LEN: usize = 70;

/// Machine lifecycle status as shown to the operator
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum AgentStatus {
    Starting,
    Registering,
    Registered,
    Ready,
    Busy,
    Unhealthy,
    Error,
}

impl fmt::Display for AgentStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            AgentStatus::Starting => "STARTING",
            AgentStatus::Registering => "REGISTERING",
            AgentStatus::Registered => "REGISTERED",
            AgentStatus::Ready => "READY",
            AgentStatus::Busy => "BUSY",
            AgentStatus::Unhealthy => "UNHEALTHY",
            AgentStatus::Error => "ERROR",
        };
        f.write_str(s)
    }
}

/// Result of the most recent heartbeat
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum HeartbeatStatus {
    #[serde(rename = "")]
    Unknown,
    Ok,
    Failed,
}

impl HeartbeatStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            HeartbeatStatus::Unknown => "",
            HeartbeatStatus::Ok => "ok",
            HeartbeatStatus::Failed => "failed",
        }
    }
}

/// State of a job/pod scheduled onto this machine
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum JobStatus {
    Pending,
    Running,
    Completed,
    Failed,
}

impl JobStatus {
    /// Pending and running jobs both count toward the running total
    pub fn is_active(&self) -> bool {
        matches!(self, JobStatus::Pending | JobStatus::Running)
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            JobStatus::Pending => "PENDING",
            JobStatus::Running => "RUNNING",
            JobStatus::Completed => "COMPLETED",
            JobStatus::Failed => "FAILED",
        };
        f.write_str(s)
    }
}

/// A single tracked workload pod
#[derive(Debug, Clone, PartialEq)]
pub struct JobInfo {
    pub pod_name: String,
    pub task_id: String,
    pub func_name: String,
    pub status: JobStatus,
    pub start_time: Option<DateTime<Utc>>,
    pub end_time: Option<DateTime<Utc>>,
    pub duration: Option<Duration>,
    pub exit_code: i32,
}

impl JobInfo {
    pub fn new(pod_name: impl Into<String>, status: JobStatus) -> Self {
        Self {
            pod_name: pod_name.into(),
            task_id: String::new(),
            func_name: String::new(),
            status,
            start_time: None,
            end_time: None,
            duration: None,
            exit_code: 0,
        }
    }
}

/// Inference subsystem status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum InferenceState {
    Stopped,
    Starting,
    Running,
    Error,
}

impl fmt::Display for InferenceState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            InferenceState::Stopped => "stopped",
            InferenceState::Starting => "starting",
            InferenceState::Running => "running",
            InferenceState::Error => "error",
        };
        f.write_str(s)
    }
}

#[derive(Debug)]
struct StateInner {
    machine_id: String,
    pool_name: String,
    gateway: String,
    status: AgentStatus,

    cpu_percent: f64,
    memory_percent: f64,
    gpu_count: u32,

    start_time: DateTime<Utc>,
    last_heartbeat: Option<DateTime<Utc>>,
    heartbeat_status: HeartbeatStatus,

    jobs: Vec<JobInfo>,
    running_jobs: usize,
    total_jobs: usize,

    inference_status: InferenceState,
    inference_ip: String,
    inference_port: u16,
    inference_models: Vec<String>,

    logs: Vec<String>,
    max_logs: i32,
}

/// Copy-safe view of the agent state for rendering and reporting.
///
/// Shares no mutable structure with the live state.
#[derive(Debug, Clone)]
pub struct StateSnapshot {
    pub machine_id: String,
    pub pool_name: String,
    pub gateway: String,
    pub status: AgentStatus,
    pub cpu_percent: f64,
    pub memory_percent: f64,
    pub gpu_count: u32,
    pub start_time: DateTime<Utc>,
    pub last_heartbeat: Option<DateTime<Utc>>,
    pub heartbeat_status: HeartbeatStatus,
    pub jobs: Vec<JobInfo>,
    pub running_jobs: usize,
    pub total_jobs: usize,
    pub inference_status: InferenceState,
    pub inference_ip: String,
    pub inference_port: u16,
    pub inference_models: Vec<String>,
    pub logs: Vec<String>,
}

impl StateSnapshot {
    /// Agent uptime
    pub fn uptime(&self) -> Duration {
        (Utc::now() - self.start_time).to_std().unwrap_or_default()
    }

    /// Time since the last heartbeat, zero if none yet
    pub fn time_since_heartbeat(&self) -> Duration {
        match self.last_heartbeat {
            Some(at) => (Utc::now() - at).to_std().unwrap_or_default(),
            None => Duration::ZERO,
        }
    }
}

/// Thread-safe agent state handle. Clones share the same underlying state.
#[derive(Debug, Clone)]
pub struct AgentState {
    inner: Arc<RwLock<StateInner>>,
}

impl AgentState {
    pub fn new(
        machine_id: impl Into<String>,
        pool_name: impl Into<String>,
        gateway: impl Into<String>,
    ) -> Self {
        Self {
            inner: Arc::new(RwLock::new(StateInner {
                machine_id: machine_id.into(),
                pool_name: pool_name.into(),
                gateway: gateway.into(),
                status: AgentStatus::Starting,
                cpu_percent: 0.0,
                memory_percent: 0.0,
                gpu_count: 0,
                start_time: Utc::now(),
                last_heartbeat: None,
                heartbeat_status: HeartbeatStatus::Unknown,
                jobs: Vec::new(),
                running_jobs: 0,
                total_jobs: 0,
                inference_status: InferenceState::Stopped,
                inference_ip: String::new(),
                inference_port: 0,
                inference_models: Vec::new(),
                logs: Vec::new(),
                max_logs: DEFAULT_MAX_LOGS,
            })),
        }
    }

    /// Replace the resource metric fields
    pub async fn update_metrics(&self, cpu: f64, memory: f64, gpus: u32) {
        let mut inner = self.inner.write().await;
        inner.cpu_percent = cpu;
        inner.memory_percent = memory;
        inner.gpu_count = gpus;
    }

    /// Set the lifecycle status directly (startup transitions)
    pub async fn set_status(&self, status: AgentStatus) {
        let mut inner = self.inner.write().await;
        inner.status = status;
    }

    /// Record a heartbeat result.
    ///
    /// Success promotes to READY unless the machine is BUSY; failure forces
    /// UNHEALTHY unconditionally.
    pub async fn update_heartbeat(&self, success: bool) {
        let mut inner = self.inner.write().await;
        inner.last_heartbeat = Some(Utc::now());
        if success {
            inner.heartbeat_status = HeartbeatStatus::Ok;
            if inner.status != AgentStatus::Busy {
                inner.status = AgentStatus::Ready;
            }
        } else {
            inner.heartbeat_status = HeartbeatStatus::Failed;
            inner.status = AgentStatus::Unhealthy;
        }
    }

    /// Add or update a job, keyed by pod name.
    ///
    /// Updates mutate the existing entry in place; inserts prepend and the
    /// list is trimmed to the newest 20.
    pub async fn add_job(&self, job: JobInfo) {
        let mut inner = self.inner.write().await;

        if let Some(existing) = inner.jobs.iter_mut().find(|j| j.pod_name == job.pod_name) {
            *existing = job;
        } else {
            inner.jobs.insert(0, job);
            inner.jobs.truncate(MAX_JOBS);
        }

        inner.recount_jobs();
    }

    /// Update inference server status. The models slice is copied.
    pub async fn update_inference(
        &self,
        status: InferenceState,
        ip: &str,
        port: u16,
        models: &[String],
    ) {
        let mut inner = self.inner.write().await;
        inner.inference_status = status;
        inner.inference_ip = ip.to_string();
        inner.inference_port = port;
        inner.inference_models = models.to_vec();
    }

    /// Append a timestamped entry to the log ring buffer
    pub async fn add_log(&self, msg: impl AsRef<str>) {
        let mut inner = self.inner.write().await;

        let entry = format!("{} {}", Local::now().format("%H:%M:%S"), msg.as_ref());
        let entry = if entry.chars().count() > MAX_LOG_LEN {
            let head: String = entry.chars().take(MAX_LOG_LEN - 3).collect();
            format!("{head}...")
        } else {
            entry
        };

        inner.logs.push(entry);
        let max = inner.max_logs;
        if max > 0 && inner.logs.len() > max as usize {
            let excess = inner.logs.len() - max as usize;
            inner.logs.drain(..excess);
        } else if max == 0 {
            inner.logs.clear();
        }
        // Negative max_logs disables trimming entirely.
    }

    /// Override the log ring capacity (testing and the logs-only mode)
    pub async fn set_max_logs(&self, max: i32) {
        self.inner.write().await.max_logs = max;
    }

    /// Deep-copied snapshot for rendering and reporting
    pub async fn snapshot(&self) -> StateSnapshot {
        let inner = self.inner.read().await;
        StateSnapshot {
            machine_id: inner.machine_id.clone(),
            pool_name: inner.pool_name.clone(),
            gateway: inner.gateway.clone(),
            status: inner.status,
            cpu_percent: inner.cpu_percent,
            memory_percent: inner.memory_percent,
            gpu_count: inner.gpu_count,
            start_time: inner.start_time,
            last_heartbeat: inner.last_heartbeat,
            heartbeat_status: inner.heartbeat_status,
            jobs: inner.jobs.clone(),
            running_jobs: inner.running_jobs,
            total_jobs: inner.total_jobs,
            inference_status: inner.inference_status,
            inference_ip: inner.inference_ip.clone(),
            inference_port: inner.inference_port,
            inference_models: inner.inference_models.clone(),
            logs: inner.logs.clone(),
        }
    }
}

impl StateInner {
    fn recount_jobs(&mut self) {
        let running = self.jobs.iter().filter(|j| j.status.is_active()).count();
        self.running_jobs = running;
        self.total_jobs = self.jobs.len();
        if running > 0 {
            self.status = AgentStatus::Busy;
        } else if self.heartbeat_status == HeartbeatStatus::Ok {
            self.status = AgentStatus::Ready;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn state() -> AgentState {
        AgentState::new("abcdef01", "external", "http://localhost:1994")
    }

    #[tokio::test]
    async fn test_new_state_defaults() {
        let snapshot = state().snapshot().await;

        assert_eq!(snapshot.machine_id, "abcdef01");
        assert_eq!(snapshot.pool_name, "external");
        assert_eq!(snapshot.status, AgentStatus::Starting);
        assert_eq!(snapshot.heartbeat_status, HeartbeatStatus::Unknown);
        assert!(snapshot.jobs.is_empty());
        assert_eq!(snapshot.inference_status, InferenceState::Stopped);
    }

    #[tokio::test]
    async fn test_update_metrics() {
        let state = state();
        state.update_metrics(45.5, 62.3, 2).await;

        let snapshot = state.snapshot().await;
        assert_eq!(snapshot.cpu_percent, 45.5);
        assert_eq!(snapshot.memory_percent, 62.3);
        assert_eq!(snapshot.gpu_count, 2);
    }

    #[tokio::test]
    async fn test_update_heartbeat_success_and_failure() {
        let state = state();

        state.update_heartbeat(true).await;
        let snapshot = state.snapshot().await;
        assert_eq!(snapshot.heartbeat_status, HeartbeatStatus::Ok);
        assert_eq!(snapshot.status, AgentStatus::Ready);
        assert!(snapshot.last_heartbeat.is_some());

        state.update_heartbeat(false).await;
        let snapshot = state.snapshot().await;
        assert_eq!(snapshot.heartbeat_status, HeartbeatStatus::Failed);
        assert_eq!(snapshot.status, AgentStatus::Unhealthy);
    }

    #[tokio::test]
    async fn test_heartbeat_success_preserves_busy() {
        let state = state();
        state
            .add_job(JobInfo::new("worker-123", JobStatus::Running))
            .await;
        assert_eq!(state.snapshot().await.status, AgentStatus::Busy);

        state.update_heartbeat(true).await;
        assert_eq!(state.snapshot().await.status, AgentStatus::Busy);
    }

    #[tokio::test]
    async fn test_heartbeat_failure_forces_unhealthy_even_when_busy() {
        let state = state();
        state
            .add_job(JobInfo::new("worker-123", JobStatus::Running))
            .await;

        state.update_heartbeat(false).await;
        assert_eq!(state.snapshot().await.status, AgentStatus::Unhealthy);
    }

    #[tokio::test]
    async fn test_add_job_sets_busy() {
        let state = state();
        state.update_heartbeat(true).await;

        state
            .add_job(JobInfo {
                pod_name: "worker-abc".to_string(),
                task_id: "task-1".to_string(),
                func_name: "hello:greet".to_string(),
                status: JobStatus::Running,
                start_time: Some(Utc::now()),
                end_time: None,
                duration: None,
                exit_code: 0,
            })
            .await;

        let snapshot = state.snapshot().await;
        assert_eq!(snapshot.jobs.len(), 1);
        assert_eq!(snapshot.running_jobs, 1);
        assert_eq!(snapshot.status, AgentStatus::Busy);
    }

    #[tokio::test]
    async fn test_pending_jobs_count_as_running() {
        let state = state();
        state
            .add_job(JobInfo::new("worker-a", JobStatus::Pending))
            .await;

        let snapshot = state.snapshot().await;
        assert_eq!(snapshot.running_jobs, 1);
        assert_eq!(snapshot.status, AgentStatus::Busy);
    }

    #[tokio::test]
    async fn test_add_job_updates_existing_in_place() {
        let state = state();
        state.update_heartbeat(true).await;

        state
            .add_job(JobInfo::new("worker-abc", JobStatus::Running))
            .await;
        let mut done = JobInfo::new("worker-abc", JobStatus::Completed);
        done.duration = Some(Duration::from_millis(500));
        state.add_job(done).await;

        let snapshot = state.snapshot().await;
        assert_eq!(snapshot.jobs.len(), 1);
        assert_eq!(snapshot.jobs[0].status, JobStatus::Completed);
        assert_eq!(snapshot.jobs[0].duration, Some(Duration::from_millis(500)));
        assert_eq!(snapshot.running_jobs, 0);
        assert_eq!(snapshot.status, AgentStatus::Ready);
    }

    #[tokio::test]
    async fn test_add_job_keeps_max_20_newest_first() {
        let state = state();

        for i in 0..25 {
            state
                .add_job(JobInfo::new(format!("worker-{i}"), JobStatus::Completed))
                .await;
        }

        let snapshot = state.snapshot().await;
        assert_eq!(snapshot.jobs.len(), 20);
        assert_eq!(snapshot.total_jobs, 20);
        assert_eq!(snapshot.jobs[0].pod_name, "worker-24");
        assert_eq!(snapshot.jobs[19].pod_name, "worker-5");
    }

    #[tokio::test]
    async fn test_pod_names_stay_unique() {
        let state = state();
        for _ in 0..5 {
            state
                .add_job(JobInfo::new("worker-same", JobStatus::Running))
                .await;
        }

        let snapshot = state.snapshot().await;
        let count = snapshot
            .jobs
            .iter()
            .filter(|j| j.pod_name == "worker-same")
            .count();
        assert_eq!(count, 1);
    }

    #[tokio::test]
    async fn test_running_count_matches_active_jobs() {
        let state = state();
        state
            .add_job(JobInfo::new("a", JobStatus::Pending))
            .await;
        state
            .add_job(JobInfo::new("b", JobStatus::Running))
            .await;
        state
            .add_job(JobInfo::new("c", JobStatus::Completed))
            .await;
        state.add_job(JobInfo::new("d", JobStatus::Failed)).await;

        let snapshot = state.snapshot().await;
        let active = snapshot
            .jobs
            .iter()
            .filter(|j| j.status.is_active())
            .count();
        assert_eq!(snapshot.running_jobs, active);
        assert_eq!(snapshot.running_jobs, 2);
        assert_eq!(snapshot.status, AgentStatus::Busy);
    }

    #[tokio::test]
    async fn test_snapshot_is_deep_copy() {
        let state = state();
        state
            .add_job(JobInfo::new("job1", JobStatus::Running))
            .await;
        state
            .update_inference(InferenceState::Running, "10.0.0.1", 11434, &[
                "llama3".to_string(),
            ])
            .await;

        let mut snapshot = state.snapshot().await;
        snapshot.jobs[0].pod_name = "modified".to_string();
        snapshot.inference_models[0] = "modified".to_string();
        snapshot.logs.push("injected".to_string());

        let fresh = state.snapshot().await;
        assert_eq!(fresh.jobs[0].pod_name, "job1");
        assert_eq!(fresh.inference_models[0], "llama3");
        assert!(fresh.logs.is_empty());
    }

    #[tokio::test]
    async fn test_update_inference_copies_models() {
        let state = state();
        let mut models = vec!["m1".to_string()];
        state
            .update_inference(InferenceState::Running, "ip", 11434, &models)
            .await;
        models[0] = "changed".to_string();

        let snapshot = state.snapshot().await;
        assert_eq!(snapshot.inference_models, vec!["m1".to_string()]);
        assert_eq!(snapshot.inference_port, 11434);
    }

    #[tokio::test]
    async fn test_add_log_timestamps_and_truncates() {
        let state = state();
        let long = "x".repeat(100);
        state.add_log(&long).await;

        let snapshot = state.snapshot().await;
        assert_eq!(snapshot.logs.len(), 1);
        let entry = &snapshot.logs[0];
        assert_eq!(entry.chars().count(), 70);
        assert!(entry.ends_with("..."));
        // HH:MM:SS prefix
        assert_eq!(entry.as_bytes()[2], b':');
        assert_eq!(entry.as_bytes()[5], b':');
    }

    #[tokio::test]
    async fn test_log_ring_trims_to_max() {
        let state = state();
        for i in 0..15 {
            state.add_log(format!("entry {i}")).await;
        }

        let snapshot = state.snapshot().await;
        assert_eq!(snapshot.logs.len(), 10);
        assert!(snapshot.logs[0].ends_with("entry 5"));
        assert!(snapshot.logs[9].ends_with("entry 14"));
    }

    #[tokio::test]
    async fn test_log_ring_size_below_max() {
        let state = state();
        for i in 0..4 {
            state.add_log(format!("entry {i}")).await;
        }
        assert_eq!(state.snapshot().await.logs.len(), 4);
    }

    #[tokio::test]
    async fn test_zero_max_logs_clears_on_write() {
        let state = state();
        state.set_max_logs(0).await;
        state.add_log("anything").await;
        assert!(state.snapshot().await.logs.is_empty());
    }

    #[tokio::test]
    async fn test_negative_max_logs_disables_trimming() {
        let state = state();
        state.set_max_logs(-1).await;
        for i in 0..50 {
            state.add_log(format!("entry {i}")).await;
        }
        assert_eq!(state.snapshot().await.logs.len(), 50);
    }

    #[tokio::test]
    async fn test_uptime_and_time_since_heartbeat() {
        let state = state();
        let snapshot = state.snapshot().await;
        assert_eq!(snapshot.time_since_heartbeat(), Duration::ZERO);

        state.update_heartbeat(true).await;
        tokio::time::sleep(Duration::from_millis(10)).await;

        let snapshot = state.snapshot().await;
        assert!(snapshot.time_since_heartbeat() >= Duration::from_millis(10));
        assert!(snapshot.uptime() >= Duration::from_millis(10));
    }

    #[test]
    fn test_status_display() {
        assert_eq!(AgentStatus::Ready.to_string(), "READY");
        assert_eq!(AgentStatus::Unhealthy.to_string(), "UNHEALTHY");
        assert_eq!(JobStatus::Pending.to_string(), "PENDING");
        assert_eq!(JobStatus::Completed.to_string(), "COMPLETED");
        assert_eq!(InferenceState::Running.to_string(), "running");
        assert_eq!(HeartbeatStatus::Unknown.as_str(), "");
        assert_eq!(HeartbeatStatus::Ok.as_str(), "ok");
    }
}
