//! Workload pod watcher
//!
//! Observes the pods the control plane schedules onto this machine and
//! folds their lifecycle into the shared job list. Discovery is an opaque
//! external command: a one-shot list returning `{items: [...]}` and a
//! watch that streams newline-delimited JSON events. Only the fields we
//! consume are pinned; everything else is ignored.

use crate::state::{AgentState, JobInfo, JobStatus};
use chrono::{DateTime, Utc};
use serde::Deserialize;
use std::collections::HashMap;
use std::process::Stdio;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::Command;
use tokio::sync::broadcast;
use tracing::{debug, warn};

const NAMESPACE: &str = "default";
const LABEL_SELECTOR: &str = "app.kubernetes.io/managed-by=beta9";
const STUB_ID_LABEL: &str = "beta9.io/stub-id";
const RECONNECT_DELAY: Duration = Duration::from_secs(2);

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub struct PodList {
    pub items: Vec<Pod>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub struct WatchEvent {
    #[serde(rename = "type")]
    pub kind: String,
    pub object: Pod,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub struct Pod {
    pub metadata: PodMetadata,
    pub status: PodStatus,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub struct PodMetadata {
    pub name: String,
    pub labels: HashMap<String, String>,
    #[serde(rename = "creationTimestamp")]
    pub creation_timestamp: String,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub struct PodStatus {
    pub phase: String,
    #[serde(rename = "containerStatuses")]
    pub container_statuses: Vec<ContainerStatus>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub struct ContainerStatus {
    pub state: ContainerState,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub struct ContainerState {
    pub running: Option<RunningState>,
    pub terminated: Option<TerminatedState>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub struct RunningState {
    #[serde(rename = "startedAt")]
    pub started_at: String,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub struct TerminatedState {
    #[serde(rename = "exitCode")]
    pub exit_code: i32,
    #[serde(rename = "finishedAt")]
    pub finished_at: String,
}

/// Watches workload pods and feeds the shared job list
pub struct PodWatcher {
    state: AgentState,
}

impl PodWatcher {
    pub fn new(state: AgentState) -> Self {
        Self { state }
    }

    /// One-shot refresh of all current pods
    pub async fn refresh(&self) {
        let output = Command::new("kubectl")
            .args([
                "get", "pods", "-n", NAMESPACE, "-l", LABEL_SELECTOR, "-o", "json",
            ])
            .output()
            .await;

        let output = match output {
            Ok(out) if out.status.success() => out,
            Ok(out) => {
                debug!(code = ?out.status.code(), "Failed to get initial pods");
                return;
            }
            Err(e) => {
                debug!(error = %e, "Failed to get initial pods");
                return;
            }
        };

        let pod_list: PodList = match serde_json::from_slice(&output.stdout) {
            Ok(list) => list,
            Err(e) => {
                debug!(error = %e, "Failed to parse pod list");
                return;
            }
        };

        for pod in &pod_list.items {
            if let Some(job) = job_from_pod(pod) {
                self.state.add_job(job).await;
            }
        }
    }

    /// Watch pods until the shutdown signal fires.
    ///
    /// If the watch process exits or its stream errors, waits 2 s and
    /// restarts. The child is always reaped on the way out.
    pub async fn run(&self, mut shutdown: broadcast::Receiver<()>) {
        debug!("Starting pod watcher");

        loop {
            let mut cmd = Command::new("kubectl");
            cmd.args([
                "get",
                "pods",
                "-n",
                NAMESPACE,
                "-l",
                LABEL_SELECTOR,
                "-o",
                "json",
                "--watch",
                "--output-watch-events",
            ])
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .kill_on_drop(true);

            let mut child = match cmd.spawn() {
                Ok(child) => child,
                Err(e) => {
                    warn!(error = %e, "Failed to start pod watch command");
                    if wait_or_shutdown(RECONNECT_DELAY, &mut shutdown).await {
                        return;
                    }
                    continue;
                }
            };

            if let Some(stdout) = child.stdout.take() {
                let mut lines = BufReader::new(stdout).lines();
                loop {
                    tokio::select! {
                        line = lines.next_line() => match line {
                            Ok(Some(line)) => self.process_watch_line(&line).await,
                            Ok(None) => break,
                            Err(e) => {
                                debug!(error = %e, "Watch stream error");
                                break;
                            }
                        },
                        _ = shutdown.recv() => {
                            let _ = child.start_kill();
                            let _ = child.wait().await;
                            debug!("Pod watcher stopped");
                            return;
                        }
                    }
                }
            }

            let _ = child.wait().await;

            if wait_or_shutdown(RECONNECT_DELAY, &mut shutdown).await {
                debug!("Pod watcher stopped");
                return;
            }
        }
    }

    async fn process_watch_line(&self, line: &str) {
        let event: WatchEvent = match serde_json::from_str(line) {
            Ok(event) => event,
            Err(_) => {
                debug!(line, "Failed to parse watch event");
                return;
            }
        };

        if let Some(job) = job_from_pod(&event.object) {
            debug!(
                event = %event.kind,
                pod = %job.pod_name,
                status = %job.status,
                "Pod event"
            );
            self.state.add_job(job).await;
        }
    }
}

/// True if the shutdown signal fired during the wait
async fn wait_or_shutdown(delay: Duration, shutdown: &mut broadcast::Receiver<()>) -> bool {
    tokio::select! {
        _ = tokio::time::sleep(delay) => false,
        _ = shutdown.recv() => true,
    }
}

/// Fold a pod object into a job entry. Pods without a name are ignored.
pub fn job_from_pod(pod: &Pod) -> Option<JobInfo> {
    if pod.metadata.name.is_empty() {
        return None;
    }

    let func_name = pod
        .metadata
        .labels
        .get(STUB_ID_LABEL)
        .cloned()
        .unwrap_or_else(|| func_name_from_pod(&pod.metadata.name));

    let start_time = parse_k8s_time(&pod.metadata.creation_timestamp);
    let mut end_time = None;
    let mut exit_code = 0;

    if let Some(terminated) = pod
        .status
        .container_statuses
        .first()
        .and_then(|cs| cs.state.terminated.as_ref())
    {
        end_time = parse_k8s_time(&terminated.finished_at);
        exit_code = terminated.exit_code;
    }

    let duration = match (start_time, end_time) {
        (Some(start), Some(end)) => (end - start).to_std().ok(),
        _ => None,
    };

    Some(JobInfo {
        pod_name: pod.metadata.name.clone(),
        task_id: String::new(),
        func_name,
        status: derive_status(pod),
        start_time,
        end_time,
        duration,
        exit_code,
    })
}

/// Map pod phase and container state to a job status.
///
/// Container state wins over phase: a terminated container is COMPLETED or
/// FAILED by exit code, a running one is RUNNING. Unknown phases fall back
/// to PENDING.
pub fn derive_status(pod: &Pod) -> JobStatus {
    if let Some(cs) = pod.status.container_statuses.first() {
        if let Some(terminated) = &cs.state.terminated {
            return if terminated.exit_code == 0 {
                JobStatus::Completed
            } else {
                JobStatus::Failed
            };
        }
        if cs.state.running.is_some() {
            return JobStatus::Running;
        }
    }

    match pod.status.phase.as_str() {
        "Pending" => JobStatus::Pending,
        "Running" => JobStatus::Running,
        "Succeeded" => JobStatus::Completed,
        "Failed" => JobStatus::Failed,
        _ => JobStatus::Pending,
    }
}

/// Extract a function name from a pod name like `worker-abc123-hello-xyz`:
/// the segments after the first two, excluding the trailing one.
pub fn func_name_from_pod(pod_name: &str) -> String {
    let parts: Vec<&str> = pod_name.split('-').collect();
    if parts.len() >= 3 {
        parts[2..parts.len() - 1].join("-")
    } else {
        pod_name.to_string()
    }
}

fn parse_k8s_time(ts: &str) -> Option<DateTime<Utc>> {
    if ts.is_empty() {
        return None;
    }
    DateTime::parse_from_rfc3339(ts)
        .ok()
        .map(|t| t.with_timezone(&Utc))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pod_json(s: &str) -> Pod {
        serde_json::from_str(s).unwrap()
    }

    #[test]
    fn test_func_name_from_pod() {
        assert_eq!(func_name_from_pod("worker-abc123-hello-xyz"), "hello");
        assert_eq!(
            func_name_from_pod("worker-abc123-hello-world-xyz"),
            "hello-world"
        );
        // Fewer than three segments: keep the whole name
        assert_eq!(func_name_from_pod("worker-abc"), "worker-abc");
        assert_eq!(func_name_from_pod("worker"), "worker");
        // Exactly three segments: middle collapses to empty
        assert_eq!(func_name_from_pod("worker-abc123-xyz"), "");
    }

    #[test]
    fn test_derive_status_terminated_wins() {
        let pod = pod_json(
            r#"{
                "metadata": {"name": "worker-a"},
                "status": {
                    "phase": "Running",
                    "containerStatuses": [
                        {"state": {"terminated": {"exitCode": 0, "finishedAt": "2024-05-01T10:00:00Z"}}}
                    ]
                }
            }"#,
        );
        assert_eq!(derive_status(&pod), JobStatus::Completed);
    }

    #[test]
    fn test_derive_status_nonzero_exit_fails() {
        let pod = pod_json(
            r#"{
                "metadata": {"name": "worker-a"},
                "status": {
                    "phase": "Running",
                    "containerStatuses": [
                        {"state": {"terminated": {"exitCode": 137, "finishedAt": ""}}}
                    ]
                }
            }"#,
        );
        assert_eq!(derive_status(&pod), JobStatus::Failed);
    }

    #[test]
    fn test_derive_status_running_container() {
        let pod = pod_json(
            r#"{
                "metadata": {"name": "worker-a"},
                "status": {
                    "phase": "Pending",
                    "containerStatuses": [
                        {"state": {"running": {"startedAt": "2024-05-01T10:00:00Z"}}}
                    ]
                }
            }"#,
        );
        assert_eq!(derive_status(&pod), JobStatus::Running);
    }

    #[test]
    fn test_derive_status_phase_fallback() {
        for (phase, expected) in [
            ("Pending", JobStatus::Pending),
            ("Running", JobStatus::Running),
            ("Succeeded", JobStatus::Completed),
            ("Failed", JobStatus::Failed),
            ("Unknown", JobStatus::Pending),
            ("", JobStatus::Pending),
        ] {
            let pod = pod_json(&format!(
                r#"{{"metadata": {{"name": "p"}}, "status": {{"phase": "{phase}"}}}}"#
            ));
            assert_eq!(derive_status(&pod), expected, "phase {phase:?}");
        }
    }

    #[test]
    fn test_job_from_pod_uses_stub_label() {
        let pod = pod_json(
            r#"{
                "metadata": {
                    "name": "worker-abc123-hello-xyz",
                    "labels": {"beta9.io/stub-id": "stub-42"},
                    "creationTimestamp": "2024-05-01T10:00:00Z"
                },
                "status": {"phase": "Running"}
            }"#,
        );

        let job = job_from_pod(&pod).unwrap();
        assert_eq!(job.func_name, "stub-42");
        assert_eq!(job.status, JobStatus::Running);
        assert!(job.start_time.is_some());
        assert!(job.end_time.is_none());
    }

    #[test]
    fn test_job_from_pod_derives_func_name_without_label() {
        let pod = pod_json(
            r#"{
                "metadata": {"name": "worker-abc123-hello-xyz"},
                "status": {"phase": "Pending"}
            }"#,
        );

        let job = job_from_pod(&pod).unwrap();
        assert_eq!(job.func_name, "hello");
    }

    #[test]
    fn test_job_from_pod_terminated_fields() {
        let pod = pod_json(
            r#"{
                "metadata": {
                    "name": "worker-abc123-hello-xyz",
                    "creationTimestamp": "2024-05-01T10:00:00Z"
                },
                "status": {
                    "phase": "Succeeded",
                    "containerStatuses": [
                        {"state": {"terminated": {"exitCode": 0, "finishedAt": "2024-05-01T10:05:30Z"}}}
                    ]
                }
            }"#,
        );

        let job = job_from_pod(&pod).unwrap();
        assert_eq!(job.status, JobStatus::Completed);
        assert_eq!(job.exit_code, 0);
        assert_eq!(job.duration, Some(Duration::from_secs(330)));
    }

    #[test]
    fn test_job_from_pod_rejects_unnamed() {
        let pod = pod_json(r#"{"metadata": {}, "status": {}}"#);
        assert!(job_from_pod(&pod).is_none());
    }

    #[test]
    fn test_watch_event_parsing_ignores_unknown_fields() {
        let event: WatchEvent = serde_json::from_str(
            r#"{
                "type": "MODIFIED",
                "object": {
                    "apiVersion": "v1",
                    "kind": "Pod",
                    "metadata": {"name": "worker-a", "uid": "ignored"},
                    "status": {"phase": "Running", "hostIP": "ignored"}
                }
            }"#,
        )
        .unwrap();

        assert_eq!(event.kind, "MODIFIED");
        assert_eq!(event.object.metadata.name, "worker-a");
    }

    #[test]
    fn test_malformed_watch_line_does_not_panic() {
        assert!(serde_json::from_str::<WatchEvent>("not json").is_err());
    }

    #[tokio::test]
    async fn test_watch_events_fold_into_state() {
        let state = AgentState::new("abcdef01", "external", "gw");
        let watcher = PodWatcher::new(state.clone());

        watcher
            .process_watch_line(
                r#"{"type":"ADDED","object":{"metadata":{"name":"worker-a"},"status":{"phase":"Running"}}}"#,
            )
            .await;

        let snapshot = state.snapshot().await;
        assert_eq!(snapshot.running_jobs, 1);
        assert_eq!(snapshot.jobs[0].pod_name, "worker-a");

        watcher
            .process_watch_line(
                r#"{"type":"MODIFIED","object":{"metadata":{"name":"worker-a"},"status":{"phase":"Running","containerStatuses":[{"state":{"terminated":{"exitCode":0,"finishedAt":"2024-05-01T10:05:30Z"}}}]}}}"#,
            )
            .await;

        let snapshot = state.snapshot().await;
        assert_eq!(snapshot.running_jobs, 0);
        assert_eq!(snapshot.jobs.len(), 1);
        assert_eq!(snapshot.jobs[0].status, JobStatus::Completed);
    }
}
