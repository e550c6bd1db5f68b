//! Observability infrastructure
//!
//! Prometheus gauges and counters for the keepalive loop and job list,
//! exposed through the control server's `/metrics` endpoint.

use prometheus::{register_int_counter, register_int_gauge, IntCounter, IntGauge};
use std::sync::OnceLock;

/// Global metrics instance (registered once)
static GLOBAL_METRICS: OnceLock<AgentMetricsInner> = OnceLock::new();

struct AgentMetricsInner {
    keepalives_sent: IntCounter,
    keepalive_failures: IntCounter,
    consecutive_failures: IntGauge,
    running_jobs: IntGauge,
    jobs_total: IntGauge,
}

impl AgentMetricsInner {
    fn new() -> Self {
        Self {
            keepalives_sent: register_int_counter!(
                "b9agent_keepalives_sent_total",
                "Total keepalive requests attempted"
            )
            .expect("Failed to register keepalives_sent_total"),

            keepalive_failures: register_int_counter!(
                "b9agent_keepalive_failures_total",
                "Total keepalive requests that failed"
            )
            .expect("Failed to register keepalive_failures_total"),

            consecutive_failures: register_int_gauge!(
                "b9agent_keepalive_consecutive_failures",
                "Consecutive keepalive failures since the last success"
            )
            .expect("Failed to register keepalive_consecutive_failures"),

            running_jobs: register_int_gauge!(
                "b9agent_running_jobs",
                "Workload pods currently pending or running"
            )
            .expect("Failed to register running_jobs"),

            jobs_total: register_int_gauge!(
                "b9agent_jobs_total",
                "Workload pods currently tracked"
            )
            .expect("Failed to register jobs_total"),
        }
    }
}

/// Lightweight handle to the process-global agent metrics.
///
/// Multiple clones share the same underlying Prometheus collectors.
#[derive(Clone)]
pub struct AgentMetrics {
    _private: (),
}

impl Default for AgentMetrics {
    fn default() -> Self {
        Self::new()
    }
}

impl AgentMetrics {
    pub fn new() -> Self {
        GLOBAL_METRICS.get_or_init(AgentMetricsInner::new);
        Self { _private: () }
    }

    fn inner(&self) -> &AgentMetricsInner {
        GLOBAL_METRICS.get().expect("Metrics not initialized")
    }

    pub fn inc_keepalives_sent(&self) {
        self.inner().keepalives_sent.inc();
    }

    pub fn inc_keepalive_failures(&self) {
        self.inner().keepalive_failures.inc();
    }

    pub fn set_consecutive_failures(&self, count: u32) {
        self.inner().consecutive_failures.set(count as i64);
    }

    pub fn set_job_counts(&self, running: usize, total: usize) {
        self.inner().running_jobs.set(running as i64);
        self.inner().jobs_total.set(total as i64);
    }
}
