//! Host metrics and address detection
//!
//! Collects the machine metrics reported on every keepalive, plus the
//! CPU/memory strings and addresses used at registration time.

use serde::Serialize;
use sysinfo::{Disks, System};
use tokio::net::UdpSocket;
use tokio::process::Command;

/// Machine metrics reported to the control plane.
///
/// Refreshed whole per keepalive tick, never partially updated. Cache and
/// worker/container counters default to zero on this agent.
#[derive(Debug, Clone, Default, Serialize)]
pub struct MachineMetrics {
    pub total_cpu_available: u64,
    pub total_memory_available: u64,
    pub total_disk_space_bytes: u64,
    pub cpu_utilization_pct: f64,
    pub memory_utilization_pct: f64,
    pub total_disk_free_bytes: u64,
    pub worker_count: u32,
    pub container_count: u32,
    pub free_gpu_count: u32,
    pub cache_usage_pct: f64,
    pub cache_capacity: u64,
    pub cache_memory_usage: u64,
    pub cache_cpu_usage: f64,
}

/// Gather current system metrics.
///
/// CPU utilization is sampled over a short interval; the call blocks the
/// task for roughly `sysinfo::MINIMUM_CPU_UPDATE_INTERVAL`.
pub async fn collect_metrics() -> MachineMetrics {
    let mut sys = System::new();

    sys.refresh_cpu_usage();
    tokio::time::sleep(sysinfo::MINIMUM_CPU_UPDATE_INTERVAL).await;
    sys.refresh_cpu_usage();
    sys.refresh_memory();

    let cpu_count = sys.cpus().len().max(1) as u64;
    let cpu_pct = sys.global_cpu_usage() as f64;

    let total_mem = sys.total_memory();
    let mem_pct = if total_mem > 0 {
        sys.used_memory() as f64 / total_mem as f64 * 100.0
    } else {
        0.0
    };

    let disks = Disks::new_with_refreshed_list();
    let (disk_total, disk_free) = disks
        .iter()
        .fold((0u64, 0u64), |(total, free), disk| {
            (total + disk.total_space(), free + disk.available_space())
        });

    MachineMetrics {
        total_cpu_available: cpu_count * 1000, // millicores
        total_memory_available: total_mem,
        total_disk_space_bytes: disk_total,
        cpu_utilization_pct: cpu_pct,
        memory_utilization_pct: mem_pct,
        total_disk_free_bytes: disk_free,
        free_gpu_count: detect_gpu_count().await,
        ..MachineMetrics::default()
    }
}

/// Count NVIDIA GPUs via `nvidia-smi`; zero when the tool is absent
pub async fn detect_gpu_count() -> u32 {
    let output = Command::new("nvidia-smi")
        .args(["--query-gpu=name", "--format=csv,noheader"])
        .output()
        .await;

    match output {
        Ok(out) if out.status.success() => String::from_utf8_lossy(&out.stdout)
            .lines()
            .filter(|line| !line.trim().is_empty())
            .count() as u32,
        _ => 0,
    }
}

/// CPU capacity in the control plane's format (e.g. "8000m")
pub fn cpu_string() -> String {
    let mut sys = System::new();
    sys.refresh_cpu_list(sysinfo::CpuRefreshKind::nothing());
    let count = sys.cpus().len().max(1);
    format!("{}m", count * 1000)
}

/// Memory capacity in the control plane's format (e.g. "16Gi")
pub fn memory_string() -> String {
    let mut sys = System::new();
    sys.refresh_memory();
    let gi = sys.total_memory() / (1024 * 1024 * 1024);
    format!("{gi}Gi")
}

/// First non-loopback IPv4 address of this host.
///
/// Uses the outbound-socket trick: no packets are sent, the OS just picks
/// the source address it would route through.
pub async fn private_ip() -> String {
    async fn probe() -> Option<String> {
        let socket = UdpSocket::bind("0.0.0.0:0").await.ok()?;
        socket.connect("8.8.8.8:80").await.ok()?;
        let addr = socket.local_addr().ok()?;
        match addr.ip() {
            std::net::IpAddr::V4(ip) if !ip.is_loopback() => Some(ip.to_string()),
            _ => None,
        }
    }

    probe().await.unwrap_or_else(|| "127.0.0.1".to_string())
}

/// Detect the overlay-VPN address used to advertise this machine.
///
/// Tries the `TAILSCALE_IP` environment variable first, then the
/// `tailscale ip -4` command.
pub async fn detect_mesh_ip() -> Option<String> {
    if let Ok(ip) = std::env::var("TAILSCALE_IP") {
        if !ip.is_empty() {
            return Some(ip);
        }
    }

    let output = Command::new("tailscale").args(["ip", "-4"]).output().await;
    match output {
        Ok(out) if out.status.success() => {
            let ip = String::from_utf8_lossy(&out.stdout).trim().to_string();
            (!ip.is_empty()).then_some(ip)
        }
        _ => None,
    }
}
