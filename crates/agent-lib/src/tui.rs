//! Terminal dashboard
//!
//! Single-threaded renderer that paints the agent state into a fixed
//! 80-column box frame. Uses the alternate screen buffer and redraws by
//! moving the cursor home and overwriting, so steady-state refreshes never
//! flicker with a full-screen clear.

use crate::state::{AgentStatus, InferenceState, JobInfo, JobStatus, StateSnapshot};
use chrono::Utc;
use std::io::Write;
use std::time::Duration;

// ANSI color codes
const COLOR_RESET: &str = "\x1b[0m";
const COLOR_RED: &str = "\x1b[31m";
const COLOR_GREEN: &str = "\x1b[32m";
const COLOR_YELLOW: &str = "\x1b[33m";
const COLOR_BLUE: &str = "\x1b[34m";
const COLOR_CYAN: &str = "\x1b[36m";
const COLOR_WHITE: &str = "\x1b[37m";
const COLOR_BOLD: &str = "\x1b[1m";
const COLOR_DIM: &str = "\x1b[2m";

// ANSI screen control codes
const ENTER_ALT_SCREEN: &str = "\x1b[?1049h";
const EXIT_ALT_SCREEN: &str = "\x1b[?1049l";
const CLEAR_SCREEN: &str = "\x1b[2J";
const MOVE_CURSOR_HOME: &str = "\x1b[H";
const HIDE_CURSOR: &str = "\x1b[?25l";
const SHOW_CURSOR: &str = "\x1b[?25h";
const CLEAR_TO_END: &str = "\x1b[J";

// Box drawing characters
const BOX_TOP_LEFT: &str = "╔";
const BOX_TOP_RIGHT: &str = "╗";
const BOX_BOTTOM_LEFT: &str = "╚";
const BOX_BOTTOM_RIGHT: &str = "╝";
const BOX_HORIZONTAL: &str = "═";
const BOX_VERTICAL: &str = "║";
const BOX_MID_LEFT: &str = "╠";
const BOX_MID_RIGHT: &str = "╣";
const BOX_MID_HORIZ: &str = "╟";
const BOX_MID_VERT: &str = "─";

const MAX_VISIBLE_JOBS: usize = 5;

/// Terminal dashboard renderer
pub struct Dashboard {
    width: usize,
}

impl Default for Dashboard {
    fn default() -> Self {
        Self::new()
    }
}

impl Dashboard {
    pub fn new() -> Self {
        Self { width: 80 }
    }

    /// Switch to the alternate screen buffer and clear once
    pub fn enter_full_screen(&self) {
        let mut out = std::io::stdout();
        let _ = write!(
            out,
            "{ENTER_ALT_SCREEN}{HIDE_CURSOR}{CLEAR_SCREEN}{MOVE_CURSOR_HOME}"
        );
        let _ = out.flush();
    }

    /// Restore the original screen buffer
    pub fn exit_full_screen(&self) {
        let mut out = std::io::stdout();
        let _ = write!(out, "{SHOW_CURSOR}{EXIT_ALT_SCREEN}");
        let _ = out.flush();
    }

    /// Paint one frame: cursor home, overwrite, clear leftovers
    pub fn draw(&self, snapshot: &StateSnapshot) {
        let frame = self.render(snapshot);
        let mut out = std::io::stdout();
        let _ = write!(out, "{MOVE_CURSOR_HOME}{frame}{CLEAR_TO_END}");
        let _ = out.flush();
    }

    /// Render the snapshot into a complete frame string
    pub fn render(&self, snapshot: &StateSnapshot) -> String {
        let mut frame = String::new();

        frame.push_str(&self.render_line(
            BOX_TOP_LEFT,
            &format!(" b9agent: {} ", snapshot.machine_id),
            BOX_TOP_RIGHT,
        ));

        let status_color = status_color(snapshot.status);
        frame.push_str(&self.render_line(
            BOX_VERTICAL,
            &format!(
                " Status: {status_color}{}{COLOR_RESET} │ Gateway: {} │ Pool: {} │ Uptime: {} ",
                snapshot.status,
                snapshot.gateway,
                snapshot.pool_name,
                format_duration(snapshot.uptime()),
            ),
            BOX_VERTICAL,
        ));

        let heartbeat_ago = match snapshot.last_heartbeat {
            Some(_) => format!("{} ago", format_duration(snapshot.time_since_heartbeat())),
            None => "never".to_string(),
        };
        frame.push_str(&self.render_line(
            BOX_VERTICAL,
            &format!(
                " CPU: {:.1}% │ Memory: {:.1}% │ GPUs: {} │ Last Heartbeat: {} ",
                snapshot.cpu_percent, snapshot.memory_percent, snapshot.gpu_count, heartbeat_ago,
            ),
            BOX_VERTICAL,
        ));

        frame.push_str(&self.render_line(BOX_MID_LEFT, "", BOX_MID_RIGHT));
        frame.push_str(&self.render_line(BOX_VERTICAL, " WORKER PODS ", BOX_VERTICAL));
        frame.push_str(&self.render_line(BOX_MID_HORIZ, "", BOX_MID_HORIZ));

        if snapshot.jobs.is_empty() {
            frame.push_str(&self.render_line(
                BOX_VERTICAL,
                &format!(" {COLOR_DIM}No jobs yet{COLOR_RESET} "),
                BOX_VERTICAL,
            ));
        } else {
            for (i, job) in snapshot.jobs.iter().enumerate() {
                if i >= MAX_VISIBLE_JOBS {
                    frame.push_str(&self.render_line(
                        BOX_VERTICAL,
                        &format!(
                            " {COLOR_DIM}... and {} more{COLOR_RESET} ",
                            snapshot.jobs.len() - MAX_VISIBLE_JOBS
                        ),
                        BOX_VERTICAL,
                    ));
                    break;
                }
                frame.push_str(&self.render_line(BOX_VERTICAL, &format_job(job), BOX_VERTICAL));
            }
        }

        frame.push_str(&self.render_line(BOX_MID_LEFT, "", BOX_MID_RIGHT));
        frame.push_str(&self.render_line(BOX_VERTICAL, " INFERENCE ", BOX_VERTICAL));
        frame.push_str(&self.render_line(BOX_MID_HORIZ, "", BOX_MID_HORIZ));

        let inference_color = inference_status_color(snapshot.inference_status);
        if snapshot.inference_status == InferenceState::Stopped {
            frame.push_str(&self.render_line(
                BOX_VERTICAL,
                &format!(
                    " Status: {inference_color}{}{COLOR_RESET} │ Waiting for start command ",
                    snapshot.inference_status,
                ),
                BOX_VERTICAL,
            ));
        } else {
            let endpoint = if snapshot.inference_ip.is_empty() {
                "not configured".to_string()
            } else {
                format!("{}:{}", snapshot.inference_ip, snapshot.inference_port)
            };
            frame.push_str(&self.render_line(
                BOX_VERTICAL,
                &format!(
                    " Status: {inference_color}{}{COLOR_RESET} │ Endpoint: {} ",
                    snapshot.inference_status, endpoint,
                ),
                BOX_VERTICAL,
            ));
        }

        if !snapshot.inference_models.is_empty() {
            let models = truncate(&snapshot.inference_models.join(", "), 50);
            frame.push_str(&self.render_line(
                BOX_VERTICAL,
                &format!(" Models: {models} "),
                BOX_VERTICAL,
            ));
        }

        frame.push_str(&self.render_line(BOX_MID_LEFT, "", BOX_MID_RIGHT));
        frame.push_str(&self.render_line(BOX_VERTICAL, " LOGS ", BOX_VERTICAL));
        frame.push_str(&self.render_line(BOX_MID_HORIZ, "", BOX_MID_HORIZ));

        if snapshot.logs.is_empty() {
            frame.push_str(&self.render_line(
                BOX_VERTICAL,
                &format!(" {COLOR_DIM}No recent logs{COLOR_RESET} "),
                BOX_VERTICAL,
            ));
        } else {
            for log_line in &snapshot.logs {
                frame.push_str(&self.render_line(
                    BOX_VERTICAL,
                    &format!(" {COLOR_DIM}{log_line}{COLOR_RESET} "),
                    BOX_VERTICAL,
                ));
            }
        }

        frame.push_str(&self.render_line(BOX_BOTTOM_LEFT, "", BOX_BOTTOM_RIGHT));
        frame.push_str(&format!("{COLOR_DIM}Press Ctrl+C to quit{COLOR_RESET}\n"));

        frame
    }

    /// Render one line padded to the frame width
    fn render_line(&self, left: &str, content: &str, right: &str) -> String {
        let visible = strip_ansi(content).chars().count();
        let padding = self.width.saturating_sub(visible + 2);

        let fill = match left {
            BOX_TOP_LEFT | BOX_BOTTOM_LEFT | BOX_MID_LEFT => BOX_HORIZONTAL,
            BOX_MID_HORIZ => BOX_MID_VERT,
            _ => " ",
        };

        format!("{left}{content}{}{right}\n", fill.repeat(padding))
    }
}

fn status_color(status: AgentStatus) -> String {
    let color = match status {
        AgentStatus::Ready => COLOR_GREEN,
        AgentStatus::Busy => COLOR_YELLOW,
        AgentStatus::Unhealthy | AgentStatus::Error => COLOR_RED,
        AgentStatus::Starting | AgentStatus::Registering | AgentStatus::Registered => COLOR_CYAN,
    };
    format!("{color}{COLOR_BOLD}")
}

fn inference_status_color(status: InferenceState) -> &'static str {
    match status {
        InferenceState::Running => COLOR_GREEN,
        InferenceState::Starting => COLOR_YELLOW,
        InferenceState::Stopped => COLOR_DIM,
        InferenceState::Error => COLOR_RED,
    }
}

fn job_status_color(status: JobStatus) -> &'static str {
    match status {
        JobStatus::Running => COLOR_GREEN,
        JobStatus::Completed => COLOR_BLUE,
        JobStatus::Failed => COLOR_RED,
        JobStatus::Pending => COLOR_YELLOW,
    }
}

/// Format a duration for display ("42s", "3m 12s", "2h 5m")
pub fn format_duration(d: Duration) -> String {
    if d < Duration::from_secs(1) {
        return format!("{}ms", d.as_millis());
    }
    let secs = d.as_secs();
    if secs < 60 {
        return format!("{secs}s");
    }
    if secs < 3600 {
        return format!("{}m {}s", secs / 60, secs % 60);
    }
    format!("{}h {}m", secs / 3600, (secs % 3600) / 60)
}

fn format_job(job: &JobInfo) -> String {
    let color = job_status_color(job.status);

    let duration = job.duration.unwrap_or_else(|| match job.start_time {
        Some(start) => {
            let end = job.end_time.unwrap_or_else(Utc::now);
            (end - start).to_std().unwrap_or_default()
        }
        None => Duration::ZERO,
    });

    let age = match (job.status, job.end_time) {
        (JobStatus::Completed | JobStatus::Failed, Some(end)) => {
            let since = (Utc::now() - end).to_std().unwrap_or_default();
            format!(" ({} ago)", format_duration(since))
        }
        _ => String::new(),
    };

    format!(
        " {:<15} {color}{:<10}{COLOR_RESET} {:<25} {:>8}{age} ",
        truncate(&job.pod_name, 15),
        job.status.to_string(),
        truncate(&job.func_name, 25),
        format_duration(duration),
    )
}

/// Truncate to a maximum char count, ending in "..." when cut
pub fn truncate(s: &str, max_len: usize) -> String {
    if s.chars().count() <= max_len {
        return s.to_string();
    }
    let head: String = s.chars().take(max_len.saturating_sub(3)).collect();
    format!("{head}...")
}

/// Remove ANSI escape sequences for width calculations
pub fn strip_ansi(s: &str) -> String {
    let mut result = String::with_capacity(s.len());
    let mut chars = s.chars().peekable();

    while let Some(c) = chars.next() {
        if c == '\x1b' && chars.peek() == Some(&'[') {
            chars.next();
            for c in chars.by_ref() {
                if c.is_ascii_alphabetic() {
                    break;
                }
            }
        } else {
            result.push(c);
        }
    }

    result
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::AgentState;

    async fn snapshot() -> StateSnapshot {
        let state = AgentState::new("abcdef01", "external", "localhost:1994");
        state.snapshot().await
    }

    #[test]
    fn test_format_duration() {
        assert_eq!(format_duration(Duration::from_millis(250)), "250ms");
        assert_eq!(format_duration(Duration::from_secs(42)), "42s");
        assert_eq!(format_duration(Duration::from_secs(192)), "3m 12s");
        assert_eq!(format_duration(Duration::from_secs(7500)), "2h 5m");
    }

    #[test]
    fn test_truncate() {
        assert_eq!(truncate("short", 15), "short");
        assert_eq!(truncate("exactly-15-char", 15), "exactly-15-char");
        assert_eq!(truncate("a-very-long-pod-name-here", 15), "a-very-long-...");
        assert_eq!(truncate("a-very-long-pod-name-here", 15).chars().count(), 15);
    }

    #[test]
    fn test_strip_ansi() {
        assert_eq!(strip_ansi("plain"), "plain");
        assert_eq!(strip_ansi("\x1b[32mgreen\x1b[0m"), "green");
        assert_eq!(strip_ansi("\x1b[1m\x1b[31mbold red\x1b[0m!"), "bold red!");
    }

    #[tokio::test]
    async fn test_render_lines_are_uniform_width() {
        let dashboard = Dashboard::new();
        let frame = dashboard.render(&snapshot().await);

        for line in frame.lines() {
            let visible = strip_ansi(line).chars().count();
            // The footer hint is the only line not boxed to the frame width
            if line.contains("Ctrl+C") {
                continue;
            }
            assert_eq!(visible, 80, "line not 80 cols: {line:?}");
        }
    }

    #[tokio::test]
    async fn test_render_includes_identity_and_placeholders() {
        let dashboard = Dashboard::new();
        let frame = dashboard.render(&snapshot().await);

        assert!(frame.contains("abcdef01"));
        assert!(frame.contains("external"));
        assert!(frame.contains("STARTING"));
        assert!(frame.contains("No jobs yet"));
        assert!(frame.contains("No recent logs"));
        assert!(frame.contains("Waiting for start command"));
    }

    #[tokio::test]
    async fn test_render_shows_jobs_and_overflow() {
        let state = AgentState::new("abcdef01", "external", "gw");
        for i in 0..8 {
            state
                .add_job(JobInfo::new(format!("worker-{i}"), JobStatus::Running))
                .await;
        }

        let dashboard = Dashboard::new();
        let frame = dashboard.render(&state.snapshot().await);

        assert!(frame.contains("worker-7"));
        assert!(frame.contains("... and 3 more"));
    }

    #[tokio::test]
    async fn test_render_shows_models_line() {
        let state = AgentState::new("abcdef01", "external", "gw");
        state
            .update_inference(
                InferenceState::Running,
                "100.72.101.23",
                11434,
                &["llama3".to_string(), "phi3".to_string()],
            )
            .await;

        let dashboard = Dashboard::new();
        let frame = dashboard.render(&state.snapshot().await);

        assert!(frame.contains("100.72.101.23:11434"));
        assert!(frame.contains("llama3, phi3"));
    }
}
