//! Status reporting from the state record.
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::warn;

use crate::{
    config::Settings,
    daemon::{DaemonState, DaemonStatus, SyncPointReport},
};

const GREEN_BOLD: &str = "\x1b[1;32m";
const RED_BOLD: &str = "\x1b[1;31m";
const MAGENTA_BOLD: &str = "\x1b[1;35m";
const YELLOW_BOLD: &str = "\x1b[1;33m";
const RESET: &str = "\x1b[0m";

/// Shown for configured sync points the running daemon has not reported.
pub const UNKNOWN_STATE: &str = "UNKNOWN";

/// Machine-readable status of the supervisor and every configured sync point.
#[derive(Debug, Clone, Serialize)]
pub struct StatusReport {
    pub status: DaemonStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pid: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub updated_at: Option<DateTime<Utc>>,
    /// The record has not been refreshed within the staleness threshold.
    pub record_stale: bool,
    pub sync_points: Vec<PointRow>,
}

/// One configured sync point as reported by `status`.
#[derive(Debug, Clone, Serialize)]
pub struct PointRow {
    pub id: String,
    pub local_dir: String,
    pub ssh: String,
    pub remote_dir: String,
    pub state: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pid: Option<u32>,
    pub restarts: u32,
    /// Seconds since the most recent liveness sample.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sample_age_secs: Option<u64>,
    /// Seconds between the last log write and that sample.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub log_age_secs: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub log_lines: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
}

impl StatusReport {
    /// Reads the state record and merges it with the configured sync points.
    ///
    /// Never fails: a missing or unreadable record reports the supervisor as stopped.
    pub fn collect(settings: &Settings, now: DateTime<Utc>) -> Self {
        let record = match DaemonState::load(&settings.state_path()) {
            Ok(record) => record,
            Err(err) => {
                warn!("Unable to read state record: {err}");
                None
            }
        };
        let lock_path = settings.lock_path();
        let live = record.filter(|record| record.is_live(&lock_path));
        Self::from_record(settings, live, now)
    }

    /// Builds the report from an already validated live record (or none).
    pub fn from_record(
        settings: &Settings,
        record: Option<DaemonState>,
        now: DateTime<Utc>,
    ) -> Self {
        let running = record.is_some();
        let sync_points = settings
            .sync_points
            .iter()
            .map(|point| {
                let report = record
                    .as_ref()
                    .and_then(|record| record.sync_points.get(point.id()));
                let mut row = PointRow {
                    id: point.id().to_string(),
                    local_dir: point.local_dir().display().to_string(),
                    ssh: point.ssh_host().to_string(),
                    remote_dir: point.remote_dir().to_string(),
                    state: if running { UNKNOWN_STATE } else { "STOPPED" }.to_string(),
                    pid: None,
                    restarts: 0,
                    sample_age_secs: None,
                    log_age_secs: None,
                    log_lines: None,
                    last_error: None,
                };
                if let Some(report) = report {
                    fill_row(&mut row, report, now);
                }
                row
            })
            .collect();

        let record_stale = record.as_ref().is_some_and(|record| {
            elapsed_secs(record.updated_at, now) > settings.stale_threshold().as_secs()
        });

        Self {
            status: if running {
                DaemonStatus::Running
            } else {
                DaemonStatus::Stopped
            },
            pid: record.as_ref().map(|record| record.pid),
            updated_at: record.as_ref().map(|record| record.updated_at),
            record_stale,
            sync_points,
        }
    }

    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string_pretty(self)
    }

    /// Renders the human-readable table.
    pub fn render(&self, color: bool, now: DateTime<Utc>) -> String {
        let paint = |code: &str, text: &str| {
            if color {
                format!("{code}{text}{RESET}")
            } else {
                text.to_string()
            }
        };

        let mut out = match (self.status, self.pid) {
            (DaemonStatus::Running, Some(pid)) => {
                let age = self
                    .updated_at
                    .map(|at| format_elapsed(elapsed_secs(at, now)))
                    .unwrap_or_else(|| "never".into());
                let mut line = format!(
                    "syncbeat: {} (PID {pid}), updated {age}",
                    paint(GREEN_BOLD, "running")
                );
                if self.record_stale {
                    line.push_str(&format!(" {}", paint(YELLOW_BOLD, "[stale]")));
                }
                line
            }
            _ => format!("syncbeat: {}", paint(MAGENTA_BOLD, "stopped")),
        };
        out.push('\n');

        if self.sync_points.is_empty() {
            out.push_str("No sync points configured.\n");
            return out;
        }

        let target_width = self
            .sync_points
            .iter()
            .map(|row| row.target().len())
            .max()
            .unwrap_or(0)
            .max("SYNC POINT".len());

        out.push_str(&format!(
            "\n{:<target_width$}  {:<8}  {:>7}  {:>8}  {:<14}  {:>5}  ERROR\n",
            "SYNC POINT", "STATE", "PID", "RESTARTS", "LAST WRITE", "LINES"
        ));
        for row in &self.sync_points {
            let state = format!("{:<8}", row.state);
            let state = paint(state_color(&row.state), &state);
            let pid = row.pid.map(|pid| pid.to_string()).unwrap_or("-".into());
            let last_write = match (row.sample_age_secs, row.log_age_secs) {
                (Some(sample), Some(log)) => format_elapsed(sample + log),
                (Some(_), None) => "no log".into(),
                _ => "-".into(),
            };
            let lines = row
                .log_lines
                .map(|lines| lines.to_string())
                .unwrap_or("-".into());
            let error = row.last_error.as_deref().unwrap_or("");

            out.push_str(&format!(
                "{:<target_width$}  {state}  {pid:>7}  {:>8}  {last_write:<14}  {lines:>5}  {error}\n",
                row.target(),
                row.restarts,
            ));
        }
        out
    }
}

impl PointRow {
    fn target(&self) -> String {
        format!("{}:{}", self.ssh, self.remote_dir)
    }
}

fn fill_row(row: &mut PointRow, report: &SyncPointReport, now: DateTime<Utc>) {
    row.state = report.state.to_string();
    row.pid = report.pid;
    row.restarts = report.restarts;
    row.last_error = report.last_error.clone();
    if let Some(sample) = &report.last_sample {
        row.sample_age_secs = Some(elapsed_secs(sample.sampled_at, now));
        row.log_age_secs = sample
            .log_mtime
            .map(|mtime| elapsed_secs(mtime, sample.sampled_at));
        row.log_lines = Some(sample.log_lines);
    }
}

fn state_color(state: &str) -> &'static str {
    match state {
        "HEALTHY" => GREEN_BOLD,
        "STARTING" => YELLOW_BOLD,
        "STUCK" => RED_BOLD,
        _ => MAGENTA_BOLD,
    }
}

/// Whole seconds from `from` to `to`, clamped at zero.
fn elapsed_secs(from: DateTime<Utc>, to: DateTime<Utc>) -> u64 {
    to.signed_duration_since(from)
        .to_std()
        .unwrap_or(Duration::ZERO)
        .as_secs()
}

fn format_elapsed(total_seconds: u64) -> String {
    match total_seconds {
        0..=59 => format!("{total_seconds} secs ago"),
        60..=3_599 => format!("{} mins ago", total_seconds / 60),
        3_600..=86_399 => format!("{} hours ago", total_seconds / 3_600),
        _ => format!("{} days ago", total_seconds / 86_400),
    }
}
