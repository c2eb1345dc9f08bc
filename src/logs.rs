//! Sync log inspection: liveness sampling, size policy and log maintenance.
use std::{
    fs::{self, File, OpenOptions},
    io::{self, Read, Write},
    path::Path,
    time::{Duration, SystemTime, UNIX_EPOCH},
};

use chrono::{DateTime, Local};
use tracing::{debug, warn};

use crate::{
    error::SyncError,
    sync_point::{SyncPoint, SyncPointId},
};

/// Snapshot of a sync log taken at one heartbeat tick.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LivenessSample {
    pub point: SyncPointId,
    /// Modification time of the log; `None` when the file does not exist.
    pub log_mtime: Option<SystemTime>,
    pub log_size_lines: u64,
    pub sampled_at: SystemTime,
}

impl LivenessSample {
    /// Time since the last log write, or `None` when there is no log yet.
    ///
    /// A modification time in the future counts as zero age.
    pub fn log_age(&self) -> Option<Duration> {
        self.log_mtime.map(|mtime| {
            self.sampled_at
                .duration_since(mtime)
                .unwrap_or(Duration::ZERO)
        })
    }

    /// Whether the log was written after `baseline` (the mtime observed right after start).
    pub fn changed_since(&self, baseline: Option<SystemTime>) -> bool {
        match (self.log_mtime, baseline) {
            (Some(current), Some(baseline)) => current > baseline,
            (Some(_), None) => true,
            (None, _) => false,
        }
    }
}

/// Inspects sync logs and applies the staleness and size policies.
#[derive(Debug, Clone)]
pub struct LogMonitor {
    stale_multiplier: u32,
    startup_grace: Duration,
    heartbeat_file: Option<String>,
}

impl LogMonitor {
    pub fn new(
        stale_multiplier: u32,
        startup_grace: Duration,
        heartbeat_file: Option<String>,
    ) -> Self {
        Self {
            stale_multiplier,
            startup_grace,
            heartbeat_file,
        }
    }

    pub fn startup_grace(&self) -> Duration {
        self.startup_grace
    }

    /// Reads metadata and the line count of the point's log.
    ///
    /// A missing file yields an absent mtime and zero lines.
    pub fn sample(
        &self,
        point: &SyncPoint,
        now: SystemTime,
    ) -> Result<LivenessSample, SyncError> {
        let path = point.log_path();
        let log_access = |source: io::Error| SyncError::LogAccess {
            path: path.to_path_buf(),
            source,
        };

        let (log_mtime, log_size_lines) = match fs::metadata(path) {
            Ok(meta) => {
                let mtime = meta.modified().map_err(log_access)?;
                match count_lines(path) {
                    Ok(lines) => (Some(mtime), lines),
                    // Deleted between stat and open.
                    Err(err) if err.kind() == io::ErrorKind::NotFound => (None, 0),
                    Err(err) => return Err(log_access(err)),
                }
            }
            Err(err) if err.kind() == io::ErrorKind::NotFound => (None, 0),
            Err(err) => return Err(log_access(err)),
        };

        Ok(LivenessSample {
            point: point.id().clone(),
            log_mtime,
            log_size_lines,
            sampled_at: now,
        })
    }

    /// Decides whether the log has gone quiet for too long.
    ///
    /// `anchor` is the moment a first write became expected: the later of the process start
    /// and the last log reset. Without a log, the point is stale once the startup grace past
    /// the anchor has elapsed. With a log, it is stale once its age exceeds
    /// `K * heartbeat_interval`.
    pub fn is_stale(
        &self,
        sample: &LivenessSample,
        anchor: SystemTime,
        heartbeat_interval: Duration,
    ) -> bool {
        match sample.log_age() {
            Some(age) => age > heartbeat_interval * self.stale_multiplier,
            None => self.grace_elapsed(anchor, sample.sampled_at),
        }
    }

    /// True once strictly more than the startup grace has passed since `anchor`.
    pub fn grace_elapsed(&self, anchor: SystemTime, now: SystemTime) -> bool {
        now.duration_since(anchor).unwrap_or(Duration::ZERO) > self.startup_grace
    }

    /// True when the log holds more than `max_lines` lines.
    pub fn exceeds_size(&self, sample: &LivenessSample, max_lines: u64) -> bool {
        sample.log_size_lines > max_lines
    }

    /// Deletes the point's log. The sync process keeps running and recreates it on its next write.
    pub fn reset_log(&self, point: &SyncPoint) -> Result<(), SyncError> {
        match fs::remove_file(point.log_path()) {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(source) => Err(SyncError::LogAccess {
                path: point.log_path().to_path_buf(),
                source,
            }),
        }
    }

    /// Rewrites the heartbeat file in the local directory so a healthy sync has work to log.
    pub fn write_heartbeat(&self, point: &SyncPoint, now: SystemTime) {
        let Some(name) = &self.heartbeat_file else {
            return;
        };

        let path = point.local_dir().join(name);
        let stamp = now
            .duration_since(UNIX_EPOCH)
            .map(|elapsed| elapsed.as_secs_f64())
            .unwrap_or_default();
        match fs::write(&path, format!("{stamp:.3}")) {
            Ok(()) => debug!("Wrote heartbeat {:?} for '{}'", path, point.id()),
            Err(err) => warn!("Failed to write heartbeat {:?}: {err}", path),
        }
    }

    /// Appends a timestamped restart note to the point's log.
    pub fn note_restart(
        &self,
        point: &SyncPoint,
        reason: &str,
        now: SystemTime,
    ) -> Result<(), SyncError> {
        let timestamp = DateTime::<Local>::from(now).format("%Y-%m-%d %H:%M:%S");
        let line = format!("\n[{timestamp}] RESTART: {} - {reason}\n", point.ssh_host());
        append_to_log(point.log_path(), line.as_bytes()).map_err(|source| {
            SyncError::LogAccess {
                path: point.log_path().to_path_buf(),
                source,
            }
        })
    }
}

/// Counts newline-terminated lines, plus a trailing unterminated one.
pub fn count_lines(path: &Path) -> io::Result<u64> {
    let mut file = File::open(path)?;
    let mut buffer = [0u8; 64 * 1024];
    let mut lines = 0u64;
    let mut last = None;

    loop {
        let read = file.read(&mut buffer)?;
        if read == 0 {
            break;
        }
        lines += buffer[..read].iter().filter(|&&b| b == b'\n').count() as u64;
        last = Some(buffer[read - 1]);
    }

    if matches!(last, Some(byte) if byte != b'\n') {
        lines += 1;
    }
    Ok(lines)
}

/// Opens the log in append mode (creating it when missing) and writes `bytes`.
pub fn append_to_log(path: &Path, bytes: &[u8]) -> io::Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    let mut file = OpenOptions::new().create(true).append(true).open(path)?;
    file.write_all(bytes)
}
