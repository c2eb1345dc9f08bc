//! Heartbeat controller: per-tick liveness evaluation and selective restarts.
use std::{
    collections::HashMap,
    fmt, fs,
    time::{Duration, SystemTime},
};

use serde::{Deserialize, Serialize};
use strum_macros::{AsRefStr, Display, EnumString};
use tracing::{debug, info, warn};

use crate::{
    config::Settings,
    logs::{LivenessSample, LogMonitor},
    process::{ProcessBackend, SyncProcessManager},
    sync_point::{SyncPoint, SyncPointId},
};

/// Supervision state of a single sync point.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Display, AsRefStr, EnumString,
)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
#[strum(serialize_all = "SCREAMING_SNAKE_CASE")]
pub enum SyncState {
    /// Launched recently; staleness is not evaluated until the first write or the grace ends.
    Starting,
    /// Log updated within the staleness threshold.
    Healthy,
    /// Log went quiet, the log is unreadable, or the last restart failed.
    Stuck,
    /// Supervisor shut down.
    Stopped,
}

/// Why the controller restarted a sync point.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RestartReason {
    /// The process is gone (or was never started).
    Exited,
    /// Startup grace elapsed without a single log write.
    NoFirstWrite,
    /// The log has not been touched for `K * heartbeat_interval`.
    Stale,
}

impl fmt::Display for RestartReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            RestartReason::Exited => "process not running",
            RestartReason::NoFirstWrite => "no log activity since start",
            RestartReason::Stale => "no log activity detected",
        })
    }
}

/// Last known state of one sync point as seen by the controller.
#[derive(Debug, Clone)]
pub struct PointStatus {
    pub state: SyncState,
    /// Controller time at which the current process was launched.
    pub started_at: Option<SystemTime>,
    pub restarts: u32,
    pub last_sample: Option<LivenessSample>,
    pub last_error: Option<String>,
    /// Log mtime observed right after launch; later writes prove the process is working.
    baseline_mtime: Option<SystemTime>,
    log_reset_at: Option<SystemTime>,
}

impl Default for PointStatus {
    fn default() -> Self {
        Self {
            state: SyncState::Starting,
            started_at: None,
            restarts: 0,
            last_sample: None,
            last_error: None,
            baseline_mtime: None,
            log_reset_at: None,
        }
    }
}

impl PointStatus {
    /// Reference point after which a first log write is expected.
    fn first_write_anchor(&self, now: SystemTime) -> SystemTime {
        let started = self.started_at.unwrap_or(now);
        match self.log_reset_at {
            Some(reset) if reset > started => reset,
            _ => started,
        }
    }
}

/// Single-threaded control loop body driving every sync point.
pub struct HeartbeatController<B> {
    points: Vec<SyncPoint>,
    manager: SyncProcessManager<B>,
    monitor: LogMonitor,
    heartbeat_interval: Duration,
    max_log_lines: u64,
    status: HashMap<SyncPointId, PointStatus>,
}

impl<B: ProcessBackend> HeartbeatController<B> {
    pub fn new(settings: &Settings, backend: B) -> Self {
        let monitor = LogMonitor::new(
            settings.stale_multiplier,
            settings.startup_grace,
            settings.heartbeat_file.clone(),
        );
        let status = settings
            .sync_points
            .iter()
            .map(|point| (point.id().clone(), PointStatus::default()))
            .collect();

        Self {
            points: settings.sync_points.clone(),
            manager: SyncProcessManager::new(backend, settings.termination_grace),
            monitor,
            heartbeat_interval: settings.heartbeat_interval,
            max_log_lines: settings.max_log_lines,
            status,
        }
    }

    pub fn points(&self) -> &[SyncPoint] {
        &self.points
    }

    pub fn status(&self, point: &SyncPointId) -> Option<&PointStatus> {
        self.status.get(point)
    }

    pub fn manager(&self) -> &SyncProcessManager<B> {
        &self.manager
    }

    pub fn manager_mut(&mut self) -> &mut SyncProcessManager<B> {
        &mut self.manager
    }

    /// PID of the point's current process, if any.
    pub fn pid(&self, point: &SyncPointId) -> Option<u32> {
        self.manager.handle(point).map(|handle| handle.pid)
    }

    pub fn start_all(&mut self) {
        self.start_all_at(SystemTime::now());
    }

    /// Launches every sync point. Failures are recorded and retried on the next tick.
    pub fn start_all_at(&mut self, now: SystemTime) {
        for index in 0..self.points.len() {
            let point = self.points[index].clone();
            self.launch(&point, now, false);
        }
    }

    pub fn tick(&mut self) {
        self.tick_at(SystemTime::now());
    }

    /// Runs one heartbeat over every sync point, in configuration order.
    pub fn tick_at(&mut self, now: SystemTime) {
        debug!("Heartbeat tick over {} sync point(s)", self.points.len());
        for index in 0..self.points.len() {
            let point = self.points[index].clone();
            self.tick_point(&point, now);
        }
    }

    /// Stops every process and marks the stopped points `STOPPED`.
    ///
    /// Returns the points whose process could not be stopped.
    pub fn shutdown(&mut self) -> Vec<SyncPointId> {
        info!("Stopping {} sync point(s)", self.points.len());
        let failed = self.manager.stop_all(&self.points);
        for (id, status) in self.status.iter_mut() {
            if failed.contains(id) {
                status.last_error = Some("failed to stop sync process".into());
            } else {
                status.state = SyncState::Stopped;
            }
        }
        failed
    }

    fn status_mut(&mut self, point: &SyncPoint) -> &mut PointStatus {
        self.status.entry(point.id().clone()).or_default()
    }

    fn tick_point(&mut self, point: &SyncPoint, now: SystemTime) {
        let alive = self.manager.is_alive(point.id());

        let sample = match self.monitor.sample(point, now) {
            Ok(sample) => sample,
            Err(err) => {
                if alive {
                    warn!("[STUCK] {} - {err}; leaving process running", point.ssh_host());
                    let status = self.status_mut(point);
                    status.state = SyncState::Stuck;
                    status.last_error = Some(err.to_string());
                } else {
                    warn!("Sync for '{}' is not running ({err}); restarting", point.id());
                    self.launch(point, now, true);
                    self.status_mut(point).last_error = Some(err.to_string());
                }
                return;
            }
        };

        let mut shown = sample.clone();
        if self.monitor.exceeds_size(&sample, self.max_log_lines) {
            info!(
                "[DELETE] {:?} exceeded {} lines",
                point.log_path(),
                self.max_log_lines
            );
            match self.monitor.reset_log(point) {
                Ok(()) => {
                    let status = self.status_mut(point);
                    status.log_reset_at = Some(now);
                    status.baseline_mtime = None;
                    shown.log_mtime = None;
                    shown.log_size_lines = 0;
                }
                Err(err) => {
                    warn!("{err}");
                    self.status_mut(point).last_error = Some(err.to_string());
                }
            }
        }

        // After a reset, judge the post-reset view: the old log's mtime says nothing about
        // the current process.
        let decision = if alive {
            self.evaluate(point, &shown, now)
        } else {
            Some(RestartReason::Exited)
        };
        self.status_mut(point).last_sample = Some(shown.clone());

        match decision {
            Some(RestartReason::Exited) => {
                warn!("Sync for '{}' is not running; restarting", point.id());
                self.launch(point, now, true);
            }
            Some(reason) => {
                warn!("[STUCK] {} - {reason}, restarting", point.ssh_host());
                self.status_mut(point).state = SyncState::Stuck;
                if let Err(err) = self.monitor.note_restart(point, &reason.to_string(), now) {
                    warn!("Failed to record restart in log: {err}");
                }
                self.launch(point, now, true);
            }
            None => {
                let written = shown.changed_since(self.status_mut(point).baseline_mtime);
                let status = self.status_mut(point);
                if status.state != SyncState::Starting || written {
                    if status.state != SyncState::Healthy {
                        debug!("Sync for '{}' is healthy", point.id());
                    }
                    status.state = SyncState::Healthy;
                    status.last_error = None;
                }
            }
        }

        if self.manager.is_alive(point.id()) {
            self.monitor.write_heartbeat(point, now);
        }
    }

    /// Applies the state machine to a live process. `None` means no restart.
    fn evaluate(
        &mut self,
        point: &SyncPoint,
        sample: &LivenessSample,
        now: SystemTime,
    ) -> Option<RestartReason> {
        let status = self.status_mut(point).clone();
        let anchor = status.first_write_anchor(now);

        if status.state == SyncState::Starting
            && !sample.changed_since(status.baseline_mtime)
        {
            return self
                .monitor
                .grace_elapsed(anchor, now)
                .then_some(RestartReason::NoFirstWrite);
        }

        self.monitor
            .is_stale(sample, anchor, self.heartbeat_interval)
            .then_some(RestartReason::Stale)
    }

    /// Starts (or restarts) a point and resets its bookkeeping.
    fn launch(&mut self, point: &SyncPoint, now: SystemTime, restart: bool) {
        let result = if restart {
            self.manager.restart(point)
        } else {
            self.manager.start(point).map(|handle| handle.pid)
        };
        let baseline = fs::metadata(point.log_path())
            .and_then(|meta| meta.modified())
            .ok();

        let status = self.status_mut(point);
        match result {
            Ok(pid) => {
                debug!("Sync for '{}' launched as PID {pid}", point.id());
                status.state = SyncState::Starting;
                status.started_at = Some(now);
                status.baseline_mtime = baseline;
                status.log_reset_at = None;
                status.last_error = None;
                if restart {
                    status.restarts += 1;
                }
            }
            Err(err) => {
                warn!("Failed to launch sync for '{}': {err}", point.id());
                status.state = SyncState::Stuck;
                status.last_error = Some(err.to_string());
            }
        }
    }
}
