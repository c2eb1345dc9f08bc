//! Supervisor lifecycle: state record, instance lock, control loop and shutdown.
use std::{
    collections::BTreeMap,
    fs::{self, File},
    io::{self, Write},
    path::{Path, PathBuf},
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
    thread,
    time::{Duration, Instant, SystemTime},
};

use chrono::{DateTime, Utc};
use fs2::FileExt;
use nix::{
    errno::Errno,
    sys::signal::{self, Signal},
    unistd::{self, Pid},
};
use serde::{Deserialize, Serialize};
use strum_macros::{AsRefStr, Display};
use sysinfo::{ProcessRefreshKind, ProcessStatus, ProcessesToUpdate, System};
use tracing::{debug, error, info, warn};

use crate::{
    autostart::{Autostart, AutostartEntry, platform_autostart},
    config::Settings,
    error::{DaemonError, state_io},
    heartbeat::{HeartbeatController, PointStatus, SyncState},
    process::{CommandBackend, ProcessBackend},
    profile, runtime,
    sync_point::{SyncPoint, SyncPointId},
};

/// Longest uninterrupted sleep inside the control loop.
const SLEEP_SLICE: Duration = Duration::from_millis(200);
/// Poll interval while waiting for the daemon to exit.
const EXIT_POLL: Duration = Duration::from_millis(100);

/// Whether the daemon is supervising.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Display, AsRefStr)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum DaemonStatus {
    Stopped,
    Running,
}

/// Summary of the most recent liveness sample.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SampleReport {
    pub sampled_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub log_mtime: Option<DateTime<Utc>>,
    pub log_lines: u64,
}

/// Persisted view of one sync point.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncPointReport {
    pub local_dir: PathBuf,
    pub ssh: String,
    pub remote_dir: String,
    pub profile: String,
    pub log_path: PathBuf,
    pub state: SyncState,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pid: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub process_started_at: Option<DateTime<Utc>>,
    pub restarts: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_sample: Option<SampleReport>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
}

impl SyncPointReport {
    fn new(point: &SyncPoint, status: Option<&PointStatus>, pid: Option<u32>) -> Self {
        let status = status.cloned().unwrap_or_default();
        Self {
            local_dir: point.local_dir().to_path_buf(),
            ssh: point.ssh_host().to_string(),
            remote_dir: point.remote_dir().to_string(),
            profile: point.profile_name().to_string(),
            log_path: point.log_path().to_path_buf(),
            state: status.state,
            pid,
            process_started_at: status.started_at.map(DateTime::<Utc>::from),
            restarts: status.restarts,
            last_sample: status.last_sample.map(|sample| SampleReport {
                sampled_at: sample.sampled_at.into(),
                log_mtime: sample.log_mtime.map(DateTime::<Utc>::from),
                log_lines: sample.log_size_lines,
            }),
            last_error: status.last_error,
        }
    }
}

/// The state record shared between the running daemon and `status`/`stop`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DaemonState {
    pub pid: u32,
    pub status: DaemonStatus,
    pub started_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub config_path: Option<PathBuf>,
    /// Seconds.
    pub heartbeat_interval: u64,
    pub stale_multiplier: u32,
    pub sync_points: BTreeMap<SyncPointId, SyncPointReport>,
}

impl DaemonState {
    /// Snapshot of the controller for the current process.
    pub fn capture<B: ProcessBackend>(
        settings: &Settings,
        controller: &HeartbeatController<B>,
        started_at: DateTime<Utc>,
        status: DaemonStatus,
    ) -> Self {
        let sync_points = controller
            .points()
            .iter()
            .map(|point| {
                let report = SyncPointReport::new(
                    point,
                    controller.status(point.id()),
                    controller.pid(point.id()),
                );
                (point.id().clone(), report)
            })
            .collect();

        Self {
            pid: std::process::id(),
            status,
            started_at,
            updated_at: Utc::now(),
            config_path: settings.config_path.clone(),
            heartbeat_interval: settings.heartbeat_interval.as_secs(),
            stale_multiplier: settings.stale_multiplier,
            sync_points,
        }
    }

    /// Reads the record. A missing file yields `None`.
    pub fn load(path: &Path) -> Result<Option<Self>, DaemonError> {
        let contents = match fs::read_to_string(path) {
            Ok(contents) => contents,
            Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(None),
            Err(err) => return Err(state_io(path, err)),
        };
        Ok(Some(serde_json::from_str(&contents)?))
    }

    /// Writes the record through a temporary file and a rename.
    pub fn save(&self, path: &Path) -> Result<(), DaemonError> {
        if let Some(dir) = path.parent() {
            fs::create_dir_all(dir).map_err(|err| state_io(dir, err))?;
        }

        let tmp = path.with_extension("json.tmp");
        let payload = serde_json::to_vec_pretty(self)?;
        let write = || -> io::Result<()> {
            let mut file = File::create(&tmp)?;
            file.write_all(&payload)?;
            file.sync_all()?;
            fs::rename(&tmp, path)
        };
        write().map_err(|err| state_io(path, err))
    }

    /// Deletes the record. Returns whether one existed.
    pub fn remove(path: &Path) -> Result<bool, DaemonError> {
        match fs::remove_file(path) {
            Ok(()) => Ok(true),
            Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(false),
            Err(err) => Err(state_io(path, err)),
        }
    }

    /// True when the recorded PID still holds the instance lock at `lock_path`.
    ///
    /// A record whose PID merely exists is not enough: after a crash or reboot the PID may
    /// belong to an unrelated process.
    pub fn is_live(&self, lock_path: &Path) -> bool {
        self.status == DaemonStatus::Running
            && InstanceLock::holder(lock_path) == Some(self.pid)
            && pid_alive(self.pid)
    }
}

/// Exclusive advisory lock held for the lifetime of a running daemon.
#[derive(Debug)]
pub struct InstanceLock {
    file: File,
    path: PathBuf,
}

impl InstanceLock {
    pub fn acquire(path: &Path) -> Result<Self, DaemonError> {
        if let Some(dir) = path.parent() {
            fs::create_dir_all(dir).map_err(|err| state_io(dir, err))?;
        }
        let mut file = File::options()
            .create(true)
            .truncate(false)
            .write(true)
            .open(path)
            .map_err(|err| state_io(path, err))?;

        if FileExt::try_lock_exclusive(&file).is_err() {
            return Err(DaemonError::LockHeld(path.to_path_buf()));
        }

        file.set_len(0).map_err(|err| state_io(path, err))?;
        write!(file, "{}", std::process::id()).map_err(|err| state_io(path, err))?;
        debug!("Acquired instance lock {:?}", path);

        Ok(Self {
            file,
            path: path.to_path_buf(),
        })
    }

    /// PID written by the process currently holding the lock, or `None` when it is free.
    pub fn holder(path: &Path) -> Option<u32> {
        let file = File::open(path).ok()?;
        if FileExt::try_lock_shared(&file).is_ok() {
            return None;
        }
        fs::read_to_string(path).ok()?.trim().parse().ok()
    }
}

impl Drop for InstanceLock {
    fn drop(&mut self) {
        if let Err(err) = FileExt::unlock(&self.file) {
            warn!("Failed to release instance lock {:?}: {err}", self.path);
        }
    }
}

/// Result of a `stop` request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopOutcome {
    /// A running daemon was terminated.
    Stopped { pid: u32 },
    /// Nothing was running.
    AlreadyStopped,
}

/// Installs the SIGINT/SIGTERM handler and returns the flag it raises.
pub fn install_shutdown_handler() -> Result<Arc<AtomicBool>, DaemonError> {
    let shutdown = Arc::new(AtomicBool::new(false));
    let flag = Arc::clone(&shutdown);
    ctrlc::set_handler(move || {
        flag.store(true, Ordering::SeqCst);
    })?;
    Ok(shutdown)
}

/// Owns the configuration and the side effects of starting and stopping the supervisor.
pub struct Daemon {
    settings: Settings,
    autostart: Box<dyn Autostart>,
}

impl Daemon {
    pub fn new(settings: Settings) -> Self {
        let home = runtime::home_dir();
        let autostart = platform_autostart(settings.autostart, home.as_deref());
        Self::with_autostart(settings, autostart)
    }

    pub fn with_autostart(settings: Settings, autostart: Box<dyn Autostart>) -> Self {
        Self {
            settings,
            autostart,
        }
    }

    pub fn settings(&self) -> &Settings {
        &self.settings
    }

    /// The record of a live daemon, if one is running.
    pub fn running(&self) -> Option<DaemonState> {
        match DaemonState::load(&self.settings.state_path()) {
            Ok(Some(record)) if record.is_live(&self.settings.lock_path()) => Some(record),
            Ok(_) => None,
            Err(err) => {
                warn!("Ignoring unreadable state record: {err}");
                None
            }
        }
    }

    /// Installs the login auto-start entry pointing at the current executable.
    pub fn register_autostart(&self) -> Result<(), DaemonError> {
        let Some(config_path) = &self.settings.config_path else {
            debug!("No configuration file path; skipping auto-start registration");
            return Ok(());
        };

        let program = std::env::current_exe()?;
        let entry = AutostartEntry {
            program,
            args: vec![
                "start".into(),
                "--foreground".into(),
                "--config".into(),
                config_path.display().to_string(),
            ],
            log_dir: self.settings.log_dir.clone(),
        };
        self.autostart.register(&entry)?;
        Ok(())
    }

    /// Supervises with the real sync tool until `shutdown` is raised.
    pub fn run_foreground(&self, shutdown: &AtomicBool) -> Result<(), DaemonError> {
        let backend = CommandBackend::new(&self.settings.sync_tool);
        let mut controller = HeartbeatController::new(&self.settings, backend);
        self.supervise(&mut controller, shutdown)
    }

    /// Runs the control loop: start every point, tick every interval, stop everything.
    pub fn supervise<B: ProcessBackend>(
        &self,
        controller: &mut HeartbeatController<B>,
        shutdown: &AtomicBool,
    ) -> Result<(), DaemonError> {
        let settings = &self.settings;
        let _lock = InstanceLock::acquire(&settings.lock_path())?;
        let state_path = settings.state_path();
        let started_at = Utc::now();

        fs::create_dir_all(&settings.log_dir).map_err(|err| state_io(&settings.log_dir, err))?;
        DaemonState::capture(settings, controller, started_at, DaemonStatus::Running)
            .save(&state_path)?;
        profile::write_profiles(&settings.sync_tool, &settings.sync_points)?;

        info!(
            "Supervising {} sync point(s) every {}s (PID {})",
            settings.sync_points.len(),
            settings.heartbeat_interval.as_secs(),
            std::process::id()
        );
        controller.start_all();
        self.persist(controller, started_at);

        loop {
            let deadline = Instant::now() + settings.heartbeat_interval;
            if shutdown.load(Ordering::SeqCst) || sleep_until(deadline, shutdown) {
                break;
            }
            controller.tick();
            self.persist(controller, started_at);
        }

        info!("Shutdown requested; stopping sync processes");
        let failed = controller.shutdown();
        if failed.is_empty() {
            DaemonState::remove(&state_path)?;
            info!("syncbeat stopped");
            return Ok(());
        }

        self.persist(controller, started_at);
        Err(DaemonError::StopFailed {
            points: failed.iter().map(ToString::to_string).collect(),
        })
    }

    /// Writes the state record; failures are logged and the loop continues.
    fn persist<B: ProcessBackend>(
        &self,
        controller: &HeartbeatController<B>,
        started_at: DateTime<Utc>,
    ) {
        let record =
            DaemonState::capture(&self.settings, controller, started_at, DaemonStatus::Running);
        if let Err(err) = record.save(&self.settings.state_path()) {
            error!("Failed to write state record: {err}");
        }
    }

    /// Stops a running daemon. Safe to call repeatedly.
    pub fn stop(&self, purge: bool) -> Result<StopOutcome, DaemonError> {
        let state_path = self.settings.state_path();
        let record = DaemonState::load(&state_path).unwrap_or_else(|err| {
            warn!("Ignoring unreadable state record: {err}");
            None
        });

        let outcome = match &record {
            Some(record) if record.is_live(&self.settings.lock_path()) => {
                self.terminate(record)?;
                StopOutcome::Stopped { pid: record.pid }
            }
            Some(record) => {
                debug!("Daemon PID {} no longer holds the lock; clearing leftovers", record.pid);
                let survivors = kill_orphans(record);
                if !survivors.is_empty() {
                    return Err(DaemonError::StopFailed { points: survivors });
                }
                StopOutcome::AlreadyStopped
            }
            None => StopOutcome::AlreadyStopped,
        };

        DaemonState::remove(&state_path)?;
        self.autostart.deregister()?;
        if purge {
            self.purge()?;
        }
        Ok(outcome)
    }

    /// SIGTERM, bounded wait, then SIGKILL for the daemon and its leftover sync processes.
    fn terminate(&self, record: &DaemonState) -> Result<(), DaemonError> {
        let pid = record.pid as i32;
        info!("Stopping syncbeat daemon (PID {pid})");
        send_signal(pid, Signal::SIGTERM)?;

        if wait_for_exit(record.pid, self.settings.shutdown_timeout) {
            return Ok(());
        }

        warn!(
            "Daemon PID {pid} did not exit within {:?}; sending SIGKILL",
            self.settings.shutdown_timeout
        );
        send_signal(pid, Signal::SIGKILL)?;
        wait_for_exit(record.pid, Duration::from_secs(1));

        let survivors = kill_orphans(record);
        if survivors.is_empty() {
            Ok(())
        } else {
            Err(DaemonError::StopFailed { points: survivors })
        }
    }

    /// Deletes sync logs and generated profiles.
    fn purge(&self) -> Result<(), DaemonError> {
        for point in &self.settings.sync_points {
            match fs::remove_file(point.log_path()) {
                Ok(()) => debug!("Removed {:?}", point.log_path()),
                Err(err) if err.kind() == io::ErrorKind::NotFound => {}
                Err(err) => return Err(err.into()),
            }
        }
        let removed = profile::remove_profiles(&self.settings.sync_tool.profile_dir)?;
        info!("Purged sync logs and {removed} profile(s)");
        Ok(())
    }
}

/// Sleeps until `deadline` in short slices. Returns `true` when shutdown was requested.
fn sleep_until(deadline: Instant, shutdown: &AtomicBool) -> bool {
    loop {
        if shutdown.load(Ordering::SeqCst) {
            return true;
        }
        let now = Instant::now();
        if now >= deadline {
            return false;
        }
        thread::sleep(SLEEP_SLICE.min(deadline - now));
    }
}

fn send_signal(pid: i32, sig: Signal) -> Result<(), DaemonError> {
    match signal::kill(Pid::from_raw(pid), sig) {
        Ok(()) | Err(Errno::ESRCH) => Ok(()),
        Err(source) => Err(DaemonError::Signal { pid, source }),
    }
}

/// Whether `pid` names a running (non-zombie) process.
pub fn pid_alive(pid: u32) -> bool {
    match signal::kill(Pid::from_raw(pid as i32), None) {
        Ok(()) | Err(Errno::EPERM) => {}
        Err(_) => return false,
    }

    let mut system = System::new();
    let target = sysinfo::Pid::from_u32(pid);
    system.refresh_processes_specifics(
        ProcessesToUpdate::Some(&[target]),
        true,
        ProcessRefreshKind::everything(),
    );
    match system.process(target) {
        Some(process) => process.status() != ProcessStatus::Zombie,
        None => true,
    }
}

fn wait_for_exit(pid: u32, timeout: Duration) -> bool {
    let deadline = Instant::now() + timeout;
    loop {
        if !pid_alive(pid) {
            return true;
        }
        if Instant::now() >= deadline {
            return false;
        }
        thread::sleep(EXIT_POLL);
    }
}

/// SIGKILLs recorded sync processes whose command line still carries their profile name.
///
/// Returns the sync points whose process could not be killed.
fn kill_orphans(record: &DaemonState) -> Vec<String> {
    let mut system = System::new();
    system.refresh_processes_specifics(
        ProcessesToUpdate::All,
        true,
        ProcessRefreshKind::everything(),
    );

    let own_pgid = unistd::getpgid(None).ok();
    let mut survivors = Vec::new();
    for (id, report) in &record.sync_points {
        let Some(pid) = report.pid else {
            continue;
        };
        let Some(process) = system.process(sysinfo::Pid::from_u32(pid)) else {
            continue;
        };
        let ours = process
            .cmd()
            .iter()
            .any(|arg| arg.to_string_lossy().contains(&report.profile));
        if !ours {
            debug!("PID {pid} no longer runs profile {}; leaving it alone", report.profile);
            continue;
        }

        warn!("Killing leftover sync process {pid} for '{id}'");
        let target = Pid::from_raw(pid as i32);
        if let Ok(pgid) = unistd::getpgid(Some(target))
            && Some(pgid) != own_pgid
        {
            match signal::killpg(pgid, Signal::SIGKILL) {
                Ok(()) | Err(Errno::ESRCH) => {}
                Err(err) => warn!("Failed to kill process group {pgid} for '{id}': {err}"),
            }
        }
        match signal::kill(target, Signal::SIGKILL) {
            Ok(()) | Err(Errno::ESRCH) => {}
            Err(err) => {
                error!("Failed to kill sync process {pid} for '{id}': {err}");
                survivors.push(id.to_string());
            }
        }
    }
    survivors
}
