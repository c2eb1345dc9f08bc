//! Lifecycle of the sync tool subprocesses, one per sync point.
use std::{
    collections::HashMap,
    io::{self, BufRead, BufReader, Read},
    os::unix::process::{CommandExt, ExitStatusExt},
    path::PathBuf,
    process::{Child, Command, Stdio},
    thread,
    time::{Duration, Instant},
};

use chrono::{DateTime, Utc};
use nix::{
    errno::Errno,
    sys::signal::{self, Signal},
    unistd::{self, Pid},
};
use tracing::{debug, error, info, warn};

use crate::{
    config::SyncTool,
    error::SyncError,
    logs::append_to_log,
    sync_point::{SyncPoint, SyncPointId},
};

/// How long to wait for a process to disappear after SIGKILL.
const KILL_WAIT: Duration = Duration::from_secs(1);
/// Poll interval while waiting for a process to exit.
const WAIT_POLL: Duration = Duration::from_millis(50);

/// OS-facing side effects needed to supervise sync processes.
///
/// The controller only talks to processes through this trait so its logic can be driven
/// by a fake in tests.
pub trait ProcessBackend {
    /// Launches the sync tool for `point` and returns its PID.
    fn spawn(&mut self, point: &SyncPoint) -> Result<u32, SyncError>;

    /// Delivers `signal` to the process. A process that is already gone is not an error.
    fn signal(&mut self, point: &SyncPoint, pid: u32, signal: Signal)
    -> Result<(), SyncError>;

    /// Waits up to `timeout` for the process to exit. Returns `true` once it has exited.
    fn wait(&mut self, pid: u32, timeout: Duration) -> bool;

    /// OS-level liveness. A hung process is still alive.
    fn is_alive(&mut self, pid: u32) -> bool;
}

/// Runs the real `unison` binary with output appended to the sync point's log.
pub struct CommandBackend {
    binary: PathBuf,
    profile_dir: PathBuf,
    children: HashMap<u32, Child>,
}

impl CommandBackend {
    pub fn new(tool: &SyncTool) -> Self {
        Self {
            binary: tool.binary.clone(),
            profile_dir: tool.profile_dir.clone(),
            children: HashMap::new(),
        }
    }

    fn probe(pid: u32) -> bool {
        match signal::kill(Pid::from_raw(pid as i32), None) {
            Ok(()) => true,
            Err(Errno::ESRCH) => false,
            // EPERM: the PID exists but belongs to someone else.
            Err(_) => true,
        }
    }
}

impl ProcessBackend for CommandBackend {
    fn spawn(&mut self, point: &SyncPoint) -> Result<u32, SyncError> {
        let spawn_error = |reason: String| SyncError::Spawn {
            point: point.id().to_string(),
            reason,
        };

        if !point.local_dir().is_dir() {
            return Err(spawn_error(format!(
                "local directory {:?} does not exist",
                point.local_dir()
            )));
        }
        if self.binary.components().count() > 1 && !self.binary.is_file() {
            return Err(spawn_error(format!(
                "sync tool {:?} not found",
                self.binary
            )));
        }

        let mut cmd = Command::new(&self.binary);
        cmd.arg(point.profile_name())
            .args(["-ui", "text"])
            .env("UNISON", &self.profile_dir)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());

        debug!("Executing command: {cmd:?}");

        unsafe {
            cmd.pre_exec(|| {
                // Own process group so a restart can signal the whole tool tree
                // without touching the supervisor or other sync points.
                if libc::setpgid(0, 0) < 0 {
                    return Err(io::Error::last_os_error());
                }

                #[cfg(target_os = "linux")]
                {
                    use libc::{PR_SET_PDEATHSIG, SIGTERM, prctl};
                    if prctl(PR_SET_PDEATHSIG, SIGTERM, 0, 0, 0) < 0 {
                        return Err(io::Error::last_os_error());
                    }
                }

                Ok(())
            });
        }

        let mut child = cmd.spawn().map_err(|err| {
            if err.kind() == io::ErrorKind::NotFound {
                spawn_error(format!("sync tool {:?} not found", self.binary))
            } else {
                spawn_error(err.to_string())
            }
        })?;

        let pid = child.id();
        if let Some(out) = child.stdout.take() {
            spawn_log_pump(point, out, "stdout");
        }
        if let Some(err) = child.stderr.take() {
            spawn_log_pump(point, err, "stderr");
        }

        self.children.insert(pid, child);
        Ok(pid)
    }

    fn signal(
        &mut self,
        point: &SyncPoint,
        pid: u32,
        sig: Signal,
    ) -> Result<(), SyncError> {
        let target = Pid::from_raw(pid as i32);
        let signal_error = |source: Errno| SyncError::Signal {
            point: point.id().to_string(),
            pid,
            source,
        };

        match signal::kill(target, None) {
            Ok(()) => {}
            Err(Errno::ESRCH) => {
                debug!("Sync point '{}' (PID {pid}) already exited", point.id());
                return Ok(());
            }
            Err(err) => return Err(signal_error(err)),
        }

        let supervisor_pgid = unistd::getpgid(None).ok();
        if let Ok(child_pgid) = unistd::getpgid(Some(target))
            && Some(child_pgid) != supervisor_pgid
        {
            match signal::killpg(child_pgid, sig) {
                Ok(()) => debug!(
                    "Sent {sig:?} to process group {child_pgid} for '{}'",
                    point.id()
                ),
                Err(Errno::ESRCH) => {}
                Err(Errno::EPERM) => warn!(
                    "Insufficient permissions to signal process group {child_pgid} for '{}'. Falling back to direct signal",
                    point.id()
                ),
                Err(err) => return Err(signal_error(err)),
            }
        }

        match signal::kill(target, sig) {
            Ok(()) | Err(Errno::ESRCH) => Ok(()),
            Err(err) => Err(signal_error(err)),
        }
    }

    fn wait(&mut self, pid: u32, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        loop {
            if !self.is_alive(pid) {
                return true;
            }
            if Instant::now() >= deadline {
                return false;
            }
            thread::sleep(WAIT_POLL);
        }
    }

    fn is_alive(&mut self, pid: u32) -> bool {
        let Some(child) = self.children.get_mut(&pid) else {
            return Self::probe(pid);
        };

        match child.try_wait() {
            Ok(None) => true,
            Ok(Some(status)) => {
                match (status.code(), status.signal()) {
                    (Some(code), _) => info!("Sync process {pid} exited with code {code}"),
                    (None, Some(sig)) => info!("Sync process {pid} killed by signal {sig}"),
                    _ => info!("Sync process {pid} exited"),
                }
                self.children.remove(&pid);
                false
            }
            Err(err) => {
                warn!("Failed to check status of sync process {pid}: {err}");
                Self::probe(pid)
            }
        }
    }
}

/// Copies one output stream of the sync tool into its log, line by line.
///
/// The log is reopened for every line so a deleted log is recreated on the next write.
fn spawn_log_pump<R>(point: &SyncPoint, stream: R, label: &'static str)
where
    R: Read + Send + 'static,
{
    let log_path = point.log_path().to_path_buf();
    let name = format!("log-{}-{label}", point.id());

    let spawned = thread::Builder::new().name(name).spawn(move || {
        let mut reader = BufReader::new(stream);
        let mut line = Vec::new();
        loop {
            line.clear();
            match reader.read_until(b'\n', &mut line) {
                Ok(0) => break,
                Ok(_) => {
                    if let Err(err) = append_to_log(&log_path, &line) {
                        warn!("Failed to append {label} to {:?}: {err}", log_path);
                    }
                }
                Err(err) => {
                    debug!("Stopped reading {label} for {:?}: {err}", log_path);
                    break;
                }
            }
        }
    });

    if let Err(err) = spawned {
        error!("Failed to start log pump for {:?}: {err}", point.log_path());
    }
}

/// A live sync process owned by the [`SyncProcessManager`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SyncProcessHandle {
    pub point: SyncPointId,
    pub pid: u32,
    pub started_at: DateTime<Utc>,
}

/// Owns at most one process handle per sync point.
pub struct SyncProcessManager<B> {
    backend: B,
    handles: HashMap<SyncPointId, SyncProcessHandle>,
    termination_grace: Duration,
}

impl<B: ProcessBackend> SyncProcessManager<B> {
    pub fn new(backend: B, termination_grace: Duration) -> Self {
        Self {
            backend,
            handles: HashMap::new(),
            termination_grace,
        }
    }

    pub fn backend(&self) -> &B {
        &self.backend
    }

    pub fn backend_mut(&mut self) -> &mut B {
        &mut self.backend
    }

    pub fn handle(&self, point: &SyncPointId) -> Option<&SyncProcessHandle> {
        self.handles.get(point)
    }

    pub fn handles(&self) -> impl Iterator<Item = &SyncProcessHandle> {
        self.handles.values()
    }

    /// Spawns the sync process for `point`. Refuses when a live handle already exists.
    pub fn start(&mut self, point: &SyncPoint) -> Result<&SyncProcessHandle, SyncError> {
        if let Some(existing) = self.handles.get(point.id()) {
            let pid = existing.pid;
            if self.backend.is_alive(pid) {
                return Err(SyncError::AlreadyRunning {
                    point: point.id().to_string(),
                    pid,
                });
            }
            self.handles.remove(point.id());
        }

        let pid = self.backend.spawn(point)?;
        info!("Started sync for '{}' (PID {pid}): {}", point.id(), point);

        let handle = SyncProcessHandle {
            point: point.id().clone(),
            pid,
            started_at: Utc::now(),
        };
        Ok(self.handles.entry(point.id().clone()).or_insert(handle))
    }

    /// Terminates the sync process for `point`: SIGTERM, bounded wait, then SIGKILL.
    ///
    /// Stopping a point without a live process is a no-op. The handle is only dropped once
    /// the process is gone, so a failed stop never leads to a second process.
    pub fn stop(&mut self, point: &SyncPoint) -> Result<(), SyncError> {
        let Some(pid) = self.handles.get(point.id()).map(|handle| handle.pid) else {
            debug!("Sync point '{}' has no running process", point.id());
            return Ok(());
        };

        if !self.backend.is_alive(pid) {
            debug!("Sync point '{}' (PID {pid}) already exited", point.id());
            self.handles.remove(point.id());
            return Ok(());
        }

        debug!("Stopping sync for '{}' (PID {pid})", point.id());
        self.backend.signal(point, pid, Signal::SIGTERM)?;

        if !self.backend.wait(pid, self.termination_grace) {
            let timeout = SyncError::ProcessTimeout {
                point: point.id().to_string(),
                pid,
                grace: self.termination_grace,
            };
            warn!("{timeout}; sending SIGKILL");
            self.backend.signal(point, pid, Signal::SIGKILL)?;

            if !self.backend.wait(pid, KILL_WAIT) {
                error!(
                    "Sync point '{}' (PID {pid}) survived SIGKILL; keeping handle",
                    point.id()
                );
                return Err(timeout);
            }
        }

        self.handles.remove(point.id());
        info!("Stopped sync for '{}' (PID {pid})", point.id());
        Ok(())
    }

    /// Stops (if running) and starts `point` again, returning the new PID.
    pub fn restart(&mut self, point: &SyncPoint) -> Result<u32, SyncError> {
        self.stop(point)?;
        Ok(self.start(point)?.pid)
    }

    /// OS-level liveness of the point's process. `false` when there is no handle.
    pub fn is_alive(&mut self, point: &SyncPointId) -> bool {
        match self.handles.get(point) {
            Some(handle) => {
                let pid = handle.pid;
                self.backend.is_alive(pid)
            }
            None => false,
        }
    }

    /// Stops every process, returning the points whose process could not be stopped.
    pub fn stop_all(&mut self, points: &[SyncPoint]) -> Vec<SyncPointId> {
        let mut failed = Vec::new();
        for point in points {
            if let Err(err) = self.stop(point) {
                error!("Failed to stop sync for '{}': {err}", point.id());
                failed.push(point.id().clone());
            }
        }
        failed
    }
}
