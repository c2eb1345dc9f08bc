//! Shared helpers for unit tests.
use std::{
    cell::RefCell,
    collections::HashSet,
    rc::Rc,
    sync::{Mutex, MutexGuard, OnceLock},
    time::Duration,
};

use nix::sys::signal::Signal;

use crate::{
    autostart::{Autostart, AutostartEntry},
    error::{AutostartError, SyncError},
    process::ProcessBackend,
    sync_point::{SyncPoint, SyncPointId},
};

/// Global lock for environment variable modifications in tests.
/// All tests that modify environment variables (especially HOME) should acquire this lock
/// to prevent race conditions between parallel test executions.
pub static ENV_LOCK: OnceLock<Mutex<()>> = OnceLock::new();

pub fn env_lock() -> MutexGuard<'static, ()> {
    ENV_LOCK
        .get_or_init(|| Mutex::new(()))
        .lock()
        .unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// In-memory process backend: PIDs are counters, signals are recorded.
#[derive(Debug)]
pub struct FakeBackend {
    next_pid: u32,
    /// PIDs currently considered alive.
    pub alive: HashSet<u32>,
    /// Every successful spawn, in order.
    pub spawned: Vec<(SyncPointId, u32)>,
    /// Every signal delivered, in order.
    pub signals: Vec<(u32, Signal)>,
    /// PIDs that survive SIGTERM.
    pub ignore_sigterm: HashSet<u32>,
    /// Points whose spawn fails.
    pub fail_spawn: HashSet<SyncPointId>,
}

impl Default for FakeBackend {
    fn default() -> Self {
        Self {
            next_pid: 1000,
            alive: HashSet::new(),
            spawned: Vec::new(),
            signals: Vec::new(),
            ignore_sigterm: HashSet::new(),
            fail_spawn: HashSet::new(),
        }
    }
}

impl FakeBackend {
    /// Simulates an external kill.
    pub fn kill(&mut self, pid: u32) {
        self.alive.remove(&pid);
    }

    /// Signals delivered to `pid`, in order.
    pub fn signals_for(&self, pid: u32) -> Vec<Signal> {
        self.signals
            .iter()
            .filter(|(target, _)| *target == pid)
            .map(|(_, signal)| *signal)
            .collect()
    }
}

impl ProcessBackend for FakeBackend {
    fn spawn(&mut self, point: &SyncPoint) -> Result<u32, SyncError> {
        if self.fail_spawn.contains(point.id()) {
            return Err(SyncError::Spawn {
                point: point.id().to_string(),
                reason: "sync tool \"unison\" not found".into(),
            });
        }
        self.next_pid += 1;
        let pid = self.next_pid;
        self.alive.insert(pid);
        self.spawned.push((point.id().clone(), pid));
        Ok(pid)
    }

    fn signal(
        &mut self,
        _point: &SyncPoint,
        pid: u32,
        signal: Signal,
    ) -> Result<(), SyncError> {
        if !self.alive.contains(&pid) {
            return Ok(());
        }
        self.signals.push((pid, signal));
        let survives = signal == Signal::SIGTERM && self.ignore_sigterm.contains(&pid);
        if !survives {
            self.alive.remove(&pid);
        }
        Ok(())
    }

    fn wait(&mut self, pid: u32, _timeout: Duration) -> bool {
        !self.alive.contains(&pid)
    }

    fn is_alive(&mut self, pid: u32) -> bool {
        self.alive.contains(&pid)
    }
}

/// Auto-start backend that records calls.
#[derive(Debug, Default, Clone)]
pub struct RecordingAutostart {
    pub registered: Rc<RefCell<Vec<AutostartEntry>>>,
    pub deregistered: Rc<RefCell<usize>>,
}

impl Autostart for RecordingAutostart {
    fn register(&self, entry: &AutostartEntry) -> Result<(), AutostartError> {
        self.registered.borrow_mut().push(entry.clone());
        Ok(())
    }

    fn deregister(&self) -> Result<(), AutostartError> {
        *self.deregistered.borrow_mut() += 1;
        Ok(())
    }
}
