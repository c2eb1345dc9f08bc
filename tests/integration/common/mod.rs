#![allow(dead_code)]

use std::{
    fs,
    os::unix::fs::PermissionsExt,
    path::{Path, PathBuf},
    thread,
    time::{Duration, Instant},
};

use syncbeat::{
    config::{Settings, load_config},
    daemon::DaemonState,
};

/// Behaviour of the stand-in sync tool.
#[derive(Clone, Copy, Debug)]
pub enum FakeTool {
    /// Logs a line every 200ms until killed.
    Chatty,
    /// Logs once, then hangs without output.
    Silent,
}

/// Writes an executable shell script that stands in for `unison`.
pub fn write_fake_tool(dir: &Path, kind: FakeTool) -> PathBuf {
    let body = match kind {
        FakeTool::Chatty => {
            r#"#!/bin/sh
echo "fake sync started: $1 (profiles in $UNISON)"
while true; do
  echo "Synchronization complete at $(date +%s)"
  sleep 0.2
done
"#
        }
        FakeTool::Silent => {
            r#"#!/bin/sh
echo "fake sync started: $1"
exec sleep 600
"#
        }
    };

    let path = dir.join("fake-unison.sh");
    fs::write(&path, body).expect("failed to write fake sync tool");
    let mut perms = fs::metadata(&path).expect("fake tool metadata").permissions();
    perms.set_mode(0o755);
    fs::set_permissions(&path, perms).expect("failed to mark fake tool executable");
    path
}

/// Tunables that differ between tests.
#[derive(Clone, Debug)]
pub struct ConfigOptions {
    pub heartbeat_interval: u64,
    pub max_log_lines: u64,
    pub points: Vec<&'static str>,
}

impl Default for ConfigOptions {
    fn default() -> Self {
        Self {
            heartbeat_interval: 1,
            max_log_lines: 1000,
            points: vec!["alpha"],
        }
    }
}

/// Writes `syncbeat.yaml` under `dir` with every path kept inside `dir`.
pub fn write_config(dir: &Path, tool: &Path, options: &ConfigOptions) -> PathBuf {
    let mut points = String::new();
    for name in &options.points {
        let local = dir.join("local").join(name);
        fs::create_dir_all(&local).expect("failed to create local dir");
        points.push_str(&format!(
            "  - local_dir: {}\n    ssh: devbox\n    remote_dir: /srv/{name}\n",
            local.display()
        ));
    }

    let config = format!(
        r#"log_dir: {logs}
state_dir: {state}
heartbeat_interval: {interval}
max_log_lines: {max_lines}
termination_grace: 1
shutdown_timeout: 10
autostart: false
sync_tool:
  binary: {tool}
  profile_dir: {profiles}
sync_points:
{points}"#,
        logs = dir.join("logs").display(),
        state = dir.join("state").display(),
        interval = options.heartbeat_interval,
        max_lines = options.max_log_lines,
        tool = tool.display(),
        profiles = dir.join("profiles").display(),
    );

    let path = dir.join("syncbeat.yaml");
    fs::write(&path, config).expect("failed to write config");
    path
}

pub fn settings(config: &Path) -> Settings {
    load_config(config).expect("failed to load test config")
}

/// Polls `check` every 100ms until it holds or `timeout` elapses.
pub fn wait_until<F>(timeout: Duration, mut check: F) -> bool
where
    F: FnMut() -> bool,
{
    let deadline = Instant::now() + timeout;
    loop {
        if check() {
            return true;
        }
        if Instant::now() >= deadline {
            return false;
        }
        thread::sleep(Duration::from_millis(100));
    }
}

/// Reads the state record, treating an unreadable or partially written one as absent.
pub fn read_state(settings: &Settings) -> Option<DaemonState> {
    DaemonState::load(&settings.state_path()).ok().flatten()
}

/// Waits for a record listing a PID for every configured sync point.
pub fn wait_for_pids(settings: &Settings, timeout: Duration) -> Vec<u32> {
    let mut pids = Vec::new();
    let found = wait_until(timeout, || {
        pids = read_state(settings)
            .map(|state| {
                state
                    .sync_points
                    .values()
                    .filter_map(|report| report.pid)
                    .collect()
            })
            .unwrap_or_default();
        pids.len() == settings.sync_points.len()
    });
    assert!(found, "timed out waiting for sync PIDs in state record");
    pids
}

pub fn log_contents(path: &Path) -> String {
    fs::read_to_string(path).unwrap_or_default()
}
