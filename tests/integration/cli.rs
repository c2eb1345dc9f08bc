#[path = "common/mod.rs"]
mod common;

use std::{fs, path::Path, process, time::Duration};

use assert_cmd::Command;
use common::{
    ConfigOptions, FakeTool, read_state, wait_for_pids, wait_until, write_config,
    write_fake_tool,
};
use predicates::str::contains;
use syncbeat::{
    daemon::{DaemonState, DaemonStatus, pid_alive},
    heartbeat::HeartbeatController,
    process::CommandBackend,
};
use tempfile::tempdir;

fn syncbeat(home: &Path) -> Command {
    let mut cmd = Command::new(assert_cmd::cargo::cargo_bin!("syncbeat"));
    cmd.env("HOME", home).env_remove("RUST_LOG");
    cmd
}

#[test]
fn start_status_stop_round_trip() {
    let temp = tempdir().expect("failed to create tempdir");
    let dir = temp.path();
    let home = dir.join("home");
    fs::create_dir_all(&home).expect("failed to create home dir");

    let tool = write_fake_tool(dir, FakeTool::Chatty);
    let options = ConfigOptions {
        points: vec!["alpha", "beta"],
        ..ConfigOptions::default()
    };
    let config = write_config(dir, &tool, &options);
    let settings = common::settings(&config);

    syncbeat(&home)
        .arg("start")
        .arg("--config")
        .arg(&config)
        .assert()
        .success()
        .stdout(contains("starting in the background"));

    let pids = wait_for_pids(&settings, Duration::from_secs(10));
    assert!(settings.supervisor_log_path().exists());

    let output = syncbeat(&home)
        .args(["status", "--json", "--config"])
        .arg(&config)
        .output()
        .expect("failed to run status");
    assert!(output.status.success());
    let report: serde_json::Value =
        serde_json::from_slice(&output.stdout).expect("status emits JSON");
    assert_eq!(report["status"], "running");
    assert_eq!(report["sync_points"].as_array().map(Vec::len), Some(2));

    syncbeat(&home)
        .args(["status", "--no-color", "--config"])
        .arg(&config)
        .assert()
        .success()
        .stdout(contains("syncbeat: running"))
        .stdout(contains("devbox:/srv/alpha"));

    // A second start reports the running instance instead of starting another.
    syncbeat(&home)
        .args(["start", "--config"])
        .arg(&config)
        .assert()
        .success()
        .stdout(contains("syncbeat: running"));

    syncbeat(&home)
        .args(["stop", "--config"])
        .arg(&config)
        .assert()
        .success()
        .stdout(contains("syncbeat stopped"));

    assert!(read_state(&settings).is_none());
    assert!(wait_until(Duration::from_secs(5), || {
        pids.iter().all(|pid| !pid_alive(*pid))
    }));

    syncbeat(&home)
        .args(["stop", "--config"])
        .arg(&config)
        .assert()
        .success()
        .stdout(contains("already stopped"));

    syncbeat(&home)
        .args(["status", "--config"])
        .arg(&config)
        .assert()
        .success()
        .stdout(contains("syncbeat: stopped"));
}

#[test]
fn stop_with_purge_removes_logs_and_profiles() {
    let temp = tempdir().expect("failed to create tempdir");
    let dir = temp.path();
    let home = dir.join("home");
    fs::create_dir_all(&home).expect("failed to create home dir");

    let tool = write_fake_tool(dir, FakeTool::Chatty);
    let config = write_config(dir, &tool, &ConfigOptions::default());
    let settings = common::settings(&config);

    syncbeat(&home)
        .args(["start", "--config"])
        .arg(&config)
        .assert()
        .success();
    wait_for_pids(&settings, Duration::from_secs(10));
    let log = settings.sync_points[0].log_path().to_path_buf();
    assert!(wait_until(Duration::from_secs(5), || log.exists()));

    syncbeat(&home)
        .args(["stop", "--purge", "--config"])
        .arg(&config)
        .assert()
        .success();

    assert!(!log.exists());
    let profiles = fs::read_dir(&settings.sync_tool.profile_dir)
        .map(|entries| entries.count())
        .unwrap_or(0);
    assert_eq!(profiles, 0);
}

#[test]
fn leftover_record_with_reused_pid_is_ignored() {
    let temp = tempdir().expect("failed to create tempdir");
    let dir = temp.path();
    let tool = write_fake_tool(dir, FakeTool::Chatty);
    let config = write_config(dir, &tool, &ConfigOptions::default());
    let settings = common::settings(&config);

    let mut unrelated = process::Command::new("sleep")
        .arg("30")
        .spawn()
        .expect("failed to spawn sleep");
    let controller =
        HeartbeatController::new(&settings, CommandBackend::new(&settings.sync_tool));
    let mut record = DaemonState::capture(
        &settings,
        &controller,
        chrono::Utc::now(),
        DaemonStatus::Running,
    );
    record.pid = unrelated.id();
    record.save(&settings.state_path()).expect("failed to save record");

    syncbeat(dir)
        .args(["status", "--no-color", "--config"])
        .arg(&config)
        .assert()
        .success()
        .stdout(contains("syncbeat: stopped"));

    syncbeat(dir)
        .args(["stop", "--config"])
        .arg(&config)
        .assert()
        .success()
        .stdout(contains("already stopped"));

    assert!(unrelated.try_wait().expect("try_wait").is_none());
    assert!(read_state(&settings).is_none());
    unrelated.kill().expect("failed to kill sleep");
    unrelated.wait().expect("failed to reap sleep");
}

#[test]
fn invalid_config_is_rejected_before_starting() {
    let temp = tempdir().expect("failed to create tempdir");
    let dir = temp.path();
    let tool = write_fake_tool(dir, FakeTool::Chatty);
    let options = ConfigOptions {
        heartbeat_interval: 0,
        ..ConfigOptions::default()
    };
    let config = write_config(dir, &tool, &options);

    syncbeat(dir)
        .args(["start", "--foreground", "--config"])
        .arg(&config)
        .assert()
        .failure()
        .stderr(contains("heartbeat_interval"));

    assert!(!dir.join("state").join("syncbeat.state.json").exists());
}

#[test]
fn duplicate_sync_points_are_rejected() {
    let temp = tempdir().expect("failed to create tempdir");
    let dir = temp.path();
    let tool = write_fake_tool(dir, FakeTool::Chatty);
    let options = ConfigOptions {
        points: vec!["alpha", "alpha"],
        ..ConfigOptions::default()
    };
    let config = write_config(dir, &tool, &options);

    syncbeat(dir)
        .args(["status", "--config"])
        .arg(&config)
        .assert()
        .failure()
        .stderr(contains("Duplicate sync point #1"))
        .stderr(contains("already configured as #0"));
}

#[test]
fn status_without_daemon_reports_stopped() {
    let temp = tempdir().expect("failed to create tempdir");
    let dir = temp.path();
    let tool = write_fake_tool(dir, FakeTool::Chatty);
    let config = write_config(dir, &tool, &ConfigOptions::default());

    syncbeat(dir)
        .args(["status", "--no-color", "--config"])
        .arg(&config)
        .assert()
        .success()
        .stdout(contains("syncbeat: stopped"))
        .stdout(contains("STOPPED"));
}

#[test]
fn missing_config_file_fails() {
    let temp = tempdir().expect("failed to create tempdir");
    syncbeat(temp.path())
        .args(["status", "--config"])
        .arg(temp.path().join("absent.yaml"))
        .assert()
        .failure();
}
