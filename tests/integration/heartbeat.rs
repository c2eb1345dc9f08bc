#[path = "common/mod.rs"]
mod common;

use std::{thread, time::Duration};

use common::{ConfigOptions, FakeTool, log_contents, wait_until, write_config, write_fake_tool};
use nix::{
    sys::signal::{self, Signal},
    unistd::Pid,
};
use syncbeat::{
    daemon::pid_alive,
    heartbeat::{HeartbeatController, SyncState},
    process::CommandBackend,
};
use tempfile::tempdir;

fn controller(settings: &syncbeat::config::Settings) -> HeartbeatController<CommandBackend> {
    HeartbeatController::new(settings, CommandBackend::new(&settings.sync_tool))
}

/// Ticks once per heartbeat interval until `check` holds, up to `ticks` times.
fn tick_until<F>(
    controller: &mut HeartbeatController<CommandBackend>,
    ticks: usize,
    mut check: F,
) -> bool
where
    F: FnMut(&HeartbeatController<CommandBackend>) -> bool,
{
    for _ in 0..ticks {
        thread::sleep(Duration::from_millis(500));
        controller.tick();
        if check(controller) {
            return true;
        }
    }
    false
}

#[test]
fn externally_killed_sync_process_is_replaced() {
    let temp = tempdir().expect("failed to create tempdir");
    let tool = write_fake_tool(temp.path(), FakeTool::Chatty);
    let config = write_config(temp.path(), &tool, &ConfigOptions::default());
    let settings = common::settings(&config);
    let point = settings.sync_points[0].clone();

    let mut controller = controller(&settings);
    controller.start_all();
    let first = controller.pid(point.id()).expect("sync process started");

    assert!(wait_until(Duration::from_secs(5), || {
        log_contents(point.log_path()).contains("Synchronization complete")
    }));
    controller.tick();
    let state = controller.status(point.id()).unwrap().state;
    assert!(matches!(state, SyncState::Starting | SyncState::Healthy));

    signal::kill(Pid::from_raw(first as i32), Signal::SIGKILL).expect("failed to kill sync");
    assert!(wait_until(Duration::from_secs(5), || !pid_alive(first)));

    assert!(tick_until(&mut controller, 2, |c| {
        c.pid(point.id()).is_some_and(|pid| pid != first)
    }));
    let second = controller.pid(point.id()).unwrap();
    assert_eq!(controller.status(point.id()).unwrap().state, SyncState::Starting);

    assert!(tick_until(&mut controller, 10, |c| {
        c.status(point.id()).unwrap().state == SyncState::Healthy
    }));
    assert_eq!(controller.pid(point.id()), Some(second));

    assert!(controller.shutdown().is_empty());
    assert!(wait_until(Duration::from_secs(5), || !pid_alive(second)));
}

#[test]
fn silent_sync_process_is_restarted_with_a_note() {
    let temp = tempdir().expect("failed to create tempdir");
    let tool = write_fake_tool(temp.path(), FakeTool::Silent);
    let config = write_config(temp.path(), &tool, &ConfigOptions::default());
    let settings = common::settings(&config);
    let point = settings.sync_points[0].clone();

    let mut controller = controller(&settings);
    controller.start_all();
    let first = controller.pid(point.id()).expect("sync process started");

    assert!(tick_until(&mut controller, 16, |c| {
        c.status(point.id()).unwrap().restarts >= 1
    }));

    assert!(wait_until(Duration::from_secs(5), || !pid_alive(first)));
    assert!(log_contents(point.log_path()).contains("RESTART: devbox"));
    controller.shutdown();
}

#[test]
fn oversized_log_is_deleted_without_restarting() {
    let temp = tempdir().expect("failed to create tempdir");
    let tool = write_fake_tool(temp.path(), FakeTool::Chatty);
    let options = ConfigOptions {
        max_log_lines: 5,
        ..ConfigOptions::default()
    };
    let config = write_config(temp.path(), &tool, &options);
    let settings = common::settings(&config);
    let point = settings.sync_points[0].clone();

    let mut controller = controller(&settings);
    controller.start_all();
    let pid = controller.pid(point.id()).expect("sync process started");

    assert!(wait_until(Duration::from_secs(5), || {
        log_contents(point.log_path()).lines().count() > 5
    }));
    controller.tick();
    assert_eq!(controller.pid(point.id()), Some(pid));
    assert_eq!(controller.status(point.id()).unwrap().restarts, 0);

    // The log pump recreates the file on the next line.
    assert!(wait_until(Duration::from_secs(5), || point.log_path().exists()));
    assert!(log_contents(point.log_path()).lines().count() < 1000);
    assert!(pid_alive(pid));

    controller.shutdown();
}

#[test]
fn sync_points_are_restarted_independently() {
    let temp = tempdir().expect("failed to create tempdir");
    let tool = write_fake_tool(temp.path(), FakeTool::Chatty);
    let options = ConfigOptions {
        points: vec!["alpha", "beta"],
        ..ConfigOptions::default()
    };
    let config = write_config(temp.path(), &tool, &options);
    let settings = common::settings(&config);
    let alpha = settings.sync_points[0].clone();
    let beta = settings.sync_points[1].clone();

    let mut controller = controller(&settings);
    controller.start_all();
    let alpha_pid = controller.pid(alpha.id()).unwrap();
    let beta_pid = controller.pid(beta.id()).unwrap();
    assert_ne!(alpha_pid, beta_pid);

    signal::kill(Pid::from_raw(alpha_pid as i32), Signal::SIGKILL).expect("kill alpha");
    assert!(wait_until(Duration::from_secs(5), || !pid_alive(alpha_pid)));
    assert!(tick_until(&mut controller, 2, |c| {
        c.pid(alpha.id()).is_some_and(|pid| pid != alpha_pid)
    }));

    assert_eq!(controller.pid(beta.id()), Some(beta_pid));
    assert_eq!(controller.status(beta.id()).unwrap().restarts, 0);
    assert!(pid_alive(beta_pid));

    assert!(controller.shutdown().is_empty());
}
