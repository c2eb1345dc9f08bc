#[path = "common/mod.rs"]
mod common;

use std::{
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
    thread,
    time::Duration,
};

use common::{
    ConfigOptions, FakeTool, read_state, wait_for_pids, wait_until, write_config,
    write_fake_tool,
};
use syncbeat::{
    daemon::{Daemon, DaemonStatus, StopOutcome, pid_alive},
    heartbeat::SyncState,
    status::StatusReport,
};
use tempfile::tempdir;

#[test]
fn shutdown_stops_every_sync_process_and_clears_the_record() {
    let temp = tempdir().expect("failed to create tempdir");
    let tool = write_fake_tool(temp.path(), FakeTool::Chatty);
    let options = ConfigOptions {
        points: vec!["alpha", "beta"],
        ..ConfigOptions::default()
    };
    let config = write_config(temp.path(), &tool, &options);
    let settings = common::settings(&config);

    let shutdown = Arc::new(AtomicBool::new(false));
    let flag = Arc::clone(&shutdown);
    let daemon_settings = settings.clone();
    let supervisor = thread::spawn(move || Daemon::new(daemon_settings).run_foreground(&flag));

    let pids = wait_for_pids(&settings, Duration::from_secs(10));
    assert_eq!(pids.len(), 2);
    assert!(pids.iter().all(|pid| pid_alive(*pid)));

    let record = read_state(&settings).expect("state record");
    assert_eq!(record.status, DaemonStatus::Running);
    assert_eq!(record.pid, std::process::id());
    assert!(
        settings
            .sync_tool
            .profile_dir
            .join(format!("{}.prf", settings.sync_points[0].profile_name()))
            .exists()
    );

    let report = StatusReport::collect(&settings, chrono::Utc::now());
    assert_eq!(report.status, DaemonStatus::Running);
    assert!(report.sync_points.iter().all(|row| {
        row.state == SyncState::Starting.to_string() || row.state == SyncState::Healthy.to_string()
    }));

    shutdown.store(true, Ordering::SeqCst);
    supervisor
        .join()
        .expect("supervisor thread panicked")
        .expect("supervisor failed");

    assert!(read_state(&settings).is_none());
    assert!(wait_until(Duration::from_secs(5), || {
        pids.iter().all(|pid| !pid_alive(*pid))
    }));
}

#[test]
fn stop_twice_leaves_the_same_end_state() {
    let temp = tempdir().expect("failed to create tempdir");
    let tool = write_fake_tool(temp.path(), FakeTool::Chatty);
    let config = write_config(temp.path(), &tool, &ConfigOptions::default());
    let settings = common::settings(&config);
    let daemon = Daemon::new(settings.clone());

    assert_eq!(daemon.stop(false).unwrap(), StopOutcome::AlreadyStopped);
    assert!(read_state(&settings).is_none());
    assert_eq!(daemon.stop(false).unwrap(), StopOutcome::AlreadyStopped);
    assert!(read_state(&settings).is_none());

    let report = StatusReport::collect(&settings, chrono::Utc::now());
    assert_eq!(report.status, DaemonStatus::Stopped);
}

#[test]
fn second_supervisor_is_refused_while_first_holds_the_lock() {
    let temp = tempdir().expect("failed to create tempdir");
    let tool = write_fake_tool(temp.path(), FakeTool::Chatty);
    let config = write_config(temp.path(), &tool, &ConfigOptions::default());
    let settings = common::settings(&config);

    let shutdown = Arc::new(AtomicBool::new(false));
    let flag = Arc::clone(&shutdown);
    let first_settings = settings.clone();
    let first = thread::spawn(move || Daemon::new(first_settings).run_foreground(&flag));
    wait_for_pids(&settings, Duration::from_secs(10));

    let idle = AtomicBool::new(true);
    let err = Daemon::new(settings.clone())
        .run_foreground(&idle)
        .expect_err("second supervisor must not start");
    assert!(matches!(err, syncbeat::error::DaemonError::LockHeld(_)));

    shutdown.store(true, Ordering::SeqCst);
    first.join().unwrap().unwrap();
}
