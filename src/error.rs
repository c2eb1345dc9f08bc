//! Error handling for syncbeat.
use std::{path::PathBuf, time::Duration};

use thiserror::Error;

/// Errors raised while loading or validating the configuration file.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// Error reading the configuration file.
    #[error("Failed to read config file {path}: {source}")]
    Read {
        /// Path that could not be read.
        path: PathBuf,
        /// The underlying error that occurred.
        #[source]
        source: std::io::Error,
    },

    /// Error parsing YAML configuration.
    #[error("Invalid YAML format: {0}")]
    Parse(#[from] serde_yaml::Error),

    /// A `${VAR}` reference could not be resolved.
    #[error("Missing environment variable: {0}")]
    MissingEnvVar(String),

    /// A top-level setting carries an unusable value.
    #[error("Invalid value for '{field}': {reason}")]
    InvalidValue {
        /// Name of the offending setting.
        field: &'static str,
        /// Human-readable explanation.
        reason: String,
    },

    /// A sync point entry is malformed.
    #[error("Invalid sync point #{index} ({ssh}:{remote_dir}): {reason}")]
    InvalidSyncPoint {
        /// Position of the entry in `sync_points`.
        index: usize,
        /// Host alias of the entry, possibly empty.
        ssh: String,
        /// Remote directory of the entry, possibly empty.
        remote_dir: String,
        /// Human-readable explanation.
        reason: String,
    },

    /// Two entries describe the same (local_dir, ssh, remote_dir) triple.
    #[error(
        "Duplicate sync point #{index}: {local_dir} <-> {ssh}:{remote_dir} is already configured as #{first}"
    )]
    DuplicateSyncPoint {
        /// Position of the repeated entry.
        index: usize,
        /// Position of the first occurrence.
        first: usize,
        /// Local directory of the duplicate.
        local_dir: String,
        /// Host alias of the duplicate.
        ssh: String,
        /// Remote directory of the duplicate.
        remote_dir: String,
    },

    /// Two distinct entries derived the same identifier and would share a log file.
    #[error("Sync point #{index} derives identifier '{id}', already used by #{first}")]
    SyncPointIdCollision {
        /// Position of the later entry.
        index: usize,
        /// Position of the entry that first used the identifier.
        first: usize,
        /// The shared identifier.
        id: String,
    },

    /// `HOME` is required to expand `~/` or derive default directories.
    #[error("HOME environment variable is not set")]
    MissingHome,
}

/// Errors raised while supervising an individual sync point.
#[derive(Debug, Error)]
pub enum SyncError {
    /// The sync tool could not be launched.
    #[error("Failed to start sync point '{point}': {reason}")]
    Spawn {
        /// Identifier of the sync point.
        point: String,
        /// Human-readable explanation.
        reason: String,
    },

    /// The process ignored SIGTERM for the whole grace period.
    #[error("Sync point '{point}' (PID {pid}) did not exit within {grace:?}")]
    ProcessTimeout {
        /// Identifier of the sync point.
        point: String,
        /// PID that refused to exit.
        pid: u32,
        /// Grace period that elapsed.
        grace: Duration,
    },

    /// Delivering a signal failed for a reason other than the process being gone.
    #[error("Failed to signal sync point '{point}' (PID {pid}): {source}")]
    Signal {
        /// Identifier of the sync point.
        point: String,
        /// Target PID.
        pid: u32,
        /// The underlying errno.
        #[source]
        source: nix::errno::Errno,
    },

    /// The log file could not be inspected or removed.
    #[error("Log file {path} unavailable: {source}")]
    LogAccess {
        /// Log path that failed.
        path: PathBuf,
        /// The underlying error that occurred.
        #[source]
        source: std::io::Error,
    },

    /// A live process already exists for this sync point.
    #[error("Sync point '{point}' already has a running process (PID {pid})")]
    AlreadyRunning {
        /// Identifier of the sync point.
        point: String,
        /// PID of the live process.
        pid: u32,
    },
}

/// Errors raised while installing or removing the login auto-start entry.
#[derive(Debug, Error)]
pub enum AutostartError {
    /// Filesystem error while writing or removing the entry.
    #[error("I/O error at {path}: {source}")]
    Io {
        /// Path that failed.
        path: PathBuf,
        /// The underlying error that occurred.
        #[source]
        source: std::io::Error,
    },

    /// The service manager rejected the request.
    #[error("launchd error: {0}")]
    Launchd(String),
}

/// Daemon-level errors. These are the only errors that abort the supervisor.
#[derive(Debug, Error)]
pub enum DaemonError {
    /// Configuration is unusable.
    #[error(transparent)]
    Config(#[from] ConfigError),

    /// A sync point operation failed.
    #[error(transparent)]
    Sync(#[from] SyncError),

    /// Auto-start registration failed.
    #[error(transparent)]
    Autostart(#[from] AutostartError),

    /// Error reading or writing the state record.
    #[error("State record error at {path}: {source}")]
    StateIo {
        /// Path of the record or lock.
        path: PathBuf,
        /// The underlying error that occurred.
        #[source]
        source: std::io::Error,
    },

    /// The state record is not valid JSON.
    #[error("Failed to parse state record: {0}")]
    StateParse(#[from] serde_json::Error),

    /// Another daemon holds the instance lock.
    #[error("Another syncbeat daemon holds the lock at {0}")]
    LockHeld(PathBuf),

    /// Signalling the daemon process failed.
    #[error("Failed to signal daemon (PID {pid}): {source}")]
    Signal {
        /// Daemon PID.
        pid: i32,
        /// The underlying errno.
        #[source]
        source: nix::errno::Errno,
    },

    /// Registering the shutdown handler failed.
    #[error("Failed to install shutdown handler: {0}")]
    Handler(#[from] ctrlc::Error),

    /// Generic I/O failure (daemonizing, logging setup).
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Some sync processes could not be stopped.
    #[error("Failed to stop sync point(s): {points:?}")]
    StopFailed {
        /// Identifiers of the sync points that are still running.
        points: Vec<String>,
    },
}

pub(crate) fn state_io(path: impl Into<PathBuf>, source: std::io::Error) -> DaemonError {
    DaemonError::StateIo {
        path: path.into(),
        source,
    }
}
