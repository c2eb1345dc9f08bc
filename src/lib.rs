//! syncbeat keeps continuous Unison syncs alive. It runs one `unison` process per
//! configured sync point, watches each process's log for activity, and restarts only the
//! sync points whose logs have gone quiet.

/// Login auto-start registration.
pub mod autostart;

/// CLI interface.
pub mod cli;

/// Configuration loading and validation.
pub mod config;

/// Supervisor lifecycle and state record.
pub mod daemon;

/// Error handling.
pub mod error;

/// Per-tick liveness evaluation.
pub mod heartbeat;

/// Sync log inspection and maintenance.
pub mod logs;

/// Sync process lifecycle.
pub mod process;

/// Generated sync tool profiles.
pub mod profile;

/// Well-known paths.
pub mod runtime;

/// Status reporting.
pub mod status;

/// Sync point identity.
pub mod sync_point;

#[cfg(test)]
pub(crate) mod test_utils;
