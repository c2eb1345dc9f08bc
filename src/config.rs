//! Configuration management for syncbeat.
use regex::Regex;
use serde::Deserialize;
use std::{
    collections::HashMap,
    env, fs,
    path::{Path, PathBuf},
    time::Duration,
};
use tracing::debug;

use crate::{
    error::ConfigError,
    profile, runtime,
    sync_point::{SyncPoint, SyncPointId},
};

/// Default staleness multiplier (K).
pub const DEFAULT_STALE_MULTIPLIER: u32 = 2;
/// Default wait between SIGTERM and SIGKILL.
pub const DEFAULT_TERMINATION_GRACE_SECS: u64 = 5;
/// Default wait for the daemon to exit after `stop`.
pub const DEFAULT_SHUTDOWN_TIMEOUT_SECS: u64 = 30;
/// Default Unison `repeat` value.
pub const DEFAULT_REPEAT_SECS: u64 = 5;
/// Default heartbeat file written into each local directory.
pub const DEFAULT_HEARTBEAT_FILE: &str = ".unison-heartbeat";

/// Represents the structure of the configuration file.
#[derive(Debug, Deserialize, Clone)]
#[serde(deny_unknown_fields)]
pub struct Config {
    /// Directory holding one log file per sync point.
    pub log_dir: String,
    /// Seconds between heartbeat ticks.
    pub heartbeat_interval: u64,
    /// Line count above which a sync log is deleted.
    pub max_log_lines: u64,
    /// Multiplier K applied to the interval to decide staleness.
    pub stale_multiplier: Option<u32>,
    /// Seconds after a (re)start during which staleness is not evaluated.
    pub startup_grace: Option<u64>,
    /// Seconds to wait after SIGTERM before SIGKILL.
    pub termination_grace: Option<u64>,
    /// Seconds `stop` waits for the daemon to exit.
    pub shutdown_timeout: Option<u64>,
    /// Where the state record and lock live.
    pub state_dir: Option<String>,
    /// Whether to install the login auto-start entry.
    pub autostart: Option<bool>,
    /// Name of the heartbeat file; empty disables it.
    pub heartbeat_file: Option<String>,
    /// Sync tool settings.
    #[serde(default)]
    pub sync_tool: SyncToolConfig,
    /// Directory pairs to keep in sync.
    pub sync_points: Vec<SyncPointConfig>,
}

/// Sync tool section.
#[derive(Debug, Deserialize, Clone, Default)]
#[serde(deny_unknown_fields)]
pub struct SyncToolConfig {
    /// Explicit path to the `unison` binary.
    pub binary: Option<String>,
    /// Directory where profiles are written (`UNISON`).
    pub profile_dir: Option<String>,
    /// Seconds between sync polls inside the tool.
    pub repeat: Option<u64>,
    /// Additional `ignore = ...` lines.
    pub ignore: Option<Vec<String>>,
}

/// A single sync point entry.
#[derive(Debug, Deserialize, Clone)]
#[serde(deny_unknown_fields)]
pub struct SyncPointConfig {
    pub local_dir: String,
    pub ssh: String,
    pub remote_dir: String,
}

/// Resolved sync tool settings.
#[derive(Debug, Clone)]
pub struct SyncTool {
    pub binary: PathBuf,
    pub profile_dir: PathBuf,
    pub repeat: u64,
    pub ignore: Vec<String>,
}

/// Validated configuration consumed by the daemon.
#[derive(Debug, Clone)]
pub struct Settings {
    /// Absolute path of the file the settings came from, if any.
    pub config_path: Option<PathBuf>,
    pub log_dir: PathBuf,
    pub state_dir: PathBuf,
    pub heartbeat_interval: Duration,
    pub max_log_lines: u64,
    pub stale_multiplier: u32,
    pub startup_grace: Duration,
    pub termination_grace: Duration,
    pub shutdown_timeout: Duration,
    pub autostart: bool,
    pub heartbeat_file: Option<String>,
    pub sync_tool: SyncTool,
    pub sync_points: Vec<SyncPoint>,
}

impl Settings {
    /// Path of the daemon state record.
    pub fn state_path(&self) -> PathBuf {
        self.state_dir.join(runtime::STATE_FILE)
    }

    /// Path of the instance lock.
    pub fn lock_path(&self) -> PathBuf {
        self.state_dir.join(runtime::LOCK_FILE)
    }

    /// Path of the supervisor's own log when running detached.
    pub fn supervisor_log_path(&self) -> PathBuf {
        self.log_dir.join(runtime::SUPERVISOR_LOG)
    }

    /// Age beyond which a log (or the state record) counts as stale.
    pub fn stale_threshold(&self) -> Duration {
        self.heartbeat_interval * self.stale_multiplier
    }
}

impl Config {
    /// Validates the raw file contents and derives every path.
    ///
    /// Relative paths are resolved against `base_dir` (the directory holding the config file).
    pub fn resolve(
        self,
        base_dir: &Path,
        home: Option<&Path>,
    ) -> Result<Settings, ConfigError> {
        if self.heartbeat_interval == 0 {
            return Err(ConfigError::InvalidValue {
                field: "heartbeat_interval",
                reason: "must be greater than zero".into(),
            });
        }
        if self.max_log_lines == 0 {
            return Err(ConfigError::InvalidValue {
                field: "max_log_lines",
                reason: "must be greater than zero".into(),
            });
        }

        let stale_multiplier = self.stale_multiplier.unwrap_or(DEFAULT_STALE_MULTIPLIER);
        if stale_multiplier < 2 {
            return Err(ConfigError::InvalidValue {
                field: "stale_multiplier",
                reason: format!("must be at least 2, got {stale_multiplier}"),
            });
        }

        if self.sync_points.is_empty() {
            return Err(ConfigError::InvalidValue {
                field: "sync_points",
                reason: "at least one sync point is required".into(),
            });
        }

        let heartbeat_interval = Duration::from_secs(self.heartbeat_interval);
        let startup_grace = self
            .startup_grace
            .map(Duration::from_secs)
            .unwrap_or(heartbeat_interval * stale_multiplier);

        let log_dir = resolve_path("log_dir", &self.log_dir, base_dir, home)?;
        let state_dir = match &self.state_dir {
            Some(raw) => resolve_path("state_dir", raw, base_dir, home)?,
            None => runtime::default_state_dir(home.ok_or(ConfigError::MissingHome)?),
        };

        let profile_dir = match &self.sync_tool.profile_dir {
            Some(raw) => resolve_path("sync_tool.profile_dir", raw, base_dir, home)?,
            None => runtime::default_profile_dir(home.ok_or(ConfigError::MissingHome)?),
        };
        let binary = match &self.sync_tool.binary {
            Some(raw) => resolve_path("sync_tool.binary", raw, base_dir, home)?,
            None => profile::discover_binary(),
        };
        let repeat = self.sync_tool.repeat.unwrap_or(DEFAULT_REPEAT_SECS);
        if repeat == 0 {
            return Err(ConfigError::InvalidValue {
                field: "sync_tool.repeat",
                reason: "must be greater than zero".into(),
            });
        }

        let heartbeat_file = match self.heartbeat_file {
            Some(name) if name.trim().is_empty() => None,
            Some(name) => {
                if name.contains('/') {
                    return Err(ConfigError::InvalidValue {
                        field: "heartbeat_file",
                        reason: format!("'{name}' must be a plain file name"),
                    });
                }
                Some(name)
            }
            None => Some(DEFAULT_HEARTBEAT_FILE.to_string()),
        };

        let mut sync_points: Vec<SyncPoint> = Vec::with_capacity(self.sync_points.len());
        let mut seen: HashMap<(PathBuf, String, String), usize> = HashMap::new();
        for (index, entry) in self.sync_points.iter().enumerate() {
            let invalid = |reason: &str| ConfigError::InvalidSyncPoint {
                index,
                ssh: entry.ssh.clone(),
                remote_dir: entry.remote_dir.clone(),
                reason: reason.to_string(),
            };

            let ssh = entry.ssh.trim();
            if ssh.is_empty() {
                return Err(invalid("ssh host alias is empty"));
            }
            if ssh.chars().any(|c| c.is_whitespace() || c == '/') {
                return Err(invalid("ssh host alias must not contain whitespace or '/'"));
            }
            let remote_dir = entry.remote_dir.trim();
            if remote_dir.is_empty() {
                return Err(invalid("remote_dir is empty"));
            }
            if entry.local_dir.trim().is_empty() {
                return Err(invalid("local_dir is empty"));
            }
            let local_dir =
                resolve_path("sync_points.local_dir", entry.local_dir.trim(), base_dir, home)?;

            let key = (local_dir.clone(), ssh.to_string(), remote_dir.to_string());
            if let Some(first) = seen.get(&key) {
                return Err(ConfigError::DuplicateSyncPoint {
                    index,
                    first: *first,
                    local_dir: local_dir.display().to_string(),
                    ssh: ssh.to_string(),
                    remote_dir: remote_dir.to_string(),
                });
            }
            seen.insert(key, index);

            sync_points.push(SyncPoint::new(local_dir, ssh, remote_dir, &log_dir));
        }
        ensure_unique_ids(sync_points.iter().map(SyncPoint::id))?;

        Ok(Settings {
            config_path: None,
            log_dir,
            state_dir,
            heartbeat_interval,
            max_log_lines: self.max_log_lines,
            stale_multiplier,
            startup_grace,
            termination_grace: Duration::from_secs(
                self.termination_grace
                    .unwrap_or(DEFAULT_TERMINATION_GRACE_SECS),
            ),
            shutdown_timeout: Duration::from_secs(
                self.shutdown_timeout.unwrap_or(DEFAULT_SHUTDOWN_TIMEOUT_SECS),
            ),
            autostart: self.autostart.unwrap_or(true),
            heartbeat_file,
            sync_tool: SyncTool {
                binary,
                profile_dir,
                repeat,
                ignore: self.sync_tool.ignore.unwrap_or_default(),
            },
            sync_points,
        })
    }
}

/// Rejects two points that derived the same identifier, and with it the same log path.
fn ensure_unique_ids<'a>(
    ids: impl IntoIterator<Item = &'a SyncPointId>,
) -> Result<(), ConfigError> {
    let mut seen: HashMap<&SyncPointId, usize> = HashMap::new();
    for (index, id) in ids.into_iter().enumerate() {
        if let Some(first) = seen.insert(id, index) {
            return Err(ConfigError::SyncPointIdCollision {
                index,
                first,
                id: id.to_string(),
            });
        }
    }
    Ok(())
}

fn resolve_path(
    field: &'static str,
    raw: &str,
    base_dir: &Path,
    home: Option<&Path>,
) -> Result<PathBuf, ConfigError> {
    let expanded = runtime::expand_home(raw, home).ok_or(ConfigError::MissingHome)?;
    if expanded.as_os_str().is_empty() {
        return Err(ConfigError::InvalidValue {
            field,
            reason: "path is empty".into(),
        });
    }
    if expanded.is_absolute() {
        Ok(expanded)
    } else {
        Ok(base_dir.join(expanded))
    }
}

/// Expands `${VAR}` / `$VAR` references using the process environment.
fn expand_env_vars(input: &str) -> Result<String, ConfigError> {
    let re = Regex::new(r"\$\{?([A-Za-z_][A-Za-z0-9_]*)\}?")
        .expect("environment variable pattern is valid");

    let mut missing = None;
    let result = re.replace_all(input, |caps: &regex::Captures| {
        let var_name = &caps[1];
        match env::var(var_name) {
            Ok(value) => value,
            Err(_) => {
                missing.get_or_insert_with(|| var_name.to_string());
                String::new()
            }
        }
    });

    match missing {
        Some(var_name) => Err(ConfigError::MissingEnvVar(var_name)),
        None => Ok(result.into_owned()),
    }
}

/// Parses configuration text after environment expansion.
pub fn parse_config(content: &str) -> Result<Config, ConfigError> {
    let expanded = expand_env_vars(content)?;
    Ok(serde_yaml::from_str(&expanded)?)
}

/// Loads, expands and validates the configuration file.
pub fn load_config(config_path: &Path) -> Result<Settings, ConfigError> {
    let absolute = if config_path.is_absolute() {
        config_path.to_path_buf()
    } else {
        env::current_dir()
            .map_err(|source| ConfigError::Read {
                path: config_path.to_path_buf(),
                source,
            })?
            .join(config_path)
    };

    let content = fs::read_to_string(&absolute).map_err(|source| ConfigError::Read {
        path: absolute.clone(),
        source,
    })?;
    debug!("Loaded configuration from {:?}", absolute);

    let base_dir = absolute
        .parent()
        .map(Path::to_path_buf)
        .unwrap_or_else(|| PathBuf::from("/"));

    let home = runtime::home_dir();
    let mut settings = parse_config(&content)?.resolve(&base_dir, home.as_deref())?;
    settings.config_path = Some(absolute);
    Ok(settings)
}
