//! Default runtime locations derived from `$HOME`.
use std::{
    env,
    path::{Path, PathBuf},
};

/// File name of the daemon state record inside the state directory.
pub const STATE_FILE: &str = "syncbeat.state.json";

/// File name of the instance lock inside the state directory.
pub const LOCK_FILE: &str = "syncbeat.lock";

/// File name of the supervisor's own log inside the log directory.
pub const SUPERVISOR_LOG: &str = "syncbeat.log";

/// Returns `$HOME` when it is set and non-empty.
pub fn home_dir() -> Option<PathBuf> {
    env::var_os("HOME")
        .filter(|value| !value.is_empty())
        .map(PathBuf::from)
}

/// Default state dir (~/.local/share/syncbeat).
pub fn default_state_dir(home: &Path) -> PathBuf {
    home.join(".local/share/syncbeat")
}

/// Default Unison profile directory (~/.unison).
pub fn default_profile_dir(home: &Path) -> PathBuf {
    home.join(".unison")
}

/// Per-user launchd agents directory.
pub fn launch_agents_dir(home: &Path) -> PathBuf {
    home.join("Library").join("LaunchAgents")
}

/// Expands a leading `~/` (or a bare `~`) against `home`.
pub fn expand_home(raw: &str, home: Option<&Path>) -> Option<PathBuf> {
    if raw == "~" {
        return home.map(Path::to_path_buf);
    }
    match raw.strip_prefix("~/") {
        Some(rest) => home.map(|home| home.join(rest)),
        None => Some(PathBuf::from(raw)),
    }
}
