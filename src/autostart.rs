//! Login auto-start registration for the supervisor.
use std::{
    fs,
    path::{Path, PathBuf},
    process::Command,
};

use tracing::{debug, info, warn};

use crate::{error::AutostartError, runtime};

/// launchd label of the supervisor agent.
pub const LAUNCHD_LABEL: &str = "com.syncbeat.daemon";

/// Command the service manager should run at login.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AutostartEntry {
    pub program: PathBuf,
    pub args: Vec<String>,
    /// Where the service manager writes the supervisor's stdout/stderr.
    pub log_dir: PathBuf,
}

/// Install/remove capability for the OS service manager.
pub trait Autostart {
    fn register(&self, entry: &AutostartEntry) -> Result<(), AutostartError>;
    fn deregister(&self) -> Result<(), AutostartError>;
}

/// Writes a per-user launchd agent that runs the supervisor at login.
///
/// The agent is not loaded into the current session: the running supervisor is started
/// directly, and launchd picks the plist up at the next login.
pub struct LaunchdAutostart {
    plist_path: PathBuf,
}

impl LaunchdAutostart {
    pub fn new(home: &Path) -> Self {
        Self {
            plist_path: runtime::launch_agents_dir(home).join(format!("{LAUNCHD_LABEL}.plist")),
        }
    }

    pub fn plist_path(&self) -> &Path {
        &self.plist_path
    }
}

impl Autostart for LaunchdAutostart {
    fn register(&self, entry: &AutostartEntry) -> Result<(), AutostartError> {
        if let Some(dir) = self.plist_path.parent() {
            fs::create_dir_all(dir).map_err(|e| io_err(dir, e))?;
        }
        fs::create_dir_all(&entry.log_dir).map_err(|e| io_err(&entry.log_dir, e))?;
        fs::write(&self.plist_path, generate_plist(entry))
            .map_err(|e| io_err(&self.plist_path, e))?;
        info!("Installed launchd agent {:?}", self.plist_path);
        Ok(())
    }

    fn deregister(&self) -> Result<(), AutostartError> {
        if !self.plist_path.exists() {
            debug!("launchd agent {:?} not installed", self.plist_path);
            return Ok(());
        }

        let path = self.plist_path.display().to_string();
        let _ = run_launchctl(&["unload", path.as_str()], true);
        fs::remove_file(&self.plist_path).map_err(|e| io_err(&self.plist_path, e))?;
        info!("Removed launchd agent {:?}", self.plist_path);
        Ok(())
    }
}

/// Used where no service manager integration exists or auto-start is disabled.
pub struct NoopAutostart;

impl Autostart for NoopAutostart {
    fn register(&self, _entry: &AutostartEntry) -> Result<(), AutostartError> {
        Ok(())
    }

    fn deregister(&self) -> Result<(), AutostartError> {
        Ok(())
    }
}

/// Picks the registration backend for this platform.
pub fn platform_autostart(enabled: bool, home: Option<&Path>) -> Box<dyn Autostart> {
    if !enabled {
        return Box::new(NoopAutostart);
    }

    match home {
        Some(home) if cfg!(target_os = "macos") => Box::new(LaunchdAutostart::new(home)),
        Some(_) => {
            warn!("Login auto-start is only supported through launchd; skipping registration");
            Box::new(NoopAutostart)
        }
        None => {
            warn!("HOME is not set; skipping login auto-start registration");
            Box::new(NoopAutostart)
        }
    }
}

/// Renders the launchd agent plist.
pub fn generate_plist(entry: &AutostartEntry) -> String {
    let stdout = entry.log_dir.join("launchd-stdout.log").display().to_string();
    let stderr = entry.log_dir.join("launchd-stderr.log").display().to_string();
    let mut args = vec![xml_escape(&entry.program.display().to_string())];
    args.extend(entry.args.iter().map(|arg| xml_escape(arg)));
    let arguments: String = args
        .iter()
        .map(|arg| format!("    <string>{arg}</string>\n"))
        .collect();

    format!(
        r#"<?xml version="1.0" encoding="UTF-8"?>
<!DOCTYPE plist PUBLIC "-//Apple//DTD PLIST 1.0//EN" "http://www.apple.com/DTDs/PropertyList-1.0.dtd">
<plist version="1.0">
<dict>
  <key>Label</key>
  <string>{label}</string>
  <key>ProgramArguments</key>
  <array>
{arguments}  </array>
  <key>RunAtLoad</key>
  <true/>
  <key>KeepAlive</key>
  <true/>
  <key>StandardOutPath</key>
  <string>{stdout}</string>
  <key>StandardErrorPath</key>
  <string>{stderr}</string>
</dict>
</plist>
"#,
        label = LAUNCHD_LABEL,
        stdout = xml_escape(&stdout),
        stderr = xml_escape(&stderr),
    )
}

fn xml_escape(raw: &str) -> String {
    raw.replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
}

fn run_launchctl(args: &[&str], ignore_failure: bool) -> Result<(), AutostartError> {
    let output = Command::new("launchctl")
        .args(args)
        .output()
        .map_err(|e| io_err("launchctl", e))?;

    if output.status.success() || ignore_failure {
        return Ok(());
    }

    let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
    Err(AutostartError::Launchd(format!(
        "launchctl {} failed (status {}): {stderr}",
        args.join(" "),
        output.status
    )))
}

fn io_err(path: impl AsRef<Path>, source: std::io::Error) -> AutostartError {
    AutostartError::Io {
        path: path.as_ref().to_path_buf(),
        source,
    }
}
