//! Unison profile generation and binary discovery.
use std::{
    env, fs, io,
    path::{Path, PathBuf},
};

use tracing::{debug, info};

use crate::{config::SyncTool, sync_point::SyncPoint};

/// Name (without extension) of the profile shared by every sync point.
pub const COMMON_PROFILE: &str = "unison-common_settings";

const FALLBACK_LOCATIONS: [&str; 3] = [
    "/opt/homebrew/bin/unison",
    "/usr/local/bin/unison",
    "/usr/bin/unison",
];

/// Locates the `unison` executable on `PATH`, then in the usual install locations.
///
/// Falls back to the bare name so a missing binary surfaces as a spawn error per sync point.
pub fn discover_binary() -> PathBuf {
    if let Some(paths) = env::var_os("PATH") {
        for dir in env::split_paths(&paths) {
            let candidate = dir.join("unison");
            if candidate.is_file() {
                return candidate;
            }
        }
    }

    FALLBACK_LOCATIONS
        .iter()
        .map(PathBuf::from)
        .find(|path| path.is_file())
        .unwrap_or_else(|| PathBuf::from("unison"))
}

fn profile_path(profile_dir: &Path, name: &str) -> PathBuf {
    profile_dir.join(format!("{name}.prf"))
}

/// Renders the shared settings profile.
pub fn common_profile(tool: &SyncTool) -> String {
    let mut content = String::from(
        "ignore = Name {.DS_Store,.Spotlight-V100,.Trashes,.fseventsd}\n\
         ignore = Name {[._]*.s[a-v][a-z],[._]*.sw[a-p],[._]s[a-v][a-z],[._]sw[a-p]}\n\
         ignore = Path .unison\n",
    );
    for pattern in &tool.ignore {
        content.push_str(&format!("ignore = {}\n", pattern.trim()));
    }
    content.push_str(&format!(
        "ignorecase = false\n\
         repeat = {}\n\
         backup = Name *\n\
         maxbackups = 5\n\
         retry = 1\n\
         auto = true\n\
         batch = true\n\
         confirmbigdeletes = true\n\
         times = true\n\
         prefer = newer\n\
         terse = true\n\
         contactquietly = true\n\
         log = false\n",
        tool.repeat
    ));
    content
}

/// Renders the profile for one sync point.
pub fn point_profile(point: &SyncPoint) -> String {
    format!(
        "root = {}\nroot = {}\n\ninclude {COMMON_PROFILE}.prf\n",
        point.local_dir().display(),
        point.remote_root()
    )
}

/// Removes stale generated profiles, then writes the shared profile and one per sync point.
pub fn write_profiles(tool: &SyncTool, points: &[SyncPoint]) -> io::Result<()> {
    fs::create_dir_all(&tool.profile_dir)?;
    let removed = remove_profiles(&tool.profile_dir)?;
    if removed > 0 {
        debug!("Removed {removed} stale profile(s) from {:?}", tool.profile_dir);
    }

    fs::write(
        profile_path(&tool.profile_dir, COMMON_PROFILE),
        common_profile(tool),
    )?;
    for point in points {
        let path = profile_path(&tool.profile_dir, point.profile_name());
        fs::write(&path, point_profile(point))?;
        debug!("Wrote profile {:?} for {}", path, point);
    }

    info!(
        "Wrote {} sync profile(s) to {:?}",
        points.len(),
        tool.profile_dir
    );
    Ok(())
}

/// Deletes every `unison-*.prf` file in `profile_dir`, returning how many were removed.
pub fn remove_profiles(profile_dir: &Path) -> io::Result<usize> {
    let entries = match fs::read_dir(profile_dir) {
        Ok(entries) => entries,
        Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(0),
        Err(err) => return Err(err),
    };

    let mut removed = 0;
    for entry in entries {
        let path = entry?.path();
        let generated = path
            .file_name()
            .and_then(|name| name.to_str())
            .is_some_and(|name| name.starts_with("unison-") && name.ends_with(".prf"));
        if generated {
            fs::remove_file(&path)?;
            removed += 1;
        }
    }
    Ok(removed)
}
