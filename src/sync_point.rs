//! Static description of one synchronised directory pair.
use std::{
    fmt,
    path::{Path, PathBuf},
};

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

/// Stable identifier of a sync point. Doubles as the profile name and log file stem.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SyncPointId(String);

impl SyncPointId {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for SyncPointId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// One configured (local directory, remote host, remote directory) triple.
///
/// The identity, profile name and log path are all derived from the triple when the
/// point is built, so two points never share a log file unless they are the same point.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SyncPoint {
    id: SyncPointId,
    local_dir: PathBuf,
    ssh_host: String,
    remote_dir: String,
    log_path: PathBuf,
}

impl SyncPoint {
    /// Builds a sync point whose log lives under `log_dir`.
    pub fn new(
        local_dir: impl Into<PathBuf>,
        ssh_host: impl Into<String>,
        remote_dir: impl Into<String>,
        log_dir: &Path,
    ) -> Self {
        let local_dir = local_dir.into();
        let ssh_host = ssh_host.into();
        let remote_dir = remote_dir.into();
        let id = derive_id(&local_dir, &ssh_host, &remote_dir);
        let log_path = log_dir.join(format!("{id}.log"));

        Self {
            id,
            local_dir,
            ssh_host,
            remote_dir,
            log_path,
        }
    }

    pub fn id(&self) -> &SyncPointId {
        &self.id
    }

    pub fn local_dir(&self) -> &Path {
        &self.local_dir
    }

    pub fn ssh_host(&self) -> &str {
        &self.ssh_host
    }

    pub fn remote_dir(&self) -> &str {
        &self.remote_dir
    }

    pub fn log_path(&self) -> &Path {
        &self.log_path
    }

    /// Name of the Unison profile (without `.prf`).
    pub fn profile_name(&self) -> &str {
        self.id.as_str()
    }

    /// `ssh://host//remote` root understood by Unison.
    pub fn remote_root(&self) -> String {
        let remote = self.remote_dir.trim_start_matches('/');
        format!("ssh://{}//{}", self.ssh_host, remote)
    }

    /// Identity tuple used for duplicate detection.
    pub fn identity(&self) -> (&Path, &str, &str) {
        (&self.local_dir, &self.ssh_host, &self.remote_dir)
    }
}

impl fmt::Display for SyncPoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} <-> {}:{}",
            self.local_dir.display(),
            self.ssh_host,
            self.remote_dir
        )
    }
}

/// `unison-<ssh>-<remote leaf>-<hash8>`, restricted to filename-safe characters.
fn derive_id(local_dir: &Path, ssh_host: &str, remote_dir: &str) -> SyncPointId {
    let mut hasher = Sha256::new();
    hasher.update(local_dir.as_os_str().as_encoded_bytes());
    hasher.update([0u8]);
    hasher.update(ssh_host.as_bytes());
    hasher.update([0u8]);
    hasher.update(remote_dir.as_bytes());
    let digest = hasher.finalize();
    let short: String = digest[..4].iter().map(|b| format!("{b:02x}")).collect();

    let leaf = remote_dir
        .trim_end_matches('/')
        .rsplit('/')
        .next()
        .filter(|leaf| !leaf.is_empty())
        .unwrap_or("root");

    SyncPointId(format!(
        "unison-{}-{}-{}",
        sanitize(ssh_host),
        sanitize(leaf),
        short
    ))
}

fn sanitize(raw: &str) -> String {
    raw.chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-') {
                c
            } else {
                '_'
            }
        })
        .collect()
}
