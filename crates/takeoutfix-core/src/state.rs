//! Resume state, keyed by archive name and fingerprint.
//!
//! The state file records which archives have already been extracted (and
//! whether their ZIPs were deleted) so a rerun skips them. Writes are
//! atomic: serialize to a temp file in the same directory, fsync, rename
//! over the target.

use std::fs::{self, File};
use std::io::Write;
use std::path::{Path, PathBuf};

use chrono::Utc;
use serde::{Deserialize, Serialize};
use thiserror::Error;

const STATE_DIR: &str = ".takeoutfix";
const STATE_FILE: &str = "state.json";

#[derive(Debug, Error)]
pub enum StateError {
    #[error("read state: {0}")]
    Read(#[source] std::io::Error),
    #[error("parse state: {0}")]
    Parse(#[source] serde_json::Error),
    #[error("write state: {0}")]
    Write(#[source] std::io::Error),
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArchiveState {
    pub fingerprint: String,
    pub extracted: bool,
    pub deleted: bool,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RunState {
    #[serde(default)]
    pub archives: std::collections::BTreeMap<String, ArchiveState>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_run_at: Option<String>,
}

pub fn state_path(workdir: &Path) -> PathBuf {
    workdir.join(STATE_DIR).join(STATE_FILE)
}

impl RunState {
    pub fn new() -> Self {
        Self::default()
    }

    /// A missing file is an empty state; an unreadable or unparsable file is
    /// an error the caller may downgrade to a warning.
    pub fn load(path: &Path) -> Result<Self, StateError> {
        let data = match fs::read(path) {
            Ok(data) => data,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(Self::new()),
            Err(err) => return Err(StateError::Read(err)),
        };
        serde_json::from_slice(&data).map_err(StateError::Parse)
    }

    pub fn save(&mut self, path: &Path) -> Result<(), StateError> {
        self.last_run_at = Some(Utc::now().to_rfc3339());

        let dir = path.parent().unwrap_or(Path::new("."));
        fs::create_dir_all(dir).map_err(StateError::Write)?;

        let data = serde_json::to_vec_pretty(self).expect("state serializes");
        let tmp_path = path.with_extension("json.tmp");
        {
            let mut tmp = File::create(&tmp_path).map_err(StateError::Write)?;
            tmp.write_all(&data).map_err(StateError::Write)?;
            tmp.sync_all().map_err(StateError::Write)?;
        }
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            fs::set_permissions(&tmp_path, fs::Permissions::from_mode(0o600))
                .map_err(StateError::Write)?;
        }
        fs::rename(&tmp_path, path).map_err(StateError::Write)
    }

    /// True when the archive was already extracted under an unchanged
    /// fingerprint.
    pub fn should_skip_extraction(&self, archive_name: &str, fingerprint: &str) -> bool {
        self.archives
            .get(archive_name)
            .map(|entry| entry.extracted && entry.fingerprint == fingerprint)
            .unwrap_or(false)
    }

    pub fn record(&mut self, archive_name: &str, entry: ArchiveState) {
        self.archives.insert(archive_name.to_string(), entry);
    }
}
