//! Backend preferences persisted in the state directory.
//!
//! Preferences live in `<state-dir>/prefs.yaml`. A missing file means
//! defaults; a file that does not parse is reported so the caller can refuse
//! to start on it.

use std::io::Write;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::errors::{DaemonError, Result};

const PREFS_FILE: &str = "prefs.yaml";

fn default_true() -> bool {
    true
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Prefs {
    /// Keep the backend running when no client is connected.
    #[serde(default)]
    pub persistent_server_mode: bool,
    /// Account that turned persistent server mode on.
    #[serde(default)]
    pub persistent_owner: Option<String>,
    /// Bring the backend up as soon as it is started.
    #[serde(default = "default_true")]
    pub auto_start: bool,
}

impl Default for Prefs {
    fn default() -> Self {
        Self {
            persistent_server_mode: false,
            persistent_owner: None,
            auto_start: true,
        }
    }
}

pub struct PrefsStore {
    state_dir: PathBuf,
}

impl PrefsStore {
    pub fn new(state_dir: PathBuf) -> Self {
        Self { state_dir }
    }

    pub fn path(&self) -> PathBuf {
        self.state_dir.join(PREFS_FILE)
    }

    pub fn state_dir(&self) -> &Path {
        &self.state_dir
    }

    /// Load prefs, or `None` if none were saved yet.
    pub fn load(&self) -> Result<Option<Prefs>> {
        let path = self.path();
        let content = match std::fs::read_to_string(&path) {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                debug!("No prefs at {}", path.display());
                return Ok(None);
            }
            Err(source) => return Err(DaemonError::PrefsRead { path, source }),
        };
        let prefs = serde_yaml::from_str(&content)
            .map_err(|source| DaemonError::PrefsParse { path, source })?;
        Ok(Some(prefs))
    }

    pub fn save(&self, prefs: &Prefs) -> Result<()> {
        let content = serde_yaml::to_string(prefs).map_err(DaemonError::PrefsEncode)?;
        write_secure_file(&self.path(), content.as_bytes())
    }
}

/// Write a file atomically with 0o600 permissions on unix.
fn write_secure_file(path: &Path, content: &[u8]) -> Result<()> {
    let parent = path.parent().ok_or_else(|| {
        DaemonError::Internal(format!("No parent directory for '{}'", path.display()))
    })?;

    let mut tmp = tempfile::NamedTempFile::new_in(parent).map_err(|e| {
        DaemonError::Internal(format!("Failed to create temp file in '{}': {}", parent.display(), e))
    })?;

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        tmp.as_file()
            .set_permissions(std::fs::Permissions::from_mode(0o600))
            .map_err(|e| {
                DaemonError::Internal(format!("Failed to set permissions on temp file: {}", e))
            })?;
    }

    tmp.write_all(content)
        .map_err(|e| DaemonError::Internal(format!("Failed to write temp file: {}", e)))?;

    tmp.persist(path).map_err(|e| {
        DaemonError::Internal(format!("Failed to persist '{}': {}", path.display(), e))
    })?;

    Ok(())
}
