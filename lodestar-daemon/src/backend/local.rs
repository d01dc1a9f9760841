use std::collections::HashMap;
use std::path::PathBuf;

use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};
use tracing::{info, warn};

use super::prefs::{Prefs, PrefsStore};
use super::{Backend, BackendState, BackendStatus, CertPair, StartOptions};
use crate::errors::{DaemonError, Result};
use crate::identity::ConnIdentity;

const CERTS_DIR: &str = "certs";

struct Inner {
    prefs: Prefs,
    /// Set when the prefs file exists but could not be loaded.
    prefs_error: Option<String>,
    state: BackendState,
    active_user: Option<String>,
    started_at: Option<DateTime<Utc>>,
    resets: u64,
    /// Certificates handed out during the current user's session.
    certs: HashMap<String, CertPair>,
}

/// In-process backend keeping its preferences under the state directory.
pub struct LocalBackend {
    store: PrefsStore,
    operator_uid: Option<String>,
    /// Serializes prefs writers so the file and `inner.prefs` agree.
    save_lock: Mutex<()>,
    inner: RwLock<Inner>,
}

impl LocalBackend {
    pub fn open(state_dir: PathBuf, operator_uid: Option<String>) -> Self {
        let store = PrefsStore::new(state_dir);
        let (prefs, prefs_error) = match store.load() {
            Ok(prefs) => (prefs.unwrap_or_default(), None),
            Err(e) => {
                warn!("{}; the backend will not be started", e);
                (Prefs::default(), Some(e.to_string()))
            }
        };
        Self {
            store,
            operator_uid,
            save_lock: Mutex::new(()),
            inner: RwLock::new(Inner {
                prefs,
                prefs_error,
                state: BackendState::NoState,
                active_user: None,
                started_at: None,
                resets: 0,
                certs: HashMap::new(),
            }),
        }
    }

    pub fn prefs(&self) -> Prefs {
        self.inner.read().prefs.clone()
    }

    fn cert_paths(&self, domain: &str) -> (PathBuf, PathBuf) {
        let dir = self.store.state_dir().join(CERTS_DIR);
        (
            dir.join(format!("{}.crt", domain)),
            dir.join(format!("{}.key", domain)),
        )
    }
}

fn validate_domain(domain: &str) -> Result<()> {
    let valid = !domain.is_empty()
        && !domain.starts_with('.')
        && domain
            .bytes()
            .all(|b| b.is_ascii_alphanumeric() || b == b'.' || b == b'-');
    if valid {
        Ok(())
    } else {
        Err(DaemonError::Cert {
            domain: domain.to_string(),
            reason: "invalid domain name".into(),
        })
    }
}

impl Backend for LocalBackend {
    fn check_connection_allowed(&self, identity: &ConnIdentity) -> std::result::Result<(), String> {
        let inner = self.inner.read();
        if !inner.prefs.persistent_server_mode || identity.user_id.is_empty() {
            return Ok(());
        }
        match &inner.prefs.persistent_owner {
            Some(owner) if *owner != identity.user_id => {
                Err(format!("already in use by {} in server mode", owner))
            }
            _ => Ok(()),
        }
    }

    fn set_active_user(&self, user_id: &str) {
        let mut inner = self.inner.write();
        inner.active_user = Some(user_id.to_string());
        // Resume a backend that was stopped by a reset
        if inner.state == BackendState::Stopped && inner.started_at.is_some() && inner.prefs.auto_start
        {
            inner.state = BackendState::Running;
        }
    }

    fn reset_for_disconnect(&self) {
        let mut inner = self.inner.write();
        inner.resets += 1;
        inner.active_user = None;
        inner.certs.clear();
        if inner.state != BackendState::NoState {
            inner.state = BackendState::Stopped;
        }
        info!("Backend session state cleared (reset #{})", inner.resets);
    }

    fn is_persistent_server_mode(&self) -> bool {
        self.inner.read().prefs.persistent_server_mode
    }

    fn config_valid(&self) -> bool {
        self.inner.read().prefs_error.is_none()
    }

    fn start(&self, options: StartOptions) {
        let mut inner = self.inner.write();
        inner.started_at = Some(Utc::now());
        inner.state = if inner.prefs.auto_start {
            BackendState::Running
        } else {
            BackendState::Stopped
        };
        info!(
            "Backend started (state {}, frontend {})",
            inner.state,
            options.frontend_log_id.as_deref().unwrap_or("none")
        );
    }

    fn shutdown(&self) {
        let mut inner = self.inner.write();
        inner.state = BackendState::Stopped;
        inner.certs.clear();
        info!("Backend shut down");
    }

    fn status(&self) -> BackendStatus {
        let inner = self.inner.read();
        BackendStatus {
            state: inner.state,
            version: env!("CARGO_PKG_VERSION").to_string(),
            active_user: inner.active_user.clone(),
            persistent_server_mode: inner.prefs.persistent_server_mode,
            persistent_owner: inner.prefs.persistent_owner.clone(),
            started_at: inner.started_at,
            resets: inner.resets,
        }
    }

    fn operator_user_id(&self) -> Option<String> {
        self.operator_uid.clone()
    }

    fn set_persistent_server_mode(&self, enabled: bool, owner: Option<&str>) -> Result<()> {
        let _saving = self.save_lock.lock();
        let mut prefs = {
            let inner = self.inner.read();
            if let Some(e) = &inner.prefs_error {
                return Err(DaemonError::PrefsInvalid(e.clone()));
            }
            inner.prefs.clone()
        };
        prefs.persistent_server_mode = enabled;
        prefs.persistent_owner = if enabled {
            owner.map(str::to_string)
        } else {
            None
        };

        // File I/O happens without the state lock held
        self.store.save(&prefs)?;

        let mut inner = self.inner.write();
        if let Some(e) = &inner.prefs_error {
            return Err(DaemonError::PrefsInvalid(e.clone()));
        }
        info!(
            "Persistent server mode {} (owner {})",
            if enabled { "enabled" } else { "disabled" },
            prefs.persistent_owner.as_deref().unwrap_or("none")
        );
        inner.prefs = prefs;
        Ok(())
    }

    fn cert_pair(&self, domain: &str) -> Result<CertPair> {
        validate_domain(domain)?;
        if let Some(pair) = self.inner.read().certs.get(domain) {
            return Ok(pair.clone());
        }

        let (cert_path, key_path) = self.cert_paths(domain);
        let read = |path: &PathBuf| {
            std::fs::read_to_string(path).map_err(|e| DaemonError::Cert {
                domain: domain.to_string(),
                reason: format!("{}: {}", path.display(), e),
            })
        };
        let pair = CertPair {
            cert_pem: read(&cert_path)?,
            key_pem: read(&key_path)?,
        };
        self.inner
            .write()
            .certs
            .insert(domain.to_string(), pair.clone());
        Ok(pair)
    }
}
