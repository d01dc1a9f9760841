//! The backend the control server fronts.
//!
//! The server never looks inside the backend; it only needs the calls below
//! to enforce the session rules and to start and stop it.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::errors::{DaemonError, Result};
use crate::identity::ConnIdentity;

pub mod local;
pub mod prefs;

pub use local::LocalBackend;

/// Options passed to [`Backend::start`].
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StartOptions {
    /// Log id of the frontend that triggered the start, if any.
    pub frontend_log_id: Option<String>,
    /// Pre-authorized key to log in with.
    pub auth_key: Option<String>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum BackendState {
    #[default]
    NoState,
    Stopped,
    Starting,
    Running,
}

impl BackendState {
    pub fn as_str(&self) -> &'static str {
        match self {
            BackendState::NoState => "NoState",
            BackendState::Stopped => "Stopped",
            BackendState::Starting => "Starting",
            BackendState::Running => "Running",
        }
    }
}

impl fmt::Display for BackendState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Snapshot reported by `GET /localapi/v0/status` and the status page.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BackendStatus {
    pub state: BackendState,
    pub version: String,
    pub active_user: Option<String>,
    pub persistent_server_mode: bool,
    pub persistent_owner: Option<String>,
    pub started_at: Option<DateTime<Utc>>,
    /// Resets since the backend was created.
    pub resets: u64,
}

/// A TLS certificate and its private key, PEM encoded.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CertPair {
    pub cert_pem: String,
    pub key_pem: String,
}

pub trait Backend: Send + Sync {
    /// Backend policy on a new request. `Err` carries the reason shown to the caller.
    fn check_connection_allowed(&self, identity: &ConnIdentity) -> std::result::Result<(), String>;

    /// Record the user whose session the backend now serves.
    fn set_active_user(&self, user_id: &str);

    /// Drop all per-user session state.
    fn reset_for_disconnect(&self);

    /// Whether the backend keeps running with no clients connected.
    fn is_persistent_server_mode(&self) -> bool;

    /// Whether the stored configuration is usable. The backend is not
    /// started while this is false.
    fn config_valid(&self) -> bool;

    fn start(&self, options: StartOptions);

    fn shutdown(&self);

    fn status(&self) -> BackendStatus;

    /// UID of the read-only operator account, if configured.
    fn operator_user_id(&self) -> Option<String> {
        None
    }

    /// Turn persistent server mode on or off on behalf of `owner`.
    fn set_persistent_server_mode(&self, _enabled: bool, _owner: Option<&str>) -> Result<()> {
        Err(DaemonError::Unsupported("persistent server mode"))
    }

    fn cert_pair(&self, domain: &str) -> Result<CertPair> {
        Err(DaemonError::Cert {
            domain: domain.to_string(),
            reason: "certificates are not supported by this backend".into(),
        })
    }
}
