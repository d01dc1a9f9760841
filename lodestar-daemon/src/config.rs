//! Command line and environment configuration.

use std::path::PathBuf;
use std::time::Duration;

use clap::Parser;
use tracing::warn;

use lodestar_protocol::server::DEFAULT_IDLE_TIMEOUT;

use crate::errors::{DaemonError, Result};
use crate::permissions::resolve_user_id;
use crate::platform::Platform;

/// Settings the control server consults on every connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerConfig {
    pub platform: Platform,
    /// UID of the read-only operator account.
    pub operator_uid: Option<String>,
    /// Uid or username granted certificate access, as configured.
    pub permit_cert_uid: Option<String>,
    pub idle_timeout: Duration,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            platform: Platform::current(),
            operator_uid: None,
            permit_cert_uid: None,
            idle_timeout: DEFAULT_IDLE_TIMEOUT,
        }
    }
}

impl ServerConfig {
    pub fn for_platform(platform: Platform) -> Self {
        Self {
            platform,
            ..Self::default()
        }
    }
}

fn parse_octal_mode(s: &str) -> std::result::Result<u32, String> {
    let digits = s.strip_prefix("0o").unwrap_or(s);
    let mode = u32::from_str_radix(digits, 8)
        .map_err(|e| format!("invalid octal mode '{}': {}", s, e))?;
    if mode > 0o777 {
        return Err(format!("invalid mode '{}': only permission bits are allowed", s));
    }
    Ok(mode)
}

/// lodestar daemon - local control server
#[derive(Debug, Parser)]
#[command(name = "lodestard", about = "lodestar local control daemon", version)]
pub struct Args {
    /// Control socket path (named pipe name on Windows)
    #[arg(long, env = "LODESTAR_SOCKET")]
    pub socket: Option<PathBuf>,

    /// Directory for prefs and certificates
    #[arg(long, env = "LODESTAR_STATE_DIR")]
    pub state_dir: Option<PathBuf>,

    /// Platform whose identity and permission rules apply
    #[arg(long, env = "LODESTAR_PLATFORM")]
    pub platform: Option<Platform>,

    /// Read-only operator account (uid or username)
    #[arg(long, env = "LODESTAR_OPERATOR")]
    pub operator: Option<String>,

    /// Account allowed to fetch TLS certificates (uid or username)
    #[arg(long, env = "LODESTAR_PERMIT_CERT_UID")]
    pub permit_cert_uid: Option<String>,

    /// Close connections idle for this long
    #[arg(long, env = "LODESTAR_IDLE_TIMEOUT_MS", default_value_t = DEFAULT_IDLE_TIMEOUT.as_millis() as u64)]
    pub idle_timeout_ms: u64,

    /// File mode of the control socket, in octal
    #[arg(long, default_value = "666", value_parser = parse_octal_mode)]
    pub socket_mode: u32,
}

impl Args {
    pub fn socket_path(&self) -> Result<PathBuf> {
        self.socket
            .clone()
            .or_else(crate::default_socket_path)
            .ok_or_else(|| DaemonError::Config("cannot determine home directory; pass --socket".into()))
    }

    pub fn state_dir(&self) -> Result<PathBuf> {
        self.state_dir
            .clone()
            .or_else(crate::global_state_dir)
            .ok_or_else(|| {
                DaemonError::Config("cannot determine home directory; pass --state-dir".into())
            })
    }

    pub fn server_config(&self) -> ServerConfig {
        let operator_uid = self.operator.as_deref().and_then(|operator| {
            let uid = resolve_user_id(operator);
            if uid.is_none() {
                warn!("Operator '{}' could not be resolved; ignoring", operator);
            }
            uid
        });
        ServerConfig {
            platform: self.platform.unwrap_or_default(),
            operator_uid,
            permit_cert_uid: self.permit_cert_uid.clone().filter(|v| !v.is_empty()),
            idle_timeout: Duration::from_millis(self.idle_timeout_ms),
        }
    }
}
