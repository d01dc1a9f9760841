//! Mapping accepted connections to the OS user behind them.
//!
//! One [`IdentityResolver`] is chosen at startup from the platform and runs
//! once per connection, before the first request on it is read.

use std::io;

use serde::Serialize;
use tracing::debug;

use lodestar_protocol::transport::{ConnInfo, PeerCredentials, PipeHandle, TransportKind};

use crate::errors::IdentityError;
use crate::platform::Platform;

/// Who is on the other end of a connection.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ConnIdentity {
    pub transport: TransportKind,
    pub pid: Option<u32>,
    /// Session user id (a SID on Windows). Empty where the platform does not
    /// resolve one.
    pub user_id: String,
    pub username: Option<String>,
    #[serde(skip)]
    pub creds: Option<PeerCredentials>,
}

impl ConnIdentity {
    pub fn new(transport: TransportKind) -> Self {
        Self {
            transport,
            pid: None,
            user_id: String::new(),
            username: None,
            creds: None,
        }
    }

    pub fn is_unix_socket(&self) -> bool {
        self.transport == TransportKind::UnixSocket
    }

    pub fn creds(&self) -> Option<&PeerCredentials> {
        self.creds.as_ref()
    }

    /// Stable key for the account: the session user id, or the peer UID when
    /// only credentials are known.
    pub fn account_id(&self) -> Option<String> {
        if !self.user_id.is_empty() {
            return Some(self.user_id.clone());
        }
        self.creds.map(|c| c.user_id())
    }

    /// Name to show in messages about this identity.
    pub fn display_name(&self) -> String {
        self.username
            .clone()
            .or_else(|| self.account_id())
            .unwrap_or_else(|| "unknown user".to_string())
    }
}

pub trait IdentityResolver: Send + Sync {
    fn resolve(&self, conn: &dyn ConnInfo) -> Result<ConnIdentity, IdentityError>;
}

/// Native queries made while identifying a named pipe client.
pub trait PipeSystem: Send + Sync {
    fn client_process_id(&self, handle: PipeHandle) -> io::Result<u32>;

    fn user_id_of_pid(&self, pid: u32) -> io::Result<String>;

    fn username_of(&self, user_id: &str) -> io::Result<String>;
}

/// [`PipeSystem`] backed by the OS.
#[derive(Debug, Default, Clone, Copy)]
pub struct NativePipeSystem;

impl PipeSystem for NativePipeSystem {
    fn client_process_id(&self, handle: PipeHandle) -> io::Result<u32> {
        lodestar_sys::pipe::client_process_id(handle)
    }

    fn user_id_of_pid(&self, pid: u32) -> io::Result<String> {
        lodestar_sys::pipe::owner_sid_of_pid(pid)
    }

    fn username_of(&self, user_id: &str) -> io::Result<String> {
        lodestar_sys::pipe::account_for_sid(user_id).map(|account| account.qualified_name())
    }
}

/// Identifies named pipe clients: pipe → pid → user SID → account name.
pub struct PipeResolver<S = NativePipeSystem> {
    system: S,
}

impl PipeResolver<NativePipeSystem> {
    pub fn native() -> Self {
        Self {
            system: NativePipeSystem,
        }
    }
}

impl<S: PipeSystem> PipeResolver<S> {
    pub fn new(system: S) -> Self {
        Self { system }
    }
}

impl<S: PipeSystem> IdentityResolver for PipeResolver<S> {
    fn resolve(&self, conn: &dyn ConnInfo) -> Result<ConnIdentity, IdentityError> {
        let handle = conn.pipe_handle().ok_or_else(|| IdentityError::NotPipe {
            transport: conn.transport_kind(),
        })?;

        let pid = self
            .system
            .client_process_id(handle)
            .map_err(IdentityError::ClientPid)?;

        let user_id = self
            .system
            .user_id_of_pid(pid)
            .map_err(|source| IdentityError::PidToUser { pid, source })?;

        let username = self
            .system
            .username_of(&user_id)
            .map_err(|source| IdentityError::UserLookup {
                user_id: user_id.clone(),
                source,
            })?;

        debug!("Pipe client pid {} is {} ({})", pid, username, user_id);

        Ok(ConnIdentity {
            transport: TransportKind::Pipe,
            pid: Some(pid),
            user_id,
            username: Some(username),
            creds: None,
        })
    }
}

/// Identifies unix socket peers from kernel-reported credentials.
///
/// A connection without credentials still gets an identity; it simply
/// carries none, and the permission layer treats it accordingly.
#[derive(Debug, Default, Clone, Copy)]
pub struct CredentialResolver;

impl IdentityResolver for CredentialResolver {
    fn resolve(&self, conn: &dyn ConnInfo) -> Result<ConnIdentity, IdentityError> {
        let mut identity = ConnIdentity::new(conn.transport_kind());
        match conn.peer_credentials() {
            Some(creds) => {
                identity.pid = creds.pid;
                identity.creds = Some(creds);
                match lodestar_sys::users::name_for_uid(creds.uid) {
                    Ok(name) => identity.username = name,
                    Err(e) => debug!("No user name for uid {}: {}", creds.uid, e),
                }
            }
            None => debug!("No peer credentials on {} connection", identity.transport),
        }
        Ok(identity)
    }
}

/// The resolver used for connections on `platform`.
pub fn resolver_for(platform: Platform) -> Box<dyn IdentityResolver> {
    if platform.uses_named_pipes() {
        Box::new(PipeResolver::native())
    } else {
        Box::new(CredentialResolver)
    }
}

#[cfg(test)]
mod tests;
