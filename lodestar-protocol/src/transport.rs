//! Local transports for the control socket.
//!
//! A [`Listener`] yields connections that, besides being byte streams, carry
//! the metadata the identity layer needs: a native pipe handle on Windows, or
//! the kernel-reported peer credentials of a unix socket.

use std::future::Future;
use std::io;
#[cfg(unix)]
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tokio::io::{AsyncRead, AsyncWrite};

pub use lodestar_sys::credentials::PeerCredentials;
pub use lodestar_sys::pipe::PipeHandle;

#[cfg(unix)]
use crate::errors::ServerError;

/// Which kind of local channel a connection arrived on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TransportKind {
    Pipe,
    UnixSocket,
    Other,
}

impl TransportKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            TransportKind::Pipe => "pipe",
            TransportKind::UnixSocket => "unix",
            TransportKind::Other => "other",
        }
    }
}

impl std::fmt::Display for TransportKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// OS-level facts about an accepted connection.
pub trait ConnInfo {
    fn transport_kind(&self) -> TransportKind;

    /// Peer UID/GID/PID, when the transport carries them.
    fn peer_credentials(&self) -> Option<PeerCredentials> {
        None
    }

    /// Native handle usable to query the client process, for pipe transports.
    fn pipe_handle(&self) -> Option<PipeHandle> {
        None
    }
}

/// A byte stream accepted from a [`Listener`].
pub trait LocalConn: ConnInfo + AsyncRead + AsyncWrite + Unpin + Send + 'static {}

impl<T> LocalConn for T where T: ConnInfo + AsyncRead + AsyncWrite + Unpin + Send + 'static {}

/// The listening side of a local transport.
///
/// Dropping the listener stops accepting new connections.
pub trait Listener: Send + 'static {
    type Conn: LocalConn;

    fn accept(&mut self) -> impl Future<Output = io::Result<Self::Conn>> + Send;

    /// Address for log messages.
    fn local_addr(&self) -> String;
}

#[cfg(unix)]
impl ConnInfo for tokio::net::UnixStream {
    fn transport_kind(&self) -> TransportKind {
        TransportKind::UnixSocket
    }

    fn peer_credentials(&self) -> Option<PeerCredentials> {
        let cred = self.peer_cred().ok()?;
        Some(PeerCredentials {
            uid: cred.uid(),
            gid: cred.gid(),
            pid: cred.pid().and_then(|pid| u32::try_from(pid).ok()),
        })
    }
}

/// Default file mode for the control socket. Access control happens per
/// request, so every local user may connect.
pub const DEFAULT_SOCKET_MODE: u32 = 0o666;

/// Unix domain socket listener that owns its socket file.
#[cfg(unix)]
pub struct UnixSocketListener {
    inner: tokio::net::UnixListener,
    path: PathBuf,
}

#[cfg(unix)]
impl UnixSocketListener {
    /// Bind at `path`, replacing a stale socket file and applying `mode`.
    ///
    /// Must be called from within a tokio runtime.
    pub fn bind(path: impl Into<PathBuf>, mode: u32) -> Result<Self, ServerError> {
        use std::os::unix::fs::PermissionsExt;

        let path = path.into();

        // Reject symlinked socket path before any operations
        if let Ok(meta) = std::fs::symlink_metadata(&path)
            && meta.file_type().is_symlink()
        {
            return Err(ServerError::SocketSymlink { socket_path: path });
        }

        // Remove stale socket file (atomic - avoid TOCTOU race)
        match std::fs::remove_file(&path) {
            Ok(()) => {}
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => {
                return Err(ServerError::StaleSocket {
                    socket_path: path,
                    source: e,
                });
            }
        }

        let inner = tokio::net::UnixListener::bind(&path).map_err(|e| ServerError::Bind {
            socket_path: path.clone(),
            source: e,
        })?;

        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(mode)).map_err(|e| {
            ServerError::SocketPermissions {
                socket_path: path.clone(),
                source: e,
            }
        })?;

        Ok(Self { inner, path })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

#[cfg(unix)]
impl Listener for UnixSocketListener {
    type Conn = tokio::net::UnixStream;

    async fn accept(&mut self) -> io::Result<Self::Conn> {
        let (stream, _) = self.inner.accept().await?;
        Ok(stream)
    }

    fn local_addr(&self) -> String {
        self.path.display().to_string()
    }
}

#[cfg(unix)]
impl Drop for UnixSocketListener {
    fn drop(&mut self) {
        let _ = std::fs::remove_file(&self.path);
    }
}

#[cfg(windows)]
pub use self::windows::NamedPipeListener;

#[cfg(windows)]
mod windows {
    use std::io;
    use std::os::windows::io::AsRawHandle;

    use lodestar_sys::pipe::{LOCAL_USERS_PIPE_SDDL, PipeSecurity};
    use tokio::net::windows::named_pipe::{NamedPipeServer, ServerOptions};

    use super::{ConnInfo, Listener, PipeHandle, TransportKind};

    impl ConnInfo for NamedPipeServer {
        fn transport_kind(&self) -> TransportKind {
            TransportKind::Pipe
        }

        fn pipe_handle(&self) -> Option<PipeHandle> {
            Some(PipeHandle(self.as_raw_handle() as isize))
        }
    }

    /// Named pipe listener. Each accept hands out the connected instance and
    /// creates the next one under the same name.
    ///
    /// Every instance carries a DACL letting local users read and write.
    pub struct NamedPipeListener {
        name: String,
        security: PipeSecurity,
        next: NamedPipeServer,
    }

    fn create_instance(
        name: &str,
        security: &PipeSecurity,
        first: bool,
    ) -> io::Result<NamedPipeServer> {
        // SAFETY: the attributes outlive the call; CreateNamedPipeW copies the descriptor.
        unsafe {
            ServerOptions::new()
                .first_pipe_instance(first)
                .reject_remote_clients(true)
                .create_with_security_attributes_raw(name, security.as_ptr())
        }
    }

    impl NamedPipeListener {
        pub fn bind(name: impl Into<String>) -> io::Result<Self> {
            let name = name.into();
            let security = PipeSecurity::from_sddl(LOCAL_USERS_PIPE_SDDL)?;
            let next = create_instance(&name, &security, true)?;
            Ok(Self {
                name,
                security,
                next,
            })
        }
    }

    impl Listener for NamedPipeListener {
        type Conn = NamedPipeServer;

        async fn accept(&mut self) -> io::Result<Self::Conn> {
            self.next.connect().await?;
            let fresh = create_instance(&self.name, &self.security, false)?;
            Ok(std::mem::replace(&mut self.next, fresh))
        }

        fn local_addr(&self) -> String {
            self.name.clone()
        }
    }
}
