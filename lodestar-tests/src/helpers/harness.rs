//! Runs a control server over the in-memory transport.

use std::io;
use std::sync::Arc;
use std::time::Duration;

use lodestar_daemon::config::ServerConfig;
use lodestar_daemon::identity::{CredentialResolver, IdentityResolver, PipeResolver};
use lodestar_daemon::platform::Platform;
use lodestar_daemon::server::Server;
use lodestar_protocol::client::Client;
use lodestar_protocol::errors::ServerError;
use lodestar_protocol::transport::PeerCredentials;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use super::backend::RecordingBackend;
use super::conn::{MemoryConnector, memory_transport};
use super::pipes::FakePipeSystem;

/// A running [`Server`] with a [`RecordingBackend`] and a connector.
///
/// Pipe platforms identify clients through the given [`FakePipeSystem`];
/// every other platform reads the credentials attached to the connection.
pub struct ServerHarness {
    pub server: Arc<Server>,
    pub backend: Arc<RecordingBackend>,
    pub connector: MemoryConnector,
    cancel: CancellationToken,
    task: JoinHandle<Result<(), ServerError>>,
}

impl ServerHarness {
    /// Default config for `platform` with a short idle timeout.
    pub fn config(platform: Platform) -> ServerConfig {
        ServerConfig {
            idle_timeout: Duration::from_millis(500),
            ..ServerConfig::for_platform(platform)
        }
    }

    /// Start a server with a fresh backend bound before `run`.
    pub fn start(config: ServerConfig, pipes: FakePipeSystem) -> Self {
        let backend = Arc::new(RecordingBackend::new());
        let harness = Self::start_unbound(config, pipes, Arc::clone(&backend));
        harness.server.bind_backend(backend);
        harness
    }

    /// Start a server without binding `backend`; call [`ServerHarness::bind`].
    pub fn start_unbound(
        config: ServerConfig,
        pipes: FakePipeSystem,
        backend: Arc<RecordingBackend>,
    ) -> Self {
        let resolver: Box<dyn IdentityResolver> = if config.platform.uses_named_pipes() {
            Box::new(PipeResolver::new(pipes))
        } else {
            Box::new(CredentialResolver)
        };
        let server = Arc::new(Server::with_resolver(config, resolver));
        let (listener, connector) = memory_transport();
        let cancel = CancellationToken::new();
        let task = tokio::spawn(Arc::clone(&server).run(listener, cancel.clone()));
        Self {
            server,
            backend,
            connector,
            cancel,
            task,
        }
    }

    pub fn bind(&self) {
        self.server.bind_backend(self.backend.clone());
    }

    pub fn connect_pipe(&self, handle: isize) -> io::Result<Client> {
        Ok(Client::from_stream(self.connector.connect_pipe(handle)?))
    }

    pub fn connect_unix(&self, creds: Option<PeerCredentials>) -> io::Result<Client> {
        Ok(Client::from_stream(self.connector.connect_unix(creds)?))
    }

    pub fn connect_other(&self) -> io::Result<Client> {
        Ok(Client::from_stream(self.connector.connect_other()?))
    }

    /// Wait until the server has no requests in flight.
    pub async fn wait_idle(&self, timeout: Duration) -> bool {
        wait_until(timeout, || self.server.active_request_count() == 0).await
    }

    /// Whether `run` has returned.
    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }

    /// Cancel the server and wait for `run` to return.
    pub async fn stop(self) -> Result<(), ServerError> {
        self.cancel.cancel();
        self.join().await
    }

    /// Wait for `run` to return without cancelling it.
    pub async fn join(self) -> Result<(), ServerError> {
        match tokio::time::timeout(Duration::from_secs(5), self.task).await {
            Ok(Ok(result)) => result,
            Ok(Err(e)) => std::panic::resume_unwind(e.into_panic()),
            Err(_) => panic!("server did not stop within 5s"),
        }
    }
}

/// Poll `condition` every few milliseconds until it holds or `timeout` passes.
pub async fn wait_until(timeout: Duration, mut condition: impl FnMut() -> bool) -> bool {
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        if condition() {
            return true;
        }
        if tokio::time::Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}
