//! In-memory transport carrying scripted connection metadata.

use std::io;
use std::pin::Pin;
use std::task::{Context, Poll};

use lodestar_protocol::transport::{ConnInfo, Listener, PeerCredentials, PipeHandle, TransportKind};
use tokio::io::{AsyncRead, AsyncWrite, DuplexStream, ReadBuf};
use tokio::sync::mpsc;

const DUPLEX_BUFFER: usize = 64 * 1024;

/// Server end of an in-memory connection.
pub struct TestConn {
    stream: DuplexStream,
    kind: TransportKind,
    creds: Option<PeerCredentials>,
    pipe: Option<PipeHandle>,
}

impl ConnInfo for TestConn {
    fn transport_kind(&self) -> TransportKind {
        self.kind
    }

    fn peer_credentials(&self) -> Option<PeerCredentials> {
        self.creds
    }

    fn pipe_handle(&self) -> Option<PipeHandle> {
        self.pipe
    }
}

impl AsyncRead for TestConn {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        Pin::new(&mut self.stream).poll_read(cx, buf)
    }
}

impl AsyncWrite for TestConn {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        Pin::new(&mut self.stream).poll_write(cx, buf)
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.stream).poll_flush(cx)
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.stream).poll_shutdown(cx)
    }
}

/// Listener fed by a [`MemoryConnector`].
///
/// Once every connector is dropped, `accept` stays pending rather than
/// reporting an error.
pub struct MemoryListener {
    rx: mpsc::UnboundedReceiver<io::Result<TestConn>>,
}

impl Listener for MemoryListener {
    type Conn = TestConn;

    async fn accept(&mut self) -> io::Result<TestConn> {
        match self.rx.recv().await {
            Some(result) => result,
            None => std::future::pending().await,
        }
    }

    fn local_addr(&self) -> String {
        "memory".to_string()
    }
}

/// Client side handle that opens connections to a [`MemoryListener`].
#[derive(Clone)]
pub struct MemoryConnector {
    tx: mpsc::UnboundedSender<io::Result<TestConn>>,
}

impl MemoryConnector {
    fn open(
        &self,
        kind: TransportKind,
        creds: Option<PeerCredentials>,
        pipe: Option<PipeHandle>,
    ) -> io::Result<DuplexStream> {
        let (client, server) = tokio::io::duplex(DUPLEX_BUFFER);
        let conn = TestConn {
            stream: server,
            kind,
            creds,
            pipe,
        };
        self.tx
            .send(Ok(conn))
            .map_err(|_| io::Error::new(io::ErrorKind::ConnectionRefused, "listener dropped"))?;
        Ok(client)
    }

    /// Connect as the named pipe client behind `handle`.
    pub fn connect_pipe(&self, handle: isize) -> io::Result<DuplexStream> {
        self.open(TransportKind::Pipe, None, Some(PipeHandle(handle)))
    }

    /// Connect as a unix socket peer with `creds`.
    pub fn connect_unix(&self, creds: Option<PeerCredentials>) -> io::Result<DuplexStream> {
        self.open(TransportKind::UnixSocket, creds, None)
    }

    /// Connect over a transport that is neither a pipe nor a unix socket.
    pub fn connect_other(&self) -> io::Result<DuplexStream> {
        self.open(TransportKind::Other, None, None)
    }

    /// Make the listener's next `accept` fail with `error`.
    pub fn fail_accept(&self, error: io::Error) -> io::Result<()> {
        self.tx
            .send(Err(error))
            .map_err(|_| io::Error::new(io::ErrorKind::ConnectionRefused, "listener dropped"))
    }
}

/// A connected listener/connector pair.
pub fn memory_transport() -> (MemoryListener, MemoryConnector) {
    let (tx, rx) = mpsc::unbounded_channel();
    (MemoryListener { rx }, MemoryConnector { tx })
}
