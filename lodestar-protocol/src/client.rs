use std::future::Future;
use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use dashmap::DashMap;
use tokio::{
    io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt},
    sync::{mpsc, oneshot},
    task::JoinHandle,
};
use tracing::debug;

use crate::{
    errors::ClientError,
    protocol::{
        MAX_MESSAGE_SIZE, Request, RequestEnvelope, Response, decode_response,
        encode_envelope,
    },
};

pub type Result<T> = std::result::Result<T, ClientError>;

/// Bounded channel capacity for the client writer task.
const WRITER_CHANNEL_CAPACITY: usize = 64;

/// Multiplexing client for the control socket.
///
/// Several requests may be in flight at once; responses are matched to
/// callers by request ID.
pub struct Client {
    writer_tx: mpsc::Sender<Vec<u8>>,
    pending: Arc<DashMap<u64, oneshot::Sender<Response>>>,
    next_id: AtomicU64,
    reader_handle: JoinHandle<()>,
    _writer_handle: JoinHandle<()>,
}

impl Client {
    /// Connect to the daemon's unix socket.
    #[cfg(unix)]
    pub async fn connect(socket_path: &Path) -> Result<Self> {
        let stream = tokio::net::UnixStream::connect(socket_path)
            .await
            .map_err(|source| ClientError::Connect {
                path: socket_path.to_path_buf(),
                source,
            })?;
        Ok(Self::from_stream(stream))
    }

    /// Connect to the daemon's named pipe.
    #[cfg(windows)]
    pub async fn connect(pipe_name: &Path) -> Result<Self> {
        let stream = tokio::net::windows::named_pipe::ClientOptions::new()
            .open(pipe_name)
            .map_err(|source| ClientError::Connect {
                path: pipe_name.to_path_buf(),
                source,
            })?;
        Ok(Self::from_stream(stream))
    }

    /// Wrap an already connected stream.
    pub fn from_stream<S>(stream: S) -> Self
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        let (mut read_half, mut write_half) = tokio::io::split(stream);

        let pending: Arc<DashMap<u64, oneshot::Sender<Response>>> = Arc::new(DashMap::new());

        // Writer task: receives encoded bytes and writes to stream
        let (writer_tx, mut writer_rx) = mpsc::channel::<Vec<u8>>(WRITER_CHANNEL_CAPACITY);

        let writer_handle = tokio::spawn(async move {
            while let Some(bytes) = writer_rx.recv().await {
                if let Err(e) = write_half.write_all(&bytes).await {
                    debug!("Client writer error: {}", e);
                    break;
                }
            }
            let _ = write_half.shutdown().await;
        });

        // Reader task: reads length-prefixed frames from stream, dispatches to pending map
        let reader_pending = pending.clone();
        let reader_handle = tokio::spawn(async move {
            loop {
                let mut len_buf = [0u8; 4];
                if let Err(e) = read_half.read_exact(&mut len_buf).await {
                    if e.kind() == std::io::ErrorKind::UnexpectedEof {
                        debug!("Server disconnected (EOF)");
                    } else {
                        debug!("Client reader error: {}", e);
                    }
                    // Drop all pending senders so waiters get RecvError → Disconnected
                    reader_pending.clear();
                    return;
                }
                let msg_len = u32::from_be_bytes(len_buf) as usize;

                if msg_len > MAX_MESSAGE_SIZE {
                    debug!("Server message exceeds maximum size");
                    reader_pending.clear();
                    return;
                }

                let mut payload = vec![0u8; msg_len];
                if let Err(e) = read_half.read_exact(&mut payload).await {
                    debug!("Client reader error: {}", e);
                    reader_pending.clear();
                    return;
                }

                match decode_response(&payload) {
                    Ok(envelope) => {
                        if let Some((_, response_tx)) = reader_pending.remove(&envelope.id) {
                            let _ = response_tx.send(envelope.response);
                        } else {
                            debug!("Received response for unknown request id={}", envelope.id);
                        }
                    }
                    Err(e) => {
                        debug!("Failed to decode server message: {}", e);
                    }
                }
            }
        });

        Self {
            writer_tx,
            pending,
            next_id: AtomicU64::new(1),
            reader_handle,
            _writer_handle: writer_handle,
        }
    }

    /// Queue a request and return a future resolving to its response.
    /// Takes `&self` - multiple requests can be in-flight concurrently.
    pub fn send_request(
        &self,
        request: Request,
    ) -> Result<impl Future<Output = Result<Response>> + use<>> {
        // A finished reader would never complete the oneshot
        if self.reader_handle.is_finished() {
            return Err(ClientError::Disconnected);
        }
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);

        let envelope = RequestEnvelope { id, request };
        let bytes = encode_envelope(&envelope)?;

        let (response_tx, response_rx) = oneshot::channel();
        self.pending.insert(id, response_tx);

        let writer_tx = self.writer_tx.clone();
        Ok(async move {
            writer_tx
                .send(bytes)
                .await
                .map_err(|_| ClientError::Disconnected)?;
            response_rx.await.map_err(|_| ClientError::Disconnected)
        })
    }

    pub async fn get(&self, path: &str) -> Result<Response> {
        self.send_request(Request::get(path))?.await
    }

    pub async fn post(&self, path: &str, body: impl Into<Vec<u8>>) -> Result<Response> {
        self.send_request(Request::post(path, body))?.await
    }
}
