use std::future::Future;
use std::io;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use tokio::{
    io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader},
    sync::mpsc,
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::{
    errors::ServerError,
    protocol::{
        MAX_MESSAGE_SIZE, Request, Response, ResponseEnvelope, decode_envelope,
        encode_response, status,
    },
    transport::{ConnInfo, Listener, LocalConn},
};

pub type Result<T> = std::result::Result<T, ServerError>;

/// Bounded channel capacity for the per-connection writer task.
const WRITER_CHANNEL_CAPACITY: usize = 256;

/// How long a connection may sit with nothing in flight before it is closed.
pub const DEFAULT_IDLE_TIMEOUT: Duration = Duration::from_secs(5);

/// Pause before accepting again after a transient accept failure.
const ACCEPT_BACKOFF: Duration = Duration::from_millis(100);

/// Per-connection request handling.
///
/// `on_connect` runs once per accepted connection, before its first request is
/// read; the context it returns is shared by every request on that connection.
pub trait ConnectionHandler: Send + Sync + 'static {
    type Context: Send + Sync + 'static;

    fn on_connect(&self, conn: &dyn ConnInfo) -> Self::Context;

    fn handle(
        &self,
        ctx: Arc<Self::Context>,
        request: Request,
        cancel: CancellationToken,
    ) -> impl Future<Output = Response> + Send;
}

pub struct Server<L, H>
where
    L: Listener,
    H: ConnectionHandler,
{
    listener: L,
    handler: Arc<H>,
    idle_timeout: Duration,
}

impl<L, H> Server<L, H>
where
    L: Listener,
    H: ConnectionHandler,
{
    pub fn new(listener: L, handler: Arc<H>) -> Self {
        Self {
            listener,
            handler,
            idle_timeout: DEFAULT_IDLE_TIMEOUT,
        }
    }

    pub fn with_idle_timeout(mut self, idle_timeout: Duration) -> Self {
        self.idle_timeout = idle_timeout;
        self
    }

    /// Accept and serve connections until `cancel` fires.
    ///
    /// The listener is dropped before returning. Requests already dispatched
    /// keep running on their own tasks.
    pub async fn run(self, cancel: CancellationToken) -> Result<()> {
        let Self {
            mut listener,
            handler,
            idle_timeout,
        } = self;
        info!("Listening on {}", listener.local_addr());

        loop {
            let accepted = tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                result = listener.accept() => result,
            };

            match accepted {
                Ok(conn) => {
                    let handler = Arc::clone(&handler);
                    let cancel = cancel.clone();
                    tokio::spawn(async move {
                        if let Err(e) = handle_client(handler, conn, idle_timeout, cancel).await {
                            debug!("Client handler error: {}", e);
                        }
                    });
                }
                Err(_) if cancel.is_cancelled() => break,
                Err(e) if is_transient_accept_error(&e) => {
                    warn!("Transient accept error, retrying: {}", e);
                    tokio::select! {
                        _ = cancel.cancelled() => break,
                        _ = tokio::time::sleep(ACCEPT_BACKOFF) => {}
                    }
                }
                Err(e) => {
                    error!("Failed to accept connection: {}", e);
                    return Err(ServerError::Accept(e));
                }
            }
        }

        drop(listener);
        info!("Server shutdown!");
        Ok(())
    }
}

/// Accept failures that say nothing about the health of the listener itself.
fn is_transient_accept_error(e: &io::Error) -> bool {
    if matches!(
        e.kind(),
        io::ErrorKind::ConnectionAborted
            | io::ErrorKind::ConnectionReset
            | io::ErrorKind::Interrupted
            | io::ErrorKind::WouldBlock
    ) {
        return true;
    }
    lodestar_sys::errno::is_fd_exhaustion(e)
}

/// Counts the requests a connection has in flight.
struct InFlight(Arc<AtomicUsize>);

impl InFlight {
    fn enter(counter: &Arc<AtomicUsize>) -> Self {
        counter.fetch_add(1, Ordering::SeqCst);
        Self(Arc::clone(counter))
    }
}

impl Drop for InFlight {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

enum ReadWait {
    Data,
    Eof,
    Idle,
    Cancelled,
}

/// Wait until the next frame starts arriving.
///
/// `fill_buf` is cancel-safe, so timing it out loses no bytes.
async fn wait_for_frame<R>(
    reader: &mut BufReader<R>,
    idle_timeout: Duration,
    in_flight: &AtomicUsize,
    cancel: &CancellationToken,
) -> Result<ReadWait>
where
    R: tokio::io::AsyncRead + Unpin,
{
    loop {
        let filled = tokio::select! {
            _ = cancel.cancelled() => return Ok(ReadWait::Cancelled),
            filled = tokio::time::timeout(idle_timeout, reader.fill_buf()) => filled,
        };
        match filled {
            Ok(Ok(buf)) if buf.is_empty() => return Ok(ReadWait::Eof),
            Ok(Ok(_)) => return Ok(ReadWait::Data),
            Ok(Err(e)) => return Err(ServerError::Receive(e)),
            Err(_) if in_flight.load(Ordering::SeqCst) == 0 => return Ok(ReadWait::Idle),
            Err(_) => continue,
        }
    }
}

/// Read the rest of a frame that has started arriving.
///
/// Returns `Ok(false)` when the connection should close quietly: the peer
/// stalled for longer than `idle_timeout` mid-frame, or `cancel` fired.
async fn read_frame_bytes<R>(
    reader: &mut BufReader<R>,
    buf: &mut [u8],
    idle_timeout: Duration,
    cancel: &CancellationToken,
) -> Result<bool>
where
    R: tokio::io::AsyncRead + Unpin,
{
    tokio::select! {
        _ = cancel.cancelled() => Ok(false),
        read = tokio::time::timeout(idle_timeout, reader.read_exact(buf)) => match read {
            Ok(Ok(_)) => Ok(true),
            Ok(Err(e)) => Err(ServerError::Receive(e)),
            Err(_) => {
                debug!("Closing connection stalled mid-frame");
                Ok(false)
            }
        },
    }
}

async fn send_response(write_tx: &mpsc::Sender<Vec<u8>>, id: u64, response: Response) {
    let bytes = match encode_response(&ResponseEnvelope { id, response }) {
        Ok(bytes) => bytes,
        Err(e) => {
            error!("Failed to encode response for request {}: {}", id, e);
            let fallback = ResponseEnvelope {
                id,
                response: Response::error(
                    status::INTERNAL_SERVER_ERROR,
                    "failed to encode response",
                ),
            };
            match encode_response(&fallback) {
                Ok(bytes) => bytes,
                Err(_) => return,
            }
        }
    };
    if let Err(e) = write_tx.send(bytes).await {
        debug!("Failed to send response for request {}: {}", id, e);
    }
}

async fn handle_client<C, H>(
    handler: Arc<H>,
    conn: C,
    idle_timeout: Duration,
    cancel: CancellationToken,
) -> Result<()>
where
    C: LocalConn,
    H: ConnectionHandler,
{
    debug!("Client connected over {}", conn.transport_kind());

    let ctx = Arc::new(handler.on_connect(&conn));

    let (read_half, mut write_half) = tokio::io::split(conn);

    let (write_tx, mut write_rx) = mpsc::channel::<Vec<u8>>(WRITER_CHANNEL_CAPACITY);

    // Spawn writer task: receives encoded bytes and writes to stream
    let writer_task = tokio::spawn(async move {
        while let Some(bytes) = write_rx.recv().await {
            if let Err(e) = write_half.write_all(&bytes).await {
                warn!("Failed to write to client: {}", e);
                break;
            }
        }
        let _ = write_half.shutdown().await;
    });

    let mut reader = BufReader::new(read_half);
    let in_flight = Arc::new(AtomicUsize::new(0));

    let result = loop {
        match wait_for_frame(&mut reader, idle_timeout, &in_flight, &cancel).await {
            Ok(ReadWait::Data) => {}
            Ok(ReadWait::Eof) => {
                debug!("Client disconnected (EOF)");
                break Ok(());
            }
            Ok(ReadWait::Idle) => {
                debug!("Closing idle connection");
                break Ok(());
            }
            Ok(ReadWait::Cancelled) => break Ok(()),
            Err(e) => break Err(e),
        }

        let mut len_buf = [0u8; 4];
        match read_frame_bytes(&mut reader, &mut len_buf, idle_timeout, &cancel).await {
            Ok(true) => {}
            Ok(false) => break Ok(()),
            Err(e) => break Err(e),
        }
        let msg_len = u32::from_be_bytes(len_buf) as usize;

        if msg_len > MAX_MESSAGE_SIZE {
            debug!("Request exceeds maximum message size: {} bytes", msg_len);
            let response = Response::error(
                status::PAYLOAD_TOO_LARGE,
                format!(
                    "Request exceeds maximum message size of {} bytes",
                    MAX_MESSAGE_SIZE
                ),
            );
            send_response(&write_tx, 0, response).await;
            break Err(ServerError::MessageTooLarge);
        }

        let mut payload = vec![0u8; msg_len];
        match read_frame_bytes(&mut reader, &mut payload, idle_timeout, &cancel).await {
            Ok(true) => {}
            Ok(false) => break Ok(()),
            Err(e) => break Err(e),
        }

        let envelope = match decode_envelope(&payload) {
            Ok(env) => env,
            Err(e) => {
                warn!("Failed to parse request envelope: {}", e);
                // We don't know the ID, use 0
                let response = Response::error(status::BAD_REQUEST, "Invalid request format");
                send_response(&write_tx, 0, response).await;
                continue;
            }
        };

        let request_id = envelope.id;
        let request = envelope.request;
        debug!("Received request id={}: {} {}", request_id, request.method, request.path);

        let guard = InFlight::enter(&in_flight);
        let handler = Arc::clone(&handler);
        let ctx = Arc::clone(&ctx);
        let request_cancel = cancel.child_token();
        let write_tx = write_tx.clone();
        tokio::spawn(async move {
            let _guard = guard;
            let response = handler.handle(ctx, request, request_cancel).await;
            send_response(&write_tx, request_id, response).await;
        });
    };

    // The writer drains once every in-flight request has dropped its sender
    drop(write_tx);
    let _ = writer_task.await;
    result
}
