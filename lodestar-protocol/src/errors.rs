use std::path::PathBuf;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("failed to encode message: {0}")]
    Encode(#[source] bincode::Error),

    #[error("failed to decode message: {0}")]
    Decode(#[source] bincode::Error),

    #[error("message exceeds maximum size")]
    MessageTooLarge,
}

#[derive(Debug, Error)]
pub enum ClientError {
    #[error("failed to connect to {path}: {source}")]
    Connect {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("connection to daemon closed")]
    Disconnected,

    #[error("protocol error: {0}")]
    Protocol(#[from] ProtocolError),
}

#[derive(Debug, Error)]
pub enum ServerError {
    #[error("stale socket found at {socket_path} cannot be deleted: {source}")]
    StaleSocket {
        socket_path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("refusing to replace symlink at socket path {socket_path}")]
    SocketSymlink { socket_path: PathBuf },

    #[error("cannot bind local socket at {socket_path}: {source}")]
    Bind {
        socket_path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to set socket permissions at {socket_path}: {source}")]
    SocketPermissions {
        socket_path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to accept connection: {0}")]
    Accept(#[source] std::io::Error),

    #[error("failed to receive request: {0}")]
    Receive(#[source] std::io::Error),

    #[error("request exceeds maximum message size")]
    MessageTooLarge,

    #[error("protocol error: {0}")]
    Protocol(#[from] ProtocolError),
}
