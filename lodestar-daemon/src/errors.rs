use std::path::PathBuf;

use lodestar_protocol::transport::TransportKind;
use thiserror::Error;

fn format_pid(pid: &Option<u32>) -> String {
    match pid {
        Some(pid) => format!(", pid {}", pid),
        None => String::new(),
    }
}

/// A connection could not be mapped to the OS user behind it.
#[derive(Debug, Error)]
pub enum IdentityError {
    #[error("not a named pipe connection: {transport}")]
    NotPipe { transport: TransportKind },

    #[error("failed to query named pipe client pid: {0}")]
    ClientPid(#[source] std::io::Error),

    #[error("failed to map connection's pid {pid} to a user (WSL?): {source}")]
    PidToUser {
        pid: u32,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to look up user from user id {user_id}: {source}")]
    UserLookup {
        user_id: String,
        #[source]
        source: std::io::Error,
    },
}

/// A request was refused before reaching the API.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum AccessDeniedError {
    /// Another OS user has requests in flight.
    #[error("lodestar already in use by {username}{}", format_pid(.pid))]
    InUseByOtherUser { username: String, pid: Option<u32> },

    /// The backend's connection policy refused this identity.
    #[error("{reason}")]
    Rejected { reason: String },
}

#[derive(Error, Debug)]
pub enum DaemonError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Failed to read prefs file '{path}': {source}")]
    PrefsRead {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to parse prefs file '{path}': {source}")]
    PrefsParse {
        path: PathBuf,
        #[source]
        source: serde_yaml::Error,
    },

    #[error("Failed to encode prefs: {0}")]
    PrefsEncode(#[source] serde_yaml::Error),

    #[error("Prefs are invalid and cannot be changed: {0}")]
    PrefsInvalid(String),

    #[error("No certificate for '{domain}': {reason}")]
    Cert { domain: String, reason: String },

    #[error("Operation not supported by this backend: {0}")]
    Unsupported(&'static str),

    #[error("Internal error: {0}")]
    Internal(String),

    #[error(transparent)]
    Server(#[from] lodestar_protocol::errors::ServerError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, DaemonError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn in_use_message_names_user_and_pid() {
        let err = AccessDeniedError::InUseByOtherUser {
            username: "HOST\\alice".into(),
            pid: Some(4242),
        };
        assert_eq!(err.to_string(), "lodestar already in use by HOST\\alice, pid 4242");
    }

    #[test]
    fn in_use_message_without_pid() {
        let err = AccessDeniedError::InUseByOtherUser {
            username: "alice".into(),
            pid: None,
        };
        assert_eq!(err.to_string(), "lodestar already in use by alice");
    }

    #[test]
    fn rejected_message_is_reason() {
        let err = AccessDeniedError::Rejected {
            reason: "already in use by 1000 in server mode".into(),
        };
        assert_eq!(err.to_string(), "already in use by 1000 in server mode");
    }

    #[test]
    fn identity_error_mentions_wsl() {
        let err = IdentityError::PidToUser {
            pid: 7,
            source: std::io::Error::from(std::io::ErrorKind::NotFound),
        };
        assert!(err.to_string().contains("(WSL?)"));
    }
}
