//! Local API capabilities for a connection.

use serde::Serialize;
use tracing::warn;

use crate::identity::ConnIdentity;
use crate::platform::Platform;

/// What a caller may do through the local API.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct Permissions {
    pub read: bool,
    pub write: bool,
    pub fetch_cert: bool,
}

/// Compares peer UIDs against the configured cert-fetch user.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CertUidMatcher {
    Never,
    Uid(String),
}

impl CertUidMatcher {
    /// Build from a configured uid or username. Unset, empty or unknown
    /// values never match.
    pub fn from_config(value: Option<&str>) -> Self {
        let Some(value) = value.filter(|v| !v.is_empty()) else {
            return CertUidMatcher::Never;
        };
        match resolve_user_id(value) {
            Some(uid) => CertUidMatcher::Uid(uid),
            None => {
                warn!("Cert-fetch user '{}' could not be resolved; nobody gets cert access", value);
                CertUidMatcher::Never
            }
        }
    }

    pub fn matches(&self, uid: &str) -> bool {
        match self {
            CertUidMatcher::Never => false,
            CertUidMatcher::Uid(expected) => expected == uid,
        }
    }
}

/// Map a numeric uid ("998") or a username ("caddy") to its uid string.
pub fn resolve_user_id(value: &str) -> Option<String> {
    if value.is_empty() {
        return None;
    }
    if value.bytes().all(|b| b.is_ascii_digit()) {
        return Some(value.to_string());
    }
    match lodestar_sys::users::uid_for_name(value) {
        Ok(Some(uid)) => Some(uid.to_string()),
        Ok(None) => None,
        Err(e) => {
            warn!("Failed to look up user '{}': {}", value, e);
            None
        }
    }
}

/// Everything the permission decision depends on.
#[derive(Debug, Clone, Copy)]
pub struct PermissionInput<'a> {
    pub platform: Platform,
    pub identity: &'a ConnIdentity,
    /// UID of the read-only operator account.
    pub operator_uid: Option<&'a str>,
    pub cert_uid: &'a CertUidMatcher,
    /// Result of the single-user session check, consulted on pipe platforms.
    pub session_authorized: bool,
}

pub fn compute_permissions(input: &PermissionInput<'_>) -> Permissions {
    if input.platform.uses_named_pipes() {
        return Permissions {
            read: input.session_authorized,
            write: input.session_authorized,
            fetch_cert: false,
        };
    }

    if input.platform.is_embedded() {
        return Permissions {
            read: true,
            write: true,
            fetch_cert: false,
        };
    }

    let identity = input.identity;
    if !identity.is_unix_socket() {
        return Permissions::default();
    }

    let peer_uid = identity.creds().map(|c| c.user_id());
    let write = match (&peer_uid, input.operator_uid) {
        (None, _) => false,
        (Some(uid), Some(operator)) => uid != operator,
        (Some(_), None) => true,
    };
    let fetch_cert = peer_uid
        .as_deref()
        .is_some_and(|uid| input.cert_uid.matches(uid));

    Permissions {
        read: true,
        write,
        fetch_cert,
    }
}

#[cfg(test)]
mod tests;
