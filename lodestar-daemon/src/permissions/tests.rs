use super::*;
use lodestar_protocol::transport::{PeerCredentials, TransportKind};

fn unix_peer(uid: u32) -> ConnIdentity {
    let mut identity = ConnIdentity::new(TransportKind::UnixSocket);
    identity.creds = Some(PeerCredentials {
        uid,
        gid: uid,
        pid: Some(100),
    });
    identity
}

fn input<'a>(
    platform: Platform,
    identity: &'a ConnIdentity,
    operator_uid: Option<&'a str>,
    cert_uid: &'a CertUidMatcher,
) -> PermissionInput<'a> {
    PermissionInput {
        platform,
        identity,
        operator_uid,
        cert_uid,
        session_authorized: false,
    }
}

const NO_CERT: &CertUidMatcher = &CertUidMatcher::Never;

#[test]
fn operator_is_read_only() {
    let identity = unix_peer(1000);
    let perms = compute_permissions(&input(Platform::Linux, &identity, Some("1000"), NO_CERT));
    assert_eq!(
        perms,
        Permissions {
            read: true,
            write: false,
            fetch_cert: false
        }
    );
}

#[test]
fn non_operator_unix_peer_can_write() {
    let identity = unix_peer(0);
    let perms = compute_permissions(&input(Platform::Linux, &identity, Some("1000"), NO_CERT));
    assert!(perms.read && perms.write);

    let perms = compute_permissions(&input(Platform::MacOs, &identity, None, NO_CERT));
    assert!(perms.read && perms.write);
}

#[test]
fn unix_socket_without_credentials_is_read_only() {
    let identity = ConnIdentity::new(TransportKind::UnixSocket);
    let perms = compute_permissions(&input(Platform::Linux, &identity, None, NO_CERT));
    assert_eq!(
        perms,
        Permissions {
            read: true,
            write: false,
            fetch_cert: false
        }
    );
}

#[test]
fn non_socket_connection_gets_nothing_on_unix() {
    let identity = ConnIdentity::new(TransportKind::Other);
    let perms = compute_permissions(&input(Platform::FreeBsd, &identity, None, NO_CERT));
    assert_eq!(perms, Permissions::default());
}

#[test]
fn cert_fetch_requires_exact_uid_match() {
    let matcher = CertUidMatcher::Uid("33".into());
    let www = unix_peer(33);
    let other = unix_peer(333);
    assert!(compute_permissions(&input(Platform::Linux, &www, None, &matcher)).fetch_cert);
    assert!(!compute_permissions(&input(Platform::Linux, &other, None, &matcher)).fetch_cert);
}

#[test]
fn cert_fetch_never_matcher() {
    let identity = unix_peer(33);
    assert!(!compute_permissions(&input(Platform::Linux, &identity, None, NO_CERT)).fetch_cert);
}

#[test]
fn pipe_platform_follows_session_check() {
    let identity = ConnIdentity::new(TransportKind::Pipe);
    let mut authorized = input(Platform::Windows, &identity, None, NO_CERT);
    authorized.session_authorized = true;
    assert_eq!(
        compute_permissions(&authorized),
        Permissions {
            read: true,
            write: true,
            fetch_cert: false
        }
    );

    let denied = input(Platform::Windows, &identity, None, NO_CERT);
    assert_eq!(compute_permissions(&denied), Permissions::default());
}

#[test]
fn pipe_platform_never_fetches_certs() {
    let identity = unix_peer(33);
    let matcher = CertUidMatcher::Uid("33".into());
    let mut authorized = input(Platform::Windows, &identity, None, &matcher);
    authorized.session_authorized = true;
    assert!(!compute_permissions(&authorized).fetch_cert);
}

#[test]
fn embedded_platform_reads_and_writes() {
    let identity = ConnIdentity::new(TransportKind::Other);
    let perms = compute_permissions(&input(Platform::Js, &identity, Some("0"), NO_CERT));
    assert_eq!(
        perms,
        Permissions {
            read: true,
            write: true,
            fetch_cert: false
        }
    );
}

#[test]
fn same_input_same_output() {
    let identity = unix_peer(1000);
    let matcher = CertUidMatcher::Uid("1000".into());
    let fixed = input(Platform::Linux, &identity, Some("1001"), &matcher);
    let first = compute_permissions(&fixed);
    for _ in 0..10 {
        assert_eq!(compute_permissions(&fixed), first);
    }
}

// ========================================================================
// CertUidMatcher / resolve_user_id
// ========================================================================

#[test]
fn matcher_from_numeric_config() {
    assert_eq!(
        CertUidMatcher::from_config(Some("998")),
        CertUidMatcher::Uid("998".into())
    );
}

#[test]
fn matcher_from_empty_or_missing_config() {
    assert_eq!(CertUidMatcher::from_config(None), CertUidMatcher::Never);
    assert_eq!(CertUidMatcher::from_config(Some("")), CertUidMatcher::Never);
}

#[test]
fn matcher_from_unknown_username_never_matches() {
    let matcher = CertUidMatcher::from_config(Some("no-such-user-lodestar-test"));
    assert_eq!(matcher, CertUidMatcher::Never);
    assert!(!matcher.matches(""));
}

#[cfg(unix)]
#[test]
fn matcher_from_username_uses_uid() {
    assert_eq!(
        CertUidMatcher::from_config(Some("root")),
        CertUidMatcher::Uid("0".into())
    );
}

#[test]
fn resolve_user_id_passes_digits_through() {
    assert_eq!(resolve_user_id("0").as_deref(), Some("0"));
    assert_eq!(resolve_user_id(""), None);
}
