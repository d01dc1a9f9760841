use super::*;
use std::sync::Mutex;

struct FakeConn {
    kind: TransportKind,
    creds: Option<PeerCredentials>,
    handle: Option<PipeHandle>,
}

impl ConnInfo for FakeConn {
    fn transport_kind(&self) -> TransportKind {
        self.kind
    }

    fn peer_credentials(&self) -> Option<PeerCredentials> {
        self.creds
    }

    fn pipe_handle(&self) -> Option<PipeHandle> {
        self.handle
    }
}

fn pipe_conn(handle: isize) -> FakeConn {
    FakeConn {
        kind: TransportKind::Pipe,
        creds: None,
        handle: Some(PipeHandle(handle)),
    }
}

/// Scripted pipe lookups. Each stage fails when its entry is `None`.
struct FakePipes {
    pid: Option<u32>,
    sid: Option<&'static str>,
    name: Option<&'static str>,
    calls: Mutex<Vec<&'static str>>,
}

impl FakePipes {
    fn ok() -> Self {
        Self {
            pid: Some(4321),
            sid: Some("S-1-5-21-1-2-3-1001"),
            name: Some("HOST\\alice"),
            calls: Mutex::new(Vec::new()),
        }
    }
}

fn denied() -> io::Error {
    io::Error::from(io::ErrorKind::PermissionDenied)
}

impl PipeSystem for FakePipes {
    fn client_process_id(&self, _handle: PipeHandle) -> io::Result<u32> {
        self.calls.lock().unwrap().push("pid");
        self.pid.ok_or_else(denied)
    }

    fn user_id_of_pid(&self, _pid: u32) -> io::Result<String> {
        self.calls.lock().unwrap().push("sid");
        self.sid.map(String::from).ok_or_else(denied)
    }

    fn username_of(&self, _user_id: &str) -> io::Result<String> {
        self.calls.lock().unwrap().push("name");
        self.name.map(String::from).ok_or_else(denied)
    }
}

// ========================================================================
// PipeResolver
// ========================================================================

#[test]
fn pipe_resolver_fills_pid_user_and_name() {
    let resolver = PipeResolver::new(FakePipes::ok());
    let identity = resolver.resolve(&pipe_conn(10)).unwrap();

    assert_eq!(identity.transport, TransportKind::Pipe);
    assert_eq!(identity.pid, Some(4321));
    assert_eq!(identity.user_id, "S-1-5-21-1-2-3-1001");
    assert_eq!(identity.username.as_deref(), Some("HOST\\alice"));
    assert!(identity.creds().is_none());
}

#[test]
fn pipe_resolver_rejects_non_pipe_connection() {
    let resolver = PipeResolver::new(FakePipes::ok());
    let conn = FakeConn {
        kind: TransportKind::UnixSocket,
        creds: None,
        handle: None,
    };
    let err = resolver.resolve(&conn).unwrap_err();
    assert!(matches!(
        err,
        IdentityError::NotPipe {
            transport: TransportKind::UnixSocket
        }
    ));
    assert!(resolver.system.calls.lock().unwrap().is_empty());
}

#[test]
fn pipe_resolver_pid_failure() {
    let resolver = PipeResolver::new(FakePipes {
        pid: None,
        ..FakePipes::ok()
    });
    let err = resolver.resolve(&pipe_conn(1)).unwrap_err();
    assert!(matches!(err, IdentityError::ClientPid(_)));
    assert_eq!(*resolver.system.calls.lock().unwrap(), vec!["pid"]);
}

#[test]
fn pipe_resolver_pid_to_user_failure() {
    let resolver = PipeResolver::new(FakePipes {
        sid: None,
        ..FakePipes::ok()
    });
    let err = resolver.resolve(&pipe_conn(1)).unwrap_err();
    assert!(matches!(err, IdentityError::PidToUser { pid: 4321, .. }));
}

#[test]
fn pipe_resolver_username_failure() {
    let resolver = PipeResolver::new(FakePipes {
        name: None,
        ..FakePipes::ok()
    });
    match resolver.resolve(&pipe_conn(1)).unwrap_err() {
        IdentityError::UserLookup { user_id, .. } => assert_eq!(user_id, "S-1-5-21-1-2-3-1001"),
        other => panic!("unexpected error: {other}"),
    }
}

#[cfg(not(windows))]
#[test]
fn native_pipe_lookups_fail_off_windows() {
    let resolver = PipeResolver::native();
    let err = resolver.resolve(&pipe_conn(1)).unwrap_err();
    assert!(matches!(err, IdentityError::ClientPid(_)));
}

// ========================================================================
// CredentialResolver
// ========================================================================

#[test]
fn credential_resolver_keeps_peer_credentials() {
    let conn = FakeConn {
        kind: TransportKind::UnixSocket,
        creds: Some(PeerCredentials {
            uid: 1000,
            gid: 1000,
            pid: Some(77),
        }),
        handle: None,
    };
    let identity = CredentialResolver.resolve(&conn).unwrap();
    assert!(identity.is_unix_socket());
    assert_eq!(identity.pid, Some(77));
    assert_eq!(identity.creds().map(|c| c.uid), Some(1000));
    assert!(identity.user_id.is_empty());
    assert_eq!(identity.account_id().as_deref(), Some("1000"));
}

#[cfg(unix)]
#[test]
fn credential_resolver_names_the_peer() {
    let conn = FakeConn {
        kind: TransportKind::UnixSocket,
        creds: Some(PeerCredentials {
            uid: 0,
            gid: 0,
            pid: None,
        }),
        handle: None,
    };
    let identity = CredentialResolver.resolve(&conn).unwrap();
    assert_eq!(identity.username.as_deref(), Some("root"));
    assert_eq!(identity.display_name(), "root");
    assert!(identity.user_id.is_empty());
}

#[test]
fn credential_resolver_without_credentials_still_succeeds() {
    let conn = FakeConn {
        kind: TransportKind::Other,
        creds: None,
        handle: None,
    };
    let identity = CredentialResolver.resolve(&conn).unwrap();
    assert_eq!(identity.transport, TransportKind::Other);
    assert!(identity.creds().is_none());
    assert_eq!(identity.account_id(), None);
    assert_eq!(identity.display_name(), "unknown user");
}

// ========================================================================
// ConnIdentity
// ========================================================================

#[test]
fn display_name_prefers_username() {
    let mut identity = ConnIdentity::new(TransportKind::Pipe);
    identity.user_id = "S-1-5-18".into();
    assert_eq!(identity.display_name(), "S-1-5-18");
    identity.username = Some("NT AUTHORITY\\SYSTEM".into());
    assert_eq!(identity.display_name(), "NT AUTHORITY\\SYSTEM");
}

#[test]
fn identity_serializes_without_credentials() {
    let mut identity = ConnIdentity::new(TransportKind::UnixSocket);
    identity.creds = Some(PeerCredentials {
        uid: 0,
        gid: 0,
        pid: None,
    });
    let value = serde_json::to_value(&identity).unwrap();
    assert_eq!(value["transport"], "UnixSocket");
    assert!(value.get("creds").is_none());
}
