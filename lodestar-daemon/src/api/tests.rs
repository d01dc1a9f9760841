use super::*;
use crate::backend::LocalBackend;
use lodestar_protocol::transport::{PeerCredentials, TransportKind};
use tempfile::TempDir;

const ALL: Permissions = Permissions {
    read: true,
    write: true,
    fetch_cert: false,
};

const READ_ONLY: Permissions = Permissions {
    read: true,
    write: false,
    fetch_cert: false,
};

const NONE: Permissions = Permissions {
    read: false,
    write: false,
    fetch_cert: false,
};

fn backend() -> (TempDir, LocalBackend) {
    let dir = TempDir::new().unwrap();
    let backend = LocalBackend::open(dir.path().to_path_buf(), None);
    (dir, backend)
}

fn unix_peer(uid: u32) -> ConnIdentity {
    let mut identity = ConnIdentity::new(TransportKind::UnixSocket);
    identity.creds = Some(PeerCredentials {
        uid,
        gid: uid,
        pid: Some(9),
    });
    identity
}

fn call(backend: &LocalBackend, identity: &ConnIdentity, perms: Permissions, request: Request) -> Response {
    let route = request.local_api_path().unwrap().to_string();
    handle_local_api(backend, identity, perms, &request, &route)
}

fn json(resp: &Response) -> serde_json::Value {
    serde_json::from_slice(&resp.body).unwrap()
}

#[test]
fn status_requires_read() {
    let (_dir, backend) = backend();
    let identity = unix_peer(1000);

    let resp = call(&backend, &identity, NONE, Request::get("/localapi/v0/status"));
    assert_eq!(resp.status, status::FORBIDDEN);
    assert_eq!(resp.body_text(), "status access denied\n");

    let resp = call(&backend, &identity, READ_ONLY, Request::get("/localapi/v0/status"));
    assert_eq!(resp.status, status::OK);
    assert_eq!(json(&resp)["state"], "NoState");
}

#[test]
fn whoami_reports_identity_and_permissions() {
    let (_dir, backend) = backend();
    let identity = unix_peer(1000);
    let resp = call(&backend, &identity, READ_ONLY, Request::get("/localapi/v0/whoami"));
    let value = json(&resp);
    assert_eq!(value["uid"], 1000);
    assert_eq!(value["identity"]["transport"], "UnixSocket");
    assert_eq!(value["permissions"]["read"], true);
    assert_eq!(value["permissions"]["write"], false);
}

#[test]
fn prefs_write_requires_write_permission() {
    let (_dir, backend) = backend();
    let identity = unix_peer(1000);
    let body = br#"{"persistent_server_mode":true}"#.to_vec();

    let resp = call(
        &backend,
        &identity,
        READ_ONLY,
        Request::post("/localapi/v0/prefs", body.clone()),
    );
    assert_eq!(resp.status, status::FORBIDDEN);
    assert!(!backend.is_persistent_server_mode());

    let resp = call(&backend, &identity, ALL, Request::post("/localapi/v0/prefs", body));
    assert_eq!(resp.status, status::OK);
    assert_eq!(json(&resp)["persistent_server_mode"], true);
    assert!(json(&resp)["persistent_owner"].is_null());
    assert!(backend.is_persistent_server_mode());

    let resp = call(&backend, &identity, READ_ONLY, Request::get("/localapi/v0/prefs"));
    assert_eq!(json(&resp)["persistent_server_mode"], true);
}

#[test]
fn server_mode_owner_is_the_pipe_session_user() {
    let (_dir, backend) = backend();
    let mut alice = ConnIdentity::new(TransportKind::Pipe);
    alice.user_id = "S-1-5-21-1000".into();
    let body = br#"{"persistent_server_mode":true}"#.to_vec();

    let resp = call(&backend, &alice, ALL, Request::post("/localapi/v0/prefs", body));
    assert_eq!(resp.status, status::OK);
    assert_eq!(json(&resp)["persistent_owner"], "S-1-5-21-1000");

    let mut bob = ConnIdentity::new(TransportKind::Pipe);
    bob.user_id = "S-1-5-21-1001".into();
    assert!(backend.check_connection_allowed(&alice).is_ok());
    assert!(backend.check_connection_allowed(&bob).is_err());
}

#[test]
fn server_mode_from_unix_peer_records_no_owner() {
    let (_dir, backend) = backend();
    let body = br#"{"persistent_server_mode":true}"#.to_vec();
    let resp = call(&backend, &unix_peer(1000), ALL, Request::post("/localapi/v0/prefs", body));
    assert_eq!(resp.status, status::OK);
    assert_eq!(backend.prefs().persistent_owner, None);
    assert!(backend.check_connection_allowed(&unix_peer(1001)).is_ok());
}

#[test]
fn prefs_rejects_malformed_body() {
    let (_dir, backend) = backend();
    let identity = unix_peer(0);
    let resp = call(
        &backend,
        &identity,
        ALL,
        Request::post("/localapi/v0/prefs", b"{\"persistent\":1}".to_vec()),
    );
    assert_eq!(resp.status, status::BAD_REQUEST);
}

#[test]
fn cert_allowed_by_fetch_cert_or_write() {
    let (dir, backend) = backend();
    let certs = dir.path().join("certs");
    std::fs::create_dir(&certs).unwrap();
    std::fs::write(certs.join("host.example.org.crt"), "C").unwrap();
    std::fs::write(certs.join("host.example.org.key"), "K").unwrap();
    let identity = unix_peer(33);
    let path = "/localapi/v0/cert/host.example.org";

    let resp = call(&backend, &identity, READ_ONLY, Request::get(path));
    assert_eq!(resp.status, status::FORBIDDEN);

    let cert_only = Permissions {
        read: true,
        write: false,
        fetch_cert: true,
    };
    let resp = call(&backend, &identity, cert_only, Request::get(path));
    assert_eq!(resp.status, status::OK);
    assert_eq!(json(&resp)["cert_pem"], "C");

    let resp = call(&backend, &identity, ALL, Request::get(path));
    assert_eq!(resp.status, status::OK);
}

#[test]
fn cert_lookup_failure_is_an_error_response() {
    let (_dir, backend) = backend();
    let identity = unix_peer(0);
    let resp = call(&backend, &identity, ALL, Request::get("/localapi/v0/cert/missing.example.org"));
    assert_eq!(resp.status, status::INTERNAL_SERVER_ERROR);
}

#[test]
fn unknown_route_and_wrong_method() {
    let (_dir, backend) = backend();
    let identity = unix_peer(0);
    let resp = call(&backend, &identity, ALL, Request::get("/localapi/v0/nope"));
    assert_eq!(resp.status, status::NOT_FOUND);

    let resp = call(&backend, &identity, ALL, Request::post("/localapi/v0/status", Vec::new()));
    assert_eq!(resp.status, status::METHOD_NOT_ALLOWED);
}

// ========================================================================
// Status page
// ========================================================================

#[test]
fn pipe_status_page_is_hardened_html() {
    let (_dir, backend) = backend();
    let resp = status_page(Platform::Windows, &backend);
    assert_eq!(resp.status, status::OK);
    assert_eq!(resp.header("X-Frame-Options"), Some("DENY"));
    assert_eq!(resp.header("X-Content-Type-Options"), Some("nosniff"));
    assert!(resp.header("Content-Security-Policy").unwrap().contains("default-src 'none'"));
    assert_eq!(resp.header("Content-Type"), Some("text/html; charset=utf-8"));
    assert!(resp.body_text().contains("<th>State</th><td>NoState</td>"));
}

#[test]
fn unix_status_page_is_a_banner() {
    let (_dir, backend) = backend();
    let resp = status_page(Platform::Linux, &backend);
    assert!(resp.body_text().contains("This is the local lodestar daemon."));
    assert_eq!(resp.header("X-Frame-Options"), None);
}

#[test]
fn status_html_escapes_values() {
    let status = BackendStatus {
        active_user: Some("<script>&".into()),
        ..BackendStatus::default()
    };
    let html = render_status_html(&status);
    assert!(html.contains("&lt;script&gt;&amp;"));
    assert!(!html.contains("<script>"));
}
