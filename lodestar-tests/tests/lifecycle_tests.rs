//! Backend binding, startup and shutdown

use std::io;
use std::sync::Arc;
use std::time::Duration;

use lodestar_daemon::config::ServerConfig;
use lodestar_daemon::platform::Platform;
use lodestar_daemon::server::Server;
use lodestar_protocol::errors::ServerError;
use lodestar_protocol::protocol::status;
use lodestar_tests::{FakePipeSystem, RecordingBackend, ServerHarness, wait_until};

const WAIT: Duration = Duration::from_secs(2);

fn pipes() -> FakePipeSystem {
    FakePipeSystem::new().with_client(1, 100, "S-1-5-21-1000", "alice")
}

fn unbound() -> ServerHarness {
    ServerHarness::start_unbound(
        ServerHarness::config(Platform::Windows),
        pipes(),
        Arc::new(RecordingBackend::new()),
    )
}

/// Wait until the accept loop is serving, which implies `run` has begun
async fn wait_serving(harness: &ServerHarness) {
    let client = harness.connect_pipe(1).unwrap();
    let response = client.get("/").await.unwrap();
    assert!(response.status == status::OK || response.status == status::SERVICE_UNAVAILABLE);
}

// ============================================================================
// Binding
// ============================================================================

/// Binding twice before `run` panics
#[test]
#[should_panic(expected = "backend already bound")]
fn test_double_bind_before_run_panics() {
    let server = Server::new(ServerConfig::for_platform(Platform::Linux));
    server.bind_backend(Arc::new(RecordingBackend::new()));
    server.bind_backend(Arc::new(RecordingBackend::new()));
}

/// Binding twice after `run` has begun panics
#[tokio::test]
#[should_panic(expected = "backend already bound")]
async fn test_double_bind_after_run_panics() {
    let harness = unbound();
    wait_serving(&harness).await;
    harness.bind();
    harness.bind();
}

/// Using the backend before it is bound panics
#[test]
#[should_panic(expected = "backend used before bind_backend was called")]
fn test_must_backend_before_bind_panics() {
    let server = Server::new(ServerConfig::for_platform(Platform::Linux));
    let _ = server.must_backend();
}

// ============================================================================
// Startup
// ============================================================================

/// A backend bound before `run` starts exactly once
#[tokio::test]
async fn test_bind_then_run_starts_once() {
    let harness = ServerHarness::start(ServerHarness::config(Platform::Windows), pipes());
    assert!(wait_until(WAIT, || harness.backend.starts() == 1).await);

    wait_serving(&harness).await;
    assert_eq!(harness.backend.starts(), 1);
    harness.stop().await.unwrap();
}

/// A backend bound after `run` has begun starts exactly once
#[tokio::test]
async fn test_run_then_bind_starts_once() {
    let harness = unbound();
    wait_serving(&harness).await;
    assert_eq!(harness.backend.starts(), 0);

    harness.bind();
    assert_eq!(harness.backend.starts(), 1);

    wait_serving(&harness).await;
    assert_eq!(harness.backend.starts(), 1);
    harness.stop().await.unwrap();
}

/// Binding without `run` never starts the backend
#[test]
fn test_bind_without_run_does_not_start() {
    let backend = Arc::new(RecordingBackend::new());
    let server = Server::new(ServerConfig::for_platform(Platform::Linux));
    server.bind_backend(backend.clone());
    assert_eq!(backend.starts(), 0);
}

/// A backend with invalid configuration is not started
#[tokio::test]
async fn test_invalid_config_not_started() {
    let harness = unbound();
    harness.backend.set_config_valid(false);
    wait_serving(&harness).await;
    harness.bind();

    wait_serving(&harness).await;
    assert_eq!(harness.backend.starts(), 0);

    let backend = Arc::clone(&harness.backend);
    harness.stop().await.unwrap();
    assert_eq!(backend.shutdowns(), 1);
}

// ============================================================================
// Shutdown
// ============================================================================

/// Cancelling `run` shuts the backend down exactly once
#[tokio::test]
async fn test_cancel_shuts_down_once() {
    let harness = ServerHarness::start(ServerHarness::config(Platform::Windows), pipes());
    wait_serving(&harness).await;
    let backend = Arc::clone(&harness.backend);

    harness.stop().await.unwrap();
    assert_eq!(backend.shutdowns(), 1);
}

/// A fatal accept error ends `run` and still shuts the backend down
#[tokio::test]
async fn test_fatal_accept_error_shuts_down() {
    let harness = ServerHarness::start(ServerHarness::config(Platform::Windows), pipes());
    let backend = Arc::clone(&harness.backend);
    harness
        .connector
        .fail_accept(io::Error::new(io::ErrorKind::PermissionDenied, "denied"))
        .unwrap();

    let result = harness.join().await;
    assert!(matches!(result, Err(ServerError::Accept(_))));
    assert_eq!(backend.shutdowns(), 1);
}

/// Transient accept errors are retried without stopping the server
#[tokio::test]
async fn test_transient_accept_error_retried() {
    let harness = ServerHarness::start(ServerHarness::config(Platform::Windows), pipes());
    harness
        .connector
        .fail_accept(io::Error::new(io::ErrorKind::ConnectionAborted, "aborted"))
        .unwrap();

    wait_serving(&harness).await;
    assert!(!harness.is_finished());
    assert_eq!(harness.backend.shutdowns(), 0);
    harness.stop().await.unwrap();
}

/// Stopping a server that never had a backend is clean
#[tokio::test]
async fn test_stop_without_backend() {
    let harness = unbound();
    wait_serving(&harness).await;
    let backend = Arc::clone(&harness.backend);
    harness.stop().await.unwrap();
    assert_eq!(backend.shutdowns(), 0);
}
