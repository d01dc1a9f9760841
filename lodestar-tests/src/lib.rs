//! Test utilities for the lodestar workspace
//!
//! In-memory transports, a recording backend and a harness that runs the
//! control server against them, so session and permission rules can be
//! exercised end to end without real pipes or sockets.

pub mod helpers;

pub use helpers::backend::{BackendEvent, RecordingBackend};
pub use helpers::conn::{MemoryConnector, MemoryListener, TestConn, memory_transport};
pub use helpers::harness::{ServerHarness, wait_until};
pub use helpers::pipes::FakePipeSystem;
