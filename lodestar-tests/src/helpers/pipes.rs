//! Scripted named pipe lookups.

use std::collections::HashMap;
use std::io;

use lodestar_daemon::identity::PipeSystem;
use lodestar_protocol::transport::PipeHandle;

#[derive(Debug, Clone)]
struct PipeClient {
    pid: u32,
    user_id: String,
    username: String,
}

/// [`PipeSystem`] answering from a table of known pipe handles.
///
/// Unknown handles fail the pid query; a client registered with an empty
/// user id fails the pid-to-user step, as a WSL process would.
#[derive(Debug, Clone, Default)]
pub struct FakePipeSystem {
    clients: HashMap<isize, PipeClient>,
}

impl FakePipeSystem {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_client(mut self, handle: isize, pid: u32, user_id: &str, username: &str) -> Self {
        self.clients.insert(
            handle,
            PipeClient {
                pid,
                user_id: user_id.to_string(),
                username: username.to_string(),
            },
        );
        self
    }
}

impl PipeSystem for FakePipeSystem {
    fn client_process_id(&self, handle: PipeHandle) -> io::Result<u32> {
        self.clients
            .get(&handle.0)
            .map(|c| c.pid)
            .ok_or_else(|| io::Error::new(io::ErrorKind::NotFound, "unknown pipe handle"))
    }

    fn user_id_of_pid(&self, pid: u32) -> io::Result<String> {
        self.clients
            .values()
            .find(|c| c.pid == pid && !c.user_id.is_empty())
            .map(|c| c.user_id.clone())
            .ok_or_else(|| io::Error::new(io::ErrorKind::NotFound, "no token for pid"))
    }

    fn username_of(&self, user_id: &str) -> io::Result<String> {
        self.clients
            .values()
            .find(|c| c.user_id == user_id)
            .map(|c| c.username.clone())
            .ok_or_else(|| io::Error::new(io::ErrorKind::NotFound, "unknown SID"))
    }
}
