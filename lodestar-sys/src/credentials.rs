/// Peer credentials extracted from a Unix domain socket connection.
/// Provides the UID and GID of the connecting client, plus its PID where
/// the kernel reports one.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PeerCredentials {
    pub uid: u32,
    pub gid: u32,
    pub pid: Option<u32>,
}

impl PeerCredentials {
    /// The peer UID in string form, as compared against configured user ids.
    pub fn user_id(&self) -> String {
        self.uid.to_string()
    }
}
