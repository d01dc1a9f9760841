//! Errno classification for listener accept loops.

use std::io;

#[cfg(unix)]
pub use nix::errno::Errno;

/// The process or the system ran out of file descriptors.
#[cfg(unix)]
pub fn is_fd_exhaustion(e: &io::Error) -> bool {
    matches!(
        e.raw_os_error(),
        Some(code) if code == Errno::EMFILE as i32 || code == Errno::ENFILE as i32
    )
}

#[cfg(not(unix))]
pub fn is_fd_exhaustion(_e: &io::Error) -> bool {
    false
}
