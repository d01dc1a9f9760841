use std::path::PathBuf;

pub mod api;
pub mod backend;
pub mod config;
pub mod errors;
pub mod identity;
pub mod permissions;
pub mod platform;
pub mod server;

const GLOBAL_STATE_DIR: &str = ".lodestar";

/// `$HOME/.lodestar`, if a home directory can be determined.
pub fn global_state_dir() -> Option<PathBuf> {
    dirs::home_dir().map(|home| home.join(GLOBAL_STATE_DIR))
}

/// Default control socket location for the current platform.
pub fn default_socket_path() -> Option<PathBuf> {
    if cfg!(windows) {
        Some(PathBuf::from(r"\\.\pipe\lodestard"))
    } else {
        global_state_dir().map(|dir| dir.join("lodestar.sock"))
    }
}
