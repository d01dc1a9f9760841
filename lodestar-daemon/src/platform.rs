//! Target platform selection.
//!
//! The platform decides which identity strategy runs on new connections and
//! how permissions are computed. It is normally the compile target but can be
//! overridden from the command line.

use std::fmt;
use std::str::FromStr;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Platform {
    Windows,
    /// Embedded in a host without a process boundary.
    Js,
    Linux,
    MacOs,
    FreeBsd,
    OpenBsd,
    /// Any other unix-like target.
    Unix,
}

impl Platform {
    pub fn current() -> Self {
        if cfg!(windows) {
            Platform::Windows
        } else if cfg!(target_arch = "wasm32") {
            Platform::Js
        } else if cfg!(target_os = "linux") {
            Platform::Linux
        } else if cfg!(target_os = "macos") {
            Platform::MacOs
        } else if cfg!(target_os = "freebsd") {
            Platform::FreeBsd
        } else if cfg!(target_os = "openbsd") {
            Platform::OpenBsd
        } else {
            Platform::Unix
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Platform::Windows => "windows",
            Platform::Js => "js",
            Platform::Linux => "linux",
            Platform::MacOs => "macos",
            Platform::FreeBsd => "freebsd",
            Platform::OpenBsd => "openbsd",
            Platform::Unix => "unix",
        }
    }

    /// Clients connect over named pipes and are identified via the pipe.
    pub fn uses_named_pipes(&self) -> bool {
        matches!(self, Platform::Windows)
    }

    pub fn is_embedded(&self) -> bool {
        matches!(self, Platform::Js)
    }

    /// Only one OS user may have requests in flight at a time.
    pub fn enforces_single_user(&self) -> bool {
        matches!(self, Platform::Windows)
    }

    /// The backend runs in client mode and is reset once the last request ends.
    pub fn reset_on_idle(&self) -> bool {
        matches!(self, Platform::Windows)
    }
}

impl Default for Platform {
    fn default() -> Self {
        Platform::current()
    }
}

impl FromStr for Platform {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "windows" => Ok(Platform::Windows),
            "js" => Ok(Platform::Js),
            "linux" => Ok(Platform::Linux),
            "macos" | "darwin" => Ok(Platform::MacOs),
            "freebsd" => Ok(Platform::FreeBsd),
            "openbsd" => Ok(Platform::OpenBsd),
            "unix" => Ok(Platform::Unix),
            _ => Err(format!(
                "invalid platform '{}': expected one of windows, js, linux, macos, freebsd, openbsd, unix",
                s
            )),
        }
    }
}

impl fmt::Display for Platform {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
