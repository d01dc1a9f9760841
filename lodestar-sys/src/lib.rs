//! Native OS lookups used to identify the process at the other end of a
//! local control connection.
//!
//! Everything that calls into libc, NSS or the Win32 API lives here so the
//! daemon crate stays free of platform `unsafe`.

pub mod credentials;
pub mod errno;
pub mod pipe;
pub mod users;
