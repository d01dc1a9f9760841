//! User database lookups (passwd / NSS).

use std::io;

/// Look up the UID of a user by name.
///
/// Returns `Ok(None)` when the name is not in the user database.
#[cfg(unix)]
pub fn uid_for_name(name: &str) -> io::Result<Option<u32>> {
    let user = nix::unistd::User::from_name(name).map_err(io::Error::from)?;
    Ok(user.map(|u| u.uid.as_raw()))
}

/// Look up the login name for a UID.
///
/// Returns `Ok(None)` when the UID has no passwd entry (common in containers).
#[cfg(unix)]
pub fn name_for_uid(uid: u32) -> io::Result<Option<String>> {
    let user = nix::unistd::User::from_uid(nix::unistd::Uid::from_raw(uid))
        .map_err(io::Error::from)?;
    Ok(user.map(|u| u.name))
}

#[cfg(not(unix))]
pub fn uid_for_name(name: &str) -> io::Result<Option<u32>> {
    Err(io::Error::new(
        io::ErrorKind::Unsupported,
        format!("user name resolution not supported on this platform: '{}'", name),
    ))
}

#[cfg(not(unix))]
pub fn name_for_uid(uid: u32) -> io::Result<Option<String>> {
    Err(io::Error::new(
        io::ErrorKind::Unsupported,
        format!("uid lookup not supported on this platform: {}", uid),
    ))
}
