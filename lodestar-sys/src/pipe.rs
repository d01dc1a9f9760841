//! Named pipe client identification.
//!
//! On Windows a pipe server can ask the kernel which process is on the other
//! end of a connected pipe instance, and from there walk to the process token
//! and its user SID. Off Windows every lookup fails with
//! `ErrorKind::Unsupported`.

use std::io;

/// Raw value of a connected named pipe server handle.
///
/// Kept as an integer so connection metadata can carry it on every platform.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PipeHandle(pub isize);

/// An account resolved from a security identifier.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Account {
    pub name: String,
    pub domain: String,
}

impl Account {
    /// `DOMAIN\name`, or just `name` for accounts without a domain.
    pub fn qualified_name(&self) -> String {
        if self.domain.is_empty() {
            self.name.clone()
        } else {
            format!("{}\\{}", self.domain, self.name)
        }
    }
}

/// DACL for the control pipe: full access for SYSTEM and administrators,
/// read/write for members of the local Users group.
pub const LOCAL_USERS_PIPE_SDDL: &str = "D:P(A;;GA;;;SY)(A;;GA;;;BA)(A;;GRGW;;;BU)";

#[cfg(windows)]
pub use self::windows::{PipeSecurity, account_for_sid, client_process_id, owner_sid_of_pid};

#[cfg(windows)]
mod windows {
    use std::ffi::c_void;
    use std::io;
    use std::ptr;

    use windows_sys::Win32::Foundation::{CloseHandle, HANDLE, HLOCAL, LocalFree};
    use windows_sys::Win32::Security::Authorization::{
        ConvertSidToStringSidW, ConvertStringSecurityDescriptorToSecurityDescriptorW,
        ConvertStringSidToSidW,
    };
    use windows_sys::Win32::Security::{
        GetTokenInformation, LookupAccountSidW, PSECURITY_DESCRIPTOR, PSID, SECURITY_ATTRIBUTES,
        SID_NAME_USE, TOKEN_QUERY, TOKEN_USER, TokenUser,
    };
    use windows_sys::Win32::System::Pipes::GetNamedPipeClientProcessId;
    use windows_sys::Win32::System::Threading::{
        OpenProcess, OpenProcessToken, PROCESS_QUERY_LIMITED_INFORMATION,
    };

    use super::{Account, PipeHandle};

    /// Closes the wrapped handle on drop.
    struct OwnedHandle(HANDLE);

    impl Drop for OwnedHandle {
        fn drop(&mut self) {
            // SAFETY: the handle was returned by a successful Open* call and is closed once.
            unsafe {
                CloseHandle(self.0);
            }
        }
    }

    /// Frees a buffer allocated by the system with `LocalAlloc`.
    struct LocalBuffer(*mut c_void);

    impl Drop for LocalBuffer {
        fn drop(&mut self) {
            // SAFETY: the pointer came from a Convert* call that documents LocalFree ownership.
            unsafe {
                LocalFree(self.0 as HLOCAL);
            }
        }
    }

    const SDDL_REVISION_1: u32 = 1;

    /// Security attributes for creating pipe instances from an SDDL string.
    pub struct PipeSecurity {
        _descriptor: LocalBuffer,
        attributes: SECURITY_ATTRIBUTES,
    }

    // SAFETY: the descriptor is owned, immutable after creation and only read by CreateNamedPipe.
    unsafe impl Send for PipeSecurity {}
    unsafe impl Sync for PipeSecurity {}

    impl PipeSecurity {
        pub fn from_sddl(sddl: &str) -> io::Result<Self> {
            let wide = to_wide(sddl);
            let mut descriptor: PSECURITY_DESCRIPTOR = ptr::null_mut();
            // SAFETY: `wide` is NUL-terminated; the descriptor is freed by LocalBuffer.
            let ok = unsafe {
                ConvertStringSecurityDescriptorToSecurityDescriptorW(
                    wide.as_ptr(),
                    SDDL_REVISION_1,
                    &mut descriptor,
                    ptr::null_mut(),
                )
            };
            if ok == 0 {
                return Err(io::Error::last_os_error());
            }
            let descriptor = LocalBuffer(descriptor);
            let attributes = SECURITY_ATTRIBUTES {
                nLength: std::mem::size_of::<SECURITY_ATTRIBUTES>() as u32,
                lpSecurityDescriptor: descriptor.0,
                bInheritHandle: 0,
            };
            Ok(Self {
                _descriptor: descriptor,
                attributes,
            })
        }

        /// Pointer suitable for `CreateNamedPipeW`'s security attributes argument.
        pub fn as_ptr(&self) -> *mut c_void {
            &self.attributes as *const SECURITY_ATTRIBUTES as *mut c_void
        }
    }

    fn to_wide(s: &str) -> Vec<u16> {
        s.encode_utf16().chain(std::iter::once(0)).collect()
    }

    /// Read a NUL-terminated UTF-16 string.
    ///
    /// # Safety
    /// `ptr` must point to a valid NUL-terminated wide string.
    unsafe fn from_wide_ptr(ptr: *const u16) -> String {
        let mut len = 0;
        // SAFETY: caller guarantees NUL termination.
        unsafe {
            while *ptr.add(len) != 0 {
                len += 1;
            }
            String::from_utf16_lossy(std::slice::from_raw_parts(ptr, len))
        }
    }

    /// PID of the process connected to the client end of `handle`.
    pub fn client_process_id(handle: PipeHandle) -> io::Result<u32> {
        let mut pid: u32 = 0;
        // SAFETY: handle is a connected pipe server handle owned by the caller's connection.
        let ok = unsafe { GetNamedPipeClientProcessId(handle.0 as HANDLE, &mut pid) };
        if ok == 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(pid)
    }

    /// String SID (`S-1-5-21-...`) of the user owning process `pid`.
    pub fn owner_sid_of_pid(pid: u32) -> io::Result<String> {
        // SAFETY: plain Win32 calls; every returned handle is wrapped for closing.
        unsafe {
            let process = OpenProcess(PROCESS_QUERY_LIMITED_INFORMATION, 0, pid);
            if process.is_null() {
                return Err(io::Error::last_os_error());
            }
            let process = OwnedHandle(process);

            let mut token: HANDLE = ptr::null_mut();
            if OpenProcessToken(process.0, TOKEN_QUERY, &mut token) == 0 {
                return Err(io::Error::last_os_error());
            }
            let token = OwnedHandle(token);

            let mut len: u32 = 0;
            GetTokenInformation(token.0, TokenUser, ptr::null_mut(), 0, &mut len);
            if len == 0 {
                return Err(io::Error::last_os_error());
            }
            let mut buf = vec![0u8; len as usize];
            if GetTokenInformation(
                token.0,
                TokenUser,
                buf.as_mut_ptr() as *mut c_void,
                len,
                &mut len,
            ) == 0
            {
                return Err(io::Error::last_os_error());
            }
            let token_user = buf.as_ptr() as *const TOKEN_USER;
            let sid = (*token_user).User.Sid;

            let mut sid_str: *mut u16 = ptr::null_mut();
            if ConvertSidToStringSidW(sid, &mut sid_str) == 0 || sid_str.is_null() {
                return Err(io::Error::last_os_error());
            }
            let sid_str_buf = LocalBuffer(sid_str as *mut c_void);
            Ok(from_wide_ptr(sid_str_buf.0 as *const u16))
        }
    }

    /// Resolve a string SID to its account name.
    pub fn account_for_sid(sid: &str) -> io::Result<Account> {
        let wide = to_wide(sid);
        // SAFETY: `wide` is NUL-terminated; the converted SID is freed with LocalFree.
        unsafe {
            let mut psid: PSID = ptr::null_mut();
            if ConvertStringSidToSidW(wide.as_ptr(), &mut psid) == 0 {
                return Err(io::Error::last_os_error());
            }
            let psid = LocalBuffer(psid);

            let mut name_len: u32 = 0;
            let mut domain_len: u32 = 0;
            let mut use_kind: SID_NAME_USE = 0;
            LookupAccountSidW(
                ptr::null(),
                psid.0,
                ptr::null_mut(),
                &mut name_len,
                ptr::null_mut(),
                &mut domain_len,
                &mut use_kind,
            );
            if name_len == 0 {
                return Err(io::Error::last_os_error());
            }

            let mut name = vec![0u16; name_len as usize];
            let mut domain = vec![0u16; domain_len.max(1) as usize];
            if LookupAccountSidW(
                ptr::null(),
                psid.0,
                name.as_mut_ptr(),
                &mut name_len,
                domain.as_mut_ptr(),
                &mut domain_len,
                &mut use_kind,
            ) == 0
            {
                return Err(io::Error::last_os_error());
            }

            Ok(Account {
                name: String::from_utf16_lossy(&name[..name_len as usize]),
                domain: String::from_utf16_lossy(&domain[..domain_len as usize]),
            })
        }
    }
}

#[cfg(not(windows))]
fn unsupported() -> io::Error {
    io::Error::new(
        io::ErrorKind::Unsupported,
        "named pipe identity lookups are only available on Windows",
    )
}

#[cfg(not(windows))]
pub fn client_process_id(_handle: PipeHandle) -> io::Result<u32> {
    Err(unsupported())
}

#[cfg(not(windows))]
pub fn owner_sid_of_pid(_pid: u32) -> io::Result<String> {
    Err(unsupported())
}

#[cfg(not(windows))]
pub fn account_for_sid(_sid: &str) -> io::Result<Account> {
    Err(unsupported())
}
