//! FFI helpers shared across the crate.

use std::ffi::{CStr, CString};
use std::os::raw::c_char;
use std::path::Path;

use crate::error::{Error, Result};

/// OS error text for a positive errno value.
pub(crate) fn errno_string(errno: i32) -> String {
    std::io::Error::from_raw_os_error(errno).to_string()
}

/// OS error text for the calling thread's current errno.
///
/// Pointer-returning libbpf calls report failure as NULL with errno set,
/// so this must be read before any other libc call.
pub(crate) fn last_errno_string() -> String {
    std::io::Error::last_os_error().to_string()
}

/// Convert a filesystem path into a NUL-terminated C string.
pub(crate) fn path_to_cstring(path: &Path) -> Result<CString> {
    use std::os::unix::ffi::OsStrExt;

    CString::new(path.as_os_str().as_bytes()).map_err(|_| Error::InvalidPath {
        path: path.display().to_string(),
    })
}

/// Copy a borrowed C string returned by libbpf into an owned `String`.
///
/// # Safety
///
/// `ptr` must be NULL or point to a valid NUL-terminated string.
pub(crate) unsafe fn cstr_to_string(ptr: *const c_char) -> String {
    if ptr.is_null() {
        String::new()
    } else {
        CStr::from_ptr(ptr).to_string_lossy().into_owned()
    }
}
