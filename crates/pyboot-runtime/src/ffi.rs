//! C-side types that the launcher only handles by pointer.

#![allow(non_camel_case_types)]

use std::ffi::{CString, OsStr};
use std::path::Path;

use anyhow::{Context, Result};

pub use libc::wchar_t;
pub use pyboot_abi::{PyPreConfig, PyStatus, PyWideStringList, Py_ssize_t};

#[repr(C)]
pub struct PyObject {
    _private: [u8; 0],
}

/// Any release's `PyConfig`; the layout is known only through
/// [`pyboot_abi::ConfigLayout`].
#[repr(C)]
pub struct PyConfig {
    _private: [u8; 0],
}

#[repr(C)]
pub struct PyCompilerFlags {
    _private: [u8; 0],
}

/// Native byte representation of a path, as handed to `char *` APIs.
pub fn os_cstring(value: &OsStr) -> Result<CString> {
    #[cfg(unix)]
    let bytes = {
        use std::os::unix::ffi::OsStrExt;
        value.as_bytes().to_vec()
    };
    #[cfg(not(unix))]
    let bytes = value
        .to_str()
        .with_context(|| format!("not valid UTF-8: {value:?}"))?
        .as_bytes()
        .to_vec();
    CString::new(bytes).with_context(|| format!("interior NUL in {value:?}"))
}

pub fn path_cstring(path: &Path) -> Result<CString> {
    os_cstring(path.as_os_str())
}

pub fn str_cstring(value: &str) -> Result<CString> {
    CString::new(value).with_context(|| format!("interior NUL in {value:?}"))
}

/// NUL-terminated wide string for `wchar_t *` APIs on Windows.
#[cfg(windows)]
pub fn os_wide(value: &OsStr) -> Vec<wchar_t> {
    use std::os::windows::ffi::OsStrExt;
    value.encode_wide().chain(std::iter::once(0)).collect()
}
