//! The `PyConfig` block and the helpers that write its fields.
//!
//! String and list fields always go through the runtime's own setters so the
//! runtime applies its encoding rules; plain integer fields are written at the
//! offsets of the selected [`ConfigAbi`].

use std::alloc::Layout;
use std::ffi::{CStr, OsStr, OsString};
use std::os::raw::{c_int, c_ulong};
use std::ptr::NonNull;

use anyhow::{Context, Result};
use pyboot_abi::ConfigAbi;

use crate::api::PythonApi;
use crate::ffi::{wchar_t, PyConfig, PyStatus, PyWideStringList, Py_ssize_t};

/// Zero-initialized memory sized and aligned for one release's `PyConfig`.
pub struct ConfigBlock {
    ptr: NonNull<u8>,
    layout: Layout,
    abi: ConfigAbi,
}

impl ConfigBlock {
    pub fn allocate(abi: ConfigAbi) -> Result<Self> {
        let config = abi.layout();
        let layout = Layout::from_size_align(config.size, config.align)
            .with_context(|| format!("invalid layout for {abi}"))?;
        // SAFETY: every PyConfig layout has a non-zero size.
        let raw = unsafe { std::alloc::alloc_zeroed(layout) };
        let ptr = NonNull::new(raw)
            .with_context(|| format!("failed to allocate {} bytes for {abi}", config.size))?;
        Ok(ConfigBlock { ptr, layout, abi })
    }

    pub fn abi(&self) -> ConfigAbi {
        self.abi
    }

    pub fn as_ptr(&self) -> *mut PyConfig {
        self.ptr.as_ptr().cast()
    }

    fn field<T>(&self, offset: usize) -> *mut T {
        debug_assert!(offset + std::mem::size_of::<T>() <= self.layout.size());
        // SAFETY: offsets come from the layout this block was sized for.
        unsafe { self.ptr.as_ptr().add(offset).cast() }
    }

    pub fn set_int(&mut self, offset: usize, value: c_int) {
        // SAFETY: in-bounds, aligned int field of the selected layout.
        unsafe { self.field::<c_int>(offset).write(value) }
    }

    pub fn int(&self, offset: usize) -> c_int {
        // SAFETY: in-bounds, aligned int field of the selected layout.
        unsafe { self.field::<c_int>(offset).read() }
    }

    pub fn set_ulong(&mut self, offset: usize, value: c_ulong) {
        // SAFETY: in-bounds, aligned unsigned long field of the selected layout.
        unsafe { self.field::<c_ulong>(offset).write(value) }
    }

    pub fn wide_string_field(&self, offset: usize) -> *mut *mut wchar_t {
        self.field(offset)
    }

    pub fn wide_list_field(&self, offset: usize) -> *mut PyWideStringList {
        self.field(offset)
    }
}

impl Drop for ConfigBlock {
    fn drop(&mut self) {
        // SAFETY: allocated in `allocate` with this exact layout.
        unsafe { std::alloc::dealloc(self.ptr.as_ptr(), self.layout) }
    }
}

/// Error text carried by a failed status, if any.
pub fn status_message(status: &PyStatus) -> String {
    let read = |ptr: *const std::os::raw::c_char| {
        if ptr.is_null() {
            None
        } else {
            // SAFETY: the runtime fills these with static NUL-terminated strings.
            Some(unsafe { CStr::from_ptr(ptr) }.to_string_lossy().into_owned())
        }
    };
    match (read(status.func), read(status.err_msg)) {
        (Some(func), Some(msg)) => format!("{func}: {msg}"),
        (None, Some(msg)) => msg,
        (Some(func), None) => format!("{func}: error"),
        (None, None) => format!("exit code {}", status.exitcode),
    }
}

pub fn check_status(api: &dyn PythonApi, status: PyStatus, step: &str) -> Result<()> {
    // SAFETY: PyStatus is passed by value.
    if unsafe { api.status_exception(status) } {
        anyhow::bail!("{step} failed: {}", status_message(&status));
    }
    Ok(())
}

/// Sets a `wchar_t *` field from a native string.
pub fn set_string(
    api: &dyn PythonApi,
    block: &mut ConfigBlock,
    offset: usize,
    value: &OsStr,
    step: &str,
) -> Result<()> {
    let field = block.wide_string_field(offset);

    #[cfg(not(windows))]
    let status = {
        let value = crate::ffi::os_cstring(value).with_context(|| step.to_string())?;
        // SAFETY: block holds an initialized PyConfig; the field belongs to it.
        unsafe { api.config_set_bytes_string(block.as_ptr(), field, value.as_ptr()) }
    };
    #[cfg(windows)]
    let status = {
        let value = crate::ffi::os_wide(value);
        // SAFETY: block holds an initialized PyConfig; the field belongs to it.
        unsafe { api.config_set_string(block.as_ptr(), field, value.as_ptr()) }
    };

    check_status(api, status, step)
}

/// Replaces a `PyWideStringList` field.
pub fn set_string_list(
    api: &dyn PythonApi,
    block: &mut ConfigBlock,
    offset: usize,
    values: &[OsString],
    step: &str,
) -> Result<()> {
    let mut strings = WideStrings::new(api, values).with_context(|| step.to_string())?;
    let length = Py_ssize_t::try_from(strings.len()).with_context(|| step.to_string())?;
    // SAFETY: block holds an initialized PyConfig; the runtime copies the items.
    let status = unsafe {
        api.config_set_wide_string_list(
            block.as_ptr(),
            block.wide_list_field(offset),
            length,
            strings.as_mut_ptr(),
        )
    };
    check_status(api, status, step)
}

/// Wide copies of native strings, owned for the duration of one setter call.
///
/// Outside Windows the conversion uses the runtime's locale decoder and the
/// buffers are returned to the runtime allocator on drop.
struct WideStrings<'a> {
    #[cfg_attr(windows, allow(dead_code))]
    api: &'a dyn PythonApi,
    #[cfg(windows)]
    _owned: Vec<Vec<wchar_t>>,
    items: Vec<*mut wchar_t>,
}

impl<'a> WideStrings<'a> {
    #[cfg(not(windows))]
    fn new(api: &'a dyn PythonApi, values: &[OsString]) -> Result<Self> {
        let mut strings = WideStrings {
            api,
            items: Vec::with_capacity(values.len()),
        };
        for value in values {
            let raw = crate::ffi::os_cstring(value)?;
            // SAFETY: raw is NUL-terminated and outlives the call.
            let decoded = unsafe { api.decode_locale(raw.as_ptr(), std::ptr::null_mut()) };
            if decoded.is_null() {
                anyhow::bail!("failed to decode {value:?} with the runtime locale");
            }
            strings.items.push(decoded);
        }
        Ok(strings)
    }

    #[cfg(windows)]
    fn new(api: &'a dyn PythonApi, values: &[OsString]) -> Result<Self> {
        let mut owned: Vec<Vec<wchar_t>> = values.iter().map(|v| crate::ffi::os_wide(v)).collect();
        let items = owned.iter_mut().map(|w| w.as_mut_ptr()).collect();
        Ok(WideStrings {
            api,
            _owned: owned,
            items,
        })
    }

    fn len(&self) -> usize {
        self.items.len()
    }

    fn as_mut_ptr(&mut self) -> *mut *mut wchar_t {
        self.items.as_mut_ptr()
    }
}

impl Drop for WideStrings<'_> {
    fn drop(&mut self) {
        #[cfg(not(windows))]
        for item in self.items.drain(..) {
            // SAFETY: allocated by Py_DecodeLocale, freed exactly once.
            unsafe { self.api.mem_raw_free(item.cast()) }
        }
    }
}
