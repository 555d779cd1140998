use std::os::raw::{c_char, c_int, c_void};

use pyboot_abi::RuntimeVersion;

use crate::ffi::{
    wchar_t, PyCompilerFlags, PyConfig, PyObject, PyPreConfig, PyStatus, PyWideStringList,
    Py_ssize_t,
};

/// The runtime entry points the launcher drives, one method per symbol.
///
/// Implemented by [`crate::BoundLibrary`] over the bound function-pointer
/// table. Methods mirror the C signatures; callers uphold the C API's pointer
/// contracts, which is why they are `unsafe`.
pub trait PythonApi {
    /// Release the library was bound for.
    fn version(&self) -> RuntimeVersion;

    unsafe fn pre_config_init_isolated(&self, config: *mut PyPreConfig);
    unsafe fn pre_initialize(&self, config: *const PyPreConfig) -> PyStatus;

    unsafe fn config_init_isolated(&self, config: *mut PyConfig);
    unsafe fn config_set_bytes_string(
        &self,
        config: *mut PyConfig,
        field: *mut *mut wchar_t,
        value: *const c_char,
    ) -> PyStatus;
    unsafe fn config_set_string(
        &self,
        config: *mut PyConfig,
        field: *mut *mut wchar_t,
        value: *const wchar_t,
    ) -> PyStatus;
    unsafe fn config_set_wide_string_list(
        &self,
        config: *mut PyConfig,
        list: *mut PyWideStringList,
        length: Py_ssize_t,
        items: *mut *mut wchar_t,
    ) -> PyStatus;
    unsafe fn config_clear(&self, config: *mut PyConfig);

    unsafe fn initialize_from_config(&self, config: *const PyConfig) -> PyStatus;
    unsafe fn status_exception(&self, status: PyStatus) -> bool;
    /// Reports a failed status; exits the process when the status says so.
    unsafe fn exit_status_exception(&self, status: PyStatus);
    unsafe fn is_initialized(&self) -> bool;
    unsafe fn finalize(&self);
    unsafe fn run_simple_string(&self, command: *const c_char, flags: *mut PyCompilerFlags)
        -> c_int;

    unsafe fn decode_locale(&self, arg: *const c_char, size: *mut usize) -> *mut wchar_t;
    unsafe fn mem_raw_free(&self, ptr: *mut c_void);

    unsafe fn unicode_decode_fs_default(&self, value: *const c_char) -> *mut PyObject;
    unsafe fn unicode_from_string(&self, value: *const c_char) -> *mut PyObject;
    unsafe fn sys_get_object(&self, name: *const c_char) -> *mut PyObject;
    unsafe fn sys_set_object(&self, name: *const c_char, value: *mut PyObject) -> c_int;
    unsafe fn list_append(&self, list: *mut PyObject, item: *mut PyObject) -> c_int;
    unsafe fn dec_ref(&self, object: *mut PyObject);

    unsafe fn marshal_read_object_from_string(
        &self,
        data: *const c_char,
        len: Py_ssize_t,
    ) -> *mut PyObject;
    unsafe fn import_exec_code_module(
        &self,
        name: *const c_char,
        code: *mut PyObject,
    ) -> *mut PyObject;
    unsafe fn import_add_module(&self, name: *const c_char) -> *mut PyObject;
    unsafe fn module_get_dict(&self, module: *mut PyObject) -> *mut PyObject;
    unsafe fn object_set_attr_string(
        &self,
        object: *mut PyObject,
        name: *const c_char,
        value: *mut PyObject,
    ) -> c_int;
    unsafe fn eval_code(
        &self,
        code: *mut PyObject,
        globals: *mut PyObject,
        locals: *mut PyObject,
    ) -> *mut PyObject;

    unsafe fn err_occurred(&self) -> *mut PyObject;
    unsafe fn err_print(&self);
    unsafe fn err_clear(&self);
}

/// Prints and clears any pending runtime error. Returns whether one was set.
pub fn drain_pending_error(api: &dyn PythonApi) -> bool {
    // SAFETY: error-indicator calls take no arguments and are valid once the
    // runtime is initialized.
    unsafe {
        if api.err_occurred().is_null() {
            return false;
        }
        api.err_print();
        api.err_clear();
    }
    true
}
