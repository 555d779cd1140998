//! Opens the runtime shared library and binds the entry points the launcher
//! uses.
//!
//! Binding is all-or-nothing: either every name in [`REQUIRED_SYMBOLS`]
//! resolves and a [`BoundLibrary`] is returned, or the library handle is closed
//! and [`BindError::MissingSymbols`] lists every absent name. Retrying with a
//! different file name is the caller's job (see [`candidate_library_names`]).

use std::fmt;
use std::os::raw::{c_char, c_int, c_void};
use std::path::{Path, PathBuf};
use std::ptr::NonNull;

use pyboot_abi::RuntimeVersion;

use crate::api::PythonApi;
use crate::ffi::{
    wchar_t, PyCompilerFlags, PyConfig, PyObject, PyPreConfig, PyStatus, PyWideStringList,
    Py_ssize_t,
};

/// Anything exported symbols can be looked up in.
pub trait SymbolSource {
    fn resolve(&self, name: &str) -> Option<NonNull<c_void>>;
}

impl SymbolSource for libloading::Library {
    fn resolve(&self, name: &str) -> Option<NonNull<c_void>> {
        // SAFETY: the address is only read here; its type is fixed by the
        // symbol table the caller transmutes it into.
        let symbol = unsafe { self.get::<*mut c_void>(name.as_bytes()) }.ok()?;
        NonNull::new(*symbol)
    }
}

#[derive(Debug)]
pub enum BindError {
    Open {
        path: PathBuf,
        message: String,
    },
    MissingSymbols {
        path: PathBuf,
        names: Vec<&'static str>,
    },
}

impl fmt::Display for BindError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BindError::Open { path, message } => {
                write!(f, "failed to load python library {}: {message}", path.display())
            }
            BindError::MissingSymbols { path, names } => write!(
                f,
                "python library {} is missing required symbols: {}",
                path.display(),
                names.join(", ")
            ),
        }
    }
}

impl std::error::Error for BindError {}

macro_rules! python_symbols {
    ($( $field:ident = $symbol:literal : fn($($arg:ty),* $(,)?) $(-> $ret:ty)?; )*) => {
        /// Function-pointer table over the bound runtime library.
        pub struct PythonSymbols {
            $( pub $field: unsafe extern "C" fn($($arg),*) $(-> $ret)?, )*
        }

        /// Every exported name the launcher binds, in declaration order.
        pub const REQUIRED_SYMBOLS: &[&str] = &[$($symbol),*];

        impl PythonSymbols {
            fn resolve<L: SymbolSource + ?Sized>(library: &L) -> Result<Self, Vec<&'static str>> {
                let mut missing = Vec::new();
                $(
                    let $field = library.resolve($symbol);
                    if $field.is_none() {
                        missing.push($symbol);
                    }
                )*
                if !missing.is_empty() {
                    return Err(missing);
                }
                let table = (|| {
                    Some(PythonSymbols {
                        $(
                            // SAFETY: the exported symbol has this C signature
                            // in every supported runtime release.
                            $field: unsafe {
                                std::mem::transmute::<
                                    *mut c_void,
                                    unsafe extern "C" fn($($arg),*) $(-> $ret)?,
                                >($field?.as_ptr())
                            },
                        )*
                    })
                })();
                table.ok_or(missing)
            }
        }
    };
}

python_symbols! {
    dec_ref = "Py_DecRef": fn(*mut PyObject);
    decode_locale = "Py_DecodeLocale": fn(*const c_char, *mut usize) -> *mut wchar_t;
    exit_status_exception = "Py_ExitStatusException": fn(PyStatus);
    finalize = "Py_Finalize": fn();
    initialize_from_config = "Py_InitializeFromConfig": fn(*const PyConfig) -> PyStatus;
    is_initialized = "Py_IsInitialized": fn() -> c_int;
    pre_initialize = "Py_PreInitialize": fn(*const PyPreConfig) -> PyStatus;
    config_clear = "PyConfig_Clear": fn(*mut PyConfig);
    config_init_isolated = "PyConfig_InitIsolatedConfig": fn(*mut PyConfig);
    config_set_bytes_string = "PyConfig_SetBytesString":
        fn(*mut PyConfig, *mut *mut wchar_t, *const c_char) -> PyStatus;
    config_set_string = "PyConfig_SetString":
        fn(*mut PyConfig, *mut *mut wchar_t, *const wchar_t) -> PyStatus;
    config_set_wide_string_list = "PyConfig_SetWideStringList":
        fn(*mut PyConfig, *mut PyWideStringList, Py_ssize_t, *mut *mut wchar_t) -> PyStatus;
    err_clear = "PyErr_Clear": fn();
    err_occurred = "PyErr_Occurred": fn() -> *mut PyObject;
    err_print = "PyErr_Print": fn();
    eval_code = "PyEval_EvalCode": fn(*mut PyObject, *mut PyObject, *mut PyObject) -> *mut PyObject;
    import_add_module = "PyImport_AddModule": fn(*const c_char) -> *mut PyObject;
    import_exec_code_module = "PyImport_ExecCodeModule":
        fn(*const c_char, *mut PyObject) -> *mut PyObject;
    list_append = "PyList_Append": fn(*mut PyObject, *mut PyObject) -> c_int;
    marshal_read_object_from_string = "PyMarshal_ReadObjectFromString":
        fn(*const c_char, Py_ssize_t) -> *mut PyObject;
    mem_raw_free = "PyMem_RawFree": fn(*mut c_void);
    module_get_dict = "PyModule_GetDict": fn(*mut PyObject) -> *mut PyObject;
    object_set_attr_string = "PyObject_SetAttrString":
        fn(*mut PyObject, *const c_char, *mut PyObject) -> c_int;
    pre_config_init_isolated = "PyPreConfig_InitIsolatedConfig": fn(*mut PyPreConfig);
    run_simple_string_flags = "PyRun_SimpleStringFlags":
        fn(*const c_char, *mut PyCompilerFlags) -> c_int;
    status_exception = "PyStatus_Exception": fn(PyStatus) -> c_int;
    sys_get_object = "PySys_GetObject": fn(*const c_char) -> *mut PyObject;
    sys_set_object = "PySys_SetObject": fn(*const c_char, *mut PyObject) -> c_int;
    unicode_decode_fs_default = "PyUnicode_DecodeFSDefault": fn(*const c_char) -> *mut PyObject;
    unicode_from_string = "PyUnicode_FromString": fn(*const c_char) -> *mut PyObject;
}

/// A runtime library together with its bound entry points.
///
/// The pointers in `symbols` stay valid for as long as the library handle is
/// open. The handle is held only to be closed on drop.
pub struct BoundLibrary<L: SymbolSource = libloading::Library> {
    symbols: PythonSymbols,
    version: RuntimeVersion,
    path: PathBuf,
    _library: L,
}

impl<L: SymbolSource> BoundLibrary<L> {
    /// Binds every required symbol from an already opened library.
    ///
    /// On failure `library` is dropped before returning.
    pub fn bind(library: L, path: &Path, version: RuntimeVersion) -> Result<Self, BindError> {
        match PythonSymbols::resolve(&library) {
            Ok(symbols) => {
                log::debug!(
                    "bound {} symbols from {} (python {version})",
                    REQUIRED_SYMBOLS.len(),
                    path.display()
                );
                Ok(BoundLibrary {
                    symbols,
                    version,
                    path: path.to_path_buf(),
                    _library: library,
                })
            }
            Err(names) => {
                drop(library);
                for name in &names {
                    log::debug!("symbol {name} not found in {}", path.display());
                }
                Err(BindError::MissingSymbols {
                    path: path.to_path_buf(),
                    names,
                })
            }
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

}

impl BoundLibrary<libloading::Library> {
    /// Opens `path` and binds it.
    pub fn load(path: &Path, version: RuntimeVersion) -> Result<Self, BindError> {
        log::debug!("loading python library: {}", path.display());
        let library = open_library(path).map_err(|err| BindError::Open {
            path: path.to_path_buf(),
            message: err.to_string(),
        })?;
        Self::bind(library, path, version)
    }
}

impl<L: SymbolSource> Drop for BoundLibrary<L> {
    fn drop(&mut self) {
        log::debug!("unloading python library: {}", self.path.display());
    }
}

#[cfg(unix)]
fn open_library(path: &Path) -> Result<libloading::Library, libloading::Error> {
    use libloading::os::unix::Library;
    // SAFETY: library initializers of the runtime are trusted.
    unsafe { Library::open(Some(path), dlopen_flags()) }.map(Into::into)
}

/// Extension modules resolve runtime symbols globally, hence `RTLD_GLOBAL`.
/// On AIX `RTLD_MEMBER` lets `lib.a(member.so)` name a member of an archive.
#[cfg(unix)]
fn dlopen_flags() -> c_int {
    use libloading::os::unix::{RTLD_GLOBAL, RTLD_NOW};
    let flags = RTLD_NOW | RTLD_GLOBAL;
    #[cfg(target_os = "aix")]
    let flags = flags | libc::RTLD_MEMBER;
    flags
}

#[cfg(windows)]
fn open_library(path: &Path) -> Result<libloading::Library, libloading::Error> {
    use libloading::os::windows::{Library, LOAD_WITH_ALTERED_SEARCH_PATH};
    // Dependencies next to the runtime DLL are found through the altered
    // search path.
    // SAFETY: library initializers of the runtime are trusted.
    unsafe { Library::load_with_flags(path, LOAD_WITH_ALTERED_SEARCH_PATH) }.map(Into::into)
}

/// File names to try, in order, for the runtime library named in the archive.
///
/// Names ending in `.a` are AIX archives; the shared object inside is
/// addressed as `libpythonX.Y.a(libpythonX.Y.so)`.
pub fn candidate_library_names(libname: &str, version: RuntimeVersion) -> Vec<String> {
    let mut names = vec![libname.to_string()];
    if libname.ends_with(".a") {
        let (major, minor) = (version.major(), version.minor());
        names.push(format!(
            "libpython{major}.{minor}.a(libpython{major}.{minor}.so)"
        ));
    }
    names
}

impl<L: SymbolSource> PythonApi for BoundLibrary<L> {
    fn version(&self) -> RuntimeVersion {
        self.version
    }

    unsafe fn pre_config_init_isolated(&self, config: *mut PyPreConfig) {
        (self.symbols.pre_config_init_isolated)(config)
    }

    unsafe fn pre_initialize(&self, config: *const PyPreConfig) -> PyStatus {
        (self.symbols.pre_initialize)(config)
    }

    unsafe fn config_init_isolated(&self, config: *mut PyConfig) {
        (self.symbols.config_init_isolated)(config)
    }

    unsafe fn config_set_bytes_string(
        &self,
        config: *mut PyConfig,
        field: *mut *mut wchar_t,
        value: *const c_char,
    ) -> PyStatus {
        (self.symbols.config_set_bytes_string)(config, field, value)
    }

    unsafe fn config_set_string(
        &self,
        config: *mut PyConfig,
        field: *mut *mut wchar_t,
        value: *const wchar_t,
    ) -> PyStatus {
        (self.symbols.config_set_string)(config, field, value)
    }

    unsafe fn config_set_wide_string_list(
        &self,
        config: *mut PyConfig,
        list: *mut PyWideStringList,
        length: Py_ssize_t,
        items: *mut *mut wchar_t,
    ) -> PyStatus {
        (self.symbols.config_set_wide_string_list)(config, list, length, items)
    }

    unsafe fn config_clear(&self, config: *mut PyConfig) {
        (self.symbols.config_clear)(config)
    }

    unsafe fn initialize_from_config(&self, config: *const PyConfig) -> PyStatus {
        (self.symbols.initialize_from_config)(config)
    }

    unsafe fn status_exception(&self, status: PyStatus) -> bool {
        (self.symbols.status_exception)(status) != 0
    }

    unsafe fn exit_status_exception(&self, status: PyStatus) {
        (self.symbols.exit_status_exception)(status)
    }

    unsafe fn is_initialized(&self) -> bool {
        (self.symbols.is_initialized)() != 0
    }

    unsafe fn finalize(&self) {
        (self.symbols.finalize)()
    }

    unsafe fn run_simple_string(
        &self,
        command: *const c_char,
        flags: *mut PyCompilerFlags,
    ) -> c_int {
        (self.symbols.run_simple_string_flags)(command, flags)
    }

    unsafe fn decode_locale(&self, arg: *const c_char, size: *mut usize) -> *mut wchar_t {
        (self.symbols.decode_locale)(arg, size)
    }

    unsafe fn mem_raw_free(&self, ptr: *mut c_void) {
        (self.symbols.mem_raw_free)(ptr)
    }

    unsafe fn unicode_decode_fs_default(&self, value: *const c_char) -> *mut PyObject {
        (self.symbols.unicode_decode_fs_default)(value)
    }

    unsafe fn unicode_from_string(&self, value: *const c_char) -> *mut PyObject {
        (self.symbols.unicode_from_string)(value)
    }

    unsafe fn sys_get_object(&self, name: *const c_char) -> *mut PyObject {
        (self.symbols.sys_get_object)(name)
    }

    unsafe fn sys_set_object(&self, name: *const c_char, value: *mut PyObject) -> c_int {
        (self.symbols.sys_set_object)(name, value)
    }

    unsafe fn list_append(&self, list: *mut PyObject, item: *mut PyObject) -> c_int {
        (self.symbols.list_append)(list, item)
    }

    unsafe fn dec_ref(&self, object: *mut PyObject) {
        (self.symbols.dec_ref)(object)
    }

    unsafe fn marshal_read_object_from_string(
        &self,
        data: *const c_char,
        len: Py_ssize_t,
    ) -> *mut PyObject {
        (self.symbols.marshal_read_object_from_string)(data, len)
    }

    unsafe fn import_exec_code_module(
        &self,
        name: *const c_char,
        code: *mut PyObject,
    ) -> *mut PyObject {
        (self.symbols.import_exec_code_module)(name, code)
    }

    unsafe fn import_add_module(&self, name: *const c_char) -> *mut PyObject {
        (self.symbols.import_add_module)(name)
    }

    unsafe fn module_get_dict(&self, module: *mut PyObject) -> *mut PyObject {
        (self.symbols.module_get_dict)(module)
    }

    unsafe fn object_set_attr_string(
        &self,
        object: *mut PyObject,
        name: *const c_char,
        value: *mut PyObject,
    ) -> c_int {
        (self.symbols.object_set_attr_string)(object, name, value)
    }

    unsafe fn eval_code(
        &self,
        code: *mut PyObject,
        globals: *mut PyObject,
        locals: *mut PyObject,
    ) -> *mut PyObject {
        (self.symbols.eval_code)(code, globals, locals)
    }

    unsafe fn err_occurred(&self) -> *mut PyObject {
        (self.symbols.err_occurred)()
    }

    unsafe fn err_print(&self) {
        (self.symbols.err_print)()
    }

    unsafe fn err_clear(&self) {
        (self.symbols.err_clear)()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn candidates_add_aix_member_form() {
        let version = RuntimeVersion::new(3, 11);
        assert_eq!(
            candidate_library_names("libpython3.11.so.1.0", version),
            ["libpython3.11.so.1.0"]
        );
        assert_eq!(
            candidate_library_names("libpython3.11.a", version),
            ["libpython3.11.a", "libpython3.11.a(libpython3.11.so)"]
        );
    }

    #[cfg(unix)]
    #[test]
    fn runtime_is_opened_now_and_global() {
        use libloading::os::unix::{RTLD_GLOBAL, RTLD_NOW};
        let flags = dlopen_flags();
        assert_eq!(flags & RTLD_NOW, RTLD_NOW);
        assert_eq!(flags & RTLD_GLOBAL, RTLD_GLOBAL);
        #[cfg(target_os = "aix")]
        assert_eq!(flags & libc::RTLD_MEMBER, libc::RTLD_MEMBER);
    }

    #[test]
    fn required_symbols_are_unique() {
        let mut names = REQUIRED_SYMBOLS.to_vec();
        names.sort_unstable();
        names.dedup();
        assert_eq!(names.len(), REQUIRED_SYMBOLS.len());
    }
}
