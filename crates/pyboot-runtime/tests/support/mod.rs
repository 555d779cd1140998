#![allow(dead_code)]

use std::cell::{Cell, RefCell};
use std::collections::{HashMap, HashSet};
use std::ffi::{c_void, CStr};
use std::os::raw::{c_char, c_int};
use std::path::{Path, PathBuf};
use std::ptr::NonNull;
use std::rc::Rc;

use pyboot_abi::{AbiFlags, ConfigAbi, RuntimeVersion};
use pyboot_archive::{ArchiveWriter, EntryKind};
use pyboot_runtime::ffi::{
    wchar_t, PyCompilerFlags, PyConfig, PyObject, PyPreConfig, PyStatus, PyWideStringList,
    Py_ssize_t,
};
use pyboot_runtime::{BindError, BoundLibrary, PythonApi, PythonLoader, SymbolSource};

pub fn create_temp_dir(prefix: &str) -> PathBuf {
    use std::sync::atomic::{AtomicU64, Ordering};
    static COUNTER: AtomicU64 = AtomicU64::new(0);

    let base = std::env::temp_dir();
    let pid = std::process::id();
    for _ in 0..10_000 {
        let n = COUNTER.fetch_add(1, Ordering::Relaxed);
        let path = base.join(format!("{prefix}_{pid}_{n}"));
        if std::fs::create_dir(&path).is_ok() {
            return path;
        }
    }
    panic!("failed to create temp dir under {}", base.display());
}

pub fn rm_rf(path: &Path) {
    let _ = std::fs::remove_dir_all(path);
}

/// Writes `prefix_len` filler bytes and then the archive to `dir/app`.
pub fn write_app(dir: &Path, prefix_len: usize, writer: &ArchiveWriter) -> PathBuf {
    let exe = dir.join("app");
    std::fs::write(&exe, vec![0x90u8; prefix_len]).unwrap();
    writer.append_to(&exe).unwrap();
    exe
}

pub fn module_archive(version: u32, modules: &[(EntryKind, &str, &[u8])]) -> ArchiveWriter {
    let mut writer = ArchiveWriter::new(version, "libpython-fake.so");
    for (kind, name, payload) in modules {
        writer.add_compressed(*kind, name, payload).unwrap();
    }
    writer
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Call {
    PreConfigInitIsolated,
    PreInitialize { utf8_mode: c_int, dev_mode: c_int },
    ConfigInitIsolated,
    SetString { field: &'static str, value: String },
    SetWideStringList { field: &'static str, items: Vec<String> },
    ConfigClear,
    InitializeFromConfig,
    ExitStatusException,
    IsInitialized,
    Finalize,
    RunSimpleString(String),
    DecodeLocale(String),
    MemRawFree,
    DecodeFsDefault(String),
    FromString(String),
    SysGetObject(String),
    SysSetObject { name: String, value: String },
    ListAppend(String),
    DecRef,
    Marshal(Vec<u8>),
    ExecCodeModule { name: String, payload: Vec<u8> },
    AddModule(String),
    ModuleGetDict,
    SetAttr { name: String },
    EvalCode(Vec<u8>),
    ErrOccurred,
    ErrPrint,
    ErrClear,
}

impl Call {
    /// Reference-count and error-query chatter, filtered from most sequences.
    pub fn is_noise(&self) -> bool {
        matches!(
            self,
            Call::DecRef | Call::ErrOccurred | Call::DecodeLocale(_) | Call::MemRawFree
        )
    }
}

/// Steps a [`FakePython`] can be told to fail.
#[derive(Debug, Clone, Default)]
pub struct Failures {
    pub pre_initialize: bool,
    pub set_string: Option<&'static str>,
    pub set_list: Option<&'static str>,
    pub initialize: bool,
    pub sys_set_object: bool,
    pub decode_locale: bool,
    /// Payload that fails to unmarshal.
    pub bad_payload: Option<Vec<u8>>,
    /// Module whose execution raises.
    pub exec_module: Option<String>,
    /// Scripts whose payload starts with this prefix raise when evaluated.
    pub raising_script_prefix: Option<Vec<u8>>,
    pub not_initialized_at_exit: bool,
}

/// Values read out of the `PyConfig` block when it is handed to the runtime.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ConfigSnapshot {
    pub site_import: c_int,
    pub write_bytecode: c_int,
    pub configure_c_stdio: c_int,
    pub buffered_stdio: c_int,
    pub optimization_level: c_int,
    pub verbose: c_int,
    pub install_signal_handlers: c_int,
    pub use_hash_seed: c_int,
    pub hash_seed: u64,
    pub dev_mode: c_int,
    pub module_search_paths_set: c_int,
}

#[derive(Default)]
struct State {
    calls: Vec<Call>,
    failures: Failures,
    config_base: usize,
    snapshot: Option<ConfigSnapshot>,
    next_object: usize,
    strings: HashMap<usize, String>,
    code: HashMap<usize, Vec<u8>>,
    pending_error: bool,
    wide_arena: Vec<Box<[wchar_t]>>,
}

/// Recording stand-in for a bound runtime library.
#[derive(Clone)]
pub struct FakePython {
    version: RuntimeVersion,
    flags: AbiFlags,
    state: Rc<RefCell<State>>,
}

const ERR_FUNC: &CStr = c"fake_runtime";
const ERR_MSG: &CStr = c"injected failure";

fn error_status() -> PyStatus {
    PyStatus {
        _type: 1,
        func: ERR_FUNC.as_ptr(),
        err_msg: ERR_MSG.as_ptr(),
        exitcode: 0,
    }
}

unsafe fn read_c(ptr: *const c_char) -> String {
    CStr::from_ptr(ptr).to_string_lossy().into_owned()
}

unsafe fn read_wide(mut ptr: *const wchar_t) -> String {
    let mut out = String::new();
    while *ptr != 0 {
        out.push(char::from_u32(*ptr as u32).unwrap_or('\u{fffd}'));
        ptr = ptr.add(1);
    }
    out
}

impl FakePython {
    pub fn new(version: RuntimeVersion) -> Self {
        Self::with_flags(version, AbiFlags::default())
    }

    pub fn with_flags(version: RuntimeVersion, flags: AbiFlags) -> Self {
        FakePython {
            version,
            flags,
            state: Rc::new(RefCell::new(State {
                next_object: 1,
                ..State::default()
            })),
        }
    }

    pub fn fail(&self, f: impl FnOnce(&mut Failures)) {
        f(&mut self.state.borrow_mut().failures);
    }

    pub fn calls(&self) -> Vec<Call> {
        self.state.borrow().calls.clone()
    }

    /// Calls without reference-count and error-query chatter.
    pub fn significant_calls(&self) -> Vec<Call> {
        self.calls().into_iter().filter(|c| !c.is_noise()).collect()
    }

    pub fn count(&self, pred: impl Fn(&Call) -> bool) -> usize {
        self.state.borrow().calls.iter().filter(|c| pred(c)).count()
    }

    pub fn snapshot(&self) -> Option<ConfigSnapshot> {
        self.state.borrow().snapshot.clone()
    }

    pub fn executed_modules(&self) -> Vec<String> {
        self.calls()
            .into_iter()
            .filter_map(|c| match c {
                Call::ExecCodeModule { name, .. } => Some(name),
                _ => None,
            })
            .collect()
    }

    pub fn sys_path_appends(&self) -> Vec<String> {
        self.calls()
            .into_iter()
            .filter_map(|c| match c {
                Call::ListAppend(item) => Some(item),
                _ => None,
            })
            .collect()
    }

    fn record(&self, call: Call) {
        self.state.borrow_mut().calls.push(call);
    }

    fn new_object(&self) -> *mut PyObject {
        let mut state = self.state.borrow_mut();
        let id = state.next_object;
        state.next_object += 1;
        (id * 16) as *mut PyObject
    }

    fn new_string(&self, value: String) -> *mut PyObject {
        let obj = self.new_object();
        self.state.borrow_mut().strings.insert(obj as usize, value);
        obj
    }

    fn string_of(&self, obj: *mut PyObject) -> String {
        self.state
            .borrow()
            .strings
            .get(&(obj as usize))
            .cloned()
            .unwrap_or_default()
    }

    fn abi(&self) -> ConfigAbi {
        ConfigAbi::select(self.version, self.flags).unwrap()
    }

    fn field_name(&self, field: *mut c_void) -> &'static str {
        let offset = field as usize - self.state.borrow().config_base;
        let o = self.abi().layout().offsets;
        match offset {
            x if x == o.program_name => "program_name",
            x if x == o.home => "home",
            x if x == o.module_search_paths => "module_search_paths",
            x if x == o.argv => "argv",
            x if x == o.warnoptions => "warnoptions",
            x if x == o.xoptions => "xoptions",
            _ => "unknown",
        }
    }

    fn set_string_status(&self, field: &'static str) -> PyStatus {
        if self.state.borrow().failures.set_string == Some(field) {
            error_status()
        } else {
            PyStatus::ok()
        }
    }

    unsafe fn take_snapshot(&self, config: *const PyConfig) -> ConfigSnapshot {
        let o = self.abi().layout().offsets;
        let base = config as *const u8;
        let int = |off: usize| base.add(off).cast::<c_int>().read();
        ConfigSnapshot {
            site_import: int(o.site_import),
            write_bytecode: int(o.write_bytecode),
            configure_c_stdio: int(o.configure_c_stdio),
            buffered_stdio: int(o.buffered_stdio),
            optimization_level: int(o.optimization_level),
            verbose: int(o.verbose),
            install_signal_handlers: int(o.install_signal_handlers),
            use_hash_seed: int(o.use_hash_seed),
            hash_seed: base
                .add(o.hash_seed)
                .cast::<std::os::raw::c_ulong>()
                .read() as u64,
            dev_mode: int(o.dev_mode),
            module_search_paths_set: int(o.module_search_paths_set),
        }
    }
}

impl PythonApi for FakePython {
    fn version(&self) -> RuntimeVersion {
        self.version
    }

    unsafe fn pre_config_init_isolated(&self, config: *mut PyPreConfig) {
        *config = PyPreConfig {
            isolated: 1,
            ..PyPreConfig::default()
        };
        self.record(Call::PreConfigInitIsolated);
    }

    unsafe fn pre_initialize(&self, config: *const PyPreConfig) -> PyStatus {
        self.record(Call::PreInitialize {
            utf8_mode: (*config).utf8_mode,
            dev_mode: (*config).dev_mode,
        });
        if self.state.borrow().failures.pre_initialize {
            error_status()
        } else {
            PyStatus::ok()
        }
    }

    unsafe fn config_init_isolated(&self, config: *mut PyConfig) {
        self.state.borrow_mut().config_base = config as usize;
        self.record(Call::ConfigInitIsolated);
    }

    unsafe fn config_set_bytes_string(
        &self,
        _config: *mut PyConfig,
        field: *mut *mut wchar_t,
        value: *const c_char,
    ) -> PyStatus {
        let name = self.field_name(field.cast::<c_void>());
        self.record(Call::SetString {
            field: name,
            value: read_c(value),
        });
        self.set_string_status(name)
    }

    unsafe fn config_set_string(
        &self,
        _config: *mut PyConfig,
        field: *mut *mut wchar_t,
        value: *const wchar_t,
    ) -> PyStatus {
        let name = self.field_name(field.cast::<c_void>());
        self.record(Call::SetString {
            field: name,
            value: read_wide(value),
        });
        self.set_string_status(name)
    }

    unsafe fn config_set_wide_string_list(
        &self,
        _config: *mut PyConfig,
        list: *mut PyWideStringList,
        length: Py_ssize_t,
        items: *mut *mut wchar_t,
    ) -> PyStatus {
        let name = self.field_name(list.cast::<c_void>());
        let values = (0..length as usize)
            .map(|i| read_wide(*items.add(i)))
            .collect();
        self.record(Call::SetWideStringList {
            field: name,
            items: values,
        });
        if self.state.borrow().failures.set_list == Some(name) {
            error_status()
        } else {
            PyStatus::ok()
        }
    }

    unsafe fn config_clear(&self, _config: *mut PyConfig) {
        self.record(Call::ConfigClear);
    }

    unsafe fn initialize_from_config(&self, config: *const PyConfig) -> PyStatus {
        let snapshot = self.take_snapshot(config);
        self.state.borrow_mut().snapshot = Some(snapshot);
        self.record(Call::InitializeFromConfig);
        if self.state.borrow().failures.initialize {
            error_status()
        } else {
            PyStatus::ok()
        }
    }

    unsafe fn status_exception(&self, status: PyStatus) -> bool {
        status._type != 0
    }

    unsafe fn exit_status_exception(&self, _status: PyStatus) {
        self.record(Call::ExitStatusException);
    }

    unsafe fn is_initialized(&self) -> bool {
        self.record(Call::IsInitialized);
        !self.state.borrow().failures.not_initialized_at_exit
    }

    unsafe fn finalize(&self) {
        self.record(Call::Finalize);
    }

    unsafe fn run_simple_string(
        &self,
        command: *const c_char,
        _flags: *mut PyCompilerFlags,
    ) -> c_int {
        self.record(Call::RunSimpleString(read_c(command)));
        0
    }

    unsafe fn decode_locale(&self, arg: *const c_char, _size: *mut usize) -> *mut wchar_t {
        let value = read_c(arg);
        self.record(Call::DecodeLocale(value.clone()));
        if self.state.borrow().failures.decode_locale {
            return std::ptr::null_mut();
        }
        let mut wide: Box<[wchar_t]> = value
            .chars()
            .map(|c| c as wchar_t)
            .chain(std::iter::once(0))
            .collect();
        let ptr = wide.as_mut_ptr();
        self.state.borrow_mut().wide_arena.push(wide);
        ptr
    }

    unsafe fn mem_raw_free(&self, _ptr: *mut c_void) {
        self.record(Call::MemRawFree);
    }

    unsafe fn unicode_decode_fs_default(&self, value: *const c_char) -> *mut PyObject {
        let value = read_c(value);
        self.record(Call::DecodeFsDefault(value.clone()));
        self.new_string(value)
    }

    unsafe fn unicode_from_string(&self, value: *const c_char) -> *mut PyObject {
        let value = read_c(value);
        self.record(Call::FromString(value.clone()));
        self.new_string(value)
    }

    unsafe fn sys_get_object(&self, name: *const c_char) -> *mut PyObject {
        self.record(Call::SysGetObject(read_c(name)));
        self.new_object()
    }

    unsafe fn sys_set_object(&self, name: *const c_char, value: *mut PyObject) -> c_int {
        self.record(Call::SysSetObject {
            name: read_c(name),
            value: self.string_of(value),
        });
        if self.state.borrow().failures.sys_set_object {
            -1
        } else {
            0
        }
    }

    unsafe fn list_append(&self, _list: *mut PyObject, item: *mut PyObject) -> c_int {
        let item = self.string_of(item);
        self.record(Call::ListAppend(item));
        0
    }

    unsafe fn dec_ref(&self, _object: *mut PyObject) {
        self.record(Call::DecRef);
    }

    unsafe fn marshal_read_object_from_string(
        &self,
        data: *const c_char,
        len: Py_ssize_t,
    ) -> *mut PyObject {
        let payload = std::slice::from_raw_parts(data.cast::<u8>(), len as usize).to_vec();
        self.record(Call::Marshal(payload.clone()));
        if self.state.borrow().failures.bad_payload.as_deref() == Some(payload.as_slice()) {
            self.state.borrow_mut().pending_error = true;
            return std::ptr::null_mut();
        }
        let obj = self.new_object();
        self.state.borrow_mut().code.insert(obj as usize, payload);
        obj
    }

    unsafe fn import_exec_code_module(
        &self,
        name: *const c_char,
        code: *mut PyObject,
    ) -> *mut PyObject {
        let name = read_c(name);
        let payload = self
            .state
            .borrow()
            .code
            .get(&(code as usize))
            .cloned()
            .unwrap_or_default();
        self.record(Call::ExecCodeModule {
            name: name.clone(),
            payload,
        });
        if self.state.borrow().failures.exec_module.as_deref() == Some(name.as_str()) {
            self.state.borrow_mut().pending_error = true;
            return std::ptr::null_mut();
        }
        self.new_object()
    }

    unsafe fn import_add_module(&self, name: *const c_char) -> *mut PyObject {
        self.record(Call::AddModule(read_c(name)));
        self.new_object()
    }

    unsafe fn module_get_dict(&self, _module: *mut PyObject) -> *mut PyObject {
        self.record(Call::ModuleGetDict);
        self.new_object()
    }

    unsafe fn object_set_attr_string(
        &self,
        _object: *mut PyObject,
        name: *const c_char,
        _value: *mut PyObject,
    ) -> c_int {
        self.record(Call::SetAttr { name: read_c(name) });
        0
    }

    unsafe fn eval_code(
        &self,
        code: *mut PyObject,
        _globals: *mut PyObject,
        _locals: *mut PyObject,
    ) -> *mut PyObject {
        let payload = self
            .state
            .borrow()
            .code
            .get(&(code as usize))
            .cloned()
            .unwrap_or_default();
        self.record(Call::EvalCode(payload.clone()));
        let raises = match &self.state.borrow().failures.raising_script_prefix {
            Some(prefix) => payload.starts_with(prefix),
            None => false,
        };
        if raises {
            self.state.borrow_mut().pending_error = true;
            return std::ptr::null_mut();
        }
        self.new_object()
    }

    unsafe fn err_occurred(&self) -> *mut PyObject {
        self.record(Call::ErrOccurred);
        if self.state.borrow().pending_error {
            8 as *mut PyObject
        } else {
            std::ptr::null_mut()
        }
    }

    unsafe fn err_print(&self) {
        self.record(Call::ErrPrint);
        self.state.borrow_mut().pending_error = false;
    }

    unsafe fn err_clear(&self) {
        self.record(Call::ErrClear);
        self.state.borrow_mut().pending_error = false;
    }
}

/// Symbol source exporting a chosen subset of names; counts closes.
pub struct FakeLibrary {
    exported: HashSet<&'static str>,
    closed: Rc<Cell<usize>>,
}

impl FakeLibrary {
    pub fn exporting(names: &[&'static str], closed: Rc<Cell<usize>>) -> Self {
        FakeLibrary {
            exported: names.iter().copied().collect(),
            closed,
        }
    }

    pub fn without(missing: &[&str], closed: Rc<Cell<usize>>) -> Self {
        FakeLibrary {
            exported: pyboot_runtime::REQUIRED_SYMBOLS
                .iter()
                .copied()
                .filter(|name| !missing.contains(name))
                .collect(),
            closed,
        }
    }
}

impl SymbolSource for FakeLibrary {
    fn resolve(&self, name: &str) -> Option<NonNull<c_void>> {
        if self.exported.contains(name) {
            Some(NonNull::dangling())
        } else {
            None
        }
    }
}

impl Drop for FakeLibrary {
    fn drop(&mut self) {
        self.closed.set(self.closed.get() + 1);
    }
}

/// Loader handing out a [`FakePython`], with per-file-name failures.
pub struct FakeLoader {
    pub python: FakePython,
    /// File names that fail to open.
    pub unopenable: Vec<String>,
    /// Symbols the library lacks; binding goes through the real binder.
    pub missing_symbols: Vec<&'static str>,
    pub attempts: RefCell<Vec<PathBuf>>,
    pub closed: Rc<Cell<usize>>,
}

impl FakeLoader {
    pub fn new(python: FakePython) -> Self {
        FakeLoader {
            python,
            unopenable: Vec::new(),
            missing_symbols: Vec::new(),
            attempts: RefCell::new(Vec::new()),
            closed: Rc::new(Cell::new(0)),
        }
    }
}

impl PythonLoader for FakeLoader {
    fn load(
        &self,
        path: &Path,
        version: RuntimeVersion,
    ) -> Result<Box<dyn PythonApi>, BindError> {
        self.attempts.borrow_mut().push(path.to_path_buf());
        let file_name = path.file_name().unwrap().to_string_lossy().into_owned();
        if self.unopenable.contains(&file_name) {
            return Err(BindError::Open {
                path: path.to_path_buf(),
                message: "cannot open shared object file: No such file or directory".to_string(),
            });
        }
        if !self.missing_symbols.is_empty() {
            let library = FakeLibrary::without(&self.missing_symbols, self.closed.clone());
            return match BoundLibrary::bind(library, path, version) {
                Err(err) => Err(err),
                Ok(_) => panic!("binding must fail when symbols are missing"),
            };
        }
        Ok(Box::new(self.python.clone()))
    }
}
