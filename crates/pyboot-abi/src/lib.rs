//! Byte-exact mirrors of the CPython initialization records.
//!
//! The launcher is never compiled against CPython headers. Every supported
//! release gets its own `#[repr(C)]` transcription of `PyConfig`, and the
//! records that did not change across releases (`PyStatus`, `PyPreConfig`,
//! `PyWideStringList`) are shared. Callers select a layout with
//! [`ConfigAbi::select`] from the version tag stored in the package archive;
//! unknown tags are rejected rather than mapped to a neighbouring release.
//!
//! Adding a release means adding one `vNNN` module and one [`ConfigAbi`]
//! variant.

#![allow(non_camel_case_types)]

use std::fmt;
use std::os::raw::{c_char, c_int};

use libc::wchar_t;

pub mod v310;
pub mod v311;
pub mod v312;
pub mod v313;
pub mod v314;
pub mod v38;
pub mod v39;

pub type Py_ssize_t = isize;

/// Result of the fallible initialization API.
#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct PyStatus {
    pub _type: c_int,
    pub func: *const c_char,
    pub err_msg: *const c_char,
    pub exitcode: c_int,
}

impl PyStatus {
    pub const fn ok() -> Self {
        PyStatus {
            _type: 0,
            func: std::ptr::null(),
            err_msg: std::ptr::null(),
            exitcode: 0,
        }
    }
}

#[repr(C)]
#[derive(Debug)]
pub struct PyWideStringList {
    pub length: Py_ssize_t,
    pub items: *mut *mut wchar_t,
}

/// Pre-initialization record. Identical from 3.8 through 3.14.
#[repr(C)]
#[derive(Debug, Default, Clone, Copy)]
pub struct PyPreConfig {
    pub _config_init: c_int,
    pub parse_argv: c_int,
    pub isolated: c_int,
    pub use_environment: c_int,
    pub configure_locale: c_int,
    pub coerce_c_locale: c_int,
    pub coerce_c_locale_warn: c_int,
    #[cfg(windows)]
    pub legacy_windows_fs_encoding: c_int,
    pub utf8_mode: c_int,
    pub dev_mode: c_int,
    pub allocator: c_int,
}

/// Release tag as stored by the archive builder: `major * 100 + minor`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct RuntimeVersion(u32);

impl RuntimeVersion {
    pub const fn from_tag(tag: u32) -> Self {
        RuntimeVersion(tag)
    }

    pub const fn new(major: u32, minor: u32) -> Self {
        RuntimeVersion(major * 100 + minor)
    }

    pub const fn tag(self) -> u32 {
        self.0
    }

    pub const fn major(self) -> u32 {
        self.0 / 100
    }

    pub const fn minor(self) -> u32 {
        self.0 % 100
    }
}

impl fmt::Display for RuntimeVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.major(), self.minor())
    }
}

/// Build flags of the runtime library that change the `PyConfig` layout.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct AbiFlags {
    pub gil_disabled: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LayoutError {
    UnsupportedVersion(RuntimeVersion),
    FreeThreadingUnavailable(RuntimeVersion),
}

impl fmt::Display for LayoutError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LayoutError::UnsupportedVersion(version) => {
                write!(
                    f,
                    "unsupported python runtime version {version} (tag {}); supported: ",
                    version.tag()
                )?;
                for (idx, abi) in ConfigAbi::ALL
                    .iter()
                    .filter(|abi| !abi.layout().caps.free_threaded)
                    .enumerate()
                {
                    if idx > 0 {
                        f.write_str(", ")?;
                    }
                    write!(f, "{}", abi.version())?;
                }
                Ok(())
            }
            LayoutError::FreeThreadingUnavailable(version) => write!(
                f,
                "python runtime version {version} has no free-threaded (Py_GIL_DISABLED) build"
            ),
        }
    }
}

impl std::error::Error for LayoutError {}

/// Offsets of the `PyConfig` fields the launcher reads or writes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConfigOffsets {
    pub dev_mode: usize,
    pub install_signal_handlers: usize,
    pub use_hash_seed: usize,
    pub hash_seed: usize,
    pub parse_argv: usize,
    pub argv: usize,
    pub xoptions: usize,
    pub warnoptions: usize,
    pub site_import: usize,
    pub optimization_level: usize,
    pub write_bytecode: usize,
    pub verbose: usize,
    pub configure_c_stdio: usize,
    pub buffered_stdio: usize,
    pub program_name: usize,
    pub home: usize,
    pub module_search_paths_set: usize,
    pub module_search_paths: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LayoutCaps {
    /// Layout of a `Py_GIL_DISABLED` build (carries `enable_gil`).
    pub free_threaded: bool,
}

/// Size, alignment and field map of one release's `PyConfig`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConfigLayout {
    pub size: usize,
    pub align: usize,
    pub offsets: ConfigOffsets,
    pub caps: LayoutCaps,
}

macro_rules! config_layout {
    ($ty:ty, free_threaded = $free_threaded:expr) => {
        ConfigLayout {
            size: std::mem::size_of::<$ty>(),
            align: std::mem::align_of::<$ty>(),
            offsets: ConfigOffsets {
                dev_mode: std::mem::offset_of!($ty, dev_mode),
                install_signal_handlers: std::mem::offset_of!($ty, install_signal_handlers),
                use_hash_seed: std::mem::offset_of!($ty, use_hash_seed),
                hash_seed: std::mem::offset_of!($ty, hash_seed),
                parse_argv: std::mem::offset_of!($ty, parse_argv),
                argv: std::mem::offset_of!($ty, argv),
                xoptions: std::mem::offset_of!($ty, xoptions),
                warnoptions: std::mem::offset_of!($ty, warnoptions),
                site_import: std::mem::offset_of!($ty, site_import),
                optimization_level: std::mem::offset_of!($ty, optimization_level),
                write_bytecode: std::mem::offset_of!($ty, write_bytecode),
                verbose: std::mem::offset_of!($ty, verbose),
                configure_c_stdio: std::mem::offset_of!($ty, configure_c_stdio),
                buffered_stdio: std::mem::offset_of!($ty, buffered_stdio),
                program_name: std::mem::offset_of!($ty, program_name),
                home: std::mem::offset_of!($ty, home),
                module_search_paths_set: std::mem::offset_of!($ty, module_search_paths_set),
                module_search_paths: std::mem::offset_of!($ty, module_search_paths),
            },
            caps: LayoutCaps {
                free_threaded: $free_threaded,
            },
        }
    };
}

const LAYOUT_V38: ConfigLayout = config_layout!(v38::PyConfig, free_threaded = false);
const LAYOUT_V39: ConfigLayout = config_layout!(v39::PyConfig, free_threaded = false);
const LAYOUT_V310: ConfigLayout = config_layout!(v310::PyConfig, free_threaded = false);
const LAYOUT_V311: ConfigLayout = config_layout!(v311::PyConfig, free_threaded = false);
const LAYOUT_V312: ConfigLayout = config_layout!(v312::PyConfig, free_threaded = false);
const LAYOUT_V313: ConfigLayout = config_layout!(v313::PyConfig, free_threaded = false);
const LAYOUT_V313_GIL_DISABLED: ConfigLayout =
    config_layout!(v313::PyConfigGilDisabled, free_threaded = true);
const LAYOUT_V314: ConfigLayout = config_layout!(v314::PyConfig, free_threaded = false);
const LAYOUT_V314_GIL_DISABLED: ConfigLayout =
    config_layout!(v314::PyConfigGilDisabled, free_threaded = true);

/// One variant per supported `PyConfig` record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConfigAbi {
    V38,
    V39,
    V310,
    V311,
    V312,
    V313,
    V313GilDisabled,
    V314,
    V314GilDisabled,
}

impl ConfigAbi {
    pub const ALL: [ConfigAbi; 9] = [
        ConfigAbi::V38,
        ConfigAbi::V39,
        ConfigAbi::V310,
        ConfigAbi::V311,
        ConfigAbi::V312,
        ConfigAbi::V313,
        ConfigAbi::V313GilDisabled,
        ConfigAbi::V314,
        ConfigAbi::V314GilDisabled,
    ];

    pub fn select(version: RuntimeVersion, flags: AbiFlags) -> Result<Self, LayoutError> {
        let abi = match (version.tag(), flags.gil_disabled) {
            (308, false) => ConfigAbi::V38,
            (309, false) => ConfigAbi::V39,
            (310, false) => ConfigAbi::V310,
            (311, false) => ConfigAbi::V311,
            (312, false) => ConfigAbi::V312,
            (313, false) => ConfigAbi::V313,
            (313, true) => ConfigAbi::V313GilDisabled,
            (314, false) => ConfigAbi::V314,
            (314, true) => ConfigAbi::V314GilDisabled,
            (308..=312, true) => return Err(LayoutError::FreeThreadingUnavailable(version)),
            _ => return Err(LayoutError::UnsupportedVersion(version)),
        };
        Ok(abi)
    }

    pub fn version(self) -> RuntimeVersion {
        match self {
            ConfigAbi::V38 => RuntimeVersion::new(3, 8),
            ConfigAbi::V39 => RuntimeVersion::new(3, 9),
            ConfigAbi::V310 => RuntimeVersion::new(3, 10),
            ConfigAbi::V311 => RuntimeVersion::new(3, 11),
            ConfigAbi::V312 => RuntimeVersion::new(3, 12),
            ConfigAbi::V313 | ConfigAbi::V313GilDisabled => RuntimeVersion::new(3, 13),
            ConfigAbi::V314 | ConfigAbi::V314GilDisabled => RuntimeVersion::new(3, 14),
        }
    }

    pub fn layout(self) -> &'static ConfigLayout {
        match self {
            ConfigAbi::V38 => &LAYOUT_V38,
            ConfigAbi::V39 => &LAYOUT_V39,
            ConfigAbi::V310 => &LAYOUT_V310,
            ConfigAbi::V311 => &LAYOUT_V311,
            ConfigAbi::V312 => &LAYOUT_V312,
            ConfigAbi::V313 => &LAYOUT_V313,
            ConfigAbi::V313GilDisabled => &LAYOUT_V313_GIL_DISABLED,
            ConfigAbi::V314 => &LAYOUT_V314,
            ConfigAbi::V314GilDisabled => &LAYOUT_V314_GIL_DISABLED,
        }
    }
}

impl fmt::Display for ConfigAbi {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PyConfig {}", self.version())?;
        if self.layout().caps.free_threaded {
            f.write_str(" (free-threaded)")?;
        }
        Ok(())
    }
}
