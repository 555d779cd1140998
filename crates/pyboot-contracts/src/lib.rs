//! Shared protocol identifiers.
//!
//! These constants are the single source of truth for byte signatures, option
//! names and runtime attribute names that the archive writer, the launcher and
//! the runtime-side import hooks must agree on.

const MAGIC_BASE: [u8; 8] = *b"MEI\x00\x0b\x0a\x0b\x0e";
const MAGIC_MARKER_INDEX: usize = 3;
const COOKIE_MARKER: u8 = 0x0c;
const SIDELOAD_MARKER: u8 = 0x0d;

/// Trailing cookie signature of an embedded package archive.
///
/// Built at run time so the pattern never appears verbatim in the launcher
/// image, which is itself scanned for it.
pub fn archive_cookie_magic() -> [u8; 8] {
    with_marker(COOKIE_MARKER)
}

/// Signature stamped into an executable whose package lives in a sideload file.
pub fn sideload_magic() -> [u8; 8] {
    with_marker(SIDELOAD_MARKER)
}

fn with_marker(marker: u8) -> [u8; 8] {
    let mut magic = MAGIC_BASE;
    magic[MAGIC_MARKER_INDEX] = std::hint::black_box(marker);
    magic
}

/// Extension of the sideload package file next to the executable.
pub const SIDELOAD_EXTENSION: &str = "pkg";

pub const ENV_DEBUG: &str = "PYBOOT_DEBUG";

pub const OPT_CONTENTS_DIRECTORY: &str = "pyi-contents-directory";
pub const OPT_RUNTIME_TMPDIR: &str = "pyi-runtime-tmpdir";
pub const OPT_PYTHON_FLAG: &str = "pyi-python-flag";
pub const OPT_IGNORE_SIGNALS: &str = "pyi-bootloader-ignore-signals";
pub const PYTHON_FLAG_GIL_DISABLED: &str = "Py_GIL_DISABLED";

/// `sys` attribute holding the application home directory.
pub const SYS_HOME_ATTR: &str = "_MEIPASS";

/// `__main__` attribute receiving the code object of the running entry script.
pub const MAIN_CODE_ATTR: &str = "_pyi_main_co";

/// Base library collection searched before the home directory.
pub const BASE_LIBRARY_NAME: &str = "base_library.zip";

/// Separates the archive path from the collection offset in a location string.
pub const COLLECTION_OFFSET_SEPARATOR: char = '?';

/// Location string handed to the runtime-side collection importer.
///
/// The importer splits on the last separator and parses the decimal byte
/// offset of the collection inside the archive file.
pub fn collection_location(archive_path: &str, absolute_offset: u64) -> String {
    format!("{archive_path}{COLLECTION_OFFSET_SEPARATOR}{absolute_offset}")
}

/// Flushes stdio from inside the runtime before finalization.
pub const FLUSH_STDOUT_COMMAND: &str = "import sys; sys.stdout.flush(); \
(sys.__stdout__.flush if sys.__stdout__ is not sys.stdout else (lambda: None))()";
pub const FLUSH_STDERR_COMMAND: &str = "import sys; sys.stderr.flush(); \
(sys.__stderr__.flush if sys.__stderr__ is not sys.stderr else (lambda: None))()";
