use std::fmt;

/// Fixed part of a serialized TOC entry, ahead of the name.
pub const TOC_ENTRY_HEADER_LEN: usize = 18;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EntryKind {
    /// Shared library (`b`).
    Binary,
    /// Reference into another package of a multi-package build (`d`).
    Dependency,
    /// Compressed module collection streamed by the runtime importer (`z`).
    Pyz,
    /// Zip file (`Z`).
    ZipFile,
    /// Compiled package `__init__` (`M`).
    Package,
    /// Compiled module (`m`).
    Module,
    /// Compiled entry script (`s`).
    Script,
    /// Data file (`x`).
    Data,
    /// Launcher or interpreter option; the payload is empty (`o`).
    RuntimeOption,
    /// Splash screen resources (`l`).
    Splash,
    /// Symbolic link (`n`).
    Symlink,
    Other(u8),
}

impl EntryKind {
    pub fn from_code(code: u8) -> Self {
        match code {
            b'b' => EntryKind::Binary,
            b'd' => EntryKind::Dependency,
            b'z' => EntryKind::Pyz,
            b'Z' => EntryKind::ZipFile,
            b'M' => EntryKind::Package,
            b'm' => EntryKind::Module,
            b's' => EntryKind::Script,
            b'x' => EntryKind::Data,
            b'o' => EntryKind::RuntimeOption,
            b'l' => EntryKind::Splash,
            b'n' => EntryKind::Symlink,
            other => EntryKind::Other(other),
        }
    }

    pub fn code(self) -> u8 {
        match self {
            EntryKind::Binary => b'b',
            EntryKind::Dependency => b'd',
            EntryKind::Pyz => b'z',
            EntryKind::ZipFile => b'Z',
            EntryKind::Package => b'M',
            EntryKind::Module => b'm',
            EntryKind::Script => b's',
            EntryKind::Data => b'x',
            EntryKind::RuntimeOption => b'o',
            EntryKind::Splash => b'l',
            EntryKind::Symlink => b'n',
            EntryKind::Other(code) => code,
        }
    }

    /// Entries that must be unpacked to disk before the program can run.
    pub fn is_extractable(self) -> bool {
        matches!(
            self,
            EntryKind::Binary
                | EntryKind::Data
                | EntryKind::ZipFile
                | EntryKind::Symlink
                | EntryKind::Dependency
        )
    }

    /// Compiled modules executed eagerly during bootstrap.
    pub fn is_bootstrap_module(self) -> bool {
        matches!(self, EntryKind::Module | EntryKind::Package)
    }
}

impl fmt::Display for EntryKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let code = self.code();
        if code.is_ascii_graphic() {
            write!(f, "{}", code as char)
        } else {
            write!(f, "0x{code:02x}")
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TocEntry {
    /// Payload position relative to the start of the package.
    pub offset: u32,
    /// Stored payload length.
    pub length: u32,
    pub uncompressed_length: u32,
    pub compressed: bool,
    pub kind: EntryKind,
    pub name: String,
}

impl TocEntry {
    /// Serialized length, name included and padded to 16 bytes.
    pub fn encoded_len(name: &str) -> usize {
        let raw = TOC_ENTRY_HEADER_LEN + name.len() + 1;
        raw.div_ceil(16) * 16
    }
}
