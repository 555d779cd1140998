use std::io::Write;
use std::path::Path;

use anyhow::{Context, Result};
use flate2::write::ZlibEncoder;
use flate2::Compression;

use crate::entry::{EntryKind, TocEntry, TOC_ENTRY_HEADER_LEN};
use crate::reader::{COOKIE_LEN, PYTHON_LIBNAME_LEN};

struct PendingEntry {
    kind: EntryKind,
    name: String,
    stored: Vec<u8>,
    uncompressed_length: u32,
    compressed: bool,
}

/// Assembles a package archive: payloads, then the TOC, then the cookie.
pub struct ArchiveWriter {
    python_version: u32,
    python_libname: String,
    entries: Vec<PendingEntry>,
}

impl ArchiveWriter {
    pub fn new(python_version: u32, python_libname: &str) -> Self {
        ArchiveWriter {
            python_version,
            python_libname: python_libname.to_string(),
            entries: Vec::new(),
        }
    }

    /// Adds an uncompressed entry.
    pub fn add(&mut self, kind: EntryKind, name: &str, data: &[u8]) -> Result<&mut Self> {
        self.push(kind, name, data.to_vec(), data.len(), false)
    }

    /// Adds a zlib-compressed entry.
    pub fn add_compressed(&mut self, kind: EntryKind, name: &str, data: &[u8]) -> Result<&mut Self> {
        let mut enc = ZlibEncoder::new(Vec::new(), Compression::default());
        enc.write_all(data).context("compress entry")?;
        let stored = enc.finish().context("compress entry")?;
        self.push(kind, name, stored, data.len(), true)
    }

    /// Adds a runtime option entry; options carry no payload.
    pub fn add_option(&mut self, option: &str) -> Result<&mut Self> {
        self.add(EntryKind::RuntimeOption, option, &[])
    }

    /// Adds an entry whose stored bytes are taken as-is, with a declared
    /// uncompressed length that need not match.
    pub fn add_raw(
        &mut self,
        kind: EntryKind,
        name: &str,
        stored: Vec<u8>,
        uncompressed_length: usize,
        compressed: bool,
    ) -> Result<&mut Self> {
        self.push(kind, name, stored, uncompressed_length, compressed)
    }

    fn push(
        &mut self,
        kind: EntryKind,
        name: &str,
        stored: Vec<u8>,
        uncompressed_length: usize,
        compressed: bool,
    ) -> Result<&mut Self> {
        if name.as_bytes().contains(&0) {
            anyhow::bail!("entry name contains NUL: {name:?}");
        }
        let uncompressed_length = u32::try_from(uncompressed_length)
            .with_context(|| format!("entry too large: {name}"))?;
        self.entries.push(PendingEntry {
            kind,
            name: name.to_string(),
            stored,
            uncompressed_length,
            compressed,
        });
        Ok(self)
    }

    /// Serializes the package.
    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        if self.python_libname.len() >= PYTHON_LIBNAME_LEN {
            anyhow::bail!(
                "python library name longer than {} bytes: {}",
                PYTHON_LIBNAME_LEN - 1,
                self.python_libname
            );
        }

        let mut out = Vec::new();
        let mut offsets = Vec::with_capacity(self.entries.len());
        for entry in &self.entries {
            offsets.push(u32::try_from(out.len()).context("archive exceeds 4 GiB")?);
            out.extend_from_slice(&entry.stored);
        }

        let toc_offset = u32::try_from(out.len()).context("archive exceeds 4 GiB")?;
        for (entry, offset) in self.entries.iter().zip(offsets) {
            let entry_len = TocEntry::encoded_len(&entry.name);
            let start = out.len();
            out.extend_from_slice(&(entry_len as u32).to_be_bytes());
            out.extend_from_slice(&offset.to_be_bytes());
            out.extend_from_slice(&(entry.stored.len() as u32).to_be_bytes());
            out.extend_from_slice(&entry.uncompressed_length.to_be_bytes());
            out.push(u8::from(entry.compressed));
            out.push(entry.kind.code());
            debug_assert_eq!(out.len() - start, TOC_ENTRY_HEADER_LEN);
            out.extend_from_slice(entry.name.as_bytes());
            out.resize(start + entry_len, 0);
        }
        let toc_length = u32::try_from(out.len()).context("archive exceeds 4 GiB")? - toc_offset;

        let pkg_length =
            u32::try_from(out.len() + COOKIE_LEN).context("archive exceeds 4 GiB")?;
        out.extend_from_slice(&pyboot_contracts::archive_cookie_magic());
        out.extend_from_slice(&pkg_length.to_be_bytes());
        out.extend_from_slice(&toc_offset.to_be_bytes());
        out.extend_from_slice(&toc_length.to_be_bytes());
        out.extend_from_slice(&self.python_version.to_be_bytes());
        let mut libname = [0u8; PYTHON_LIBNAME_LEN];
        libname[..self.python_libname.len()].copy_from_slice(self.python_libname.as_bytes());
        out.extend_from_slice(&libname);
        Ok(out)
    }

    /// Writes the package as a standalone (sideload) file.
    pub fn write_to(&self, path: &Path) -> Result<()> {
        std::fs::write(path, self.to_bytes()?)
            .with_context(|| format!("write archive: {}", path.display()))
    }

    /// Appends the package to an existing executable.
    pub fn append_to(&self, path: &Path) -> Result<()> {
        let bytes = self.to_bytes()?;
        let mut file = std::fs::OpenOptions::new()
            .append(true)
            .open(path)
            .with_context(|| format!("open for append: {}", path.display()))?;
        file.write_all(&bytes)
            .with_context(|| format!("append archive: {}", path.display()))
    }
}
