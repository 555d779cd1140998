use std::fs::File;
use std::io::{Read, Seek, SeekFrom};
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use flate2::read::ZlibDecoder;

use crate::entry::{EntryKind, TocEntry, TOC_ENTRY_HEADER_LEN};

/// Serialized cookie length: magic, four big-endian `u32`, library name.
pub const COOKIE_LEN: usize = 88;
pub const PYTHON_LIBNAME_LEN: usize = 64;

const SEARCH_CHUNK_LEN: u64 = 8192;
/// Upper bound on the up-front allocation for one extracted entry.
const EXTRACT_CAPACITY_HINT_MAX: usize = 1 << 20;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Cookie {
    pub pkg_length: u32,
    pub toc_offset: u32,
    pub toc_length: u32,
    pub python_version: u32,
    pub python_libname: String,
}

impl Cookie {
    fn parse(raw: &[u8; COOKIE_LEN]) -> Result<Self> {
        let field = |idx: usize| {
            let start = 8 + idx * 4;
            u32::from_be_bytes([raw[start], raw[start + 1], raw[start + 2], raw[start + 3]])
        };
        let libname = c_string_field(&raw[24..24 + PYTHON_LIBNAME_LEN])
            .context("python library name in archive cookie")?;
        Ok(Cookie {
            pkg_length: field(0),
            toc_offset: field(1),
            toc_length: field(2),
            python_version: field(3),
            python_libname: libname,
        })
    }
}

/// An opened package archive with its table of contents loaded in memory.
#[derive(Debug)]
pub struct Archive {
    path: PathBuf,
    pkg_offset: u64,
    cookie: Cookie,
    toc: Vec<TocEntry>,
}

impl Archive {
    /// Locates the trailing cookie in `path` and reads the table of contents.
    pub fn open(path: &Path) -> Result<Self> {
        let mut file =
            File::open(path).with_context(|| format!("open archive: {}", path.display()))?;
        let magic = pyboot_contracts::archive_cookie_magic();
        let cookie_pos = find_magic(&mut file, &magic)
            .with_context(|| format!("scan for archive cookie: {}", path.display()))?
            .with_context(|| format!("no archive cookie found in {}", path.display()))?;

        let mut raw = [0u8; COOKIE_LEN];
        file.seek(SeekFrom::Start(cookie_pos))?;
        file.read_exact(&mut raw)
            .with_context(|| format!("read archive cookie at offset {cookie_pos}"))?;
        let cookie = Cookie::parse(&raw)?;

        let cookie_end = cookie_pos + COOKIE_LEN as u64;
        let pkg_offset = cookie_end
            .checked_sub(u64::from(cookie.pkg_length))
            .with_context(|| {
                format!(
                    "archive length {} exceeds cookie end offset {cookie_end}",
                    cookie.pkg_length
                )
            })?;
        let toc_end = u64::from(cookie.toc_offset) + u64::from(cookie.toc_length);
        if toc_end > u64::from(cookie.pkg_length) {
            anyhow::bail!(
                "table of contents ({} bytes at {}) extends past the archive ({} bytes)",
                cookie.toc_length,
                cookie.toc_offset,
                cookie.pkg_length
            );
        }

        let mut toc_raw = vec![0u8; cookie.toc_length as usize];
        file.seek(SeekFrom::Start(pkg_offset + u64::from(cookie.toc_offset)))?;
        file.read_exact(&mut toc_raw)
            .context("read archive table of contents")?;
        let toc = parse_toc(&toc_raw)?;

        Ok(Archive {
            path: path.to_path_buf(),
            pkg_offset,
            cookie,
            toc,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Absolute position of the package inside the file.
    pub fn pkg_offset(&self) -> u64 {
        self.pkg_offset
    }

    pub fn cookie(&self) -> &Cookie {
        &self.cookie
    }

    pub fn python_version(&self) -> u32 {
        self.cookie.python_version
    }

    pub fn python_libname(&self) -> &str {
        &self.cookie.python_libname
    }

    /// Entries in physical order.
    pub fn entries(&self) -> std::slice::Iter<'_, TocEntry> {
        self.toc.iter()
    }

    pub fn entries_of(&self, kind: EntryKind) -> impl Iterator<Item = &TocEntry> + '_ {
        self.toc.iter().filter(move |entry| entry.kind == kind)
    }

    pub fn find(&self, name: &str) -> Option<&TocEntry> {
        self.toc.iter().find(|entry| entry.name == name)
    }

    /// True when the package carries files that need unpacking before use.
    pub fn is_onefile(&self) -> bool {
        self.toc.iter().any(|entry| entry.kind.is_extractable())
    }

    /// Absolute position of an entry's payload inside the file.
    pub fn absolute_offset(&self, entry: &TocEntry) -> u64 {
        self.pkg_offset + u64::from(entry.offset)
    }

    /// Reads and, if needed, inflates the payload of `entry`.
    pub fn extract(&self, entry: &TocEntry) -> Result<Vec<u8>> {
        let end = u64::from(entry.offset) + u64::from(entry.length);
        if end > u64::from(self.cookie.toc_offset) {
            anyhow::bail!(
                "failed to extract {}: {} bytes at offset {} extend past the package data",
                entry.name,
                entry.length,
                entry.offset
            );
        }

        let mut file = File::open(&self.path)
            .with_context(|| format!("open archive: {}", self.path.display()))?;
        file.seek(SeekFrom::Start(self.absolute_offset(entry)))?;
        let stored = (&mut file).take(u64::from(entry.length));
        // One byte past the declared length is enough to detect a mismatch.
        let limit = u64::from(entry.uncompressed_length) + 1;

        let hint = (entry.uncompressed_length as usize).min(EXTRACT_CAPACITY_HINT_MAX);
        let mut data = Vec::with_capacity(hint);
        if entry.compressed {
            ZlibDecoder::new(stored)
                .take(limit)
                .read_to_end(&mut data)
                .with_context(|| format!("failed to extract {}: decompression failed", entry.name))?;
        } else {
            stored
                .take(limit)
                .read_to_end(&mut data)
                .with_context(|| format!("failed to extract {}: read failed", entry.name))?;
        }

        if data.len() != entry.uncompressed_length as usize {
            anyhow::bail!(
                "failed to extract {}: expected {} bytes, got {}",
                entry.name,
                entry.uncompressed_length,
                data.len()
            );
        }
        Ok(data)
    }

    /// Extracts `entry` into `dest`, creating parent directories.
    pub fn extract_to_file(&self, entry: &TocEntry, dest: &Path) -> Result<()> {
        let data = self.extract(entry)?;
        if let Some(parent) = dest.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)
                    .with_context(|| format!("create dir: {}", parent.display()))?;
            }
        }
        std::fs::write(dest, data).with_context(|| format!("write: {}", dest.display()))
    }
}

/// Whether the file at `path` contains `magic` anywhere.
pub fn has_signature(path: &Path, magic: &[u8]) -> Result<bool> {
    let mut file = File::open(path).with_context(|| format!("open: {}", path.display()))?;
    Ok(find_magic(&mut file, magic)?.is_some())
}

/// Back-to-front scan for the last occurrence of `magic`.
///
/// Chunks overlap by `magic.len() - 1` bytes so a pattern straddling a chunk
/// boundary is still found.
pub fn find_magic<R: Read + Seek>(reader: &mut R, magic: &[u8]) -> std::io::Result<Option<u64>> {
    let magic_len = magic.len() as u64;
    let mut end = reader.seek(SeekFrom::End(0))?;
    if magic.is_empty() || end < magic_len {
        return Ok(None);
    }

    let mut buf = vec![0u8; SEARCH_CHUNK_LEN as usize];
    loop {
        let start = end.saturating_sub(SEARCH_CHUNK_LEN);
        let chunk_len = (end - start) as usize;
        if (chunk_len as u64) < magic_len {
            return Ok(None);
        }
        reader.seek(SeekFrom::Start(start))?;
        let chunk = &mut buf[..chunk_len];
        reader.read_exact(chunk)?;

        if let Some(pos) = chunk.windows(magic.len()).rposition(|w| w == magic) {
            return Ok(Some(start + pos as u64));
        }
        if start == 0 {
            return Ok(None);
        }
        end = start + magic_len - 1;
    }
}

fn parse_toc(raw: &[u8]) -> Result<Vec<TocEntry>> {
    let mut entries = Vec::new();
    let mut pos = 0usize;
    while pos < raw.len() {
        let rest = &raw[pos..];
        if rest.len() < TOC_ENTRY_HEADER_LEN {
            anyhow::bail!("truncated TOC entry at offset {pos}");
        }
        let word = |idx: usize| {
            let s = idx * 4;
            u32::from_be_bytes([rest[s], rest[s + 1], rest[s + 2], rest[s + 3]])
        };
        let entry_length = word(0) as usize;
        if entry_length < TOC_ENTRY_HEADER_LEN || entry_length > rest.len() {
            anyhow::bail!("malformed TOC entry at offset {pos}: entry length {entry_length}");
        }
        let name = c_string_field(&rest[TOC_ENTRY_HEADER_LEN..entry_length])
            .with_context(|| format!("name of TOC entry at offset {pos}"))?;
        entries.push(TocEntry {
            offset: word(1),
            length: word(2),
            uncompressed_length: word(3),
            compressed: rest[16] == 1,
            kind: EntryKind::from_code(rest[17]),
            name,
        });
        pos += entry_length;
    }
    Ok(entries)
}

fn c_string_field(raw: &[u8]) -> Result<String> {
    let end = raw.iter().position(|b| *b == 0).unwrap_or(raw.len());
    String::from_utf8(raw[..end].to_vec()).context("invalid UTF-8")
}
