//! Reader and writer for the package archive appended to a launcher.
//!
//! The archive ends with a fixed-size cookie that locates a table of contents.
//! Each TOC entry names one payload blob stored earlier in the package, either
//! raw or zlib-compressed. Entries are exposed in physical order, which is also
//! the order bootstrap modules have to be imported in.

mod entry;
mod reader;
mod writer;

pub use entry::{EntryKind, TocEntry, TOC_ENTRY_HEADER_LEN};
pub use reader::{find_magic, has_signature, Archive, Cookie, COOKIE_LEN, PYTHON_LIBNAME_LEN};
pub use writer::ArchiveWriter;
