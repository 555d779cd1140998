use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use pyboot_abi::{AbiFlags, ConfigAbi, RuntimeVersion};
use pyboot_archive::{Archive, EntryKind, TocEntry};
use serde::Serialize;

#[derive(Parser, Debug)]
#[command(name = "pyboot-archive")]
#[command(about = "Inspect and unpack launcher package archives.", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Print the archive cookie as JSON.
    Info { archive: PathBuf },
    /// List the table of contents.
    List {
        archive: PathBuf,
        #[arg(long, default_value_t = false)]
        json: bool,
    },
    /// Write one entry's decompressed payload to a file.
    Extract {
        archive: PathBuf,
        name: String,
        #[arg(long)]
        out: PathBuf,
    },
}

#[derive(Debug, Serialize)]
struct ArchiveInfo {
    path: String,
    pkg_offset: u64,
    pkg_length: u32,
    toc_offset: u32,
    toc_length: u32,
    python_version: u32,
    python_release: String,
    python_libname: String,
    /// Configuration layout the launcher would use; `None` when unsupported.
    config_layout: Option<String>,
    entries: usize,
    onefile: bool,
}

#[derive(Debug, Serialize)]
struct EntryReport {
    name: String,
    kind: String,
    offset: u32,
    length: u32,
    uncompressed_length: u32,
    compressed: bool,
    /// `sys.path` location of a module collection.
    #[serde(skip_serializing_if = "Option::is_none")]
    location: Option<String>,
}

fn main() -> Result<()> {
    try_main().map_err(|err| {
        eprintln!("{err:#}");
        err
    })
}

fn try_main() -> Result<()> {
    let cli = Cli::parse();
    match cli.command {
        Command::Info { archive } => {
            let archive = Archive::open(&archive)?;
            println!("{}", serde_json::to_string_pretty(&archive_info(&archive))?);
            Ok(())
        }
        Command::List { archive, json } => {
            let archive = Archive::open(&archive)?;
            let entries = entry_reports(&archive);
            if json {
                println!("{}", serde_json::to_string_pretty(&entries)?);
            } else {
                for entry in &entries {
                    println!("{}", format_entry_line(entry));
                }
            }
            Ok(())
        }
        Command::Extract { archive, name, out } => run_extract(&archive, &name, &out),
    }
}

fn archive_info(archive: &Archive) -> ArchiveInfo {
    let cookie = archive.cookie();
    let version = RuntimeVersion::from_tag(cookie.python_version);
    ArchiveInfo {
        path: archive.path().display().to_string(),
        pkg_offset: archive.pkg_offset(),
        pkg_length: cookie.pkg_length,
        toc_offset: cookie.toc_offset,
        toc_length: cookie.toc_length,
        python_version: cookie.python_version,
        python_release: version.to_string(),
        python_libname: cookie.python_libname.clone(),
        config_layout: ConfigAbi::select(version, AbiFlags::default())
            .ok()
            .map(|abi| abi.to_string()),
        entries: archive.entries().len(),
        onefile: archive.is_onefile(),
    }
}

fn entry_reports(archive: &Archive) -> Vec<EntryReport> {
    archive
        .entries()
        .map(|entry| entry_report(archive, entry))
        .collect()
}

fn entry_report(archive: &Archive, entry: &TocEntry) -> EntryReport {
    let location = (entry.kind == EntryKind::Pyz).then(|| {
        pyboot_contracts::collection_location(
            &archive.path().to_string_lossy(),
            archive.absolute_offset(entry),
        )
    });
    EntryReport {
        name: entry.name.clone(),
        kind: entry.kind.to_string(),
        offset: entry.offset,
        length: entry.length,
        uncompressed_length: entry.uncompressed_length,
        compressed: entry.compressed,
        location,
    }
}

fn format_entry_line(entry: &EntryReport) -> String {
    format!(
        "{} {} {:>10} {:>10} {:>10} {}",
        entry.kind,
        if entry.compressed { 'z' } else { '-' },
        entry.offset,
        entry.length,
        entry.uncompressed_length,
        entry.name
    )
}

fn run_extract(archive_path: &Path, name: &str, out: &Path) -> Result<()> {
    let archive = Archive::open(archive_path)?;
    let entry = archive
        .find(name)
        .with_context(|| format!("no entry named {name:?} in {}", archive_path.display()))?;
    archive.extract_to_file(entry, out)?;
    eprintln!("wrote {} ({} bytes)", out.display(), entry.uncompressed_length);
    Ok(())
}
