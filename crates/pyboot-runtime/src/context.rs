use std::ffi::OsString;
use std::path::{Component, Path, PathBuf};

use anyhow::{Context, Result};
use pyboot_archive::{has_signature, Archive};
use pyboot_contracts::SIDELOAD_EXTENSION;

use crate::api::PythonApi;
use crate::options::{read_options, BootOptions, RuntimeOptions};

/// Process-wide launcher state.
///
/// Built once from the executable and its archive. The bound runtime library
/// is attached by the launch sequence and released first on teardown, before
/// the archive.
pub struct HostContext {
    python: Option<Box<dyn PythonApi>>,
    archive: Archive,
    executable: PathBuf,
    home_dir: PathBuf,
    argv: Vec<OsString>,
    runtime_options: RuntimeOptions,
    boot_options: BootOptions,
}

impl HostContext {
    pub fn new(executable: PathBuf, archive: Archive, argv: Vec<OsString>) -> Result<Self> {
        let (runtime_options, boot_options) = read_options(&archive)?;
        let home_dir =
            application_home_dir(&executable, boot_options.contents_directory.as_deref())?;
        log::debug!("executable: {}", executable.display());
        log::debug!("archive: {}", archive.path().display());
        log::debug!("application home: {}", home_dir.display());
        Ok(HostContext {
            python: None,
            archive,
            executable,
            home_dir,
            argv,
            runtime_options,
            boot_options,
        })
    }

    /// Context for the running executable and its own argument vector.
    pub fn from_current_process() -> Result<Self> {
        let executable = std::env::current_exe().context("current_exe")?;
        let archive = resolve_archive(&executable)?;
        Self::new(executable, archive, std::env::args_os().collect())
    }

    pub fn archive(&self) -> &Archive {
        &self.archive
    }

    pub fn executable(&self) -> &Path {
        &self.executable
    }

    pub fn home_dir(&self) -> &Path {
        &self.home_dir
    }

    pub fn argv(&self) -> &[OsString] {
        &self.argv
    }

    pub fn runtime_options(&self) -> &RuntimeOptions {
        &self.runtime_options
    }

    pub fn boot_options(&self) -> &BootOptions {
        &self.boot_options
    }

    pub fn python(&self) -> Option<&dyn PythonApi> {
        self.python.as_deref()
    }

    pub fn attach_python(&mut self, python: Box<dyn PythonApi>) {
        self.unload_python();
        self.python = Some(python);
    }

    /// Drops the bound runtime library, if any. Safe to call repeatedly.
    pub fn unload_python(&mut self) {
        if let Some(python) = self.python.take() {
            log::debug!("releasing python {}", python.version());
            drop(python);
        }
    }
}

impl Drop for HostContext {
    fn drop(&mut self) {
        self.unload_python();
    }
}

/// Opens the archive embedded in `executable`, or its sideload file when the
/// executable is stamped with the sideload signature.
pub fn resolve_archive(executable: &Path) -> Result<Archive> {
    log::debug!("trying executable-embedded archive");
    let embedded_err = match Archive::open(executable) {
        Ok(archive) => return Ok(archive),
        Err(err) => err,
    };
    log::debug!("no embedded archive: {embedded_err:#}");

    let sideload_allowed = has_signature(executable, &pyboot_contracts::sideload_magic())
        .with_context(|| format!("scan for sideload signature: {}", executable.display()))?;
    if !sideload_allowed {
        return Err(embedded_err.context(format!(
            "cannot open package archive embedded in {}",
            executable.display()
        )));
    }

    let pkg = sideload_path(executable);
    log::debug!("trying sideload archive: {}", pkg.display());
    Archive::open(&pkg).with_context(|| format!("cannot open sideload archive {}", pkg.display()))
}

/// `<exe>.pkg`; on Windows a trailing `.exe` is replaced instead.
pub fn sideload_path(executable: &Path) -> PathBuf {
    sideload_path_for(executable, cfg!(windows))
}

fn sideload_path_for(executable: &Path, replace_exe_suffix: bool) -> PathBuf {
    let is_exe = executable
        .extension()
        .is_some_and(|ext| ext.eq_ignore_ascii_case("exe"));
    if replace_exe_suffix && is_exe {
        return executable.with_extension(SIDELOAD_EXTENSION);
    }
    let mut raw = executable.as_os_str().to_os_string();
    raw.push(".");
    raw.push(SIDELOAD_EXTENSION);
    PathBuf::from(raw)
}

/// Directory holding the runtime library and bundled resources.
pub fn application_home_dir(executable: &Path, contents_directory: Option<&str>) -> Result<PathBuf> {
    home_dir_for(executable, contents_directory, cfg!(target_os = "macos"))
}

fn home_dir_for(
    executable: &Path,
    contents_directory: Option<&str>,
    macos_bundles: bool,
) -> Result<PathBuf> {
    let exe_dir = executable
        .parent()
        .filter(|dir| !dir.as_os_str().is_empty())
        .with_context(|| format!("executable has no parent directory: {}", executable.display()))?;

    if macos_bundles && is_app_bundle_macos_dir(exe_dir) {
        if let Some(contents) = exe_dir.parent() {
            return Ok(contents.join("Frameworks"));
        }
    }
    Ok(match contents_directory {
        Some(sub) => exe_dir.join(sub),
        None => exe_dir.to_path_buf(),
    })
}

fn is_app_bundle_macos_dir(dir: &Path) -> bool {
    let mut tail = dir.components().rev();
    let (Some(Component::Normal(macos)), Some(Component::Normal(contents)), Some(Component::Normal(app))) =
        (tail.next(), tail.next(), tail.next())
    else {
        return false;
    };
    macos == "MacOS"
        && contents == "Contents"
        && Path::new(app)
            .extension()
            .is_some_and(|ext| ext == "app")
}
