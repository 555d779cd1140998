//! Feeds the archive's bootstrap modules into a running interpreter.
//!
//! 1. `sys._MEIPASS` is set to the application home directory.
//! 2. Every `m`/`M` entry is unmarshalled and executed as a module, in TOC
//!    order. The first failure aborts; the pending runtime error is printed
//!    before returning.
//! 3. Every `z` entry is appended to `sys.path` as `<archive>?<offset>`, the
//!    location format the runtime-side collection importer parses.

use std::ffi::CString;
use std::path::Path;

use anyhow::{Context, Result};
use pyboot_archive::{Archive, EntryKind};
use pyboot_contracts::{COLLECTION_OFFSET_SEPARATOR, SYS_HOME_ATTR};

use crate::api::{drain_pending_error, PythonApi};
use crate::ffi::{path_cstring, str_cstring, Py_ssize_t};

/// Runs all three bootstrap steps.
pub fn run(api: &dyn PythonApi, archive: &Archive, home: &Path) -> Result<()> {
    publish_home_dir(api, home)?;
    let modules = import_bootstrap_modules(api, archive)?;
    let collections = install_module_collections(api, archive)?;
    log::debug!("bootstrap done: {modules} modules imported, {collections} collections installed");
    Ok(())
}

pub fn publish_home_dir(api: &dyn PythonApi, home: &Path) -> Result<()> {
    log::debug!("setting sys.{SYS_HOME_ATTR} to {}", home.display());
    let home_c = path_cstring(home).context("application home directory")?;
    let attr = str_cstring(SYS_HOME_ATTR)?;

    // SAFETY: NUL-terminated inputs; the new reference is released below.
    unsafe {
        let value = api.unicode_decode_fs_default(home_c.as_ptr());
        if value.is_null() {
            drain_pending_error(api);
            anyhow::bail!(
                "failed to convert application home directory to a python string: {}",
                home.display()
            );
        }
        let rc = api.sys_set_object(attr.as_ptr(), value);
        api.dec_ref(value);
        if rc != 0 {
            drain_pending_error(api);
            anyhow::bail!("failed to set sys.{SYS_HOME_ATTR}");
        }
    }
    Ok(())
}

/// Executes compiled module and package entries in TOC order.
pub fn import_bootstrap_modules(api: &dyn PythonApi, archive: &Archive) -> Result<usize> {
    let mut imported = 0;
    for entry in archive.entries().filter(|e| e.kind.is_bootstrap_module()) {
        let data = archive
            .extract(entry)
            .with_context(|| format!("extract bootstrap module {}", entry.name))?;
        log::debug!("extracted {}", entry.name);
        let name = str_cstring(&entry.name)?;
        let len = Py_ssize_t::try_from(data.len())
            .with_context(|| format!("bootstrap module {} is too large", entry.name))?;

        // SAFETY: data outlives the call; returned references are released.
        let module = unsafe {
            let code = api.marshal_read_object_from_string(data.as_ptr().cast(), len);
            if code.is_null() {
                log::error!("failed to unmarshal code object for module {}", entry.name);
                std::ptr::null_mut()
            } else {
                log::debug!("running unmarshalled code object for module {}", entry.name);
                let module = api.import_exec_code_module(name.as_ptr(), code);
                api.dec_ref(code);
                if module.is_null() {
                    log::error!("module object for {} is NULL", entry.name);
                }
                module
            }
        };

        drain_pending_error(api);

        if module.is_null() {
            anyhow::bail!("failed to import bootstrap module {}", entry.name);
        }
        // SAFETY: new reference returned by PyImport_ExecCodeModule.
        unsafe { api.dec_ref(module) };
        imported += 1;
    }
    Ok(imported)
}

/// Appends each `z` collection to `sys.path` as `<archive>?<offset>`.
pub fn install_module_collections(api: &dyn PythonApi, archive: &Archive) -> Result<usize> {
    let path_attr = str_cstring("path")?;
    let mut installed = 0;
    for entry in archive.entries_of(EntryKind::Pyz) {
        let offset = archive.absolute_offset(entry);
        log::debug!("installing module collection {} at offset {offset}", entry.name);
        let location = collection_location(archive.path(), offset)?;

        // SAFETY: sys.path is a borrowed reference; the item is released after
        // the list takes its own reference.
        unsafe {
            let sys_path = api.sys_get_object(path_attr.as_ptr());
            if sys_path.is_null() {
                anyhow::bail!("sys.path is not available");
            }
            let item = api.unicode_decode_fs_default(location.as_ptr());
            if item.is_null() {
                drain_pending_error(api);
                anyhow::bail!("failed to build location of module collection {}", entry.name);
            }
            let rc = api.list_append(sys_path, item);
            api.dec_ref(item);
            if rc != 0 {
                drain_pending_error(api);
                anyhow::bail!("failed to append module collection {} to sys.path", entry.name);
            }
        }
        installed += 1;
    }
    Ok(installed)
}

fn collection_location(archive_path: &Path, offset: u64) -> Result<CString> {
    let mut raw = path_cstring(archive_path)
        .context("archive path")?
        .into_bytes();
    raw.extend_from_slice(format!("{COLLECTION_OFFSET_SEPARATOR}{offset}").as_bytes());
    CString::new(raw).context("module collection location")
}
