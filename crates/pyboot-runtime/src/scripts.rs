//! Runs the archive's entry scripts (`s` entries) as `__main__`.

use std::path::Path;

use anyhow::{Context, Result};
use pyboot_archive::{Archive, EntryKind};
use pyboot_contracts::MAIN_CODE_ATTR;

use crate::api::PythonApi;
use crate::ffi::{str_cstring, Py_ssize_t};

/// Exit status of a script that ended in an unhandled exception.
pub const UNHANDLED_EXCEPTION_EXIT_CODE: i32 = 1;

/// Runs every script entry in TOC order.
///
/// Returns `0` when all scripts complete and [`UNHANDLED_EXCEPTION_EXIT_CODE`]
/// after the first script that raises; later scripts are not run. Failing to
/// set up `__main__` or to unmarshal a script is an error.
pub fn run_scripts(api: &dyn PythonApi, archive: &Archive, home: &Path) -> Result<i32> {
    let main_name = str_cstring("__main__")?;
    let file_attr = str_cstring("__file__")?;
    let code_attr = str_cstring(MAIN_CODE_ATTR)?;

    // SAFETY: both calls return borrowed references.
    let (main, main_dict) = unsafe {
        let main = api.import_add_module(main_name.as_ptr());
        if main.is_null() {
            anyhow::bail!("could not get __main__ module");
        }
        let dict = api.module_get_dict(main);
        if dict.is_null() {
            anyhow::bail!("could not get __main__ module's dict");
        }
        (main, dict)
    };

    for entry in archive.entries_of(EntryKind::Script) {
        let data = archive
            .extract(entry)
            .with_context(|| format!("failed to extract script {} from archive", entry.name))?;
        let file = home.join(format!("{}.py", entry.name));
        let file_c = str_cstring(&file.to_string_lossy())?;
        let len = Py_ssize_t::try_from(data.len())
            .with_context(|| format!("script {} is too large", entry.name))?;
        log::debug!("running {}", file.display());

        // SAFETY: __main__ and its dict stay alive for the interpreter's
        // lifetime; new references are released once stored.
        unsafe {
            let file_obj = api.unicode_from_string(file_c.as_ptr());
            if !file_obj.is_null() {
                api.object_set_attr_string(main, file_attr.as_ptr(), file_obj);
                api.dec_ref(file_obj);
            }

            let code = api.marshal_read_object_from_string(data.as_ptr().cast(), len);
            if code.is_null() {
                api.err_print();
                anyhow::bail!("failed to unmarshal code object for {}", entry.name);
            }
            api.object_set_attr_string(main, code_attr.as_ptr(), code);

            let result = api.eval_code(code, main_dict, main_dict);
            api.dec_ref(code);
            if result.is_null() {
                // SystemExit makes this call exit the process.
                api.err_print();
                log::error!(
                    "failed to execute script '{}' due to unhandled exception",
                    entry.name
                );
                return Ok(UNHANDLED_EXCEPTION_EXIT_CODE);
            }
            api.dec_ref(result);
        }
    }
    Ok(0)
}
