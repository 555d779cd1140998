use std::path::Path;

use anyhow::{Context, Result};
use pyboot_abi::{ConfigAbi, RuntimeVersion};

use crate::api::PythonApi;
use crate::binder::{candidate_library_names, BindError, BoundLibrary};
use crate::bootstrap;
use crate::context::HostContext;
use crate::lifecycle::{Lifecycle, StartupConfig};
use crate::scripts;

/// Opens and binds a runtime library file.
pub trait PythonLoader {
    fn load(&self, path: &Path, version: RuntimeVersion) -> Result<Box<dyn PythonApi>, BindError>;
}

/// Loads the runtime with the platform dynamic loader.
#[derive(Debug, Clone, Copy, Default)]
pub struct DynamicLoader;

impl PythonLoader for DynamicLoader {
    fn load(&self, path: &Path, version: RuntimeVersion) -> Result<Box<dyn PythonApi>, BindError> {
        Ok(Box::new(BoundLibrary::load(path, version)?))
    }
}

/// Runs the embedded program described by `ctx`.
///
/// Returns the program's exit status (`0`, or `1` after an unhandled
/// exception). Any binder, layout, start-up or bootstrap failure is an error.
/// The runtime library is unloaded before returning either way.
pub fn execute(ctx: &mut HostContext, loader: &dyn PythonLoader) -> Result<i32> {
    if ctx.archive().is_onefile() {
        anyhow::bail!(
            "{} holds files that must be unpacked before start-up; onefile archives are not supported",
            ctx.archive().path().display()
        );
    }

    let version = RuntimeVersion::from_tag(ctx.archive().python_version());
    let abi = ConfigAbi::select(version, ctx.boot_options().abi_flags())
        .context("python runtime recorded in the archive")?;
    log::debug!("python {version}, layout {abi}");

    load_python(ctx, loader, version)?;
    let result = run_interpreter(ctx, version);
    ctx.unload_python();

    match &result {
        Ok(0) => log::debug!("program finished"),
        Ok(code) => log::debug!("program finished with exit code {code}"),
        Err(_) => {}
    }
    result
}

/// Tries each candidate library name under the home directory in turn.
fn load_python(ctx: &mut HostContext, loader: &dyn PythonLoader, version: RuntimeVersion) -> Result<()> {
    let mut first_err = None;
    for name in candidate_library_names(ctx.archive().python_libname(), version) {
        let path = ctx.home_dir().join(&name);
        match loader.load(&path, version) {
            Ok(python) => {
                ctx.attach_python(python);
                return Ok(());
            }
            Err(err) => {
                log::debug!("{err}");
                first_err.get_or_insert(err);
            }
        }
    }
    match first_err {
        Some(err) => Err(anyhow::Error::new(err)),
        None => anyhow::bail!("archive names no python library"),
    }
}

fn run_interpreter(ctx: &HostContext, version: RuntimeVersion) -> Result<i32> {
    let python = ctx.python().context("python library is not loaded")?;
    let startup = StartupConfig::for_context(ctx, version);
    let mut lifecycle = Lifecycle::new(python);

    let outcome = (|| {
        lifecycle.start(&startup)?;
        bootstrap::run(python, ctx.archive(), ctx.home_dir())?;
        scripts::run_scripts(python, ctx.archive(), ctx.home_dir())
    })();

    lifecycle.finalize();
    outcome
}
