//! Interpreter start-up and shutdown.
//!
//! States only move forward:
//! `Uninitialized -> PreInitialized -> ConfigAllocated -> ConfigPopulated ->
//! Running -> Finalized`. The `PyConfig` block is released by one cleanup
//! path, [`Lifecycle::release_config`], on every way out of [`Lifecycle::start`].

use std::ffi::OsString;
use std::io::Write;
use std::os::raw::{c_int, c_ulong};
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use pyboot_abi::{AbiFlags, ConfigAbi, RuntimeVersion};
use pyboot_contracts::{BASE_LIBRARY_NAME, FLUSH_STDERR_COMMAND, FLUSH_STDOUT_COMMAND};

use crate::api::PythonApi;
use crate::config::{self, ConfigBlock};
use crate::context::HostContext;
use crate::ffi::{str_cstring, PyPreConfig};
use crate::options::RuntimeOptions;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum LifecycleState {
    Uninitialized,
    PreInitialized,
    ConfigAllocated,
    ConfigPopulated,
    Running,
    Finalized,
}

/// Everything written into `PyConfig`.
#[derive(Debug, Clone)]
pub struct StartupConfig {
    pub program_name: OsString,
    pub home: PathBuf,
    pub module_search_paths: Vec<PathBuf>,
    pub argv: Vec<OsString>,
    pub runtime: RuntimeOptions,
    pub abi_flags: AbiFlags,
    /// The process runs under the C or POSIX locale; turns UTF-8 mode on
    /// unless an option decides it.
    pub c_locale: bool,
}

impl StartupConfig {
    pub fn for_context(ctx: &HostContext, version: RuntimeVersion) -> Self {
        StartupConfig {
            program_name: ctx.executable().as_os_str().to_os_string(),
            home: ctx.home_dir().to_path_buf(),
            module_search_paths: default_module_search_paths(ctx.home_dir(), version),
            argv: ctx.argv().to_vec(),
            runtime: ctx.runtime_options().clone(),
            abi_flags: ctx.boot_options().abi_flags(),
            c_locale: !cfg!(windows) && locale_is_c_or_posix(|name| std::env::var_os(name)),
        }
    }
}

/// Resolves `LC_CTYPE` the way `setlocale(LC_CTYPE, "")` does: the first
/// non-empty of `LC_ALL`, `LC_CTYPE` and `LANG`, with `C` when all are unset.
pub fn locale_is_c_or_posix(lookup: impl Fn(&str) -> Option<OsString>) -> bool {
    let locale = ["LC_ALL", "LC_CTYPE", "LANG"]
        .into_iter()
        .filter_map(|name| lookup(name))
        .find(|value| !value.is_empty());
    match locale {
        None => true,
        Some(value) => value == "C" || value == "POSIX",
    }
}

/// `base_library.zip`, the extension module directory, then the home itself.
pub fn default_module_search_paths(home: &Path, version: RuntimeVersion) -> Vec<PathBuf> {
    let mut paths = vec![home.join(BASE_LIBRARY_NAME)];
    if !cfg!(windows) {
        paths.push(
            home.join(format!("python{}.{}", version.major(), version.minor()))
                .join("lib-dynload"),
        );
    }
    paths.push(home.to_path_buf());
    paths
}

pub struct Lifecycle<'py> {
    api: &'py dyn PythonApi,
    state: LifecycleState,
    config: Option<ConfigBlock>,
}

impl<'py> Lifecycle<'py> {
    pub fn new(api: &'py dyn PythonApi) -> Self {
        Lifecycle {
            api,
            state: LifecycleState::Uninitialized,
            config: None,
        }
    }

    pub fn state(&self) -> LifecycleState {
        self.state
    }

    /// Runs pre-initialization through initialization.
    ///
    /// Ends in `Running` on success. The config block is released whatever
    /// the outcome.
    pub fn start(&mut self, startup: &StartupConfig) -> Result<()> {
        if self.state != LifecycleState::Uninitialized {
            anyhow::bail!("interpreter start requested in state {:?}", self.state);
        }
        let result = self.run_startup(startup);
        self.release_config();
        if result.is_err() {
            log::debug!("python start-up stopped in state {:?}", self.state);
        }
        result
    }

    fn run_startup(&mut self, startup: &StartupConfig) -> Result<()> {
        self.pre_initialize(&startup.runtime, startup.c_locale)?;
        self.allocate_config(startup.abi_flags)?;
        self.populate_config(startup)?;
        self.initialize(&startup.runtime)
    }

    fn advance(&mut self, next: LifecycleState) {
        debug_assert!(next > self.state, "{:?} -> {next:?}", self.state);
        log::debug!("python lifecycle: {:?} -> {next:?}", self.state);
        self.state = next;
    }

    fn pre_initialize(&mut self, runtime: &RuntimeOptions, c_locale: bool) -> Result<()> {
        let mut pre = PyPreConfig::default();
        // SAFETY: pre is a properly laid out PyPreConfig on our stack.
        unsafe { self.api.pre_config_init_isolated(&mut pre) };
        match runtime.utf8_mode {
            Some(utf8) => pre.utf8_mode = c_int::from(utf8),
            None if c_locale => {
                log::debug!("C/POSIX locale in use, enabling UTF-8 mode");
                pre.utf8_mode = 1;
            }
            None => {}
        }
        pre.dev_mode = c_int::from(runtime.dev_mode);

        // SAFETY: as above; the runtime copies what it needs.
        let status = unsafe { self.api.pre_initialize(&pre) };
        config::check_status(self.api, status, "python pre-initialization")?;
        self.advance(LifecycleState::PreInitialized);
        Ok(())
    }

    fn allocate_config(&mut self, flags: AbiFlags) -> Result<()> {
        let abi = ConfigAbi::select(self.api.version(), flags)
            .context("select python configuration layout")?;
        let block = ConfigBlock::allocate(abi)?;
        // SAFETY: block is zeroed and sized for this release's PyConfig.
        unsafe { self.api.config_init_isolated(block.as_ptr()) };
        log::debug!("allocated {abi} ({} bytes)", abi.layout().size);
        self.config = Some(block);
        self.advance(LifecycleState::ConfigAllocated);
        Ok(())
    }

    fn populate_config(&mut self, startup: &StartupConfig) -> Result<()> {
        let api = self.api;
        let block = self
            .config
            .as_mut()
            .context("python configuration is not allocated")?;
        let offsets = block.abi().layout().offsets;

        config::set_string(
            api,
            block,
            offsets.program_name,
            &startup.program_name,
            "set program name",
        )?;
        config::set_string(
            api,
            block,
            offsets.home,
            startup.home.as_os_str(),
            "set python home",
        )?;

        let search_paths: Vec<OsString> = startup
            .module_search_paths
            .iter()
            .map(|p| p.as_os_str().to_os_string())
            .collect();
        config::set_string_list(
            api,
            block,
            offsets.module_search_paths,
            &search_paths,
            "set module search paths",
        )?;
        block.set_int(offsets.module_search_paths_set, 1);

        config::set_string_list(api, block, offsets.argv, &startup.argv, "set argv")?;

        apply_runtime_options(api, block, &startup.runtime)?;

        self.advance(LifecycleState::ConfigPopulated);
        Ok(())
    }

    fn initialize(&mut self, runtime: &RuntimeOptions) -> Result<()> {
        let block = self
            .config
            .as_ref()
            .context("python configuration is not allocated")?;

        if runtime.unbuffered {
            let _ = std::io::stdout().flush();
            let _ = std::io::stderr().flush();
        }

        log::debug!("starting embedded python interpreter");
        // SAFETY: block holds a fully populated PyConfig.
        let status = unsafe { self.api.initialize_from_config(block.as_ptr()) };
        // SAFETY: PyStatus is passed by value.
        if unsafe { self.api.status_exception(status) } {
            let message = config::status_message(&status);
            // SAFETY: reports the status; may exit the process.
            unsafe { self.api.exit_status_exception(status) };
            anyhow::bail!("failed to start embedded python interpreter: {message}");
        }
        self.advance(LifecycleState::Running);
        Ok(())
    }

    /// Clears and frees the config block if one is held. Idempotent.
    pub fn release_config(&mut self) {
        if let Some(block) = self.config.take() {
            // SAFETY: block was initialized by PyConfig_InitIsolatedConfig.
            unsafe { self.api.config_clear(block.as_ptr()) };
            drop(block);
            log::debug!("released python configuration");
        }
    }

    /// Flushes the runtime's stdio and finalizes it.
    ///
    /// Does nothing unless start-up reached `Running` and the runtime still
    /// reports itself initialized.
    pub fn finalize(&mut self) {
        if self.state != LifecycleState::Running {
            log::debug!("skipping python finalization in state {:?}", self.state);
            return;
        }
        // SAFETY: no arguments; valid after initialization.
        if !unsafe { self.api.is_initialized() } {
            log::debug!("python reports itself uninitialized; skipping finalization");
            self.advance(LifecycleState::Finalized);
            return;
        }

        log::debug!("flushing python stdout and stderr");
        for command in [FLUSH_STDOUT_COMMAND, FLUSH_STDERR_COMMAND] {
            match str_cstring(command) {
                // SAFETY: command is NUL-terminated; no compiler flags.
                Ok(command) => unsafe {
                    self.api
                        .run_simple_string(command.as_ptr(), std::ptr::null_mut());
                },
                Err(err) => log::warn!("{err:#}"),
            }
        }

        log::debug!("finalizing python interpreter");
        // SAFETY: the interpreter is initialized and owned by this thread.
        unsafe { self.api.finalize() };
        self.advance(LifecycleState::Finalized);
    }
}

impl Drop for Lifecycle<'_> {
    fn drop(&mut self) {
        self.release_config();
    }
}

fn apply_runtime_options(
    api: &dyn PythonApi,
    block: &mut ConfigBlock,
    runtime: &RuntimeOptions,
) -> Result<()> {
    let offsets = block.abi().layout().offsets;

    block.set_int(offsets.site_import, 0);
    block.set_int(offsets.write_bytecode, 0);
    block.set_int(offsets.configure_c_stdio, 1);
    block.set_int(offsets.buffered_stdio, c_int::from(!runtime.unbuffered));
    block.set_int(offsets.optimization_level, runtime.optimize);
    block.set_int(offsets.verbose, runtime.verbose);
    block.set_int(offsets.install_signal_handlers, 1);
    block.set_int(offsets.dev_mode, c_int::from(runtime.dev_mode));

    if let Some(seed) = runtime.hash_seed {
        let seed = c_ulong::try_from(seed)
            .with_context(|| format!("hash seed {seed} does not fit in unsigned long"))?;
        block.set_int(offsets.use_hash_seed, 1);
        block.set_ulong(offsets.hash_seed, seed);
    }

    if !runtime.warn_options.is_empty() {
        let values: Vec<OsString> = runtime.warn_options.iter().map(OsString::from).collect();
        config::set_string_list(api, block, offsets.warnoptions, &values, "set warnoptions")?;
    }
    if !runtime.x_options.is_empty() {
        let values: Vec<OsString> = runtime.x_options.iter().map(OsString::from).collect();
        config::set_string_list(api, block, offsets.xoptions, &values, "set xoptions")?;
    }
    Ok(())
}
