//! Options carried as `o` entries of the archive.
//!
//! Interpreter flags (`v`, `u`, `O`, `W ...`, `X ...`, `hash_seed=N`) become
//! [`RuntimeOptions`]; `pyi-*` names steer the launcher and become
//! [`BootOptions`].

use anyhow::{Context, Result};
use pyboot_abi::AbiFlags;
use pyboot_archive::{Archive, EntryKind};
use pyboot_contracts::{
    OPT_CONTENTS_DIRECTORY, OPT_IGNORE_SIGNALS, OPT_PYTHON_FLAG, OPT_RUNTIME_TMPDIR,
    PYTHON_FLAG_GIL_DISABLED,
};

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RuntimeOptions {
    pub verbose: i32,
    pub unbuffered: bool,
    pub optimize: i32,
    /// Fixed hash seed; randomized when `None`.
    pub hash_seed: Option<u64>,
    /// `Some(true)`/`Some(false)` forces UTF-8 mode on or off.
    pub utf8_mode: Option<bool>,
    pub dev_mode: bool,
    pub warn_options: Vec<String>,
    pub x_options: Vec<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BootOptions {
    pub contents_directory: Option<String>,
    pub gil_disabled: bool,
}

impl BootOptions {
    pub fn abi_flags(&self) -> AbiFlags {
        AbiFlags {
            gil_disabled: self.gil_disabled,
        }
    }
}

/// Parses every runtime option entry of `archive`, in TOC order.
pub fn read_options(archive: &Archive) -> Result<(RuntimeOptions, BootOptions)> {
    parse_options(
        archive
            .entries_of(EntryKind::RuntimeOption)
            .map(|entry| entry.name.as_str()),
    )
}

pub fn parse_options<'a>(
    names: impl IntoIterator<Item = &'a str>,
) -> Result<(RuntimeOptions, BootOptions)> {
    let mut runtime = RuntimeOptions::default();
    let mut boot = BootOptions::default();

    for name in names {
        let (key, value) = match name.split_once(' ') {
            Some((key, value)) => (key, Some(value.trim())),
            None => (name, None),
        };
        match (key, value) {
            ("v" | "verbose", None) => runtime.verbose += 1,
            ("u" | "unbuffered", None) => runtime.unbuffered = true,
            ("O" | "optimize", None) => runtime.optimize += 1,
            ("W", Some(flag)) => runtime.warn_options.push(flag.to_string()),
            ("X", Some(flag)) => {
                apply_x_option(&mut runtime, flag);
                runtime.x_options.push(flag.to_string());
            }
            (OPT_CONTENTS_DIRECTORY, Some(dir)) => {
                boot.contents_directory = Some(dir.to_string());
            }
            (OPT_PYTHON_FLAG, Some(flag)) => {
                if flag == PYTHON_FLAG_GIL_DISABLED {
                    boot.gil_disabled = true;
                } else {
                    log::debug!("ignoring unknown python build flag: {flag}");
                }
            }
            // Both only matter to a onefile parent process.
            (OPT_RUNTIME_TMPDIR, Some(_)) | (OPT_IGNORE_SIGNALS, None) => {
                log::debug!("ignoring onefile option: {name:?}");
            }
            _ => {
                if let Some(seed) = name.strip_prefix("hash_seed=") {
                    let seed = seed
                        .trim()
                        .parse::<u64>()
                        .with_context(|| format!("invalid hash seed option: {name:?}"))?;
                    runtime.hash_seed = Some(seed);
                } else {
                    log::debug!("ignoring unknown runtime option: {name:?}");
                }
            }
        }
    }

    Ok((runtime, boot))
}

fn apply_x_option(runtime: &mut RuntimeOptions, flag: &str) {
    match flag {
        "utf8" | "utf8=1" => runtime.utf8_mode = Some(true),
        "utf8=0" => runtime.utf8_mode = Some(false),
        "dev" | "dev=1" => runtime.dev_mode = true,
        _ => {}
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn interpreter_flags_accumulate() {
        let (runtime, boot) =
            parse_options(["v", "verbose", "O", "u", "W ignore", "W error::DeprecationWarning"])
                .unwrap();
        assert_eq!(runtime.verbose, 2);
        assert_eq!(runtime.optimize, 1);
        assert!(runtime.unbuffered);
        assert_eq!(runtime.warn_options, ["ignore", "error::DeprecationWarning"]);
        assert_eq!(boot, BootOptions::default());
    }

    #[test]
    fn x_options_set_modes_and_are_forwarded() {
        let (runtime, _) = parse_options(["X utf8", "X dev", "X importtime"]).unwrap();
        assert_eq!(runtime.utf8_mode, Some(true));
        assert!(runtime.dev_mode);
        assert_eq!(runtime.x_options, ["utf8", "dev", "importtime"]);

        let (runtime, _) = parse_options(["X utf8=1", "X utf8=0"]).unwrap();
        assert_eq!(runtime.utf8_mode, Some(false));
    }

    #[test]
    fn hash_seed_is_parsed() {
        let (runtime, _) = parse_options(["hash_seed=1234"]).unwrap();
        assert_eq!(runtime.hash_seed, Some(1234));
        assert!(parse_options(["hash_seed=abc"]).is_err());
    }

    #[test]
    fn launcher_options() {
        let (runtime, boot) = parse_options([
            "pyi-contents-directory _internal",
            "pyi-runtime-tmpdir /var/tmp",
            "pyi-python-flag Py_GIL_DISABLED",
            "pyi-bootloader-ignore-signals",
            "pyi-hide-console hide-early",
        ])
        .unwrap();
        assert_eq!(runtime, RuntimeOptions::default());
        assert_eq!(
            boot,
            BootOptions {
                contents_directory: Some("_internal".to_string()),
                gil_disabled: true,
            }
        );
        assert!(boot.abi_flags().gil_disabled);
    }

    #[test]
    fn onefile_options_leave_boot_options_untouched() {
        let (runtime, boot) =
            parse_options(["pyi-runtime-tmpdir /var/tmp", "pyi-bootloader-ignore-signals"])
                .unwrap();
        assert_eq!(runtime, RuntimeOptions::default());
        assert_eq!(boot, BootOptions::default());
    }

    #[test]
    fn contents_directory_dot_is_kept_verbatim() {
        let (_, boot) = parse_options(["pyi-contents-directory ."]).unwrap();
        assert_eq!(boot.contents_directory.as_deref(), Some("."));
    }
}
