//! Stderr backend for the `log` facade.

use std::fmt;
use std::io::Write;

use anyhow::Result;
use log::{Level, LevelFilter, Log, Metadata, Record};
use pyboot_contracts::ENV_DEBUG;

struct StderrLogger;

static LOGGER: StderrLogger = StderrLogger;

impl Log for StderrLogger {
    fn enabled(&self, metadata: &Metadata<'_>) -> bool {
        metadata.level() <= log::max_level()
    }

    fn log(&self, record: &Record<'_>) {
        if !self.enabled(record.metadata()) {
            return;
        }
        let line = format_line(std::process::id(), record.level(), record.args());
        let mut stderr = std::io::stderr().lock();
        let _ = stderr.write_all(line.as_bytes());
    }

    fn flush(&self) {
        let _ = std::io::stderr().flush();
    }
}

/// `[PYBOOT-<pid>:<LEVEL>] <message>\n`
pub fn format_line(pid: u32, level: Level, message: impl fmt::Display) -> String {
    format!("[PYBOOT-{pid}:{level}] {message}\n")
}

/// Installs the stderr logger. Debug output is enabled by `PYBOOT_DEBUG`.
pub fn init() -> Result<()> {
    let debug = read_debug_env()?;
    log::set_logger(&LOGGER).map_err(|err| anyhow::anyhow!("install logger: {err}"))?;
    log::set_max_level(if debug {
        LevelFilter::Debug
    } else {
        LevelFilter::Warn
    });
    Ok(())
}

pub fn read_debug_env() -> Result<bool> {
    match std::env::var(ENV_DEBUG) {
        Ok(raw) => parse_bool_env(ENV_DEBUG, &raw),
        Err(_) => Ok(false),
    }
}

fn parse_bool_env(name: &str, raw: &str) -> Result<bool> {
    match raw.trim() {
        "1" | "true" | "TRUE" | "yes" | "YES" => Ok(true),
        "0" | "false" | "FALSE" | "no" | "NO" => Ok(false),
        other => anyhow::bail!(
            "invalid environment variable {name}={other:?} (expected one of: 1, 0, true, false, yes, no)"
        ),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lines_carry_pid_and_level() {
        assert_eq!(
            format_line(4242, Level::Error, "failed to load python library"),
            "[PYBOOT-4242:ERROR] failed to load python library\n"
        );
        assert_eq!(
            format_line(7, Level::Debug, format_args!("state {}", 3)),
            "[PYBOOT-7:DEBUG] state 3\n"
        );
    }

    #[test]
    fn bool_env_accepts_the_usual_spellings() {
        for raw in ["1", "true", "TRUE", "yes", "YES", " 1 "] {
            assert!(parse_bool_env(ENV_DEBUG, raw).unwrap(), "{raw}");
        }
        for raw in ["0", "false", "FALSE", "no", "NO"] {
            assert!(!parse_bool_env(ENV_DEBUG, raw).unwrap(), "{raw}");
        }
    }

    #[test]
    fn bool_env_rejects_anything_else() {
        let err = parse_bool_env(ENV_DEBUG, "verbose").unwrap_err();
        assert_eq!(
            err.to_string(),
            "invalid environment variable PYBOOT_DEBUG=\"verbose\" (expected one of: 1, 0, true, false, yes, no)"
        );
    }
}
