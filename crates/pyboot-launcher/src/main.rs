mod logging;

use std::process::ExitCode;

use anyhow::Result;
use log::Level;
use pyboot_runtime::{execute, DynamicLoader, HostContext};

/// Exit status for any launcher-side failure.
const LAUNCHER_FAILURE_EXIT_CODE: u8 = 255;

fn main() -> ExitCode {
    if let Err(err) = logging::init() {
        let _ = writeln_stderr(logging::format_line(
            std::process::id(),
            Level::Warn,
            format_args!("{err:#}"),
        ));
    }
    match try_main() {
        Ok(code) => code,
        Err(err) => {
            let _ = writeln_stderr(logging::format_line(
                std::process::id(),
                Level::Error,
                format_args!("{err:#}"),
            ));
            ExitCode::from(LAUNCHER_FAILURE_EXIT_CODE)
        }
    }
}

fn try_main() -> Result<ExitCode> {
    let mut ctx = HostContext::from_current_process()?;
    let status = execute(&mut ctx, &DynamicLoader)?;
    drop(ctx);
    Ok(ExitCode::from(exit_status_byte(status)))
}

fn exit_status_byte(status: i32) -> u8 {
    u8::try_from(status).unwrap_or(LAUNCHER_FAILURE_EXIT_CODE)
}

fn writeln_stderr(msg: String) -> std::io::Result<()> {
    use std::io::Write;
    let mut stderr = std::io::stderr();
    stderr.write_all(msg.as_bytes())?;
    stderr.flush()
}
