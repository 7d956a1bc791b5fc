//! Log directory resolution and rotation
//!
//! This daemon has no `AppHandle` to emit events through, runs detached
//! from a terminal much of the time, and needs file rotation, so
//! `flexi_logger` takes `log`'s place as the backend while every call
//! site still goes through the plain `log::info!`/`log::warn!` facade.

use std::path::PathBuf;

use flexi_logger::{Cleanup, Criterion, FileSpec, Logger, Naming};

use midterm_core::config::{LOG_GENERATIONS, LOG_ROTATE_BYTES};

/// `%ProgramData%\MidTerm\Logs` / `/var/log/midterm/` when running as a
/// system service; `~/.midterm/logs` in user mode. Detection of
/// "running as a service" is left to the caller (there is no portable,
/// dependency-free way to ask the OS); `midterm-host` treats
/// `MIDTERM_SERVICE_MODE=1` as the signal, matching its other
/// environment-variable-driven configuration.
pub fn log_dir() -> PathBuf {
    let service_mode = std::env::var("MIDTERM_SERVICE_MODE").as_deref() == Ok("1");
    if service_mode {
        #[cfg(windows)]
        {
            if let Ok(pd) = std::env::var("ProgramData") {
                return PathBuf::from(pd).join("MidTerm").join("Logs");
            }
        }
        #[cfg(unix)]
        {
            return PathBuf::from("/var/log/midterm");
        }
    }
    directories::UserDirs::new()
        .map(|d| d.home_dir().join(".midterm").join("logs"))
        .unwrap_or_else(|| PathBuf::from(".midterm/logs"))
}

/// Initializes `flexi_logger` with size-based rotation and a bounded
/// number of generations. `flexi_logger` doesn't offer a direct
/// "cap the whole directory at N bytes" knob; `LOG_GENERATIONS` files
/// of `LOG_ROTATE_BYTES` each stays well under the 100 MiB directory cap
/// (5 x 10 MiB = 50 MiB), which is the resolution recorded in DESIGN.md.
pub fn init(min_level: &str) -> Result<(), flexi_logger::FlexiLoggerError> {
    let dir = log_dir();
    let _ = std::fs::create_dir_all(&dir);

    Logger::try_with_str(min_level)?
        .log_to_file(FileSpec::default().directory(dir).basename("midterm-host"))
        .rotate(
            Criterion::Size(LOG_ROTATE_BYTES),
            Naming::Numbers,
            Cleanup::KeepLogFiles(LOG_GENERATIONS),
        )
        .duplicate_to_stderr(flexi_logger::Duplicate::Warn)
        .start()?;
    Ok(())
}
