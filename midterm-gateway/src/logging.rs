//! Log directory resolution and rotation. Shares the Host's rationale for
//! using `flexi_logger` as the backend behind the plain `log` facade; see
//! `midterm-host`'s `logging.rs`.

use std::path::PathBuf;

use flexi_logger::{Cleanup, Criterion, FileSpec, Logger, Naming};

use midterm_core::config::{LOG_GENERATIONS, LOG_ROTATE_BYTES};

/// `%ProgramData%\MidTerm\Logs` / `/var/log/midterm/` when running as a
/// system service; `~/.midterm/logs` in user mode, matching the Host's
/// `MIDTERM_SERVICE_MODE` convention.
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

/// Initializes `flexi_logger` with the same rotation policy as the Host,
/// under its own `midterm-gateway` basename so the two daemons' log files
/// never collide in a shared log directory.
pub fn init(min_level: &str) -> Result<(), flexi_logger::FlexiLoggerError> {
    let dir = log_dir();
    let _ = std::fs::create_dir_all(&dir);

    Logger::try_with_str(min_level)?
        .log_to_file(FileSpec::default().directory(dir).basename("midterm-gateway"))
        .rotate(
            Criterion::Size(LOG_ROTATE_BYTES),
            Naming::Numbers,
            Cleanup::KeepLogFiles(LOG_GENERATIONS),
        )
        .duplicate_to_stderr(flexi_logger::Duplicate::Warn)
        .start()?;
    Ok(())
}
