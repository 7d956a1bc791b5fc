//! Platform pseudo-terminal adapter.
//!
//! Hides the gap between Windows ConPTY and Unix openpt/forkpty behind one
//! trait. The single implementation here, [`PortablePty`], is built on the
//! `portable-pty` crate, which already resolves that split internally; this
//! module's job is ownership and teardown ordering, not re-implementing
//! ConPTY. Platform-specific code appears only inside the `Kill`/`Dispose`
//! escalation path (process-group signaling), never in `Session`.

mod portable;

pub use portable::PortablePty;

use serde::{Deserialize, Serialize};
use std::io::Read;

use crate::error::CoreError;

/// The shell kinds the data model enumerates. Used for display only; any
/// of them can be launched with an arbitrary `shell_cmd` override.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ShellKind {
    Pwsh,
    WinPowerShell,
    Cmd,
    Bash,
    Zsh,
}

impl ShellKind {
    /// Best-effort detection from a shell command's basename.
    pub fn from_command(cmd: &str) -> Self {
        let base = cmd.rsplit(['/', '\\']).next().unwrap_or(cmd).to_lowercase();
        match base.as_str() {
            "pwsh" | "pwsh.exe" => ShellKind::Pwsh,
            "powershell" | "powershell.exe" => ShellKind::WinPowerShell,
            "cmd" | "cmd.exe" => ShellKind::Cmd,
            "zsh" => ShellKind::Zsh,
            _ => ShellKind::Bash,
        }
    }

    #[cfg(unix)]
    pub fn platform_default() -> Self {
        ShellKind::Bash
    }

    #[cfg(windows)]
    pub fn platform_default() -> Self {
        ShellKind::WinPowerShell
    }
}

/// Parameters for starting a new PTY-attached child process.
#[derive(Debug, Clone)]
pub struct PtyConfig {
    pub shell_cmd: String,
    pub args: Vec<String>,
    pub cwd: Option<String>,
    pub cols: u16,
    pub rows: u16,
    pub env: Vec<(String, String)>,
}

/// One live PTY-attached child process.
///
/// Ownership rule: a `Pty` exclusively owns the master file descriptor /
/// handle and the child process handle. Read/write views borrow from it;
/// only the `Pty` itself closes the master resource, and only once, in its
/// `Drop` impl -- see `portable.rs` for the ordered teardown.
pub trait Pty: Send + Sync {
    /// OS process id of the spawned shell.
    fn pid(&self) -> u32;

    /// Takes a fresh blocking reader over the master. Only the Session's
    /// dedicated reader task should call this, once, at startup.
    fn take_reader(&self) -> Result<Box<dyn Read + Send>, CoreError>;

    /// Writes the full buffer to the master. Never retried by the caller;
    /// the shell decides what a short write means.
    fn write_all(&self, data: &[u8]) -> Result<(), CoreError>;

    /// Best-effort resize; a no-op if the adapter is disposed. Bounds
    /// checking against `1..=500` happens in `Session::resize`, not here.
    fn resize(&self, cols: u16, rows: u16);

    /// Terminates the entire child process tree. Idempotent; never panics
    /// or returns an error -- failures are logged at `warn` and swallowed.
    /// Sends the "polite" signal (SIGTERM / the platform's graceful
    /// request); escalate with `force_kill` after a grace period.
    fn kill(&self);

    /// Escalates to an unconditional kill (SIGKILL / `taskkill /F`).
    /// Idempotent; never panics.
    fn force_kill(&self);

    /// `true` if the child still appears to be alive. Used to poll the
    /// grace period between `kill` and `force_kill`.
    fn is_alive(&self) -> bool;

    /// Non-blocking exit-status poll. `None` while still running.
    fn try_wait(&self) -> Option<i32>;

    /// Blocks the calling thread until the child exits, returning its exit
    /// code. Intended to be driven from `tokio::task::spawn_blocking`.
    fn wait_blocking(&self) -> Option<i32>;

    /// The master fd on Unix, used by the Foreground Monitor's
    /// `tcgetpgrp` call. `None` on platforms without a raw fd (Windows).
    fn master_fd(&self) -> Option<i32>;

    /// Escape hatch so `Session::close` can reach the concrete adapter's
    /// async `dispose` ordering without an async fn in this trait (trait
    /// objects can't have those without boxing every call).
    fn as_any(&self) -> &dyn std::any::Any;
}
