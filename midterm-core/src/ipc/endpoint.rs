//! Resolves the local IPC path/pipe name Shared by
//! `midterm-host` (which binds it) and `midterm-gateway` (which dials it) so
//! the two binaries can never disagree about where to find each other.

use std::path::PathBuf;

/// Honors an explicit override (`MIDTERM_HOST_SOCKET`) first; otherwise
/// picks the platform default: a named pipe scoped to the current user on
/// Windows, `$XDG_RUNTIME_DIR/midterm-host.sock` on Unix with a
/// `/tmp/midterm-host-<uid>.sock` fallback.
pub fn resolve_endpoint(override_path: Option<&str>) -> String {
    if let Some(p) = override_path {
        return p.to_string();
    }
    #[cfg(windows)]
    {
        let user = std::env::var("USERNAME").unwrap_or_else(|_| "default".to_string());
        format!(r"\\.\pipe\midterm-host-{user}")
    }
    #[cfg(unix)]
    {
        if let Ok(dir) = std::env::var("XDG_RUNTIME_DIR") {
            return PathBuf::from(dir).join("midterm-host.sock").to_string_lossy().into_owned();
        }
        let uid = unsafe { libc::getuid() };
        format!("/tmp/midterm-host-{uid}.sock")
    }
}
