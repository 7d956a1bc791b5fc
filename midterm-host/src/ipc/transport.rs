//! Platform-specific local IPC endpoint: a Unix domain socket everywhere
//! but Windows, a named pipe there. Resolving the path/pipe name and
//! accepting connections is the only platform-conditional code in this
//! crate, mirroring the `Pty` trait's isolation of platform branching in
//! `midterm-core`.

use midterm_core::CoreError;

pub use midterm_core::ipc::resolve_endpoint;

#[cfg(unix)]
pub mod unix {
    use super::*;
    use tokio::net::{UnixListener, UnixStream};

    /// Binds the Unix domain socket, removing a stale file left behind by
    /// a crashed previous instance first. OS-level access restriction
    /// (the socket file's mode) is the entire auth story --
    /// there is no in-band auth handshake.
    pub fn bind(path: &str) -> Result<UnixListener, CoreError> {
        let _ = std::fs::remove_file(path);
        if let Some(parent) = std::path::Path::new(path).parent() {
            let _ = std::fs::create_dir_all(parent);
        }
        let listener = UnixListener::bind(path).map_err(|e| CoreError::ipc(format!("bind {path}: {e}")))?;
        // Owner-only access; the OS enforces the "single user" auth model.
        use std::os::unix::fs::PermissionsExt;
        let _ = std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o600));
        Ok(listener)
    }

    pub async fn accept(listener: &UnixListener) -> Result<UnixStream, CoreError> {
        listener.accept().await.map(|(s, _)| s).map_err(|e| CoreError::ipc(e.to_string()))
    }
}

#[cfg(windows)]
pub mod windows {
    use super::*;
    use tokio::net::windows::named_pipe::{NamedPipeServer, ServerOptions};

    /// Creates the first pipe instance. Each subsequent `accept` creates
    /// the next instance before returning the connected one, so there is
    /// always exactly one pending instance ready to accept -- the
    /// standard named-pipe server loop shape.
    pub fn bind(name: &str) -> Result<NamedPipeServer, CoreError> {
        ServerOptions::new()
            .first_pipe_instance(true)
            .create(name)
            .map_err(|e| CoreError::ipc(format!("create pipe {name}: {e}")))
    }

    pub async fn accept(server: NamedPipeServer, name: &str) -> Result<(NamedPipeServer, NamedPipeServer), CoreError> {
        server.connect().await.map_err(|e| CoreError::ipc(format!("pipe connect: {e}")))?;
        let next = ServerOptions::new()
            .create(name)
            .map_err(|e| CoreError::ipc(format!("create next pipe instance: {e}")))?;
        Ok((server, next))
    }
}
