use serde::Serialize;
use std::fmt;

/// Discriminant for core errors, serialized across the IPC boundary so a
/// client can distinguish "session gone" from "write failed" without string
/// matching on the message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// OS-level PTY allocation, ioctl, spawn, read, or write failure.
    PtyError,
    /// IPC command referenced an unknown session id.
    SessionNotFound,
    /// Write/resize/rename attempted on a Draining or Closed session.
    SessionExited,
    /// Malformed frame on the mux WebSocket.
    ProtocolError,
    /// A subscriber queue overflowed. Not user-visible; recovery is an
    /// automatic Resync rather than a surfaced error.
    BackpressureDrop,
    /// Transport-level failure on the local IPC channel.
    IpcError,
    /// WebSocket upgrade attempted without a valid auth cookie.
    AuthRejected,
    /// The host OS lacks a required primitive (ConPTY, openpt, ...).
    PlatformUnsupported,
}

/// A short kind tag for PTY-specific failures, per the PTY Adapter contract.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum PtyErrorKind {
    OpenPt,
    Grant,
    Unlock,
    Ptsname,
    Ioctl,
    Spawn,
    Wait,
}

/// Structured error carrying a machine-readable kind and a human message.
///
/// Mirrors the split used throughout the codebase this one is descended
/// from: a serializable discriminant plus a free-form message, so IPC
/// handlers can convert any `CoreError` into a `{ ok: false, error }`
/// response envelope without losing the ability to branch on kind.
#[derive(Debug, Clone, thiserror::Error, Serialize)]
#[error("{kind:?}: {message}")]
pub struct CoreError {
    pub kind: ErrorKind,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pty_kind: Option<PtyErrorKind>,
}

impl CoreError {
    pub fn pty(kind: PtyErrorKind, msg: impl Into<String>) -> Self {
        Self {
            kind: ErrorKind::PtyError,
            message: msg.into(),
            pty_kind: Some(kind),
        }
    }

    pub fn session_not_found(id: u64) -> Self {
        Self {
            kind: ErrorKind::SessionNotFound,
            message: format!("session {:016x} not found", id),
            pty_kind: None,
        }
    }

    pub fn session_exited(id: u64) -> Self {
        Self {
            kind: ErrorKind::SessionExited,
            message: format!("session {:016x} has exited", id),
            pty_kind: None,
        }
    }

    pub fn protocol(msg: impl Into<String>) -> Self {
        Self {
            kind: ErrorKind::ProtocolError,
            message: msg.into(),
            pty_kind: None,
        }
    }

    pub fn ipc(msg: impl Into<String>) -> Self {
        Self {
            kind: ErrorKind::IpcError,
            message: msg.into(),
            pty_kind: None,
        }
    }

    pub fn auth_rejected() -> Self {
        Self {
            kind: ErrorKind::AuthRejected,
            message: "missing or invalid session cookie".to_string(),
            pty_kind: None,
        }
    }

    pub fn platform_unsupported(msg: impl Into<String>) -> Self {
        Self {
            kind: ErrorKind::PlatformUnsupported,
            message: msg.into(),
            pty_kind: None,
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}", self)
    }
}

impl From<std::io::Error> for CoreError {
    fn from(err: std::io::Error) -> Self {
        CoreError::pty(PtyErrorKind::Ioctl, err.to_string())
    }
}
