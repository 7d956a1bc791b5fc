//! Core session-and-transport engine for MidTerm: the PTY adapter, the
//! foreground monitor, and the per-terminal `Session` aggregate.
//!
//! This crate has no networking of its own. `midterm-host` embeds it to
//! own the Sessions map and expose the local IPC surface; `midterm-gateway`
//! talks to a host over that IPC surface and never touches a `Pty` or a
//! `Session` directly. Both binaries share the wire-format types re-exported
//! here so a frame or an IPC envelope is decoded exactly once, at the
//! boundary that received it.

pub mod config;
pub mod error;
pub mod foreground;
pub mod host;
pub mod ipc;
pub mod pty;
pub mod session;

pub use error::{CoreError, ErrorKind, PtyErrorKind};
pub use foreground::ForegroundProcessInfo;
pub use host::{CreateSessionRequest, HostCore, HostEvent};
pub use pty::{Pty, PtyConfig, ShellKind};
pub use session::{Session, SessionEvent, SessionInfoDto, SessionState, Subscription};
