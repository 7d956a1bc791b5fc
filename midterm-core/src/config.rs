//! Runtime configuration shared by the host and gateway binaries.
//!
//! Loaded from environment variables with in-code defaults, the same
//! convention the rest of this codebase uses for its one environment knob
//! (`MAESTRO_SESSION_ID`) rather than a config file format -- there is no
//! persisted configuration store for a single-user daemon.

use std::env;
use std::time::Duration;

/// Default scrollback cap in bytes (2 MiB, per the data model).
pub const DEFAULT_SCROLLBACK_CAP: usize = 2 * 1024 * 1024;
/// Default per-subscriber queue cap in bytes (4 MiB).
pub const DEFAULT_SUBSCRIBER_BYTE_CAP: usize = 4 * 1024 * 1024;
/// Default per-subscriber queue cap in chunk count.
pub const DEFAULT_SUBSCRIBER_CHUNK_CAP: usize = 1024;
/// Reader task chunk size ceiling.
pub const PTY_READ_CHUNK: usize = 64 * 1024;
/// Grace period after a shell exits before the session is fully removed.
pub const DRAIN_GRACE: Duration = Duration::from_secs(2);
/// Explicit close: time to wait after SIGTERM/process-tree kill before SIGKILL.
pub const CLOSE_KILL_GRACE: Duration = Duration::from_secs(1);
/// Foreground monitor poll interval.
pub const FOREGROUND_POLL_INTERVAL: Duration = Duration::from_millis(200);
/// Minimum interval between re-resolving an unchanged foreground process.
pub const FOREGROUND_RELOOKUP_INTERVAL: Duration = Duration::from_secs(2);
/// Valid terminal dimension range (inclusive).
pub const MIN_DIM: u16 = 1;
pub const MAX_DIM: u16 = 500;

/// Log file rotation size: files rotate at 10 MiB.
pub const LOG_ROTATE_BYTES: u64 = 10 * 1024 * 1024;
/// Number of rotated generations to retain. `LOG_GENERATIONS *
/// LOG_ROTATE_BYTES` is the de facto directory budget -- kept at 50 MiB,
/// well under the 100 MiB target, since `flexi_logger` has no knob for
/// capping total directory size directly.
pub const LOG_GENERATIONS: usize = 5;

/// Runtime-tunable knobs for `midterm-host`, loaded once at startup.
#[derive(Debug, Clone)]
pub struct HostConfig {
    /// Size of the IPC request worker pool.
    pub ipc_workers: usize,
    /// Per-session scrollback cap in bytes.
    pub scrollback_cap: usize,
    /// IPC request timeout (not applied to streaming commands).
    pub ipc_request_timeout: Duration,
    /// Override for the local IPC socket/pipe path.
    pub socket_path_override: Option<String>,
    /// De-elevation target for spawned shells, read from `MM_RUN_AS_USER*`.
    /// `portable-pty`'s `CommandBuilder` has no pre-exec hook to apply this
    /// through, so a configured target makes `create_session` fail for
    /// that one session rather than silently spawning elevated.
    pub run_as_target: RunAsTarget,
}

impl Default for HostConfig {
    fn default() -> Self {
        Self {
            ipc_workers: 4,
            scrollback_cap: DEFAULT_SCROLLBACK_CAP,
            ipc_request_timeout: Duration::from_secs(30),
            socket_path_override: None,
            run_as_target: RunAsTarget::default(),
        }
    }
}

impl HostConfig {
    /// Loads configuration from environment variables, falling back to
    /// defaults for anything unset or unparsable.
    pub fn from_env() -> Self {
        let mut cfg = Self::default();
        if let Ok(v) = env::var("MIDTERM_IPC_WORKERS") {
            if let Ok(n) = v.parse() {
                cfg.ipc_workers = n;
            }
        }
        if let Ok(v) = env::var("MIDTERM_SCROLLBACK_CAP_BYTES") {
            if let Ok(n) = v.parse() {
                cfg.scrollback_cap = n;
            }
        }
        if let Ok(v) = env::var("MIDTERM_HOST_SOCKET") {
            cfg.socket_path_override = Some(v);
        }
        cfg.run_as_target = RunAsTarget::from_env();
        cfg
    }
}

/// Runtime-tunable knobs for `midterm-gateway`, loaded once at startup.
#[derive(Debug, Clone)]
pub struct GatewayConfig {
    /// Address the `/ws/mux` and `/ws/state` HTTP server binds to.
    pub bind_addr: String,
    /// Override for the local IPC socket/pipe path dialed to reach the host.
    pub socket_path_override: Option<String>,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            bind_addr: "127.0.0.1:8765".to_string(),
            socket_path_override: None,
        }
    }
}

impl GatewayConfig {
    /// Loads configuration from environment variables, falling back to
    /// defaults for anything unset.
    pub fn from_env() -> Self {
        let mut cfg = Self::default();
        if let Ok(v) = env::var("MIDTERM_GATEWAY_BIND") {
            cfg.bind_addr = v;
        }
        if let Ok(v) = env::var("MIDTERM_HOST_SOCKET") {
            cfg.socket_path_override = Some(v);
        }
        cfg
    }
}

/// De-elevation target, read from environment variables recognised by the
/// Host binary (`MM_RUN_AS_USER*`).
#[derive(Debug, Clone, Default)]
pub struct RunAsTarget {
    pub user: Option<String>,
    pub user_sid: Option<String>,
    pub uid: Option<u32>,
    pub gid: Option<u32>,
}

impl RunAsTarget {
    pub fn from_env() -> Self {
        Self {
            user: env::var("MM_RUN_AS_USER").ok(),
            user_sid: env::var("MM_RUN_AS_USER_SID").ok(),
            uid: env::var("MM_RUN_AS_UID").ok().and_then(|v| v.parse().ok()),
            gid: env::var("MM_RUN_AS_GID").ok().and_then(|v| v.parse().ok()),
        }
    }

    pub fn is_set(&self) -> bool {
        self.user.is_some() || self.uid.is_some()
    }
}

/// Validates a (cols, rows) pair against the `1..=500` contract shared by
/// Resize and the mux wire frames.
pub fn dims_in_range(cols: u16, rows: u16) -> bool {
    (MIN_DIM..=MAX_DIM).contains(&cols) && (MIN_DIM..=MAX_DIM).contains(&rows)
}
