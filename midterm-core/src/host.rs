//! The Sessions map: the part of the Host that is identical whether the
//! IPC transport sits in front of it (`midterm-host`, sidecar mode) or a
//! `midterm-gateway` embeds it directly in-process (direct mode).
//!
//! `midterm-host`'s `ipc` module is a thin adapter from wire requests to
//! the methods here; nothing in this file knows about sockets, pipes, or
//! JSON.

use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

use crate::config::HostConfig;
use crate::error::CoreError;
use crate::foreground::ForegroundProcessInfo;
use crate::pty::{PtyConfig, ShellKind};
use crate::session::{Session, SessionEvent, SessionInfoDto, Subscription};

/// Parameters for `HostCore::create_session`, mirroring the
/// `session.create` IPC payload.
#[derive(Debug, Clone, Deserialize)]
pub struct CreateSessionRequest {
    pub shell: ShellKind,
    #[serde(default)]
    pub shell_cmd: Option<String>,
    #[serde(default)]
    pub args: Vec<String>,
    pub cols: u16,
    pub rows: u16,
    #[serde(default)]
    pub cwd: Option<String>,
    #[serde(default)]
    pub env: Vec<(String, String)>,
    #[serde(default)]
    pub name: Option<String>,
}

/// Everything announced on `state.subscribe`: map-shape changes
/// (`Created`/`Removed`) plus every per-Session `SessionEvent`, flattened
/// into this enum's own variants rather than nested, since serde's
/// internally-tagged representation can't carry an already-tagged enum
/// as a newtype payload without the two `type` fields colliding.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type")]
pub enum HostEvent {
    Created { info: SessionInfoDto },
    Removed { id: u64 },
    StateChange { info: SessionInfoDto },
    ProcessEvent { session_id: u64, pid: u32, exited: bool },
    ForegroundChange { session_id: u64, info: ForegroundProcessInfo },
}

impl From<SessionEvent> for HostEvent {
    fn from(event: SessionEvent) -> Self {
        match event {
            SessionEvent::StateChange { info } => HostEvent::StateChange { info },
            SessionEvent::ProcessEvent { session_id, pid, exited } => HostEvent::ProcessEvent { session_id, pid, exited },
            SessionEvent::ForegroundChange { session_id, info } => HostEvent::ForegroundChange { session_id, info },
        }
    }
}

/// Owns every `Session` for the process lifetime. Structural changes
/// (`create_session`/`close_session`/removal on drain-complete) take the
/// coarse `struct_lock`; everything else -- write, resize, rename, attach
/// -- goes straight through `DashMap`'s own per-shard locking and the
/// Session's own per-field locks, never blocking on `struct_lock`.
pub struct HostCore {
    sessions: DashMap<u64, Arc<Session>>,
    struct_lock: tokio::sync::Mutex<()>,
    next_id: AtomicU64,
    next_order: AtomicU32,
    config: HostConfig,
    events_tx: broadcast::Sender<HostEvent>,
}

impl HostCore {
    pub fn new(config: HostConfig) -> Arc<Self> {
        let (events_tx, _) = broadcast::channel(1024);
        Arc::new(Self {
            sessions: DashMap::new(),
            struct_lock: tokio::sync::Mutex::new(()),
            next_id: AtomicU64::new(1),
            next_order: AtomicU32::new(0),
            config,
            events_tx,
        })
    }

    pub fn config(&self) -> &HostConfig {
        &self.config
    }

    /// `session.create`: allocates an id, starts the PTY Adapter and
    /// Foreground Monitor, and announces the new Session.
    pub async fn create_session(self: &Arc<Self>, req: CreateSessionRequest) -> Result<u64, CoreError> {
        // `portable-pty`'s `CommandBuilder` exposes no pre-exec hook, so a
        // configured de-elevation target cannot actually be applied to the
        // spawned child; fail this one session loudly rather than spawn it
        // running as the Host's own (typically more privileged) user.
        if self.config.run_as_target.is_set() {
            return Err(CoreError::platform_unsupported(
                "run-as de-elevation is configured but cannot be applied: portable-pty has no pre-exec hook",
            ));
        }

        let _guard = self.struct_lock.lock().await;

        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let order = self.next_order.fetch_add(1, Ordering::SeqCst);
        let shell_cmd = req.shell_cmd.unwrap_or_else(|| default_shell_cmd(req.shell));

        let cfg = PtyConfig {
            shell_cmd,
            args: req.args,
            cwd: req.cwd,
            cols: req.cols,
            rows: req.rows,
            env: req.env,
        };

        let session = Session::spawn(id, order, req.shell, cfg, self.config.scrollback_cap)?;
        if let Some(name) = req.name {
            session.rename(Some(name), false);
        }

        self.spawn_event_relay(session.clone());
        self.sessions.insert(id, session.clone());

        let _ = self.events_tx.send(HostEvent::Created { info: session.snapshot() });
        Ok(id)
    }

    /// Forwards a Session's own events onto the Host-wide `state.subscribe`
    /// channel, and drops the Session out of the map once it reaches
    /// `Closed` -- the only place entries are ever removed from `sessions`
    /// outside of `shutdown`.
    fn spawn_event_relay(self: &Arc<Self>, session: Arc<Session>) {
        let host = self.clone();
        let id = session.id;
        let mut rx = session.subscribe_events();
        tokio::spawn(async move {
            while let Ok(event) = rx.recv().await {
                let closed = matches!(
                    &event,
                    SessionEvent::StateChange { info } if info.state == crate::session::SessionState::Closed
                );
                let _ = host.events_tx.send(HostEvent::from(event));
                if closed {
                    host.sessions.remove(&id);
                    let _ = host.events_tx.send(HostEvent::Removed { id });
                    break;
                }
            }
        });
    }

    pub fn get(&self, id: u64) -> Option<Arc<Session>> {
        self.sessions.get(&id).map(|e| e.value().clone())
    }

    /// `session.list`.
    pub fn list(&self) -> Vec<SessionInfoDto> {
        let mut out: Vec<SessionInfoDto> = self.sessions.iter().map(|e| e.value().snapshot()).collect();
        out.sort_by_key(|s| (s.order, s.created_at));
        out
    }

    /// `session.close`: begins graceful teardown. `spawn_event_relay`
    /// handles the eventual map removal once the Session reaches `Closed`.
    pub async fn close_session(&self, id: u64) -> Result<(), CoreError> {
        let session = self.sessions.get(&id).map(|e| e.value().clone()).ok_or_else(|| CoreError::session_not_found(id))?;
        session.close().await;
        Ok(())
    }

    pub fn resize_session(&self, id: u64, cols: u16, rows: u16) -> Result<(), CoreError> {
        let session = self.sessions.get(&id).ok_or_else(|| CoreError::session_not_found(id))?;
        session.resize(cols, rows);
        Ok(())
    }

    pub fn rename_session(&self, id: u64, name: Option<String>, auto: bool) -> Result<(), CoreError> {
        let session = self.sessions.get(&id).ok_or_else(|| CoreError::session_not_found(id))?;
        session.rename(name, auto);
        Ok(())
    }

    pub fn write_session(&self, id: u64, bytes: Vec<u8>) -> Result<(), CoreError> {
        let session = self.sessions.get(&id).ok_or_else(|| CoreError::session_not_found(id))?;
        session.write(bytes)
    }

    /// `session.attach`: the streaming transport the Gateway actually uses
    /// for output. Returns the replay-then-live `Subscription` handle.
    pub fn attach(&self, id: u64, client_id: &str) -> Result<Subscription, CoreError> {
        let session = self.sessions.get(&id).ok_or_else(|| CoreError::session_not_found(id))?;
        Ok(session.subscribe(client_id))
    }

    pub fn detach(&self, id: u64, client_id: &str) {
        if let Some(session) = self.sessions.get(&id) {
            session.unsubscribe(client_id);
        }
    }

    /// `state.subscribe`.
    pub fn subscribe_state(&self) -> broadcast::Receiver<HostEvent> {
        self.events_tx.subscribe()
    }

    /// `host.shutdown`: force-closes every Session, waiting up to `grace`
    /// in total before returning regardless of stragglers (teardown is
    /// always driven to completion independently via `Session::close`'s
    /// own internal 1s kill-then-SIGKILL grace).
    pub async fn shutdown(&self, grace: Duration) {
        let sessions: Vec<Arc<Session>> = self.sessions.iter().map(|e| e.value().clone()).collect();
        let closes = sessions.into_iter().map(|s| async move { s.close().await });
        let _ = tokio::time::timeout(grace, futures_join_all(closes)).await;
    }

    pub fn session_count(&self) -> usize {
        self.sessions.len()
    }
}

/// Minimal stand-in for `futures::future::join_all` so this crate doesn't
/// need the `futures` crate for a single call site.
async fn futures_join_all<I>(iter: I)
where
    I: IntoIterator,
    I::Item: std::future::Future<Output = ()>,
{
    let handles: Vec<_> = iter.into_iter().map(tokio::spawn).collect();
    for h in handles {
        let _ = h.await;
    }
}

fn default_shell_cmd(shell: ShellKind) -> String {
    match shell {
        ShellKind::Pwsh => "pwsh".to_string(),
        ShellKind::WinPowerShell => "powershell.exe".to_string(),
        ShellKind::Cmd => "cmd.exe".to_string(),
        ShellKind::Zsh => "zsh".to_string(),
        ShellKind::Bash => std::env::var("SHELL").unwrap_or_else(|_| "/bin/bash".to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::SessionState;

    fn sample_info() -> SessionInfoDto {
        SessionInfoDto {
            id: 7,
            shell: ShellKind::Bash,
            pid: 1234,
            cols: 80,
            rows: 24,
            cwd: Some("/home/user".to_string()),
            name: None,
            terminal_title: None,
            manually_named: false,
            foreground: ForegroundProcessInfo { pid: 1234, name: "bash".to_string(), command_line: None, cwd: None },
            created_at: chrono::Utc::now(),
            exited: false,
            exit_code: None,
            order: 0,
            state: SessionState::Running,
        }
    }

    /// The bug this guards against: wrapping an already internally-tagged
    /// `SessionEvent` as a newtype payload inside `HostEvent` would emit two
    /// `"type"` keys in the same JSON object. Each variant here must
    /// serialize to exactly one `"type"` field.
    #[test]
    fn host_event_variants_serialize_with_a_single_type_tag() {
        let events = vec![
            HostEvent::Created { info: sample_info() },
            HostEvent::Removed { id: 7 },
            HostEvent::StateChange { info: sample_info() },
            HostEvent::ProcessEvent { session_id: 7, pid: 999, exited: false },
        ];
        for event in events {
            let v: serde_json::Value = serde_json::to_value(&event).unwrap();
            let obj = v.as_object().unwrap();
            assert_eq!(obj.keys().filter(|k| *k == "type").count(), 1);
            assert!(obj.get("type").unwrap().is_string());
        }
    }

    #[test]
    fn session_event_conversion_preserves_fields() {
        let event = SessionEvent::ProcessEvent { session_id: 3, pid: 55, exited: true };
        match HostEvent::from(event) {
            HostEvent::ProcessEvent { session_id, pid, exited } => {
                assert_eq!(session_id, 3);
                assert_eq!(pid, 55);
                assert!(exited);
            }
            other => panic!("unexpected variant: {other:?}"),
        }
    }

    #[test]
    fn create_session_request_deserializes_with_defaults() {
        let payload = serde_json::json!({
            "shell": "bash",
            "cols": 80,
            "rows": 24,
        });
        let req: CreateSessionRequest = serde_json::from_value(payload).unwrap();
        assert_eq!(req.shell, ShellKind::Bash);
        assert!(req.shell_cmd.is_none());
        assert!(req.args.is_empty());
        assert!(req.env.is_empty());
        assert!(req.name.is_none());
    }

    #[tokio::test]
    async fn create_session_rejects_when_run_as_target_is_set() {
        let mut config = HostConfig::default();
        config.run_as_target = crate::config::RunAsTarget {
            user: Some("nobody".to_string()),
            user_sid: None,
            uid: Some(65534),
            gid: None,
        };
        let host = HostCore::new(config);
        let req = CreateSessionRequest {
            shell: ShellKind::Bash,
            shell_cmd: None,
            args: Vec::new(),
            cols: 80,
            rows: 24,
            cwd: None,
            env: Vec::new(),
            name: None,
        };
        let err = host.create_session(req).await.unwrap_err();
        assert_eq!(err.kind, crate::error::ErrorKind::PlatformUnsupported);
    }
}
