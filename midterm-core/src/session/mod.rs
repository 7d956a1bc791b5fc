//! The per-terminal aggregate: buffered scrollback, output subscribers,
//! write queue, dimensions, name, and lifecycle.

mod scrollback;
mod subscriber;
mod title;

pub use scrollback::Scrollback;
pub use subscriber::{Chunk, Subscriber};
pub use title::TitleParser;

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock};

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use tokio::sync::{broadcast, mpsc, Notify};
use tokio::task::JoinHandle;

use crate::config::{
    dims_in_range, CLOSE_KILL_GRACE, DRAIN_GRACE, DEFAULT_SUBSCRIBER_BYTE_CAP,
    DEFAULT_SUBSCRIBER_CHUNK_CAP, PTY_READ_CHUNK,
};
use crate::error::CoreError;
use crate::foreground::{shell_cwd, ForegroundMonitor, ForegroundProcessInfo};
use crate::pty::{Pty, PtyConfig, ShellKind};

/// Lifecycle state of a Session.
///
/// ```text
/// Starting --spawn ok--> Running --shell exits--> Draining --drained + 2s grace--> Closed
///    |                     |                           ^
///    |spawn fails          |explicit Close()           |
///    v                     v                            |
///  Closed <---------------Terminating----------------------
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum SessionState {
    Starting,
    Running,
    Draining,
    Terminating,
    Closed,
}

/// Events exposed upward to the Host / state channel.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type")]
pub enum SessionEvent {
    StateChange { info: SessionInfoDto },
    ProcessEvent { session_id: u64, pid: u32, exited: bool },
    ForegroundChange { session_id: u64, info: ForegroundProcessInfo },
}

/// Read-only view for the state channel.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionInfoDto {
    pub id: u64,
    pub shell: ShellKind,
    pub pid: u32,
    pub cols: u16,
    pub rows: u16,
    pub cwd: Option<String>,
    pub name: Option<String>,
    pub terminal_title: Option<String>,
    pub manually_named: bool,
    pub foreground: ForegroundProcessInfo,
    pub created_at: DateTime<Utc>,
    pub exited: bool,
    pub exit_code: Option<i32>,
    pub order: u32,
    pub state: SessionState,
}

/// A handle returned by `Subscribe`: the live subscriber queue plus the
/// scrollback snapshot to send as the initial Resync replay.
pub struct Subscription {
    pub subscriber: Arc<Subscriber>,
    pub initial_scrollback: Vec<u8>,
    pub generation: u64,
}

struct Mutable {
    state: SessionState,
    cols: u16,
    rows: u16,
    cwd: Option<String>,
    name: Option<String>,
    manually_named: bool,
    terminal_title: Option<String>,
    exit_code: Option<i32>,
}

/// The per-terminal aggregate. Exclusively owns the PTY Adapter and the
/// Foreground Monitor; the Host exclusively owns all Sessions; Gateway
/// instances only look Sessions up by id through the Host.
pub struct Session {
    pub id: u64,
    pub order: u32,
    pub shell: ShellKind,
    pub created_at: DateTime<Utc>,

    pty: Arc<dyn Pty>,
    foreground: ForegroundMonitor,

    mutable: RwLock<Mutable>,
    scrollback: Arc<Mutex<Scrollback>>,
    subscribers: DashMap<String, Arc<Subscriber>>,
    subscriber_byte_cap: usize,
    subscriber_chunk_cap: usize,
    /// Bumped on every `Subscribe`; lets a Gateway outbound task that is
    /// still holding a stale `Subscription` tell it apart from one issued
    /// by a later `Subscribe` for the same `client_id` (the DashMap swap
    /// alone already drops the old queue -- this just makes that ordering
    /// observable without a second lookup).
    generation: AtomicU64,

    input_tx: std::sync::mpsc::Sender<Vec<u8>>,
    events_tx: broadcast::Sender<SessionEvent>,

    reader_shutdown: Arc<Notify>,
    writer_shutdown: Arc<AtomicBool>,
    reader_thread: Mutex<Option<std::thread::JoinHandle<()>>>,
    writer_thread: Mutex<Option<std::thread::JoinHandle<()>>>,
    pump_task: Mutex<Option<JoinHandle<()>>>,
    wait_task: Mutex<Option<JoinHandle<()>>>,

    closed_once: AtomicBool,
}

impl Session {
    /// Starts the PTY Adapter and Foreground Monitor, then announces the
    /// Session. `Starting` transitions to `Running` here; a caller that
    /// gets `Err` never sees a Session (spawn failure -> `Closed`
    /// directly, per the state diagram).
    pub fn spawn(
        id: u64,
        order: u32,
        shell: ShellKind,
        cfg: PtyConfig,
        scrollback_cap: usize,
    ) -> Result<Arc<Self>, CoreError> {
        let pty: Arc<dyn Pty> = Arc::new(crate::pty::PortablePty::spawn(&cfg)?);
        let pid = pty.pid();
        let foreground = ForegroundMonitor::start(pid, pty.clone());

        let (input_tx, input_rx) = std::sync::mpsc::channel::<Vec<u8>>();
        let (events_tx, _) = broadcast::channel(256);

        let session = Arc::new(Self {
            id,
            order,
            shell,
            created_at: Utc::now(),
            pty: pty.clone(),
            foreground,
            mutable: RwLock::new(Mutable {
                state: SessionState::Running,
                cols: cfg.cols,
                rows: cfg.rows,
                cwd: cfg.cwd.clone().or_else(|| shell_cwd(pid)),
                name: None,
                manually_named: false,
                terminal_title: None,
                exit_code: None,
            }),
            scrollback: Arc::new(Mutex::new(Scrollback::new(scrollback_cap))),
            subscribers: DashMap::new(),
            subscriber_byte_cap: DEFAULT_SUBSCRIBER_BYTE_CAP,
            subscriber_chunk_cap: DEFAULT_SUBSCRIBER_CHUNK_CAP,
            generation: AtomicU64::new(0),
            input_tx,
            events_tx,
            reader_shutdown: Arc::new(Notify::new()),
            writer_shutdown: Arc::new(AtomicBool::new(false)),
            reader_thread: Mutex::new(None),
            writer_thread: Mutex::new(None),
            pump_task: Mutex::new(None),
            wait_task: Mutex::new(None),
            closed_once: AtomicBool::new(false),
        });

        session.start_writer_thread(input_rx);
        session.start_reader_pipeline();
        session.start_wait_task();

        Ok(session)
    }

    fn start_writer_thread(self: &Arc<Self>, input_rx: std::sync::mpsc::Receiver<Vec<u8>>) {
        let pty = self.pty.clone();
        let id = self.id;
        let handle = std::thread::Builder::new()
            .name(format!("midterm-writer-{id:016x}"))
            .spawn(move || {
                while let Ok(data) = input_rx.recv() {
                    if let Err(e) = pty.write_all(&data) {
                        log::warn!("session {id:016x}: pty write failed: {e}");
                    }
                }
            })
            .expect("spawn writer thread");
        *self.writer_thread.lock().unwrap() = Some(handle);
    }

    fn start_reader_pipeline(self: &Arc<Self>) {
        let pty = self.pty.clone();
        let id = self.id;
        let (chunk_tx, mut chunk_rx) = mpsc::channel::<Vec<u8>>(256);

        let reader_handle = std::thread::Builder::new()
            .name(format!("midterm-reader-{id:016x}"))
            .spawn(move || {
                let mut reader = match pty.take_reader() {
                    Ok(r) => r,
                    Err(e) => {
                        log::warn!("session {id:016x}: failed to take reader: {e}");
                        return;
                    }
                };
                let mut buf = vec![0u8; PTY_READ_CHUNK];
                loop {
                    use std::io::Read;
                    match reader.read(&mut buf) {
                        Ok(0) => break,
                        Ok(n) => {
                            if chunk_tx.blocking_send(buf[..n].to_vec()).is_err() {
                                break;
                            }
                        }
                        Err(e) => {
                            log::warn!("session {id:016x}: pty read error: {e}");
                            break;
                        }
                    }
                }
            })
            .expect("spawn reader thread");
        *self.reader_thread.lock().unwrap() = Some(reader_handle);

        let session = self.clone();
        let shutdown = self.reader_shutdown.clone();
        let task = tokio::spawn(async move {
            let mut title_parser = TitleParser::new();
            loop {
                tokio::select! {
                    chunk = chunk_rx.recv() => {
                        match chunk {
                            Some(bytes) => session.on_output_chunk(&bytes, &mut title_parser),
                            None => {
                                session.on_reader_eof();
                                break;
                            }
                        }
                    }
                    _ = shutdown.notified() => break,
                }
            }
        });
        *self.pump_task.lock().unwrap() = Some(task);
    }

    fn start_wait_task(self: &Arc<Self>) {
        let session = self.clone();
        let pty = self.pty.clone();
        let task = tokio::spawn(async move {
            let code = tokio::task::spawn_blocking(move || pty.wait_blocking())
                .await
                .unwrap_or(None);
            session.on_shell_exit(code);
        });
        *self.wait_task.lock().unwrap() = Some(task);
    }

    fn on_output_chunk(self: &Arc<Self>, bytes: &[u8], title_parser: &mut TitleParser) {
        self.scrollback.lock().unwrap().append(bytes);

        for title in title_parser.scan(bytes) {
            self.apply_title(title);
        }

        for entry in self.subscribers.iter() {
            entry.value().push(bytes);
        }
    }

    fn apply_title(self: &Arc<Self>, title: String) {
        let mut m = self.mutable.write().unwrap();
        m.terminal_title = Some(title.clone());
        if !m.manually_named {
            m.name = Some(title);
        }
        drop(m);
        self.emit_state_change();
    }

    fn on_reader_eof(self: &Arc<Self>) {
        // A PTY-read EOF/error promotes the Session to Draining.
        let mut m = self.mutable.write().unwrap();
        if m.state == SessionState::Running {
            m.state = SessionState::Draining;
        }
        drop(m);
        self.emit_state_change();
    }

    fn on_shell_exit(self: &Arc<Self>, code: Option<i32>) {
        {
            let mut m = self.mutable.write().unwrap();
            m.exit_code = code;
            if m.state == SessionState::Running {
                m.state = SessionState::Draining;
            }
        }
        self.emit_state_change();

        let session = self.clone();
        tokio::spawn(async move {
            tokio::time::sleep(DRAIN_GRACE).await;
            session.finish_close().await;
        });
    }

    fn emit_state_change(self: &Arc<Self>) {
        let info = self.snapshot();
        let _ = self.events_tx.send(SessionEvent::StateChange { info });
    }

    pub fn subscribe_events(&self) -> broadcast::Receiver<SessionEvent> {
        self.events_tx.subscribe()
    }

    /// Non-blocking enqueue of client input bytes onto the write pump.
    /// Fails with `SessionExited` if the shell is gone.
    pub fn write(&self, bytes: Vec<u8>) -> Result<(), CoreError> {
        if !self.is_running() {
            return Err(CoreError::session_exited(self.id));
        }
        self.input_tx
            .send(bytes)
            .map_err(|_| CoreError::session_exited(self.id))
    }

    /// Validates bounds, updates cached dims, calls the PTY Adapter.
    /// Out-of-range requests are dropped silently, preserving existing
    /// dims, per the boundary-behavior contract.
    pub fn resize(&self, cols: u16, rows: u16) {
        if !dims_in_range(cols, rows) {
            return;
        }
        let mut m = self.mutable.write().unwrap();
        if m.cols == cols && m.rows == rows {
            return;
        }
        m.cols = cols;
        m.rows = rows;
        drop(m);
        self.pty.resize(cols, rows);
    }

    /// Sets or clears the display name. `auto=true` only takes effect
    /// when the name hasn't been manually set.
    pub fn rename(&self, name: Option<String>, auto: bool) {
        let mut m = self.mutable.write().unwrap();
        if auto && m.manually_named {
            return;
        }
        let trimmed = name.map(|n| n.trim().to_string()).filter(|n| !n.is_empty());
        m.name = trimmed.map(|n| truncate_utf8(&n, MAX_NAME_BYTES));
        if !auto {
            m.manually_named = m.name.is_some();
        }
    }

    /// Returns a handle delivering an initial Resync (the current
    /// scrollback) followed by live output. A second `Subscribe` for the
    /// same `client_id` replaces the queue, which is what forces the next
    /// flush on the Gateway side to start with a fresh Resync.
    pub fn subscribe(&self, client_id: impl Into<String>) -> Subscription {
        let client_id = client_id.into();
        let generation = self.generation.fetch_add(1, Ordering::SeqCst) + 1;
        let (initial_scrollback, mark) = {
            let sb = self.scrollback.lock().unwrap();
            (sb.snapshot(), sb.len() as u64)
        };
        let subscriber = Arc::new(Subscriber::new(
            client_id.clone(),
            self.subscriber_byte_cap,
            self.subscriber_chunk_cap,
            self.scrollback.clone(),
            mark,
        ));
        self.subscribers.insert(client_id, subscriber.clone());
        Subscription {
            subscriber,
            initial_scrollback,
            generation,
        }
    }

    pub fn unsubscribe(&self, client_id: &str) {
        self.subscribers.remove(client_id);
    }

    pub fn is_running(&self) -> bool {
        self.mutable.read().unwrap().state == SessionState::Running
    }

    pub fn state(&self) -> SessionState {
        self.mutable.read().unwrap().state
    }

    /// Begins graceful teardown: process-tree kill, then wait up to 1s,
    /// then SIGKILL -- handled by `PortablePty::dispose` -- then the
    /// shared `finish_close` path that every exit route converges on.
    pub async fn close(self: &Arc<Self>) {
        {
            let mut m = self.mutable.write().unwrap();
            if matches!(m.state, SessionState::Closed | SessionState::Terminating) {
                return;
            }
            m.state = SessionState::Terminating;
        }
        self.emit_state_change();

        if let Some(portable) = self.pty.as_any().downcast_ref::<crate::pty::PortablePty>() {
            portable.dispose(CLOSE_KILL_GRACE).await;
        } else {
            self.pty.kill();
        }
        self.finish_close().await;
    }

    async fn finish_close(self: &Arc<Self>) {
        if self.closed_once.swap(true, Ordering::SeqCst) {
            return;
        }

        self.foreground.stop().await;
        self.reader_shutdown.notify_waiters();
        self.writer_shutdown.store(true, Ordering::SeqCst);

        if let Some(handle) = self.reader_thread.lock().unwrap().take() {
            let _ = tokio::task::spawn_blocking(move || handle.join()).await;
        }
        // Dropping the sender side of input_tx (when `self` itself is
        // dropped) unblocks the writer thread's `recv()`; nothing further
        // to join eagerly here since Session may still be referenced by
        // in-flight Arc clones.

        {
            let mut m = self.mutable.write().unwrap();
            m.state = SessionState::Closed;
        }
        self.emit_state_change();
    }

    /// Read-only view for the state channel.
    pub fn snapshot(&self) -> SessionInfoDto {
        let m = self.mutable.read().unwrap();
        SessionInfoDto {
            id: self.id,
            shell: self.shell,
            pid: self.pty.pid(),
            cols: m.cols,
            rows: m.rows,
            cwd: m.cwd.clone(),
            name: m.name.clone(),
            terminal_title: m.terminal_title.clone(),
            manually_named: m.manually_named,
            foreground: self.foreground.current(),
            created_at: self.created_at,
            exited: matches!(m.state, SessionState::Draining | SessionState::Terminating | SessionState::Closed),
            exit_code: m.exit_code,
            order: self.order,
            state: m.state,
        }
    }

    pub fn scrollback_len(&self) -> usize {
        self.scrollback.lock().unwrap().len()
    }

    pub fn scrollback_snapshot(&self) -> Vec<u8> {
        self.scrollback.lock().unwrap().snapshot()
    }
}

/// Display names are capped at this many bytes, not Unicode scalars --
/// a name full of CJK or emoji codepoints can hit the cap in well under
/// 128 chars.
const MAX_NAME_BYTES: usize = 128;

/// Truncates `s` to at most `max_bytes` bytes, backing off to the nearest
/// preceding UTF-8 character boundary so the result is always valid `str`.
fn truncate_utf8(s: &str, max_bytes: usize) -> String {
    if s.len() <= max_bytes {
        return s.to_string();
    }
    let mut end = max_bytes;
    while !s.is_char_boundary(end) {
        end -= 1;
    }
    s[..end].to_string()
}

#[cfg(test)]
mod name_truncation_tests {
    use super::*;

    #[test]
    fn short_name_is_untouched() {
        assert_eq!(truncate_utf8("deploy-box", MAX_NAME_BYTES), "deploy-box");
    }

    #[test]
    fn truncates_by_bytes_not_chars() {
        // Each '\u{4e2d}' is 3 bytes; 50 of them is 150 bytes, over the
        // 128-byte cap, even though 50 is well under 128 chars.
        let name: String = std::iter::repeat('\u{4e2d}').take(50).collect();
        let truncated = truncate_utf8(&name, MAX_NAME_BYTES);
        assert!(truncated.len() <= MAX_NAME_BYTES);
        assert!(std::str::from_utf8(truncated.as_bytes()).is_ok());
    }

    #[test]
    fn never_splits_a_codepoint() {
        // 43 * 3 = 129 bytes, one byte over the cap -- the cap itself
        // lands mid-codepoint and must back off a full character.
        let name: String = std::iter::repeat('\u{4e2d}').take(43).collect();
        let truncated = truncate_utf8(&name, MAX_NAME_BYTES);
        assert_eq!(truncated.len(), 126);
        assert_eq!(truncated.chars().count(), 42);
    }
}
