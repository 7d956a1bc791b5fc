//! The Gateway-side counterpart of `midterm_core::session::Subscriber`:
//! one bounded output queue per (WebSocket connection, Session), fed by a
//! task draining a `session.attach` IPC stream and consumed by the
//! connection's outbound flush loop.
//!
//! The Host already enforces its own subscriber cap (data model §3)
//! before bytes ever reach the Gateway; this queue exists because the
//! flush loop coalesces across a 16ms/64KiB window and needs somewhere
//! to hold bytes while that window is open, and because the 200ms
//! WebSocket backpressure rule needs a local place to
//! drop from.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU16, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Instant;

use midterm_core::config::{DEFAULT_SUBSCRIBER_BYTE_CAP, DEFAULT_SUBSCRIBER_CHUNK_CAP};
use midterm_core::ipc::framing::StreamFrameKind;

use crate::ipc_client::AttachStream;

struct Inner {
    queue: VecDeque<Vec<u8>>,
    bytes: usize,
    oldest_queued_at: Option<Instant>,
}

/// Per-session state tracked for the lifetime of one attach within one
/// `/ws/mux` connection.
pub struct SessionChannel {
    inner: Mutex<Inner>,
    loss: AtomicBool,
    /// Client's most recent ActiveHint; relaxes flush cadence and forces
    /// compression when `false`.
    active: AtomicBool,
    cols: AtomicU16,
    rows: AtomicU16,
    /// Set once the attach stream ends (Host removed the session). The
    /// outbound loop drains whatever's left, then stops scheduling this id.
    closed: AtomicBool,
}

impl SessionChannel {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            inner: Mutex::new(Inner { queue: VecDeque::new(), bytes: 0, oldest_queued_at: None }),
            loss: AtomicBool::new(false),
            active: AtomicBool::new(true),
            cols: AtomicU16::new(80),
            rows: AtomicU16::new(24),
            closed: AtomicBool::new(false),
        })
    }

    fn push(&self, data: Vec<u8>) {
        if data.is_empty() {
            return;
        }
        let mut inner = self.inner.lock().unwrap();
        if inner.oldest_queued_at.is_none() {
            inner.oldest_queued_at = Some(Instant::now());
        }
        inner.bytes += data.len();
        inner.queue.push_back(data);

        let mut dropped = false;
        while inner.bytes > DEFAULT_SUBSCRIBER_BYTE_CAP || inner.queue.len() > DEFAULT_SUBSCRIBER_CHUNK_CAP {
            match inner.queue.pop_front() {
                Some(chunk) => {
                    inner.bytes = inner.bytes.saturating_sub(chunk.len());
                    dropped = true;
                }
                None => break,
            }
        }
        if inner.queue.is_empty() {
            inner.oldest_queued_at = None;
        }
        drop(inner);
        if dropped {
            self.loss.store(true, Ordering::SeqCst);
        }
    }

    /// Drains and concatenates everything currently queued into one blob,
    /// the shape the coalescing rule wants.
    pub fn drain_concat(&self) -> Vec<u8> {
        let mut inner = self.inner.lock().unwrap();
        inner.oldest_queued_at = None;
        inner.bytes = 0;
        let mut out = Vec::new();
        for chunk in inner.queue.drain(..) {
            out.extend_from_slice(&chunk);
        }
        out
    }

    /// Age of the oldest queued byte, if any -- drives the 16ms/250ms
    /// flush timer.
    pub fn oldest_age(&self) -> Option<std::time::Duration> {
        self.inner.lock().unwrap().oldest_queued_at.map(|t| t.elapsed())
    }

    pub fn queued_bytes(&self) -> usize {
        self.inner.lock().unwrap().bytes
    }

    /// Returns and clears the sticky loss flag; the caller must emit a
    /// Resync before the next Output frame whenever this returns `true`.
    pub fn take_loss(&self) -> bool {
        self.loss.swap(false, Ordering::SeqCst)
    }

    /// The 200ms backpressure-drop rule: discard everything queued and
    /// force a Resync on the next flush.
    pub fn force_drop_and_resync(&self) {
        let mut inner = self.inner.lock().unwrap();
        inner.queue.clear();
        inner.bytes = 0;
        inner.oldest_queued_at = None;
        drop(inner);
        self.loss.store(true, Ordering::SeqCst);
    }

    /// Marks the next flush as requiring a Resync frame first, without
    /// dropping anything already queued -- used when the Host signals
    /// (via `StreamFrameKind::Resync`) that its own subscriber queue
    /// overflowed and it already replayed the gap from scrollback. This is
    /// a separate trigger from `force_drop_and_resync`'s local WebSocket
    /// backpressure case, which also clears the queue.
    pub fn mark_external_resync(&self) {
        self.loss.store(true, Ordering::SeqCst);
    }

    pub fn set_active(&self, active: bool) {
        self.active.store(active, Ordering::SeqCst);
    }

    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::SeqCst)
    }

    pub fn dims(&self) -> (u16, u16) {
        (self.cols.load(Ordering::SeqCst), self.rows.load(Ordering::SeqCst))
    }

    pub fn set_dims(&self, cols: u16, rows: u16) {
        self.cols.store(cols, Ordering::SeqCst);
        self.rows.store(rows, Ordering::SeqCst);
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}

/// Spawns the task that drains an already-open `AttachStream` into
/// `channel` until the Host ends it or the connection drops it. The
/// caller is responsible for emitting the leading Resync frame -- this
/// task only ever moves bytes, never writes to the WebSocket itself.
pub fn spawn_reader(session_id: u64, mut stream: AttachStream, channel: Arc<SessionChannel>) -> tokio::task::AbortHandle {
    let handle = tokio::spawn(async move {
        loop {
            match stream.next_frame().await {
                Ok(Some((StreamFrameKind::OutputChunk, bytes))) => channel.push(bytes),
                Ok(Some((StreamFrameKind::Resync, _))) => channel.mark_external_resync(),
                Ok(Some((StreamFrameKind::End, _))) => {
                    channel.closed.store(true, Ordering::SeqCst);
                    break;
                }
                Ok(Some((StreamFrameKind::StateEvent, _))) => {
                    log::warn!("session {session_id:016x}: unexpected StateEvent on an attach stream");
                }
                Ok(None) => {
                    channel.closed.store(true, Ordering::SeqCst);
                    break;
                }
                Err(e) => {
                    log::warn!("session {session_id:016x}: attach stream read failed: {e}");
                    channel.closed.store(true, Ordering::SeqCst);
                    break;
                }
            }
        }
    });
    handle.abort_handle()
}
