//! Per-(Session, client) output subscriber: a bounded queue of output
//! chunks waiting to be framed and sent, with drop-oldest overflow and a
//! sticky loss flag that forces a Resync on the next flush.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use tokio::sync::Notify;

use super::Scrollback;

/// A single queued output chunk.
#[derive(Debug, Clone)]
pub struct Chunk(pub Vec<u8>);

struct Inner {
    queue: VecDeque<Chunk>,
    bytes: usize,
}

/// Bounded by byte count and chunk count (defaults: 4 MiB / 1024 chunks).
/// Overflow drops the oldest chunk and sets `loss`, per the Output
/// subscriber contract in the data model.
pub struct Subscriber {
    inner: Mutex<Inner>,
    byte_cap: usize,
    chunk_cap: usize,
    loss: AtomicBool,
    notify: Notify,
    client_id: String,
    /// The same `Scrollback` the owning Session appends every output chunk
    /// to, kept so a loss can be recovered from Session-wide history
    /// instead of just reported.
    scrollback: Arc<Mutex<Scrollback>>,
    /// Scrollback length, in bytes, as of the last successful `drain()` --
    /// the low-water mark `take_resync_replay` replays from after a drop.
    replay_mark: AtomicU64,
}

impl Subscriber {
    pub fn new(
        client_id: impl Into<String>,
        byte_cap: usize,
        chunk_cap: usize,
        scrollback: Arc<Mutex<Scrollback>>,
        initial_mark: u64,
    ) -> Self {
        Self {
            inner: Mutex::new(Inner {
                queue: VecDeque::new(),
                bytes: 0,
            }),
            byte_cap,
            chunk_cap,
            loss: AtomicBool::new(false),
            notify: Notify::new(),
            client_id: client_id.into(),
            scrollback,
            replay_mark: AtomicU64::new(initial_mark),
        }
    }

    pub fn client_id(&self) -> &str {
        &self.client_id
    }

    /// Enqueues a chunk, dropping the oldest entries first if the byte or
    /// chunk cap would otherwise be exceeded.
    pub fn push(&self, data: &[u8]) {
        if data.is_empty() {
            return;
        }
        let mut inner = self.inner.lock().unwrap();
        inner.queue.push_back(Chunk(data.to_vec()));
        inner.bytes += data.len();

        let mut dropped = false;
        while inner.bytes > self.byte_cap || inner.queue.len() > self.chunk_cap {
            match inner.queue.pop_front() {
                Some(Chunk(dropped_chunk)) => {
                    inner.bytes = inner.bytes.saturating_sub(dropped_chunk.len());
                    dropped = true;
                }
                None => break,
            }
        }
        if dropped {
            self.loss.store(true, Ordering::SeqCst);
        }
        drop(inner);
        self.notify.notify_one();
    }

    /// Drains everything currently queued, in order, and advances the
    /// replay mark to the Scrollback's current length -- whatever was just
    /// drained (possibly nothing) is assumed delivered from here on.
    pub fn drain(&self) -> Vec<Chunk> {
        let mut inner = self.inner.lock().unwrap();
        inner.bytes = 0;
        let out: Vec<Chunk> = inner.queue.drain(..).collect();
        drop(inner);
        if let Ok(sb) = self.scrollback.lock() {
            self.replay_mark.store(sb.len() as u64, Ordering::SeqCst);
        }
        out
    }

    pub fn is_empty(&self) -> bool {
        self.inner.lock().unwrap().queue.is_empty()
    }

    /// Waits until a chunk is available or is cancelled by the caller's
    /// select branch (e.g. a flush timer).
    pub async fn notified(&self) {
        self.notify.notified().await;
    }

    /// Returns and clears the sticky loss flag. The caller (Gateway flush
    /// step) must emit a Resync before the next Output frame whenever this
    /// returns `true`.
    pub fn take_loss(&self) -> bool {
        self.loss.swap(false, Ordering::SeqCst)
    }

    /// Forces the loss flag, used by the Gateway's 200ms backpressure-drop
    /// rule when the outbound WebSocket itself is stalled.
    pub fn force_loss(&self) {
        self.drain();
        self.loss.store(true, Ordering::SeqCst);
    }

    /// Checks for a queue overflow and, if one happened, returns the
    /// Scrollback bytes appended since the replay mark so the caller can
    /// send them as a Resync's catch-up replay. Advances the mark past
    /// whatever is returned, so the same gap is never replayed twice.
    /// Returns `None` when nothing was lost.
    pub fn take_resync_replay(&self) -> Option<Vec<u8>> {
        if !self.take_loss() {
            return None;
        }
        let sb = self.scrollback.lock().unwrap();
        let replay = sb.snapshot_since(self.replay_mark.load(Ordering::SeqCst));
        self.replay_mark.store(sb.len() as u64, Ordering::SeqCst);
        Some(replay)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn empty_scrollback(cap: usize) -> Arc<Mutex<Scrollback>> {
        Arc::new(Mutex::new(Scrollback::new(cap)))
    }

    #[test]
    fn drop_oldest_sets_loss_flag() {
        let sub = Subscriber::new("c1", 8, 100, empty_scrollback(1024), 0);
        sub.push(b"12345");
        sub.push(b"6789");
        assert!(sub.take_loss());
        let remaining: usize = sub.drain().iter().map(|c| c.0.len()).sum();
        assert!(remaining <= 8);
    }

    #[test]
    fn chunk_cap_evicts_oldest() {
        let sub = Subscriber::new("c1", 1_000_000, 2, empty_scrollback(1024), 0);
        sub.push(b"a");
        sub.push(b"b");
        sub.push(b"c");
        assert!(sub.take_loss());
        let chunks = sub.drain();
        assert_eq!(chunks.len(), 2);
        assert_eq!(chunks[0].0, b"b");
        assert_eq!(chunks[1].0, b"c");
    }

    #[test]
    fn take_resync_replay_is_none_without_loss() {
        let sub = Subscriber::new("c1", 1_000_000, 100, empty_scrollback(1024), 0);
        sub.push(b"hello");
        assert!(sub.take_resync_replay().is_none());
    }

    #[test]
    fn take_resync_replay_recovers_from_scrollback_after_overflow() {
        let scrollback = empty_scrollback(1024);
        // Mirrors what `Session::on_output_chunk` does: every byte delivered
        // to the subscriber is also appended to the shared Scrollback.
        scrollback.lock().unwrap().append(b"12345");
        scrollback.lock().unwrap().append(b"6789");
        let sub = Subscriber::new("c1", 8, 100, scrollback, 0);
        sub.push(b"12345");
        sub.push(b"6789"); // overflows the 8-byte cap, drops "12345", sets loss

        let replay = sub.take_resync_replay();
        assert_eq!(replay, Some(b"123456789".to_vec()));

        // The mark has advanced past what was just replayed, so a second
        // call with nothing new lost returns None rather than replaying
        // the same bytes again.
        assert!(sub.take_resync_replay().is_none());
    }
}
