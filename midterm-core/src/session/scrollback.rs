//! Bounded byte ring holding the most recent PTY output, used to
//! resynchronize reconnecting clients.

use std::collections::VecDeque;

/// Raw terminal-emulator bytes, not decoded text. Grows append-only; on
/// overflow the oldest bytes are dropped at a UTF-8-safe boundary so a
/// client never sees a buffer that starts mid-codepoint.
pub struct Scrollback {
    buf: VecDeque<u8>,
    cap: usize,
}

impl Scrollback {
    pub fn new(cap: usize) -> Self {
        Self {
            buf: VecDeque::with_capacity(cap.min(64 * 1024)),
            cap,
        }
    }

    pub fn cap(&self) -> usize {
        self.cap
    }

    pub fn len(&self) -> usize {
        self.buf.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    /// Appends a chunk and trims from the front if the buffer now exceeds
    /// its cap, always trimming at a UTF-8 character boundary.
    pub fn append(&mut self, chunk: &[u8]) {
        self.buf.extend(chunk.iter().copied());
        if self.buf.len() > self.cap {
            let excess = self.buf.len() - self.cap;
            let drop_to = find_utf8_boundary(&self.buf, excess);
            self.buf.drain(..drop_to);
        }
    }

    /// Copies the full contents out. Used by Gateway replay; the scrollback
    /// lock is released before the copy is sent anywhere.
    pub fn snapshot(&self) -> Vec<u8> {
        self.buf.iter().copied().collect()
    }

    /// Copies everything appended at or after `since_len` bytes were
    /// already in the buffer, measured against the buffer's current total
    /// length. Used for the post-resync replay window.
    pub fn snapshot_since(&self, since_total_len: u64) -> Vec<u8> {
        let total = self.buf.len() as u64;
        if since_total_len >= total {
            return Vec::new();
        }
        let skip = (total - since_total_len.min(total)) as usize;
        // since_total_len counts bytes retained at the time of the mark;
        // anything older than the current window has already been dropped.
        let start = self.buf.len().saturating_sub(skip);
        self.buf.iter().skip(start).copied().collect()
    }
}

/// Finds the smallest index `>= min_drop` in `buf` that lies on a UTF-8
/// character boundary (i.e. the byte at that index is not a continuation
/// byte `0b10xxxxxx`), so draining `[0, index)` never splits a codepoint.
fn find_utf8_boundary(buf: &VecDeque<u8>, min_drop: usize) -> usize {
    let len = buf.len();
    let mut idx = min_drop.min(len);
    while idx < len && is_continuation_byte(buf[idx]) {
        idx += 1;
    }
    idx
}

fn is_continuation_byte(b: u8) -> bool {
    b & 0b1100_0000 == 0b1000_0000
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn appends_without_exceeding_cap() {
        let mut sb = Scrollback::new(10);
        sb.append(b"hello");
        sb.append(b"world!");
        assert!(sb.len() <= 10);
    }

    #[test]
    fn trims_at_utf8_boundary() {
        let mut sb = Scrollback::new(4);
        // 'é' is 2 bytes (0xC3 0xA9); force an overflow that would
        // otherwise split it.
        sb.append("héllo".as_bytes());
        let snap = sb.snapshot();
        assert!(std::str::from_utf8(&snap).is_ok());
    }

    #[test]
    fn snapshot_since_returns_only_new_bytes() {
        let mut sb = Scrollback::new(1024);
        sb.append(b"abc");
        let mark = sb.len() as u64;
        sb.append(b"def");
        let suffix = sb.snapshot_since(mark);
        assert_eq!(suffix, b"def");
    }
}
