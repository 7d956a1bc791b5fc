//! Length-prefixed framing shared by every IPC connection, regardless of
//! whether the byte pipe underneath is a Unix domain socket or a Windows
//! named pipe.
//!
//! Two frame shapes:
//! - request/response: `[len:4 LE][JSON bytes]`
//! - streaming (`session.attach`, `state.subscribe`): `[len:4 LE][type:1][payload]`

use tokio::io::{AsyncReadExt, AsyncWriteExt};

use crate::error::CoreError;

/// Streaming-frame type byte for `session.attach`/`state.subscribe`
/// connections. Distinct from the mux wire's own type codes (§4.5) --
/// this is the IPC transport's framing, one layer further down.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum StreamFrameKind {
    /// Raw scrollback replay or live output bytes (`session.attach`).
    OutputChunk = 0x01,
    /// A `HostEvent`, JSON-encoded (`state.subscribe`).
    StateEvent = 0x02,
    /// Sent once, immediately before the stream closes normally.
    End = 0x03,
    /// The Host's subscriber queue overflowed: the Gateway must treat the
    /// next `OutputChunk` as a Resync replay rather than a live
    /// continuation, same as its own WebSocket backpressure drop does.
    Resync = 0x04,
}

impl StreamFrameKind {
    fn from_byte(b: u8) -> Option<Self> {
        match b {
            0x01 => Some(Self::OutputChunk),
            0x02 => Some(Self::StateEvent),
            0x03 => Some(Self::End),
            0x04 => Some(Self::Resync),
            _ => None,
        }
    }
}

const MAX_FRAME_LEN: u32 = 64 * 1024 * 1024;

/// Reads one length-prefixed JSON frame. Returns `Ok(None)` on a clean
/// EOF between frames (i.e. the peer closed after flushing everything).
pub async fn read_json_frame<R: tokio::io::AsyncRead + Unpin>(r: &mut R) -> Result<Option<Vec<u8>>, CoreError> {
    let mut len_buf = [0u8; 4];
    match r.read_exact(&mut len_buf).await {
        Ok(_) => {}
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(CoreError::ipc(format!("frame header read failed: {e}"))),
    }
    let len = u32::from_le_bytes(len_buf);
    if len > MAX_FRAME_LEN {
        return Err(CoreError::protocol(format!("frame too large: {len} bytes")));
    }
    let mut body = vec![0u8; len as usize];
    r.read_exact(&mut body).await.map_err(|e| CoreError::ipc(format!("frame body read failed: {e}")))?;
    Ok(Some(body))
}

pub async fn write_json_frame<W: tokio::io::AsyncWrite + Unpin>(w: &mut W, body: &[u8]) -> Result<(), CoreError> {
    let len = (body.len() as u32).to_le_bytes();
    w.write_all(&len).await.map_err(|e| CoreError::ipc(e.to_string()))?;
    w.write_all(body).await.map_err(|e| CoreError::ipc(e.to_string()))?;
    w.flush().await.map_err(|e| CoreError::ipc(e.to_string()))
}

/// Writes one streaming frame: `[len:4 LE][type:1][payload]`, where `len`
/// counts the type byte plus the payload.
pub async fn write_stream_frame<W: tokio::io::AsyncWrite + Unpin>(
    w: &mut W,
    kind: StreamFrameKind,
    payload: &[u8],
) -> Result<(), CoreError> {
    let len = (payload.len() as u32 + 1).to_le_bytes();
    w.write_all(&len).await.map_err(|e| CoreError::ipc(e.to_string()))?;
    w.write_all(&[kind as u8]).await.map_err(|e| CoreError::ipc(e.to_string()))?;
    w.write_all(payload).await.map_err(|e| CoreError::ipc(e.to_string()))?;
    w.flush().await.map_err(|e| CoreError::ipc(e.to_string()))
}

/// Reads one streaming frame, returning its kind and payload. `Ok(None)`
/// on clean EOF.
pub async fn read_stream_frame<R: tokio::io::AsyncRead + Unpin>(
    r: &mut R,
) -> Result<Option<(StreamFrameKind, Vec<u8>)>, CoreError> {
    let mut len_buf = [0u8; 4];
    match r.read_exact(&mut len_buf).await {
        Ok(_) => {}
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(CoreError::ipc(format!("frame header read failed: {e}"))),
    }
    let len = u32::from_le_bytes(len_buf);
    if len == 0 || len > MAX_FRAME_LEN {
        return Err(CoreError::protocol(format!("invalid stream frame length: {len}")));
    }
    let mut body = vec![0u8; len as usize];
    r.read_exact(&mut body).await.map_err(|e| CoreError::ipc(format!("frame body read failed: {e}")))?;
    let kind = StreamFrameKind::from_byte(body[0]).ok_or_else(|| CoreError::protocol("bad stream frame type"))?;
    Ok(Some((kind, body[1..].to_vec())))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn json_frame_round_trips() {
        let mut buf = Vec::new();
        write_json_frame(&mut buf, b"{\"a\":1}").await.unwrap();
        let mut cursor = std::io::Cursor::new(buf);
        let body = read_json_frame(&mut cursor).await.unwrap().unwrap();
        assert_eq!(body, b"{\"a\":1}");
    }

    #[tokio::test]
    async fn stream_frame_round_trips() {
        let mut buf = Vec::new();
        write_stream_frame(&mut buf, StreamFrameKind::OutputChunk, b"hello").await.unwrap();
        let mut cursor = std::io::Cursor::new(buf);
        let (kind, payload) = read_stream_frame(&mut cursor).await.unwrap().unwrap();
        assert_eq!(kind, StreamFrameKind::OutputChunk);
        assert_eq!(payload, b"hello");
    }

    #[tokio::test]
    async fn clean_eof_yields_none() {
        let mut cursor = std::io::Cursor::new(Vec::<u8>::new());
        assert!(read_json_frame(&mut cursor).await.unwrap().is_none());
    }
}
