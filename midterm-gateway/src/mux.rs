//! The `/ws/mux` binary wire format: `[type:1][session_id:8][payload:N]`.
//!
//! Ten type codes, fixed ahead of time. Decoding matches the type byte
//! exactly once, here, the same discipline the IPC envelope uses in
//! `midterm_core::ipc::protocol`.

use midterm_core::config::dims_in_range;

/// One fully-decoded `/ws/mux` frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MuxFrame {
    /// S→C: raw terminal bytes at the dimensions current when emitted.
    Output { session_id: u64, cols: u16, rows: u16, data: Vec<u8> },
    /// C→S: bytes to write to the PTY.
    Input { session_id: u64, data: Vec<u8> },
    /// C→S: client-driven resize.
    Resize { session_id: u64, cols: u16, rows: u16 },
    /// S→C: client must clear its emulator before reading the Output that follows.
    Resync { session_id: u64 },
    /// C→S: request a full scrollback replay.
    BufferRequest { session_id: u64 },
    /// S→C: gzip-compressed terminal bytes.
    CompressedOutput { session_id: u64, cols: u16, rows: u16, uncompressed_len: u32, gzip: Vec<u8> },
    /// C→S: whether this session is currently visible on screen.
    ActiveHint { session_id: u64, active: bool },
    /// S→C: a JSON exec/exit record.
    ProcessEvent { session_id: u64, json: Vec<u8> },
    /// S→C: JSON current-foreground-info.
    ForegroundChange { session_id: u64, json: Vec<u8> },
}

const TYPE_OUTPUT: u8 = 0x01;
const TYPE_INPUT: u8 = 0x02;
const TYPE_RESIZE: u8 = 0x03;
const TYPE_RESYNC: u8 = 0x05;
const TYPE_BUFFER_REQUEST: u8 = 0x06;
const TYPE_COMPRESSED_OUTPUT: u8 = 0x07;
const TYPE_ACTIVE_HINT: u8 = 0x08;
const TYPE_PROCESS_EVENT: u8 = 0x09;
const TYPE_FOREGROUND_CHANGE: u8 = 0x0A;

/// Error returned for a frame too short or otherwise malformed to decode.
/// On a decode failure the caller drops the frame and logs at warn -- this
/// is never propagated to the client as a protocol-level close.
#[derive(Debug)]
pub struct MuxDecodeError(pub String);

impl std::fmt::Display for MuxDecodeError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

fn bad(msg: impl Into<String>) -> MuxDecodeError {
    MuxDecodeError(msg.into())
}

impl MuxFrame {
    /// Decodes a single binary WebSocket message from the client.
    /// Only the C→S variants are ever returned from here; a type byte
    /// that names an S→C code is itself a protocol error.
    pub fn decode(bytes: &[u8]) -> Result<Self, MuxDecodeError> {
        if bytes.len() < 9 {
            return Err(bad("frame shorter than the 9-byte header"));
        }
        let type_byte = bytes[0];
        let session_id = u64::from_le_bytes(bytes[1..9].try_into().unwrap());
        let payload = &bytes[9..];

        match type_byte {
            TYPE_INPUT => Ok(MuxFrame::Input { session_id, data: payload.to_vec() }),
            TYPE_RESIZE => {
                if payload.len() != 4 {
                    return Err(bad("Resize payload must be 4 bytes"));
                }
                let cols = u16::from_le_bytes([payload[0], payload[1]]);
                let rows = u16::from_le_bytes([payload[2], payload[3]]);
                if !dims_in_range(cols, rows) {
                    return Err(bad(format!("Resize dims out of range: {cols}x{rows}")));
                }
                Ok(MuxFrame::Resize { session_id, cols, rows })
            }
            TYPE_BUFFER_REQUEST => Ok(MuxFrame::BufferRequest { session_id }),
            TYPE_ACTIVE_HINT => {
                if payload.len() != 1 {
                    return Err(bad("ActiveHint payload must be 1 byte"));
                }
                Ok(MuxFrame::ActiveHint { session_id, active: payload[0] == 1 })
            }
            other => Err(bad(format!("unexpected or server-only type code: 0x{other:02x}"))),
        }
    }

    /// Encodes an S→C variant for writing to the WebSocket. Panics if
    /// called on a C→S variant -- those never originate at the Gateway.
    pub fn encode(&self) -> Vec<u8> {
        match self {
            MuxFrame::Output { session_id, cols, rows, data } => {
                let mut out = Vec::with_capacity(9 + 4 + data.len());
                out.push(TYPE_OUTPUT);
                out.extend_from_slice(&session_id.to_le_bytes());
                out.extend_from_slice(&cols.to_le_bytes());
                out.extend_from_slice(&rows.to_le_bytes());
                out.extend_from_slice(data);
                out
            }
            MuxFrame::Resync { session_id } => {
                let mut out = Vec::with_capacity(9);
                out.push(TYPE_RESYNC);
                out.extend_from_slice(&session_id.to_le_bytes());
                out
            }
            MuxFrame::CompressedOutput { session_id, cols, rows, uncompressed_len, gzip } => {
                let mut out = Vec::with_capacity(9 + 8 + gzip.len());
                out.push(TYPE_COMPRESSED_OUTPUT);
                out.extend_from_slice(&session_id.to_le_bytes());
                out.extend_from_slice(&cols.to_le_bytes());
                out.extend_from_slice(&rows.to_le_bytes());
                out.extend_from_slice(&uncompressed_len.to_le_bytes());
                out.extend_from_slice(gzip);
                out
            }
            MuxFrame::ProcessEvent { session_id, json } => {
                let mut out = Vec::with_capacity(9 + json.len());
                out.push(TYPE_PROCESS_EVENT);
                out.extend_from_slice(&session_id.to_le_bytes());
                out.extend_from_slice(json);
                out
            }
            MuxFrame::ForegroundChange { session_id, json } => {
                let mut out = Vec::with_capacity(9 + json.len());
                out.push(TYPE_FOREGROUND_CHANGE);
                out.extend_from_slice(&session_id.to_le_bytes());
                out.extend_from_slice(json);
                out
            }
            MuxFrame::Input { .. } | MuxFrame::Resize { .. } | MuxFrame::BufferRequest { .. } | MuxFrame::ActiveHint { .. } => {
                unreachable!("C->S frame never encoded by the Gateway")
            }
        }
    }
}

/// Builds the `{"type":"Missing","sessionId":…}` ProcessEvent sent when a
/// client's BufferRequest names a session the Host no longer knows about.
pub fn missing_process_event(session_id: u64) -> MuxFrame {
    let json = serde_json::json!({ "type": "Missing", "sessionId": session_id });
    MuxFrame::ProcessEvent { session_id, json: serde_json::to_vec(&json).unwrap_or_default() }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decodes_input_frame() {
        let mut bytes = vec![TYPE_INPUT];
        bytes.extend_from_slice(&7u64.to_le_bytes());
        bytes.extend_from_slice(b"ls -la\n");
        let frame = MuxFrame::decode(&bytes).unwrap();
        assert_eq!(frame, MuxFrame::Input { session_id: 7, data: b"ls -la\n".to_vec() });
    }

    #[test]
    fn decodes_resize_frame() {
        let mut bytes = vec![TYPE_RESIZE];
        bytes.extend_from_slice(&1u64.to_le_bytes());
        bytes.extend_from_slice(&80u16.to_le_bytes());
        bytes.extend_from_slice(&24u16.to_le_bytes());
        let frame = MuxFrame::decode(&bytes).unwrap();
        assert_eq!(frame, MuxFrame::Resize { session_id: 1, cols: 80, rows: 24 });
    }

    #[test]
    fn rejects_out_of_range_resize() {
        let mut bytes = vec![TYPE_RESIZE];
        bytes.extend_from_slice(&1u64.to_le_bytes());
        bytes.extend_from_slice(&0u16.to_le_bytes());
        bytes.extend_from_slice(&24u16.to_le_bytes());
        assert!(MuxFrame::decode(&bytes).is_err());
    }

    #[test]
    fn rejects_short_frame() {
        assert!(MuxFrame::decode(&[0x02, 0, 0]).is_err());
    }

    #[test]
    fn decodes_active_hint() {
        let mut bytes = vec![TYPE_ACTIVE_HINT];
        bytes.extend_from_slice(&3u64.to_le_bytes());
        bytes.push(0u8);
        let frame = MuxFrame::decode(&bytes).unwrap();
        assert_eq!(frame, MuxFrame::ActiveHint { session_id: 3, active: false });
    }

    #[test]
    fn output_frame_round_trips_header() {
        let frame = MuxFrame::Output { session_id: 42, cols: 80, rows: 24, data: b"hi".to_vec() };
        let bytes = frame.encode();
        assert_eq!(bytes[0], TYPE_OUTPUT);
        assert_eq!(u64::from_le_bytes(bytes[1..9].try_into().unwrap()), 42);
        assert_eq!(&bytes[9..13], &[80, 0, 24, 0]);
        assert_eq!(&bytes[13..], b"hi");
    }

    #[test]
    fn missing_event_carries_session_id() {
        let frame = missing_process_event(99);
        if let MuxFrame::ProcessEvent { session_id, json } = frame {
            assert_eq!(session_id, 99);
            let v: serde_json::Value = serde_json::from_slice(&json).unwrap();
            assert_eq!(v["type"], "Missing");
            assert_eq!(v["sessionId"], 99);
        } else {
            panic!("expected ProcessEvent");
        }
    }
}
