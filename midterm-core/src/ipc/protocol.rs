//! The JSON request/response envelope carried over the local IPC
//! transport, and the tagged `Command` variants it can discriminate on.
//!
//! Per "dynamic JSON message discrimination" hazard: the
//! command name is matched exactly once, here, into this enum. Nothing
//! downstream ever re-inspects a raw `serde_json::Value` for a command
//! name or session id.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::host::CreateSessionRequest;

/// `{ "command": string, "id": string, "payload": object }`
#[derive(Debug, Deserialize)]
pub struct RequestEnvelope {
    pub command: String,
    pub id: String,
    #[serde(default)]
    pub payload: Value,
}

/// `{ "id": string, "ok": bool, "data": object?, "error": string? }`
#[derive(Debug, Serialize)]
pub struct ResponseEnvelope {
    pub id: String,
    pub ok: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<Value>,
}

impl ResponseEnvelope {
    pub fn ok(id: String, data: Value) -> Self {
        Self { id, ok: true, data: Some(data), error: None }
    }

    pub fn ok_empty(id: String) -> Self {
        Self { id, ok: true, data: None, error: None }
    }

    pub fn err(id: String, error: &crate::error::CoreError) -> Self {
        Self {
            id,
            ok: false,
            data: None,
            error: Some(serde_json::to_value(error).unwrap_or_else(|_| Value::String(error.to_string()))),
        }
    }
}

/// One fully-decoded command, the product of matching `RequestEnvelope::command`
/// exactly once and deserializing `payload` into the matching request shape.
#[derive(Debug)]
pub enum Command {
    SessionList,
    SessionCreate(CreateSessionRequest),
    SessionClose { id: u64 },
    SessionResize { id: u64, cols: u16, rows: u16 },
    SessionRename { id: u64, name: Option<String>, auto: bool },
    SessionWrite { id: u64, bytes: Vec<u8> },
    SessionAttach { id: u64, client_id: String },
    StateSubscribe,
    HostShutdown { grace_ms: u64 },
}

#[derive(Debug, Deserialize)]
struct IdPayload {
    id: u64,
}

#[derive(Debug, Deserialize)]
struct ResizePayload {
    id: u64,
    cols: u16,
    rows: u16,
}

#[derive(Debug, Deserialize)]
struct RenamePayload {
    id: u64,
    name: Option<String>,
    #[serde(default)]
    auto: bool,
}

#[derive(Debug, Deserialize)]
struct WritePayload {
    id: u64,
    /// Base64-encoded bytes; the output path in §4.5 is binary, this JSON
    /// channel is not.
    bytes: String,
}

#[derive(Debug, Deserialize)]
struct AttachPayload {
    id: u64,
    client_id: String,
}

#[derive(Debug, Deserialize, Default)]
struct ShutdownPayload {
    #[serde(default)]
    grace_ms: u64,
}

/// Decodes a `RequestEnvelope` into a `Command`, or a `ProtocolError`-kind
/// `CoreError` if the command name is unknown or the payload doesn't match.
pub fn decode(env: &RequestEnvelope) -> Result<Command, crate::error::CoreError> {
    use crate::error::CoreError;

    let bad_payload = |e: serde_json::Error| CoreError::protocol(format!("bad payload: {e}"));

    Ok(match env.command.as_str() {
        "session.list" => Command::SessionList,
        "session.create" => {
            let req: CreateSessionRequest = serde_json::from_value(env.payload.clone()).map_err(bad_payload)?;
            Command::SessionCreate(req)
        }
        "session.close" => {
            let p: IdPayload = serde_json::from_value(env.payload.clone()).map_err(bad_payload)?;
            Command::SessionClose { id: p.id }
        }
        "session.resize" => {
            let p: ResizePayload = serde_json::from_value(env.payload.clone()).map_err(bad_payload)?;
            Command::SessionResize { id: p.id, cols: p.cols, rows: p.rows }
        }
        "session.rename" => {
            let p: RenamePayload = serde_json::from_value(env.payload.clone()).map_err(bad_payload)?;
            Command::SessionRename { id: p.id, name: p.name, auto: p.auto }
        }
        "session.write" => {
            let p: WritePayload = serde_json::from_value(env.payload.clone()).map_err(bad_payload)?;
            let bytes = base64_decode(&p.bytes).map_err(|e| CoreError::protocol(format!("bad base64: {e}")))?;
            Command::SessionWrite { id: p.id, bytes }
        }
        "session.attach" => {
            let p: AttachPayload = serde_json::from_value(env.payload.clone()).map_err(bad_payload)?;
            Command::SessionAttach { id: p.id, client_id: p.client_id }
        }
        "state.subscribe" => Command::StateSubscribe,
        "host.shutdown" => {
            let p: ShutdownPayload = serde_json::from_value(env.payload.clone()).unwrap_or_default();
            Command::HostShutdown { grace_ms: p.grace_ms }
        }
        other => return Err(CoreError::protocol(format!("unknown command: {other}"))),
    })
}

fn base64_decode(s: &str) -> Result<Vec<u8>, base64::DecodeError> {
    use base64::Engine;
    base64::engine::general_purpose::STANDARD.decode(s)
}

/// Helper for encoding `session.create`'s success payload.
pub fn session_id_payload(id: u64) -> Value {
    serde_json::json!({ "id": format!("{id:016x}"), "raw_id": id })
}

/// The 16-hex-char display form used in logs and in `session.create`'s
/// success payload -- ids here are 64-bit, so this is 16 hex chars rather
/// than the 8 a 32-bit id would need.
pub fn format_session_id(id: u64) -> String {
    format!("{id:016x}")
}
