//! Client side of the local IPC transport: dials `midterm-host`, sends one
//! JSON request per connection, and decodes the response. `session.attach`
//! and `state.subscribe` open a dedicated connection each, since the Host
//! permanently switches a connection into streaming mode and never
//! returns it to request/response use (mirrors `midterm-host`'s own
//! `ipc::server::handle_connection`).
//!
//! `midterm-gateway` never touches a `Session` or a `Pty` directly -- the
//! Mux Gateway only ever holds a weak `id -> Session` reference through
//! the Host's ownership rule.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use serde_json::Value;

use midterm_core::ipc::framing::{read_json_frame, read_stream_frame, write_json_frame, StreamFrameKind};
use midterm_core::CoreError;

#[cfg(unix)]
type ConnStream = tokio::net::UnixStream;
#[cfg(windows)]
type ConnStream = tokio::net::windows::named_pipe::NamedPipeClient;

/// One dial of the local IPC endpoint, cheaply cloneable so every
/// connection handler in the Gateway can hold its own.
#[derive(Clone)]
pub struct HostClient {
    endpoint: String,
    next_request_id: Arc<AtomicU64>,
}

impl HostClient {
    pub fn new(endpoint: String) -> Self {
        Self { endpoint, next_request_id: Arc::new(AtomicU64::new(1)) }
    }

    fn next_id(&self) -> String {
        format!("{:016x}", self.next_request_id.fetch_add(1, Ordering::SeqCst))
    }

    async fn dial(&self) -> Result<ConnStream, CoreError> {
        #[cfg(unix)]
        {
            tokio::net::UnixStream::connect(&self.endpoint)
                .await
                .map_err(|e| CoreError::ipc(format!("connect {}: {e}", self.endpoint)))
        }
        #[cfg(windows)]
        {
            tokio::net::windows::named_pipe::ClientOptions::new()
                .open(&self.endpoint)
                .map_err(|e| CoreError::ipc(format!("connect {}: {e}", self.endpoint)))
        }
    }

    async fn send_request(&self, stream: &mut ConnStream, command: &str, payload: Value) -> Result<(), CoreError> {
        let env = serde_json::json!({ "command": command, "id": self.next_id(), "payload": payload });
        let body = serde_json::to_vec(&env).map_err(|e| CoreError::protocol(e.to_string()))?;
        write_json_frame(stream, &body).await
    }

    async fn read_response(&self, stream: &mut ConnStream) -> Result<Value, CoreError> {
        let body = read_json_frame(stream).await?.ok_or_else(|| CoreError::ipc("host closed connection before responding"))?;
        serde_json::from_slice(&body).map_err(|e| CoreError::protocol(format!("malformed response envelope: {e}")))
    }

    /// One request/response round trip over a fresh connection.
    pub async fn call(&self, command: &str, payload: Value) -> Result<Value, CoreError> {
        let mut stream = self.dial().await?;
        self.send_request(&mut stream, command, payload).await?;
        let resp = self.read_response(&mut stream).await?;
        if resp.get("ok").and_then(Value::as_bool).unwrap_or(false) {
            Ok(resp.get("data").cloned().unwrap_or(Value::Null))
        } else {
            let err = resp.get("error").cloned().unwrap_or(Value::Null);
            Err(CoreError::ipc(format!("{command} rejected: {err}")))
        }
    }

    /// Opens a dedicated streaming connection and attaches to a session's
    /// output. Fails with `SessionNotFound` if the Host doesn't know the id.
    pub async fn attach(&self, id: u64, client_id: &str) -> Result<AttachStream, CoreError> {
        let mut stream = self.dial().await?;
        self.send_request(&mut stream, "session.attach", serde_json::json!({ "id": id, "client_id": client_id })).await?;
        let ack = self.read_response(&mut stream).await?;
        if !ack.get("ok").and_then(Value::as_bool).unwrap_or(false) {
            return Err(CoreError::session_not_found(id));
        }
        Ok(AttachStream { stream })
    }

    /// Opens a dedicated streaming connection carrying `HostEvent`s.
    pub async fn subscribe_state(&self) -> Result<StateStream, CoreError> {
        let mut stream = self.dial().await?;
        self.send_request(&mut stream, "state.subscribe", Value::Object(Default::default())).await?;
        let _ack = self.read_response(&mut stream).await?;
        Ok(StateStream { stream })
    }
}

/// The live half of a `session.attach` connection: scrollback replay
/// followed by output chunks, then a terminal `End` once the Host removes
/// the session.
pub struct AttachStream {
    stream: ConnStream,
}

impl AttachStream {
    /// Reads the next stream frame. `Ok(None)` on a clean Host-side close.
    pub async fn next_frame(&mut self) -> Result<Option<(StreamFrameKind, Vec<u8>)>, CoreError> {
        read_stream_frame(&mut self.stream).await
    }
}

/// The live half of a `state.subscribe` connection: one JSON `HostEvent`
/// per frame.
pub struct StateStream {
    stream: ConnStream,
}

impl StateStream {
    pub async fn next_event(&mut self) -> Result<Option<Value>, CoreError> {
        match read_stream_frame(&mut self.stream).await? {
            Some((StreamFrameKind::StateEvent, payload)) => {
                let v = serde_json::from_slice(&payload).map_err(|e| CoreError::protocol(format!("bad state event: {e}")))?;
                Ok(Some(v))
            }
            Some((other, _)) => Err(CoreError::protocol(format!("unexpected stream frame kind on state.subscribe: {other:?}"))),
            None => Ok(None),
        }
    }
}
