//! Per-connection request dispatch: decodes `RequestEnvelope`s, routes
//! non-streaming commands through a bounded worker pool (so a slow
//! `session.list` cannot block `session.write`), and
//! switches a connection into the streaming binary protocol for
//! `session.attach` / `state.subscribe`.

use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::Semaphore;

use midterm_core::ipc::framing::{
    read_json_frame, read_stream_frame, write_json_frame, write_stream_frame, StreamFrameKind,
};
use midterm_core::ipc::protocol::{self, Command, RequestEnvelope, ResponseEnvelope};
use midterm_core::{CoreError, HostCore, HostEvent};

/// Drives one IPC connection end to end. Generic over the transport so
/// the same logic serves a `UnixStream` and a Windows `NamedPipeServer`.
pub async fn handle_connection<S>(stream: S, host: Arc<HostCore>, workers: Arc<Semaphore>)
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let (mut reader, mut writer) = tokio::io::split(stream);

    loop {
        let body = match read_json_frame(&mut reader).await {
            Ok(Some(b)) => b,
            Ok(None) => return,
            Err(e) => {
                log::warn!("ipc: frame read failed: {e}");
                return;
            }
        };

        let env: RequestEnvelope = match serde_json::from_slice(&body) {
            Ok(e) => e,
            Err(e) => {
                log::warn!("ipc: malformed envelope: {e}");
                continue;
            }
        };
        let request_id = env.id.clone();

        let command = match protocol::decode(&env) {
            Ok(c) => c,
            Err(e) => {
                let resp = ResponseEnvelope::err(request_id, &e);
                let _ = write_json_frame(&mut writer, &serde_json::to_vec(&resp).unwrap()).await;
                continue;
            }
        };

        match command {
            Command::SessionAttach { id, client_id } => {
                let ack = attach_ack(&host, id);
                let resp = match &ack {
                    Ok(()) => ResponseEnvelope::ok_empty(request_id),
                    Err(e) => ResponseEnvelope::err(request_id, e),
                };
                if write_json_frame(&mut writer, &serde_json::to_vec(&resp).unwrap()).await.is_err() {
                    return;
                }
                if ack.is_ok() {
                    stream_attach(&host, id, &client_id, &mut reader, &mut writer).await;
                }
                return;
            }
            Command::StateSubscribe => {
                let resp = ResponseEnvelope::ok_empty(request_id);
                if write_json_frame(&mut writer, &serde_json::to_vec(&resp).unwrap()).await.is_err() {
                    return;
                }
                stream_state(&host, &mut reader, &mut writer).await;
                return;
            }
            other => {
                let permit = workers.clone().acquire_owned().await;
                let resp = match permit {
                    Ok(_permit) => dispatch(&host, other, request_id.clone()).await,
                    Err(_) => ResponseEnvelope::err(request_id.clone(), &CoreError::ipc("worker pool closed")),
                };
                if write_json_frame(&mut writer, &serde_json::to_vec(&resp).unwrap()).await.is_err() {
                    return;
                }
            }
        }
    }
}

fn attach_ack(host: &Arc<HostCore>, id: u64) -> Result<(), CoreError> {
    if host.get(id).is_some() {
        Ok(())
    } else {
        Err(CoreError::session_not_found(id))
    }
}

/// Dispatches every non-streaming command against `HostCore`, mapping the
/// result into a response envelope. Never lets a `CoreError` propagate
/// out of this function -- "IPC handlers convert every
/// caught error to `ok=false`" rule.
async fn dispatch(host: &Arc<HostCore>, command: Command, request_id: String) -> ResponseEnvelope {
    match command {
        Command::SessionList => {
            let list = host.list();
            ResponseEnvelope::ok(request_id, serde_json::json!({ "sessions": list }))
        }
        Command::SessionCreate(req) => match host.create_session(req).await {
            Ok(id) => ResponseEnvelope::ok(request_id, protocol::session_id_payload(id)),
            Err(e) => ResponseEnvelope::err(request_id, &e),
        },
        Command::SessionClose { id } => match host.close_session(id).await {
            Ok(()) => ResponseEnvelope::ok_empty(request_id),
            Err(e) => ResponseEnvelope::err(request_id, &e),
        },
        Command::SessionResize { id, cols, rows } => match host.resize_session(id, cols, rows) {
            Ok(()) => ResponseEnvelope::ok_empty(request_id),
            Err(e) => ResponseEnvelope::err(request_id, &e),
        },
        Command::SessionRename { id, name, auto } => match host.rename_session(id, name, auto) {
            Ok(()) => ResponseEnvelope::ok_empty(request_id),
            Err(e) => ResponseEnvelope::err(request_id, &e),
        },
        Command::SessionWrite { id, bytes } => match host.write_session(id, bytes) {
            Ok(()) => ResponseEnvelope::ok_empty(request_id),
            Err(e) => ResponseEnvelope::err(request_id, &e),
        },
        Command::HostShutdown { grace_ms } => {
            let host = host.clone();
            let grace = Duration::from_millis(grace_ms.max(1));
            tokio::spawn(async move {
                host.shutdown(grace).await;
                std::process::exit(0);
            });
            ResponseEnvelope::ok_empty(request_id)
        }
        Command::SessionAttach { .. } | Command::StateSubscribe => unreachable!("handled by caller"),
    }
}

/// `session.attach`'s streaming body: replay the scrollback captured at
/// subscribe time, then forward live chunks, watching the read half only
/// to notice the peer hanging up.
async fn stream_attach<R, W>(host: &Arc<HostCore>, id: u64, client_id: &str, reader: &mut R, writer: &mut W)
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let subscription = match host.attach(id, client_id) {
        Ok(s) => s,
        Err(_) => return,
    };

    if !subscription.initial_scrollback.is_empty() {
        if write_stream_frame(writer, StreamFrameKind::OutputChunk, &subscription.initial_scrollback).await.is_err() {
            host.detach(id, client_id);
            return;
        }
    }

    let mut disconnected = false;
    loop {
        if subscription.subscriber.is_empty() {
            tokio::select! {
                _ = subscription.subscriber.notified() => {}
                r = read_stream_frame(reader) => {
                    if r.is_err() || matches!(r, Ok(None)) {
                        disconnected = true;
                    }
                }
                _ = tokio::time::sleep(Duration::from_millis(500)) => {}
            }
        }
        if disconnected {
            break;
        }

        // A subscriber-queue overflow means the client missed bytes the
        // Host already delivered onward; announce a Resync and replay the
        // scrollback window since the last delivered point before resuming
        // live output, so the client never sees a gap with no Resync.
        if let Some(replay) = subscription.subscriber.take_resync_replay() {
            if write_stream_frame(writer, StreamFrameKind::Resync, &[]).await.is_err() {
                disconnected = true;
                break;
            }
            if !replay.is_empty() && write_stream_frame(writer, StreamFrameKind::OutputChunk, &replay).await.is_err() {
                disconnected = true;
                break;
            }
        }

        for chunk in subscription.subscriber.drain() {
            if write_stream_frame(writer, StreamFrameKind::OutputChunk, &chunk.0).await.is_err() {
                disconnected = true;
                break;
            }
        }
        if disconnected {
            break;
        }
        if host.get(id).is_none() {
            let _ = write_stream_frame(writer, StreamFrameKind::End, &[]).await;
            break;
        }
    }
    host.detach(id, client_id);
}

/// `state.subscribe`'s streaming body: forwards every `HostEvent` as a
/// JSON `StateEvent` frame until the peer disconnects.
async fn stream_state<R, W>(host: &Arc<HostCore>, reader: &mut R, writer: &mut W)
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut rx = host.subscribe_state();
    loop {
        tokio::select! {
            event = rx.recv() => {
                let event: HostEvent = match event {
                    Ok(e) => e,
                    Err(tokio::sync::broadcast::error::RecvError::Lagged(_)) => continue,
                    Err(_) => break,
                };
                let json: Value = match serde_json::to_value(&event) {
                    Ok(v) => v,
                    Err(_) => continue,
                };
                let bytes = match serde_json::to_vec(&json) {
                    Ok(b) => b,
                    Err(_) => continue,
                };
                if write_stream_frame(writer, StreamFrameKind::StateEvent, &bytes).await.is_err() {
                    break;
                }
            }
            r = read_stream_frame(reader) => {
                if r.is_err() || matches!(r, Ok(None)) {
                    break;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use midterm_core::config::HostConfig;
    use tokio::net::UnixStream;

    /// Spins up a real `handle_connection` loop over a `UnixListener` bound
    /// to a tempdir path, the same "real socket, no mocks" approach the
    /// status server's own tests use for its HTTP listener.
    async fn start_test_server() -> (std::path::PathBuf, tempfile::TempDir) {
        let _ = env_logger::try_init();
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("test.sock");
        let listener = crate::ipc::transport::unix::bind(path.to_str().unwrap()).unwrap();
        let host = HostCore::new(HostConfig::default());
        let workers = Arc::new(Semaphore::new(4));
        tokio::spawn(async move {
            loop {
                let Ok(stream) = crate::ipc::transport::unix::accept(&listener).await else { break };
                let host = host.clone();
                let workers = workers.clone();
                tokio::spawn(handle_connection(stream, host, workers));
            }
        });
        (path, dir)
    }

    async fn call(stream: &mut UnixStream, command: &str, id: &str, payload: Value) -> Value {
        let env = serde_json::json!({ "command": command, "id": id, "payload": payload });
        write_json_frame(stream, &serde_json::to_vec(&env).unwrap()).await.unwrap();
        let body = read_json_frame(stream).await.unwrap().unwrap();
        serde_json::from_slice(&body).unwrap()
    }

    #[tokio::test]
    async fn session_list_on_empty_host_returns_empty_array() {
        let (path, _dir) = start_test_server().await;
        let mut stream = UnixStream::connect(&path).await.unwrap();
        let resp = call(&mut stream, "session.list", "1", Value::Null).await;
        assert_eq!(resp["ok"], true);
        assert_eq!(resp["data"]["sessions"], serde_json::json!([]));
    }

    #[tokio::test]
    async fn session_close_on_unknown_id_returns_error_envelope() {
        let (path, _dir) = start_test_server().await;
        let mut stream = UnixStream::connect(&path).await.unwrap();
        let resp = call(&mut stream, "session.close", "1", serde_json::json!({ "id": 99 })).await;
        assert_eq!(resp["ok"], false);
        assert_eq!(resp["error"]["kind"], "session_not_found");
    }

    #[tokio::test]
    async fn malformed_command_name_is_rejected_without_killing_the_connection() {
        let (path, _dir) = start_test_server().await;
        let mut stream = UnixStream::connect(&path).await.unwrap();
        let resp = call(&mut stream, "no.such.command", "1", Value::Null).await;
        assert_eq!(resp["ok"], false);

        // The connection is still usable for a well-formed request afterward.
        let resp = call(&mut stream, "session.list", "2", Value::Null).await;
        assert_eq!(resp["ok"], true);
    }

    #[tokio::test]
    async fn session_attach_on_unknown_id_is_rejected_before_streaming() {
        let (path, _dir) = start_test_server().await;
        let mut stream = UnixStream::connect(&path).await.unwrap();
        let resp = call(&mut stream, "session.attach", "1", serde_json::json!({ "id": 42, "client_id": "tab-1" })).await;
        assert_eq!(resp["ok"], false);
        assert_eq!(resp["error"]["kind"], "session_not_found");
    }
}
