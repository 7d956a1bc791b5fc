//! The `/ws/mux` per-connection state machine: `Connecting -> Authenticated
//! -> Ready -> Closing`. One connection carries any number
//! of attached Sessions; task topology matches §5: one inbound task
//! (decode+dispatch), one outbound task (coalesce+compress+write), one
//! state-relay task (forwards ProcessEvent/ForegroundChange), and one
//! short-lived attach task per currently-attached Session.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use axum::extract::ws::{CloseFrame, Message, WebSocket};
use futures::stream::{SplitSink, SplitStream};
use futures::{SinkExt, StreamExt};
use tokio::sync::mpsc;

use midterm_core::config::dims_in_range;

use crate::compress::maybe_compress;
use crate::ipc_client::HostClient;
use crate::mux::{missing_process_event, MuxFrame};
use crate::session_channel::SessionChannel;

/// Close code for a missing/invalid auth cookie at upgrade time.
pub const AUTH_REJECTED_CLOSE_CODE: u16 = 4401;
/// Close code used when a decoded frame violates the wire contract badly
/// enough that the connection itself cannot continue.
pub const PROTOCOL_ERROR_CLOSE_CODE: u16 = 1002;

/// Active flush interval: 16ms for foreground sessions.
const ACTIVE_FLUSH_INTERVAL: Duration = Duration::from_millis(16);
/// Relaxed flush interval for sessions the client marked inactive.
const INACTIVE_FLUSH_INTERVAL: Duration = Duration::from_millis(250);
/// Coalescing byte threshold: flush early once this much is queued.
const COALESCE_BYTE_THRESHOLD: usize = 64 * 1024;
/// Gzip threshold: payloads at or above this size are compressed.
const COMPRESS_THRESHOLD: usize = 1024;
/// How long the writer task tolerates a full outgoing queue before the
/// affected session is dropped and resynced.
const BACKPRESSURE_TIMEOUT: Duration = Duration::from_millis(200);
/// How often the outbound loop re-checks every session's flush deadline.
const SCHEDULER_TICK: Duration = Duration::from_millis(8);

struct SessionEntry {
    channel: Arc<SessionChannel>,
    attach_handle: tokio::task::AbortHandle,
}

/// State for one `/ws/mux` connection, alive for as long as the socket is.
struct MuxConnection {
    host: HostClient,
    client_id: String,
    sessions: Mutex<HashMap<u64, SessionEntry>>,
    closing: AtomicBool,
}

impl Drop for MuxConnection {
    fn drop(&mut self) {
        // Cancels every attach task for this connection; the underlying
        // Sessions are untouched (cancellation rule -- a
        // second client may reattach and continue).
        for (_, entry) in self.sessions.lock().unwrap().drain() {
            entry.attach_handle.abort();
        }
    }
}

pub fn close_frame(code: u16, reason: &'static str) -> Message {
    Message::Close(Some(CloseFrame { code, reason: reason.into() }))
}

/// Drives one authenticated `/ws/mux` connection to completion. The
/// caller has already validated the auth cookie before upgrading.
pub async fn run(socket: WebSocket, host: HostClient, client_id: String) {
    let (ws_tx, ws_rx) = socket.split();
    let (out_tx, out_rx) = mpsc::channel::<Message>(256);

    let writer_task = tokio::spawn(writer_loop(ws_tx, out_rx));

    let conn = Arc::new(MuxConnection {
        host: host.clone(),
        client_id: client_id.clone(),
        sessions: Mutex::new(HashMap::new()),
        closing: AtomicBool::new(false),
    });
    let flush_task = tokio::spawn(outbound_flush_loop(conn.clone(), out_tx.clone()));
    let state_task = tokio::spawn(state_relay_loop(conn.clone(), host, out_tx.clone()));

    inbound_loop(conn.clone(), ws_rx, out_tx.clone()).await;

    conn.closing.store(true, Ordering::SeqCst);
    flush_task.abort();
    state_task.abort();
    drop(out_tx);
    let _ = writer_task.await;
    log::info!("mux connection closed client_id={client_id}");
}

/// Owns the WebSocket's send half exclusively: the only writer, per
/// "one outbound task... the WebSocket writes" rule.
async fn writer_loop(mut ws_tx: SplitSink<WebSocket, Message>, mut rx: mpsc::Receiver<Message>) {
    while let Some(msg) = rx.recv().await {
        if ws_tx.send(msg).await.is_err() {
            break;
        }
    }
    let _ = ws_tx.close().await;
}

async fn inbound_loop(conn: Arc<MuxConnection>, mut ws_rx: SplitStream<WebSocket>, out_tx: mpsc::Sender<Message>) {
    while let Some(msg) = ws_rx.next().await {
        let msg = match msg {
            Ok(m) => m,
            Err(e) => {
                log::warn!("mux read error, closing: {e}");
                break;
            }
        };
        match msg {
            Message::Binary(bytes) => {
                let frame = match MuxFrame::decode(&bytes) {
                    Ok(f) => f,
                    Err(e) => {
                        log::warn!("mux: dropping malformed frame: {e}");
                        continue;
                    }
                };
                handle_client_frame(&conn, frame, &out_tx).await;
            }
            Message::Close(_) => break,
            Message::Ping(_) | Message::Pong(_) | Message::Text(_) => {}
        }
    }
}

async fn handle_client_frame(conn: &Arc<MuxConnection>, frame: MuxFrame, out_tx: &mpsc::Sender<Message>) {
    match frame {
        MuxFrame::Input { session_id, data } => {
            let payload = serde_json::json!({ "id": session_id, "bytes": base64_encode(&data) });
            if let Err(e) = conn.host.call("session.write", payload).await {
                log::warn!("session {session_id:016x}: write failed: {e}");
            }
        }
        MuxFrame::Resize { session_id, cols, rows } => {
            if !dims_in_range(cols, rows) {
                return;
            }
            let payload = serde_json::json!({ "id": session_id, "cols": cols, "rows": rows });
            match conn.host.call("session.resize", payload).await {
                Ok(_) => {
                    if let Some(entry) = conn.sessions.lock().unwrap().get(&session_id) {
                        entry.channel.set_dims(cols, rows);
                    }
                }
                Err(e) => log::warn!("session {session_id:016x}: resize failed: {e}"),
            }
        }
        MuxFrame::ActiveHint { session_id, active } => {
            if let Some(entry) = conn.sessions.lock().unwrap().get(&session_id) {
                entry.channel.set_active(active);
            }
        }
        MuxFrame::BufferRequest { session_id } => {
            handle_buffer_request(conn, session_id, out_tx).await;
        }
        MuxFrame::Output { .. }
        | MuxFrame::Resync { .. }
        | MuxFrame::CompressedOutput { .. }
        | MuxFrame::ProcessEvent { .. }
        | MuxFrame::ForegroundChange { .. } => {
            log::warn!("mux: dropping server-only frame received from client");
        }
    }
}

/// Resync protocol: (re)attach to `session_id`, send
/// Resync immediately (outside coalescing), then let the reader task
/// stream the replayed scrollback followed by live output through the
/// normal flush path. An unknown or already-gone session id gets a
/// single `Missing` ProcessEvent instead -- `attach` fails the same way
/// for both, so no separate bookkeeping is needed to tell them apart.
async fn handle_buffer_request(conn: &Arc<MuxConnection>, session_id: u64, out_tx: &mpsc::Sender<Message>) {
    if let Some(old) = conn.sessions.lock().unwrap().remove(&session_id) {
        old.attach_handle.abort();
    }

    match conn.host.attach(session_id, &conn.client_id).await {
        Ok(stream) => {
            if out_tx.send(Message::Binary(MuxFrame::Resync { session_id }.encode().into())).await.is_err() {
                return;
            }
            let channel = SessionChannel::new();
            let handle = crate::session_channel::spawn_reader(session_id, stream, channel.clone());
            conn.sessions.lock().unwrap().insert(session_id, SessionEntry { channel, attach_handle: handle });
        }
        Err(_) => {
            let frame = missing_process_event(session_id);
            let _ = out_tx.send(Message::Binary(frame.encode().into())).await;
        }
    }
}

/// Forwards every `HostEvent` naming a Session this connection currently
/// has attached as a mux ProcessEvent/ForegroundChange frame. `/ws/state`
/// carries the separate session-list sidecar; this loop is purely the
/// per-session slice of the same underlying feed.
async fn state_relay_loop(conn: Arc<MuxConnection>, host: HostClient, out_tx: mpsc::Sender<Message>) {
    let mut stream = match host.subscribe_state().await {
        Ok(s) => s,
        Err(e) => {
            log::warn!("mux: state.subscribe failed: {e}");
            return;
        }
    };
    loop {
        let event = match stream.next_event().await {
            Ok(Some(v)) => v,
            Ok(None) => break,
            Err(e) => {
                log::warn!("mux: state stream error: {e}");
                break;
            }
        };
        let Some(session_id) = event.get("session_id").and_then(|v| v.as_u64()) else {
            continue;
        };
        if !conn.sessions.lock().unwrap().contains_key(&session_id) {
            continue;
        }
        let frame = match event.get("type").and_then(|v| v.as_str()) {
            Some("ProcessEvent") => MuxFrame::ProcessEvent { session_id, json: serde_json::to_vec(&event).unwrap_or_default() },
            Some("ForegroundChange") => MuxFrame::ForegroundChange { session_id, json: serde_json::to_vec(&event).unwrap_or_default() },
            _ => continue,
        };
        if out_tx.send(Message::Binary(frame.encode().into())).await.is_err() {
            break;
        }
    }
}

/// The single writer-facing scheduler: every tick, flushes any session
/// whose coalescing window has closed (byte threshold or age) and applies
/// the 200ms backpressure-drop rule on a stalled send.
async fn outbound_flush_loop(conn: Arc<MuxConnection>, out_tx: mpsc::Sender<Message>) {
    loop {
        tokio::time::sleep(SCHEDULER_TICK).await;
        if conn.closing.load(Ordering::SeqCst) {
            return;
        }

        let due: Vec<(u64, Arc<SessionChannel>)> = {
            let sessions = conn.sessions.lock().unwrap();
            sessions
                .iter()
                .filter_map(|(id, entry)| {
                    let ch = &entry.channel;
                    let interval = if ch.is_active() { ACTIVE_FLUSH_INTERVAL } else { INACTIVE_FLUSH_INTERVAL };
                    let due = ch.queued_bytes() >= COALESCE_BYTE_THRESHOLD || ch.oldest_age().map(|age| age >= interval).unwrap_or(false);
                    (due || ch.is_closed()).then(|| (*id, ch.clone()))
                })
                .collect()
        };

        for (session_id, channel) in due {
            if channel.take_loss() {
                if out_tx.send(Message::Binary(MuxFrame::Resync { session_id }.encode().into())).await.is_err() {
                    return;
                }
            }
            let data = channel.drain_concat();
            if !data.is_empty() {
                let (cols, rows) = channel.dims();
                let force_compress = !channel.is_active();
                let frame = encode_output(session_id, cols, rows, data, force_compress);
                match tokio::time::timeout(BACKPRESSURE_TIMEOUT, out_tx.send(Message::Binary(frame.into()))).await {
                    Ok(Ok(())) => {}
                    Ok(Err(_)) => return,
                    Err(_) => {
                        // Writer didn't drain within 200ms: drop this
                        // session's buffered output and force a Resync
                        // next cycle instead of blocking the connection.
                        channel.force_drop_and_resync();
                        log::warn!("session {session_id:016x}: backpressure drop after {BACKPRESSURE_TIMEOUT:?}");
                    }
                }
            }
            if channel.is_closed() {
                if let Some(entry) = conn.sessions.lock().unwrap().remove(&session_id) {
                    entry.attach_handle.abort();
                }
            }
        }
    }
}

fn encode_output(session_id: u64, cols: u16, rows: u16, data: Vec<u8>, force_compress: bool) -> Vec<u8> {
    if force_compress || data.len() >= COMPRESS_THRESHOLD {
        if let Some(gzip) = maybe_compress(&data) {
            let uncompressed_len = data.len() as u32;
            return MuxFrame::CompressedOutput { session_id, cols, rows, uncompressed_len, gzip }.encode();
        }
    }
    MuxFrame::Output { session_id, cols, rows, data }.encode()
}

fn base64_encode(bytes: &[u8]) -> String {
    use base64::Engine;
    base64::engine::general_purpose::STANDARD.encode(bytes)
}
