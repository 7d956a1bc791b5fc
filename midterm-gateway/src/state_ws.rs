//! `/ws/state`: the JSON sidecar channel. Delivers
//! `{ "sessions": [SessionInfoDto...], "update": HostEvent? }` once on
//! connect and again on every subsequent state change.

use axum::extract::ws::{Message, WebSocket};
use futures::{SinkExt, StreamExt};
use serde_json::Value;

use crate::ipc_client::HostClient;

pub async fn run(mut socket: WebSocket, host: HostClient) {
    let sessions = match host.call("session.list", Value::Null).await {
        Ok(v) => v.get("sessions").cloned().unwrap_or(Value::Array(vec![])),
        Err(e) => {
            log::warn!("state: initial session.list failed: {e}");
            Value::Array(vec![])
        }
    };
    let initial = serde_json::json!({ "sessions": sessions, "update": Value::Null });
    if send_json(&mut socket, &initial).await.is_err() {
        return;
    }

    let mut stream = match host.subscribe_state().await {
        Ok(s) => s,
        Err(e) => {
            log::warn!("state: subscribe failed: {e}");
            return;
        }
    };

    loop {
        tokio::select! {
            event = stream.next_event() => {
                let update = match event {
                    Ok(Some(v)) => v,
                    Ok(None) => break,
                    Err(e) => {
                        log::warn!("state: stream error: {e}");
                        break;
                    }
                };
                let sessions = match host.call("session.list", Value::Null).await {
                    Ok(v) => v.get("sessions").cloned().unwrap_or(Value::Array(vec![])),
                    Err(_) => continue,
                };
                let msg = serde_json::json!({ "sessions": sessions, "update": update });
                if send_json(&mut socket, &msg).await.is_err() {
                    break;
                }
            }
            incoming = socket.recv() => {
                match incoming {
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Err(_)) => break,
                    _ => {}
                }
            }
        }
    }
}

async fn send_json(socket: &mut WebSocket, value: &Value) -> Result<(), axum::Error> {
    let text = serde_json::to_string(value).unwrap_or_else(|_| "{}".to_string());
    socket.send(Message::Text(text.into())).await
}
