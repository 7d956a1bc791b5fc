//! `midterm-gateway`: the per-browser WebSocket mux. Stateless across
//! restarts -- every Session it fronts lives in `midterm-host`, reached
//! over the local IPC transport -- so killing and restarting this binary
//! never drops a shell, only the attached browser connections.

mod auth;
mod compress;
mod connection;
mod ipc_client;
mod logging;
mod mux;
mod session_channel;
mod state_ws;

use axum::extract::ws::WebSocketUpgrade;
use axum::extract::State;
use axum::http::HeaderMap;
use axum::response::IntoResponse;
use axum::routing::get;
use axum::Router;

use midterm_core::config::GatewayConfig;

use crate::connection::{close_frame, AUTH_REJECTED_CLOSE_CODE};
use crate::ipc_client::HostClient;

const VERSION: &str = env!("CARGO_PKG_VERSION");

fn print_usage() {
    println!("midterm-gateway {VERSION}");
    println!();
    println!("Usage: midterm-gateway [OPTIONS]");
    println!();
    println!("  (no flag)       run the WebSocket mux, serving /ws/mux and /ws/state");
    println!("  -v, --version   print version and exit");
    println!("  -h, --help      print this message and exit");
    println!();
    println!("Environment:");
    println!("  MIDTERM_GATEWAY_BIND   address the mux HTTP server binds to (default 127.0.0.1:8765)");
    println!("  MIDTERM_HOST_SOCKET    override the local IPC socket/pipe path dialed to reach midterm-host");
}

fn main() {
    let args: Vec<String> = std::env::args().skip(1).collect();
    match args.first().map(String::as_str) {
        Some("--version") | Some("-v") => {
            println!("midterm-gateway {VERSION}");
            std::process::exit(0);
        }
        Some("--help") | Some("-h") => {
            print_usage();
            std::process::exit(0);
        }
        Some(other) => {
            eprintln!("midterm-gateway: unrecognized option '{other}'");
            print_usage();
            std::process::exit(1);
        }
        None => {}
    }

    if let Err(e) = logging::init("info") {
        eprintln!("midterm-gateway: failed to initialize logging: {e}");
    }

    let rt = match tokio::runtime::Builder::new_multi_thread().enable_all().build() {
        Ok(rt) => rt,
        Err(e) => {
            eprintln!("midterm-gateway: failed to start runtime: {e}");
            std::process::exit(1);
        }
    };

    let exit_code = rt.block_on(run());
    std::process::exit(exit_code);
}

#[derive(Clone)]
struct AppState {
    host: HostClient,
}

fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/ws/mux", get(mux_upgrade))
        .route("/ws/state", get(state_upgrade))
        .with_state(state)
}

async fn run() -> i32 {
    let config = GatewayConfig::from_env();
    let endpoint = midterm_core::ipc::resolve_endpoint(config.socket_path_override.as_deref());
    let host = HostClient::new(endpoint.clone());
    let app = build_router(AppState { host });

    log::info!("midterm-gateway {VERSION} starting, bind={} host_endpoint={endpoint}", config.bind_addr);

    let listener = match tokio::net::TcpListener::bind(&config.bind_addr).await {
        Ok(l) => l,
        Err(e) => {
            log::error!("failed to bind {}: {e}", config.bind_addr);
            return 1;
        }
    };

    match axum::serve(listener, app.into_make_service()).await {
        Ok(()) => 0,
        Err(e) => {
            log::error!("server exited: {e}");
            1
        }
    }
}

async fn mux_upgrade(headers: HeaderMap, State(state): State<AppState>, ws: WebSocketUpgrade) -> impl IntoResponse {
    if !auth::has_valid_session_cookie(&headers) {
        return ws.on_upgrade(|socket| async move {
            let _ = send_close_and_drop(socket, AUTH_REJECTED_CLOSE_CODE, "missing or invalid session cookie").await;
        });
    }
    let client_id = client_id_from_headers(&headers);
    ws.on_upgrade(move |socket| connection::run(socket, state.host, client_id))
}

async fn state_upgrade(headers: HeaderMap, State(state): State<AppState>, ws: WebSocketUpgrade) -> impl IntoResponse {
    if !auth::has_valid_session_cookie(&headers) {
        return ws.on_upgrade(|socket| async move {
            let _ = send_close_and_drop(socket, AUTH_REJECTED_CLOSE_CODE, "missing or invalid session cookie").await;
        });
    }
    ws.on_upgrade(move |socket| state_ws::run(socket, state.host))
}

async fn send_close_and_drop(
    mut socket: axum::extract::ws::WebSocket,
    code: u16,
    reason: &'static str,
) -> Result<(), axum::Error> {
    use futures::SinkExt;
    socket.send(close_frame(code, reason)).await
}

/// Identifies a connection's browser tab for `session.attach`'s
/// subscriber-cap accounting (data model §3). The external auth layer is
/// expected to set a per-tab identifier; absent one, each connection is
/// treated as its own client.
fn client_id_from_headers(headers: &HeaderMap) -> String {
    headers
        .get("x-midterm-client-id")
        .and_then(|v| v.to_str().ok())
        .map(str::to_string)
        .unwrap_or_else(|| format!("conn-{:x}", rand_u64()))
}

fn rand_u64() -> u64 {
    use std::hash::{Hash, Hasher};
    use std::time::{SystemTime, UNIX_EPOCH};
    let mut hasher = std::collections::hash_map::DefaultHasher::new();
    SystemTime::now().duration_since(UNIX_EPOCH).unwrap_or_default().as_nanos().hash(&mut hasher);
    std::thread::current().id().hash(&mut hasher);
    hasher.finish()
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::StreamExt;
    use tokio_tungstenite::tungstenite::Message as WsMessage;

    /// Binds the real router to a loopback port and drives it with a real
    /// WebSocket client rather than mocking the transport layer. Never
    /// dials `midterm-host` -- the auth gate runs before any IPC call is
    /// made, so an unreachable endpoint is fine for this test.
    async fn start_test_gateway() -> std::net::SocketAddr {
        let _ = env_logger::try_init();
        let host = HostClient::new("/nonexistent/midterm-host.sock".to_string());
        let app = build_router(AppState { host });
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let _ = axum::serve(listener, app.into_make_service()).await;
        });
        addr
    }

    #[tokio::test]
    async fn mux_upgrade_without_cookie_closes_with_4401() {
        let addr = start_test_gateway().await;
        let url = format!("ws://{addr}/ws/mux");
        let (mut ws, _) = tokio_tungstenite::connect_async(&url).await.unwrap();
        match ws.next().await {
            Some(Ok(WsMessage::Close(Some(frame)))) => assert_eq!(u16::from(frame.code), AUTH_REJECTED_CLOSE_CODE),
            other => panic!("expected a close frame with code {AUTH_REJECTED_CLOSE_CODE}, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn state_upgrade_without_cookie_closes_with_4401() {
        let addr = start_test_gateway().await;
        let url = format!("ws://{addr}/ws/state");
        let (mut ws, _) = tokio_tungstenite::connect_async(&url).await.unwrap();
        match ws.next().await {
            Some(Ok(WsMessage::Close(Some(frame)))) => assert_eq!(u16::from(frame.code), AUTH_REJECTED_CLOSE_CODE),
            other => panic!("expected a close frame with code {AUTH_REJECTED_CLOSE_CODE}, got {other:?}"),
        }
    }

    #[test]
    fn client_id_falls_back_when_header_absent() {
        let headers = HeaderMap::new();
        assert!(client_id_from_headers(&headers).starts_with("conn-"));
    }

    #[test]
    fn client_id_uses_header_when_present() {
        let mut headers = HeaderMap::new();
        headers.insert("x-midterm-client-id", "tab-42".parse().unwrap());
        assert_eq!(client_id_from_headers(&headers), "tab-42");
    }
}
