//! WebSocket endpoint and socket lifecycle.
//!
//! Opening sequence (server speaks first):
//! 1. `connect.challenge {nonce, timestamp}` event
//! 2. client `connect` request with auth material
//! 3. HelloResponse `{protocol, server, features, snapshot}`
//!
//! After the handshake the socket splits into a writer task draining the
//! connection's bounded send queue and a reader loop dispatching RPC
//! requests. Idle connections are pinged every 30 s and dropped when no
//! pong arrives within 60 s.

use std::net::SocketAddr;
use std::time::Duration;

use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::{ConnectInfo, State};
use axum::response::IntoResponse;
use axum::routing::get;
use axum::Router;
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use rand_nonce::challenge_nonce;
use tokio::time::Instant;

use ag_protocol::auth::{authorize_connect, AuthDecision, AuthRequest};
use ag_protocol::error_codes as codes;
use ag_protocol::frames::{
    ConnectParams, EventFrame, HelloResponse, RequestFrame, ResponseFrame, ServerInfo,
    PROTOCOL_VERSION_MAX,
};
use ag_protocol::scopes::OPERATOR_DEFAULT_SCOPES;

use super::connection::Outbound;
use super::methods::{self, CallerInfo};
use super::presence::PresenceEntry;
use crate::state::AppState;

const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);
const PING_INTERVAL: Duration = Duration::from_secs(30);
const PONG_TIMEOUT: Duration = Duration::from_secs(60);

/// Build the HTTP router: `/ws` upgrades to WS; `/` serves the Control UI
/// bundle when configured, and upgrades to WS otherwise.
pub fn router(state: AppState) -> Router {
    let mut router = Router::new().route("/ws", get(ws_handler));

    let control_ui = state
        .config
        .server
        .control_ui_dir
        .as_ref()
        .filter(|dir| dir.exists());
    match control_ui {
        Some(dir) => {
            tracing::info!(dir = %dir.display(), "serving control UI at /");
            router = router.fallback_service(tower_http::services::ServeDir::new(dir));
        }
        None => {
            router = router.route("/", get(ws_handler));
        }
    }

    router.with_state(state)
}

async fn ws_handler(
    ws: WebSocketUpgrade,
    State(state): State<AppState>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_socket(socket, state, addr))
}

mod rand_nonce {
    //! 32-byte challenge nonces. Hashing two fresh UUIDs gives 256 bits
    //! from the OS RNG without pulling in another dependency.

    use sha2::{Digest, Sha256};

    pub fn challenge_nonce() -> String {
        let mut hasher = Sha256::new();
        hasher.update(uuid::Uuid::new_v4().as_bytes());
        hasher.update(uuid::Uuid::new_v4().as_bytes());
        hex::encode(hasher.finalize())
    }
}

async fn handle_socket(socket: WebSocket, state: AppState, addr: SocketAddr) {
    let conn_id = uuid::Uuid::new_v4().to_string();
    let (mut sink, mut stream) = socket.split();

    // 1. Challenge.
    let nonce = challenge_nonce();
    let challenge = EventFrame {
        event: "connect.challenge".into(),
        payload: serde_json::json!({
            "nonce": nonce,
            "timestamp": chrono::Utc::now().timestamp_millis(),
        }),
        seq: None,
    };
    if send_json(&mut sink, &challenge).await.is_err() {
        return;
    }

    // 2. Await `connect` (ping/health are answered pre-auth).
    let connect = match await_connect(&state, &conn_id, &mut sink, &mut stream, &nonce, addr).await {
        Some(connect) => connect,
        None => return,
    };

    // 3. Register, send hello, run the session loops.
    run_connection(state, conn_id, sink, stream, connect).await;
}

struct ConnectOutcome {
    request_id: serde_json::Value,
    params: ConnectParams,
    auth_method: &'static str,
}

async fn await_connect(
    state: &AppState,
    conn_id: &str,
    sink: &mut SplitSink<WebSocket, Message>,
    stream: &mut SplitStream<WebSocket>,
    nonce: &str,
    addr: SocketAddr,
) -> Option<ConnectOutcome> {
    let deadline = Instant::now() + HANDSHAKE_TIMEOUT;

    loop {
        let msg = match tokio::time::timeout_at(deadline, stream.next()).await {
            Ok(Some(Ok(msg))) => msg,
            Ok(_) => return None,
            Err(_) => {
                tracing::debug!(conn_id = %conn_id, "handshake timeout");
                return None;
            }
        };
        let Message::Text(text) = msg else {
            continue;
        };
        let request: RequestFrame = match serde_json::from_str(&text) {
            Ok(request) => request,
            Err(e) => {
                let response = ResponseFrame::err(
                    serde_json::Value::Null,
                    codes::INVALID_REQUEST,
                    format!("bad frame: {e}"),
                );
                let _ = send_json(sink, &response).await;
                continue;
            }
        };

        if request.method != "connect" {
            // ping/health are reachable pre-auth; everything else fails.
            let caller = CallerInfo {
                conn_id: conn_id.to_owned(),
                authenticated: false,
                scopes: Vec::new(),
            };
            let response = methods::dispatch(state, &caller, request).await;
            if send_json(sink, &response).await.is_err() {
                return None;
            }
            continue;
        }

        let request_id = request.id.clone();
        let params: ConnectParams = match serde_json::from_value(request.params) {
            Ok(params) => params,
            Err(e) => {
                let response = ResponseFrame::err(
                    request_id,
                    codes::HANDSHAKE_FAILED,
                    format!("bad connect params: {e}"),
                );
                let _ = send_json(sink, &response).await;
                return None;
            }
        };

        let token = read_secret(&state.config.server.auth.token_env);
        let password = read_secret(&state.config.server.auth.password_env);
        let decision = authorize_connect(
            &AuthRequest {
                remote_addr: Some(addr.ip()),
                mode: state.config.server.auth.mode,
                config_token: token.as_deref(),
                config_password: password.as_deref(),
                request_token: params.auth.token.as_deref(),
                request_password: params.auth.password.as_deref(),
                device_identity: params.device_identity.as_ref(),
                challenge_nonce: nonce,
            },
            &state.devices,
        );

        match decision {
            AuthDecision::Accepted { method } => {
                return Some(ConnectOutcome {
                    request_id,
                    params,
                    auth_method: method.as_str(),
                });
            }
            AuthDecision::Rejected { reason } => {
                tracing::warn!(conn_id = %conn_id, reason = %reason, "auth failed");
                let response = ResponseFrame {
                    id: request_id,
                    result: None,
                    error: Some(ag_protocol::frames::ErrorShape {
                        code: codes::AUTH_FAILED.to_owned(),
                        message: reason.to_owned(),
                        rpc_code: None,
                    }),
                };
                let _ = send_json(sink, &response).await;
                return None;
            }
        }
    }
}

async fn run_connection(
    state: AppState,
    conn_id: String,
    mut sink: SplitSink<WebSocket, Message>,
    mut stream: SplitStream<WebSocket>,
    connect: ConnectOutcome,
) {
    let protocol = connect.params.max_protocol.min(PROTOCOL_VERSION_MAX);
    let role = connect.params.role.clone().unwrap_or_else(|| "operator".into());
    let mut scopes = connect.params.scopes.clone().unwrap_or_default();
    if scopes.is_empty() && role == "operator" {
        scopes = OPERATOR_DEFAULT_SCOPES.iter().map(|s| s.to_string()).collect();
    }

    // Hello with a state snapshot.
    let hello = HelloResponse {
        protocol,
        server: ServerInfo {
            name: "agentgate".into(),
            version: env!("CARGO_PKG_VERSION").into(),
            platform: std::env::consts::OS.into(),
        },
        features: serde_json::json!({
            "chat": true,
            "sessions": true,
            "cron": state.config.cron.enabled,
            "channels": !state.config.channels.is_empty(),
            "replay": true,
        }),
        snapshot: serde_json::json!({
            "sessions": state.store.list().iter().map(|(key, _)| key).collect::<Vec<_>>(),
            "channels": state.channels.channel_names(),
            "agents": [state.config.session.default_agent],
        }),
    };
    let hello_response = ResponseFrame::ok(
        connect.request_id,
        serde_json::to_value(&hello).unwrap_or_default(),
    );
    if send_json(&mut sink, &hello_response).await.is_err() {
        return;
    }

    let (handle, mut outbound_rx) = state.bus.conns.register(&conn_id, &role, scopes.clone());
    state.presence.joined(
        PresenceEntry {
            conn_id: conn_id.clone(),
            client_name: connect.params.client.name.clone(),
            client_version: connect.params.client.version.clone(),
            platform: connect.params.client.platform.clone(),
            auth_method: connect.auth_method.to_owned(),
            connected_at: chrono::Utc::now(),
        },
        &state.bus,
    );
    tracing::info!(
        conn_id = %conn_id,
        client = %connect.params.client.name,
        protocol,
        auth_method = %connect.auth_method,
        "client connected"
    );

    // Writer task: drains the send queue; exits on force-close.
    let close_token = handle.close_token();
    let writer = tokio::spawn(async move {
        loop {
            tokio::select! {
                outbound = outbound_rx.recv() => {
                    let Some(outbound) = outbound else { break };
                    let result = match outbound {
                        Outbound::Event(frame) => {
                            serde_json::to_string(&frame)
                                .map_err(|_| ())
                                .ok()
                                .map(Message::Text)
                        }
                        Outbound::Response(frame) => {
                            serde_json::to_string(&frame)
                                .map_err(|_| ())
                                .ok()
                                .map(Message::Text)
                        }
                        Outbound::Ping => Some(Message::Ping(Vec::new())),
                    };
                    let Some(message) = result else { continue };
                    if sink.send(message).await.is_err() {
                        break;
                    }
                }
                _ = close_token.cancelled() => {
                    let _ = sink
                        .send(Message::Close(Some(axum::extract::ws::CloseFrame {
                            code: axum::extract::ws::close_code::POLICY,
                            reason: "slow_consumer".into(),
                        })))
                        .await;
                    break;
                }
            }
        }
    });

    // Reader loop with keepalive.
    let caller = CallerInfo {
        conn_id: conn_id.clone(),
        authenticated: true,
        scopes,
    };
    let mut ping_interval = tokio::time::interval(PING_INTERVAL);
    ping_interval.tick().await; // immediate first tick
    let mut last_pong = Instant::now();

    loop {
        tokio::select! {
            msg = stream.next() => {
                let Some(Ok(msg)) = msg else { break };
                match msg {
                    Message::Text(text) => {
                        let request: RequestFrame = match serde_json::from_str(&text) {
                            Ok(request) => request,
                            Err(e) => {
                                let response = ResponseFrame::err(
                                    serde_json::Value::Null,
                                    codes::INVALID_REQUEST,
                                    format!("bad frame: {e}"),
                                );
                                if !handle.send_response(response).await {
                                    break;
                                }
                                continue;
                            }
                        };
                        let response = methods::dispatch(&state, &caller, request).await;
                        if !handle.send_response(response).await {
                            break;
                        }
                    }
                    Message::Pong(_) => {
                        last_pong = Instant::now();
                    }
                    Message::Ping(_) => {
                        // axum answers WS pings automatically.
                        last_pong = Instant::now();
                    }
                    Message::Close(_) => break,
                    Message::Binary(_) => {}
                }
            }
            _ = ping_interval.tick() => {
                if last_pong.elapsed() > PONG_TIMEOUT {
                    tracing::info!(conn_id = %conn_id, "dropping idle connection (no pong)");
                    break;
                }
                if !handle.send_ping().await {
                    break;
                }
            }
        }
        if handle.is_poisoned() {
            break;
        }
    }

    // Cleanup.
    state.bus.conns.remove(&conn_id);
    state.presence.left(&conn_id, &state.bus);
    writer.abort();
    tracing::info!(conn_id = %conn_id, "client disconnected");
}

fn read_secret(env_var: &str) -> Option<String> {
    std::env::var(env_var).ok().filter(|v| !v.is_empty())
}

async fn send_json<T: serde::Serialize>(
    sink: &mut SplitSink<WebSocket, Message>,
    value: &T,
) -> Result<(), ()> {
    let json = serde_json::to_string(value).map_err(|_| ())?;
    sink.send(Message::Text(json)).await.map_err(|_| ())
}
