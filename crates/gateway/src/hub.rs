//! Hub WS server (spec §4.H): one WebSocket endpoint multiplexing
//! chat-ui, node, and CLI connections over the shared frame set.
//!
//! Grounded on the teacher's `nodes::ws::handle_socket` (split sink/
//! stream, `wait_for_hello` with a timeout, an outbound mpsc channel
//! drained by a dedicated writer task, cleanup on disconnect), widened
//! from a node-only endpoint authenticated by query-string token to a
//! three-role endpoint authenticated by the first `hello` frame, per
//! this wire protocol's HelloRequest/HelloOk split.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use axum::extract::ws::{Message, WebSocket};
use axum::extract::{State, WebSocketUpgrade};
use axum::response::IntoResponse;
use futures_util::{SinkExt, StreamExt};
use sha2::{Digest, Sha256};
use subtle::ConstantTimeEq;
use tokio::sync::mpsc;

use cb_domain::Value;
use cb_nodes::{ConnectedNode, NodeEvent, Platform};
use cb_protocol::{
    ClientFrame, EventFrame, HelloOk, HelloRequest, PushSnapshot, RpcRes, Role, ServerFrame,
    Snapshot, StateVersionPair, PROTOCOL_VERSION,
};

use crate::api;
use crate::state::AppState;

const HELLO_TIMEOUT: Duration = Duration::from_secs(10);
const OUTBOUND_CHANNEL_CAPACITY: usize = 64;

/// GET `/v1/hub/ws` — upgrade to WebSocket; the connection authenticates
/// by its first `hello` frame rather than a query parameter (spec §4.H).
pub async fn ws_handler(ws: WebSocketUpgrade, State(state): State<Arc<AppState>>) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_socket(socket, state))
}

async fn handle_socket(socket: WebSocket, state: Arc<AppState>) {
    let (mut sink, mut stream) = socket.split();

    let Some(hello) = wait_for_hello(&mut stream).await else {
        tracing::warn!("connection closed before sending hello");
        return;
    };

    if !authenticate(&state, &hello) {
        let _ = send_frame(
            &mut sink,
            &ServerFrame::RpcRes(RpcRes::err("hello", "unauthorized", "invalid token")),
        )
        .await;
        return;
    }

    let client_name = hello.client_name.clone();
    let role = hello.role;
    let agent_id = state.config.gateway.default_agent.clone();
    let seq = Arc::new(AtomicU64::new(1));

    if send_frame(&mut sink, &ServerFrame::HelloOk(build_hello_ok(&state))).await.is_err() {
        return;
    }

    let node_id = if role == Role::Node {
        Some(hello.instance_id.clone().unwrap_or_else(|| client_name.clone()))
    } else {
        None
    };

    let (outbound_tx, mut outbound_rx) = mpsc::channel::<ServerFrame>(OUTBOUND_CHANNEL_CAPACITY);

    if let Some(ref id) = node_id {
        let platform = hello
            .platform
            .as_deref()
            .and_then(Platform::parse)
            .unwrap_or(Platform::Linux);
        let (node_tx, mut node_rx) = mpsc::channel::<NodeEvent>(OUTBOUND_CHANNEL_CAPACITY);
        state.nodes.register(ConnectedNode {
            node_id: id.clone(),
            display_name: client_name.clone(),
            platform,
            commands: hello.commands.clone().unwrap_or_default(),
            last_seen_at: chrono::Utc::now(),
            sink: node_tx,
        });
        state.bump_presence();

        let forward_tx = outbound_tx.clone();
        let forward_seq = seq.clone();
        tokio::spawn(async move {
            while let Some(NodeEvent::InvokeRequest { id, node_id, command, params }) = node_rx.recv().await {
                let frame = ServerFrame::Event(EventFrame {
                    event: "node.invoke.request".into(),
                    payload: Some(Value::from_json(serde_json::json!({
                        "id": id.to_string(),
                        "nodeId": node_id,
                        "command": command,
                        "params": params.to_json(),
                    }))),
                    seq: forward_seq.fetch_add(1, Ordering::SeqCst),
                    state_version: None,
                });
                if forward_tx.send(frame).await.is_err() {
                    break;
                }
            }
        });
    }

    let mut events_rx = state.events.subscribe();
    let broadcast_tx = outbound_tx.clone();
    let broadcast_seq = seq.clone();
    let broadcast_task = tokio::spawn(async move {
        loop {
            match events_rx.recv().await {
                Ok(event) => {
                    let frame = ServerFrame::Event(EventFrame {
                        event: event.event,
                        payload: Some(event.payload),
                        seq: broadcast_seq.fetch_add(1, Ordering::SeqCst),
                        state_version: None,
                    });
                    if broadcast_tx.send(frame).await.is_err() {
                        break;
                    }
                }
                Err(tokio::sync::broadcast::error::RecvError::Lagged(_)) => continue,
                Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
            }
        }
    });

    let writer = tokio::spawn(async move {
        while let Some(frame) = outbound_rx.recv().await {
            if send_frame(&mut sink, &frame).await.is_err() {
                break;
            }
        }
    });

    while let Some(Ok(msg)) = stream.next().await {
        match msg {
            Message::Text(text) => {
                let Ok(frame) = serde_json::from_str::<ClientFrame>(&text) else {
                    tracing::debug!(client = %client_name, "ignoring unparseable frame");
                    continue;
                };
                match frame {
                    ClientFrame::Hello(_) => {
                        // Re-sent hello on an already-authenticated socket is a no-op.
                    }
                    ClientFrame::RpcReq(req) => {
                        let res = api::dispatch(&state, &agent_id, req).await;
                        if outbound_tx.send(ServerFrame::RpcRes(res)).await.is_err() {
                            break;
                        }
                    }
                    ClientFrame::Event(event_frame) => {
                        if event_frame.event == "node.invoke.result" {
                            handle_invoke_result(&state, event_frame.payload);
                        }
                    }
                    ClientFrame::SeqGap(gap) => {
                        tracing::debug!(client = %client_name, expected = gap.expected, received = gap.received, "client reported seq gap");
                        let frame = ServerFrame::PushSnapshot(PushSnapshot {
                            snapshot: build_snapshot(&state),
                        });
                        if outbound_tx.send(frame).await.is_err() {
                            break;
                        }
                    }
                }
            }
            Message::Close(_) => break,
            Message::Ping(_) | Message::Pong(_) => {
                if let Some(ref id) = node_id {
                    state.nodes.touch(id);
                }
            }
            _ => {}
        }
    }

    broadcast_task.abort();
    writer.abort();
    if let Some(id) = node_id {
        let failed = state.invoke_router.fail_pending_for_node(&id);
        state.nodes.remove(&id);
        state.bump_presence();
        tracing::info!(node_id = %id, failed_in_flight = failed, "node disconnected");
    }
}

async fn wait_for_hello(
    stream: &mut (impl StreamExt<Item = Result<Message, axum::Error>> + Unpin),
) -> Option<HelloRequest> {
    tokio::time::timeout(HELLO_TIMEOUT, async {
        while let Some(Ok(msg)) = stream.next().await {
            if let Message::Text(text) = msg {
                if let Ok(ClientFrame::Hello(hello)) = serde_json::from_str::<ClientFrame>(&text) {
                    return Some(hello);
                }
            }
        }
        None
    })
    .await
    .unwrap_or(None)
}

async fn send_frame(
    sink: &mut (impl SinkExt<Message> + Unpin),
    frame: &ServerFrame,
) -> Result<(), ()> {
    let json = serde_json::to_string(frame).map_err(|_| ())?;
    sink.send(Message::Text(json)).await.map_err(|_| ())
}

/// Constant-time bearer-token check against `AppState::token_hash`. A
/// `None` hash means dev mode: every `hello` is accepted unauthenticated.
/// Password auth (`gateway.password_hash_env`) is not implemented yet —
/// see DESIGN.md.
fn authenticate(state: &AppState, hello: &HelloRequest) -> bool {
    match &state.token_hash {
        Some(expected) => match &hello.token {
            Some(token) => {
                let actual = Sha256::digest(token.as_bytes());
                actual.as_slice().ct_eq(expected.as_slice()).into()
            }
            None => false,
        },
        None => true,
    }
}

fn handle_invoke_result(state: &Arc<AppState>, payload: Option<Value>) {
    let Some(map) = payload.as_ref().and_then(Value::as_map) else {
        return;
    };
    let Some(id) = map
        .get("id")
        .and_then(Value::as_str)
        .and_then(|s| uuid::Uuid::parse_str(s).ok())
    else {
        return;
    };
    let ok = map.get("ok").and_then(Value::as_bool).unwrap_or(false);
    let result_payload = map.get("payload").cloned();
    let error = map.get("error").and_then(Value::as_str).map(str::to_string);
    state.invoke_router.complete(id, ok, result_payload, error);
}

fn build_snapshot(state: &AppState) -> Snapshot {
    let presence: Vec<String> = state.nodes.list().into_iter().map(|n| n.node_id).collect();
    let health = Value::from_json(serde_json::json!({ "connectedNodes": state.nodes.len() }));
    let version = *state.state_version.read();
    let uptime_ms = (chrono::Utc::now() - state.started_at)
        .num_milliseconds()
        .max(0) as u64;

    Snapshot {
        presence,
        health,
        state_version: StateVersionPair {
            presence: version.presence,
            health: version.health,
        },
        uptime_ms,
        config_path: None,
        state_dir: Some(state.config.gateway.state_dir.clone()),
        session_defaults: None,
    }
}

fn build_hello_ok(state: &AppState) -> HelloOk {
    HelloOk {
        protocol: PROTOCOL_VERSION,
        server: Value::from_json(serde_json::json!({
            "name": "clawdbot-gateway",
            "version": env!("CARGO_PKG_VERSION"),
        })),
        features: Value::from_json(serde_json::json!({
            "nodes": true,
            "exec": true,
            "approvals": true,
        })),
        snapshot: build_snapshot(state),
        canvas_host_url: None,
        auth: None,
        policy: Value::Null,
    }
}
