//! Session Orchestrator (spec §4.I): one logical worker per session key,
//! serializing LLM turns, dispatching tool calls through the Tool Policy
//! Layer into the Sandbox Executor or Node Invoke Router, and emitting
//! `chat` events as the turn progresses.
//!
//! Grounded on `sa_gateway::runtime::session_lock::SessionLockMap` and
//! `runtime::cancel::{CancelToken, CancelMap}` for the concurrency
//! primitives; the debounce/cap/drop queue and the turn loop itself are
//! new relative to the teacher, which dispatches chat synchronously per
//! HTTP call with no queue or tool-call round trip modeled at this layer.

pub mod cancel;
pub mod queue;
pub mod session_lock;

use std::sync::Arc;
use std::time::Duration;

use futures_util::StreamExt;
use tracing::{info, warn};
use uuid::Uuid;

use cb_domain::config::ToolPolicy;
use cb_domain::{Error, Result, Value};
use cb_policy::{compose, Layer};
use cb_providers::{Message, ModelSelector, StreamEvent, ToolCall, ToolDefinition};
use cb_sandbox::{ExecDeps, ExecParams};

use crate::events::GatewayEvent;
use crate::state::AppState;

use self::queue::{QueuePolicy, QueuedTurn};

/// Submit an inbound chat message for `session_key`. Enqueues onto the
/// session's lane and, if no worker is currently draining it, spawns one.
/// Mirrors spec §4.I: "Inbound message → normalize → look up / create
/// Session entity → apply directives → append to a bounded FIFO."
pub async fn submit(state: Arc<AppState>, agent_id: String, session_key: String, text: String) -> Result<Uuid> {
    let entry = state
        .sessions
        .resolve(&session_key, &agent_id)
        .map_err(|e| Error::Resource(e.to_string()))?
        .ok_or_else(|| Error::Validation(format!("no session for key {session_key:?}")))?;

    let policy = QueuePolicy {
        debounce_ms: entry.queue_debounce_ms.unwrap_or(0),
        cap: entry.queue_cap.unwrap_or(32),
        drop: entry.queue_drop.unwrap_or(cb_sessions::DropPolicy::Oldest),
    };

    let run_id = Uuid::new_v4();
    let turn = QueuedTurn {
        run_id,
        agent_id: agent_id.clone(),
        session_key: session_key.clone(),
        text,
        enqueued_at: std::time::Instant::now(),
    };

    if let Some(dropped) = state.session_queue.enqueue(turn, &policy) {
        warn!(session_key = %session_key, dropped_run_id = %dropped.run_id, "turn dropped by queue policy");
    }

    // Only one worker per session key may be draining the lane at a time;
    // if a turn is already running, the newly queued item will be picked
    // up when that worker loops back around.
    if let Ok(permit) = state.session_locks.try_acquire(&session_key) {
        let worker_state = state.clone();
        let worker_key = session_key.clone();
        let worker_policy = policy;
        tokio::spawn(async move {
            drain_lane(worker_state, worker_key, worker_policy, permit).await;
        });
    }

    Ok(run_id)
}

async fn drain_lane(
    state: Arc<AppState>,
    session_key: String,
    policy: QueuePolicy,
    permit: tokio::sync::OwnedSemaphorePermit,
) {
    loop {
        state.session_queue.wait_for_quiet(&session_key, policy.debounce_ms).await;
        let Some(turn) = state.session_queue.pop_front(&session_key) else {
            drop(permit);
            return;
        };

        run_turn(&state, &turn).await;

        // Keep draining while more arrived during this turn; otherwise
        // release the permit so a future submit() can spawn a worker again.
        if state.session_queue.is_empty(&session_key) {
            drop(permit);
            return;
        }
    }
}

/// Run a single turn end to end: acquire a cancel token, call the model
/// provider, dispatch any tool calls, emit `chat` events (spec §4.I).
async fn run_turn(state: &Arc<AppState>, turn: &QueuedTurn) {
    let cancel_token = state.cancel_map.register(&turn.session_key);
    let _ = state.events.send(GatewayEvent::chat(turn.run_id, &turn.session_key, "streaming"));

    let outcome = run_turn_inner(state, turn, &cancel_token).await;

    match outcome {
        Ok(()) => {
            let _ = state.events.send(GatewayEvent::chat(turn.run_id, &turn.session_key, "final"));
        }
        Err(e) => {
            warn!(session_key = %turn.session_key, run_id = %turn.run_id, error = %e, "turn failed");
            let _ = state.events.send(GatewayEvent::chat(turn.run_id, &turn.session_key, "final"));
        }
    }

    state.cancel_map.remove(&turn.session_key);
}

async fn run_turn_inner(state: &Arc<AppState>, turn: &QueuedTurn, cancel: &cancel::CancelToken) -> Result<()> {
    let agent = state
        .config
        .agents
        .get(&turn.agent_id)
        .ok_or_else(|| Error::Validation(format!("unknown agent {:?}", turn.agent_id)))?;

    let entry = state
        .sessions
        .resolve(&turn.session_key, &turn.agent_id)
        .map_err(|e| Error::Resource(e.to_string()))?
        .ok_or_else(|| Error::Validation("session vanished mid-turn".into()))?;

    let selector = resolve_selector(agent, &entry)?;
    let transcript = vec![Message {
        role: "user".into(),
        content: Value::String(turn.text.clone()),
    }];
    let tools: Vec<ToolDefinition> = Vec::new();

    let mut stream = state.providers.model_call(&selector, transcript, tools).await?;

    while let Some(item) = stream.next().await {
        if cancel.is_cancelled() {
            info!(session_key = %turn.session_key, run_id = %turn.run_id, "turn cancelled");
            return Ok(());
        }
        match item? {
            StreamEvent::TextDelta(_chunk) => {
                // Partial text is not re-broadcast per-delta (spec only
                // names `chat` with a coarse `state`, not incremental
                // content frames); accumulation would live here once a
                // transcript store exists.
            }
            StreamEvent::ToolCall(call) => {
                let _ = state.events.send(GatewayEvent::chat(turn.run_id, &turn.session_key, "tool"));
                dispatch_tool_call(state, &turn.agent_id, &turn.session_key, agent, &call).await?;
            }
            StreamEvent::Done { .. } => break,
        }
    }

    Ok(())
}

fn resolve_selector(agent: &cb_domain::config::AgentConfig, entry: &cb_sessions::SessionEntry) -> Result<ModelSelector> {
    if let (Some(provider), Some(model)) = (&entry.provider_override, &entry.model_override) {
        return Ok(ModelSelector {
            provider: provider.clone(),
            model: model.clone(),
        });
    }
    agent
        .models
        .iter()
        .next()
        .map(|(provider, model)| ModelSelector {
            provider: provider.clone(),
            model: model.clone(),
        })
        .ok_or_else(|| Error::Config("agent has no configured models".into()))
}

/// Route one tool call through the Tool Policy Layer (spec §4.J) and into
/// the Sandbox Executor (§4.F) or Node Invoke Router (§4.G).
async fn dispatch_tool_call(
    state: &Arc<AppState>,
    agent_id: &str,
    session_key: &str,
    agent: &cb_domain::config::AgentConfig,
    call: &ToolCall,
) -> Result<()> {
    let empty_policy = ToolPolicy::default();
    let sandbox_layer = cb_policy::resolve_sandbox_layer(agent.sandbox.tools.as_ref(), None);
    let layers = [
        Layer::Global(&empty_policy),
        Layer::Agent(&agent.tools),
        Layer::Sandbox(sandbox_layer.unwrap_or(&empty_policy)),
    ];
    if !compose(&layers, &call.name) {
        return Err(Error::Policy {
            gate: "tool-policy".into(),
            reason: format!("tool {:?} is not permitted for this agent", call.name),
        });
    }

    match call.name.as_str() {
        "exec" => dispatch_exec_tool_call(state, agent_id, session_key, agent, call).await,
        "node.invoke" => dispatch_node_tool_call(state, call).await,
        other => Err(Error::Validation(format!("unsupported tool call {other:?}"))),
    }
}

async fn dispatch_exec_tool_call(
    state: &Arc<AppState>,
    agent_id: &str,
    session_key: &str,
    agent: &cb_domain::config::AgentConfig,
    call: &ToolCall,
) -> Result<()> {
    let args = call.arguments.as_map().cloned().unwrap_or_default();
    let command = args
        .get("command")
        .and_then(Value::as_str)
        .ok_or_else(|| Error::Validation("exec tool call missing \"command\"".into()))?
        .to_string();

    let gate_config = state.gate_config_for_agent(agent_id)?;
    let params = ExecParams {
        agent_id: agent_id.to_string(),
        command,
        workdir: None,
        env: Default::default(),
        yield_ms: Some(state.config.exec.yield_ms),
        background: false,
        timeout_sec: Some(state.config.exec.timeout_sec),
        pty: false,
        elevated: false,
        host: agent.exec_host,
        security: agent.exec_security,
        ask: agent.exec_ask,
        node: None,
        session_key: Some(session_key.to_string()),
        notify_on_exit: state.config.exec.notify_on_exit,
    };

    let deps = ExecDeps {
        manager: &state.exec_manager,
        gate_config: &gate_config,
        approvals: &state.approvals,
        approval_pending: &state.approval_pending,
        approval_socket: state.approval_socket.as_deref(),
        nodes: &state.nodes,
        invoke_router: &state.invoke_router,
        denied_patterns: state.denied_patterns.as_slice(),
        path_prepend: &[],
        container_workspace: std::path::Path::new("/home/node/work"),
        path_probe_timeout: Duration::from_secs(5),
        approval_timeout: Duration::from_secs(120),
        exit_notifier: Some(exit_notifier(state.clone())),
    };

    cb_sandbox::run_exec(&deps, params).await.map(|_outcome| ())
}

/// Builds the callback a backgrounded exec session fires on exit (spec
/// §4.F step 11): turns the notification into a `system` event on the
/// shared event bus and an immediate `tick` to wake any client waiting on
/// the heartbeat rather than the next periodic tick.
fn exit_notifier(state: Arc<AppState>) -> cb_sandbox::ExitNotifier {
    Arc::new(move |notification: cb_sandbox::ExitNotification| {
        let _ = state
            .events
            .send(GatewayEvent::system(&notification.session_key, &notification.text));
        let _ = state.events.send(GatewayEvent::tick());
    })
}

async fn dispatch_node_tool_call(state: &Arc<AppState>, call: &ToolCall) -> Result<()> {
    let args = call.arguments.as_map().cloned().unwrap_or_default();
    let node_id = args
        .get("nodeId")
        .and_then(Value::as_str)
        .ok_or_else(|| Error::Validation("node.invoke missing \"nodeId\"".into()))?;
    let command = args
        .get("command")
        .and_then(Value::as_str)
        .ok_or_else(|| Error::Validation("node.invoke missing \"command\"".into()))?;
    let idempotency_key = args.get("idempotencyKey").and_then(Value::as_str).map(str::to_string);
    let params = args.get("params").cloned().unwrap_or(Value::Null);

    state
        .invoke_router
        .invoke(node_id, command, params, idempotency_key, Duration::from_secs(30))
        .await
        .map(|_| ())
}
