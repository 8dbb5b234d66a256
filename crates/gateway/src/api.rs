//! RPC dispatch table (spec §4.H): `node.list`, `node.invoke`,
//! `session.*`, `exec.approval.request`, and the message-submission entry
//! point the Session Orchestrator (§4.I) drains.
//!
//! Grounded on the teacher's `api/router.rs` handler shape (parse params,
//! call into a component, map the result to a response envelope), folded
//! into a single `match` over `method` instead of per-route axum handlers
//! since this spec's surface is one RPC multiplex, not a REST tree.

use std::sync::Arc;
use std::time::Duration;

use serde::Deserialize;

use cb_approvals::ApprovalDecision;
use cb_domain::{Error, Value};
use cb_protocol::{RpcReq, RpcRes};
use cb_sandbox::{handle_process, ProcessRequest};
use cb_sessions::SessionEntry;

use crate::orchestrator;
use crate::state::AppState;

fn err_res(id: &str, e: Error) -> RpcRes {
    RpcRes::err(id, e.code(), e.to_string())
}

fn bad_params(id: &str, e: serde_json::Error) -> RpcRes {
    RpcRes::err(id, "validation", format!("invalid params: {e}"))
}

/// Handle one `rpc.req` and produce the matching `rpc.res`. `agent_id` is
/// the identity the connection authenticated as (spec §4.C: session
/// resolution falls back to this agent when a request doesn't name one).
pub async fn dispatch(state: &Arc<AppState>, agent_id: &str, req: RpcReq) -> RpcRes {
    let id = req.id.clone();
    let params = req.params.to_json();

    match req.method.as_str() {
        "node.list" => {
            let nodes = state.nodes.list();
            RpcRes::ok(id, Value::from_json(serde_json::json!({ "nodes": nodes })))
        }

        "node.invoke" => handle_node_invoke(state, &id, params).await,

        "session.get" => handle_session_get(state, agent_id, &id, params),
        "session.setOverride" => handle_session_set_override(state, agent_id, &id, params).await,
        "session.resetModel" => handle_session_reset_model(state, agent_id, &id, params).await,

        "exec.approval.request" => handle_exec_approval(state, &id, params),

        "process" => match serde_json::from_value::<ProcessRequest>(params) {
            Ok(req) => {
                let resp = handle_process(&state.exec_manager, req).await;
                RpcRes::ok(id, Value::from_json(serde_json::to_value(resp).unwrap_or_default()))
            }
            Err(e) => bad_params(&id, e),
        },

        "message.submit" => handle_message_submit(state, agent_id, &id, params).await,

        other => RpcRes::err(id, "validation", format!("unknown method {other:?}")),
    }
}

#[derive(Debug, Deserialize)]
struct NodeInvokeParams {
    node_id: String,
    command: String,
    #[serde(default)]
    params: serde_json::Value,
    #[serde(default)]
    idempotency_key: Option<String>,
    #[serde(default)]
    timeout_ms: Option<u64>,
}

async fn handle_node_invoke(state: &Arc<AppState>, id: &str, params: serde_json::Value) -> RpcRes {
    let parsed: NodeInvokeParams = match serde_json::from_value(params) {
        Ok(p) => p,
        Err(e) => return bad_params(id, e),
    };
    let timeout = Duration::from_millis(parsed.timeout_ms.unwrap_or(30_000));
    match state
        .invoke_router
        .invoke(
            &parsed.node_id,
            &parsed.command,
            Value::from_json(parsed.params),
            parsed.idempotency_key,
            timeout,
        )
        .await
    {
        Ok(result) => RpcRes::ok(id, Value::from_json(serde_json::to_value(result).unwrap_or_default())),
        Err(e) => err_res(id, e),
    }
}

#[derive(Debug, Deserialize)]
struct SessionKeyParams {
    key: String,
    #[serde(default)]
    agent_id: Option<String>,
}

fn handle_session_get(state: &Arc<AppState>, agent_id: &str, id: &str, params: serde_json::Value) -> RpcRes {
    let parsed: SessionKeyParams = match serde_json::from_value(params) {
        Ok(p) => p,
        Err(e) => return bad_params(id, e),
    };
    let default_agent = parsed.agent_id.as_deref().unwrap_or(agent_id);
    match state.sessions.resolve(&parsed.key, default_agent) {
        Ok(Some(entry)) => RpcRes::ok(id, Value::from_json(serde_json::to_value(entry).unwrap_or_default())),
        Ok(None) => RpcRes::ok(id, Value::Null),
        Err(e) => err_res(id, e),
    }
}

#[derive(Debug, Deserialize)]
struct SetOverrideParams {
    key: String,
    #[serde(default)]
    agent_id: Option<String>,
    provider: String,
    model: String,
}

async fn handle_session_set_override(state: &Arc<AppState>, agent_id: &str, id: &str, params: serde_json::Value) -> RpcRes {
    let parsed: SetOverrideParams = match serde_json::from_value(params) {
        Ok(p) => p,
        Err(e) => return bad_params(id, e),
    };
    let default_agent = parsed.agent_id.as_deref().unwrap_or(agent_id).to_string();
    let channel = default_agent.clone();
    let result = state
        .sessions
        .update(
            &parsed.key,
            || SessionEntry::new(uuid::Uuid::new_v4().to_string(), channel),
            |entry| entry.set_provider_model_override(parsed.provider.clone(), parsed.model.clone()),
        )
        .await;
    match result {
        Ok(entry) => RpcRes::ok(id, Value::from_json(serde_json::to_value(entry).unwrap_or_default())),
        Err(e) => err_res(id, e),
    }
}

async fn handle_session_reset_model(state: &Arc<AppState>, agent_id: &str, id: &str, params: serde_json::Value) -> RpcRes {
    let parsed: SessionKeyParams = match serde_json::from_value(params) {
        Ok(p) => p,
        Err(e) => return bad_params(id, e),
    };
    let default_agent = parsed.agent_id.as_deref().unwrap_or(agent_id).to_string();
    let channel = default_agent.clone();
    let result = state
        .sessions
        .update(
            &parsed.key,
            || SessionEntry::new(uuid::Uuid::new_v4().to_string(), channel),
            |entry| entry.reset_model(),
        )
        .await;
    match result {
        Ok(entry) => RpcRes::ok(id, Value::from_json(serde_json::to_value(entry).unwrap_or_default())),
        Err(e) => err_res(id, e),
    }
}

#[derive(Debug, Deserialize)]
#[serde(tag = "action", rename_all = "lowercase")]
enum ExecApprovalParams {
    List,
    Decide { id: uuid::Uuid, decision: ApprovalDecision },
}

fn handle_exec_approval(state: &Arc<AppState>, id: &str, params: serde_json::Value) -> RpcRes {
    let parsed: ExecApprovalParams = match serde_json::from_value(params) {
        Ok(p) => p,
        Err(e) => return bad_params(id, e),
    };
    match parsed {
        ExecApprovalParams::List => {
            let pending = state.approval_pending.list_pending();
            RpcRes::ok(id, Value::from_json(serde_json::to_value(pending).unwrap_or_default()))
        }
        ExecApprovalParams::Decide { id: approval_id, decision } => {
            let resolved = state.approval_pending.decide(approval_id, decision);
            RpcRes::ok(id, Value::Bool(resolved))
        }
    }
}

#[derive(Debug, Deserialize)]
struct MessageSubmitParams {
    session_key: String,
    text: String,
    #[serde(default)]
    agent_id: Option<String>,
}

async fn handle_message_submit(state: &Arc<AppState>, agent_id: &str, id: &str, params: serde_json::Value) -> RpcRes {
    let parsed: MessageSubmitParams = match serde_json::from_value(params) {
        Ok(p) => p,
        Err(e) => return bad_params(id, e),
    };
    let Some(normalized) = crate::inbound::normalize_submit(&parsed.text) else {
        return RpcRes::ok(id, Value::Null);
    };
    let text = match normalized {
        crate::inbound::Inbound::Message(text) => text,
        crate::inbound::Inbound::Command(cmd) => {
            // Command routing (e.g. `/model …`) is not itself a turn; it
            // mutates session state directly and is acknowledged without
            // enqueueing a Session Orchestrator turn.
            return RpcRes::ok(id, Value::from_json(serde_json::json!({ "command": cmd })));
        }
    };

    let resolved_agent = parsed.agent_id.unwrap_or_else(|| agent_id.to_string());
    match orchestrator::submit(state.clone(), resolved_agent, parsed.session_key, text).await {
        Ok(run_id) => RpcRes::ok(id, Value::from_json(serde_json::json!({ "runId": run_id.to_string() }))),
        Err(e) => err_res(id, e),
    }
}
