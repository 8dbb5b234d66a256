//! The event bus fed by the Session Orchestrator and drained by every Hub
//! connection's writer task (spec §4.H, §4.I): `chat`, `tick`, `health`,
//! `system` (exec exit notifications, spec §4.F step 11).
//!
//! A `tokio::broadcast` channel, not a per-connection queue — every
//! connected client observes the same logical event stream; the Hub
//! assigns each connection its own monotonic `seq` as it forwards.

use cb_domain::Value;

#[derive(Debug, Clone)]
pub struct GatewayEvent {
    pub event: String,
    pub payload: Value,
}

impl GatewayEvent {
    pub fn chat(run_id: uuid::Uuid, session_key: &str, state: &str) -> Self {
        Self {
            event: "chat".into(),
            payload: Value::from_json(serde_json::json!({
                "runId": run_id.to_string(),
                "sessionKey": session_key,
                "state": state,
            })),
        }
    }

    pub fn tick() -> Self {
        Self {
            event: "tick".into(),
            payload: Value::Null,
        }
    }

    pub fn health(healthy: bool) -> Self {
        Self {
            event: "health".into(),
            payload: Value::Bool(healthy),
        }
    }

    /// A backgrounded exec session's exit notification (spec §4.F step
    /// 11): `"Exec <status> (<id8>, <code|signal>) :: <tail>"`, addressed
    /// to the session it ran under.
    pub fn system(session_key: &str, text: &str) -> Self {
        Self {
            event: "system".into(),
            payload: Value::from_json(serde_json::json!({
                "sessionKey": session_key,
                "text": text,
            })),
        }
    }
}
