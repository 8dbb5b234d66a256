//! Approval Socket (spec §4.E): a line-delimited JSON protocol over a
//! Unix domain socket. The gateway listens; one or more approver
//! processes connect, receive `request` frames for every pending
//! approval, and reply with `decision` frames naming the request id.
//!
//! Grounded on the `oneshot`-round-trip shape of [`crate::pending::ApprovalStore`]
//! and on the constant-time token comparison pattern used for node-socket
//! auth in the teacher (`token_eq`: SHA-256 digest + `subtle::ConstantTimeEq`).

use std::path::Path;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use subtle::ConstantTimeEq;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::UnixListener;
use tokio::sync::broadcast;
use uuid::Uuid;

use cb_domain::config::{AskMode, SecurityMode};

use crate::pending::{ApprovalDecision, ApprovalStore};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RequestPayload {
    pub command: String,
    pub cwd: Option<String>,
    pub host: String,
    pub security: SecurityMode,
    pub ask: AskMode,
    pub agent_id: String,
    pub resolved_path: Option<String>,
    pub session_key: Option<String>,
    pub timeout_ms: u64,
}

#[derive(Debug, Clone, Serialize)]
struct RequestEnvelope {
    #[serde(rename = "type")]
    kind: &'static str,
    token: String,
    id: Uuid,
    request: RequestPayload,
}

#[derive(Debug, Clone, Deserialize)]
struct DecisionEnvelope {
    #[serde(rename = "type")]
    kind: String,
    id: Uuid,
    decision: ApprovalDecision,
}

pub fn token_eq(a: &str, b: &str) -> bool {
    let da = Sha256::digest(a.as_bytes());
    let db = Sha256::digest(b.as_bytes());
    da.ct_eq(&db).into()
}

pub struct ApprovalSocket {
    store: Arc<ApprovalStore>,
    token: String,
    broadcast: broadcast::Sender<String>,
}

impl ApprovalSocket {
    pub fn new(store: Arc<ApprovalStore>, token: String) -> Self {
        let (broadcast, _rx) = broadcast::channel(256);
        Self {
            store,
            token,
            broadcast,
        }
    }

    /// Publish a pending request to every connected responder.
    pub fn publish_request(&self, id: Uuid, request: RequestPayload) {
        let envelope = RequestEnvelope {
            kind: "request",
            token: self.token.clone(),
            id,
            request,
        };
        if let Ok(line) = serde_json::to_string(&envelope) {
            let _ = self.broadcast.send(line);
        }
    }

    /// Bind the listener and serve connections until the returned future
    /// is dropped or the listener errs.
    pub async fn serve(self: Arc<Self>, socket_path: &Path) -> std::io::Result<()> {
        if socket_path.exists() {
            let _ = std::fs::remove_file(socket_path);
        }
        let listener = UnixListener::bind(socket_path)?;
        loop {
            let (stream, _addr) = listener.accept().await?;
            let this = self.clone();
            tokio::spawn(async move {
                if let Err(e) = this.handle_connection(stream).await {
                    tracing::debug!(error = %e, "approval socket connection closed");
                }
            });
        }
    }

    async fn handle_connection(&self, stream: tokio::net::UnixStream) -> std::io::Result<()> {
        let (reader, mut writer) = stream.into_split();
        let mut lines = BufReader::new(reader).lines();
        let mut rx = self.broadcast.subscribe();

        loop {
            tokio::select! {
                maybe_line = lines.next_line() => {
                    let Some(line) = maybe_line? else { break };
                    self.handle_line(&line);
                }
                broadcasted = rx.recv() => {
                    match broadcasted {
                        Ok(line) => {
                            writer.write_all(line.as_bytes()).await?;
                            writer.write_all(b"\n").await?;
                        }
                        Err(broadcast::error::RecvError::Lagged(_)) => continue,
                        Err(broadcast::error::RecvError::Closed) => break,
                    }
                }
            }
        }
        Ok(())
    }

    fn handle_line(&self, line: &str) {
        let decision: DecisionEnvelope = match serde_json::from_str(line) {
            Ok(d) => d,
            Err(_) => return,
        };
        if decision.kind != "decision" {
            return;
        }
        self.store.decide(decision.id, decision.decision);
    }
}

/// If no responder answers within `timeoutMs`, fall back per `askFallback`
/// (spec §4.E): `full` permits, `allowlist` defers to an allowlist match,
/// anything else denies.
pub fn ask_fallback_decision(ask_fallback: SecurityMode, matched_allowlist: bool) -> ApprovalDecision {
    match ask_fallback {
        SecurityMode::Full => ApprovalDecision::AllowOnce,
        SecurityMode::Allowlist => {
            if matched_allowlist {
                ApprovalDecision::AllowOnce
            } else {
                ApprovalDecision::Deny
            }
        }
        SecurityMode::Deny => ApprovalDecision::Deny,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn token_eq_matches_equal_tokens() {
        assert!(token_eq("abc", "abc"));
        assert!(!token_eq("abc", "abd"));
    }

    #[test]
    fn fallback_full_permits() {
        assert_eq!(
            ask_fallback_decision(SecurityMode::Full, false),
            ApprovalDecision::AllowOnce
        );
    }

    #[test]
    fn fallback_allowlist_defers_to_match() {
        assert_eq!(
            ask_fallback_decision(SecurityMode::Allowlist, true),
            ApprovalDecision::AllowOnce
        );
        assert_eq!(
            ask_fallback_decision(SecurityMode::Allowlist, false),
            ApprovalDecision::Deny
        );
    }

    #[test]
    fn fallback_deny_always_denies() {
        assert_eq!(
            ask_fallback_decision(SecurityMode::Deny, true),
            ApprovalDecision::Deny
        );
    }
}
