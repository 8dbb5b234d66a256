//! Invoke Router (spec §3, §4.G): routes `node.invoke` RPCs to connected
//! nodes, deduplicating identical `(nodeId, idempotencyKey)` calls onto a
//! single in-flight ticket.
//!
//! Grounded on `sa_gateway::nodes::router::ToolRouter` (bounded pending
//! map, oneshot round trip, per-node fail-on-disconnect), extended with
//! idempotency-keyed ticket sharing — the teacher dedups only by an
//! always-unique `request_id`, so two identical calls there always hit
//! the node twice; this spec requires the opposite (§8: "exactly one
//! request reaches the node").

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use cb_domain::{Error, Result, Value};
use parking_lot::Mutex;
use serde::Serialize;
use tokio::sync::{mpsc, oneshot};
use uuid::Uuid;

use crate::registry::NodeRegistry;

/// A message the gateway pushes to a connected node's socket.
#[derive(Debug, Clone)]
pub enum NodeEvent {
    InvokeRequest {
        id: Uuid,
        node_id: String,
        command: String,
        params: Value,
    },
}

#[derive(Debug, Clone, Serialize)]
pub struct InvokeResult {
    pub ok: bool,
    pub payload: Option<Value>,
    pub error: Option<String>,
}

struct Ticket {
    node_id: String,
    idempotency_key: Option<String>,
    created: std::time::Instant,
    result: Option<InvokeResult>,
    responders: Vec<oneshot::Sender<InvokeResult>>,
}

/// Tracks in-flight and recently-completed invoke tickets, keyed by
/// `(nodeId, idempotencyKey)` within a retention window (spec §3, §8).
pub struct InvokeRouter {
    nodes: Arc<NodeRegistry>,
    tickets: Mutex<HashMap<Uuid, Ticket>>,
    /// `(node_id, idempotency_key) -> ticket id`, retained for
    /// `retention` after creation so late-arriving duplicate callers
    /// still attach to the same ticket.
    dedupe: Mutex<HashMap<(String, String), (Uuid, std::time::Instant)>>,
    retention: Duration,
    /// Per-platform hardcoded command catalog (spec §4.G: a command
    /// must be declared by the node *and* appear in its platform's
    /// catalog to be invocable).
    platform_commands: HashMap<String, Vec<String>>,
}

impl InvokeRouter {
    pub fn new(
        nodes: Arc<NodeRegistry>,
        retention: Duration,
        platform_commands: HashMap<String, Vec<String>>,
    ) -> Self {
        Self {
            nodes,
            tickets: Mutex::new(HashMap::new()),
            dedupe: Mutex::new(HashMap::new()),
            retention,
            platform_commands,
        }
    }

    fn platform_allows(&self, node_id: &str, command: &str) -> bool {
        let Some(platform) = self.nodes.platform_of(node_id) else {
            return false;
        };
        self.platform_commands
            .get(platform.as_config_key())
            .map(|allowed| allowed.iter().any(|c| c == command))
            .unwrap_or(false)
    }

    fn sweep_dedupe_locked(&self, dedupe: &mut HashMap<(String, String), (Uuid, std::time::Instant)>) {
        let now = std::time::Instant::now();
        dedupe.retain(|_, (_, created)| now.duration_since(*created) < self.retention);
    }

    /// `node.invoke(nodeId, command, params, idempotencyKey, timeoutMs?)`
    /// (spec §4.G). Rejects commands the node hasn't declared or that
    /// aren't in the platform's hardcoded catalog; otherwise creates or
    /// attaches to a ticket and waits for the node's result.
    pub async fn invoke(
        &self,
        node_id: &str,
        command: &str,
        params: Value,
        idempotency_key: Option<String>,
        timeout: Duration,
    ) -> Result<InvokeResult> {
        if !self.nodes.declares_command(node_id, command) || !self.platform_allows(node_id, command) {
            return Err(Error::Policy {
                gate: "node-allowlist".into(),
                reason: format!("node command not allowed: {command}"),
            });
        }

        let sink = self
            .nodes
            .get_sink(node_id)
            .ok_or_else(|| Error::NodeDisconnected(node_id.to_string()))?;

        let (ticket_id, rx) = self.create_or_attach(node_id, command, &params, idempotency_key.clone(), &sink)?;

        let outcome = tokio::time::timeout(timeout, rx).await;
        match outcome {
            Ok(Ok(result)) => Ok(result),
            Ok(Err(_)) => Err(Error::NodeDisconnected(node_id.to_string())),
            Err(_) => {
                self.tickets.lock().remove(&ticket_id);
                Err(Error::Timeout(format!(
                    "node.invoke({command}) on {node_id} timed out"
                )))
            }
        }
    }

    /// Returns `(ticket_id, receiver)`. If an identical `(node, key)`
    /// invocation is already in flight (or recently completed, within
    /// the retention window), attaches to it instead of re-sending.
    fn create_or_attach(
        &self,
        node_id: &str,
        command: &str,
        params: &Value,
        idempotency_key: Option<String>,
        sink: &mpsc::Sender<NodeEvent>,
    ) -> Result<(Uuid, oneshot::Receiver<InvokeResult>)> {
        let (tx, rx) = oneshot::channel();

        if let Some(key) = &idempotency_key {
            let dedupe_key = (node_id.to_string(), key.clone());
            let mut dedupe = self.dedupe.lock();
            self.sweep_dedupe_locked(&mut dedupe);

            if let Some((existing_id, _)) = dedupe.get(&dedupe_key).copied() {
                let mut tickets = self.tickets.lock();
                if let Some(ticket) = tickets.get_mut(&existing_id) {
                    if let Some(result) = &ticket.result {
                        let _ = tx.send(result.clone_for_attach());
                    } else {
                        ticket.responders.push(tx);
                    }
                    return Ok((existing_id, rx));
                }
            }

            let id = Uuid::new_v4();
            dedupe.insert(dedupe_key, (id, std::time::Instant::now()));
            self.tickets.lock().insert(
                id,
                Ticket {
                    node_id: node_id.to_string(),
                    idempotency_key: idempotency_key.clone(),
                    created: std::time::Instant::now(),
                    result: None,
                    responders: vec![tx],
                },
            );
            self.send(sink, id, node_id, command, params)?;
            Ok((id, rx))
        } else {
            let id = Uuid::new_v4();
            self.tickets.lock().insert(
                id,
                Ticket {
                    node_id: node_id.to_string(),
                    idempotency_key: None,
                    created: std::time::Instant::now(),
                    result: None,
                    responders: vec![tx],
                },
            );
            self.send(sink, id, node_id, command, params)?;
            Ok((id, rx))
        }
    }

    fn send(
        &self,
        sink: &mpsc::Sender<NodeEvent>,
        id: Uuid,
        node_id: &str,
        command: &str,
        params: &Value,
    ) -> Result<()> {
        sink.try_send(NodeEvent::InvokeRequest {
            id,
            node_id: node_id.to_string(),
            command: command.to_string(),
            params: params.clone(),
        })
        .map_err(|_| Error::NodeDisconnected(node_id.to_string()))
    }

    /// Called by the node's socket handler when `node.invoke.result`
    /// arrives: resolves every pending responder attached to the ticket.
    pub fn complete(&self, id: Uuid, ok: bool, payload: Option<Value>, error: Option<String>) {
        let mut tickets = self.tickets.lock();
        if let Some(ticket) = tickets.get_mut(&id) {
            tracing::debug!(
                id = %id,
                node_id = %ticket.node_id,
                idempotency_key = ?ticket.idempotency_key,
                ok,
                "node.invoke.result received"
            );
            let result = InvokeResult { ok, payload, error };
            for responder in ticket.responders.drain(..) {
                let _ = responder.send(result.clone_for_attach());
            }
            ticket.result = Some(result);
        } else {
            tracing::warn!(id = %id, "received node.invoke.result for unknown ticket");
        }
    }

    /// On node disconnect, in-flight tickets for that node fail with
    /// `node-disconnected` (spec §4.G).
    pub fn fail_pending_for_node(&self, node_id: &str) -> usize {
        let mut tickets = self.tickets.lock();
        let mut failed = 0;
        for ticket in tickets.values_mut() {
            if ticket.node_id == node_id && ticket.result.is_none() {
                for responder in ticket.responders.drain(..) {
                    let _ = responder.send(InvokeResult {
                        ok: false,
                        payload: None,
                        error: Some(format!("node {node_id} disconnected")),
                    });
                }
                ticket.result = Some(InvokeResult {
                    ok: false,
                    payload: None,
                    error: Some("node-disconnected".into()),
                });
                failed += 1;
            }
        }
        if failed > 0 {
            tracing::warn!(node_id = %node_id, failed, "failed in-flight invoke tickets");
        }
        failed
    }

    pub fn pending_count(&self) -> usize {
        self.tickets.lock().values().filter(|t| t.result.is_none()).count()
    }

    /// Drop tickets (and their dedupe entries) older than the retention
    /// window, regardless of completion state.
    pub fn sweep(&self) {
        let retention = self.retention;
        self.tickets.lock().retain(|_, t| t.created.elapsed() < retention);
        let mut dedupe = self.dedupe.lock();
        self.sweep_dedupe_locked(&mut dedupe);
    }
}

impl InvokeResult {
    fn clone_for_attach(&self) -> Self {
        Self {
            ok: self.ok,
            payload: self.payload.clone(),
            error: self.error.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::{ConnectedNode, Platform};
    use std::collections::HashMap as StdHashMap;

    fn registry_with_node(commands: &[&str]) -> (Arc<NodeRegistry>, mpsc::Receiver<NodeEvent>) {
        let reg = Arc::new(NodeRegistry::new());
        let (tx, rx) = mpsc::channel(8);
        reg.register(ConnectedNode {
            node_id: "n1".into(),
            display_name: "n1".into(),
            platform: Platform::Mac,
            commands: commands.iter().map(|s| s.to_string()).collect(),
            last_seen_at: chrono::Utc::now(),
            sink: tx,
        });
        (reg, rx)
    }

    fn platform_catalog() -> StdHashMap<String, Vec<String>> {
        let mut m = StdHashMap::new();
        m.insert(
            "mac".to_string(),
            vec!["system.run".to_string(), "canvas.snapshot".to_string()],
        );
        m
    }

    #[tokio::test]
    async fn disallowed_command_is_rejected() {
        let (reg, _rx) = registry_with_node(&["canvas.snapshot"]);
        let router = InvokeRouter::new(reg, Duration::from_secs(60), platform_catalog());
        let err = router
            .invoke("n1", "system.run", Value::Null, None, Duration::from_millis(50))
            .await
            .unwrap_err();
        assert!(err.to_string().contains("node command not allowed"));
    }

    #[tokio::test]
    async fn allowed_command_forwards_and_resolves() {
        let (reg, mut rx) = registry_with_node(&["canvas.snapshot"]);
        let router = Arc::new(InvokeRouter::new(reg, Duration::from_secs(60), platform_catalog()));

        let router2 = router.clone();
        let responder = tokio::spawn(async move {
            let NodeEvent::InvokeRequest { id, .. } = rx.recv().await.unwrap();
            router2.complete(id, true, None, None);
        });

        let result = router
            .invoke("n1", "canvas.snapshot", Value::Null, None, Duration::from_secs(1))
            .await
            .unwrap();
        assert!(result.ok);
        assert!(result.payload.is_none());
        responder.await.unwrap();
    }

    #[tokio::test]
    async fn identical_idempotency_key_shares_one_ticket() {
        let (reg, mut rx) = registry_with_node(&["canvas.snapshot"]);
        let router = Arc::new(InvokeRouter::new(reg, Duration::from_secs(60), platform_catalog()));

        let r1 = router.clone();
        let r2 = router.clone();
        let call1 = tokio::spawn(async move {
            r1.invoke(
                "n1",
                "canvas.snapshot",
                Value::Null,
                Some("key-1".into()),
                Duration::from_secs(1),
            )
            .await
        });
        // Give call1 a chance to register its ticket before call2 attaches.
        tokio::time::sleep(Duration::from_millis(10)).await;
        let call2 = tokio::spawn(async move {
            r2.invoke(
                "n1",
                "canvas.snapshot",
                Value::Null,
                Some("key-1".into()),
                Duration::from_secs(1),
            )
            .await
        });

        // Only one InvokeRequest should reach the node.
        let NodeEvent::InvokeRequest { id, .. } = rx.recv().await.unwrap();
        router.complete(id, true, None, None);

        let (res1, res2) = tokio::join!(call1, call2);
        assert!(res1.unwrap().unwrap().ok);
        assert!(res2.unwrap().unwrap().ok);
        assert!(rx.try_recv().is_err(), "a second request must not have been sent");
    }

    #[tokio::test]
    async fn node_disconnect_fails_pending() {
        let (reg, _rx) = registry_with_node(&["canvas.snapshot"]);
        let router = Arc::new(InvokeRouter::new(reg, Duration::from_secs(60), platform_catalog()));

        let r2 = router.clone();
        let call = tokio::spawn(async move {
            r2.invoke(
                "n1",
                "canvas.snapshot",
                Value::Null,
                None,
                Duration::from_secs(5),
            )
            .await
        });
        tokio::time::sleep(Duration::from_millis(10)).await;
        let failed = router.fail_pending_for_node("n1");
        assert_eq!(failed, 1);
        let err = call.await.unwrap().unwrap_err();
        assert_eq!(err.code(), "node-disconnected");
    }
}
