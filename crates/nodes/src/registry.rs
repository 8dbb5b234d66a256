//! Node Registry (spec §3, §4.G): tracks connected node peers and their
//! declared command allowlist.
//!
//! Grounded on `sa_gateway::nodes::registry::NodeRegistry`, trimmed from
//! its longest-prefix-capability routing (this spec's nodes declare a
//! flat `commands[]` list, not dotted capability prefixes) down to the
//! lifecycle + lookup operations §4.G actually names.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::Serialize;
use tokio::sync::mpsc;

use crate::router::NodeEvent;

pub type NodeSink = mpsc::Sender<NodeEvent>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Platform {
    Ios,
    Mac,
    Linux,
    Windows,
}

impl Platform {
    pub fn as_config_key(&self) -> &'static str {
        match self {
            Platform::Ios => "ios",
            Platform::Mac => "mac",
            Platform::Linux => "linux",
            Platform::Windows => "windows",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s.to_ascii_lowercase().as_str() {
            "ios" => Some(Platform::Ios),
            "mac" | "macos" => Some(Platform::Mac),
            "linux" => Some(Platform::Linux),
            "windows" | "win" => Some(Platform::Windows),
            _ => None,
        }
    }
}

/// A connected node peer (spec §3).
pub struct ConnectedNode {
    pub node_id: String,
    pub display_name: String,
    pub platform: Platform,
    pub commands: Vec<String>,
    pub last_seen_at: DateTime<Utc>,
    pub sink: NodeSink,
}

#[derive(Debug, Clone, Serialize)]
pub struct NodeInfo {
    pub node_id: String,
    pub display_name: String,
    pub platform: Platform,
    pub commands: Vec<String>,
    pub last_seen_at: DateTime<Utc>,
}

/// Thread-safe registry of connected nodes, created on `hello` and
/// destroyed on socket close (after a grace period enforced by
/// `prune_stale`).
pub struct NodeRegistry {
    nodes: RwLock<HashMap<String, ConnectedNode>>,
}

impl Default for NodeRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl NodeRegistry {
    pub fn new() -> Self {
        Self {
            nodes: RwLock::new(HashMap::new()),
        }
    }

    /// Register a node connection, replacing any existing entry with the
    /// same `node_id` (reconnect).
    pub fn register(&self, node: ConnectedNode) {
        let id = node.node_id.clone();
        tracing::info!(
            node_id = %id,
            platform = ?node.platform,
            commands = node.commands.len(),
            "node registered"
        );
        self.nodes.write().insert(id, node);
    }

    pub fn remove(&self, node_id: &str) {
        if self.nodes.write().remove(node_id).is_some() {
            tracing::info!(node_id = %node_id, "node removed");
        }
    }

    pub fn touch(&self, node_id: &str) {
        if let Some(n) = self.nodes.write().get_mut(node_id) {
            n.last_seen_at = Utc::now();
        }
    }

    pub fn get_sink(&self, node_id: &str) -> Option<NodeSink> {
        self.nodes.read().get(node_id).map(|n| n.sink.clone())
    }

    pub fn declares_command(&self, node_id: &str, command: &str) -> bool {
        self.nodes
            .read()
            .get(node_id)
            .map(|n| n.commands.iter().any(|c| c == command))
            .unwrap_or(false)
    }

    pub fn platform_of(&self, node_id: &str) -> Option<Platform> {
        self.nodes.read().get(node_id).map(|n| n.platform)
    }

    pub fn list(&self) -> Vec<NodeInfo> {
        self.nodes
            .read()
            .values()
            .map(|n| NodeInfo {
                node_id: n.node_id.clone(),
                display_name: n.display_name.clone(),
                platform: n.platform,
                commands: n.commands.clone(),
                last_seen_at: n.last_seen_at,
            })
            .collect()
    }

    pub fn len(&self) -> usize {
        self.nodes.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.read().is_empty()
    }

    pub fn contains(&self, node_id: &str) -> bool {
        self.nodes.read().contains_key(node_id)
    }

    /// Nodes declaring a given command, e.g. to pick the sole candidate
    /// for `host=node` when the caller didn't name one (spec §4.F step 7).
    pub fn nodes_declaring(&self, command: &str) -> Vec<String> {
        self.nodes
            .read()
            .values()
            .filter(|n| n.commands.iter().any(|c| c == command))
            .map(|n| n.node_id.clone())
            .collect()
    }

    pub fn prune_stale(&self, stale_after_sec: i64) {
        let now = Utc::now();
        let mut nodes = self.nodes.write();
        let before = nodes.len();
        nodes.retain(|_, n| now.signed_duration_since(n.last_seen_at).num_seconds() < stale_after_sec);
        let pruned = before - nodes.len();
        if pruned > 0 {
            tracing::info!(pruned, remaining = nodes.len(), "pruned stale nodes");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn node(id: &str, commands: &[&str]) -> (ConnectedNode, mpsc::Receiver<NodeEvent>) {
        let (tx, rx) = mpsc::channel(4);
        (
            ConnectedNode {
                node_id: id.into(),
                display_name: id.into(),
                platform: Platform::Mac,
                commands: commands.iter().map(|s| s.to_string()).collect(),
                last_seen_at: Utc::now(),
                sink: tx,
            },
            rx,
        )
    }

    #[test]
    fn register_and_declares_command() {
        let reg = NodeRegistry::new();
        let (n, _rx) = node("n1", &["system.run", "canvas.snapshot"]);
        reg.register(n);
        assert!(reg.declares_command("n1", "system.run"));
        assert!(!reg.declares_command("n1", "notify.push"));
    }

    #[test]
    fn register_replaces_duplicate() {
        let reg = NodeRegistry::new();
        let (n1, _rx1) = node("n1", &["a"]);
        reg.register(n1);
        let (n2, _rx2) = node("n1", &["a", "b"]);
        reg.register(n2);
        assert_eq!(reg.len(), 1);
        assert_eq!(reg.list()[0].commands.len(), 2);
    }

    #[test]
    fn remove_and_len() {
        let reg = NodeRegistry::new();
        let (n, _rx) = node("n1", &[]);
        reg.register(n);
        assert_eq!(reg.len(), 1);
        reg.remove("n1");
        assert!(reg.is_empty());
    }

    #[test]
    fn nodes_declaring_filters_by_command() {
        let reg = NodeRegistry::new();
        let (n1, _rx1) = node("n1", &["system.run"]);
        let (n2, _rx2) = node("n2", &["canvas.snapshot"]);
        reg.register(n1);
        reg.register(n2);
        assert_eq!(reg.nodes_declaring("system.run"), vec!["n1".to_string()]);
    }

    #[test]
    fn platform_parse_accepts_aliases() {
        assert_eq!(Platform::parse("macos"), Some(Platform::Mac));
        assert_eq!(Platform::parse("WINDOWS"), Some(Platform::Windows));
        assert_eq!(Platform::parse("bogus"), None);
    }
}
