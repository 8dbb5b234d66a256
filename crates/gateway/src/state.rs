//! Shared application state (spec §4.H, §4.I).
//!
//! Grounded on `sa_gateway::state::AppState`'s Arc-fields-grouped-by-concern
//! shape, trimmed to the components this spec actually names: config,
//! sessions, node registry/invoke router, sandbox exec manager, approvals,
//! policy composition inputs, and auth token hashes. The teacher's memory/
//! skills/workspace/MCP/import/dashboard fields have no counterpart here.

use std::path::PathBuf;
use std::sync::Arc;

use cb_approvals::{ApprovalSocket, ApprovalStore as ApprovalPendingStore, ApprovalsStore};
use cb_domain::config::Config;
use cb_domain::{Error, Result};
use cb_nodes::{InvokeRouter, NodeRegistry};
use cb_providers::{Message, ModelProvider, ModelSelector, StreamEvent, ToolDefinition};
use cb_sandbox::ExecManager;
use cb_sessions::SessionStore;
use futures_util::stream::BoxStream;
use parking_lot::RwLock;

use crate::events::GatewayEvent;
use crate::orchestrator::cancel::CancelMap;
use crate::orchestrator::queue::SessionQueue;
use crate::orchestrator::session_lock::SessionLockMap;

/// Stands in for a concrete model provider (spec §1: provider adapters are
/// an external collaborator, not part of this crate). Every call fails
/// with an upstream error that the Session Orchestrator's retry path
/// treats like any other unreachable upstream; `cb-gateway` only ever
/// substitutes this when no provider was registered.
pub struct UnconfiguredProvider;

#[async_trait::async_trait]
impl ModelProvider for UnconfiguredProvider {
    async fn model_call(
        &self,
        _selector: &ModelSelector,
        _transcript: Vec<Message>,
        _tools: Vec<ToolDefinition>,
    ) -> Result<BoxStream<'static, Result<StreamEvent>>> {
        Err(Error::Upstream(
            "no model provider configured for this gateway".into(),
        ))
    }
}

/// Everything the Hub and Session Orchestrator share across connections.
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<Config>,
    pub sessions: Arc<SessionStore>,
    pub session_locks: Arc<SessionLockMap>,
    pub session_queue: Arc<SessionQueue>,
    pub cancel_map: Arc<CancelMap>,
    pub events: tokio::sync::broadcast::Sender<GatewayEvent>,

    pub exec_manager: Arc<ExecManager>,
    pub approvals: Arc<ApprovalsStore>,
    pub approval_pending: Arc<ApprovalPendingStore>,
    pub approval_socket: Option<Arc<ApprovalSocket>>,
    pub denied_patterns: Arc<Vec<regex::Regex>>,

    pub nodes: Arc<NodeRegistry>,
    pub invoke_router: Arc<InvokeRouter>,

    pub providers: Arc<dyn ModelProvider>,

    /// SHA-256 digest of the gateway bearer token, if one is configured.
    /// `None` means dev mode: `hello` frames are accepted unauthenticated.
    pub token_hash: Option<Vec<u8>>,

    pub started_at: chrono::DateTime<chrono::Utc>,
    pub boot_id: uuid::Uuid,

    /// Monotonically increasing health-state version, bumped whenever
    /// node presence or config changes in a way clients should notice via
    /// `HelloOk.snapshot.stateVersion` (spec §6).
    pub state_version: Arc<RwLock<StateVersion>>,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct StateVersion {
    pub presence: u64,
    pub health: u64,
}

impl AppState {
    /// Resolve the gating inputs for `agent_id` into the shape
    /// `cb_sandbox::gate::GateConfig` expects. Spec §4.F step 1-6 reads
    /// these off the agent's config entry, falling back to `exec.*`
    /// top-level defaults for agents not explicitly configured.
    pub fn gate_config_for_agent(&self, agent_id: &str) -> Result<cb_sandbox::GateConfig> {
        let workspace_root = match self.config.agents.get(agent_id) {
            Some(agent) if !agent.workspace_path.is_empty() => PathBuf::from(&agent.workspace_path),
            _ => {
                return Err(Error::Validation(format!(
                    "unknown or unconfigured agent {agent_id:?}"
                )))
            }
        };
        let agent = &self.config.agents[agent_id];
        Ok(cb_sandbox::GateConfig {
            configured_host: agent.exec_host,
            configured_security: agent.exec_security,
            configured_ask: agent.exec_ask,
            elevated_allowed: agent.exec_elevated_allowed,
            workspace_root,
        })
    }

    pub fn bump_presence(&self) {
        self.state_version.write().presence += 1;
    }

    pub fn bump_health(&self) {
        self.state_version.write().health += 1;
    }
}
