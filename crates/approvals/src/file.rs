//! Approvals File (spec §3, §4.D): `exec-approvals.json`, 0600, single
//! writer, readers always reload from disk (Design Note §9).

use std::collections::HashMap;
use std::io;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;

use cb_domain::config::{AskMode, SecurityMode};
use cb_domain::{Error, Result};

use crate::glob::AllowlistEntry;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SocketConfig {
    pub path: String,
    pub token: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Defaults {
    pub security: Option<SecurityMode>,
    pub ask: Option<AskMode>,
    pub ask_fallback: Option<SecurityMode>,
    pub auto_allow_skills: Option<bool>,
}

impl Default for Defaults {
    fn default() -> Self {
        Self {
            security: None,
            ask: None,
            ask_fallback: None,
            auto_allow_skills: None,
        }
    }
}

impl Defaults {
    /// `defaults = file.defaults ⊕ overrides ⊕ hardcoded(...)` (spec §4.D).
    fn merge(self, overrides: &Defaults) -> ResolvedDefaults {
        ResolvedDefaults {
            security: overrides
                .security
                .or(self.security)
                .unwrap_or(SecurityMode::Deny),
            ask: overrides.ask.or(self.ask).unwrap_or(AskMode::OnMiss),
            ask_fallback: overrides
                .ask_fallback
                .or(self.ask_fallback)
                .unwrap_or(SecurityMode::Deny),
            auto_allow_skills: overrides
                .auto_allow_skills
                .or(self.auto_allow_skills)
                .unwrap_or(false),
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct ResolvedDefaults {
    pub security: SecurityMode,
    pub ask: AskMode,
    pub ask_fallback: SecurityMode,
    pub auto_allow_skills: bool,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AgentApprovals {
    pub security: Option<SecurityMode>,
    pub ask: Option<AskMode>,
    pub ask_fallback: Option<SecurityMode>,
    pub auto_allow_skills: Option<bool>,
    pub allowlist: Vec<AllowlistEntry>,
}

pub const WILDCARD_AGENT: &str = "*";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApprovalsFile {
    pub version: u32,
    pub socket: SocketConfig,
    #[serde(default)]
    pub defaults: Defaults,
    #[serde(default)]
    pub agents: HashMap<String, AgentApprovals>,
}

impl ApprovalsFile {
    fn fresh(socket_path: String) -> Self {
        Self {
            version: 1,
            socket: SocketConfig {
                path: socket_path,
                token: generate_token(),
            },
            defaults: Defaults::default(),
            agents: HashMap::new(),
        }
    }
}

/// 24 bytes of randomness hex-encoded, built from two v4 UUIDs rather
/// than pulling in a dedicated `rand` dependency the rest of the stack
/// doesn't otherwise need.
pub fn generate_token() -> String {
    let a = uuid::Uuid::new_v4();
    let b = uuid::Uuid::new_v4();
    let mut bytes = Vec::with_capacity(24);
    bytes.extend_from_slice(a.as_bytes());
    bytes.extend_from_slice(&b.as_bytes()[..8]);
    bytes.iter().map(|b| format!("{b:02x}")).collect()
}

pub struct ApprovalsStore {
    path: PathBuf,
    socket_path: String,
    write_lock: Mutex<()>,
}

impl ApprovalsStore {
    pub fn new(path: impl Into<PathBuf>, default_socket_path: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            socket_path: default_socket_path.into(),
            write_lock: Mutex::new(()),
        }
    }

    /// Load the file, creating it (with a fresh token, 0600) if missing.
    pub async fn load_or_init(&self) -> Result<ApprovalsFile> {
        let _guard = self.write_lock.lock().await;
        match std::fs::read_to_string(&self.path) {
            Ok(raw) => serde_json::from_str(&raw).map_err(Error::from),
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                let fresh = ApprovalsFile::fresh(self.socket_path.clone());
                self.write_locked(&fresh)?;
                Ok(fresh)
            }
            Err(e) => Err(Error::from(e)),
        }
    }

    fn write_locked(&self, file: &ApprovalsFile) -> Result<()> {
        let dir = self.path.parent().unwrap_or_else(|| Path::new("."));
        std::fs::create_dir_all(dir)?;
        let body = serde_json::to_string_pretty(file)?;
        let mut tmp = tempfile::NamedTempFile::new_in(dir)?;
        use std::io::Write;
        tmp.write_all(body.as_bytes())?;
        tmp.flush()?;
        set_0600(tmp.path())?;
        tmp.persist(&self.path).map_err(|e| Error::Io(e.error))?;
        set_0600(&self.path)?;
        Ok(())
    }

    async fn load(&self) -> Result<ApprovalsFile> {
        self.load_or_init().await
    }

    /// `recordAllowlistUse`: atomically updates `lastUsedAt`,
    /// `lastUsedCommand`, `lastResolvedPath` on the matching entry.
    pub async fn record_allowlist_use(
        &self,
        agent_id: &str,
        pattern: &str,
        command: &str,
        resolved_path: Option<&str>,
    ) -> Result<()> {
        let _guard = self.write_lock.lock().await;
        let mut file = self.load().await?;
        if let Some(agent) = file.agents.get_mut(agent_id) {
            if let Some(entry) = agent.allowlist.iter_mut().find(|e| e.pattern == pattern) {
                entry.last_used_at = Some(chrono::Utc::now());
                entry.last_used_command = Some(command.to_string());
                entry.last_resolved_path = resolved_path.map(|s| s.to_string());
            }
        }
        self.write_locked(&file)
    }

    /// `addAllowlistEntry`: no-op when the pattern is already present.
    pub async fn add_allowlist_entry(&self, agent_id: &str, pattern: &str) -> Result<()> {
        let _guard = self.write_lock.lock().await;
        let mut file = self.load().await?;
        let agent = file.agents.entry(agent_id.to_string()).or_default();
        if !agent.allowlist.iter().any(|e| e.pattern == pattern) {
            agent.allowlist.push(AllowlistEntry::new(pattern));
        }
        self.write_locked(&file)
    }

    /// `resolveExecApprovals(agentId, overrides)` (spec §4.D).
    pub async fn resolve(&self, agent_id: &str, overrides: &Defaults) -> Result<ResolvedExecApprovals> {
        let file = self.load().await?;
        Ok(resolve_exec_approvals(&file, agent_id, overrides))
    }
}

#[derive(Debug, Clone)]
pub struct ResolvedExecApprovals {
    pub security: SecurityMode,
    pub ask: AskMode,
    pub ask_fallback: SecurityMode,
    pub auto_allow_skills: bool,
    pub allowlist: Vec<AllowlistEntry>,
}

/// Pure composition function (spec §4.D), split out for easy testing
/// without touching the filesystem.
pub fn resolve_exec_approvals(
    file: &ApprovalsFile,
    agent_id: &str,
    overrides: &Defaults,
) -> ResolvedExecApprovals {
    let defaults = file.defaults.clone().merge(overrides);

    let wildcard = file.agents.get(WILDCARD_AGENT);
    let specific = file.agents.get(agent_id);

    // `agent = agents[agentId] ⊕ agents["*"] ⊕ defaults` — each scalar
    // field falls back independently through that chain.
    let agent_defaults = ResolvedDefaults {
        security: specific
            .and_then(|s| s.security)
            .or_else(|| wildcard.and_then(|w| w.security))
            .unwrap_or(defaults.security),
        ask: specific
            .and_then(|s| s.ask)
            .or_else(|| wildcard.and_then(|w| w.ask))
            .unwrap_or(defaults.ask),
        ask_fallback: specific
            .and_then(|s| s.ask_fallback)
            .or_else(|| wildcard.and_then(|w| w.ask_fallback))
            .unwrap_or(defaults.ask_fallback),
        auto_allow_skills: specific
            .and_then(|s| s.auto_allow_skills)
            .or_else(|| wildcard.and_then(|w| w.auto_allow_skills))
            .unwrap_or(defaults.auto_allow_skills),
    };

    let mut allowlist = Vec::new();
    if let Some(w) = wildcard {
        allowlist.extend(w.allowlist.iter().cloned());
    }
    if let Some(s) = specific {
        allowlist.extend(s.allowlist.iter().cloned());
    }

    ResolvedExecApprovals {
        security: agent_defaults.security,
        ask: agent_defaults.ask,
        ask_fallback: agent_defaults.ask_fallback,
        auto_allow_skills: agent_defaults.auto_allow_skills,
        allowlist,
    }
}

#[cfg(unix)]
fn set_0600(path: &Path) -> Result<()> {
    use std::os::unix::fs::PermissionsExt;
    std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o600))?;
    Ok(())
}

#[cfg(not(unix))]
fn set_0600(_path: &Path) -> Result<()> {
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(pattern: &str) -> AllowlistEntry {
        AllowlistEntry::new(pattern)
    }

    #[test]
    fn wildcard_agent_allowlist_merges_before_specific() {
        let mut file = ApprovalsFile::fresh("/tmp/x.sock".into());
        file.agents.insert(
            WILDCARD_AGENT.to_string(),
            AgentApprovals {
                allowlist: vec![entry("/bin/hostname")],
                ..Default::default()
            },
        );
        file.agents.insert(
            "main".to_string(),
            AgentApprovals {
                allowlist: vec![entry("/usr/bin/uname")],
                ..Default::default()
            },
        );

        let resolved = resolve_exec_approvals(&file, "main", &Defaults::default());
        let patterns: Vec<_> = resolved.allowlist.iter().map(|e| e.pattern.clone()).collect();
        assert_eq!(patterns, vec!["/bin/hostname", "/usr/bin/uname"]);
    }

    #[test]
    fn hardcoded_defaults_apply_when_nothing_set() {
        let file = ApprovalsFile::fresh("/tmp/x.sock".into());
        let resolved = resolve_exec_approvals(&file, "main", &Defaults::default());
        assert_eq!(resolved.security, SecurityMode::Deny);
        assert_eq!(resolved.ask, AskMode::OnMiss);
        assert_eq!(resolved.ask_fallback, SecurityMode::Deny);
        assert!(!resolved.auto_allow_skills);
    }

    #[tokio::test]
    async fn add_allowlist_entry_is_noop_if_present() {
        let dir = tempfile::tempdir().unwrap();
        let store = ApprovalsStore::new(dir.path().join("approvals.json"), "/tmp/x.sock");
        store.add_allowlist_entry("main", "/bin/hostname").await.unwrap();
        store.add_allowlist_entry("main", "/bin/hostname").await.unwrap();
        let file = store.load().await.unwrap();
        assert_eq!(file.agents.get("main").unwrap().allowlist.len(), 1);
    }

    #[tokio::test]
    async fn load_or_init_creates_file_with_fresh_token() {
        let dir = tempfile::tempdir().unwrap();
        let store = ApprovalsStore::new(dir.path().join("approvals.json"), "/tmp/x.sock");
        let file = store.load_or_init().await.unwrap();
        assert_eq!(file.version, 1);
        assert_eq!(file.socket.token.len(), 48);
    }

    #[tokio::test]
    async fn record_allowlist_use_updates_fields() {
        let dir = tempfile::tempdir().unwrap();
        let store = ApprovalsStore::new(dir.path().join("approvals.json"), "/tmp/x.sock");
        store.add_allowlist_entry("main", "rg").await.unwrap();
        store
            .record_allowlist_use("main", "rg", "rg --version", Some("/usr/bin/rg"))
            .await
            .unwrap();
        let file = store.load().await.unwrap();
        let entry = &file.agents.get("main").unwrap().allowlist[0];
        assert!(entry.last_used_at.is_some());
        assert_eq!(entry.last_used_command.as_deref(), Some("rg --version"));
    }
}
