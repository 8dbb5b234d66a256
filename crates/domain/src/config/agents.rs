use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use super::lattice::{AskMode, ExecHost, SecurityMode};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AgentConfig {
    pub workspace_path: String,
    pub sandbox: SandboxConfig,
    pub tools: ToolPolicy,
    pub models: HashMap<String, String>,
    pub memory_mode: MemoryMode,
    pub limits: AgentLimits,
    pub exec_host: ExecHost,
    pub exec_security: SecurityMode,
    pub exec_ask: AskMode,
    pub exec_ask_fallback: SecurityMode,
    /// Whether `exec(elevated=true)` may escalate this agent's turn to
    /// `host=gateway, security=full` (spec §4.F step 1). Off by default;
    /// an agent must opt in explicitly.
    pub exec_elevated_allowed: bool,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            workspace_path: String::new(),
            sandbox: SandboxConfig::default(),
            tools: ToolPolicy::default(),
            models: HashMap::new(),
            memory_mode: MemoryMode::Shared,
            limits: AgentLimits::default(),
            exec_host: ExecHost::Sandbox,
            exec_security: SecurityMode::Allowlist,
            exec_ask: AskMode::OnMiss,
            exec_ask_fallback: SecurityMode::Deny,
            exec_elevated_allowed: false,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SandboxModeKind {
    Off,
    NonMain,
    All,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SandboxScope {
    Session,
    Agent,
    Shared,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WorkspaceAccess {
    None,
    Ro,
    Rw,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SandboxConfig {
    pub mode: SandboxModeKind,
    pub scope: SandboxScope,
    pub workspace_access: WorkspaceAccess,
    pub docker_image: Option<String>,
    pub cpu_limit: Option<String>,
    pub memory_limit: Option<String>,
    pub browser_enabled: bool,
    /// When set, replaces (not merges with) `AgentConfig::tools` for
    /// sandboxed turns (spec §4.J: "agent.sandbox.tools is replaced").
    pub tools: Option<ToolPolicy>,
}

impl Default for SandboxConfig {
    fn default() -> Self {
        Self {
            mode: SandboxModeKind::Off,
            scope: SandboxScope::Session,
            workspace_access: WorkspaceAccess::Ro,
            docker_image: None,
            cpu_limit: None,
            memory_limit: None,
            browser_enabled: false,
            tools: None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MemoryMode {
    Shared,
    Isolated,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
#[serde(default)]
pub struct AgentLimits {
    pub max_depth: u32,
    pub max_children_per_turn: u32,
    pub max_duration_ms: u64,
}

impl Default for AgentLimits {
    fn default() -> Self {
        Self {
            max_depth: 3,
            max_children_per_turn: 5,
            max_duration_ms: 30_000,
        }
    }
}

/// A single allow/deny layer. Empty (or `"*"`-containing) `allow` means
/// unrestricted; `deny` always takes precedence over `allow`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ToolPolicy {
    pub allow: Vec<String>,
    pub deny: Vec<String>,
}

impl ToolPolicy {
    pub fn allows(&self, tool_name: &str) -> bool {
        let name = tool_name.to_lowercase();

        for pattern in &self.deny {
            if policy_matches(&pattern.to_lowercase(), &name) {
                return false;
            }
        }

        if self.allow.is_empty() || self.allow.iter().any(|p| p == "*") {
            return true;
        }

        self.allow
            .iter()
            .any(|pattern| policy_matches(&pattern.to_lowercase(), &name))
    }
}

/// A policy pattern matches a tool name exactly, or as a dotted-prefix
/// subtree (`"exec"` matches `"exec"` and `"exec.run"` but not `"execute"`).
fn policy_matches(pattern: &str, name: &str) -> bool {
    if pattern == "*" {
        return true;
    }
    if pattern == name {
        return true;
    }
    name.starts_with(pattern) && name[pattern.len()..].starts_with('.')
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_allows_all() {
        let p = ToolPolicy::default();
        assert!(p.allows("exec"));
        assert!(p.allows("anything.here"));
    }

    #[test]
    fn allow_restricts() {
        let p = ToolPolicy {
            allow: vec!["exec".into()],
            deny: vec![],
        };
        assert!(p.allows("exec"));
        assert!(!p.allows("browser"));
    }

    #[test]
    fn deny_takes_precedence() {
        let p = ToolPolicy {
            allow: vec!["exec".into()],
            deny: vec!["exec".into()],
        };
        assert!(!p.allows("exec"));
    }

    #[test]
    fn deny_prefix_blocks_subtree() {
        let p = ToolPolicy {
            allow: vec![],
            deny: vec!["exec".into()],
        };
        assert!(!p.allows("exec.run"));
        assert!(p.allows("execute")); // not a dotted subtree of "exec"
    }

    #[test]
    fn deny_star_blocks_all() {
        let p = ToolPolicy {
            allow: vec![],
            deny: vec!["*".into()],
        };
        assert!(!p.allows("exec"));
        assert!(!p.allows("anything"));
    }

    #[test]
    fn case_insensitive() {
        let p = ToolPolicy {
            allow: vec!["Exec".into()],
            deny: vec![],
        };
        assert!(p.allows("EXEC"));
    }

    #[test]
    fn agent_limits_defaults() {
        let l = AgentLimits::default();
        assert_eq!(l.max_depth, 3);
        assert_eq!(l.max_children_per_turn, 5);
        assert_eq!(l.max_duration_ms, 30_000);
    }
}
