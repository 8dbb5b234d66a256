mod agents;
mod lattice;

pub use agents::{AgentConfig, AgentLimits, MemoryMode, SandboxConfig, ToolPolicy};
pub use lattice::{max_ask, min_security, AskMode, ExecHost, SecurityMode};

use std::collections::HashMap;
use std::fmt;

use serde::{Deserialize, Serialize};

/// Top-level configuration tree, loaded from `config.toml`.
///
/// Grouped the way the teacher's own `Config` aggregates submodule
/// configs: each concern owns its own struct with its own defaults.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub server: ServerConfig,
    pub gateway: GatewayConfig,
    pub exec: ExecConfig,
    pub approvals: ApprovalsConfig,
    pub nodes: NodesConfig,
    pub agents: HashMap<String, AgentConfig>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            server: ServerConfig::default(),
            gateway: GatewayConfig::default(),
            exec: ExecConfig::default(),
            approvals: ApprovalsConfig::default(),
            nodes: NodesConfig::default(),
            agents: HashMap::new(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    pub cors_allowed_origins: Vec<String>,
    pub max_concurrent_requests: usize,
    /// Per-IP token-bucket rate limiting; absent disables it entirely.
    pub rate_limit: Option<RateLimitConfig>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".into(),
            port: 8787,
            cors_allowed_origins: Vec::new(),
            max_concurrent_requests: 256,
            rate_limit: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RateLimitConfig {
    pub requests_per_second: u64,
    pub burst_size: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GatewayConfig {
    /// Env var name holding the bearer token clients authenticate with.
    pub token_env: String,
    /// Env var name holding a bcrypt-style password hash, if used instead.
    pub password_hash_env: Option<String>,
    /// Agent id used to resolve a session key when no agent is named
    /// explicitly (spec §4.C resolution chain's final fallback).
    pub default_agent: String,
    /// State directory for session stores, approvals, exec approval
    /// socket, etc. (spec §6 `HelloOk.snapshot.stateDir`).
    pub state_dir: String,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            token_env: "CLAWDBOT_GATEWAY_TOKEN".into(),
            password_hash_env: None,
            default_agent: "main".into(),
            state_dir: "~/.clawdbot".into(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ExecConfig {
    pub host: ExecHost,
    pub security: SecurityMode,
    pub ask: AskMode,
    pub ask_fallback: SecurityMode,
    pub yield_ms: u64,
    pub timeout_sec: u64,
    pub cleanup_ms: u64,
    pub max_output_chars: usize,
    pub notification_tail_chars: usize,
    pub notify_on_exit: bool,
    pub notify_on_exit_empty_success: bool,
    pub denied_patterns: Vec<String>,
}

impl Default for ExecConfig {
    fn default() -> Self {
        Self {
            host: ExecHost::Sandbox,
            security: SecurityMode::Allowlist,
            ask: AskMode::OnMiss,
            ask_fallback: SecurityMode::Deny,
            yield_ms: 10_000,
            timeout_sec: 1800,
            cleanup_ms: 1_800_000,
            max_output_chars: 200_000,
            notification_tail_chars: 400,
            notify_on_exit: true,
            notify_on_exit_empty_success: false,
            denied_patterns: vec![
                r"rm\s+-rf\s+/".to_string(),
                r"mkfs\.".to_string(),
                r"dd\s+if=.+of=/dev/".to_string(),
            ],
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ApprovalsConfig {
    pub file_path: Option<String>,
    pub socket_path: Option<String>,
    pub retention_sec: u64,
}

impl Default for ApprovalsConfig {
    fn default() -> Self {
        Self {
            file_path: None,
            socket_path: None,
            retention_sec: 300,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NodesConfig {
    /// Per-platform hardcoded command catalog; a node-declared command must
    /// also appear here to be invocable.
    pub platform_commands: HashMap<String, Vec<String>>,
    pub stale_after_sec: u64,
}

impl Default for NodesConfig {
    fn default() -> Self {
        let mut platform_commands = HashMap::new();
        platform_commands.insert(
            "ios".to_string(),
            vec!["canvas.snapshot".to_string(), "notify.push".to_string()],
        );
        platform_commands.insert(
            "mac".to_string(),
            vec![
                "system.run".to_string(),
                "canvas.snapshot".to_string(),
                "notify.push".to_string(),
            ],
        );
        platform_commands.insert(
            "linux".to_string(),
            vec!["system.run".to_string(), "canvas.snapshot".to_string()],
        );
        platform_commands.insert(
            "windows".to_string(),
            vec!["system.run".to_string(), "canvas.snapshot".to_string()],
        );
        Self {
            platform_commands,
            stale_after_sec: 90,
        }
    }
}

// ── Validation ──────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConfigSeverity {
    Error,
    Warning,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConfigError {
    pub severity: ConfigSeverity,
    pub field: String,
    pub message: String,
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let tag = match self.severity {
            ConfigSeverity::Error => "ERROR",
            ConfigSeverity::Warning => "WARN",
        };
        write!(f, "[{tag}] {}: {}", self.field, self.message)
    }
}

impl Config {
    /// Validate the resolved configuration, returning every problem found
    /// rather than bailing on the first one (mirrors the teacher's
    /// rule-based `Config::validate`).
    pub fn validate(&self) -> Vec<ConfigError> {
        let mut errors = Vec::new();

        if self.server.port == 0 {
            errors.push(ConfigError {
                severity: ConfigSeverity::Error,
                field: "server.port".into(),
                message: "port must not be 0".into(),
            });
        }
        if self.server.host.trim().is_empty() {
            errors.push(ConfigError {
                severity: ConfigSeverity::Error,
                field: "server.host".into(),
                message: "host must not be empty".into(),
            });
        }
        if self.server.max_concurrent_requests == 0 {
            errors.push(ConfigError {
                severity: ConfigSeverity::Error,
                field: "server.max_concurrent_requests".into(),
                message: "must be greater than 0".into(),
            });
        }
        if self
            .server
            .cors_allowed_origins
            .iter()
            .any(|o| o == "*")
            && self.server.cors_allowed_origins.len() > 1
        {
            errors.push(ConfigError {
                severity: ConfigSeverity::Warning,
                field: "server.cors_allowed_origins".into(),
                message: "wildcard \"*\" makes other entries redundant".into(),
            });
        }
        if let Some(rl) = &self.server.rate_limit {
            if rl.requests_per_second == 0 || rl.burst_size == 0 {
                errors.push(ConfigError {
                    severity: ConfigSeverity::Error,
                    field: "server.rate_limit".into(),
                    message: "requests_per_second and burst_size must both be greater than 0".into(),
                });
            }
        }

        if self.gateway.token_env.trim().is_empty() {
            errors.push(ConfigError {
                severity: ConfigSeverity::Error,
                field: "gateway.token_env".into(),
                message: "token_env must not be empty".into(),
            });
        }
        if self.gateway.default_agent.trim().is_empty() {
            errors.push(ConfigError {
                severity: ConfigSeverity::Error,
                field: "gateway.default_agent".into(),
                message: "default_agent must not be empty".into(),
            });
        }

        if self.exec.yield_ms < 10 || self.exec.yield_ms > 120_000 {
            errors.push(ConfigError {
                severity: ConfigSeverity::Warning,
                field: "exec.yield_ms".into(),
                message: "outside the 10ms-120s clamp range; will be clamped at runtime".into(),
            });
        }
        if self.exec.timeout_sec == 0 {
            errors.push(ConfigError {
                severity: ConfigSeverity::Error,
                field: "exec.timeout_sec".into(),
                message: "must be greater than 0".into(),
            });
        }
        for pattern in &self.exec.denied_patterns {
            if let Err(e) = regex::Regex::new(pattern) {
                errors.push(ConfigError {
                    severity: ConfigSeverity::Error,
                    field: "exec.denied_patterns".into(),
                    message: format!("invalid regex {pattern:?}: {e}"),
                });
            }
        }

        if let Some(path) = &self.approvals.file_path {
            if path.trim().is_empty() {
                errors.push(ConfigError {
                    severity: ConfigSeverity::Error,
                    field: "approvals.file_path".into(),
                    message: "must not be empty when set".into(),
                });
            }
        }

        for (id, agent) in &self.agents {
            if id.trim().is_empty() {
                errors.push(ConfigError {
                    severity: ConfigSeverity::Error,
                    field: "agents".into(),
                    message: "agent id must not be empty".into(),
                });
            }
            if agent.workspace_path.trim().is_empty() {
                errors.push(ConfigError {
                    severity: ConfigSeverity::Error,
                    field: format!("agents.{id}.workspace_path"),
                    message: "must not be empty".into(),
                });
            }
            if agent.limits.max_depth == 0 {
                errors.push(ConfigError {
                    severity: ConfigSeverity::Warning,
                    field: format!("agents.{id}.limits.max_depth"),
                    message: "max_depth of 0 disallows all tool calls".into(),
                });
            }
        }

        errors
    }

    pub fn has_errors(errors: &[ConfigError]) -> bool {
        errors.iter().any(|e| e.severity == ConfigSeverity::Error)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_validates_clean() {
        let cfg = Config::default();
        let errors = cfg.validate();
        assert!(!Config::has_errors(&errors), "{errors:?}");
    }

    #[test]
    fn zero_port_is_error() {
        let mut cfg = Config::default();
        cfg.server.port = 0;
        let errors = cfg.validate();
        assert!(errors
            .iter()
            .any(|e| e.field == "server.port" && e.severity == ConfigSeverity::Error));
    }

    #[test]
    fn empty_host_is_error() {
        let mut cfg = Config::default();
        cfg.server.host = "".into();
        assert!(Config::has_errors(&cfg.validate()));
    }

    #[test]
    fn invalid_regex_is_error() {
        let mut cfg = Config::default();
        cfg.exec.denied_patterns.push("(unclosed".into());
        assert!(Config::has_errors(&cfg.validate()));
    }

    #[test]
    fn wildcard_cors_with_other_origins_warns() {
        let mut cfg = Config::default();
        cfg.server.cors_allowed_origins = vec!["*".into(), "https://example.com".into()];
        let errors = cfg.validate();
        assert!(errors
            .iter()
            .any(|e| e.field == "server.cors_allowed_origins"
                && e.severity == ConfigSeverity::Warning));
        assert!(!Config::has_errors(&errors));
    }

    #[test]
    fn display_format_matches_tag_field_message() {
        let e = ConfigError {
            severity: ConfigSeverity::Error,
            field: "server.port".into(),
            message: "port must not be 0".into(),
        };
        assert_eq!(e.to_string(), "[ERROR] server.port: port must not be 0");
    }

    #[test]
    fn zero_rate_limit_burst_is_error() {
        let mut cfg = Config::default();
        cfg.server.rate_limit = Some(RateLimitConfig {
            requests_per_second: 10,
            burst_size: 0,
        });
        assert!(Config::has_errors(&cfg.validate()));
    }

    #[test]
    fn empty_agent_workspace_path_is_error() {
        let mut cfg = Config::default();
        cfg.agents.insert(
            "main".into(),
            AgentConfig {
                workspace_path: "".into(),
                ..AgentConfig::default()
            },
        );
        assert!(Config::has_errors(&cfg.validate()));
    }
}
