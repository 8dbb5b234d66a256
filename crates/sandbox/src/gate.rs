//! Exec gating pipeline, steps 1-6 (spec §4.F): elevation, host allowlist,
//! security/ask composition, workdir resolution, environment merge. The
//! remaining steps (node pairing, gateway-host PATH-search + approval
//! decision, spawn, lifecycle) need registry/approval-store access and
//! live in `exec.rs`; these six are pure and are the ones Design Note §9
//! calls out for a stepwise `Result<Approved, Denied>` chain.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use cb_domain::config::{max_ask, min_security, AskMode, ExecHost, SecurityMode};

/// A denial carries the failing gate's name and a user-visible reason, per
/// Design Note §9 ("replace exceptions with a stepwise Result chain so
/// every denial carries a precise reason string").
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Denied {
    pub gate: &'static str,
    pub reason: String,
}

impl Denied {
    fn new(gate: &'static str, reason: impl Into<String>) -> Self {
        Self {
            gate,
            reason: reason.into(),
        }
    }
}

impl std::fmt::Display for Denied {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "denied by {}: {}", self.gate, self.reason)
    }
}

impl From<Denied> for cb_domain::Error {
    fn from(d: Denied) -> Self {
        cb_domain::Error::Policy {
            gate: d.gate.to_string(),
            reason: d.reason,
        }
    }
}

#[derive(Debug, Clone)]
pub struct ExecRequest {
    pub command: String,
    pub workdir: Option<String>,
    pub env: HashMap<String, String>,
    pub host: ExecHost,
    pub security: SecurityMode,
    pub ask: AskMode,
    pub elevated: bool,
}

#[derive(Debug, Clone)]
pub struct GateConfig {
    pub configured_host: ExecHost,
    pub configured_security: SecurityMode,
    pub configured_ask: AskMode,
    pub elevated_allowed: bool,
    pub workspace_root: PathBuf,
}

/// Outcome of steps 1-4: the host/security/ask triple every later step
/// reasons about. `bypass_allowlist` is threaded through so step 8 (in
/// `exec.rs`) can skip the allowlist check for elevated requests without
/// re-deriving elevation state.
#[derive(Debug, Clone)]
pub struct Composed {
    pub host: ExecHost,
    pub security: SecurityMode,
    pub ask: AskMode,
    pub bypass_allowlist: bool,
}

/// Steps 1-4: elevation, host allowlist, security compose, ask compose.
pub fn compose(req: &ExecRequest, cfg: &GateConfig) -> Result<Composed, Denied> {
    if req.elevated {
        if !cfg.elevated_allowed {
            return Err(Denied::new(
                "elevated-not-available",
                "elevation is disabled for this agent",
            ));
        }
        return Ok(Composed {
            host: ExecHost::Gateway,
            security: SecurityMode::Full,
            ask: max_ask(cfg.configured_ask, req.ask),
            bypass_allowlist: true,
        });
    }

    if req.host != cfg.configured_host {
        return Err(Denied::new(
            "host-not-allowed",
            format!(
                "host {:?} not permitted, configured host is {:?}",
                req.host, cfg.configured_host
            ),
        ));
    }

    let security = min_security(cfg.configured_security, req.security);
    if security == SecurityMode::Deny {
        return Err(Denied::new("security", "security mode is deny"));
    }

    Ok(Composed {
        host: req.host,
        security,
        ask: max_ask(cfg.configured_ask, req.ask),
        bypass_allowlist: false,
    })
}

/// Step 5: workdir resolution. Relative paths resolve against the agent
/// workspace; absolute paths outside the workspace are still permitted
/// but flagged.
pub fn resolve_workdir(requested: Option<&str>, workspace_root: &Path) -> (PathBuf, bool) {
    let path = match requested {
        Some(p) => {
            let p = Path::new(p);
            if p.is_absolute() {
                p.to_path_buf()
            } else {
                workspace_root.join(p)
            }
        }
        None => workspace_root.to_path_buf(),
    };
    let outside = !path.starts_with(workspace_root);
    if outside {
        tracing::warn!(workdir = %path.display(), workspace = %workspace_root.display(), "exec workdir resolves outside agent workspace");
    }
    (path, outside)
}

/// Maps a host workdir to its container-side path for `host=sandbox`
/// (spec §4.F step 5): the agent workspace root maps to a fixed
/// in-container mount point, everything else passes through unchanged.
pub fn map_workdir_to_container(host_path: &Path, workspace_root: &Path, container_workspace: &Path) -> PathBuf {
    match host_path.strip_prefix(workspace_root) {
        Ok(rel) => container_workspace.join(rel),
        Err(_) => host_path.to_path_buf(),
    }
}

/// Step 6: merge process env with request overrides, then prepend
/// configured PATH entries.
pub fn merge_env(
    base: &HashMap<String, String>,
    overrides: &HashMap<String, String>,
    path_prepend: &[String],
) -> HashMap<String, String> {
    let mut merged = base.clone();
    merged.extend(overrides.iter().map(|(k, v)| (k.clone(), v.clone())));
    if !path_prepend.is_empty() {
        let existing = merged.get("PATH").cloned().unwrap_or_default();
        let mut parts = path_prepend.to_vec();
        if !existing.is_empty() {
            parts.push(existing);
        }
        merged.insert("PATH".to_string(), parts.join(":"));
    }
    merged
}

#[cfg(test)]
mod tests {
    use super::*;

    fn req(host: ExecHost, security: SecurityMode, ask: AskMode, elevated: bool) -> ExecRequest {
        ExecRequest {
            command: "echo hi".into(),
            workdir: None,
            env: HashMap::new(),
            host,
            security,
            ask,
            elevated,
        }
    }

    fn cfg() -> GateConfig {
        GateConfig {
            configured_host: ExecHost::Sandbox,
            configured_security: SecurityMode::Allowlist,
            configured_ask: AskMode::OnMiss,
            elevated_allowed: false,
            workspace_root: PathBuf::from("/workspace/agent"),
        }
    }

    #[test]
    fn elevated_forces_gateway_full_and_bypasses_allowlist() {
        let mut c = cfg();
        c.elevated_allowed = true;
        let composed = compose(&req(ExecHost::Node, SecurityMode::Deny, AskMode::Off, true), &c).unwrap();
        assert_eq!(composed.host, ExecHost::Gateway);
        assert_eq!(composed.security, SecurityMode::Full);
        assert!(composed.bypass_allowlist);
    }

    #[test]
    fn elevated_rejected_when_not_allowed() {
        let err = compose(&req(ExecHost::Gateway, SecurityMode::Full, AskMode::Off, true), &cfg()).unwrap_err();
        assert_eq!(err.gate, "elevated-not-available");
    }

    #[test]
    fn mismatched_host_denied_when_not_elevated() {
        let err = compose(&req(ExecHost::Gateway, SecurityMode::Allowlist, AskMode::Off, false), &cfg()).unwrap_err();
        assert_eq!(err.gate, "host-not-allowed");
    }

    #[test]
    fn security_compose_uses_min() {
        let composed = compose(
            &req(ExecHost::Sandbox, SecurityMode::Full, AskMode::Off, false),
            &cfg(),
        )
        .unwrap();
        // configured=Allowlist, requested=Full -> min is Allowlist
        assert_eq!(composed.security, SecurityMode::Allowlist);
    }

    #[test]
    fn security_compose_deny_is_rejected_outright() {
        let err = compose(
            &req(ExecHost::Sandbox, SecurityMode::Deny, AskMode::Off, false),
            &cfg(),
        )
        .unwrap_err();
        assert_eq!(err.gate, "security");
    }

    #[test]
    fn ask_compose_uses_max() {
        let composed = compose(
            &req(ExecHost::Sandbox, SecurityMode::Allowlist, AskMode::Always, false),
            &cfg(),
        )
        .unwrap();
        assert_eq!(composed.ask, AskMode::Always);
    }

    #[test]
    fn relative_workdir_resolves_under_workspace() {
        let (path, outside) = resolve_workdir(Some("sub/dir"), Path::new("/workspace/agent"));
        assert_eq!(path, PathBuf::from("/workspace/agent/sub/dir"));
        assert!(!outside);
    }

    #[test]
    fn absolute_workdir_outside_workspace_is_flagged_but_allowed() {
        let (path, outside) = resolve_workdir(Some("/etc"), Path::new("/workspace/agent"));
        assert_eq!(path, PathBuf::from("/etc"));
        assert!(outside);
    }

    #[test]
    fn container_mapping_rewrites_workspace_prefix() {
        let mapped = map_workdir_to_container(
            Path::new("/workspace/agent/sub"),
            Path::new("/workspace/agent"),
            Path::new("/home/node/work"),
        );
        assert_eq!(mapped, PathBuf::from("/home/node/work/sub"));
    }

    #[test]
    fn merge_env_prepends_path() {
        let mut base = HashMap::new();
        base.insert("PATH".to_string(), "/usr/bin".to_string());
        let overrides = HashMap::new();
        let merged = merge_env(&base, &overrides, &["/opt/bin".to_string()]);
        assert_eq!(merged.get("PATH").unwrap(), "/opt/bin:/usr/bin");
    }
}
