//! Tool Policy Layer (spec §4.J): compose the effective allow/deny set
//! from global → agent → sandbox → subagent layers.
//!
//! Grounded on `sa_domain::config::agents::ToolPolicy::allows`
//! (single allow/deny pair), generalized into an N-layer fold: each
//! layer may only *restrict* what came before it, never re-grant a tool
//! an earlier layer denied.

use cb_domain::config::ToolPolicy;

/// One layer in the composition chain, in the order they are applied.
#[derive(Debug, Clone, Copy)]
pub enum Layer<'a> {
    Global(&'a ToolPolicy),
    Agent(&'a ToolPolicy),
    Sandbox(&'a ToolPolicy),
    Subagent(&'a ToolPolicy),
}

impl<'a> Layer<'a> {
    fn policy(&self) -> &'a ToolPolicy {
        match self {
            Layer::Global(p) | Layer::Agent(p) | Layer::Sandbox(p) | Layer::Subagent(p) => p,
        }
    }
}

/// Compose layers left to right and decide whether `tool_name` is
/// allowed. Starts from "all tools" and intersects with each layer in
/// turn; a layer's allow list can never re-grant a tool a prior layer
/// denied (spec §4.J).
pub fn compose(layers: &[Layer<'_>], tool_name: &str) -> bool {
    let mut allowed = true;
    for layer in layers {
        allowed = allowed && layer.policy().allows(tool_name);
    }
    allowed
}

/// `agent.sandbox.tools` is *replaced*, not merged, by
/// `routing.agents[id].sandbox.tools` when the latter is set (spec
/// §4.J). Returns the policy to use for the sandbox layer.
pub fn resolve_sandbox_layer<'a>(
    agent_sandbox_tools: Option<&'a ToolPolicy>,
    routing_override: Option<&'a ToolPolicy>,
) -> Option<&'a ToolPolicy> {
    routing_override.or(agent_sandbox_tools)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn policy(allow: &[&str], deny: &[&str]) -> ToolPolicy {
        ToolPolicy {
            allow: allow.iter().map(|s| s.to_string()).collect(),
            deny: deny.iter().map(|s| s.to_string()).collect(),
        }
    }

    #[test]
    fn empty_layers_allow_everything() {
        assert!(compose(&[], "exec"));
    }

    #[test]
    fn single_layer_matches_tool_policy_allows() {
        let global = policy(&["exec"], &[]);
        assert!(compose(&[Layer::Global(&global)], "exec"));
        assert!(!compose(&[Layer::Global(&global)], "browser"));
    }

    #[test]
    fn later_layer_cannot_regrant_earlier_denial() {
        let global = policy(&[], &["exec"]);
        let agent = policy(&["exec"], &[]);
        assert!(!compose(&[Layer::Global(&global), Layer::Agent(&agent)], "exec"));
    }

    #[test]
    fn each_layer_can_further_restrict() {
        let global = policy(&["exec", "browser"], &[]);
        let agent = policy(&["exec"], &[]);
        assert!(compose(&[Layer::Global(&global), Layer::Agent(&agent)], "exec"));
        assert!(!compose(&[Layer::Global(&global), Layer::Agent(&agent)], "browser"));
    }

    #[test]
    fn full_four_layer_chain() {
        let global = policy(&[], &[]);
        let agent = policy(&["exec", "browser", "file"], &[]);
        let sandbox = policy(&["exec", "file"], &[]);
        let subagent = policy(&[], &["file"]);
        let layers = [
            Layer::Global(&global),
            Layer::Agent(&agent),
            Layer::Sandbox(&sandbox),
            Layer::Subagent(&subagent),
        ];
        assert!(compose(&layers, "exec"));
        assert!(!compose(&layers, "browser")); // sandbox layer dropped it
        assert!(!compose(&layers, "file")); // subagent denied it
    }

    #[test]
    fn routing_override_replaces_agent_sandbox_tools() {
        let agent_tools = policy(&["exec"], &[]);
        let routing_tools = policy(&["browser"], &[]);
        let resolved = resolve_sandbox_layer(Some(&agent_tools), Some(&routing_tools));
        assert!(resolved.unwrap().allows("browser"));
        assert!(!resolved.unwrap().allows("exec"));
    }

    #[test]
    fn no_routing_override_keeps_agent_sandbox_tools() {
        let agent_tools = policy(&["exec"], &[]);
        let resolved = resolve_sandbox_layer(Some(&agent_tools), None);
        assert!(resolved.unwrap().allows("exec"));
    }
}
