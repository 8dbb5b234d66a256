//! Session key grammar: `agent:<agentId>:<surface>:<peer>`.

pub fn compute_session_key(agent_id: &str, surface: &str, peer: &str) -> String {
    format!("agent:{agent_id}:{surface}:{peer}")
}

/// The canonical "main" session key for an agent — the last stop in the
/// resolution-order lookup chain (spec §4.C).
pub fn build_agent_main_session_key(agent_id: &str) -> String {
    format!("agent:{agent_id}:dm:main")
}

/// Reduce a lookup key to its trailing peer segment, used as the "alias"
/// step of the resolution chain: `agent:other:dm:+1555` aliases to
/// `+1555` so it can be retried under the default agent's namespace.
pub fn alias(key: &str) -> &str {
    key.rsplit(':').next().unwrap_or(key)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn compute_session_key_format() {
        assert_eq!(
            compute_session_key("main", "dm", "+15551234"),
            "agent:main:dm:+15551234"
        );
    }

    #[test]
    fn main_key_is_stable() {
        assert_eq!(build_agent_main_session_key("main"), "agent:main:dm:main");
    }

    #[test]
    fn alias_takes_trailing_segment() {
        assert_eq!(alias("agent:other:dm:+15551234"), "+15551234");
        assert_eq!(alias("bare"), "bare");
    }
}
