use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChatType {
    Direct,
    Group,
    Channel,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum GroupActivation {
    Mention,
    Any,
    Off,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DropPolicy {
    Oldest,
    Newest,
    Reject,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuthProfileOverride {
    pub value: String,
    pub source: String,
    pub compaction_count: u32,
}

/// A conversation thread within an agent (spec §3).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionEntry {
    pub session_id: String,
    pub chat_type: ChatType,
    #[serde(default)]
    pub provider_override: Option<String>,
    #[serde(default)]
    pub model_override: Option<String>,
    #[serde(default)]
    pub auth_profile_override: Option<AuthProfileOverride>,
    pub group_activation: GroupActivation,
    #[serde(default)]
    pub queue_debounce_ms: Option<u64>,
    #[serde(default)]
    pub queue_cap: Option<usize>,
    #[serde(default)]
    pub queue_drop: Option<DropPolicy>,
    pub last_channel: String,
    pub updated_at: DateTime<Utc>,
}

impl SessionEntry {
    pub fn new(session_id: impl Into<String>, last_channel: impl Into<String>) -> Self {
        Self {
            session_id: session_id.into(),
            chat_type: ChatType::Direct,
            provider_override: None,
            model_override: None,
            auth_profile_override: None,
            group_activation: GroupActivation::Mention,
            queue_debounce_ms: None,
            queue_cap: None,
            queue_drop: None,
            last_channel: last_channel.into(),
            updated_at: Utc::now(),
        }
    }

    /// `providerOverride` and `modelOverride` are always set together
    /// (spec §3 invariant).
    pub fn set_provider_model_override(&mut self, provider: String, model: String) {
        self.provider_override = Some(provider);
        self.model_override = Some(model);
        self.updated_at = Utc::now();
    }

    pub fn clear_provider_model_override(&mut self) {
        self.provider_override = None;
        self.model_override = None;
        self.updated_at = Utc::now();
    }

    /// Resetting the model always clears the auth-profile override too
    /// (spec §3 invariant).
    pub fn reset_model(&mut self) {
        self.clear_provider_model_override();
        self.auth_profile_override = None;
    }

    pub fn touch(&mut self, channel: impl Into<String>) {
        self.last_channel = channel.into();
        self.updated_at = Utc::now();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn provider_and_model_override_set_together() {
        let mut s = SessionEntry::new("sess-1", "telegram");
        s.set_provider_model_override("anthropic".into(), "claude".into());
        assert_eq!(s.provider_override.as_deref(), Some("anthropic"));
        assert_eq!(s.model_override.as_deref(), Some("claude"));
    }

    #[test]
    fn clear_override_clears_both() {
        let mut s = SessionEntry::new("sess-1", "telegram");
        s.set_provider_model_override("anthropic".into(), "claude".into());
        s.clear_provider_model_override();
        assert!(s.provider_override.is_none());
        assert!(s.model_override.is_none());
    }

    #[test]
    fn reset_model_clears_auth_profile_override() {
        let mut s = SessionEntry::new("sess-1", "telegram");
        s.set_provider_model_override("anthropic".into(), "claude".into());
        s.auth_profile_override = Some(AuthProfileOverride {
            value: "work".into(),
            source: "user".into(),
            compaction_count: 0,
        });
        s.reset_model();
        assert!(s.auth_profile_override.is_none());
        assert!(s.model_override.is_none());
    }
}
