//! LLM provider interface (spec §1): `modelCall(provider, model, transcript,
//! tools) → stream`. Concrete provider adapters (Anthropic/OpenAI/…) are
//! explicitly out of scope — this crate carries only the trait the
//! Session Orchestrator (cb-gateway) calls through, shaped after the
//! teacher's `sa_providers::traits::LlmProvider` but trimmed to a single
//! streaming entry point since no concrete adapter lives here.

use cb_domain::{Result, Value};
use futures_util::stream::BoxStream;
use serde::{Deserialize, Serialize};

/// One message in a transcript handed to a model call.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    pub role: String,
    pub content: Value,
}

/// A tool the model may invoke, in the shape the wire protocol already
/// carries (see `cb-protocol`): name, description, and a JSON-schema-like
/// parameter spec left untyped since each provider has its own dialect.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolDefinition {
    pub name: String,
    pub description: String,
    pub parameters: Value,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolCall {
    pub id: String,
    pub name: String,
    pub arguments: Value,
}

/// One increment of a streamed model call.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum StreamEvent {
    TextDelta(String),
    ToolCall(ToolCall),
    Done { finish_reason: String },
}

/// A single provider/model selection, as resolved from a session's
/// `providerOverride`/`modelOverride` pair (spec §3).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModelSelector {
    pub provider: String,
    pub model: String,
}

/// The external collaborator interface: turn a transcript + tool
/// catalogue into a stream of completion events. No concrete
/// implementation lives in this workspace (spec §1 Out of scope);
/// `cb-gateway` depends on this trait object, not a specific adapter.
#[async_trait::async_trait]
pub trait ModelProvider: Send + Sync {
    async fn model_call(
        &self,
        selector: &ModelSelector,
        transcript: Vec<Message>,
        tools: Vec<ToolDefinition>,
    ) -> Result<BoxStream<'static, Result<StreamEvent>>>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn model_selector_equality_is_by_value() {
        let a = ModelSelector {
            provider: "anthropic".into(),
            model: "claude".into(),
        };
        let b = ModelSelector {
            provider: "anthropic".into(),
            model: "claude".into(),
        };
        assert_eq!(a, b);
    }
}
