use async_trait::async_trait;
use parley_common::{ConversationTurn, Result, ToolCall};
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;

/// Trait for LLM backends. One provider may serve several models; the model
/// to use is carried on each request.
#[async_trait]
pub trait LlmProvider: Send + Sync {
    /// Provider identifier (e.g. "openai").
    fn provider_id(&self) -> &str;

    /// Plain completion: no tool schema, text out.
    async fn complete(&self, request: &LlmRequest, cancel: &CancellationToken) -> Result<String>;

    /// Completion with the request's tool definitions declared.
    async fn complete_with_tools(
        &self,
        request: &LlmRequest,
        cancel: &CancellationToken,
    ) -> Result<LlmResponse>;
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LlmRequest {
    pub model: String,
    pub turns: Vec<ConversationTurn>,
    pub tools: Vec<ToolDefinition>,
    pub max_tokens: Option<u32>,
}

impl LlmRequest {
    /// Copy of this request addressed to another model.
    pub fn for_model(&self, model: &str) -> Self {
        Self {
            model: model.to_string(),
            ..self.clone()
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LlmResponse {
    pub text: String,
    pub tool_calls: Vec<ToolCall>,
    pub usage: Option<Usage>,
    pub model: String,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Usage {
    pub prompt_tokens: u32,
    pub completion_tokens: u32,
}

impl Usage {
    pub fn add(&mut self, other: Option<Usage>) {
        if let Some(other) = other {
            self.prompt_tokens = self.prompt_tokens.saturating_add(other.prompt_tokens);
            self.completion_tokens = self
                .completion_tokens
                .saturating_add(other.completion_tokens);
        }
    }

    pub fn total(&self) -> u32 {
        self.prompt_tokens.saturating_add(self.completion_tokens)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolDefinition {
    pub name: String,
    pub description: String,
    pub input_schema: serde_json::Value,
}
