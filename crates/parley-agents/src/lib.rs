pub mod failover;
pub mod openai;
pub mod providers;
pub mod runtime;
pub mod tool_parse;
pub mod tools;

pub use failover::{CooldownTable, ModelFailover, is_retryable_provider_error};
pub use openai::OpenAiProvider;
pub use providers::{LlmProvider, LlmRequest, LlmResponse, ToolDefinition, Usage};
pub use runtime::{AgentRuntime, COMPLETION_NOTICE, RunOutcome};
pub use tools::{Tool, ToolContext, ToolOutput};
