use crate::providers::{LlmProvider, LlmRequest, LlmResponse, Usage};
use async_trait::async_trait;
use parley_common::{ConversationTurn, Error, Result, ToolCall, TurnRole};
use reqwest::Client;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// OpenAI-compatible `/chat/completions` backend (non-streaming).
#[derive(Clone)]
pub struct OpenAiProvider {
    client: Client,
    api_key: String,
    base_url: String,
}

impl OpenAiProvider {
    pub fn new(api_key: String, base_url: Option<String>) -> Self {
        Self {
            client: Client::new(),
            api_key,
            base_url: base_url
                .map(|url| url.trim_end_matches('/').to_string())
                .unwrap_or_else(|| "https://api.openai.com/v1".to_string()),
        }
    }

    async fn send(&self, request: &LlmRequest) -> Result<LlmResponse> {
        let url = format!("{}/chat/completions", self.base_url);
        let body = convert_request(request);
        debug!(model = %request.model, tools = request.tools.len(), "openai request");

        let response = self
            .client
            .post(&url)
            .bearer_auth(&self.api_key)
            .json(&body)
            .send()
            .await
            .map_err(|e| Error::provider(None, format!("OpenAI request failed: {e}")))?;

        let status = response.status();
        if !status.is_success() {
            let error_text = response.text().await.unwrap_or_default();
            return Err(Error::provider(
                Some(status.as_u16()),
                format!("OpenAI API error: {error_text}"),
            ));
        }

        let openai_response: OpenAiResponse = response
            .json()
            .await
            .map_err(|e| Error::Agent(format!("failed to parse OpenAI response: {e}")))?;

        convert_response(openai_response)
    }

    async fn send_cancellable(
        &self,
        request: &LlmRequest,
        cancel: &CancellationToken,
    ) -> Result<LlmResponse> {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(Error::Cancelled),
            result = self.send(request) => result,
        }
    }
}

#[async_trait]
impl LlmProvider for OpenAiProvider {
    fn provider_id(&self) -> &str {
        "openai"
    }

    async fn complete(&self, request: &LlmRequest, cancel: &CancellationToken) -> Result<String> {
        let mut plain = request.clone();
        plain.tools.clear();
        self.send_cancellable(&plain, cancel).await.map(|r| r.text)
    }

    async fn complete_with_tools(
        &self,
        request: &LlmRequest,
        cancel: &CancellationToken,
    ) -> Result<LlmResponse> {
        self.send_cancellable(request, cancel).await
    }
}

fn convert_request(request: &LlmRequest) -> OpenAiRequest {
    let tools = if request.tools.is_empty() {
        None
    } else {
        Some(
            request
                .tools
                .iter()
                .map(|t| OpenAiTool {
                    kind: "function".to_string(),
                    function: OpenAiFunctionDefinition {
                        name: t.name.clone(),
                        description: t.description.clone(),
                        parameters: t.input_schema.clone(),
                    },
                })
                .collect(),
        )
    };

    OpenAiRequest {
        model: request.model.clone(),
        messages: request.turns.iter().map(convert_turn).collect(),
        max_tokens: request.max_tokens,
        tools,
    }
}

fn convert_turn(turn: &ConversationTurn) -> OpenAiMessage {
    match turn.role {
        TurnRole::System => OpenAiMessage::System {
            content: turn.content.clone(),
        },
        TurnRole::User => OpenAiMessage::User {
            content: turn.content.clone(),
        },
        TurnRole::Assistant => {
            let tool_calls: Vec<OpenAiToolCall> = turn
                .tool_calls
                .iter()
                .map(|call| OpenAiToolCall {
                    id: call.id.clone(),
                    kind: "function".to_string(),
                    function: OpenAiFunctionCall {
                        name: call.name.clone(),
                        arguments: call.arguments.clone(),
                    },
                })
                .collect();
            OpenAiMessage::Assistant {
                content: (!turn.content.is_empty()).then(|| turn.content.clone()),
                tool_calls: (!tool_calls.is_empty()).then_some(tool_calls),
            }
        }
        TurnRole::Tool => OpenAiMessage::Tool {
            tool_call_id: turn.tool_call_id.clone().unwrap_or_default(),
            content: turn.content.clone(),
        },
    }
}

fn convert_response(response: OpenAiResponse) -> Result<LlmResponse> {
    let choice = response
        .choices
        .into_iter()
        .next()
        .ok_or_else(|| Error::Agent("no choices in OpenAI response".to_string()))?;

    let tool_calls = choice
        .message
        .tool_calls
        .unwrap_or_default()
        .into_iter()
        .map(|tc| ToolCall {
            id: tc.id,
            name: tc.function.name,
            arguments: tc.function.arguments,
        })
        .collect();

    Ok(LlmResponse {
        text: choice.message.content.unwrap_or_default(),
        tool_calls,
        usage: response.usage.map(|u| Usage {
            prompt_tokens: u.prompt_tokens,
            completion_tokens: u.completion_tokens,
        }),
        model: response.model,
    })
}

// Request Types
#[derive(Serialize)]
struct OpenAiRequest {
    model: String,
    messages: Vec<OpenAiMessage>,
    #[serde(skip_serializing_if = "Option::is_none")]
    max_tokens: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    tools: Option<Vec<OpenAiTool>>,
}

#[derive(Serialize)]
#[serde(tag = "role", rename_all = "lowercase")]
enum OpenAiMessage {
    System {
        content: String,
    },
    User {
        content: String,
    },
    Assistant {
        #[serde(skip_serializing_if = "Option::is_none")]
        content: Option<String>,
        #[serde(skip_serializing_if = "Option::is_none")]
        tool_calls: Option<Vec<OpenAiToolCall>>,
    },
    Tool {
        tool_call_id: String,
        content: String,
    },
}

#[derive(Serialize, Deserialize, Clone, Debug)]
struct OpenAiToolCall {
    id: String,
    #[serde(rename = "type", default = "function_kind")]
    kind: String,
    function: OpenAiFunctionCall,
}

fn function_kind() -> String {
    "function".to_string()
}

#[derive(Serialize, Deserialize, Clone, Debug)]
struct OpenAiFunctionCall {
    name: String,
    #[serde(default)]
    arguments: String,
}

#[derive(Serialize)]
struct OpenAiTool {
    #[serde(rename = "type")]
    kind: String,
    function: OpenAiFunctionDefinition,
}

#[derive(Serialize)]
struct OpenAiFunctionDefinition {
    name: String,
    description: String,
    parameters: serde_json::Value,
}

// Response Types
#[derive(Deserialize)]
struct OpenAiResponse {
    #[serde(default)]
    model: String,
    choices: Vec<OpenAiChoice>,
    usage: Option<OpenAiUsage>,
}

#[derive(Deserialize)]
struct OpenAiChoice {
    message: OpenAiResponseMessage,
}

#[derive(Deserialize)]
struct OpenAiResponseMessage {
    content: Option<String>,
    tool_calls: Option<Vec<OpenAiToolCall>>,
}

#[derive(Deserialize)]
struct OpenAiUsage {
    prompt_tokens: u32,
    completion_tokens: u32,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn assistant_tool_call_turn_maps_to_openai_shape() {
        let turn = ConversationTurn::assistant_tool_calls(
            "",
            vec![ToolCall {
                id: "call_1".into(),
                name: "exec".into(),
                arguments: r#"{"command":"ls"}"#.into(),
            }],
        );
        let value = serde_json::to_value(convert_turn(&turn)).unwrap();
        assert_eq!(
            value,
            json!({
                "role": "assistant",
                "tool_calls": [{
                    "id": "call_1",
                    "type": "function",
                    "function": { "name": "exec", "arguments": "{\"command\":\"ls\"}" }
                }]
            })
        );
    }

    #[test]
    fn tool_result_turn_keeps_call_id() {
        let value =
            serde_json::to_value(convert_turn(&ConversationTurn::tool_result("call_1", "ok"))).unwrap();
        assert_eq!(
            value,
            json!({ "role": "tool", "tool_call_id": "call_1", "content": "ok" })
        );
    }

    #[test]
    fn tools_are_omitted_when_none_declared() {
        let request = LlmRequest {
            model: "m".into(),
            turns: vec![ConversationTurn::user("hi")],
            tools: Vec::new(),
            max_tokens: None,
        };
        let value = serde_json::to_value(convert_request(&request)).unwrap();
        assert!(value.get("tools").is_none());
        assert!(value.get("max_tokens").is_none());
    }
}
