use std::sync::Arc;

use parley_channels::ChannelSender;
use parley_common::{ConversationId, ConversationTurn, Error, Result, TurnRole};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use crate::failover::ModelFailover;
use crate::providers::{LlmRequest, ToolDefinition, Usage};
use crate::tool_parse::{legacy_tool_instruction, parse_legacy_tool_call};
use crate::tools::{Tool, ToolContext, ToolOutput};

/// Maximum number of tool-use round-trips before the loop is stopped.
const MAX_TOOL_ITERATIONS: usize = 10;

const DEFAULT_SYSTEM_PROMPT: &str = "You are a helpful assistant.";

/// Call id given to a tool invocation recovered from plain text.
const LEGACY_CALL_ID: &str = "legacy_call";

/// Returned when the iteration cap is reached without a plain-text answer.
pub const COMPLETION_NOTICE: &str =
    "I worked through the available steps for this request but ran out of tool iterations \
     before writing a final answer. Ask me to continue if you need more.";

/// Result of one agent run.
#[derive(Debug, Clone, Default)]
pub struct RunOutcome {
    pub final_text: String,
    /// Executed tool names in order, duplicates kept.
    pub tools_used: Vec<String>,
    pub usage: Usage,
    /// Last model that answered, if any call succeeded.
    pub model: Option<String>,
}

/// Drives the bounded tool-calling loop for one unit of work.
pub struct AgentRuntime {
    failover: ModelFailover,
    tools: Vec<Box<dyn Tool>>,
    system_prompt: Option<String>,
    primary_model: String,
    fallback_models: Vec<String>,
    max_iterations: usize,
    max_tokens: Option<u32>,
    tool_notifier: Option<Arc<dyn ChannelSender>>,
}

impl AgentRuntime {
    pub fn new(failover: ModelFailover) -> Self {
        Self {
            failover,
            tools: Vec::new(),
            system_prompt: None,
            primary_model: String::new(),
            fallback_models: Vec::new(),
            max_iterations: MAX_TOOL_ITERATIONS,
            max_tokens: None,
            tool_notifier: None,
        }
    }

    pub fn set_system_prompt(&mut self, prompt: String) {
        self.system_prompt = Some(prompt);
    }

    pub fn set_models(&mut self, primary: impl Into<String>, fallbacks: Vec<String>) {
        self.primary_model = primary.into();
        self.fallback_models = fallbacks;
    }

    pub fn primary_model(&self) -> &str {
        &self.primary_model
    }

    pub fn set_max_iterations(&mut self, max_iterations: usize) {
        self.max_iterations = max_iterations.max(1);
    }

    pub fn set_max_tokens(&mut self, max_tokens: u32) {
        self.max_tokens = Some(max_tokens);
    }

    /// Send "Using tool: X" to the conversation before each tool runs.
    pub fn set_tool_notifier(&mut self, notifier: Arc<dyn ChannelSender>) {
        self.tool_notifier = Some(notifier);
    }

    pub fn register_tool(&mut self, tool: Box<dyn Tool>) {
        info!("registered tool: {}", tool.name());
        self.tools.push(tool);
    }

    fn tool_definitions(&self) -> Vec<ToolDefinition> {
        self.tools
            .iter()
            .map(|t| ToolDefinition {
                name: t.name().to_string(),
                description: t.description().to_string(),
                input_schema: t.input_schema(),
            })
            .collect()
    }

    fn find_tool(&self, name: &str) -> Option<&dyn Tool> {
        self.tools
            .iter()
            .find(|t| t.name() == name)
            .map(|t| t.as_ref())
    }

    fn initial_turns(&self, user_unit: &str, prior_session_text: Option<&str>) -> Vec<ConversationTurn> {
        let mut turns = vec![ConversationTurn::system(
            self.system_prompt.as_deref().unwrap_or(DEFAULT_SYSTEM_PROMPT),
        )];
        if let Some(prior) = prior_session_text.map(str::trim).filter(|p| !p.is_empty()) {
            turns.push(ConversationTurn::system(format!(
                "Earlier in this conversation:\n{prior}"
            )));
        }
        turns.push(ConversationTurn::user(user_unit));
        turns
    }

    /// Process one unit of work: call the model, execute requested tools,
    /// repeat until a plain-text answer or the iteration cap.
    #[instrument(skip(self, user_unit, prior_session_text, cancel), fields(conversation = %conversation_id))]
    pub async fn run(
        &self,
        conversation_id: &ConversationId,
        user_unit: &str,
        prior_session_text: Option<&str>,
        cancel: &CancellationToken,
    ) -> Result<RunOutcome> {
        let tool_defs = self.tool_definitions();
        let mut turns = self.initial_turns(user_unit, prior_session_text);
        let mut outcome = RunOutcome::default();

        for iteration in 0..self.max_iterations {
            if cancel.is_cancelled() {
                return Err(Error::Cancelled);
            }

            let request = LlmRequest {
                model: String::new(),
                turns: turns.clone(),
                tools: tool_defs.clone(),
                max_tokens: self.max_tokens,
            };

            let (response, model) = match self
                .failover
                .complete_with_failover(&request, &self.primary_model, &self.fallback_models, cancel)
                .await
            {
                Ok(answer) => answer,
                Err(Error::Cancelled) => return Err(Error::Cancelled),
                Err(e) => {
                    warn!("tool-enabled completion failed, trying plain completion: {}", e);
                    return self
                        .plain_fallback(conversation_id, &turns, e, outcome, cancel)
                        .await;
                }
            };
            outcome.usage.add(response.usage);
            outcome.model = Some(model);

            if response.tool_calls.is_empty() {
                debug!(iteration, "model answered without tool calls");
                outcome.final_text = response.text;
                return Ok(outcome);
            }

            turns.push(ConversationTurn::assistant_tool_calls(
                response.text.clone(),
                response.tool_calls.clone(),
            ));

            for call in &response.tool_calls {
                if cancel.is_cancelled() {
                    return Err(Error::Cancelled);
                }
                let output = self
                    .execute_tool_call(conversation_id, &call.name, &call.arguments, cancel)
                    .await?;
                outcome.tools_used.push(call.name.clone());
                turns.push(ConversationTurn::tool_result(call.id.clone(), output.content));
            }
        }

        warn!(
            "tool loop reached maximum of {} iterations without an answer",
            self.max_iterations
        );
        outcome.final_text = COMPLETION_NOTICE.to_string();
        Ok(outcome)
    }

    /// Execute one requested tool. Only cancellation is returned as an error;
    /// everything else becomes an error tool output.
    async fn execute_tool_call(
        &self,
        conversation_id: &ConversationId,
        name: &str,
        raw_arguments: &str,
        cancel: &CancellationToken,
    ) -> Result<ToolOutput> {
        let args = if raw_arguments.trim().is_empty() {
            serde_json::json!({})
        } else {
            match serde_json::from_str::<serde_json::Value>(raw_arguments) {
                Ok(args) => args,
                Err(e) => {
                    return Ok(ToolOutput::error(format!(
                        "invalid arguments for tool {name}: {e}"
                    )));
                }
            }
        };
        self.execute_tool(conversation_id, name, args, cancel).await
    }

    async fn execute_tool(
        &self,
        conversation_id: &ConversationId,
        name: &str,
        args: serde_json::Value,
        cancel: &CancellationToken,
    ) -> Result<ToolOutput> {
        let Some(tool) = self.find_tool(name) else {
            warn!("model requested unknown tool: {}", name);
            return Ok(ToolOutput::error(format!("unknown tool: {name}")));
        };

        self.notify_tool(conversation_id, name).await;

        let context = ToolContext {
            conversation_id: conversation_id.clone(),
            cancel: cancel.clone(),
        };
        match tool.execute(&context, args).await {
            Ok(output) => Ok(output),
            Err(Error::Cancelled) => Err(Error::Cancelled),
            Err(e) => {
                warn!("tool {} failed: {}", name, e);
                Ok(ToolOutput::error(format!("tool {name} failed: {e}")))
            }
        }
    }

    async fn notify_tool(&self, conversation_id: &ConversationId, name: &str) {
        let Some(notifier) = &self.tool_notifier else {
            return;
        };
        if let Err(e) = notifier
            .send_message(conversation_id, &format!("Using tool: {name}"))
            .await
        {
            warn!("failed to deliver tool notification: {}", e);
        }
    }

    /// Plain completion without tool schema; runs at most one tool found in
    /// the answer text and asks for a follow-up.
    async fn plain_fallback(
        &self,
        conversation_id: &ConversationId,
        turns: &[ConversationTurn],
        original: Error,
        mut outcome: RunOutcome,
        cancel: &CancellationToken,
    ) -> Result<RunOutcome> {
        let tool_names: Vec<&str> = self.tools.iter().map(|t| t.name()).collect();
        let mut plain_turns = flatten_for_plain(turns, &tool_names);
        let request = LlmRequest {
            model: String::new(),
            turns: plain_turns.clone(),
            tools: Vec::new(),
            max_tokens: self.max_tokens,
        };

        let (text, model) = match self
            .failover
            .complete_plain_with_failover(&request, &self.primary_model, &self.fallback_models, cancel)
            .await
        {
            Ok(answer) => answer,
            Err(Error::Cancelled) => return Err(Error::Cancelled),
            Err(e) => {
                warn!("plain completion fallback failed: {}", e);
                return Err(original);
            }
        };
        outcome.model = Some(model);

        let Some(call) = parse_legacy_tool_call(&text, &tool_names) else {
            outcome.final_text = text;
            return Ok(outcome);
        };

        info!("executing tool {} recovered from plain completion", call.name);
        let output = self
            .execute_tool(conversation_id, &call.name, call.arguments, cancel)
            .await?;
        outcome.tools_used.push(call.name.clone());

        plain_turns.push(ConversationTurn::assistant(text));
        plain_turns.push(ConversationTurn::user(format!(
            "Result of {} (call {LEGACY_CALL_ID}):\n{}\n\nUse this result to answer the original request.",
            call.name, output.content
        )));
        let follow_up = LlmRequest {
            model: String::new(),
            turns: plain_turns,
            tools: Vec::new(),
            max_tokens: self.max_tokens,
        };
        let (text, model) = self
            .failover
            .complete_plain_with_failover(&follow_up, &self.primary_model, &self.fallback_models, cancel)
            .await?;
        outcome.model = Some(model);
        outcome.final_text = text;
        Ok(outcome)
    }
}

/// Collapse a tool-calling transcript into `[system, user]` for providers
/// that cannot take tool turns.
fn flatten_for_plain(turns: &[ConversationTurn], tool_names: &[&str]) -> Vec<ConversationTurn> {
    let mut system = Vec::new();
    let mut transcript = Vec::new();
    for turn in turns {
        match turn.role {
            TurnRole::System => system.push(turn.content.clone()),
            TurnRole::User => transcript.push(turn.content.clone()),
            TurnRole::Assistant => {
                if !turn.content.trim().is_empty() {
                    transcript.push(format!("Assistant: {}", turn.content));
                }
                for call in &turn.tool_calls {
                    transcript.push(format!("Assistant called {} with {}", call.name, call.arguments));
                }
            }
            TurnRole::Tool => transcript.push(format!("Tool result: {}", turn.content)),
        }
    }
    if !tool_names.is_empty() {
        system.push(legacy_tool_instruction(tool_names));
    }
    vec![
        ConversationTurn::system(system.join("\n\n")),
        ConversationTurn::user(transcript.join("\n\n")),
    ]
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::failover::CooldownTable;
    use crate::providers::{LlmProvider, LlmResponse};
    use async_trait::async_trait;
    use parley_common::ToolCall;
    use std::collections::VecDeque;
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    #[derive(Default)]
    struct ScriptedProvider {
        tool_responses: Mutex<VecDeque<Result<LlmResponse>>>,
        plain_responses: Mutex<VecDeque<Result<String>>>,
        /// Answer used once the tool script is exhausted.
        repeat: Option<LlmResponse>,
        requests: Mutex<Vec<LlmRequest>>,
        calls: Arc<AtomicUsize>,
    }

    impl ScriptedProvider {
        fn with_tool_responses(responses: Vec<Result<LlmResponse>>) -> Self {
            Self {
                tool_responses: Mutex::new(responses.into()),
                ..Default::default()
            }
        }

        fn requests(&self) -> Vec<LlmRequest> {
            self.requests.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl LlmProvider for ScriptedProvider {
        fn provider_id(&self) -> &str {
            "scripted"
        }

        async fn complete(&self, request: &LlmRequest, _cancel: &CancellationToken) -> Result<String> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.requests.lock().unwrap().push(request.clone());
            self.plain_responses
                .lock()
                .unwrap()
                .pop_front()
                .unwrap_or_else(|| Err(Error::Agent("plain script exhausted".into())))
        }

        async fn complete_with_tools(
            &self,
            request: &LlmRequest,
            _cancel: &CancellationToken,
        ) -> Result<LlmResponse> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.requests.lock().unwrap().push(request.clone());
            let next = self.tool_responses.lock().unwrap().pop_front();
            match (next, &self.repeat) {
                (Some(response), _) => response,
                (None, Some(repeat)) => Ok(repeat.clone()),
                (None, None) => Err(Error::Agent("tool script exhausted".into())),
            }
        }
    }

    struct EchoTool {
        calls: Arc<AtomicUsize>,
    }

    #[async_trait]
    impl Tool for EchoTool {
        fn name(&self) -> &'static str {
            "echo"
        }

        fn description(&self) -> &'static str {
            "Echo the text argument"
        }

        fn input_schema(&self) -> serde_json::Value {
            serde_json::json!({ "type": "object", "properties": { "text": { "type": "string" } } })
        }

        async fn execute(&self, _context: &ToolContext, args: serde_json::Value) -> Result<ToolOutput> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(ToolOutput::success(args["text"].as_str().unwrap_or_default()))
        }
    }

    struct FailingTool;

    #[async_trait]
    impl Tool for FailingTool {
        fn name(&self) -> &'static str {
            "broken"
        }

        fn description(&self) -> &'static str {
            "Always fails"
        }

        fn input_schema(&self) -> serde_json::Value {
            serde_json::json!({ "type": "object" })
        }

        async fn execute(&self, _context: &ToolContext, _args: serde_json::Value) -> Result<ToolOutput> {
            Err(Error::Agent("disk full".into()))
        }
    }

    /// Cancels its own run, as `/stop` would mid-tool.
    struct StopTool;

    #[async_trait]
    impl Tool for StopTool {
        fn name(&self) -> &'static str {
            "stop_me"
        }

        fn description(&self) -> &'static str {
            "Cancels the run"
        }

        fn input_schema(&self) -> serde_json::Value {
            serde_json::json!({ "type": "object" })
        }

        async fn execute(&self, context: &ToolContext, _args: serde_json::Value) -> Result<ToolOutput> {
            context.cancel.cancel();
            Ok(ToolOutput::success("stopping"))
        }
    }

    #[derive(Default)]
    struct RecordingSender {
        sent: Mutex<Vec<String>>,
    }

    #[async_trait]
    impl ChannelSender for RecordingSender {
        fn channel_type(&self) -> &str {
            "test"
        }

        async fn send_message(&self, _conversation: &ConversationId, text: &str) -> Result<()> {
            self.sent.lock().unwrap().push(text.to_string());
            Ok(())
        }
    }

    fn text(answer: &str) -> Result<LlmResponse> {
        Ok(LlmResponse {
            text: answer.to_string(),
            usage: Some(Usage {
                prompt_tokens: 10,
                completion_tokens: 5,
            }),
            ..Default::default()
        })
    }

    fn tool_call(id: &str, name: &str, arguments: &str) -> LlmResponse {
        LlmResponse {
            tool_calls: vec![ToolCall {
                id: id.to_string(),
                name: name.to_string(),
                arguments: arguments.to_string(),
            }],
            usage: Some(Usage {
                prompt_tokens: 10,
                completion_tokens: 5,
            }),
            ..Default::default()
        }
    }

    fn runtime(provider: Arc<ScriptedProvider>) -> AgentRuntime {
        let failover = ModelFailover::new(
            provider,
            Arc::new(CooldownTable::new()),
            Duration::from_secs(60),
            Duration::from_secs(120),
        );
        let mut runtime = AgentRuntime::new(failover);
        runtime.set_models("primary", Vec::new());
        runtime
    }

    fn echo_tool() -> (Box<dyn Tool>, Arc<AtomicUsize>) {
        let calls = Arc::new(AtomicUsize::new(0));
        (
            Box::new(EchoTool {
                calls: Arc::clone(&calls),
            }),
            calls,
        )
    }

    fn conversation() -> ConversationId {
        ConversationId::new("c1")
    }

    #[tokio::test]
    async fn plain_answer_finishes_in_one_iteration() {
        let provider = Arc::new(ScriptedProvider::with_tool_responses(vec![text("hello there")]));
        let runtime = runtime(Arc::clone(&provider));

        let outcome = runtime
            .run(&conversation(), "hi", None, &CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(outcome.final_text, "hello there");
        assert!(outcome.tools_used.is_empty());
        assert_eq!(outcome.model.as_deref(), Some("primary"));
        assert_eq!(provider.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn prior_session_text_is_sent_before_the_unit() {
        let provider = Arc::new(ScriptedProvider::with_tool_responses(vec![text("ok")]));
        let mut runtime = runtime(Arc::clone(&provider));
        runtime.set_system_prompt("Be brief.".to_string());

        runtime
            .run(&conversation(), "and now?", Some("User: hi\nAssistant: hello"), &CancellationToken::new())
            .await
            .unwrap();

        let turns = &provider.requests()[0].turns;
        assert_eq!(turns.len(), 3);
        assert_eq!(turns[0].content, "Be brief.");
        assert!(turns[1].content.contains("Assistant: hello"));
        assert_eq!(turns[2], ConversationTurn::user("and now?"));
    }

    #[tokio::test]
    async fn tool_result_is_fed_back_and_usage_accumulates() {
        let provider = Arc::new(ScriptedProvider::with_tool_responses(vec![
            Ok(tool_call("call_1", "echo", r#"{"text":"pong"}"#)),
            text("the tool said pong"),
        ]));
        let mut runtime = runtime(Arc::clone(&provider));
        let (tool, tool_calls) = echo_tool();
        runtime.register_tool(tool);

        let outcome = runtime
            .run(&conversation(), "ping", None, &CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(outcome.final_text, "the tool said pong");
        assert_eq!(outcome.tools_used, vec!["echo"]);
        assert_eq!(outcome.usage.total(), 30);
        assert_eq!(tool_calls.load(Ordering::SeqCst), 1);

        let second = &provider.requests()[1].turns;
        let result = second.last().unwrap();
        assert_eq!(result.role, TurnRole::Tool);
        assert_eq!(result.tool_call_id.as_deref(), Some("call_1"));
        assert_eq!(result.content, "pong");
        assert_eq!(second[second.len() - 2].tool_calls.len(), 1);
    }

    #[tokio::test]
    async fn iteration_cap_returns_completion_notice() {
        let provider = Arc::new(ScriptedProvider {
            repeat: Some(tool_call("call", "echo", r#"{"text":"again"}"#)),
            ..Default::default()
        });
        let mut runtime = runtime(Arc::clone(&provider));
        let (tool, tool_calls) = echo_tool();
        runtime.register_tool(tool);

        let outcome = runtime
            .run(&conversation(), "loop forever", None, &CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(outcome.final_text, COMPLETION_NOTICE);
        assert_eq!(provider.calls.load(Ordering::SeqCst), MAX_TOOL_ITERATIONS);
        assert_eq!(tool_calls.load(Ordering::SeqCst), MAX_TOOL_ITERATIONS);
        assert_eq!(outcome.tools_used.len(), MAX_TOOL_ITERATIONS);
    }

    #[tokio::test]
    async fn tool_failures_become_error_results() {
        let provider = Arc::new(ScriptedProvider::with_tool_responses(vec![
            Ok(LlmResponse {
                tool_calls: vec![
                    ToolCall {
                        id: "a".into(),
                        name: "broken".into(),
                        arguments: "{}".into(),
                    },
                    ToolCall {
                        id: "b".into(),
                        name: "missing".into(),
                        arguments: "{}".into(),
                    },
                    ToolCall {
                        id: "c".into(),
                        name: "echo".into(),
                        arguments: "{not json".into(),
                    },
                ],
                ..Default::default()
            }),
            text("recovered"),
        ]));
        let mut runtime = runtime(Arc::clone(&provider));
        runtime.register_tool(Box::new(FailingTool));
        let (tool, tool_calls) = echo_tool();
        runtime.register_tool(tool);

        let outcome = runtime
            .run(&conversation(), "try things", None, &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(outcome.final_text, "recovered");
        assert_eq!(tool_calls.load(Ordering::SeqCst), 0);

        let turns = &provider.requests()[1].turns;
        let results: Vec<&str> = turns
            .iter()
            .filter(|t| t.role == TurnRole::Tool)
            .map(|t| t.content.as_str())
            .collect();
        assert_eq!(results.len(), 3);
        assert!(results[0].contains("disk full"));
        assert!(results[1].contains("unknown tool: missing"));
        assert!(results[2].contains("invalid arguments for tool echo"));
    }

    #[tokio::test]
    async fn tool_notifications_are_sent() {
        let provider = Arc::new(ScriptedProvider::with_tool_responses(vec![
            Ok(tool_call("call_1", "echo", r#"{"text":"x"}"#)),
            text("done"),
        ]));
        let mut runtime = runtime(Arc::clone(&provider));
        let (tool, _) = echo_tool();
        runtime.register_tool(tool);
        let sender = Arc::new(RecordingSender::default());
        runtime.set_tool_notifier(sender.clone());

        runtime
            .run(&conversation(), "go", None, &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(*sender.sent.lock().unwrap(), vec!["Using tool: echo"]);
    }

    #[tokio::test]
    async fn plain_fallback_executes_embedded_tool_call() {
        let provider = Arc::new(ScriptedProvider {
            tool_responses: Mutex::new(
                vec![Err(Error::provider(Some(400), "tools are not supported"))].into(),
            ),
            plain_responses: Mutex::new(
                vec![
                    Ok(r#"{"tool": "echo", "arguments": {"text": "42"}}"#.to_string()),
                    Ok("The answer is 42.".to_string()),
                ]
                .into(),
            ),
            ..Default::default()
        });
        let mut runtime = runtime(Arc::clone(&provider));
        let (tool, tool_calls) = echo_tool();
        runtime.register_tool(tool);

        let outcome = runtime
            .run(&conversation(), "what is the answer?", None, &CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(outcome.final_text, "The answer is 42.");
        assert_eq!(outcome.tools_used, vec!["echo"]);
        assert_eq!(tool_calls.load(Ordering::SeqCst), 1);

        let requests = provider.requests();
        assert!(requests[1].tools.is_empty());
        assert!(requests[1].turns[0].content.contains("Available tools: echo"));
        assert!(requests[2].turns.last().unwrap().content.contains("42"));
    }

    #[tokio::test]
    async fn plain_fallback_skips_unknown_tool_before_known_one() {
        let provider = Arc::new(ScriptedProvider {
            tool_responses: Mutex::new(vec![Err(Error::provider(Some(400), "bad tools"))].into()),
            plain_responses: Mutex::new(
                vec![
                    Ok(r#"Try {"tool": "browse", "arguments": {}} or {"tool": "echo", "arguments": {"text": "7"}}"#
                        .to_string()),
                    Ok("It is 7.".to_string()),
                ]
                .into(),
            ),
            ..Default::default()
        });
        let mut runtime = runtime(Arc::clone(&provider));
        let (tool, tool_calls) = echo_tool();
        runtime.register_tool(tool);

        let outcome = runtime
            .run(&conversation(), "which number?", None, &CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(outcome.final_text, "It is 7.");
        assert_eq!(outcome.tools_used, vec!["echo"]);
        assert_eq!(tool_calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn plain_fallback_without_call_returns_text() {
        let provider = Arc::new(ScriptedProvider {
            tool_responses: Mutex::new(vec![Err(Error::provider(Some(400), "bad tools"))].into()),
            plain_responses: Mutex::new(vec![Ok("just text".to_string())].into()),
            ..Default::default()
        });
        let runtime = runtime(Arc::clone(&provider));

        let outcome = runtime
            .run(&conversation(), "hi", None, &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(outcome.final_text, "just text");
    }

    #[tokio::test]
    async fn failed_plain_fallback_returns_original_error() {
        let provider = Arc::new(ScriptedProvider::with_tool_responses(vec![Err(
            Error::provider(Some(401), "invalid api key"),
        )]));
        let runtime = runtime(Arc::clone(&provider));

        let err = runtime
            .run(&conversation(), "hi", None, &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(err.to_string().contains("invalid api key"), "got {err}");
    }

    #[tokio::test]
    async fn cancellation_between_tools_stops_the_run() {
        let provider = Arc::new(ScriptedProvider::with_tool_responses(vec![Ok(LlmResponse {
            tool_calls: vec![
                ToolCall {
                    id: "a".into(),
                    name: "stop_me".into(),
                    arguments: "{}".into(),
                },
                ToolCall {
                    id: "b".into(),
                    name: "echo".into(),
                    arguments: r#"{"text":"never"}"#.into(),
                },
            ],
            ..Default::default()
        })]));
        let mut runtime = runtime(Arc::clone(&provider));
        runtime.register_tool(Box::new(StopTool));
        let (tool, tool_calls) = echo_tool();
        runtime.register_tool(tool);

        let err = runtime
            .run(&conversation(), "stop", None, &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(err.is_cancelled());
        assert_eq!(tool_calls.load(Ordering::SeqCst), 0);
        assert_eq!(provider.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn already_cancelled_run_makes_no_calls() {
        let provider = Arc::new(ScriptedProvider::with_tool_responses(vec![text("unused")]));
        let runtime = runtime(Arc::clone(&provider));
        let cancel = CancellationToken::new();
        cancel.cancel();

        let err = runtime.run(&conversation(), "hi", None, &cancel).await.unwrap_err();
        assert!(err.is_cancelled());
        assert_eq!(provider.calls.load(Ordering::SeqCst), 0);
    }
}
