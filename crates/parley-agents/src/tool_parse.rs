//! Best-effort extraction of a tool invocation embedded in plain model text.
//!
//! Used only when the structured tool-calling path failed and the runtime
//! fell back to a plain completion.

use serde_json::{Map, Value};

const NAME_KEYS: &[&str] = &["tool", "name", "tool_name", "function"];
const ARGUMENT_KEYS: &[&str] = &["arguments", "args", "parameters", "input"];

/// Instruction appended to the system prompt on the plain-completion path.
pub(crate) fn legacy_tool_instruction(tool_names: &[&str]) -> String {
    format!(
        "Tool calling is unavailable in structured form. If you need a tool, reply with \
         exactly one JSON object of the form {{\"tool\": \"<name>\", \"arguments\": {{...}}}} \
         and nothing else. Available tools: {}. Otherwise answer normally.",
        tool_names.join(", ")
    )
}

#[derive(Debug, Clone, PartialEq)]
pub struct LegacyToolCall {
    pub name: String,
    pub arguments: Value,
}

/// First JSON object in `text` that names one of `known_tools`. Objects
/// naming any other tool are skipped. String-encoded arguments are decoded;
/// missing arguments become `{}`.
pub fn parse_legacy_tool_call(text: &str, known_tools: &[&str]) -> Option<LegacyToolCall> {
    for (start, _) in text.match_indices('{') {
        let mut stream = serde_json::Deserializer::from_str(&text[start..]).into_iter::<Value>();
        let Some(Ok(Value::Object(object))) = stream.next() else {
            continue;
        };
        if let Some(call) =
            call_from_object(&object).filter(|call| known_tools.contains(&call.name.as_str()))
        {
            return Some(call);
        }
    }
    None
}

fn call_from_object(object: &Map<String, Value>) -> Option<LegacyToolCall> {
    // OpenAI-style `{"function": {"name": ..., "arguments": ...}}`.
    if let Some(Value::Object(inner)) = object.get("function") {
        return call_from_object(inner);
    }

    let name = NAME_KEYS
        .iter()
        .find_map(|key| object.get(*key).and_then(Value::as_str))
        .map(str::trim)
        .filter(|name| !name.is_empty())?;

    let arguments = match ARGUMENT_KEYS.iter().find_map(|key| object.get(*key)) {
        Some(Value::String(raw)) => serde_json::from_str(raw).unwrap_or_else(|_| Value::String(raw.clone())),
        Some(value) => value.clone(),
        None => Value::Object(Map::new()),
    };

    Some(LegacyToolCall {
        name: name.to_string(),
        arguments,
    })
}
