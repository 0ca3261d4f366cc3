//! Response normalization.
//!
//! Turns a provider request/response pair into a [`NormalizedCall`]. Each
//! supported response shape has a [`ProviderAdapter`]; the helpers in this
//! module hold the extraction steps every adapter shares. Normalization only
//! reads the caller's JSON; nothing here mutates it.

pub mod anthropic;
pub mod generic;
pub mod openai;
pub mod repair;

use serde_json::Value;
use spyglass_tracing::{Message, NormalizedCall, ToolCall, ToolDefinition, Usage};

use crate::branch::Accumulate;

pub use anthropic::AnthropicAdapter;
pub use generic::GenericAdapter;
pub use openai::OpenAiAdapter;
pub use repair::{arguments_value, repair_arguments};

/// Characters per token for local estimates.
pub const CHARS_PER_TOKEN: u64 = 4;

/// One adapter per supported response shape.
pub trait ProviderAdapter: Send + Sync {
    /// Provider label recorded on the call.
    fn provider(&self) -> &str;

    /// Build the canonical record for a complete response.
    fn normalize(&self, request: &Value, response: &Value) -> NormalizedCall;

    /// A fresh accumulator that rebuilds a complete response from chunks.
    fn accumulator(&self) -> Box<dyn StreamAccumulator>;
}

/// Rebuilds a complete response object from streamed chunks.
pub trait StreamAccumulator: Send {
    /// Fold one chunk in. Returns true if it carried text or tool output.
    fn push(&mut self, chunk: &Value) -> bool;

    /// True if no text has accumulated.
    fn is_empty(&self) -> bool;

    /// True if any tool call has started.
    fn has_tool_calls(&self) -> bool;

    /// The response object the provider would have returned unstreamed.
    fn finish(self: Box<Self>) -> Value;
}

impl Accumulate<Value> for Box<dyn StreamAccumulator> {
    type Output = Value;

    fn push(&mut self, chunk: &Value) -> bool {
        (**self).push(chunk)
    }

    fn is_empty(&self) -> bool {
        (**self).is_empty()
    }

    fn finish(self) -> Value {
        StreamAccumulator::finish(self)
    }
}

/// Assemble a call from the shared extraction steps plus adapter output.
pub fn build_call(
    provider: &str,
    request: &Value,
    response: &Value,
    output: Vec<Message>,
) -> NormalizedCall {
    let input_messages = extract_input_messages(request);
    let usage = extract_usage(response, &input_messages, &output);

    NormalizedCall {
        provider: provider.to_string(),
        request_model: str_field(request, "model"),
        response_model: str_field(response, "model")
            .or_else(|| str_field(response, "modelVersion")),
        finish_reason: extract_finish_reason(response),
        input_messages,
        output_messages: Some(output),
        tool_definitions: request
            .get("tools")
            .or_else(|| request.get("functions"))
            .map(normalize_tool_definitions)
            .unwrap_or_default(),
        usage,
    }
}

fn str_field(value: &Value, key: &str) -> Option<String> {
    value.get(key).and_then(Value::as_str).map(String::from)
}

/// Flatten message content (string or list of parts) into text.
///
/// Returns `None` when there is no text at all.
pub fn content_text(content: &Value) -> Option<String> {
    match content {
        Value::String(s) => Some(s.clone()),
        Value::Array(parts) => {
            let texts: Vec<String> = parts
                .iter()
                .filter_map(|part| match part {
                    Value::String(s) => Some(s.clone()),
                    Value::Object(obj) => match obj.get("type").and_then(Value::as_str) {
                        Some("tool_use") | Some("image") | Some("image_url") => None,
                        Some("tool_result") => obj.get("content").and_then(content_text),
                        _ => obj.get("text").and_then(Value::as_str).map(String::from),
                    },
                    _ => None,
                })
                .collect();
            if texts.is_empty() {
                None
            } else {
                Some(texts.join(""))
            }
        }
        _ => None,
    }
}

/// Tool calls carried by a single message, in any supported shape.
pub fn message_tool_calls(message: &Value) -> Vec<ToolCall> {
    let mut calls = Vec::new();

    // OpenAI: `tool_calls[].function`
    if let Some(list) = message.get("tool_calls").and_then(Value::as_array) {
        for call in list {
            let function = call.get("function").unwrap_or(call);
            calls.push(ToolCall {
                id: str_field(call, "id"),
                name: str_field(function, "name").unwrap_or_else(|| "unknown".to_string()),
                arguments: arguments_value(function.get("arguments")),
            });
        }
    }

    // Legacy OpenAI: single `function_call`
    if let Some(function) = message.get("function_call").filter(|f| f.is_object()) {
        calls.push(ToolCall {
            id: None,
            name: str_field(function, "name").unwrap_or_else(|| "unknown".to_string()),
            arguments: arguments_value(function.get("arguments")),
        });
    }

    // Anthropic: `tool_use` content blocks
    if let Some(blocks) = message.get("content").and_then(Value::as_array) {
        calls.extend(blocks.iter().filter_map(tool_use_block));
    }

    calls
}

/// A `tool_use` content block as a tool call.
pub fn tool_use_block(block: &Value) -> Option<ToolCall> {
    if block.get("type").and_then(Value::as_str) != Some("tool_use") {
        return None;
    }
    Some(ToolCall {
        id: str_field(block, "id"),
        name: str_field(block, "name").unwrap_or_else(|| "unknown".to_string()),
        arguments: arguments_value(block.get("input")),
    })
}

fn to_message(value: &Value) -> Message {
    Message {
        role: str_field(value, "role").unwrap_or_else(|| "user".to_string()),
        content: value.get("content").and_then(content_text),
        tool_calls: message_tool_calls(value),
        tool_call_id: str_field(value, "tool_call_id"),
    }
}

/// Step 1: input messages.
///
/// An explicit message list wins; otherwise a raw prompt becomes one user
/// message. A system instruction is prepended unless a system message is
/// already first.
pub fn extract_input_messages(request: &Value) -> Vec<Message> {
    let mut messages: Vec<Message> = match request.get("messages").and_then(Value::as_array) {
        Some(list) => list.iter().map(to_message).collect(),
        None => ["prompt", "input"]
            .iter()
            .find_map(|key| request.get(*key).and_then(content_text))
            .map(|prompt| vec![Message::user(prompt)])
            .unwrap_or_default(),
    };

    let system = request
        .get("system")
        .or_else(|| request.get("instructions"))
        .and_then(content_text)
        .filter(|s| !s.is_empty());

    if let Some(system) = system {
        let already_first = messages.first().is_some_and(|m| m.role == "system");
        if !already_first {
            messages.insert(0, Message::system(system));
        }
    }

    messages
}

/// Step 2 fallback: text from single-shot response fields.
///
/// Tried in fixed order, stopping at the first non-empty candidate:
/// `text`, `content`, `output_text`, `response`, the last generation of a
/// (possibly nested) `generations` array, the last `candidates` entry.
pub fn fallback_output_text(response: &Value) -> Option<String> {
    let candidates = [
        response.get("text").and_then(content_text),
        response.get("content").and_then(content_text),
        response.get("output_text").and_then(content_text),
        response.get("response").and_then(content_text),
        response.get("generations").and_then(last_generation_text),
        response
            .get("candidates")
            .and_then(Value::as_array)
            .and_then(|c| c.last())
            .and_then(|c| c.pointer("/content/parts"))
            .and_then(content_text),
    ];

    candidates.into_iter().flatten().find(|s| !s.is_empty())
}

fn last_generation_text(generations: &Value) -> Option<String> {
    match generations {
        Value::Array(items) => items.last().and_then(last_generation_text),
        Value::Object(_) => generations
            .get("text")
            .or_else(|| generations.pointer("/message/content"))
            .and_then(content_text),
        _ => None,
    }
}

/// Provider usage field names, in priority order:
/// (container pointer, input key, output key).
const USAGE_FIELDS: &[(&str, &str, &str)] = &[
    ("/usage", "prompt_tokens", "completion_tokens"),
    ("/usage", "input_tokens", "output_tokens"),
    ("/usageMetadata", "promptTokenCount", "candidatesTokenCount"),
    ("/meta/billed_units", "input_tokens", "output_tokens"),
    ("/llm_output/token_usage", "prompt_tokens", "completion_tokens"),
    // Local runtimes report counts at the top level.
    ("", "prompt_eval_count", "eval_count"),
];

/// Step 3: token usage.
///
/// Reported counts come from the first matching field pair. Without any,
/// counts are estimated from character length and tagged as estimated.
pub fn extract_usage(response: &Value, input: &[Message], output: &[Message]) -> Usage {
    for (pointer, input_key, output_key) in USAGE_FIELDS {
        let Some(container) = response.pointer(pointer) else {
            continue;
        };
        let input_tokens = container.get(*input_key).and_then(Value::as_u64);
        let output_tokens = container.get(*output_key).and_then(Value::as_u64);
        if input_tokens.is_none() && output_tokens.is_none() {
            continue;
        }

        // Anthropic reports cached prompt tokens separately.
        let cached = ["cache_read_input_tokens", "cache_creation_input_tokens"]
            .iter()
            .filter_map(|k| container.get(*k).and_then(Value::as_u64))
            .sum::<u64>();

        let mut usage = Usage::reported(input_tokens.unwrap_or(0) + cached, output_tokens.unwrap_or(0));
        if let Some(total) = container
            .get("total_tokens")
            .or_else(|| container.get("totalTokenCount"))
            .and_then(Value::as_u64)
        {
            usage.total_tokens = total;
        }
        if let Some(cost) = container.get("cost").and_then(Value::as_f64) {
            usage.cost = Some(cost);
        }
        return usage;
    }

    Usage::estimated(estimate_tokens(input), estimate_tokens(output))
}

/// Estimate tokens for a message list from its character count.
pub fn estimate_tokens(messages: &[Message]) -> u64 {
    let chars: usize = messages
        .iter()
        .map(|m| {
            m.content.as_deref().map_or(0, |c| c.chars().count())
                + m.tool_calls
                    .iter()
                    .map(|t| t.name.len() + t.arguments.to_string().len())
                    .sum::<usize>()
        })
        .sum();
    (chars as u64).div_ceil(CHARS_PER_TOKEN)
}

/// Step 4: finish reason.
///
/// The last choice or generation wins over top-level stop fields.
pub fn extract_finish_reason(response: &Value) -> Option<String> {
    let from_list = |key: &str, field: &str| {
        response
            .get(key)
            .and_then(Value::as_array)
            .and_then(|items| items.last())
            .and_then(|item| match item {
                // Nested generation lists
                Value::Array(inner) => inner.last(),
                other => Some(other),
            })
            .and_then(|item| {
                item.get(field)
                    .or_else(|| item.pointer("/generation_info/finish_reason"))
            })
            .and_then(Value::as_str)
            .map(String::from)
    };

    from_list("choices", "finish_reason")
        .or_else(|| from_list("generations", "finish_reason"))
        .or_else(|| from_list("candidates", "finishReason"))
        .or_else(|| str_field(response, "stop_reason"))
        .or_else(|| str_field(response, "finish_reason"))
}

/// Step 5: tool definitions.
///
/// Accepts an array of definitions, an array of `[name, definition]` pairs,
/// or an object keyed by tool name.
pub fn normalize_tool_definitions(tools: &Value) -> Vec<ToolDefinition> {
    match tools {
        Value::Array(items) => items
            .iter()
            .map(|item| match item.as_array().map(Vec::as_slice) {
                Some([name, def]) => tool_definition(name.as_str(), def),
                _ => tool_definition(None, item),
            })
            .collect(),
        Value::Object(map) => map
            .iter()
            .map(|(name, def)| tool_definition(Some(name), def))
            .collect(),
        _ => Vec::new(),
    }
}

fn tool_definition(key_name: Option<&str>, def: &Value) -> ToolDefinition {
    let function = def.get("function").unwrap_or(def);
    let name = str_field(function, "name")
        .or_else(|| key_name.map(String::from))
        .unwrap_or_else(|| "unknown".to_string());

    ToolDefinition {
        tool_type: str_field(def, "type").unwrap_or_else(|| "function".to_string()),
        name,
        description: str_field(function, "description"),
        input_schema: function
            .get("parameters")
            .or_else(|| function.get("input_schema"))
            .or_else(|| function.get("inputSchema"))
            .cloned()
            .unwrap_or(Value::Null),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use spyglass_tracing::UsageSource;

    #[test]
    fn test_input_messages_prefer_list() {
        let request = json!({
            "messages": [{"role": "user", "content": "hi"}],
            "prompt": "ignored"
        });
        let messages = extract_input_messages(&request);
        assert_eq!(messages, vec![Message::user("hi")]);
    }

    #[test]
    fn test_input_from_prompt_with_system() {
        let request = json!({"prompt": "tell me", "system": "be brief"});
        let messages = extract_input_messages(&request);
        assert_eq!(messages, vec![Message::system("be brief"), Message::user("tell me")]);
    }

    #[test]
    fn test_system_not_duplicated() {
        let request = json!({
            "system": "be brief",
            "messages": [
                {"role": "system", "content": "be brief"},
                {"role": "user", "content": "hi"}
            ]
        });
        assert_eq!(extract_input_messages(&request).len(), 2);
    }

    #[test]
    fn test_content_parts_are_flattened() {
        let content = json!([
            {"type": "text", "text": "look at "},
            {"type": "image_url", "image_url": {"url": "x"}},
            {"type": "text", "text": "this"}
        ]);
        assert_eq!(content_text(&content).as_deref(), Some("look at this"));
        assert_eq!(content_text(&json!([{"type": "image"}])), None);
    }

    #[test]
    fn test_fallback_order() {
        assert_eq!(
            fallback_output_text(&json!({"text": "", "content": "second"})).as_deref(),
            Some("second")
        );
        assert_eq!(
            fallback_output_text(&json!({
                "generations": [[{"text": "old"}], [{"text": "first"}, {"text": "last"}]]
            }))
            .as_deref(),
            Some("last")
        );
        assert_eq!(
            fallback_output_text(&json!({
                "candidates": [{"content": {"parts": [{"text": "gem"}]}}]
            }))
            .as_deref(),
            Some("gem")
        );
        assert_eq!(fallback_output_text(&json!({"id": "x"})), None);
    }

    #[test]
    fn test_usage_priority_and_estimate() {
        let usage = extract_usage(
            &json!({"usage": {"prompt_tokens": 5, "completion_tokens": 3}}),
            &[],
            &[],
        );
        assert_eq!(usage, Usage::reported(5, 3));

        let usage = extract_usage(
            &json!({"usage": {"input_tokens": 10, "output_tokens": 2, "cache_read_input_tokens": 4}}),
            &[],
            &[],
        );
        assert_eq!((usage.input_tokens, usage.total_tokens), (14, 16));

        let usage = extract_usage(
            &json!({}),
            &[Message::user("12345678")],
            &[Message::assistant("abc")],
        );
        assert_eq!(usage.source, UsageSource::Estimated);
        assert_eq!((usage.input_tokens, usage.output_tokens), (2, 1));
    }

    #[test]
    fn test_finish_reason_priority() {
        assert_eq!(
            extract_finish_reason(&json!({
                "choices": [{"finish_reason": "stop"}, {"finish_reason": "length"}],
                "stop_reason": "end_turn"
            }))
            .as_deref(),
            Some("length")
        );
        assert_eq!(
            extract_finish_reason(&json!({"stop_reason": "end_turn"})).as_deref(),
            Some("end_turn")
        );
        assert_eq!(extract_finish_reason(&json!({})), None);
    }

    #[test]
    fn test_tool_definitions_all_shapes() {
        let openai = json!([{
            "type": "function",
            "function": {"name": "search", "description": "find", "parameters": {"type": "object"}}
        }]);
        let defs = normalize_tool_definitions(&openai);
        assert_eq!(defs[0].name, "search");
        assert_eq!(defs[0].input_schema, json!({"type": "object"}));

        let anthropic = json!([{"name": "lookup", "input_schema": {"type": "object"}}]);
        assert_eq!(normalize_tool_definitions(&anthropic)[0].tool_type, "function");

        let keyed = json!({"weather": {"description": "forecast"}});
        let defs = normalize_tool_definitions(&keyed);
        assert_eq!(defs[0].name, "weather");
        assert_eq!(defs[0].description.as_deref(), Some("forecast"));

        let pairs = json!([["calc", {"description": "math"}], {"description": "nameless"}]);
        let defs = normalize_tool_definitions(&pairs);
        assert_eq!(defs[0].name, "calc");
        assert_eq!(defs[1].name, "unknown");
    }

    #[test]
    fn test_message_tool_calls_repair_arguments() {
        let message = json!({
            "role": "assistant",
            "tool_calls": [{
                "id": "call_1",
                "type": "function",
                "function": {"name": "search", "arguments": "\"query\":\"rain\""}
            }]
        });
        let calls = message_tool_calls(&message);
        assert_eq!(calls[0].arguments, json!({"query": "rain"}));
        assert_eq!(calls[0].id.as_deref(), Some("call_1"));
    }

    #[test]
    fn test_normalization_does_not_mutate_inputs() {
        let request = json!({"model": "m", "messages": [{"role": "user", "content": "hi"}]});
        let response = json!({"choices": [{"message": {"role": "assistant", "content": "yo"}}]});
        let (req_before, resp_before) = (request.clone(), response.clone());

        let _ = build_call("test", &request, &response, vec![Message::assistant("yo")]);
        assert_eq!(request, req_before);
        assert_eq!(response, resp_before);
    }
}
