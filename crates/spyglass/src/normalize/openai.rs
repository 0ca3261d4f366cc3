//! OpenAI-style chat completions.
//!
//! Complete responses carry `choices[].message`. Streams are chunk objects
//! whose `choices[0].delta` holds a text fragment and/or tool call fragments
//! keyed by `index`; the last chunk may carry only `usage`.

use std::collections::BTreeMap;

use serde_json::{Map, Value, json};
use spyglass_tracing::{Message, NormalizedCall};

use super::{
    ProviderAdapter, StreamAccumulator, build_call, content_text, fallback_output_text,
    message_tool_calls,
};

/// Adapter for `chat.completions` responses and chunk streams.
#[derive(Debug, Clone)]
pub struct OpenAiAdapter {
    provider: String,
}

impl OpenAiAdapter {
    pub fn new() -> Self {
        Self::with_provider("openai")
    }

    /// Same wire shape under a different label (Azure, Groq, local gateways).
    pub fn with_provider(provider: impl Into<String>) -> Self {
        Self {
            provider: provider.into(),
        }
    }
}

impl Default for OpenAiAdapter {
    fn default() -> Self {
        Self::new()
    }
}

impl ProviderAdapter for OpenAiAdapter {
    fn provider(&self) -> &str {
        &self.provider
    }

    fn normalize(&self, request: &Value, response: &Value) -> NormalizedCall {
        build_call(&self.provider, request, response, output_messages(response))
    }

    fn accumulator(&self) -> Box<dyn StreamAccumulator> {
        Box::new(DeltaAccumulator::default())
    }
}

fn output_messages(response: &Value) -> Vec<Message> {
    if let Some(choices) = response.get("choices").and_then(Value::as_array) {
        return choices
            .iter()
            .map(|choice| match choice.get("message") {
                Some(message) => Message {
                    role: message
                        .get("role")
                        .and_then(Value::as_str)
                        .unwrap_or("assistant")
                        .to_string(),
                    content: message.get("content").and_then(content_text),
                    tool_calls: message_tool_calls(message),
                    tool_call_id: None,
                },
                // Legacy text completions
                None => Message {
                    role: "assistant".to_string(),
                    content: choice.get("text").and_then(content_text),
                    tool_calls: Vec::new(),
                    tool_call_id: None,
                },
            })
            .collect();
    }

    fallback_output_text(response)
        .map(|text| vec![Message::assistant(text)])
        .unwrap_or_default()
}

#[derive(Debug, Default)]
struct PartialToolCall {
    id: Option<String>,
    kind: Option<String>,
    name: String,
    arguments: String,
}

/// Merges `chat.completion.chunk` deltas back into a `chat.completion`.
#[derive(Debug, Default)]
pub struct DeltaAccumulator {
    id: Option<String>,
    model: Option<String>,
    created: Option<Value>,
    role: Option<String>,
    content: String,
    tool_calls: BTreeMap<u64, PartialToolCall>,
    finish_reason: Option<String>,
    usage: Option<Value>,
}

impl DeltaAccumulator {
    fn merge_tool_calls(&mut self, deltas: &[Value]) -> bool {
        let mut carried = false;
        for (position, delta) in deltas.iter().enumerate() {
            let index = delta
                .get("index")
                .and_then(Value::as_u64)
                .unwrap_or(position as u64);
            let call = self.tool_calls.entry(index).or_default();
            carried = true;

            if let Some(id) = delta.get("id").and_then(Value::as_str) {
                call.id = Some(id.to_string());
            }
            if let Some(kind) = delta.get("type").and_then(Value::as_str) {
                call.kind = Some(kind.to_string());
            }
            if let Some(function) = delta.get("function") {
                // Names arrive whole; some gateways repeat them on every delta.
                if let Some(name) = function.get("name").and_then(Value::as_str) {
                    if !name.is_empty() {
                        call.name = name.to_string();
                    }
                }
                if let Some(args) = function.get("arguments").and_then(Value::as_str) {
                    call.arguments.push_str(args);
                }
            }
        }
        carried
    }
}

impl StreamAccumulator for DeltaAccumulator {
    fn push(&mut self, chunk: &Value) -> bool {
        if self.id.is_none() {
            self.id = chunk.get("id").and_then(Value::as_str).map(String::from);
        }
        if self.model.is_none() {
            self.model = chunk.get("model").and_then(Value::as_str).map(String::from);
        }
        if self.created.is_none() {
            self.created = chunk.get("created").cloned();
        }
        if let Some(usage) = chunk.get("usage").filter(|u| u.is_object()) {
            self.usage = Some(usage.clone());
        }

        let mut carried = false;
        let choices = chunk.get("choices").and_then(Value::as_array);
        // Only the first choice is reconstructed; n > 1 streams are rare.
        let choice = choices.and_then(|c| {
            c.iter()
                .find(|choice| choice.get("index").and_then(Value::as_u64).unwrap_or(0) == 0)
        });

        if let Some(choice) = choice {
            if let Some(delta) = choice.get("delta") {
                if let Some(role) = delta.get("role").and_then(Value::as_str) {
                    self.role = Some(role.to_string());
                }
                if let Some(text) = delta.get("content").and_then(Value::as_str) {
                    self.content.push_str(text);
                    carried |= !text.is_empty();
                }
                if let Some(calls) = delta.get("tool_calls").and_then(Value::as_array) {
                    carried |= self.merge_tool_calls(calls);
                }
            }
            if let Some(text) = choice.get("text").and_then(Value::as_str) {
                self.content.push_str(text);
                carried |= !text.is_empty();
            }
            if let Some(reason) = choice.get("finish_reason").and_then(Value::as_str) {
                self.finish_reason = Some(reason.to_string());
            }
        }

        carried
    }

    fn is_empty(&self) -> bool {
        self.content.trim().is_empty()
    }

    fn has_tool_calls(&self) -> bool {
        !self.tool_calls.is_empty()
    }

    fn finish(self: Box<Self>) -> Value {
        let this = *self;
        let mut message = Map::new();
        message.insert(
            "role".to_string(),
            json!(this.role.as_deref().unwrap_or("assistant")),
        );
        message.insert(
            "content".to_string(),
            if this.content.is_empty() {
                Value::Null
            } else {
                Value::String(this.content)
            },
        );

        if !this.tool_calls.is_empty() {
            let calls: Vec<Value> = this
                .tool_calls
                .into_values()
                .map(|call| {
                    json!({
                        "id": call.id,
                        "type": call.kind.unwrap_or_else(|| "function".to_string()),
                        "function": {"name": call.name, "arguments": call.arguments}
                    })
                })
                .collect();
            message.insert("tool_calls".to_string(), Value::Array(calls));
        }

        let mut response = json!({
            "object": "chat.completion",
            "choices": [{
                "index": 0,
                "message": Value::Object(message),
                "finish_reason": this.finish_reason,
            }],
        });

        if let Some(obj) = response.as_object_mut() {
            for (key, value) in [
                ("id", this.id.map(Value::String)),
                ("model", this.model.map(Value::String)),
                ("created", this.created),
                ("usage", this.usage),
            ] {
                if let Some(value) = value {
                    obj.insert(key.to_string(), value);
                }
            }
        }

        response
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use spyglass_tracing::UsageSource;

    fn text_chunk(text: &str) -> Value {
        json!({
            "id": "chatcmpl-1",
            "model": "gpt-4o-mini",
            "choices": [{"index": 0, "delta": {"content": text}, "finish_reason": null}]
        })
    }

    #[test]
    fn test_normalize_blocking_response() {
        let request = json!({"model": "gpt-x", "messages": [{"role": "user", "content": "hi"}]});
        let response = json!({
            "model": "gpt-x-2024",
            "choices": [{"message": {"role": "assistant", "content": "hello"}, "finish_reason": "stop"}],
            "usage": {"prompt_tokens": 5, "completion_tokens": 3}
        });

        let call = OpenAiAdapter::new().normalize(&request, &response);
        assert_eq!(call.provider, "openai");
        assert_eq!(call.request_model.as_deref(), Some("gpt-x"));
        assert_eq!(call.response_model.as_deref(), Some("gpt-x-2024"));
        assert_eq!(call.output_messages, Some(vec![Message::assistant("hello")]));
        assert_eq!(call.finish_reason.as_deref(), Some("stop"));
        assert_eq!(call.usage.total_tokens, 8);
        assert_eq!(call.usage.source, UsageSource::Reported);
    }

    #[test]
    fn test_normalize_tool_call_response() {
        let response = json!({
            "choices": [{
                "message": {
                    "role": "assistant",
                    "content": null,
                    "tool_calls": [{
                        "id": "call_9",
                        "type": "function",
                        "function": {"name": "weather", "arguments": "{\"city\":\"Oslo\"}"}
                    }]
                },
                "finish_reason": "tool_calls"
            }]
        });

        let call = OpenAiAdapter::new().normalize(&json!({}), &response);
        let tools: Vec<_> = call.output_tool_calls().collect();
        assert_eq!(tools.len(), 1);
        assert_eq!(tools[0].name, "weather");
        assert_eq!(tools[0].arguments, json!({"city": "Oslo"}));
        assert!(!call.is_empty_output());
    }

    #[test]
    fn test_accumulate_text_for_any_split() {
        let text = "The quick brown fox";
        for split in 0..=text.len() {
            let mut acc = OpenAiAdapter::new().accumulator();
            acc.push(&text_chunk(&text[..split]));
            acc.push(&text_chunk(&text[split..]));
            acc.push(&json!({"choices": [{"index": 0, "delta": {}, "finish_reason": "stop"}]}));

            let response = acc.finish();
            let call = OpenAiAdapter::new().normalize(&json!({}), &response);
            assert_eq!(call.output_text(), text, "split at {split}");
            assert_eq!(call.finish_reason.as_deref(), Some("stop"));
        }
    }

    #[test]
    fn test_accumulate_tool_call_fragments() {
        let mut acc = OpenAiAdapter::new().accumulator();
        acc.push(&json!({"choices": [{"index": 0, "delta": {"role": "assistant", "tool_calls": [
            {"index": 0, "id": "call_1", "type": "function", "function": {"name": "search", "arguments": ""}}
        ]}}]}));
        acc.push(&json!({"choices": [{"index": 0, "delta": {"tool_calls": [
            {"index": 0, "function": {"arguments": "{\"query\":"}}
        ]}}]}));
        acc.push(&json!({"choices": [{"index": 0, "delta": {"tool_calls": [
            {"index": 0, "function": {"arguments": "\"rain\"}"}}
        ]}}]}));

        assert!(acc.is_empty());
        assert!(acc.has_tool_calls());

        let call = OpenAiAdapter::new().normalize(&json!({}), &acc.finish());
        let tools: Vec<_> = call.output_tool_calls().collect();
        assert_eq!(tools[0].id.as_deref(), Some("call_1"));
        assert_eq!(tools[0].arguments, json!({"query": "rain"}));
    }

    #[test]
    fn test_trailing_usage_chunk() {
        let mut acc = OpenAiAdapter::new().accumulator();
        assert!(acc.push(&text_chunk("hi")));
        assert!(!acc.push(&json!({
            "choices": [],
            "usage": {"prompt_tokens": 4, "completion_tokens": 1, "total_tokens": 5}
        })));

        let response = acc.finish();
        assert_eq!(response["usage"]["total_tokens"], 5);
        assert_eq!(response["model"], "gpt-4o-mini");
    }

    #[test]
    fn test_empty_deltas_are_empty() {
        let mut acc = OpenAiAdapter::new().accumulator();
        assert!(!acc.push(&text_chunk("")));
        assert!(acc.is_empty());
        assert!(!acc.has_tool_calls());
    }
}
