//! Single-shot completion objects.
//!
//! Covers text generation endpoints and local runtimes that return one flat
//! object (`text`, `content`, `response`, nested `generations`) and stream
//! partial objects of the same shape.

use serde_json::{Map, Value};
use spyglass_tracing::{Message, NormalizedCall};

use super::{
    ProviderAdapter, StreamAccumulator, build_call, content_text, fallback_output_text,
    message_tool_calls,
};

/// Fields whose value is streamed text rather than metadata.
const TEXT_FIELDS: &[&str] = &["text", "content", "output_text", "response", "delta"];

/// Adapter for flat completion objects under any provider label.
#[derive(Debug, Clone)]
pub struct GenericAdapter {
    provider: String,
}

impl GenericAdapter {
    pub fn new(provider: impl Into<String>) -> Self {
        Self {
            provider: provider.into(),
        }
    }
}

impl ProviderAdapter for GenericAdapter {
    fn provider(&self) -> &str {
        &self.provider
    }

    fn normalize(&self, request: &Value, response: &Value) -> NormalizedCall {
        // Chat-style local runtimes return a single `message`.
        let output = match response.get("message").filter(|m| m.is_object()) {
            Some(message) => vec![Message {
                role: message
                    .get("role")
                    .and_then(Value::as_str)
                    .unwrap_or("assistant")
                    .to_string(),
                content: message.get("content").and_then(content_text),
                tool_calls: message_tool_calls(message),
                tool_call_id: None,
            }],
            None => fallback_output_text(response)
                .map(|text| vec![Message::assistant(text)])
                .unwrap_or_default(),
        };

        build_call(&self.provider, request, response, output)
    }

    fn accumulator(&self) -> Box<dyn StreamAccumulator> {
        Box::new(TextAccumulator::default())
    }
}

/// Concatenates streamed text; the latest value of every other field wins.
#[derive(Debug, Default)]
pub struct TextAccumulator {
    text: String,
    meta: Map<String, Value>,
}

impl StreamAccumulator for TextAccumulator {
    fn push(&mut self, chunk: &Value) -> bool {
        let fragment = match chunk {
            Value::String(s) => Some(s.clone()),
            Value::Object(fields) => {
                for (key, value) in fields {
                    if !TEXT_FIELDS.contains(&key.as_str()) && !value.is_null() {
                        self.meta.insert(key.clone(), value.clone());
                    }
                }
                TEXT_FIELDS
                    .iter()
                    .find_map(|key| chunk.get(*key).and_then(content_text))
                    .or_else(|| chunk.pointer("/message/content").and_then(content_text))
            }
            _ => None,
        };

        match fragment {
            Some(fragment) => {
                self.text.push_str(&fragment);
                !fragment.is_empty()
            }
            None => false,
        }
    }

    fn is_empty(&self) -> bool {
        self.text.trim().is_empty()
    }

    fn has_tool_calls(&self) -> bool {
        false
    }

    fn finish(self: Box<Self>) -> Value {
        let this = *self;
        let mut response = this.meta;
        // A streamed chat `message` holds only the last fragment.
        response.remove("message");
        response.insert("text".to_string(), Value::String(this.text));
        Value::Object(response)
    }
}
