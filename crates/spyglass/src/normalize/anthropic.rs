//! Anthropic-style messages.
//!
//! A complete response is a message with a `content` block list. Streams are
//! server-sent events: `message_start`, then per block `content_block_start`,
//! `content_block_delta` (`text_delta` or `input_json_delta`) and
//! `content_block_stop`, then `message_delta` with the stop reason and
//! output usage.

use std::collections::BTreeMap;

use serde_json::{Map, Value, json};
use spyglass_tracing::{Message, NormalizedCall};

use super::{
    ProviderAdapter, StreamAccumulator, build_call, fallback_output_text, repair_arguments,
    tool_use_block,
};

/// Adapter for the messages API.
#[derive(Debug, Clone)]
pub struct AnthropicAdapter {
    provider: String,
}

impl AnthropicAdapter {
    pub fn new() -> Self {
        Self {
            provider: "anthropic".to_string(),
        }
    }
}

impl Default for AnthropicAdapter {
    fn default() -> Self {
        Self::new()
    }
}

impl ProviderAdapter for AnthropicAdapter {
    fn provider(&self) -> &str {
        &self.provider
    }

    fn normalize(&self, request: &Value, response: &Value) -> NormalizedCall {
        build_call(&self.provider, request, response, output_messages(response))
    }

    fn accumulator(&self) -> Box<dyn StreamAccumulator> {
        Box::new(EventAccumulator::default())
    }
}

fn output_messages(response: &Value) -> Vec<Message> {
    let Some(blocks) = response.get("content").and_then(Value::as_array) else {
        return fallback_output_text(response)
            .map(|text| vec![Message::assistant(text)])
            .unwrap_or_default();
    };

    let text: String = blocks
        .iter()
        .filter(|b| b.get("type").and_then(Value::as_str) == Some("text"))
        .filter_map(|b| b.get("text").and_then(Value::as_str))
        .collect();

    vec![Message {
        role: response
            .get("role")
            .and_then(Value::as_str)
            .unwrap_or("assistant")
            .to_string(),
        content: if text.is_empty() { None } else { Some(text) },
        tool_calls: blocks.iter().filter_map(tool_use_block).collect(),
        tool_call_id: None,
    }]
}

#[derive(Debug)]
enum Block {
    Text(String),
    ToolUse {
        id: Option<String>,
        name: String,
        input: String,
    },
    /// Block types we pass through untouched (thinking, server tools).
    Other(Value),
}

/// Folds message stream events back into a message object.
#[derive(Debug, Default)]
pub struct EventAccumulator {
    message: Map<String, Value>,
    blocks: BTreeMap<u64, Block>,
    stop_reason: Option<String>,
    usage: Map<String, Value>,
}

impl EventAccumulator {
    fn start_block(&mut self, index: u64, block: &Value) -> bool {
        let kind = block.get("type").and_then(Value::as_str).unwrap_or("");
        let (entry, carried) = match kind {
            "text" => {
                let text = block.get("text").and_then(Value::as_str).unwrap_or("");
                (Block::Text(text.to_string()), !text.is_empty())
            }
            "tool_use" => {
                // `input` is `{}` here; the real input streams as JSON text.
                let input = block
                    .get("input")
                    .filter(|v| v.as_object().is_some_and(|o| !o.is_empty()))
                    .map(Value::to_string)
                    .unwrap_or_default();
                let entry = Block::ToolUse {
                    id: block.get("id").and_then(Value::as_str).map(String::from),
                    name: block
                        .get("name")
                        .and_then(Value::as_str)
                        .unwrap_or("unknown")
                        .to_string(),
                    input,
                };
                (entry, true)
            }
            _ => (Block::Other(block.clone()), false),
        };
        self.blocks.insert(index, entry);
        carried
    }

    fn apply_delta(&mut self, index: u64, delta: &Value) -> bool {
        let kind = delta.get("type").and_then(Value::as_str).unwrap_or("");
        let block = self
            .blocks
            .entry(index)
            .or_insert_with(|| match kind {
                "input_json_delta" => Block::ToolUse {
                    id: None,
                    name: "unknown".to_string(),
                    input: String::new(),
                },
                _ => Block::Text(String::new()),
            });

        match (block, kind) {
            (Block::Text(text), "text_delta") => {
                let fragment = delta.get("text").and_then(Value::as_str).unwrap_or("");
                text.push_str(fragment);
                !fragment.is_empty()
            }
            (Block::ToolUse { input, .. }, "input_json_delta") => {
                let fragment = delta
                    .get("partial_json")
                    .and_then(Value::as_str)
                    .unwrap_or("");
                input.push_str(fragment);
                true
            }
            _ => false,
        }
    }

    fn merge_usage(&mut self, usage: &Value) {
        if let Some(fields) = usage.as_object() {
            for (key, value) in fields {
                if !value.is_null() {
                    self.usage.insert(key.clone(), value.clone());
                }
            }
        }
    }
}

impl StreamAccumulator for EventAccumulator {
    fn push(&mut self, event: &Value) -> bool {
        let index = event.get("index").and_then(Value::as_u64).unwrap_or(0);

        match event.get("type").and_then(Value::as_str) {
            Some("message_start") => {
                if let Some(message) = event.get("message").and_then(Value::as_object) {
                    for (key, value) in message {
                        match key.as_str() {
                            "usage" => self.merge_usage(value),
                            "content" => {}
                            _ => {
                                self.message.insert(key.clone(), value.clone());
                            }
                        }
                    }
                }
                false
            }
            Some("content_block_start") => match event.get("content_block") {
                Some(block) => self.start_block(index, block),
                None => false,
            },
            Some("content_block_delta") => match event.get("delta") {
                Some(delta) => self.apply_delta(index, delta),
                None => false,
            },
            Some("message_delta") => {
                if let Some(reason) = event.pointer("/delta/stop_reason").and_then(Value::as_str) {
                    self.stop_reason = Some(reason.to_string());
                }
                if let Some(usage) = event.get("usage") {
                    self.merge_usage(usage);
                }
                false
            }
            // content_block_stop, message_stop, ping
            _ => false,
        }
    }

    fn is_empty(&self) -> bool {
        !self.blocks.values().any(|b| match b {
            Block::Text(text) => !text.trim().is_empty(),
            _ => false,
        })
    }

    fn has_tool_calls(&self) -> bool {
        self.blocks
            .values()
            .any(|b| matches!(b, Block::ToolUse { .. }))
    }

    fn finish(self: Box<Self>) -> Value {
        let this = *self;
        let content: Vec<Value> = this
            .blocks
            .into_values()
            .map(|block| match block {
                Block::Text(text) => json!({"type": "text", "text": text}),
                Block::ToolUse { id, name, input } => json!({
                    "type": "tool_use",
                    "id": id,
                    "name": name,
                    "input": repair_arguments(&input),
                }),
                Block::Other(value) => value,
            })
            .collect();

        let mut message = this.message;
        message
            .entry("type".to_string())
            .or_insert_with(|| json!("message"));
        message
            .entry("role".to_string())
            .or_insert_with(|| json!("assistant"));
        message.insert("content".to_string(), Value::Array(content));
        message.insert("stop_reason".to_string(), json!(this.stop_reason));
        if !this.usage.is_empty() {
            message.insert("usage".to_string(), Value::Object(this.usage));
        }

        Value::Object(message)
    }
}
