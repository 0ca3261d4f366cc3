//! Provider payload fixtures.
//!
//! Shapes follow the public wire formats closely enough for the adapters to
//! treat them as the real thing.

use serde_json::{Value, json};

// ============================================================================
// Single-shot completions
// ============================================================================

/// Flat completion object from a text generation endpoint.
pub fn text_completion(text: &str) -> Value {
    json!({"model": "tiny", "text": text})
}

// ============================================================================
// OpenAI-style chat
// ============================================================================

/// Chat request with one user message.
pub fn chat_request(prompt: &str) -> Value {
    json!({
        "model": "gpt-4o-mini",
        "messages": [{"role": "user", "content": prompt}]
    })
}

/// Chat completion with usage of 5 prompt and 3 completion tokens.
pub fn chat_completion(text: &str) -> Value {
    json!({
        "id": "chatcmpl-1",
        "object": "chat.completion",
        "model": "gpt-4o-mini",
        "choices": [{
            "index": 0,
            "message": {"role": "assistant", "content": text},
            "finish_reason": "stop"
        }],
        "usage": {"prompt_tokens": 5, "completion_tokens": 3, "total_tokens": 8}
    })
}

/// Chat completion that asks for one tool call.
pub fn chat_tool_completion(name: &str, arguments: &str) -> Value {
    json!({
        "id": "chatcmpl-2",
        "object": "chat.completion",
        "model": "gpt-4o-mini",
        "choices": [{
            "index": 0,
            "message": {
                "role": "assistant",
                "content": null,
                "tool_calls": [{
                    "id": "call_1",
                    "type": "function",
                    "function": {"name": name, "arguments": arguments}
                }]
            },
            "finish_reason": "tool_calls"
        }],
        "usage": {"prompt_tokens": 20, "completion_tokens": 7}
    })
}

fn chat_chunk(delta: Value, finish_reason: Option<&str>) -> Value {
    json!({
        "id": "chatcmpl-1",
        "object": "chat.completion.chunk",
        "model": "gpt-4o-mini",
        "choices": [{"index": 0, "delta": delta, "finish_reason": finish_reason}]
    })
}

/// Streamed chat: a role chunk, one chunk per fragment, a final stop chunk.
pub fn chat_chunks(fragments: &[&str]) -> Vec<Value> {
    let mut chunks = vec![chat_chunk(json!({"role": "assistant", "content": ""}), None)];
    chunks.extend(
        fragments
            .iter()
            .map(|text| chat_chunk(json!({"content": text}), None)),
    );
    chunks.push(chat_chunk(json!({}), Some("stop")));
    chunks
}

/// Streamed chat with one tool call whose arguments arrive in `fragments`.
pub fn chat_tool_chunks(name: &str, fragments: &[&str]) -> Vec<Value> {
    let mut chunks = vec![chat_chunk(
        json!({
            "role": "assistant",
            "tool_calls": [{
                "index": 0,
                "id": "call_1",
                "type": "function",
                "function": {"name": name, "arguments": ""}
            }]
        }),
        None,
    )];
    chunks.extend(fragments.iter().map(|args| {
        chat_chunk(
            json!({"tool_calls": [{"index": 0, "function": {"arguments": args}}]}),
            None,
        )
    }));
    chunks.push(chat_chunk(json!({}), Some("tool_calls")));
    chunks
}

// ============================================================================
// Anthropic-style messages
// ============================================================================

/// Complete message with one text block.
pub fn anthropic_message(text: &str) -> Value {
    json!({
        "id": "msg_1",
        "type": "message",
        "role": "assistant",
        "model": "claude-3-5-haiku",
        "content": [{"type": "text", "text": text}],
        "stop_reason": "end_turn",
        "usage": {"input_tokens": 12, "output_tokens": 4}
    })
}

fn message_start() -> Value {
    json!({
        "type": "message_start",
        "message": {
            "id": "msg_1",
            "type": "message",
            "role": "assistant",
            "model": "claude-3-5-haiku",
            "content": [],
            "usage": {"input_tokens": 12, "output_tokens": 1}
        }
    })
}

fn message_end(stop_reason: &str) -> [Value; 2] {
    [
        json!({
            "type": "message_delta",
            "delta": {"stop_reason": stop_reason},
            "usage": {"output_tokens": 9}
        }),
        json!({"type": "message_stop"}),
    ]
}

/// Event stream for one text block built from `fragments`.
pub fn anthropic_text_events(fragments: &[&str]) -> Vec<Value> {
    let mut events = vec![
        message_start(),
        json!({"type": "content_block_start", "index": 0, "content_block": {"type": "text", "text": ""}}),
    ];
    events.extend(fragments.iter().map(|text| {
        json!({"type": "content_block_delta", "index": 0, "delta": {"type": "text_delta", "text": text}})
    }));
    events.push(json!({"type": "content_block_stop", "index": 0}));
    events.extend(message_end("end_turn"));
    events
}

/// Event stream for one tool_use block whose input arrives in `fragments`.
pub fn anthropic_tool_events(name: &str, fragments: &[&str]) -> Vec<Value> {
    let mut events = vec![
        message_start(),
        json!({
            "type": "content_block_start",
            "index": 0,
            "content_block": {"type": "tool_use", "id": "toolu_1", "name": name, "input": {}}
        }),
    ];
    events.extend(fragments.iter().map(|partial| {
        json!({
            "type": "content_block_delta",
            "index": 0,
            "delta": {"type": "input_json_delta", "partial_json": partial}
        })
    }));
    events.push(json!({"type": "content_block_stop", "index": 0}));
    events.extend(message_end("tool_use"));
    events
}
