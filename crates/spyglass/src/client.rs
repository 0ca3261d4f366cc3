//! Provider client surfaces.
//!
//! Each supported client shape is a small tree of traits mirroring how the
//! provider SDK is navigated: `client.chat().completions().create(..)` for
//! OpenAI-style clients, `client.messages().create(..)` for Anthropic-style
//! clients, and a flat `generate(..)` for single-call models. Requests and
//! responses are raw JSON so any provider SDK can sit behind them.
//!
//! The capture engine implements the same traits on its wrappers, so a
//! captured client is a drop-in replacement for the original.

use async_trait::async_trait;
use futures::Stream;
use serde_json::Value;
use std::pin::Pin;
use std::sync::Arc;

use crate::error::ProviderError;

/// A streaming response: one JSON chunk (or event) per item.
pub type ChunkStream = Pin<Box<dyn Stream<Item = Result<Value, ProviderError>> + Send + 'static>>;

/// What a terminal invocation returns.
pub enum ModelOutput {
    /// A complete response object.
    Complete(Value),
    /// A stream of chunks, delivered as they arrive.
    Stream(ChunkStream),
}

impl ModelOutput {
    pub fn is_stream(&self) -> bool {
        matches!(self, ModelOutput::Stream(_))
    }

    /// The complete response, if this is not a stream.
    pub fn into_complete(self) -> Option<Value> {
        match self {
            ModelOutput::Complete(v) => Some(v),
            ModelOutput::Stream(_) => None,
        }
    }

    /// The chunk stream, if this is a stream.
    pub fn into_stream(self) -> Option<ChunkStream> {
        match self {
            ModelOutput::Stream(s) => Some(s),
            ModelOutput::Complete(_) => None,
        }
    }
}

impl std::fmt::Debug for ModelOutput {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ModelOutput::Complete(v) => f.debug_tuple("Complete").field(v).finish(),
            ModelOutput::Stream(_) => f.write_str("Stream(..)"),
        }
    }
}

/// True if the request asks for a streamed response.
pub fn is_streaming_request(request: &Value) -> bool {
    request
        .get("stream")
        .and_then(Value::as_bool)
        .unwrap_or(false)
}

/// OpenAI-style client root.
pub trait OpenAiClient: Send + Sync {
    /// The `chat` namespace.
    fn chat(&self) -> Arc<dyn ChatResource>;

    /// API base URL the client talks to.
    fn base_url(&self) -> &str;
}

/// OpenAI-style `chat` namespace.
pub trait ChatResource: Send + Sync {
    /// The `chat.completions` resource.
    fn completions(&self) -> Arc<dyn CompletionsResource>;
}

/// OpenAI-style `chat.completions` resource.
#[async_trait]
pub trait CompletionsResource: Send + Sync {
    /// Create a chat completion. Streams when the request has `"stream": true`.
    async fn create(&self, request: Value) -> Result<ModelOutput, ProviderError>;
}

/// Anthropic-style client root.
pub trait AnthropicClient: Send + Sync {
    /// The `messages` resource.
    fn messages(&self) -> Arc<dyn MessagesResource>;

    /// API base URL the client talks to.
    fn base_url(&self) -> &str;
}

/// Anthropic-style `messages` resource.
#[async_trait]
pub trait MessagesResource: Send + Sync {
    /// Create a message. Streams when the request has `"stream": true`.
    async fn create(&self, request: Value) -> Result<ModelOutput, ProviderError>;

    /// Count input tokens for a request without running it.
    async fn count_tokens(&self, request: Value) -> Result<Value, ProviderError>;
}

/// A single-call completion model (text generation endpoints, local models).
#[async_trait]
pub trait GenerateClient: Send + Sync {
    /// Provider label for records.
    fn provider(&self) -> &str;

    /// Run a generation. Streams when the request has `"stream": true`.
    async fn generate(&self, request: Value) -> Result<ModelOutput, ProviderError>;
}

/// Shared handles, the way clients are passed around.
pub type SharedOpenAiClient = Arc<dyn OpenAiClient>;
pub type SharedAnthropicClient = Arc<dyn AnthropicClient>;
pub type SharedGenerateClient = Arc<dyn GenerateClient>;

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_streaming_flag() {
        assert!(is_streaming_request(&json!({"stream": true})));
        assert!(!is_streaming_request(&json!({"stream": false})));
        assert!(!is_streaming_request(&json!({"model": "x"})));
        assert!(!is_streaming_request(&json!({"stream": "yes"})));
    }

    #[test]
    fn test_model_output_accessors() {
        let out = ModelOutput::Complete(json!({"ok": true}));
        assert!(!out.is_stream());
        assert_eq!(out.into_complete(), Some(json!({"ok": true})));

        let out = ModelOutput::Stream(Box::pin(futures::stream::empty()));
        assert!(out.is_stream());
        assert!(out.into_complete().is_none());
    }
}
