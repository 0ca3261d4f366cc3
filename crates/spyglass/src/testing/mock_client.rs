//! Mock provider clients.
//!
//! Each mock replays a [`Script`] of queued replies and records every request
//! it receives.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use futures::StreamExt;
use serde_json::{Value, json};

use crate::client::{
    AnthropicClient, ChatResource, ChunkStream, CompletionsResource, GenerateClient,
    MessagesResource, ModelOutput, OpenAiClient,
};
use crate::error::ProviderError;

#[derive(Debug, Clone)]
enum Reply {
    Complete(Value),
    Stream(Vec<Result<Value, ProviderError>>),
    Fail(ProviderError),
}

/// Queued replies plus captured requests. Clones share state.
#[derive(Debug, Clone, Default)]
pub struct Script {
    replies: Arc<Mutex<VecDeque<Reply>>>,
    requests: Arc<Mutex<Vec<Value>>>,
    latency: Option<Duration>,
    chunk_delay: Option<Duration>,
}

impl Script {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue a complete response.
    pub fn push_response(&self, response: Value) {
        self.replies.lock().unwrap().push_back(Reply::Complete(response));
    }

    /// Queue a stream that yields `chunks` and ends.
    pub fn push_stream(&self, chunks: Vec<Value>) {
        self.replies
            .lock()
            .unwrap()
            .push_back(Reply::Stream(chunks.into_iter().map(Ok).collect()));
    }

    /// Queue a stream that yields `chunks` and then fails.
    pub fn push_failing_stream(&self, chunks: Vec<Value>, error: ProviderError) {
        let mut items: Vec<_> = chunks.into_iter().map(Ok).collect();
        items.push(Err(error));
        self.replies.lock().unwrap().push_back(Reply::Stream(items));
    }

    /// Queue an error returned by the call itself.
    pub fn push_error(&self, error: ProviderError) {
        self.replies.lock().unwrap().push_back(Reply::Fail(error));
    }

    /// All requests received, in order.
    pub fn requests(&self) -> Vec<Value> {
        self.requests.lock().unwrap().clone()
    }

    pub fn request_count(&self) -> usize {
        self.requests.lock().unwrap().len()
    }

    /// Play the next queued reply for `request`.
    pub async fn play(&self, request: Value) -> Result<ModelOutput, ProviderError> {
        self.requests.lock().unwrap().push(request);

        if let Some(latency) = self.latency {
            tokio::time::sleep(latency).await;
        }

        let reply = self.replies.lock().unwrap().pop_front();
        match reply {
            Some(Reply::Complete(response)) => Ok(ModelOutput::Complete(response)),
            Some(Reply::Fail(error)) => Err(error),
            Some(Reply::Stream(items)) => {
                let items = futures::stream::iter(items);
                let stream: ChunkStream = match self.chunk_delay {
                    Some(delay) => Box::pin(items.then(move |item| async move {
                        tokio::time::sleep(delay).await;
                        item
                    })),
                    None => Box::pin(items),
                };
                Ok(ModelOutput::Stream(stream))
            }
            None => Err(ProviderError::Other(
                "mock client: no more responses queued".to_string(),
            )),
        }
    }
}

/// Mock single-call generation client.
#[derive(Debug, Clone)]
pub struct MockGenerate {
    provider: String,
    script: Script,
}

impl MockGenerate {
    pub fn new(provider: impl Into<String>) -> Self {
        Self {
            provider: provider.into(),
            script: Script::new(),
        }
    }

    pub fn with_response(self, response: Value) -> Self {
        self.script.push_response(response);
        self
    }

    pub fn with_stream(self, chunks: Vec<Value>) -> Self {
        self.script.push_stream(chunks);
        self
    }

    pub fn with_failing_stream(self, chunks: Vec<Value>, error: ProviderError) -> Self {
        self.script.push_failing_stream(chunks, error);
        self
    }

    pub fn with_error(self, error: ProviderError) -> Self {
        self.script.push_error(error);
        self
    }

    /// Simulated latency before each reply.
    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.script.latency = Some(latency);
        self
    }

    /// Simulated delay before each streamed chunk.
    pub fn with_chunk_delay(mut self, delay: Duration) -> Self {
        self.script.chunk_delay = Some(delay);
        self
    }

    pub fn requests(&self) -> Vec<Value> {
        self.script.requests()
    }
}

#[async_trait]
impl GenerateClient for MockGenerate {
    fn provider(&self) -> &str {
        &self.provider
    }

    async fn generate(&self, request: Value) -> Result<ModelOutput, ProviderError> {
        self.script.play(request).await
    }
}

/// Mock OpenAI-style client. `chat()` and `completions()` return the same
/// objects on every call, like a real SDK client.
pub struct MockOpenAi {
    base_url: String,
    chat: Arc<MockChat>,
    script: Script,
}

struct MockChat {
    completions: Arc<MockCompletions>,
}

struct MockCompletions {
    script: Script,
}

impl MockOpenAi {
    pub fn new() -> Self {
        Self::with_base_url("https://api.openai.com/v1")
    }

    pub fn with_base_url(base_url: impl Into<String>) -> Self {
        let script = Script::new();
        Self {
            base_url: base_url.into(),
            chat: Arc::new(MockChat {
                completions: Arc::new(MockCompletions {
                    script: script.clone(),
                }),
            }),
            script,
        }
    }

    pub fn with_response(self, response: Value) -> Self {
        self.script.push_response(response);
        self
    }

    pub fn with_stream(self, chunks: Vec<Value>) -> Self {
        self.script.push_stream(chunks);
        self
    }

    pub fn with_failing_stream(self, chunks: Vec<Value>, error: ProviderError) -> Self {
        self.script.push_failing_stream(chunks, error);
        self
    }

    pub fn with_error(self, error: ProviderError) -> Self {
        self.script.push_error(error);
        self
    }

    pub fn script(&self) -> &Script {
        &self.script
    }

    pub fn requests(&self) -> Vec<Value> {
        self.script.requests()
    }
}

impl Default for MockOpenAi {
    fn default() -> Self {
        Self::new()
    }
}

impl OpenAiClient for MockOpenAi {
    fn chat(&self) -> Arc<dyn ChatResource> {
        self.chat.clone()
    }

    fn base_url(&self) -> &str {
        &self.base_url
    }
}

impl ChatResource for MockChat {
    fn completions(&self) -> Arc<dyn CompletionsResource> {
        self.completions.clone()
    }
}

#[async_trait]
impl CompletionsResource for MockCompletions {
    async fn create(&self, request: Value) -> Result<ModelOutput, ProviderError> {
        self.script.play(request).await
    }
}

/// Mock Anthropic-style client.
pub struct MockAnthropic {
    messages: Arc<MockMessages>,
    script: Script,
}

struct MockMessages {
    script: Script,
}

impl MockAnthropic {
    pub fn new() -> Self {
        let script = Script::new();
        Self {
            messages: Arc::new(MockMessages {
                script: script.clone(),
            }),
            script,
        }
    }

    pub fn with_response(self, response: Value) -> Self {
        self.script.push_response(response);
        self
    }

    pub fn with_stream(self, events: Vec<Value>) -> Self {
        self.script.push_stream(events);
        self
    }

    pub fn with_error(self, error: ProviderError) -> Self {
        self.script.push_error(error);
        self
    }

    pub fn requests(&self) -> Vec<Value> {
        self.script.requests()
    }
}

impl Default for MockAnthropic {
    fn default() -> Self {
        Self::new()
    }
}

impl AnthropicClient for MockAnthropic {
    fn messages(&self) -> Arc<dyn MessagesResource> {
        self.messages.clone()
    }

    fn base_url(&self) -> &str {
        "https://api.anthropic.com"
    }
}

#[async_trait]
impl MessagesResource for MockMessages {
    async fn create(&self, request: Value) -> Result<ModelOutput, ProviderError> {
        self.script.play(request).await
    }

    async fn count_tokens(&self, _request: Value) -> Result<Value, ProviderError> {
        Ok(json!({"input_tokens": 0}))
    }
}
