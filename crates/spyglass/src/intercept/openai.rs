//! Captured OpenAI-style client.

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;

use super::Capture;
use crate::client::{ChatResource, CompletionsResource, ModelOutput, OpenAiClient};
use crate::error::ProviderError;
use crate::normalize::ProviderAdapter;

/// Provider label for an OpenAI-compatible endpoint.
pub fn provider_label(base_url: &str) -> &'static str {
    let url = base_url.to_lowercase();
    [
        ("azure", "azure"),
        ("groq", "groq"),
        ("openrouter", "openrouter"),
        ("together", "together"),
        ("mistral", "mistral"),
        ("localhost", "local"),
        ("127.0.0.1", "local"),
    ]
    .into_iter()
    .find(|(needle, _)| url.contains(needle))
    .map(|(_, label)| label)
    .unwrap_or("openai")
}

pub struct CapturedOpenAi {
    inner: Arc<dyn OpenAiClient>,
    capture: Capture,
    adapter: Arc<dyn ProviderAdapter>,
}

impl CapturedOpenAi {
    pub(crate) fn new(
        inner: Arc<dyn OpenAiClient>,
        capture: Capture,
        adapter: Arc<dyn ProviderAdapter>,
    ) -> Self {
        Self {
            inner,
            capture,
            adapter,
        }
    }
}

impl OpenAiClient for CapturedOpenAi {
    fn chat(&self) -> Arc<dyn ChatResource> {
        let adapter = Arc::clone(&self.adapter);
        self.capture.wrap_with(
            "openai.chat",
            self.inner.chat(),
            |inner| CapturedChat {
                inner,
                capture: self.capture.clone(),
                adapter,
            },
            |w| w as Arc<dyn ChatResource>,
        )
    }

    fn base_url(&self) -> &str {
        self.inner.base_url()
    }
}

pub struct CapturedChat {
    inner: Arc<dyn ChatResource>,
    capture: Capture,
    adapter: Arc<dyn ProviderAdapter>,
}

impl ChatResource for CapturedChat {
    fn completions(&self) -> Arc<dyn CompletionsResource> {
        let adapter = Arc::clone(&self.adapter);
        self.capture.wrap_with(
            "openai.chat.completions",
            self.inner.completions(),
            |inner| CapturedCompletions {
                inner,
                capture: self.capture.clone(),
                adapter,
            },
            |w| w as Arc<dyn CompletionsResource>,
        )
    }
}

pub struct CapturedCompletions {
    inner: Arc<dyn CompletionsResource>,
    capture: Capture,
    adapter: Arc<dyn ProviderAdapter>,
}

#[async_trait]
impl CompletionsResource for CapturedCompletions {
    async fn create(&self, request: Value) -> Result<ModelOutput, ProviderError> {
        self.capture
            .instrument(
                "chat.completions.create",
                Arc::clone(&self.adapter),
                request,
                |request| self.inner.create(request),
            )
            .await
    }
}
