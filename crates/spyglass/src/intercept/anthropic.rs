//! Captured Anthropic-style client.

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;

use super::Capture;
use crate::client::{AnthropicClient, MessagesResource, ModelOutput};
use crate::error::ProviderError;
use crate::normalize::{AnthropicAdapter, ProviderAdapter};

pub struct CapturedAnthropic {
    inner: Arc<dyn AnthropicClient>,
    capture: Capture,
    adapter: Arc<dyn ProviderAdapter>,
}

impl CapturedAnthropic {
    pub(crate) fn new(inner: Arc<dyn AnthropicClient>, capture: Capture) -> Self {
        Self {
            inner,
            capture,
            adapter: Arc::new(AnthropicAdapter::new()),
        }
    }
}

impl AnthropicClient for CapturedAnthropic {
    fn messages(&self) -> Arc<dyn MessagesResource> {
        let adapter = Arc::clone(&self.adapter);
        self.capture.wrap_with(
            "anthropic.messages",
            self.inner.messages(),
            |inner| CapturedMessages {
                inner,
                capture: self.capture.clone(),
                adapter,
            },
            |w| w as Arc<dyn MessagesResource>,
        )
    }

    fn base_url(&self) -> &str {
        self.inner.base_url()
    }
}

pub struct CapturedMessages {
    inner: Arc<dyn MessagesResource>,
    capture: Capture,
    adapter: Arc<dyn ProviderAdapter>,
}

#[async_trait]
impl MessagesResource for CapturedMessages {
    async fn create(&self, request: Value) -> Result<ModelOutput, ProviderError> {
        self.capture
            .instrument(
                "messages.create",
                Arc::clone(&self.adapter),
                request,
                |request| self.inner.create(request),
            )
            .await
    }

    // Not a model call.
    async fn count_tokens(&self, request: Value) -> Result<Value, ProviderError> {
        self.inner.count_tokens(request).await
    }
}
