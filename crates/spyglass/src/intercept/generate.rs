//! Captured single-call generation client.

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;

use super::Capture;
use crate::client::{GenerateClient, ModelOutput};
use crate::error::ProviderError;
use crate::normalize::{GenericAdapter, ProviderAdapter};

pub struct CapturedGenerate {
    inner: Arc<dyn GenerateClient>,
    capture: Capture,
    adapter: Arc<dyn ProviderAdapter>,
}

impl CapturedGenerate {
    pub(crate) fn new(inner: Arc<dyn GenerateClient>, capture: Capture) -> Self {
        let adapter = Arc::new(GenericAdapter::new(inner.provider()));
        Self {
            inner,
            capture,
            adapter,
        }
    }
}

#[async_trait]
impl GenerateClient for CapturedGenerate {
    fn provider(&self) -> &str {
        self.inner.provider()
    }

    async fn generate(&self, request: Value) -> Result<ModelOutput, ProviderError> {
        self.capture
            .instrument(
                "generate",
                Arc::clone(&self.adapter),
                request,
                |request| self.inner.generate(request),
            )
            .await
    }
}
