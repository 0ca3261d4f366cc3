//! Client interception.
//!
//! [`Capture`] is the handle an application holds. `wrap_*` returns a client
//! with the same trait surface as the original; navigation methods return
//! wrapped sub-resources and terminal methods are instrumented. Wrapping is
//! memoized per source object and falls back to the original client if
//! anything goes wrong.

pub mod anthropic;
pub mod cache;
pub mod generate;
pub mod openai;

use std::future::Future;
use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use serde_json::Value;
use spyglass_tracing::context;

use crate::assembler::{Assembler, LlmStreamSink, Redact, SpanTiming, normalize_or_partial};
use crate::branch::{BranchOptions, branch};
use crate::client::{
    ModelOutput, SharedAnthropicClient, SharedGenerateClient, SharedOpenAiClient,
    is_streaming_request,
};
use crate::config::{CaptureConfig, SPYGLASS_DIR};
use crate::emitter::{Emitter, JsonlCollector, SharedCollector};
use crate::error::{Failure, ProviderError, observe};
use crate::normalize::{ProviderAdapter, StreamAccumulator};

pub use anthropic::{CapturedAnthropic, CapturedMessages};
pub use cache::{WrapCache, Wrapping};
pub use generate::CapturedGenerate;
pub use openai::{CapturedChat, CapturedCompletions, CapturedOpenAi};

struct CaptureInner {
    config: CaptureConfig,
    assembler: Arc<Assembler>,
    cache: WrapCache,
}

/// Capture engine handle. Cheap to clone.
#[derive(Clone)]
pub struct Capture {
    inner: Arc<CaptureInner>,
}

/// Builder for [`Capture`].
pub struct CaptureBuilder {
    config: CaptureConfig,
    collector: Option<SharedCollector>,
    redactor: Option<Arc<dyn Redact>>,
    spyglass_dir: Option<std::path::PathBuf>,
}

impl CaptureBuilder {
    /// Send records to this collector instead of the JSONL file.
    pub fn collector(mut self, collector: SharedCollector) -> Self {
        self.collector = Some(collector);
        self
    }

    /// Run payloads through `redactor` before they are recorded.
    pub fn redactor(mut self, redactor: Arc<dyn Redact>) -> Self {
        self.redactor = Some(redactor);
        self
    }

    /// Resolve relative writer paths against this directory.
    pub fn spyglass_dir(mut self, dir: impl Into<std::path::PathBuf>) -> Self {
        self.spyglass_dir = Some(dir.into());
        self
    }

    /// Build the engine. Must be called inside a tokio runtime for records
    /// to be delivered.
    pub fn build(self) -> Capture {
        for error in self.config.validate() {
            tracing::warn!(field = %error.field, "Invalid capture config: {}", error.message);
        }

        let collector = if self.config.enabled {
            self.collector.or_else(|| {
                match JsonlCollector::from_settings(&self.config.writer, self.spyglass_dir.as_deref()) {
                    Ok(collector) => Some(Arc::new(collector) as SharedCollector),
                    Err(e) => {
                        tracing::warn!(error = %e, "Failed to open record file, capture disabled");
                        None
                    }
                }
            })
        } else {
            None
        };

        let emitter = match collector {
            Some(collector) => Emitter::new(collector, self.config.emitter.queue_capacity),
            None => Emitter::disabled(),
        };

        let mut assembler = Assembler::new(&self.config, emitter);
        if let Some(redactor) = self.redactor {
            assembler = assembler.with_redactor(redactor);
        }

        Capture {
            inner: Arc::new(CaptureInner {
                config: self.config,
                assembler: Arc::new(assembler),
                cache: WrapCache::new(),
            }),
        }
    }
}

impl Capture {
    pub fn builder(config: CaptureConfig) -> CaptureBuilder {
        CaptureBuilder {
            config,
            collector: None,
            redactor: None,
            spyglass_dir: None,
        }
    }

    /// Engine delivering to `collector`.
    pub fn new(config: CaptureConfig, collector: SharedCollector) -> Self {
        Self::builder(config).collector(collector).build()
    }

    /// Engine configured from the nearest `.spyglass/config.toml`, writing
    /// JSONL records next to it. Without a config file, defaults apply and
    /// records go to `start/.spyglass/records`.
    pub fn discover(start: &Path) -> Self {
        match CaptureConfig::find_and_load_from(start) {
            Ok(Some((config, dir))) => {
                tracing::debug!(dir = %dir.display(), "Loaded capture config");
                Self::builder(config).spyglass_dir(dir).build()
            }
            Ok(None) => {
                let dir = start.join(SPYGLASS_DIR);
                tracing::info!(
                    dir = %dir.display(),
                    "No capture config found, writing records with defaults"
                );
                Self::builder(CaptureConfig::default()).spyglass_dir(dir).build()
            }
            Err(e) => {
                tracing::warn!(error = %e, "Failed to load capture config, capture disabled");
                Self::disabled()
            }
        }
    }

    /// Engine that wraps nothing and records nothing.
    pub fn disabled() -> Self {
        let config = CaptureConfig {
            enabled: false,
            ..CaptureConfig::default()
        };
        Self::builder(config).build()
    }

    pub fn config(&self) -> &CaptureConfig {
        &self.inner.config
    }

    pub fn is_enabled(&self) -> bool {
        self.inner.config.enabled
    }

    pub(crate) fn assembler(&self) -> &Arc<Assembler> {
        &self.inner.assembler
    }

    /// Wait until all records emitted so far have reached the collector.
    pub async fn flush(&self) {
        self.inner.assembler.emitter().flush().await;
    }

    /// Records dropped because the emission queue was full.
    pub fn dropped_records(&self) -> u64 {
        self.inner.assembler.emitter().dropped()
    }

    /// Wrap an OpenAI-style client.
    pub fn wrap_openai(&self, client: SharedOpenAiClient) -> SharedOpenAiClient {
        if !self.is_enabled() {
            return client;
        }
        let adapter = Arc::new(crate::normalize::OpenAiAdapter::with_provider(
            openai::provider_label(client.base_url()),
        ));
        self.wrap_with(
            "openai",
            client,
            |inner| CapturedOpenAi::new(inner, self.clone(), adapter),
            |w| w as SharedOpenAiClient,
        )
    }

    /// Wrap an Anthropic-style client.
    pub fn wrap_anthropic(&self, client: SharedAnthropicClient) -> SharedAnthropicClient {
        if !self.is_enabled() {
            return client;
        }
        self.wrap_with(
            "anthropic",
            client,
            |inner| CapturedAnthropic::new(inner, self.clone()),
            |w| w as SharedAnthropicClient,
        )
    }

    /// Wrap a single-call generation client.
    pub fn wrap_generate(&self, client: SharedGenerateClient) -> SharedGenerateClient {
        if !self.is_enabled() {
            return client;
        }
        self.wrap_with(
            "generate",
            client,
            |inner| CapturedGenerate::new(inner, self.clone()),
            |w| w as SharedGenerateClient,
        )
    }

    /// Memoized wrapping with fallback to the source.
    pub(crate) fn wrap_with<S, W>(
        &self,
        kind: &str,
        source: Arc<S>,
        make: impl FnOnce(Arc<S>) -> W,
        upcast: impl FnOnce(Arc<W>) -> Arc<S>,
    ) -> Arc<S>
    where
        S: ?Sized + Send + Sync + 'static,
        W: Send + Sync + 'static,
    {
        let wrapped = observe("wrap", || {
            let wrapping = self
                .inner
                .cache
                .get_or_wrap(&source, || make(Arc::clone(&source)))?;
            Ok(match wrapping {
                Wrapping::Wrapped(wrapper) => upcast(wrapper),
                Wrapping::AlreadyWrapped => Arc::clone(&source),
            })
        });

        match wrapped {
            Some(client) => client,
            None => {
                tracing::warn!(kind, "Wrapping failed, using the original client");
                source
            }
        }
    }

    /// Run one terminal call under capture.
    ///
    /// The provider result, success or error, is returned unchanged.
    pub(crate) async fn instrument<F, Fut>(
        &self,
        name: &str,
        adapter: Arc<dyn ProviderAdapter>,
        request: Value,
        call: F,
    ) -> Result<ModelOutput, ProviderError>
    where
        F: FnOnce(Value) -> Fut,
        Fut: Future<Output = Result<ModelOutput, ProviderError>>,
    {
        let assembler = Arc::clone(self.assembler());
        let snapshot = request.clone();
        let scope = assembler.open(name, is_streaming_request(&snapshot));

        let result = context::run_scoped(scope.context.clone(), call(request)).await;

        match result {
            Ok(ModelOutput::Complete(response)) => {
                let timing = SpanTiming::blocking(scope.elapsed());
                let normalized = normalize_or_partial(adapter.as_ref(), &snapshot, &response);
                assembler.finish_llm(&scope, normalized, timing);
                Ok(ModelOutput::Complete(response))
            }
            Ok(ModelOutput::Stream(stream)) => {
                // Branching spawns the background consumer, which needs a runtime.
                if tokio::runtime::Handle::try_current().is_err() {
                    warn_no_runtime(name);
                    return Ok(ModelOutput::Stream(stream));
                }

                let mut options = BranchOptions::new(self.inner.config.stream.max_wait())
                    .with_started_at(scope.start);
                if self.inner.config.stream.accept_tool_only {
                    options = options
                        .accept_empty_when(|acc: &Box<dyn StreamAccumulator>| acc.has_tool_calls());
                }
                let accumulator = adapter.accumulator();
                let context = scope.context.clone();
                let sink = LlmStreamSink::new(assembler, adapter, scope, snapshot);

                // The background consumer inherits the call's context.
                let live = context::run_scoped(context, async move {
                    branch(stream, accumulator, options, sink)
                })
                .await;
                Ok(ModelOutput::Stream(Box::pin(live)))
            }
            Err(error) => {
                let timing = SpanTiming::blocking(scope.elapsed());
                let partial = normalize_or_partial(adapter.as_ref(), &snapshot, &Value::Null);
                assembler.fail_llm(&scope, partial, Failure::from_provider(&error), timing);
                Err(error)
            }
        }
    }
}

static NO_RUNTIME_WARNED: AtomicBool = AtomicBool::new(false);

fn warn_no_runtime(name: &str) {
    if !NO_RUNTIME_WARNED.swap(true, Ordering::Relaxed) {
        tracing::warn!(
            call = name,
            "Streamed call outside a tokio runtime, stream returned without capture"
        );
    }
}

impl std::fmt::Debug for Capture {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Capture")
            .field("enabled", &self.inner.config.enabled)
            .field("assembler", &self.inner.assembler)
            .field("cache", &self.inner.cache)
            .finish()
    }
}
