//! spyglass: in-process telemetry capture for model calls
//!
//! Wrap a provider client once and every call made through it is recorded:
//! - Interception of OpenAI-style, Anthropic-style and single-call clients
//!   behind the same traits the application already uses
//! - Stream branching so streamed responses reach the caller untouched while
//!   a background consumer accumulates the full output
//! - Normalization of every response shape into one canonical call record
//! - Span assembly with parent/child links, timing, usage and cost
//! - Fire-and-forget emission to a pluggable collector
//!
//! Telemetry never changes what the caller sees: provider results and errors
//! are returned unchanged, and internal faults are logged and dropped.
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use spyglass::{Capture, CaptureConfig, MemoryCollector};
//! # async fn run(client: spyglass::SharedOpenAiClient) -> Result<(), spyglass::ProviderError> {
//! let collector = Arc::new(MemoryCollector::new());
//! let capture = Capture::new(CaptureConfig::default(), collector.clone());
//! let client = capture.wrap_openai(client);
//!
//! let request = serde_json::json!({"model": "gpt-4o-mini", "messages": []});
//! client.chat().completions().create(request).await?;
//! capture.flush().await;
//! # Ok(())
//! # }
//! ```

pub mod assembler;
pub mod branch;
pub mod client;
pub mod config;
pub mod emitter;
pub mod error;
pub mod intercept;
pub mod normalize;
pub mod pricing;
pub mod spans;

// Mock clients and fixtures - available in test builds and to dependents
// that enable the `testing` feature
#[cfg(any(test, feature = "testing"))]
pub mod testing;

pub use assembler::{Assembler, CallOutcome, CallScope, Redact, SpanTiming, classify_outcome};
pub use branch::{Accumulate, BranchError, BranchOptions, BranchSink, LiveStream, TimingMarks, branch};
pub use client::{
    AnthropicClient, ChatResource, ChunkStream, CompletionsResource, GenerateClient,
    MessagesResource, ModelOutput, OpenAiClient, SharedAnthropicClient, SharedGenerateClient,
    SharedOpenAiClient,
};
pub use config::{CaptureConfig, ConfigValidationError, RedactionFallback};
pub use emitter::{Collector, Emitter, JsonlCollector, MemoryCollector, SharedCollector};
pub use error::{CaptureError, Failure, ProviderError, Result, classify};
pub use intercept::{Capture, CaptureBuilder};
pub use normalize::{
    AnthropicAdapter, GenericAdapter, OpenAiAdapter, ProviderAdapter, StreamAccumulator,
};
pub use spans::ToolSpan;

// Record types, so most users need only this crate.
pub use spyglass_tracing::{
    ErrorCategory, ErrorRecord, Message, NormalizedCall, Outcome, Record, SpanPayload,
    SpanRecord, SpanType, ToolCall, ToolCallRecord, ToolStatus, TraceContext, TraceRecord, Usage,
    UsageSource,
};
