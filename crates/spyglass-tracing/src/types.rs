//! Telemetry record types.
//!
//! Every record is self-describing: it carries its own `trace_id` and
//! `span_id` so a collector can rebuild the tree from timestamps without
//! relying on delivery order.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// The active (trace, span, parent) triple for one logical request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TraceContext {
    /// Trace this span belongs to.
    pub trace_id: String,

    /// The currently open span.
    pub span_id: String,

    /// The enclosing span, absent for a trace root.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent_span_id: Option<String>,

    /// Whether records for this trace are emitted at all.
    #[serde(default = "default_sampled")]
    pub sampled: bool,
}

fn default_sampled() -> bool {
    true
}

impl TraceContext {
    /// Create a root context with no parent.
    pub fn root(trace_id: impl Into<String>, span_id: impl Into<String>) -> Self {
        Self {
            trace_id: trace_id.into(),
            span_id: span_id.into(),
            parent_span_id: None,
            sampled: true,
        }
    }

    /// Create a child of this context that opens `span_id`.
    pub fn child(&self, span_id: impl Into<String>) -> Self {
        Self {
            trace_id: self.trace_id.clone(),
            span_id: span_id.into(),
            parent_span_id: Some(self.span_id.clone()),
            sampled: self.sampled,
        }
    }

    /// Set the sampling decision.
    pub fn with_sampled(mut self, sampled: bool) -> Self {
        self.sampled = sampled;
        self
    }

    /// True if this context starts a trace.
    pub fn is_root(&self) -> bool {
        self.parent_span_id.is_none()
    }
}

/// Generate a fresh random identifier for a trace or span.
pub fn new_id() -> String {
    uuid::Uuid::new_v4().to_string()
}

/// Kind of work a span measures.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SpanType {
    LlmCall,
    ToolCall,
    Retrieval,
    Chain,
}

/// Outcome of a span or trace.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status")]
pub enum Outcome {
    /// Completed successfully.
    #[serde(rename = "ok")]
    Ok,

    /// Completed with an error.
    #[serde(rename = "error")]
    Error { message: String },
}

impl Outcome {
    /// Build an error outcome.
    pub fn error(message: impl Into<String>) -> Self {
        Outcome::Error {
            message: message.into(),
        }
    }

    pub fn is_ok(&self) -> bool {
        matches!(self, Outcome::Ok)
    }
}

/// One timed unit of work within a trace.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SpanRecord {
    pub span_id: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent_span_id: Option<String>,

    pub trace_id: String,

    #[serde(rename = "type")]
    pub span_type: SpanType,

    /// Human-readable name (endpoint, tool, or chain name).
    pub name: String,

    pub started_at: DateTime<Utc>,

    /// Wall-clock duration from call start to finalization.
    pub latency_ms: u64,

    /// Call start to first non-empty streamed chunk.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub time_to_first_token_ms: Option<u64>,

    /// First non-empty chunk to stream completion.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub streaming_duration_ms: Option<u64>,

    pub outcome: Outcome,

    pub payload: SpanPayload,
}

/// Domain data carried by a span.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum SpanPayload {
    Llm(NormalizedCall),
    Tool(ToolCallRecord),
    Retrieval(RetrievalRecord),
    Chain(ChainRecord),
}

/// Canonical form of one model invocation, independent of provider shape.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct NormalizedCall {
    pub provider: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub request_model: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub response_model: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub finish_reason: Option<String>,

    pub input_messages: Vec<Message>,

    /// `None` when the call produced no usable output.
    pub output_messages: Option<Vec<Message>>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tool_definitions: Vec<ToolDefinition>,

    pub usage: Usage,
}

impl NormalizedCall {
    /// Concatenated text of all output messages.
    pub fn output_text(&self) -> String {
        self.output_messages
            .iter()
            .flatten()
            .filter_map(|m| m.content.as_deref())
            .collect()
    }

    /// Tool calls requested by the model across all output messages.
    pub fn output_tool_calls(&self) -> impl Iterator<Item = &ToolCall> {
        self.output_messages
            .iter()
            .flatten()
            .flat_map(|m| m.tool_calls.iter())
    }

    /// True if the output has neither text nor tool calls.
    pub fn is_empty_output(&self) -> bool {
        self.output_text().trim().is_empty() && self.output_tool_calls().next().is_none()
    }
}

/// A chat message in canonical form.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub role: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content: Option<String>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tool_calls: Vec<ToolCall>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_call_id: Option<String>,
}

impl Message {
    pub fn new(role: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            role: role.into(),
            content: Some(content.into()),
            tool_calls: Vec::new(),
            tool_call_id: None,
        }
    }

    pub fn system(content: impl Into<String>) -> Self {
        Self::new("system", content)
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self::new("user", content)
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self::new("assistant", content)
    }
}

/// A tool invocation requested by the model.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolCall {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    pub name: String,
    pub arguments: serde_json::Value,
}

/// A tool offered to the model in the request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolDefinition {
    #[serde(rename = "type")]
    pub tool_type: String,
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    pub input_schema: serde_json::Value,
}

/// Where a usage number came from.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UsageSource {
    /// Reported by the provider.
    #[default]
    Reported,
    /// Estimated locally from character counts or the price table.
    Estimated,
}

/// Token usage and cost for one call.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Usage {
    pub input_tokens: u64,
    pub output_tokens: u64,
    pub total_tokens: u64,

    /// Token count provenance.
    pub source: UsageSource,

    /// Cost in USD.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cost: Option<f64>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cost_source: Option<UsageSource>,
}

impl Usage {
    /// Usage as reported by a provider.
    pub fn reported(input_tokens: u64, output_tokens: u64) -> Self {
        Self {
            input_tokens,
            output_tokens,
            total_tokens: input_tokens + output_tokens,
            source: UsageSource::Reported,
            cost: None,
            cost_source: None,
        }
    }

    /// Usage estimated locally.
    pub fn estimated(input_tokens: u64, output_tokens: u64) -> Self {
        Self {
            source: UsageSource::Estimated,
            ..Self::reported(input_tokens, output_tokens)
        }
    }
}

/// Result status of a tool invocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ToolStatus {
    Success,
    Error,
    Timeout,
}

/// One observed tool or function invocation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolCallRecord {
    pub tool_name: String,
    pub args: serde_json::Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<serde_json::Value>,
    pub result_status: ToolStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_call_id: Option<String>,
    pub latency_ms: u64,
}

/// A retrieval step (vector search, document lookup).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetrievalRecord {
    pub query: String,
    pub document_count: usize,
}

/// A named grouping of nested calls.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChainRecord {
    pub name: String,
}

/// Error taxonomy shared by every error record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCategory {
    AuthenticationError,
    RateLimitError,
    ValidationError,
    NetworkError,
    ServerError,
    QuotaError,
    ModelError,
    TimeoutError,
    UnknownError,
}

impl ErrorCategory {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorCategory::AuthenticationError => "authentication_error",
            ErrorCategory::RateLimitError => "rate_limit_error",
            ErrorCategory::ValidationError => "validation_error",
            ErrorCategory::NetworkError => "network_error",
            ErrorCategory::ServerError => "server_error",
            ErrorCategory::QuotaError => "quota_error",
            ErrorCategory::ModelError => "model_error",
            ErrorCategory::TimeoutError => "timeout_error",
            ErrorCategory::UnknownError => "unknown_error",
        }
    }
}

/// A failed call, paired with the span that carries its partial input.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorRecord {
    pub trace_id: String,
    pub span_id: String,
    pub error_type: String,
    pub error_category: ErrorCategory,
    pub error_code: String,
    pub message: String,
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub context: HashMap<String, serde_json::Value>,
}

impl ErrorRecord {
    /// Attach a context entry.
    pub fn with_context(mut self, key: impl Into<String>, value: impl Serialize) -> Self {
        if let Ok(v) = serde_json::to_value(value) {
            self.context.insert(key.into(), v);
        }
        self
    }
}

/// Summary of a whole trace, emitted when its root call finishes.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TraceRecord {
    pub trace_id: String,
    pub started_at: DateTime<Utc>,
    pub ended_at: DateTime<Utc>,
    pub duration_ms: u64,
    pub outcome: Outcome,
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub metadata: HashMap<String, serde_json::Value>,
}

impl TraceRecord {
    /// Close a trace that started at `started_at`.
    pub fn closed(trace_id: impl Into<String>, started_at: DateTime<Utc>, outcome: Outcome) -> Self {
        let ended_at = Utc::now();
        Self {
            trace_id: trace_id.into(),
            started_at,
            ended_at,
            duration_ms: (ended_at - started_at).num_milliseconds().max(0) as u64,
            outcome,
            metadata: HashMap::new(),
        }
    }

    /// Add metadata to the trace.
    pub fn with_metadata(mut self, key: impl Into<String>, value: impl Serialize) -> Self {
        if let Ok(v) = serde_json::to_value(value) {
            self.metadata.insert(key.into(), v);
        }
        self
    }
}

/// The unit handed to a collector.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "record", rename_all = "snake_case")]
pub enum Record {
    Span(SpanRecord),
    Error(ErrorRecord),
    Trace(TraceRecord),
}

impl Record {
    pub fn trace_id(&self) -> &str {
        match self {
            Record::Span(s) => &s.trace_id,
            Record::Error(e) => &e.trace_id,
            Record::Trace(t) => &t.trace_id,
        }
    }

    /// Short label used in logs.
    pub fn kind(&self) -> &'static str {
        match self {
            Record::Span(_) => "span",
            Record::Error(_) => "error",
            Record::Trace(_) => "trace",
        }
    }

    pub fn as_span(&self) -> Option<&SpanRecord> {
        match self {
            Record::Span(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_error(&self) -> Option<&ErrorRecord> {
        match self {
            Record::Error(e) => Some(e),
            _ => None,
        }
    }

    pub fn as_trace(&self) -> Option<&TraceRecord> {
        match self {
            Record::Trace(t) => Some(t),
            _ => None,
        }
    }
}
