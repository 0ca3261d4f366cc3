//! Span assembly.
//!
//! Opens a [`CallScope`] at call start and turns it, together with a
//! normalized call or tool record and timing data, into records for the
//! emitter. Failure policy lives here: empty, truncated and filtered outputs
//! become error spans instead of silent successes.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde_json::Value;
use spyglass_tracing::{
    ChainRecord, ErrorRecord, Message, NormalizedCall, Outcome, Record, RetrievalRecord,
    SpanPayload, SpanRecord, SpanType, ToolCallRecord, ToolStatus, TraceContext, TraceRecord,
    context, new_id,
};
use tokio::time::Instant;

use crate::branch::{BranchError, BranchSink, TimingMarks};
use crate::config::{CaptureConfig, RedactionFallback};
use crate::emitter::Emitter;
use crate::error::{Failure, ProviderError, Result, observe};
use crate::normalize::ProviderAdapter;
use crate::pricing;

/// Finish reasons that mean the output was cut at the token limit.
pub const TRUNCATED_REASONS: &[&str] = &["length", "max_tokens", "MAX_TOKENS"];

/// Finish reasons that mean the provider withheld output.
pub const FILTERED_REASONS: &[&str] = &["content_filter", "safety", "SAFETY", "refusal"];

/// Rewrites payloads before they are recorded.
pub trait Redact: Send + Sync {
    fn redact(&self, payload: Value) -> Result<Value>;
}

impl<F> Redact for F
where
    F: Fn(Value) -> Value + Send + Sync,
{
    fn redact(&self, payload: Value) -> Result<Value> {
        Ok(self(payload))
    }
}

/// Timing attached to a finished span.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct SpanTiming {
    pub latency: Duration,
    pub time_to_first_token: Option<Duration>,
    pub streaming_duration: Option<Duration>,
}

impl SpanTiming {
    /// Timing for a call that returned in one piece.
    pub fn blocking(latency: Duration) -> Self {
        Self {
            latency,
            ..Self::default()
        }
    }

    /// Timing recorded by a stream's background consumer.
    pub fn from_marks(marks: &TimingMarks) -> Self {
        Self {
            latency: marks.total(),
            time_to_first_token: marks.time_to_first_token(),
            streaming_duration: marks.streaming_duration(),
        }
    }
}

/// State held for one call between start and finalization.
#[derive(Debug, Clone)]
pub struct CallScope {
    pub context: TraceContext,
    pub name: String,
    /// True if no trace was active when this call started.
    pub opened_root: bool,
    pub streaming: bool,
    pub started_at: DateTime<Utc>,
    pub start: Instant,
}

impl CallScope {
    pub fn span_id(&self) -> &str {
        &self.context.span_id
    }

    pub fn trace_id(&self) -> &str {
        &self.context.trace_id
    }

    pub fn elapsed(&self) -> Duration {
        self.start.elapsed()
    }
}

/// How a finished LLM call is classified.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CallOutcome {
    Success,
    Empty,
    Truncated(String),
    Filtered(String),
}

/// Apply the failure policy to a normalized call.
pub fn classify_outcome(call: &NormalizedCall) -> CallOutcome {
    if call.is_empty_output() {
        return CallOutcome::Empty;
    }
    match call.finish_reason.as_deref() {
        Some(reason) if TRUNCATED_REASONS.contains(&reason) => {
            CallOutcome::Truncated(reason.to_string())
        }
        Some(reason) if FILTERED_REASONS.contains(&reason) => {
            CallOutcome::Filtered(reason.to_string())
        }
        _ => CallOutcome::Success,
    }
}

/// Builds records and hands them to the emitter.
pub struct Assembler {
    emitter: Emitter,
    sample_rate: f64,
    capture_content: bool,
    on_redaction_failure: RedactionFallback,
    redactor: Option<Arc<dyn Redact>>,
}

impl Assembler {
    pub fn new(config: &CaptureConfig, emitter: Emitter) -> Self {
        Self {
            emitter,
            sample_rate: config.sample_rate,
            capture_content: config.capture_content,
            on_redaction_failure: config.redaction.on_failure,
            redactor: None,
        }
    }

    pub fn with_redactor(mut self, redactor: Arc<dyn Redact>) -> Self {
        self.redactor = Some(redactor);
        self
    }

    pub fn emitter(&self) -> &Emitter {
        &self.emitter
    }

    /// Start a call. Derives a child of the active context, or a new
    /// sampled root when none is active.
    pub fn open(&self, name: impl Into<String>, streaming: bool) -> CallScope {
        let opened_root = !context::is_active();
        let mut ctx = context::derive_child_in_trace(new_id(), Some(new_id()));
        if opened_root {
            ctx = ctx.with_sampled(self.sample());
        }

        CallScope {
            context: ctx,
            name: name.into(),
            opened_root,
            streaming,
            started_at: Utc::now(),
            start: Instant::now(),
        }
    }

    fn sample(&self) -> bool {
        if self.sample_rate >= 1.0 {
            true
        } else if self.sample_rate <= 0.0 {
            false
        } else {
            rand::random::<f64>() < self.sample_rate
        }
    }

    /// Finalize a call that produced a response.
    pub fn finish_llm(&self, scope: &CallScope, mut call: NormalizedCall, timing: SpanTiming) {
        let model = call
            .response_model
            .clone()
            .or_else(|| call.request_model.clone());
        pricing::apply_cost(&mut call.usage, model.as_deref());

        let failure = match classify_outcome(&call) {
            CallOutcome::Success => None,
            CallOutcome::Empty => {
                call.output_messages = None;
                Some(Failure::empty_response())
            }
            CallOutcome::Truncated(reason) => Some(Failure::truncated(&reason)),
            CallOutcome::Filtered(reason) => Some(Failure::filtered(&reason)),
        };

        tracing::debug!(
            provider = %call.provider,
            model = model.as_deref().unwrap_or("unknown"),
            trace_id = %scope.trace_id(),
            span_id = %scope.span_id(),
            latency_ms = timing.latency.as_millis() as u64,
            failed = failure.is_some(),
            "LLM call finished"
        );

        self.record_llm(scope, call, timing, failure);
    }

    /// Finalize a call that failed or ended without a usable response.
    ///
    /// `call` holds whatever was known: the input, and partial output if the
    /// stream got that far.
    pub fn fail_llm(
        &self,
        scope: &CallScope,
        mut call: NormalizedCall,
        failure: Failure,
        timing: SpanTiming,
    ) {
        if call.is_empty_output() {
            call.output_messages = None;
        }
        let model = call.request_model.clone();
        pricing::apply_cost(&mut call.usage, model.as_deref());

        tracing::debug!(
            provider = %call.provider,
            trace_id = %scope.trace_id(),
            span_id = %scope.span_id(),
            error_code = %failure.code,
            "LLM call failed"
        );

        self.record_llm(scope, call, timing, Some(failure));
    }

    fn record_llm(
        &self,
        scope: &CallScope,
        call: NormalizedCall,
        timing: SpanTiming,
        failure: Option<Failure>,
    ) {
        if !scope.context.sampled {
            return;
        }

        observe("assemble_llm_span", || {
            let call = self.prepare_payload(call);
            let outcome = outcome_of(failure.as_ref());

            if failure.is_none() {
                for record in self.tool_children(scope, &call) {
                    self.emitter.emit(Record::Span(record));
                }
            }

            let error = failure.as_ref().map(|f| {
                self.error_record(scope, f)
                    .with_context("provider", &call.provider)
                    .with_context("model", &call.request_model)
                    .with_context("streaming", scope.streaming)
            });

            self.emitter.emit(Record::Span(self.span(
                scope,
                SpanType::LlmCall,
                SpanPayload::Llm(call),
                outcome.clone(),
                timing,
            )));
            if let Some(error) = error {
                self.emitter.emit(Record::Error(error));
            }
            self.close_trace(scope, outcome);
            Ok(())
        });
    }

    /// Finalize a tool execution span.
    pub fn finish_tool(&self, scope: &CallScope, mut record: ToolCallRecord, failure: Option<Failure>) {
        if !scope.context.sampled {
            return;
        }

        observe("assemble_tool_span", || {
            if !self.capture_content {
                record.args = Value::Null;
                record.result = None;
            } else {
                record.args = self.redact_value(std::mem::take(&mut record.args)).unwrap_or(Value::Null);
                record.result = record.result.take().and_then(|r| self.redact_value(r));
            }

            let outcome = outcome_of(failure.as_ref());
            let timing = SpanTiming::blocking(Duration::from_millis(record.latency_ms));
            let error = failure.as_ref().map(|f| {
                self.error_record(scope, f)
                    .with_context("tool_name", &record.tool_name)
            });

            self.emitter.emit(Record::Span(self.span(
                scope,
                SpanType::ToolCall,
                SpanPayload::Tool(record),
                outcome.clone(),
                timing,
            )));
            if let Some(error) = error {
                self.emitter.emit(Record::Error(error));
            }
            self.close_trace(scope, outcome);
            Ok(())
        });
    }

    /// Finalize a retrieval span.
    pub fn finish_retrieval(&self, scope: &CallScope, record: RetrievalRecord, failure: Option<Failure>) {
        self.finish_simple(scope, SpanType::Retrieval, SpanPayload::Retrieval(record), failure);
    }

    /// Finalize a chain span.
    pub fn finish_chain(&self, scope: &CallScope, failure: Option<Failure>) {
        let payload = SpanPayload::Chain(ChainRecord {
            name: scope.name.clone(),
        });
        self.finish_simple(scope, SpanType::Chain, payload, failure);
    }

    fn finish_simple(
        &self,
        scope: &CallScope,
        span_type: SpanType,
        payload: SpanPayload,
        failure: Option<Failure>,
    ) {
        if !scope.context.sampled {
            return;
        }

        observe("assemble_span", || {
            let outcome = outcome_of(failure.as_ref());
            let timing = SpanTiming::blocking(scope.elapsed());
            let error = failure.as_ref().map(|f| self.error_record(scope, f));

            self.emitter
                .emit(Record::Span(self.span(scope, span_type, payload, outcome.clone(), timing)));
            if let Some(error) = error {
                self.emitter.emit(Record::Error(error));
            }
            self.close_trace(scope, outcome);
            Ok(())
        });
    }

    fn span(
        &self,
        scope: &CallScope,
        span_type: SpanType,
        payload: SpanPayload,
        outcome: Outcome,
        timing: SpanTiming,
    ) -> SpanRecord {
        SpanRecord {
            span_id: scope.context.span_id.clone(),
            parent_span_id: scope.context.parent_span_id.clone(),
            trace_id: scope.context.trace_id.clone(),
            span_type,
            name: scope.name.clone(),
            started_at: scope.started_at,
            latency_ms: timing.latency.as_millis() as u64,
            time_to_first_token_ms: timing.time_to_first_token.map(|d| d.as_millis() as u64),
            streaming_duration_ms: timing.streaming_duration.map(|d| d.as_millis() as u64),
            outcome,
            payload,
        }
    }

    fn error_record(&self, scope: &CallScope, failure: &Failure) -> ErrorRecord {
        ErrorRecord {
            trace_id: scope.context.trace_id.clone(),
            span_id: scope.context.span_id.clone(),
            error_type: failure.error_type.clone(),
            error_category: failure.category,
            error_code: failure.code.clone(),
            message: failure.message.clone(),
            context: Default::default(),
        }
        .with_context("span_name", &scope.name)
    }

    /// Tool calls requested by the model become children of the LLM span.
    fn tool_children(&self, scope: &CallScope, call: &NormalizedCall) -> Vec<SpanRecord> {
        call.output_tool_calls()
            .map(|tool| {
                let child = scope.context.child(new_id());
                SpanRecord {
                    span_id: child.span_id,
                    parent_span_id: child.parent_span_id,
                    trace_id: child.trace_id,
                    span_type: SpanType::ToolCall,
                    name: tool.name.clone(),
                    started_at: scope.started_at,
                    latency_ms: 0,
                    time_to_first_token_ms: None,
                    streaming_duration_ms: None,
                    outcome: Outcome::Ok,
                    payload: SpanPayload::Tool(ToolCallRecord {
                        tool_name: tool.name.clone(),
                        args: tool.arguments.clone(),
                        result: None,
                        result_status: ToolStatus::Success,
                        tool_call_id: tool.id.clone(),
                        latency_ms: 0,
                    }),
                }
            })
            .collect()
    }

    fn close_trace(&self, scope: &CallScope, outcome: Outcome) {
        if !scope.opened_root {
            return;
        }
        let trace = TraceRecord::closed(scope.trace_id(), scope.started_at, outcome)
            .with_metadata("root_span", &scope.name);
        self.emitter.emit(Record::Trace(trace));
    }

    /// Apply content capture and redaction to a call's messages.
    fn prepare_payload(&self, mut call: NormalizedCall) -> NormalizedCall {
        if !self.capture_content {
            strip_content(&mut call.input_messages);
            if let Some(output) = call.output_messages.as_mut() {
                strip_content(output);
            }
            return call;
        }

        if self.redactor.is_some() {
            call.input_messages = self
                .redact_messages(std::mem::take(&mut call.input_messages))
                .unwrap_or_default();
            call.output_messages = call
                .output_messages
                .take()
                .and_then(|output| self.redact_messages(output));
        }
        call
    }

    fn redact_messages(&self, messages: Vec<Message>) -> Option<Vec<Message>> {
        let value = serde_json::to_value(&messages).ok()?;
        let redacted = self.redact_value(value)?;
        match serde_json::from_value(redacted) {
            Ok(messages) => Some(messages),
            Err(e) => {
                tracing::warn!(error = %e, "Redaction produced invalid messages");
                self.fallback(serde_json::to_value(&messages).ok()?)
                    .and_then(|v| serde_json::from_value(v).ok())
            }
        }
    }

    /// Run the redaction hook. `None` means the payload is omitted.
    fn redact_value(&self, value: Value) -> Option<Value> {
        let Some(redactor) = &self.redactor else {
            return Some(value);
        };

        let original = value.clone();
        match observe("redaction", || redactor.redact(value)) {
            Some(redacted) => Some(redacted),
            None => self.fallback(original),
        }
    }

    fn fallback(&self, original: Value) -> Option<Value> {
        match self.on_redaction_failure {
            RedactionFallback::Omit => None,
            RedactionFallback::Unredacted => Some(original),
        }
    }
}

impl std::fmt::Debug for Assembler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Assembler")
            .field("emitter", &self.emitter)
            .field("sample_rate", &self.sample_rate)
            .field("capture_content", &self.capture_content)
            .field("redactor", &self.redactor.is_some())
            .finish()
    }
}

fn outcome_of(failure: Option<&Failure>) -> Outcome {
    match failure {
        Some(f) => Outcome::error(&f.message),
        None => Outcome::Ok,
    }
}

fn strip_content(messages: &mut [Message]) {
    for message in messages {
        message.content = None;
        for tool in &mut message.tool_calls {
            tool.arguments = Value::Null;
        }
    }
}

/// Normalize without letting a faulty adapter escape.
pub fn normalize_or_partial(
    adapter: &dyn ProviderAdapter,
    request: &Value,
    response: &Value,
) -> NormalizedCall {
    observe("normalization", || Ok(adapter.normalize(request, response))).unwrap_or_else(|| {
        NormalizedCall {
            provider: adapter.provider().to_string(),
            request_model: request.get("model").and_then(Value::as_str).map(String::from),
            ..Default::default()
        }
    })
}

/// Receives the background result of a branched model stream.
pub struct LlmStreamSink {
    assembler: Arc<Assembler>,
    adapter: Arc<dyn ProviderAdapter>,
    scope: CallScope,
    request: Value,
}

impl LlmStreamSink {
    pub fn new(
        assembler: Arc<Assembler>,
        adapter: Arc<dyn ProviderAdapter>,
        scope: CallScope,
        request: Value,
    ) -> Self {
        Self {
            assembler,
            adapter,
            scope,
            request,
        }
    }
}

impl BranchSink<Value, ProviderError> for LlmStreamSink {
    fn on_complete(self, response: Value, marks: TimingMarks) {
        let call = normalize_or_partial(self.adapter.as_ref(), &self.request, &response);
        self.assembler
            .finish_llm(&self.scope, call, SpanTiming::from_marks(&marks));
    }

    fn on_error(self, error: BranchError<ProviderError>, partial: Value, marks: TimingMarks) {
        let failure = match &error {
            BranchError::EmptyResponse => Failure::empty_response(),
            BranchError::Timeout(max_wait) => Failure::stream_timeout(*max_wait),
            BranchError::Source(e) => Failure::from_provider(e),
            BranchError::Abandoned => Failure::abandoned(),
        };
        let call = normalize_or_partial(self.adapter.as_ref(), &self.request, &partial);
        self.assembler
            .fail_llm(&self.scope, call, failure, SpanTiming::from_marks(&marks));
    }
}
