//! Tool, retrieval and chain spans.
//!
//! These wrap application code rather than provider clients. Each helper
//! opens a span under the active context, runs the future inside it so model
//! calls made there become children, and emits the span when the future
//! completes. The future's own result is returned unchanged.

use std::fmt::Display;
use std::future::Future;
use std::time::Duration;

use serde::Serialize;
use serde_json::Value;
use spyglass_tracing::{ErrorCategory, RetrievalRecord, ToolCallRecord, ToolStatus, context};
use tokio::time::error::Elapsed;

use crate::error::Failure;
use crate::intercept::Capture;

/// A tool execution waiting to be run under capture.
#[must_use = "a tool span records nothing until it is run"]
pub struct ToolSpan<'a> {
    capture: &'a Capture,
    name: String,
    args: Value,
    call_id: Option<String>,
}

impl ToolSpan<'_> {
    /// Link the span to the model's tool call id.
    pub fn with_call_id(mut self, call_id: impl Into<String>) -> Self {
        self.call_id = Some(call_id.into());
        self
    }

    /// Run the tool and record the outcome.
    pub async fn run<T, E, F>(self, tool: F) -> Result<T, E>
    where
        T: Serialize,
        E: Display,
        F: Future<Output = Result<T, E>>,
    {
        if !self.capture.is_enabled() {
            return tool.await;
        }

        let scope = self.capture.assembler().open(&self.name, false);
        let result = context::run_scoped(scope.context.clone(), tool).await;

        let (status, output, failure) = match &result {
            Ok(value) => (ToolStatus::Success, serde_json::to_value(value).ok(), None),
            Err(e) => (ToolStatus::Error, None, Some(tool_error(e))),
        };
        let record = self.record(status, output, scope.elapsed());
        self.capture.assembler().finish_tool(&scope, record, failure);
        result
    }

    /// Run the tool with a deadline. A timeout is recorded with status
    /// `timeout` and returned as the outer error.
    pub async fn run_with_timeout<T, E, F>(
        self,
        deadline: Duration,
        tool: F,
    ) -> Result<Result<T, E>, Elapsed>
    where
        T: Serialize,
        E: Display,
        F: Future<Output = Result<T, E>>,
    {
        if !self.capture.is_enabled() {
            return tokio::time::timeout(deadline, tool).await;
        }

        let scope = self.capture.assembler().open(&self.name, false);
        let result =
            tokio::time::timeout(deadline, context::run_scoped(scope.context.clone(), tool)).await;

        let (status, output, failure) = match &result {
            Ok(Ok(value)) => (ToolStatus::Success, serde_json::to_value(value).ok(), None),
            Ok(Err(e)) => (ToolStatus::Error, None, Some(tool_error(e))),
            Err(_) => (
                ToolStatus::Timeout,
                None,
                Some(Failure::new(
                    "ToolTimeoutError",
                    ErrorCategory::TimeoutError,
                    "tool_timeout",
                    format!("tool did not finish within {}ms", deadline.as_millis()),
                )),
            ),
        };
        let record = self.record(status, output, scope.elapsed());
        self.capture.assembler().finish_tool(&scope, record, failure);
        result
    }

    fn record(&self, status: ToolStatus, result: Option<Value>, elapsed: Duration) -> ToolCallRecord {
        ToolCallRecord {
            tool_name: self.name.clone(),
            args: self.args.clone(),
            result,
            result_status: status,
            tool_call_id: self.call_id.clone(),
            latency_ms: elapsed.as_millis() as u64,
        }
    }
}

fn tool_error(error: &impl Display) -> Failure {
    Failure::new(
        "ToolError",
        ErrorCategory::UnknownError,
        "tool_error",
        error.to_string(),
    )
}

fn step_error(error: &impl Display) -> Failure {
    Failure::new(
        "StepError",
        ErrorCategory::UnknownError,
        "step_failed",
        error.to_string(),
    )
}

impl Capture {
    /// Prepare a tool span.
    pub fn tool(&self, name: impl Into<String>, args: Value) -> ToolSpan<'_> {
        ToolSpan {
            capture: self,
            name: name.into(),
            args,
            call_id: None,
        }
    }

    /// Time a tool execution and emit a `tool_call` span.
    pub async fn trace_tool<T, E, F>(&self, name: &str, args: Value, tool: F) -> Result<T, E>
    where
        T: Serialize,
        E: Display,
        F: Future<Output = Result<T, E>>,
    {
        self.tool(name, args).run(tool).await
    }

    /// Run a retrieval step and emit a `retrieval` span with the query and
    /// the number of documents returned.
    pub async fn trace_retrieval<D, E, F>(&self, query: &str, retrieve: F) -> Result<Vec<D>, E>
    where
        E: Display,
        F: Future<Output = Result<Vec<D>, E>>,
    {
        if !self.is_enabled() {
            return retrieve.await;
        }

        let scope = self.assembler().open("retrieval", false);
        let result = context::run_scoped(scope.context.clone(), retrieve).await;

        let record = RetrievalRecord {
            query: query.to_string(),
            document_count: result.as_ref().map(Vec::len).unwrap_or(0),
        };
        let failure = result.as_ref().err().map(step_error);
        self.assembler().finish_retrieval(&scope, record, failure);
        result
    }

    /// Run `body` as a named chain. Every call inside it is parented to the
    /// chain span, which is emitted when `body` completes.
    pub async fn trace_chain<T, E, F>(&self, name: &str, body: F) -> Result<T, E>
    where
        E: Display,
        F: Future<Output = Result<T, E>>,
    {
        if !self.is_enabled() {
            return body.await;
        }

        let scope = self.assembler().open(name, false);
        let result = context::run_scoped(scope.context.clone(), body).await;

        let failure = result.as_ref().err().map(step_error);
        self.assembler().finish_chain(&scope, failure);
        result
    }
}
