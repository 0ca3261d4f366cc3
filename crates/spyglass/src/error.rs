//! Error types for the capture engine.
//!
//! Two families live here. [`ProviderError`] is what a wrapped provider call
//! returns; the engine hands it back to the caller untouched. [`CaptureError`]
//! is an internal telemetry fault; it never leaves the engine and is only
//! logged through [`observe`].

use std::panic::{AssertUnwindSafe, catch_unwind};

use spyglass_tracing::{ErrorCategory, WriteError};
use thiserror::Error;

/// Result type alias for internal telemetry operations.
pub type Result<T> = std::result::Result<T, CaptureError>;

/// Internal telemetry faults.
#[derive(Debug, Error)]
pub enum CaptureError {
    /// A redaction hook refused the payload.
    #[error("Redaction error: {0}")]
    Redaction(String),

    /// The collector rejected or failed to store a record.
    #[error("Collector error: {0}")]
    Collector(String),

    /// Serialization/deserialization error.
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// Internal error.
    #[error("Internal error: {0}")]
    Internal(String),
}

impl From<serde_json::Error> for CaptureError {
    fn from(e: serde_json::Error) -> Self {
        CaptureError::Serialization(e.to_string())
    }
}

impl From<WriteError> for CaptureError {
    fn from(e: WriteError) -> Self {
        CaptureError::Collector(e.to_string())
    }
}

/// Error returned by a provider endpoint.
#[derive(Debug, Clone, Error)]
pub enum ProviderError {
    /// The provider answered with an error status.
    #[error("API error ({status}): {message}")]
    Api {
        status: u16,
        message: String,
        /// Provider-specific error code, e.g. `insufficient_quota`.
        code: Option<String>,
    },

    /// HTTP/network error.
    #[error("Network error: {0}")]
    Network(String),

    /// The request or stream timed out.
    #[error("Timeout: {0}")]
    Timeout(String),

    /// The response stream broke mid-flight.
    #[error("Stream error: {0}")]
    Stream(String),

    /// Anything else.
    #[error("{0}")]
    Other(String),
}

impl ProviderError {
    /// Build an API error from a status and message.
    pub fn api(status: u16, message: impl Into<String>) -> Self {
        ProviderError::Api {
            status,
            message: message.into(),
            code: None,
        }
    }

    /// HTTP status, when the error carries one.
    pub fn status(&self) -> Option<u16> {
        match self {
            ProviderError::Api { status, .. } => Some(*status),
            _ => None,
        }
    }

    /// Short type label used in error records.
    pub fn error_type(&self) -> &'static str {
        match self {
            ProviderError::Api { .. } => "ApiError",
            ProviderError::Network(_) => "NetworkError",
            ProviderError::Timeout(_) => "TimeoutError",
            ProviderError::Stream(_) => "StreamError",
            ProviderError::Other(_) => "ProviderError",
        }
    }

    fn message(&self) -> &str {
        match self {
            ProviderError::Api { message, .. } => message,
            ProviderError::Network(m)
            | ProviderError::Timeout(m)
            | ProviderError::Stream(m)
            | ProviderError::Other(m) => m,
        }
    }
}

/// Map a provider error onto the error taxonomy.
///
/// The status code wins when present; message patterns decide otherwise.
/// A provider-supplied code is kept as the error code.
pub fn classify(error: &ProviderError) -> (ErrorCategory, String) {
    let message = error.message().to_lowercase();
    let mentions_quota = ["quota", "billing", "credit"]
        .iter()
        .any(|p| message.contains(p));

    let (category, code) = match (error, error.status()) {
        (_, Some(401)) => (ErrorCategory::AuthenticationError, "unauthorized"),
        (_, Some(403)) => (ErrorCategory::AuthenticationError, "forbidden"),
        (_, Some(429)) if mentions_quota => (ErrorCategory::QuotaError, "insufficient_quota"),
        (_, Some(429)) => (ErrorCategory::RateLimitError, "rate_limited"),
        (_, Some(402)) => (ErrorCategory::QuotaError, "payment_required"),
        (_, Some(404)) => (ErrorCategory::ValidationError, "not_found"),
        (_, Some(408)) => (ErrorCategory::TimeoutError, "request_timeout"),
        (_, Some(413)) => (ErrorCategory::ValidationError, "request_too_large"),
        (_, Some(422)) => (ErrorCategory::ValidationError, "unprocessable_entity"),
        (_, Some(400)) if message.contains("context length") || message.contains("too long") => {
            (ErrorCategory::ValidationError, "context_length_exceeded")
        }
        (_, Some(400)) => (ErrorCategory::ValidationError, "bad_request"),
        (_, Some(504)) => (ErrorCategory::TimeoutError, "gateway_timeout"),
        (_, Some(529)) => (ErrorCategory::ServerError, "overloaded"),
        (_, Some(503)) => (ErrorCategory::ServerError, "service_unavailable"),
        (_, Some(502)) => (ErrorCategory::ServerError, "bad_gateway"),
        (_, Some(s)) if s >= 500 => (ErrorCategory::ServerError, "internal_server_error"),
        (ProviderError::Timeout(_), _) => (ErrorCategory::TimeoutError, "timeout"),
        (ProviderError::Network(_), _) => (ErrorCategory::NetworkError, "connection_error"),
        _ if message.contains("timed out") || message.contains("timeout") => {
            (ErrorCategory::TimeoutError, "timeout")
        }
        _ if message.contains("rate limit") => (ErrorCategory::RateLimitError, "rate_limited"),
        _ if mentions_quota => (ErrorCategory::QuotaError, "insufficient_quota"),
        _ if message.contains("api key") || message.contains("unauthorized") => {
            (ErrorCategory::AuthenticationError, "invalid_api_key")
        }
        _ if message.contains("connection") || message.contains("dns") => {
            (ErrorCategory::NetworkError, "connection_error")
        }
        (ProviderError::Stream(_), _) => (ErrorCategory::NetworkError, "stream_interrupted"),
        _ => (ErrorCategory::UnknownError, "unknown"),
    };

    let code = match error {
        ProviderError::Api {
            code: Some(provider_code),
            ..
        } => provider_code.clone(),
        _ => code.to_string(),
    };

    (category, code)
}

/// Everything needed to build an error record for a failed call.
#[derive(Debug, Clone, PartialEq)]
pub struct Failure {
    pub error_type: String,
    pub category: ErrorCategory,
    pub code: String,
    pub message: String,
}

impl Failure {
    pub fn new(
        error_type: impl Into<String>,
        category: ErrorCategory,
        code: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        Self {
            error_type: error_type.into(),
            category,
            code: code.into(),
            message: message.into(),
        }
    }

    /// Failure for an error the provider returned.
    pub fn from_provider(error: &ProviderError) -> Self {
        let (category, code) = classify(error);
        Self::new(error.error_type(), category, code, error.to_string())
    }

    /// The call finished without text or tool calls.
    pub fn empty_response() -> Self {
        Self::new(
            "EmptyResponseError",
            ErrorCategory::ModelError,
            "empty_response",
            "model returned no output",
        )
    }

    /// The call stopped at its token limit.
    pub fn truncated(reason: &str) -> Self {
        Self::new(
            "TruncatedResponseError",
            ErrorCategory::ModelError,
            "truncated_response",
            format!("output truncated (finish reason: {reason})"),
        )
    }

    /// The provider filtered the output.
    pub fn filtered(reason: &str) -> Self {
        Self::new(
            "ContentFilteredError",
            ErrorCategory::ValidationError,
            "content_filtered",
            format!("output filtered (finish reason: {reason})"),
        )
    }

    /// Background stream consumption exceeded its bound.
    pub fn stream_timeout(max_wait: std::time::Duration) -> Self {
        Self::new(
            "StreamTimeoutError",
            ErrorCategory::TimeoutError,
            "stream_timeout",
            format!("stream did not complete within {}s", max_wait.as_secs()),
        )
    }

    /// The stream closed before it finished.
    pub fn abandoned() -> Self {
        Self::new(
            "StreamAbandonedError",
            ErrorCategory::UnknownError,
            "stream_abandoned",
            "stream closed before completion",
        )
    }
}

/// Run one telemetry step without disturbing the caller.
///
/// Errors and panics are logged at `warn` and turned into `None`.
pub fn observe<T>(stage: &str, f: impl FnOnce() -> Result<T>) -> Option<T> {
    match catch_unwind(AssertUnwindSafe(f)) {
        Ok(Ok(value)) => Some(value),
        Ok(Err(e)) => {
            tracing::warn!(stage, error = %e, "Telemetry step failed");
            None
        }
        Err(panic) => {
            let detail = panic
                .downcast_ref::<&str>()
                .map(|s| s.to_string())
                .or_else(|| panic.downcast_ref::<String>().cloned())
                .unwrap_or_else(|| "unknown panic".to_string());
            tracing::warn!(stage, panic = %detail, "Telemetry step panicked");
            None
        }
    }
}
