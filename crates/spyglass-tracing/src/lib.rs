//! Trace records and context propagation for spyglass.
//!
//! This crate is the leaf of the capture engine:
//!
//! - **Types**: `TraceContext`, `SpanRecord`, `ErrorRecord`, `TraceRecord` and
//!   the canonical `NormalizedCall` payload
//! - **Context**: task-local storage of the active trace context via
//!   `run_scoped()` and `derive_child()`
//! - **Writer**: JSONL persistence of records with daily rotation
//!
//! # Usage
//!
//! ```rust,no_run
//! use spyglass_tracing::{TraceContext, context, new_id};
//!
//! #[tokio::main]
//! async fn main() {
//!     let root = TraceContext::root(new_id(), new_id());
//!
//!     context::run_scoped(root, async {
//!         // Every span opened here is a child of `root`.
//!         let child = context::derive_child(new_id());
//!         assert!(child.parent_span_id.is_some());
//!     })
//!     .await;
//! }
//! ```

pub mod context;
pub mod types;
pub mod writer;

pub use types::{
    ChainRecord, ErrorCategory, ErrorRecord, Message, NormalizedCall, Outcome, Record,
    RetrievalRecord, SpanPayload, SpanRecord, SpanType, ToolCall, ToolCallRecord, ToolDefinition,
    ToolStatus, TraceContext, TraceRecord, Usage, UsageSource, new_id,
};
pub use writer::{RecordWriter, WriteError, WriterConfig};
