//! Task-local trace context store.
//!
//! Holds the active [`TraceContext`] for the running task. A scope set with
//! [`run_scoped`] is visible across every suspension point inside the scoped
//! future and invisible to unrelated tasks. Tokio does not carry task-locals
//! into spawned tasks, so background work must be launched with
//! [`spawn_scoped`] (or wrapped with [`in_current_scope`]) to inherit it.

use std::future::Future;

use tokio::task::JoinHandle;

use crate::types::TraceContext;

tokio::task_local! {
    static CURRENT_CONTEXT: TraceContext;
}

/// Get the active context, if any.
pub fn current() -> Option<TraceContext> {
    CURRENT_CONTEXT.try_with(|ctx| ctx.clone()).ok()
}

/// Check if a context is active in the current task.
pub fn is_active() -> bool {
    CURRENT_CONTEXT.try_with(|_| ()).is_ok()
}

/// Run `f` with `context` as the active context.
///
/// Code outside the returned future is unaffected; nested scopes shadow the
/// outer one until they complete.
pub async fn run_scoped<F>(context: TraceContext, f: F) -> F::Output
where
    F: Future,
{
    CURRENT_CONTEXT.scope(context, f).await
}

/// Derive the context for a new span.
///
/// With an active context the result is its child. Without one, a fresh root
/// is created whose trace id equals `new_span_id`.
pub fn derive_child(new_span_id: impl Into<String>) -> TraceContext {
    derive_child_in_trace(new_span_id, None)
}

/// Like [`derive_child`], but a new root uses `trace_id` when supplied.
pub fn derive_child_in_trace(
    new_span_id: impl Into<String>,
    trace_id: Option<String>,
) -> TraceContext {
    let span_id = new_span_id.into();
    match current() {
        Some(parent) => parent.child(span_id),
        None => {
            let trace_id = trace_id.unwrap_or_else(|| span_id.clone());
            TraceContext::root(trace_id, span_id)
        }
    }
}

/// Wrap `f` so it runs under the context active right now.
///
/// Without an active context the future runs unscoped.
pub fn in_current_scope<F>(f: F) -> impl Future<Output = F::Output>
where
    F: Future,
{
    let context = current();
    async move {
        match context {
            Some(ctx) => CURRENT_CONTEXT.scope(ctx, f).await,
            None => f.await,
        }
    }
}

/// Spawn a task that inherits the current context.
pub fn spawn_scoped<F>(f: F) -> JoinHandle<F::Output>
where
    F: Future + Send + 'static,
    F::Output: Send + 'static,
{
    tokio::spawn(in_current_scope(f))
}
