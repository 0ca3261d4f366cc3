//! Stream branching.
//!
//! [`branch`] splits one chunk stream into a live branch, handed straight
//! back to the caller, and a background consumer that accumulates the full
//! output for telemetry. The live branch pulls from the source directly and
//! forwards a copy of each chunk over an unbounded channel, so the caller
//! never waits on the background side. If the caller drops the live branch
//! early, the rest of the source is drained in a separate task until the
//! background consumer finishes or times out.

use std::fmt;
use std::pin::Pin;
use std::task::{Context, Poll};
use std::time::Duration;

use futures::Stream;
use futures::stream::{BoxStream, StreamExt};
use spyglass_tracing::context;
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};
use tokio::time::Instant;

/// Folds chunks into a complete output.
pub trait Accumulate<T>: Send + 'static {
    type Output: Send + 'static;

    /// Fold one chunk in. Returns true if the chunk carried output.
    fn push(&mut self, chunk: &T) -> bool;

    /// True if nothing reportable has accumulated.
    fn is_empty(&self) -> bool;

    /// Produce the accumulated output.
    fn finish(self) -> Self::Output;
}

/// Receives the result of background consumption. Exactly one method is
/// called, exactly once.
pub trait BranchSink<O, E>: Send + 'static {
    fn on_complete(self, output: O, marks: TimingMarks);

    /// `partial` holds whatever accumulated before the failure.
    fn on_error(self, error: BranchError<E>, partial: O, marks: TimingMarks);
}

/// Wall-clock marks recorded by the background consumer.
#[derive(Debug, Clone, Copy)]
pub struct TimingMarks {
    /// When the call started (before the stream was opened).
    pub started_at: Instant,
    /// First chunk that carried output.
    pub first_chunk_at: Option<Instant>,
    /// When the stream ended, failed, or timed out.
    pub completed_at: Option<Instant>,
    /// Chunks observed, empty ones included.
    pub chunk_count: usize,
}

impl TimingMarks {
    pub fn new(started_at: Instant) -> Self {
        Self {
            started_at,
            first_chunk_at: None,
            completed_at: None,
            chunk_count: 0,
        }
    }

    /// Call start to first output chunk.
    pub fn time_to_first_token(&self) -> Option<Duration> {
        self.first_chunk_at
            .map(|t| t.saturating_duration_since(self.started_at))
    }

    /// First output chunk to completion.
    pub fn streaming_duration(&self) -> Option<Duration> {
        match (self.first_chunk_at, self.completed_at) {
            (Some(first), Some(done)) => Some(done.saturating_duration_since(first)),
            _ => None,
        }
    }

    /// Call start to completion (or now, if still running).
    pub fn total(&self) -> Duration {
        self.completed_at
            .unwrap_or_else(Instant::now)
            .saturating_duration_since(self.started_at)
    }

    fn complete(&mut self) {
        self.completed_at = Some(Instant::now());
    }
}

/// Why background consumption did not complete normally.
#[derive(Debug, thiserror::Error)]
pub enum BranchError<E> {
    #[error("stream produced no output")]
    EmptyResponse,

    #[error("stream did not finish within {0:?}")]
    Timeout(Duration),

    #[error("stream failed: {0}")]
    Source(E),

    #[error("stream closed before completion")]
    Abandoned,
}

/// Per-call branching options.
pub struct BranchOptions<A> {
    /// Reference point for time-to-first-token.
    pub started_at: Instant,
    /// Bound on background consumption.
    pub max_wait: Duration,
    /// Declares an empty result acceptable for this call.
    pub accept_empty: Option<Box<dyn FnOnce(&A) -> bool + Send>>,
}

impl<A> BranchOptions<A> {
    pub fn new(max_wait: Duration) -> Self {
        Self {
            started_at: Instant::now(),
            max_wait,
            accept_empty: None,
        }
    }

    pub fn with_started_at(mut self, started_at: Instant) -> Self {
        self.started_at = started_at;
        self
    }

    /// Treat an empty result as success when `predicate` holds.
    pub fn accept_empty_when(mut self, predicate: impl FnOnce(&A) -> bool + Send + 'static) -> Self {
        self.accept_empty = Some(Box::new(predicate));
        self
    }
}

impl<A> fmt::Debug for BranchOptions<A> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BranchOptions")
            .field("max_wait", &self.max_wait)
            .field("accept_empty", &self.accept_empty.is_some())
            .finish()
    }
}

enum Tap<T, E> {
    Chunk(T),
    Failed(E),
    End,
}

/// Split `source` into a live stream and a background consumer.
///
/// Must be called inside a tokio runtime. The background task inherits the
/// current trace context.
pub fn branch<T, E, A, K>(
    source: BoxStream<'static, Result<T, E>>,
    accumulator: A,
    options: BranchOptions<A>,
    sink: K,
) -> LiveStream<T, E>
where
    T: Clone + Send + 'static,
    E: Clone + Send + 'static,
    A: Accumulate<T>,
    K: BranchSink<A::Output, E>,
{
    let (tx, rx) = mpsc::unbounded_channel();
    context::spawn_scoped(consume(rx, accumulator, options, sink));
    LiveStream {
        source: Some(source),
        tap: Some(tx),
    }
}

/// The caller's branch. Yields exactly what the source yields, when it
/// yields it.
pub struct LiveStream<T, E>
where
    T: Send + 'static,
    E: Send + 'static,
{
    source: Option<BoxStream<'static, Result<T, E>>>,
    tap: Option<UnboundedSender<Tap<T, E>>>,
}

impl<T, E> LiveStream<T, E>
where
    T: Send + 'static,
    E: Send + 'static,
{
    fn forward(&mut self, msg: Tap<T, E>) {
        if let Some(tap) = &self.tap {
            if tap.send(msg).is_err() {
                // Background side finished (timeout); stop copying.
                self.tap = None;
            }
        }
    }
}

impl<T, E> Stream for LiveStream<T, E>
where
    T: Clone + Send + 'static,
    E: Clone + Send + 'static,
{
    type Item = Result<T, E>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let this = self.get_mut();
        let Some(source) = this.source.as_mut() else {
            return Poll::Ready(None);
        };

        match source.poll_next_unpin(cx) {
            Poll::Ready(Some(Ok(chunk))) => {
                if this.tap.is_some() {
                    this.forward(Tap::Chunk(chunk.clone()));
                }
                Poll::Ready(Some(Ok(chunk)))
            }
            Poll::Ready(Some(Err(e))) => {
                if this.tap.is_some() {
                    this.forward(Tap::Failed(e.clone()));
                    this.tap = None;
                }
                Poll::Ready(Some(Err(e)))
            }
            Poll::Ready(None) => {
                this.forward(Tap::End);
                this.tap = None;
                this.source = None;
                Poll::Ready(None)
            }
            Poll::Pending => Poll::Pending,
        }
    }
}

impl<T, E> Drop for LiveStream<T, E>
where
    T: Send + 'static,
    E: Send + 'static,
{
    fn drop(&mut self) {
        let (Some(source), Some(tap)) = (self.source.take(), self.tap.take()) else {
            return;
        };

        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                tracing::debug!("Live stream dropped early, draining source in background");
                handle.spawn(drain(source, tap));
            }
            // Dropping `tap` here reports the stream as abandoned.
            Err(_) => tracing::debug!("Live stream dropped outside a runtime"),
        }
    }
}

async fn drain<T, E>(mut source: BoxStream<'static, Result<T, E>>, tap: UnboundedSender<Tap<T, E>>)
where
    T: Send + 'static,
    E: Send + 'static,
{
    loop {
        tokio::select! {
            _ = tap.closed() => return,
            item = source.next() => match item {
                Some(Ok(chunk)) => {
                    if tap.send(Tap::Chunk(chunk)).is_err() {
                        return;
                    }
                }
                Some(Err(e)) => {
                    let _ = tap.send(Tap::Failed(e));
                    return;
                }
                None => {
                    let _ = tap.send(Tap::End);
                    return;
                }
            }
        }
    }
}

async fn consume<T, E, A, K>(
    mut rx: UnboundedReceiver<Tap<T, E>>,
    mut acc: A,
    options: BranchOptions<A>,
    sink: K,
) where
    A: Accumulate<T>,
    K: BranchSink<A::Output, E>,
{
    let BranchOptions {
        started_at,
        max_wait,
        accept_empty,
    } = options;
    let deadline = Instant::now() + max_wait;
    let mut marks = TimingMarks::new(started_at);

    loop {
        let next = match tokio::time::timeout_at(deadline, rx.recv()).await {
            Ok(next) => next,
            Err(_) => {
                marks.complete();
                tracing::warn!(max_wait_ms = max_wait.as_millis() as u64, "Stream capture timed out");
                sink.on_error(BranchError::Timeout(max_wait), acc.finish(), marks);
                return;
            }
        };

        match next {
            Some(Tap::Chunk(chunk)) => {
                marks.chunk_count += 1;
                if acc.push(&chunk) && marks.first_chunk_at.is_none() {
                    marks.first_chunk_at = Some(Instant::now());
                }
            }
            Some(Tap::Failed(e)) => {
                marks.complete();
                sink.on_error(BranchError::Source(e), acc.finish(), marks);
                return;
            }
            Some(Tap::End) => {
                marks.complete();
                let accepted = accept_empty.map(|accept| accept(&acc)).unwrap_or(false);
                if acc.is_empty() && !accepted {
                    sink.on_error(BranchError::EmptyResponse, acc.finish(), marks);
                } else {
                    sink.on_complete(acc.finish(), marks);
                }
                return;
            }
            None => {
                marks.complete();
                sink.on_error(BranchError::Abandoned, acc.finish(), marks);
                return;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::stream;
    use tokio::sync::oneshot;

    #[derive(Default)]
    struct Collect(Vec<String>);

    impl Accumulate<String> for Collect {
        type Output = Vec<String>;

        fn push(&mut self, chunk: &String) -> bool {
            self.0.push(chunk.clone());
            !chunk.is_empty()
        }

        fn is_empty(&self) -> bool {
            self.0.iter().all(|c| c.is_empty())
        }

        fn finish(self) -> Vec<String> {
            self.0
        }
    }

    type Report = Result<(Vec<String>, TimingMarks), (String, Vec<String>)>;

    struct Reporter(oneshot::Sender<Report>);

    impl BranchSink<Vec<String>, String> for Reporter {
        fn on_complete(self, output: Vec<String>, marks: TimingMarks) {
            let _ = self.0.send(Ok((output, marks)));
        }

        fn on_error(self, error: BranchError<String>, partial: Vec<String>, _: TimingMarks) {
            let _ = self.0.send(Err((error.to_string(), partial)));
        }
    }

    fn chunks(items: &[&str]) -> BoxStream<'static, Result<String, String>> {
        let items: Vec<Result<String, String>> = items.iter().map(|s| Ok(s.to_string())).collect();
        stream::iter(items).boxed()
    }

    fn start(
        source: BoxStream<'static, Result<String, String>>,
        options: BranchOptions<Collect>,
    ) -> (LiveStream<String, String>, oneshot::Receiver<Report>) {
        let (tx, rx) = oneshot::channel();
        let live = branch(source, Collect::default(), options, Reporter(tx));
        (live, rx)
    }

    fn opts() -> BranchOptions<Collect> {
        BranchOptions::new(Duration::from_secs(5))
    }

    #[tokio::test]
    async fn test_both_branches_see_same_sequence() {
        let input = ["Hel", "lo", ", ", "world"];
        let (live, report) = start(chunks(&input), opts());

        let seen: Vec<String> = live.map(|c| c.unwrap()).collect().await;
        assert_eq!(seen, input);

        let (accumulated, marks) = report.await.unwrap().unwrap();
        assert_eq!(accumulated, input);
        assert_eq!(marks.chunk_count, 4);
        assert!(marks.first_chunk_at.is_some());
        assert!(marks.completed_at.is_some());
    }

    #[tokio::test]
    async fn test_empty_stream_is_an_error() {
        let (live, report) = start(chunks(&[]), opts());
        assert_eq!(live.count().await, 0);

        let (error, _) = report.await.unwrap().unwrap_err();
        assert_eq!(error, "stream produced no output");
    }

    #[tokio::test]
    async fn test_all_empty_chunks_is_an_error() {
        let (live, report) = start(chunks(&["", ""]), opts());
        assert_eq!(live.count().await, 2);

        let (error, partial) = report.await.unwrap().unwrap_err();
        assert_eq!(error, "stream produced no output");
        assert_eq!(partial.len(), 2);
    }

    #[tokio::test]
    async fn test_empty_accepted_by_caller() {
        let options = opts().accept_empty_when(|acc: &Collect| acc.0.len() == 1);
        let (live, report) = start(chunks(&[""]), options);
        live.count().await;

        let (accumulated, marks) = report.await.unwrap().unwrap();
        assert_eq!(accumulated, vec![String::new()]);
        assert!(marks.time_to_first_token().is_none());
    }

    #[tokio::test]
    async fn test_source_error_reaches_both_sides() {
        let source = stream::iter(vec![
            Ok("a".to_string()),
            Err("connection reset".to_string()),
        ])
        .boxed();
        let (live, report) = start(source, opts());

        let seen: Vec<Result<String, String>> = live.collect().await;
        assert_eq!(seen[0], Ok("a".to_string()));
        assert_eq!(seen[1], Err("connection reset".to_string()));

        let (error, partial) = report.await.unwrap().unwrap_err();
        assert_eq!(error, "stream failed: connection reset");
        assert_eq!(partial, vec!["a".to_string()]);
    }

    #[tokio::test]
    async fn test_abandoned_live_branch_still_drains() {
        let (mut live, report) = start(chunks(&["one", "two", "three"]), opts());

        assert_eq!(live.next().await.unwrap().unwrap(), "one");
        drop(live);

        let (accumulated, _) = report.await.unwrap().unwrap();
        assert_eq!(accumulated, vec!["one", "two", "three"]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_does_not_disturb_live_branch() {
        let (tx, rx) = futures::channel::mpsc::unbounded::<Result<String, String>>();
        let options = BranchOptions::new(Duration::from_secs(60));
        let (mut live, report) = start(rx.boxed(), options);

        tx.unbounded_send(Ok("early".to_string())).unwrap();
        assert_eq!(live.next().await.unwrap().unwrap(), "early");

        // Nothing arrives for longer than the bound.
        let (error, partial) = report.await.unwrap().unwrap_err();
        assert!(error.starts_with("stream did not finish"));
        assert_eq!(partial, vec!["early".to_string()]);

        tx.unbounded_send(Ok("late".to_string())).unwrap();
        drop(tx);
        assert_eq!(live.next().await.unwrap().unwrap(), "late");
        assert!(live.next().await.is_none());
    }

    #[tokio::test]
    async fn test_background_inherits_trace_context() {
        use spyglass_tracing::TraceContext;

        struct ContextProbe(oneshot::Sender<Option<String>>);

        impl BranchSink<Vec<String>, String> for ContextProbe {
            fn on_complete(self, _: Vec<String>, _: TimingMarks) {
                let _ = self.0.send(context::current().map(|c| c.trace_id));
            }

            fn on_error(self, _: BranchError<String>, _: Vec<String>, _: TimingMarks) {
                let _ = self.0.send(None);
            }
        }

        let (tx, rx) = oneshot::channel();
        let live = context::run_scoped(TraceContext::root("trace-a", "span-a"), async {
            branch(chunks(&["x"]), Collect::default(), opts(), ContextProbe(tx))
        })
        .await;
        live.count().await;

        assert_eq!(rx.await.unwrap().as_deref(), Some("trace-a"));
    }
}
