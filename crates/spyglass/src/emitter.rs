//! Record delivery.
//!
//! The [`Emitter`] hands finished records to a [`Collector`] on a background
//! task. `emit` never waits: records go into a bounded queue and are dropped
//! with a warning when the queue is full. Collector failures are logged and
//! never reach the caller.

use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use async_trait::async_trait;
use futures::FutureExt;
use spyglass_tracing::{
    ErrorRecord, Record, RecordWriter, SpanRecord, SpanType, TraceRecord, WriterConfig,
};
use tokio::sync::{mpsc, oneshot};

use crate::config::WriterSettings;
use crate::error::{CaptureError, Result};

/// Destination for finished records.
#[async_trait]
pub trait Collector: Send + Sync {
    /// Accept one self-describing record.
    async fn submit(&self, record: Record) -> Result<()>;

    /// Name used in logs.
    fn name(&self) -> &str {
        "collector"
    }
}

/// A collector that can be shared across threads.
pub type SharedCollector = Arc<dyn Collector>;

/// Keeps every record in memory.
#[derive(Debug, Default)]
pub struct MemoryCollector {
    records: Mutex<Vec<Record>>,
}

impl MemoryCollector {
    pub fn new() -> Self {
        Self::default()
    }

    /// All records, in submission order.
    pub fn records(&self) -> Vec<Record> {
        self.records
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn spans(&self) -> Vec<SpanRecord> {
        self.records()
            .into_iter()
            .filter_map(|r| match r {
                Record::Span(s) => Some(s),
                _ => None,
            })
            .collect()
    }

    /// Spans of one type.
    pub fn spans_of(&self, span_type: SpanType) -> Vec<SpanRecord> {
        self.spans()
            .into_iter()
            .filter(|s| s.span_type == span_type)
            .collect()
    }

    pub fn errors(&self) -> Vec<ErrorRecord> {
        self.records()
            .into_iter()
            .filter_map(|r| match r {
                Record::Error(e) => Some(e),
                _ => None,
            })
            .collect()
    }

    pub fn traces(&self) -> Vec<TraceRecord> {
        self.records()
            .into_iter()
            .filter_map(|r| match r {
                Record::Trace(t) => Some(t),
                _ => None,
            })
            .collect()
    }

    pub fn len(&self) -> usize {
        self.records
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn clear(&self) {
        self.records
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clear();
    }
}

#[async_trait]
impl Collector for MemoryCollector {
    async fn submit(&self, record: Record) -> Result<()> {
        self.records
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(record);
        Ok(())
    }

    fn name(&self) -> &str {
        "memory"
    }
}

/// Appends records to JSONL files.
pub struct JsonlCollector {
    writer: Arc<RecordWriter>,
}

impl JsonlCollector {
    pub fn new(config: WriterConfig) -> Result<Self> {
        Ok(Self {
            writer: Arc::new(RecordWriter::new(config)?),
        })
    }

    /// Build from config-file settings, relative to the `.spyglass` directory.
    pub fn from_settings(settings: &WriterSettings, spyglass_dir: Option<&Path>) -> Result<Self> {
        let path = settings.resolve_path(spyglass_dir);
        let config = if settings.session_mode {
            WriterConfig::session(path)
        } else {
            WriterConfig::daily_rotation(path)
        };
        Self::new(config)
    }

    /// The file the next record will be appended to.
    pub fn current_file_path(&self) -> std::path::PathBuf {
        self.writer.current_file_path()
    }
}

#[async_trait]
impl Collector for JsonlCollector {
    async fn submit(&self, record: Record) -> Result<()> {
        let writer = Arc::clone(&self.writer);
        tokio::task::spawn_blocking(move || writer.write(&record))
            .await
            .map_err(|e| CaptureError::Collector(format!("writer task failed: {e}")))??;
        Ok(())
    }

    fn name(&self) -> &str {
        "jsonl"
    }
}

enum Envelope {
    Record(Box<Record>),
    Flush(oneshot::Sender<()>),
}

/// Fire-and-forget delivery to a collector.
#[derive(Clone)]
pub struct Emitter {
    tx: Option<mpsc::Sender<Envelope>>,
    dropped: Arc<AtomicU64>,
}

impl Emitter {
    /// Start the delivery task on the current tokio runtime.
    ///
    /// Outside a runtime the emitter is created disabled.
    pub fn new(collector: SharedCollector, queue_capacity: usize) -> Self {
        let handle = match tokio::runtime::Handle::try_current() {
            Ok(handle) => handle,
            Err(_) => {
                tracing::warn!("No tokio runtime, record emission disabled");
                return Self::disabled();
            }
        };

        let (tx, rx) = mpsc::channel(queue_capacity.max(1));
        handle.spawn(deliver(rx, collector));

        Self {
            tx: Some(tx),
            dropped: Arc::new(AtomicU64::new(0)),
        }
    }

    /// An emitter that discards everything.
    pub fn disabled() -> Self {
        Self {
            tx: None,
            dropped: Arc::new(AtomicU64::new(0)),
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.tx.is_some()
    }

    /// Queue a record. Never blocks; a full queue drops the record.
    pub fn emit(&self, record: Record) {
        let Some(tx) = &self.tx else {
            return;
        };

        match tx.try_send(Envelope::Record(Box::new(record))) {
            Ok(()) => {}
            Err(mpsc::error::TrySendError::Full(Envelope::Record(record))) => {
                self.dropped.fetch_add(1, Ordering::Relaxed);
                tracing::warn!(
                    kind = record.kind(),
                    trace_id = %record.trace_id(),
                    "Emission queue full, dropping record"
                );
            }
            Err(_) => tracing::debug!("Emitter closed, dropping record"),
        }
    }

    /// Wait until every record queued before this call has been submitted.
    pub async fn flush(&self) {
        let Some(tx) = &self.tx else {
            return;
        };

        let (ack, done) = oneshot::channel();
        if tx.send(Envelope::Flush(ack)).await.is_ok() {
            let _ = done.await;
        }
    }

    /// Records dropped because the queue was full.
    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}

impl std::fmt::Debug for Emitter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Emitter")
            .field("enabled", &self.is_enabled())
            .field("dropped", &self.dropped())
            .finish()
    }
}

async fn deliver(mut rx: mpsc::Receiver<Envelope>, collector: SharedCollector) {
    while let Some(envelope) = rx.recv().await {
        match envelope {
            Envelope::Record(record) => {
                let kind = record.kind();
                let submitted = std::panic::AssertUnwindSafe(collector.submit(*record))
                    .catch_unwind()
                    .await;
                match submitted {
                    Ok(Ok(())) => {}
                    Ok(Err(e)) => tracing::warn!(
                        collector = collector.name(),
                        kind,
                        error = %e,
                        "Failed to submit record"
                    ),
                    Err(_) => tracing::warn!(
                        collector = collector.name(),
                        kind,
                        "Collector panicked while submitting record"
                    ),
                }
            }
            Envelope::Flush(ack) => {
                let _ = ack.send(());
            }
        }
    }
    tracing::debug!(collector = collector.name(), "Emitter stopped");
}
