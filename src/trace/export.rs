//! Batched span export.
//!
//! Ended spans land in a bounded queue and a worker task ships them to the
//! exporter in batches. When the queue is full the oldest span is dropped.
//! Export errors and timeouts are logged and the batch is discarded; nothing
//! flows back to the request that produced the span.

use std::{
    collections::VecDeque,
    fmt,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
    time::Duration,
};

use futures_util::future::BoxFuture;
use opentelemetry::{
    trace::{TraceError, TraceResult},
    Context,
};
use opentelemetry_sdk::{
    export::trace::{ExportResult, SpanData, SpanExporter},
    trace::{Span, SpanProcessor},
};
use parking_lot::Mutex;
use tokio::{
    sync::{mpsc, oneshot, Notify},
    time::MissedTickBehavior,
};

use crate::{
    config::ExportConfig,
    error::{Error, Result},
};

struct Queue {
    spans: Mutex<VecDeque<SpanData>>,
    capacity: usize,
    batch_size: usize,
    dropped: AtomicU64,
    batch_ready: Notify,
}

impl Queue {
    fn push(&self, span: SpanData) {
        let mut spans = self.spans.lock();
        if spans.len() >= self.capacity {
            spans.pop_front();
            self.dropped.fetch_add(1, Ordering::Relaxed);
        }
        spans.push_back(span);
        let full_batch = spans.len() >= self.batch_size;
        drop(spans);

        if full_batch {
            self.batch_ready.notify_one();
        }
    }

    fn take_batch(&self) -> Vec<SpanData> {
        let mut spans = self.spans.lock();
        let len = spans.len().min(self.batch_size);
        spans.drain(..len).collect()
    }
}

enum Control {
    Flush(oneshot::Sender<()>),
    Shutdown(oneshot::Sender<()>),
}

/// Handle for driving the export worker from async code.
#[derive(Clone)]
pub(crate) struct ExportHandle {
    control: mpsc::UnboundedSender<Control>,
}

impl ExportHandle {
    /// Exports everything queued so far and waits for it.
    pub(crate) async fn flush(&self) {
        let (done, wait) = oneshot::channel();
        if self.control.send(Control::Flush(done)).is_ok() {
            let _ = wait.await;
        }
    }

    pub(crate) async fn shutdown(&self) {
        let (done, wait) = oneshot::channel();
        if self.control.send(Control::Shutdown(done)).is_ok() {
            let _ = wait.await;
        }
    }
}

/// Span processor feeding the bounded export queue.
pub(crate) struct QueueingSpanProcessor {
    queue: Arc<Queue>,
    handle: ExportHandle,
}

impl QueueingSpanProcessor {
    /// Spawns the export worker on the current tokio runtime.
    pub(crate) fn spawn<E>(exporter: E, config: &ExportConfig) -> Result<(Self, ExportHandle)>
    where
        E: SpanExporter + 'static,
    {
        let runtime = tokio::runtime::Handle::try_current().map_err(|_| Error::NoRuntime)?;
        let queue = Arc::new(Queue {
            spans: Mutex::new(VecDeque::with_capacity(config.max_queue_size)),
            capacity: config.max_queue_size,
            batch_size: config.max_export_batch_size,
            dropped: AtomicU64::new(0),
            batch_ready: Notify::new(),
        });
        let (control, control_rx) = mpsc::unbounded_channel();

        let worker = ExportWorker {
            queue: queue.clone(),
            exporter,
            control: control_rx,
            scheduled_delay: config.scheduled_delay,
            export_timeout: config.export_timeout,
        };
        runtime.spawn(worker.run());

        let handle = ExportHandle { control };
        Ok((
            Self {
                queue,
                handle: handle.clone(),
            },
            handle,
        ))
    }
}

impl fmt::Debug for QueueingSpanProcessor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("QueueingSpanProcessor")
            .field("capacity", &self.queue.capacity)
            .field("batch_size", &self.queue.batch_size)
            .finish_non_exhaustive()
    }
}

impl SpanProcessor for QueueingSpanProcessor {
    fn on_start(&self, _span: &mut Span, _cx: &Context) {}

    fn on_end(&self, span: SpanData) {
        self.queue.push(span);
    }

    /// Asks the worker to export everything queued without waiting for it.
    ///
    /// The provider calls this from synchronous code, possibly on a runtime
    /// thread the worker needs; await [`SpanManager::flush`] instead to know
    /// the export finished.
    ///
    /// [`SpanManager::flush`]: super::SpanManager::flush
    fn force_flush(&self) -> TraceResult<()> {
        let (done, _) = oneshot::channel();
        self.handle
            .control
            .send(Control::Flush(done))
            .map_err(|_| TraceError::Other("span export worker stopped".into()))
    }

    fn shutdown(&mut self) -> TraceResult<()> {
        // the worker may already be gone after an explicit shutdown
        let (done, _) = oneshot::channel();
        let _ = self.handle.control.send(Control::Shutdown(done));
        Ok(())
    }
}

struct ExportWorker<E> {
    queue: Arc<Queue>,
    exporter: E,
    control: mpsc::UnboundedReceiver<Control>,
    scheduled_delay: Duration,
    export_timeout: Duration,
}

impl<E: SpanExporter> ExportWorker<E> {
    async fn run(mut self) {
        // interval panics on a zero period
        let period = self.scheduled_delay.max(Duration::from_millis(1));
        let mut interval = tokio::time::interval(period);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = interval.tick() => self.export_queued().await,
                _ = self.queue.batch_ready.notified() => self.export_queued().await,
                control = self.control.recv() => match control {
                    Some(Control::Flush(done)) => {
                        self.export_queued().await;
                        let _ = done.send(());
                    }
                    Some(Control::Shutdown(done)) => {
                        self.export_queued().await;
                        self.exporter.shutdown();
                        let _ = done.send(());
                        break;
                    }
                    None => {
                        self.export_queued().await;
                        self.exporter.shutdown();
                        break;
                    }
                },
            }
        }
        tracing::debug!("span export worker stopped");
    }

    async fn export_queued(&mut self) {
        let dropped = self.queue.dropped.swap(0, Ordering::Relaxed);
        if dropped > 0 {
            tracing::warn!(dropped, "span export queue full, dropped oldest spans");
        }

        loop {
            let batch = self.queue.take_batch();
            if batch.is_empty() {
                break;
            }
            let spans = batch.len();
            match tokio::time::timeout(self.export_timeout, self.exporter.export(batch)).await {
                Ok(Ok(())) => tracing::trace!(spans, "exported spans"),
                Ok(Err(err)) => {
                    tracing::warn!(error = %err, spans, "span export failed, dropping batch")
                }
                Err(_) => tracing::warn!(
                    spans,
                    timeout = ?self.export_timeout,
                    "span export timed out, dropping batch"
                ),
            }
        }
    }
}

/// Exporter keeping finished spans in memory.
#[derive(Clone, Debug, Default)]
pub struct InMemorySpanExporter {
    spans: Arc<Mutex<Vec<SpanData>>>,
}

impl InMemorySpanExporter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn finished_spans(&self) -> Vec<SpanData> {
        self.spans.lock().clone()
    }

    pub fn reset(&self) {
        self.spans.lock().clear();
    }
}

impl SpanExporter for InMemorySpanExporter {
    fn export(&mut self, mut batch: Vec<SpanData>) -> BoxFuture<'static, ExportResult> {
        self.spans.lock().append(&mut batch);
        Box::pin(async { Ok(()) })
    }
}
