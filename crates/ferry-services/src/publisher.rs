//! Status publication.
//!
//! Spans go to the trace store and copy-status updates go to the durable queue. The two
//! sinks have separate lanes, each an unbounded channel drained by its own task, so an
//! outage of one never delays the other. Callers never wait on either.
//!
//! Spans are best-effort: they are retried up to the backoff ceiling and then dropped.
//! Copy-status updates carry terminal destination outcomes and are retried with capped
//! backoff until the queue takes them, or until [`PublisherTasks::shutdown`] gives up.

use ferry_core::models::{ItemInternalCopyStatus, Span, TraceContext};
use ferry_core::BackoffPolicy;
use ferry_db::TraceStore;
use ferry_worker::CopyStatusQueue;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;

enum SpanCommand {
    Record { context: TraceContext, span: Span },
    Flush(oneshot::Sender<()>),
}

enum CopyStatusCommand {
    Publish(ItemInternalCopyStatus),
    Flush(oneshot::Sender<()>),
}

/// Cloneable, non-blocking handle to the publication lanes
#[derive(Clone)]
pub struct StatusPublisher {
    spans: mpsc::UnboundedSender<SpanCommand>,
    copy_status: mpsc::UnboundedSender<CopyStatusCommand>,
}

/// Background tasks behind a [`StatusPublisher`]
pub struct PublisherTasks {
    spans: JoinHandle<()>,
    copy_status: JoinHandle<()>,
    shutdown_tx: mpsc::Sender<()>,
}

struct SpanWorker {
    traces: Arc<dyn TraceStore>,
    backoff: BackoffPolicy,
}

struct CopyStatusWorker {
    queue: Arc<dyn CopyStatusQueue>,
    backoff: BackoffPolicy,
    shutdown_rx: mpsc::Receiver<()>,
    /// Shutdown was requested: one more attempt per pending update, then drop it
    stopping: bool,
    /// The tasks handle is gone, so shutdown can no longer be requested
    detached: bool,
}

impl StatusPublisher {
    /// Spawn both publication lanes. They stop once every handle has been dropped and
    /// their backlog is delivered.
    pub fn spawn(
        traces: Arc<dyn TraceStore>,
        queue: Arc<dyn CopyStatusQueue>,
        backoff: BackoffPolicy,
    ) -> (Self, PublisherTasks) {
        let (span_tx, span_rx) = mpsc::unbounded_channel();
        let (copy_tx, copy_rx) = mpsc::unbounded_channel();
        let (shutdown_tx, shutdown_rx) = mpsc::channel(1);

        let spans = tokio::spawn(SpanWorker { traces, backoff }.run(span_rx));
        let copy_status = tokio::spawn(
            CopyStatusWorker {
                queue,
                backoff,
                shutdown_rx,
                stopping: false,
                detached: false,
            }
            .run(copy_rx),
        );

        (
            Self {
                spans: span_tx,
                copy_status: copy_tx,
            },
            PublisherTasks {
                spans,
                copy_status,
                shutdown_tx,
            },
        )
    }

    /// Append a span to the upload's trace.
    pub fn record_span(&self, context: &TraceContext, span: Span) {
        let stage = span.stage_name.clone();
        if self
            .spans
            .send(SpanCommand::Record {
                context: context.clone(),
                span,
            })
            .is_err()
        {
            tracing::warn!(
                upload_id = %context.upload_id,
                stage = %stage,
                "Status publisher stopped, span dropped"
            );
        }
    }

    /// Queue a partial copy-status update for the reconciler.
    pub fn publish_copy_status(&self, update: ItemInternalCopyStatus) {
        if let Err(mpsc::error::SendError(CopyStatusCommand::Publish(update))) =
            self.copy_status.send(CopyStatusCommand::Publish(update))
        {
            tracing::error!(
                tguid = ?update.tguid.as_ref().map(|t| t.to_string()),
                "Status publisher stopped, copy status dropped"
            );
        }
    }

    /// Wait until everything submitted to either lane before this call has been handled.
    pub async fn flush(&self) {
        let (span_done, span_wait) = oneshot::channel();
        let (copy_done, copy_wait) = oneshot::channel();
        if self.spans.send(SpanCommand::Flush(span_done)).is_ok() {
            let _ = span_wait.await;
        }
        if self
            .copy_status
            .send(CopyStatusCommand::Flush(copy_done))
            .is_ok()
        {
            let _ = copy_wait.await;
        }
    }
}

impl PublisherTasks {
    /// Wait for both lanes to drain after every [`StatusPublisher`] has been dropped.
    ///
    /// Copy-status updates still undelivered after `grace` get one last attempt each and
    /// are then logged and dropped.
    pub async fn shutdown(self, grace: Duration) {
        let PublisherTasks {
            mut spans,
            mut copy_status,
            shutdown_tx,
        } = self;

        let drained = tokio::time::timeout(grace, async {
            let _ = (&mut spans).await;
            let _ = (&mut copy_status).await;
        })
        .await;

        if drained.is_err() {
            tracing::warn!("Status publisher did not drain in time, abandoning pending updates");
            let _ = shutdown_tx.try_send(());
            spans.abort();
            if tokio::time::timeout(grace, copy_status).await.is_err() {
                tracing::error!("Copy-status lane did not stop after shutdown");
            }
        }
    }
}

impl SpanWorker {
    async fn run(self, mut rx: mpsc::UnboundedReceiver<SpanCommand>) {
        tracing::debug!("Span publisher started");
        while let Some(command) = rx.recv().await {
            match command {
                SpanCommand::Record { context, span } => self.append_span(&context, span).await,
                SpanCommand::Flush(done) => {
                    let _ = done.send(());
                }
            }
        }
        tracing::debug!("Span publisher stopped");
    }

    async fn append_span(&self, context: &TraceContext, span: Span) {
        let result = self
            .backoff
            .retry(
                |attempt| {
                    let span = span.clone();
                    async move {
                        let result = self.traces.append_span(context, span).await;
                        if let Err(ref e) = result {
                            tracing::warn!(
                                error = %e,
                                upload_id = %context.upload_id,
                                attempt,
                                "Failed to record span"
                            );
                        }
                        result
                    }
                },
                |_| true,
            )
            .await;

        if let Err(e) = result {
            tracing::error!(
                error = %e,
                upload_id = %context.upload_id,
                stage = %span.stage_name,
                status = %span.status,
                "Giving up on span after retries"
            );
        }
    }
}

impl CopyStatusWorker {
    async fn run(mut self, mut rx: mpsc::UnboundedReceiver<CopyStatusCommand>) {
        tracing::debug!("Copy-status publisher started");
        while let Some(command) = rx.recv().await {
            match command {
                CopyStatusCommand::Publish(update) => self.enqueue(&update).await,
                CopyStatusCommand::Flush(done) => {
                    let _ = done.send(());
                }
            }
        }
        tracing::debug!("Copy-status publisher stopped");
    }

    /// Deliver one update, retrying transient queue errors without an attempt ceiling.
    async fn enqueue(&mut self, update: &ItemInternalCopyStatus) {
        let tguid = update.tguid.as_ref().map(|t| t.to_string());
        let mut attempt: u32 = 1;
        loop {
            let err = match self.queue.publish(update).await {
                Ok(()) => {
                    if attempt > 1 {
                        tracing::info!(tguid = ?tguid, attempt, "Copy status queued after retries");
                    }
                    return;
                }
                Err(e) => e,
            };

            if !err.is_transient() {
                tracing::error!(error = %err, tguid = ?tguid, "Copy status rejected by queue, dropped");
                return;
            }
            if self.stopping {
                tracing::error!(
                    error = %err,
                    tguid = ?tguid,
                    attempt,
                    "Publisher shutting down, copy status dropped"
                );
                return;
            }

            let delay = self.backoff.delay_after(attempt);
            tracing::warn!(
                error = %err,
                tguid = ?tguid,
                attempt,
                retry_in_ms = delay.as_millis() as u64,
                "Failed to queue copy status"
            );

            tokio::select! {
                _ = tokio::time::sleep(delay) => {}
                signal = self.shutdown_rx.recv(), if !self.detached => match signal {
                    Some(()) => self.stopping = true,
                    None => self.detached = true,
                },
            }
            attempt = attempt.saturating_add(1);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use ferry_core::models::{CopyStatus, Destination, SpanStatus, Tguid, Trace};
    use ferry_db::{MemoryTraceStore, StoreError};
    use ferry_worker::{Delivery, MemoryCopyStatusQueue, QueueError};
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::time::Duration;

    fn context() -> TraceContext {
        TraceContext {
            upload_id: "U1".parse().unwrap(),
            destination_id: "dextesting".to_string(),
            event_type: "testevent1".to_string(),
        }
    }

    #[tokio::test]
    async fn spans_and_statuses_reach_their_sinks() {
        let traces = Arc::new(MemoryTraceStore::new());
        let queue = Arc::new(MemoryCopyStatusQueue::new());
        let (publisher, _) =
            StatusPublisher::spawn(traces.clone(), queue.clone(), BackoffPolicy::immediate(3));

        publisher.record_span(
            &context(),
            Span::finished("dex-copy", SpanStatus::Success, Duration::from_millis(3)),
        );
        publisher.publish_copy_status(ItemInternalCopyStatus::for_destination(
            "U1".parse().unwrap(),
            Destination::Dex,
            CopyStatus::Success,
        ));
        publisher.flush().await;

        let trace = traces.get_trace(&"U1".parse().unwrap()).await.unwrap().unwrap();
        assert_eq!(trace.spans.len(), 1);
        assert_eq!(queue.len().await, 1);
    }

    /// Trace store that is down for the first `failures` calls.
    struct DownStore {
        failures: AtomicU32,
        inner: MemoryTraceStore,
    }

    #[async_trait]
    impl TraceStore for DownStore {
        async fn append_span(&self, context: &TraceContext, span: Span) -> Result<(), StoreError> {
            if self.failures.load(Ordering::SeqCst) > 0 {
                self.failures.fetch_sub(1, Ordering::SeqCst);
                return Err(StoreError::Unavailable("status service down".to_string()));
            }
            self.inner.append_span(context, span).await
        }

        async fn get_trace(&self, upload_id: &Tguid) -> Result<Option<Trace>, StoreError> {
            self.inner.get_trace(upload_id).await
        }

        async fn ping(&self) -> Result<(), StoreError> {
            Ok(())
        }
    }

    #[tokio::test]
    async fn sink_outage_is_retried_then_logged() {
        let store = Arc::new(DownStore {
            failures: AtomicU32::new(2),
            inner: MemoryTraceStore::new(),
        });
        let (publisher, _) = StatusPublisher::spawn(
            store.clone(),
            Arc::new(MemoryCopyStatusQueue::new()),
            BackoffPolicy::immediate(3),
        );

        publisher.record_span(
            &context(),
            Span::finished("upload-received", SpanStatus::Success, Duration::ZERO),
        );
        publisher.flush().await;
        assert!(store.get_trace(&"U1".parse().unwrap()).await.unwrap().is_some());

        // past the retry ceiling the span is dropped, and the publisher keeps going
        store.failures.store(10, Ordering::SeqCst);
        publisher.record_span(
            &context(),
            Span::finished("dex-copy", SpanStatus::Success, Duration::ZERO),
        );
        publisher.flush().await;
        store.failures.store(0, Ordering::SeqCst);
        publisher.record_span(
            &context(),
            Span::finished("edav-copy", SpanStatus::Success, Duration::ZERO),
        );
        publisher.flush().await;

        let trace = store.get_trace(&"U1".parse().unwrap()).await.unwrap().unwrap();
        let stages: Vec<_> = trace.spans.iter().map(|s| s.stage_name.as_str()).collect();
        assert_eq!(stages, vec!["upload-received", "edav-copy"]);
    }

    /// Queue that refuses the first `failures` enqueues.
    struct DownQueue {
        failures: AtomicU32,
        inner: MemoryCopyStatusQueue,
    }

    impl DownQueue {
        fn new(failures: u32) -> Self {
            Self {
                failures: AtomicU32::new(failures),
                inner: MemoryCopyStatusQueue::new(),
            }
        }
    }

    #[async_trait]
    impl CopyStatusQueue for DownQueue {
        async fn enqueue(&self, payload: String) -> Result<(), QueueError> {
            if self
                .failures
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                .is_ok()
            {
                return Err(QueueError::Unavailable("connection refused".to_string()));
            }
            self.inner.enqueue(payload).await
        }

        async fn receive(
            &self,
            max: usize,
            visibility: Duration,
        ) -> Result<Vec<Delivery>, QueueError> {
            self.inner.receive(max, visibility).await
        }

        async fn ack(&self, id: i64) -> Result<(), QueueError> {
            self.inner.ack(id).await
        }

        async fn ping(&self) -> Result<(), QueueError> {
            Ok(())
        }
    }

    fn edav_success() -> ItemInternalCopyStatus {
        ItemInternalCopyStatus::for_destination(
            "U1".parse().unwrap(),
            Destination::Edav,
            CopyStatus::Success,
        )
    }

    #[tokio::test]
    async fn copy_status_survives_queue_outage_past_retry_ceiling() {
        let queue = Arc::new(DownQueue::new(10));
        let (publisher, _) = StatusPublisher::spawn(
            Arc::new(MemoryTraceStore::new()),
            queue.clone(),
            BackoffPolicy::immediate(3),
        );

        publisher.publish_copy_status(edav_success());
        publisher.flush().await;

        assert_eq!(queue.failures.load(Ordering::SeqCst), 0);
        let payloads = queue.inner.payloads().await;
        assert_eq!(payloads.len(), 1);
        assert!(payloads[0].contains("\"StatusEDAV\":\"success\""));
    }

    #[tokio::test]
    async fn trace_outage_does_not_delay_copy_status() {
        let traces = Arc::new(DownStore {
            failures: AtomicU32::new(u32::MAX),
            inner: MemoryTraceStore::new(),
        });
        let queue = Arc::new(MemoryCopyStatusQueue::new());
        let (publisher, _) = StatusPublisher::spawn(
            traces,
            queue.clone(),
            BackoffPolicy::new(5, Duration::from_millis(500), Duration::from_secs(5)),
        );

        publisher.record_span(
            &context(),
            Span::finished("edav-copy", SpanStatus::Success, Duration::ZERO),
        );
        publisher.publish_copy_status(edav_success());

        let queued = tokio::time::timeout(Duration::from_millis(400), async {
            while queue.is_empty().await {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await;
        assert!(queued.is_ok(), "copy status waited behind the span lane");
    }

    #[tokio::test]
    async fn shutdown_abandons_updates_for_a_dead_queue() {
        let queue = Arc::new(DownQueue::new(u32::MAX));
        let (publisher, tasks) = StatusPublisher::spawn(
            Arc::new(MemoryTraceStore::new()),
            queue.clone(),
            BackoffPolicy::new(3, Duration::from_millis(10), Duration::from_millis(10)),
        );

        publisher.publish_copy_status(edav_success());
        drop(publisher);

        let stopped =
            tokio::time::timeout(Duration::from_secs(2), tasks.shutdown(Duration::from_millis(50)))
                .await;
        assert!(stopped.is_ok());
        assert!(queue.inner.is_empty().await);
    }

    #[tokio::test]
    async fn shutdown_delivers_backlog_once_queue_recovers() {
        let queue = Arc::new(DownQueue::new(3));
        let (publisher, tasks) = StatusPublisher::spawn(
            Arc::new(MemoryTraceStore::new()),
            queue.clone(),
            BackoffPolicy::immediate(1),
        );

        publisher.publish_copy_status(edav_success());
        drop(publisher);
        tasks.shutdown(Duration::from_secs(2)).await;

        assert_eq!(queue.inner.len().await, 1);
    }
}
