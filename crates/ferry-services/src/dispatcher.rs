//! Replication dispatcher.
//!
//! Fans a sealed upload out to every destination store its routing descriptor names.
//! Each destination copy runs as its own task with its own retry budget, so one
//! destination exhausting its attempts never cancels or delays another.
//!
//! Once every destination has reached a terminal status the sealed object is deleted
//! from staging; nothing reads it after that.

use ferry_core::models::{
    CopyStatus, Destination, Item, ItemInternalCopyStatus, Span, SpanStatus, TraceContext,
    UploadCompleted,
};
use ferry_core::{BackoffPolicy, Config};
use ferry_storage::{ByteReader, Storage, StorageError};
use ferry_worker::CopyStatusMerger;
use futures::TryStreamExt;
use std::sync::Arc;
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::task::{JoinHandle, JoinSet};
use tokio_util::io::StreamReader;

use crate::publisher::StatusPublisher;
use crate::routing::{RouteTarget, RoutingTable};

#[derive(Debug, Clone, Copy)]
pub struct DispatchConfig {
    pub backoff: BackoffPolicy,
    /// Upper bound on one copy attempt
    pub attempt_timeout: Duration,
}

impl From<&Config> for DispatchConfig {
    fn from(config: &Config) -> Self {
        Self {
            backoff: config.pipeline.copy_backoff,
            attempt_timeout: config.pipeline.copy_attempt_timeout,
        }
    }
}

#[derive(Debug, Error)]
enum CopyError {
    #[error(transparent)]
    Storage(#[from] StorageError),

    #[error("Copy attempt timed out after {0:?}")]
    TimedOut(Duration),
}

impl CopyError {
    fn is_transient(&self) -> bool {
        match self {
            CopyError::Storage(e) => e.is_transient(),
            CopyError::TimedOut(_) => true,
        }
    }
}

/// Key of the replicated object inside a destination store
pub fn destination_key(event: &UploadCompleted) -> String {
    format!(
        "{}-{}/{}",
        event.metadata.routing.meta_destination_id, event.metadata.routing.meta_ext_event, event.tguid
    )
}

/// Canonical item record for a sealed upload
pub fn item_for(event: &UploadCompleted) -> Item {
    let mut item = Item::placeholder(&event.tguid);
    item.offset = event.size;
    item.size = event.size;
    item.meta_destination_id = Some(event.metadata.routing.meta_destination_id.clone());
    item.meta_ext_event = Some(event.metadata.routing.meta_ext_event.clone());
    item.filename = Some(event.metadata.filename.clone());
    item.metadata = event.metadata.fields.clone();
    item.start_time_epoch = Some(event.started_at.timestamp());
    item.end_time_epoch = Some(event.completed_at.timestamp());
    item
}

#[derive(Clone)]
pub struct ReplicationDispatcher {
    staging: Arc<dyn Storage>,
    routing: Arc<RoutingTable>,
    publisher: StatusPublisher,
    merger: CopyStatusMerger,
    config: DispatchConfig,
}

impl ReplicationDispatcher {
    pub fn new(
        staging: Arc<dyn Storage>,
        routing: Arc<RoutingTable>,
        publisher: StatusPublisher,
        merger: CopyStatusMerger,
        config: DispatchConfig,
    ) -> Self {
        Self {
            staging,
            routing,
            publisher,
            merger,
            config,
        }
    }

    /// Consume completion events until the intake side hangs up.
    ///
    /// Each event is dispatched on its own task; the loop waits for in-flight
    /// dispatches before returning.
    pub fn spawn(self, mut events: mpsc::UnboundedReceiver<UploadCompleted>) -> JoinHandle<()> {
        tokio::spawn(async move {
            let dispatcher = Arc::new(self);
            let mut in_flight = JoinSet::new();
            tracing::info!("Replication dispatcher started");

            loop {
                tokio::select! {
                    event = events.recv() => {
                        let Some(event) = event else { break };
                        let dispatcher = Arc::clone(&dispatcher);
                        in_flight.spawn(async move {
                            dispatcher.dispatch(&event).await;
                        });
                    }
                    Some(joined) = in_flight.join_next(), if !in_flight.is_empty() => {
                        if let Err(e) = joined {
                            tracing::error!(error = %e, "Dispatch task panicked");
                        }
                    }
                }
            }

            while let Some(joined) = in_flight.join_next().await {
                if let Err(e) = joined {
                    tracing::error!(error = %e, "Dispatch task panicked");
                }
            }
            tracing::info!("Replication dispatcher stopped");
        })
    }

    /// Replicate one sealed upload to all of its destinations.
    ///
    /// Returns the terminal status reached by each destination, in routing order.
    #[tracing::instrument(skip(self, event), fields(tguid = %event.tguid))]
    pub async fn dispatch(&self, event: &UploadCompleted) -> Vec<(Destination, CopyStatus)> {
        let Some(targets) = self.routing.resolve(&event.metadata.routing) else {
            tracing::error!(
                route = %event.metadata.routing,
                "No route for sealed upload, nothing replicated"
            );
            return Vec::new();
        };

        if let Err(e) = self.merger.seed_item(&item_for(event)).await {
            tracing::warn!(error = %e, "Failed to record item metadata");
        }

        let expected = targets.len();
        let event = Arc::new(event.clone());
        let mut copies = JoinSet::new();
        for (index, target) in targets.into_iter().enumerate() {
            let dispatcher = self.clone();
            let event = Arc::clone(&event);
            copies.spawn(async move {
                let destination = target.destination;
                let status = dispatcher.replicate(&event, target).await;
                (index, destination, status)
            });
        }

        let mut results = Vec::new();
        while let Some(joined) = copies.join_next().await {
            match joined {
                Ok(result) => results.push(result),
                Err(e) => tracing::error!(error = %e, "Destination copy task panicked"),
            }
        }
        results.sort_by_key(|(index, _, _)| *index);

        let outcome: Vec<_> = results
            .into_iter()
            .map(|(_, destination, status)| (destination, status))
            .collect();
        tracing::info!(outcome = ?outcome, "Replication finished");

        if outcome.len() == expected {
            self.release_sealed_object(&event).await;
        }
        outcome
    }

    async fn release_sealed_object(&self, event: &UploadCompleted) {
        match self.staging.delete(&event.object_key).await {
            Ok(()) | Err(StorageError::NotFound(_)) => {
                tracing::debug!(key = %event.object_key, "Released sealed object");
            }
            Err(e) => tracing::warn!(
                error = %e,
                key = %event.object_key,
                "Failed to release sealed object"
            ),
        }
    }

    /// Copy to one destination with retries, then publish its terminal status.
    async fn replicate(&self, event: &UploadCompleted, target: RouteTarget) -> CopyStatus {
        let context = TraceContext::for_upload(&event.tguid, &event.metadata);
        let destination = target.destination;
        let stage = destination.copy_stage();
        let key = destination_key(event);
        let storage = &target.storage;

        let result = self
            .config
            .backoff
            .retry(
                |attempt| {
                    let context = &context;
                    let stage = &stage;
                    let key = &key;
                    async move {
                        let started = Instant::now();
                        let result = self.copy_once(event, storage.as_ref(), key).await;
                        let status = match &result {
                            Ok(()) => SpanStatus::Success,
                            Err(e) => {
                                tracing::warn!(
                                    destination = %destination,
                                    attempt,
                                    error = %e,
                                    "Destination copy attempt failed"
                                );
                                SpanStatus::Failure
                            }
                        };
                        self.publisher.record_span(
                            context,
                            Span::finished(stage.as_str(), status, started.elapsed()),
                        );
                        result
                    }
                },
                |e: &CopyError| e.is_transient(),
            )
            .await;

        let status = match result {
            Ok(()) => {
                tracing::info!(destination = %destination, key = %key, "Destination copy succeeded");
                CopyStatus::Success
            }
            Err(e) => {
                tracing::error!(
                    destination = %destination,
                    error = %e,
                    "Destination copy failed after retries"
                );
                CopyStatus::Failure
            }
        };

        self.publisher
            .publish_copy_status(ItemInternalCopyStatus::for_destination(
                event.tguid.clone(),
                destination,
                status,
            ));
        status
    }

    async fn copy_once(
        &self,
        event: &UploadCompleted,
        destination: &dyn Storage,
        key: &str,
    ) -> Result<(), CopyError> {
        let copy = async {
            let source = self.staging.download_stream(&event.object_key).await?;
            let reader: ByteReader = Box::pin(StreamReader::new(
                source.map_err(|e| std::io::Error::new(std::io::ErrorKind::Other, e)),
            ));
            destination
                .upload_stream(key, event.metadata.content_type(), Some(event.size), reader)
                .await?;
            Ok::<(), CopyError>(())
        };

        match tokio::time::timeout(self.config.attempt_timeout, copy).await {
            Ok(result) => result,
            Err(_) => Err(CopyError::TimedOut(self.config.attempt_timeout)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use bytes::Bytes;
    use chrono::Utc;
    use ferry_core::models::{RoutingKey, Tguid, UploadMetadata};
    use ferry_core::StorageBackend;
    use ferry_db::{CopyStatusStore, MemoryCopyStatusStore, MemoryTraceStore, TraceStore};
    use ferry_storage::{ByteStream, LocalStorage, StorageResult};
    use ferry_worker::{CopyStatusReconciler, MemoryCopyStatusQueue, ReconcilerConfig};
    use std::collections::HashMap;
    use std::sync::atomic::{AtomicU32, Ordering};

    /// Destination that fails the first `failures` uploads with a transient error.
    struct FlakyStorage {
        inner: LocalStorage,
        failures: AtomicU32,
        permanent: bool,
    }

    #[async_trait]
    impl Storage for FlakyStorage {
        async fn put(&self, key: &str, data: Bytes, content_type: &str) -> StorageResult<String> {
            self.inner.put(key, data, content_type).await
        }

        async fn download(&self, key: &str) -> StorageResult<Vec<u8>> {
            self.inner.download(key).await
        }

        async fn upload_stream(
            &self,
            key: &str,
            content_type: &str,
            content_length: Option<u64>,
            reader: ByteReader,
        ) -> StorageResult<String> {
            if self.permanent {
                return Err(StorageError::ConfigError("bucket does not exist".to_string()));
            }
            if self.failures.load(Ordering::SeqCst) > 0 {
                self.failures.fetch_sub(1, Ordering::SeqCst);
                return Err(StorageError::UploadFailed("503 Slow Down".to_string()));
            }
            self.inner
                .upload_stream(key, content_type, content_length, reader)
                .await
        }

        async fn download_stream(&self, key: &str) -> StorageResult<ByteStream> {
            self.inner.download_stream(key).await
        }

        async fn delete(&self, key: &str) -> StorageResult<()> {
            self.inner.delete(key).await
        }

        async fn exists(&self, key: &str) -> StorageResult<bool> {
            self.inner.exists(key).await
        }

        async fn content_length(&self, key: &str) -> StorageResult<u64> {
            self.inner.content_length(key).await
        }

        fn backend_type(&self) -> StorageBackend {
            StorageBackend::Local
        }
    }

    struct Harness {
        dispatcher: ReplicationDispatcher,
        staging: Arc<dyn Storage>,
        dex: Arc<FlakyStorage>,
        edav: Arc<FlakyStorage>,
        traces: Arc<MemoryTraceStore>,
        queue: Arc<MemoryCopyStatusQueue>,
        documents: Arc<MemoryCopyStatusStore>,
        merger: CopyStatusMerger,
        publisher: StatusPublisher,
        event: UploadCompleted,
        _dir: tempfile::TempDir,
    }

    async fn flaky(dir: &std::path::Path, name: &str, failures: u32, permanent: bool) -> Arc<FlakyStorage> {
        Arc::new(FlakyStorage {
            inner: LocalStorage::new(dir.join(name), format!("file:///{}", name))
                .await
                .unwrap(),
            failures: AtomicU32::new(failures),
            permanent,
        })
    }

    async fn harness(edav_failures: u32, edav_permanent: bool) -> Harness {
        let dir = tempfile::tempdir().unwrap();
        let staging: Arc<dyn Storage> = Arc::new(
            LocalStorage::new(dir.path().join("staging"), "file:///staging".to_string())
                .await
                .unwrap(),
        );
        let dex = flaky(dir.path(), "dex", 0, false).await;
        let edav = flaky(dir.path(), "edav", edav_failures, edav_permanent).await;

        let mut stores: HashMap<Destination, Arc<dyn Storage>> = HashMap::new();
        stores.insert(Destination::Dex, dex.clone());
        stores.insert(Destination::Edav, edav.clone());
        let routing = RoutingTable::new(
            vec![crate::routing::RouteConfig {
                destination_id: "dextesting".to_string(),
                ext_event: "testevent1".to_string(),
                targets: vec![Destination::Dex, Destination::Edav],
            }],
            stores,
        )
        .unwrap();

        let tguid: Tguid = "U1".parse().unwrap();
        let body = Bytes::from(vec![7u8; 100]);
        staging
            .put("objects/U1", body, "application/octet-stream")
            .await
            .unwrap();

        let traces = Arc::new(MemoryTraceStore::new());
        let queue = Arc::new(MemoryCopyStatusQueue::new());
        let documents = Arc::new(MemoryCopyStatusStore::new());
        let merger = CopyStatusMerger::new(documents.clone(), 8);
        let (publisher, _) =
            StatusPublisher::spawn(traces.clone(), queue.clone(), BackoffPolicy::immediate(3));

        let dispatcher = ReplicationDispatcher::new(
            Arc::clone(&staging),
            Arc::new(routing),
            publisher.clone(),
            merger.clone(),
            DispatchConfig {
                backoff: BackoffPolicy::immediate(3),
                attempt_timeout: Duration::from_secs(5),
            },
        );

        let now = Utc::now();
        let event = UploadCompleted {
            tguid,
            etag: "etag".to_string(),
            object_key: "objects/U1".to_string(),
            size: 100,
            metadata: UploadMetadata {
                routing: RoutingKey {
                    meta_destination_id: "dextesting".to_string(),
                    meta_ext_event: "testevent1".to_string(),
                },
                filename: "10MB-test-file".to_string(),
                fields: HashMap::new(),
            },
            started_at: now,
            completed_at: now,
        };

        Harness {
            dispatcher,
            staging,
            dex,
            edav,
            traces,
            queue,
            documents,
            merger,
            publisher,
            event,
            _dir: dir,
        }
    }

    async fn reconcile(h: &Harness) {
        let reconciler = CopyStatusReconciler::new(
            h.queue.clone(),
            h.merger.clone(),
            ReconcilerConfig::default(),
        );
        reconciler.drain().await;
    }

    #[tokio::test]
    async fn transient_destination_failures_are_retried_to_success() {
        let h = harness(2, false).await;
        let outcome = h.dispatcher.dispatch(&h.event).await;
        assert_eq!(
            outcome,
            vec![
                (Destination::Dex, CopyStatus::Success),
                (Destination::Edav, CopyStatus::Success)
            ]
        );

        let key = destination_key(&h.event);
        assert_eq!(key, "dextesting-testevent1/U1");
        assert_eq!(h.dex.download(&key).await.unwrap().len(), 100);
        assert_eq!(h.edav.download(&key).await.unwrap().len(), 100);

        h.publisher.flush().await;
        let trace = h.traces.get_trace(&h.event.tguid).await.unwrap().unwrap();
        let edav: Vec<_> = trace
            .spans
            .iter()
            .filter(|s| s.stage_name == "edav-copy")
            .map(|s| s.status)
            .collect();
        assert_eq!(
            edav,
            vec![SpanStatus::Failure, SpanStatus::Failure, SpanStatus::Success]
        );
        assert_eq!(
            trace.spans.iter().filter(|s| s.stage_name == "dex-copy").count(),
            1
        );

        // one terminal update per destination
        assert_eq!(h.queue.len().await, 2);
        reconcile(&h).await;
        let doc = h.documents.get(&h.event.tguid).await.unwrap().unwrap().document;
        assert_eq!(doc.status_dex, CopyStatus::Success);
        assert_eq!(doc.status_edav, CopyStatus::Success);
        assert_eq!(doc.item.size, 100);
        assert_eq!(doc.item.filename.as_deref(), Some("10MB-test-file"));
        assert!(!h.staging.exists("objects/U1").await.unwrap());
    }

    #[tokio::test]
    async fn exhausted_destination_does_not_affect_siblings() {
        let h = harness(10, false).await;
        let outcome = h.dispatcher.dispatch(&h.event).await;
        assert_eq!(
            outcome,
            vec![
                (Destination::Dex, CopyStatus::Success),
                (Destination::Edav, CopyStatus::Failure)
            ]
        );

        h.publisher.flush().await;
        reconcile(&h).await;
        let doc = h.documents.get(&h.event.tguid).await.unwrap().unwrap().document;
        assert_eq!(doc.status_dex, CopyStatus::Success);
        assert_eq!(doc.status_edav, CopyStatus::Failure);

        let trace = h.traces.get_trace(&h.event.tguid).await.unwrap().unwrap();
        assert_eq!(
            trace.spans.iter().filter(|s| s.stage_name == "edav-copy").count(),
            3
        );
        assert!(!h.staging.exists("objects/U1").await.unwrap());
    }

    #[tokio::test]
    async fn unrouted_event_keeps_sealed_object() {
        let mut h = harness(0, false).await;
        h.event.metadata.routing.meta_ext_event = "unknown".to_string();
        assert!(h.dispatcher.dispatch(&h.event).await.is_empty());
        assert!(h.staging.exists("objects/U1").await.unwrap());
    }

    #[tokio::test]
    async fn permanent_errors_are_not_retried() {
        let h = harness(0, true).await;
        let outcome = h.dispatcher.dispatch(&h.event).await;
        assert_eq!(outcome[1], (Destination::Edav, CopyStatus::Failure));

        h.publisher.flush().await;
        let trace = h.traces.get_trace(&h.event.tguid).await.unwrap().unwrap();
        assert_eq!(
            trace.spans.iter().filter(|s| s.stage_name == "edav-copy").count(),
            1
        );
    }

    #[tokio::test]
    async fn spawned_dispatcher_drains_events_on_hangup() {
        let h = harness(0, false).await;
        let (tx, rx) = mpsc::unbounded_channel();
        let handle = h.dispatcher.clone().spawn(rx);
        tx.send(h.event.clone()).unwrap();
        drop(tx);
        handle.await.unwrap();

        assert!(h.dex.exists(&destination_key(&h.event)).await.unwrap());
        assert!(h.edav.exists(&destination_key(&h.event)).await.unwrap());
    }
}
