//! Upload intake for resumable uploads.
//!
//! Each upload is a session keyed by tguid. Chunks must arrive at the current offset;
//! every accepted chunk is staged as its own part object and folded into a running
//! SHA-256. When the offset reaches the declared length the parts are assembled into the
//! sealed object, a receipt is issued and a completion event is handed to the dispatcher.
//! Sessions without progress for the inactivity window are abandoned by the sweeper.
//!
//! Concurrency: chunk writes and sweeps for one tguid are serialized by a per-session
//! mutex; different tguids proceed in parallel. Completion and abandonment are terminal
//! state transitions made under that mutex, so each happens at most once.

use bytes::Bytes;
use chrono::{DateTime, Utc};
use ferry_core::models::{
    FileReceipt, ReceiptStatus, Span, SpanStatus, Tguid, TraceContext, UploadCompleted,
    UploadInfo, UploadMetadata, UploadState, STAGE_UPLOAD_RECEIVED,
};
use ferry_core::{AppError, BackoffPolicy, Config};
use ferry_storage::{ByteReader, Storage, StorageError};
use futures::{StreamExt, TryStreamExt};
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, Mutex, RwLock};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::io::StreamReader;

use crate::publisher::StatusPublisher;
use crate::routing::RoutingTable;

const DEFAULT_CONTENT_TYPE: &str = UploadMetadata::DEFAULT_CONTENT_TYPE;

#[derive(Debug, Clone)]
pub struct IntakeSettings {
    pub max_upload_size: u64,
    pub inactivity_timeout: Duration,
    /// Retry policy for staging chunk parts
    pub chunk_backoff: BackoffPolicy,
}

impl From<&Config> for IntakeSettings {
    fn from(config: &Config) -> Self {
        Self {
            max_upload_size: config.intake.max_upload_size_bytes,
            inactivity_timeout: config.intake.inactivity_timeout,
            chunk_backoff: config.pipeline.copy_backoff,
        }
    }
}

/// Result of appending one chunk
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChunkOutcome {
    /// Bytes accepted; more are expected
    Progress { offset: u64 },
    /// The upload is sealed
    Completed(FileReceipt),
}

struct UploadSession {
    tguid: Tguid,
    length: u64,
    offset: u64,
    state: UploadState,
    metadata: UploadMetadata,
    created_at: DateTime<Utc>,
    started: Instant,
    last_activity: Instant,
    last_activity_at: DateTime<Utc>,
    hasher: Sha256,
    parts: Vec<String>,
    receipt: Option<FileReceipt>,
}

impl UploadSession {
    fn info(&self) -> UploadInfo {
        UploadInfo {
            tguid: self.tguid.clone(),
            offset: self.offset,
            length: self.length,
            state: self.state,
            filename: self.metadata.filename.clone(),
            meta_destination_id: self.metadata.routing.meta_destination_id.clone(),
            meta_ext_event: self.metadata.routing.meta_ext_event.clone(),
            created_at: self.created_at,
            last_activity_at: self.last_activity_at,
            receipt: self.receipt.clone(),
        }
    }

    fn touch(&mut self) {
        self.last_activity = Instant::now();
        self.last_activity_at = Utc::now();
    }

    fn trace_context(&self) -> TraceContext {
        TraceContext::for_upload(&self.tguid, &self.metadata)
    }
}

/// Staging key of the part that starts at `offset`; zero padded so keys sort by offset.
fn part_key(tguid: &Tguid, offset: u64) -> String {
    format!("staging/{}/part-{:020}", tguid, offset)
}

/// Key of the sealed object in the staging store
pub fn object_key(tguid: &Tguid) -> String {
    format!("objects/{}", tguid)
}

fn storage_error(context: &str, err: StorageError) -> AppError {
    AppError::Storage(format!("{}: {}", context, err))
}

pub struct UploadIntake {
    staging: Arc<dyn Storage>,
    routing: Arc<RoutingTable>,
    publisher: StatusPublisher,
    completed_tx: mpsc::UnboundedSender<UploadCompleted>,
    settings: IntakeSettings,
    sessions: RwLock<HashMap<Tguid, Arc<Mutex<UploadSession>>>>,
}

/// Running inactivity sweeper
pub struct SweeperHandle {
    shutdown_tx: mpsc::Sender<()>,
    join: JoinHandle<()>,
}

impl SweeperHandle {
    pub async fn shutdown(self) {
        let _ = self.shutdown_tx.send(()).await;
        if let Err(e) = self.join.await {
            tracing::error!(error = %e, "Upload sweeper panicked");
        }
    }
}

impl UploadIntake {
    pub fn new(
        staging: Arc<dyn Storage>,
        routing: Arc<RoutingTable>,
        publisher: StatusPublisher,
        completed_tx: mpsc::UnboundedSender<UploadCompleted>,
        settings: IntakeSettings,
    ) -> Self {
        Self {
            staging,
            routing,
            publisher,
            completed_tx,
            settings,
            sessions: RwLock::new(HashMap::new()),
        }
    }

    pub fn max_upload_size(&self) -> u64 {
        self.settings.max_upload_size
    }

    /// Start a new upload. Rejects bad lengths and metadata without side effects.
    #[tracing::instrument(skip(self, fields))]
    pub async fn create(
        &self,
        length: Option<u64>,
        fields: HashMap<String, String>,
    ) -> Result<UploadInfo, AppError> {
        let length = length.ok_or_else(|| {
            AppError::InvalidInput("Upload-Length is required".to_string())
        })?;
        if length == 0 {
            return Err(AppError::InvalidInput(
                "Upload-Length must be greater than 0".to_string(),
            ));
        }
        if length > self.settings.max_upload_size {
            return Err(AppError::PayloadTooLarge(format!(
                "Upload-Length {} exceeds the maximum of {} bytes",
                length, self.settings.max_upload_size
            )));
        }

        let metadata = UploadMetadata::from_fields(fields).map_err(AppError::InvalidMetadata)?;
        if !self.routing.contains(&metadata.routing) {
            return Err(AppError::InvalidMetadata(format!(
                "No route configured for {}",
                metadata.routing
            )));
        }

        let tguid = Tguid::generate();
        let now = Utc::now();
        let session = UploadSession {
            tguid: tguid.clone(),
            length,
            offset: 0,
            state: UploadState::Receiving,
            metadata,
            created_at: now,
            started: Instant::now(),
            last_activity: Instant::now(),
            last_activity_at: now,
            hasher: Sha256::new(),
            parts: Vec::new(),
            receipt: None,
        };
        let info = session.info();

        self.sessions
            .write()
            .await
            .insert(tguid.clone(), Arc::new(Mutex::new(session)));

        tracing::info!(
            tguid = %tguid,
            length,
            route = %format!("{}/{}", info.meta_destination_id, info.meta_ext_event),
            "Upload created"
        );
        Ok(info)
    }

    async fn session(&self, tguid: &Tguid) -> Result<Arc<Mutex<UploadSession>>, AppError> {
        self.sessions
            .read()
            .await
            .get(tguid)
            .cloned()
            .ok_or_else(|| AppError::NotFound(format!("Upload {} not found", tguid)))
    }

    /// Current progress of an upload
    pub async fn info(&self, tguid: &Tguid) -> Result<UploadInfo, AppError> {
        let session = self.session(tguid).await?;
        let session = session.lock().await;
        Ok(session.info())
    }

    /// Append a chunk at `offset`.
    ///
    /// The chunk must start exactly at the current offset and must not run past the
    /// declared length. The chunk that reaches the declared length seals the upload.
    /// Repeating the final, empty append on a sealed upload returns the same receipt.
    #[tracing::instrument(skip(self, data), fields(chunk_len = data.len()))]
    pub async fn append_chunk(
        &self,
        tguid: &Tguid,
        offset: u64,
        data: Bytes,
    ) -> Result<ChunkOutcome, AppError> {
        let session = self.session(tguid).await?;
        let mut session = session.lock().await;

        match session.state {
            UploadState::Abandoned => {
                return Err(AppError::Gone(format!(
                    "Upload {} was abandoned after inactivity",
                    tguid
                )));
            }
            UploadState::Completed => {
                if offset == session.length && data.is_empty() {
                    if let Some(receipt) = session.receipt.clone() {
                        return Ok(ChunkOutcome::Completed(receipt));
                    }
                }
                return Err(AppError::OffsetMismatch {
                    expected: session.length,
                    actual: offset,
                });
            }
            UploadState::Receiving => {}
        }

        if offset != session.offset {
            return Err(AppError::OffsetMismatch {
                expected: session.offset,
                actual: offset,
            });
        }
        let end = offset.saturating_add(data.len() as u64);
        if end > session.length {
            return Err(AppError::LengthExceeded {
                declared: session.length,
                attempted: end,
            });
        }

        if !data.is_empty() {
            self.stage_part(&mut session, offset, data).await?;
        }

        if session.offset < session.length {
            return Ok(ChunkOutcome::Progress {
                offset: session.offset,
            });
        }

        let receipt = self.seal(&mut session).await?;
        Ok(ChunkOutcome::Completed(receipt))
    }

    async fn stage_part(
        &self,
        session: &mut UploadSession,
        offset: u64,
        data: Bytes,
    ) -> Result<(), AppError> {
        let key = part_key(&session.tguid, offset);
        let staging = &self.staging;
        let key_ref = key.as_str();
        let payload = &data;

        self.settings
            .chunk_backoff
            .retry(
                |attempt| async move {
                    let result = staging
                        .put(key_ref, payload.clone(), DEFAULT_CONTENT_TYPE)
                        .await;
                    if let Err(ref e) = result {
                        tracing::warn!(error = %e, key = %key_ref, attempt, "Failed to stage chunk");
                    }
                    result
                },
                |e: &StorageError| e.is_transient(),
            )
            .await
            .map_err(|e| storage_error("Failed to stage chunk", e))?;

        session.hasher.update(&data);
        session.offset += data.len() as u64;
        session.parts.push(key);
        session.touch();

        tracing::debug!(
            tguid = %session.tguid,
            offset = session.offset,
            length = session.length,
            "Chunk staged"
        );
        Ok(())
    }

    /// Concatenate the staged parts into the sealed object.
    async fn assemble(&self, session: &UploadSession) -> Result<(), StorageError> {
        let staging = Arc::clone(&self.staging);
        let parts = session.parts.clone();

        let stream = futures::stream::iter(parts)
            .then(move |key| {
                let staging = Arc::clone(&staging);
                async move { staging.download_stream(&key).await }
            })
            .try_flatten()
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::Other, e));
        let reader: ByteReader = Box::pin(StreamReader::new(stream));

        self.staging
            .upload_stream(
                &object_key(&session.tguid),
                session.metadata.content_type(),
                Some(session.length),
                reader,
            )
            .await?;
        Ok(())
    }

    async fn seal(&self, session: &mut UploadSession) -> Result<FileReceipt, AppError> {
        self.assemble(session)
            .await
            .map_err(|e| storage_error("Failed to assemble upload", e))?;

        let written = self
            .staging
            .content_length(&object_key(&session.tguid))
            .await
            .map_err(|e| storage_error("Failed to verify assembled upload", e))?;
        if written != session.length {
            return Err(AppError::Storage(format!(
                "Assembled object is {} bytes, expected {}",
                written, session.length
            )));
        }

        let etag = hex::encode(std::mem::take(&mut session.hasher).finalize());
        let receipt = FileReceipt {
            tguid: session.tguid.clone(),
            etag: etag.clone(),
            status: ReceiptStatus::Accepted,
        };
        session.state = UploadState::Completed;
        session.receipt = Some(receipt.clone());
        session.touch();

        self.publisher.record_span(
            &session.trace_context(),
            Span::finished(
                STAGE_UPLOAD_RECEIVED,
                SpanStatus::Success,
                session.started.elapsed(),
            ),
        );

        let event = UploadCompleted {
            tguid: session.tguid.clone(),
            etag,
            object_key: object_key(&session.tguid),
            size: session.length,
            metadata: session.metadata.clone(),
            started_at: session.created_at,
            completed_at: Utc::now(),
        };
        if self.completed_tx.send(event).is_err() {
            tracing::error!(tguid = %session.tguid, "Dispatcher is not running, upload will not be replicated");
        }

        tracing::info!(
            tguid = %session.tguid,
            size = session.length,
            etag = %receipt.etag,
            "Upload sealed"
        );

        self.delete_parts(session).await;
        Ok(receipt)
    }

    async fn delete_parts(&self, session: &mut UploadSession) {
        for key in std::mem::take(&mut session.parts) {
            if let Err(e) = self.staging.delete(&key).await {
                tracing::warn!(error = %e, key = %key, "Failed to delete staged part");
            }
        }
    }

    /// Abandon every receiving upload with no progress for the inactivity window.
    ///
    /// Sealed and abandoned sessions idle for longer than the same window are forgotten.
    pub async fn abandon_idle(&self) -> Vec<Tguid> {
        let sessions: Vec<(Tguid, Arc<Mutex<UploadSession>>)> = self
            .sessions
            .read()
            .await
            .iter()
            .map(|(tguid, session)| (tguid.clone(), Arc::clone(session)))
            .collect();

        let timeout = self.settings.inactivity_timeout;
        let mut abandoned = Vec::new();
        let mut expired = Vec::new();

        for (tguid, session) in sessions {
            let mut session = session.lock().await;
            if session.last_activity.elapsed() < timeout {
                continue;
            }
            match session.state {
                UploadState::Receiving => {
                    self.abandon(&mut session).await;
                    abandoned.push(tguid);
                }
                UploadState::Completed | UploadState::Abandoned => expired.push(tguid),
            }
        }

        if !expired.is_empty() {
            let mut registry = self.sessions.write().await;
            for tguid in &expired {
                registry.remove(tguid);
            }
            tracing::debug!(count = expired.len(), "Forgot finished uploads");
        }

        abandoned
    }

    async fn abandon(&self, session: &mut UploadSession) {
        session.state = UploadState::Abandoned;
        session.receipt = Some(FileReceipt {
            tguid: session.tguid.clone(),
            etag: String::new(),
            status: ReceiptStatus::Rejected,
        });
        session.touch();

        tracing::warn!(
            tguid = %session.tguid,
            offset = session.offset,
            length = session.length,
            "Upload abandoned after inactivity"
        );

        self.publisher.record_span(
            &session.trace_context(),
            Span::finished(
                STAGE_UPLOAD_RECEIVED,
                SpanStatus::Failure,
                session.started.elapsed(),
            ),
        );
        self.delete_parts(session).await;
    }

    /// Run [`UploadIntake::abandon_idle`] every `interval` until shut down.
    pub fn spawn_sweeper(self: &Arc<Self>, interval: Duration) -> SweeperHandle {
        let (shutdown_tx, mut shutdown_rx) = mpsc::channel::<()>(1);
        let intake = Arc::clone(self);
        let join = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        let abandoned = intake.abandon_idle().await;
                        if !abandoned.is_empty() {
                            tracing::info!(count = abandoned.len(), "Abandoned idle uploads");
                        }
                    }
                    _ = shutdown_rx.recv() => break,
                }
            }
        });
        SweeperHandle { shutdown_tx, join }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ferry_core::models::Destination;
    use ferry_db::{MemoryTraceStore, TraceStore};
    use ferry_storage::LocalStorage;
    use ferry_worker::MemoryCopyStatusQueue;

    struct Harness {
        intake: Arc<UploadIntake>,
        staging: Arc<dyn Storage>,
        traces: Arc<MemoryTraceStore>,
        publisher: StatusPublisher,
        completed_rx: mpsc::UnboundedReceiver<UploadCompleted>,
        _dir: tempfile::TempDir,
    }

    async fn harness(inactivity_timeout: Duration) -> Harness {
        let dir = tempfile::tempdir().unwrap();
        let staging: Arc<dyn Storage> = Arc::new(
            LocalStorage::new(dir.path().join("staging"), "file:///staging".to_string())
                .await
                .unwrap(),
        );
        let mut stores: HashMap<Destination, Arc<dyn Storage>> = HashMap::new();
        stores.insert(Destination::Dex, Arc::clone(&staging));
        let routing = RoutingTable::new(
            vec![crate::routing::RouteConfig {
                destination_id: "dextesting".to_string(),
                ext_event: "testevent1".to_string(),
                targets: vec![Destination::Dex],
            }],
            stores,
        )
        .unwrap();

        let traces = Arc::new(MemoryTraceStore::new());
        let (publisher, _) = StatusPublisher::spawn(
            traces.clone(),
            Arc::new(MemoryCopyStatusQueue::new()),
            BackoffPolicy::immediate(2),
        );
        let (completed_tx, completed_rx) = mpsc::unbounded_channel();
        let intake = Arc::new(UploadIntake::new(
            Arc::clone(&staging),
            Arc::new(routing),
            publisher.clone(),
            completed_tx,
            IntakeSettings {
                max_upload_size: 1024,
                inactivity_timeout,
                chunk_backoff: BackoffPolicy::immediate(2),
            },
        ));
        Harness {
            intake,
            staging,
            traces,
            publisher,
            completed_rx,
            _dir: dir,
        }
    }

    fn metadata() -> HashMap<String, String> {
        HashMap::from([
            ("meta_destination_id".to_string(), "dextesting".to_string()),
            ("meta_ext_event".to_string(), "testevent1".to_string()),
            ("filename".to_string(), "10MB-test-file".to_string()),
        ])
    }

    #[tokio::test]
    async fn two_chunks_produce_one_accepted_receipt() {
        let mut h = harness(Duration::from_secs(60)).await;
        let info = h.intake.create(Some(100), metadata()).await.unwrap();
        let tguid = info.tguid;

        let first = h
            .intake
            .append_chunk(&tguid, 0, Bytes::from(vec![1u8; 60]))
            .await
            .unwrap();
        assert_eq!(first, ChunkOutcome::Progress { offset: 60 });

        let second = h
            .intake
            .append_chunk(&tguid, 60, Bytes::from(vec![2u8; 40]))
            .await
            .unwrap();
        let ChunkOutcome::Completed(receipt) = second else {
            panic!("expected completion, got {:?}", second);
        };
        assert_eq!(receipt.status, ReceiptStatus::Accepted);

        let mut expected = Sha256::new();
        expected.update([1u8; 60]);
        expected.update([2u8; 40]);
        assert_eq!(receipt.etag, hex::encode(expected.finalize()));

        let sealed = h.staging.download(&object_key(&tguid)).await.unwrap();
        assert_eq!(sealed.len(), 100);
        assert!(!h.staging.exists(&part_key(&tguid, 0)).await.unwrap());

        let event = h.completed_rx.recv().await.unwrap();
        assert_eq!(event.tguid, tguid);
        assert_eq!(event.size, 100);
        assert!(h.completed_rx.try_recv().is_err());

        h.publisher.flush().await;
        let trace = h.traces.get_trace(&tguid).await.unwrap().unwrap();
        assert_eq!(trace.spans.len(), 1);
        assert_eq!(trace.spans[0].stage_name, STAGE_UPLOAD_RECEIVED);
        assert_eq!(trace.spans[0].status, SpanStatus::Success);
    }

    #[tokio::test]
    async fn out_of_order_chunk_is_rejected() {
        let h = harness(Duration::from_secs(60)).await;
        let tguid = h.intake.create(Some(100), metadata()).await.unwrap().tguid;

        let err = h
            .intake
            .append_chunk(&tguid, 60, Bytes::from(vec![0u8; 40]))
            .await
            .unwrap_err();
        assert!(matches!(err, AppError::OffsetMismatch { expected: 0, actual: 60 }));

        let err = h
            .intake
            .append_chunk(&tguid, 0, Bytes::from(vec![0u8; 101]))
            .await
            .unwrap_err();
        assert!(matches!(err, AppError::LengthExceeded { declared: 100, attempted: 101 }));
        assert_eq!(h.intake.info(&tguid).await.unwrap().offset, 0);
    }

    #[tokio::test]
    async fn concurrent_final_chunks_complete_once() {
        let mut h = harness(Duration::from_secs(60)).await;
        let tguid = h.intake.create(Some(10), metadata()).await.unwrap().tguid;

        let tasks: Vec<_> = (0..4)
            .map(|_| {
                let intake = Arc::clone(&h.intake);
                let tguid = tguid.clone();
                tokio::spawn(async move {
                    intake
                        .append_chunk(&tguid, 0, Bytes::from_static(b"0123456789"))
                        .await
                })
            })
            .collect();

        let mut completed = 0;
        for task in futures::future::join_all(tasks).await {
            match task.unwrap() {
                Ok(ChunkOutcome::Completed(_)) => completed += 1,
                Ok(other) => panic!("unexpected outcome {:?}", other),
                Err(AppError::OffsetMismatch { .. }) => {}
                Err(e) => panic!("unexpected error {}", e),
            }
        }
        assert_eq!(completed, 1);
        assert!(h.completed_rx.recv().await.is_some());
        assert!(h.completed_rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn repeated_final_append_returns_same_receipt() {
        let h = harness(Duration::from_secs(60)).await;
        let tguid = h.intake.create(Some(3), metadata()).await.unwrap().tguid;
        let ChunkOutcome::Completed(first) = h
            .intake
            .append_chunk(&tguid, 0, Bytes::from_static(b"abc"))
            .await
            .unwrap()
        else {
            panic!("expected completion");
        };
        let again = h.intake.append_chunk(&tguid, 3, Bytes::new()).await.unwrap();
        assert_eq!(again, ChunkOutcome::Completed(first));
    }

    #[tokio::test]
    async fn idle_upload_is_abandoned_without_completion() {
        let mut h = harness(Duration::from_millis(30)).await;
        let tguid = h.intake.create(Some(100), metadata()).await.unwrap().tguid;
        h.intake
            .append_chunk(&tguid, 0, Bytes::from(vec![0u8; 60]))
            .await
            .unwrap();

        tokio::time::sleep(Duration::from_millis(60)).await;
        assert_eq!(h.intake.abandon_idle().await, vec![tguid.clone()]);

        let info = h.intake.info(&tguid).await.unwrap();
        assert_eq!(info.state, UploadState::Abandoned);
        assert_eq!(info.receipt.unwrap().status, ReceiptStatus::Rejected);
        assert!(!h.staging.exists(&part_key(&tguid, 0)).await.unwrap());

        let err = h
            .intake
            .append_chunk(&tguid, 60, Bytes::from(vec![0u8; 40]))
            .await
            .unwrap_err();
        assert!(matches!(err, AppError::Gone(_)));
        assert!(h.completed_rx.try_recv().is_err());

        h.publisher.flush().await;
        let trace = h.traces.get_trace(&tguid).await.unwrap().unwrap();
        assert_eq!(trace.spans.len(), 1);
        assert_eq!(trace.spans[0].status, SpanStatus::Failure);

        // a later sweep forgets the abandoned session
        tokio::time::sleep(Duration::from_millis(60)).await;
        assert!(h.intake.abandon_idle().await.is_empty());
        assert!(matches!(
            h.intake.info(&tguid).await.unwrap_err(),
            AppError::NotFound(_)
        ));
    }

    #[tokio::test]
    async fn create_rejects_bad_input() {
        let h = harness(Duration::from_secs(60)).await;

        assert!(matches!(
            h.intake.create(Some(0), metadata()).await.unwrap_err(),
            AppError::InvalidInput(_)
        ));
        assert!(matches!(
            h.intake.create(None, metadata()).await.unwrap_err(),
            AppError::InvalidInput(_)
        ));
        assert!(matches!(
            h.intake.create(Some(4096), metadata()).await.unwrap_err(),
            AppError::PayloadTooLarge(_)
        ));

        let mut missing = metadata();
        missing.remove("meta_ext_event");
        assert!(matches!(
            h.intake.create(Some(10), missing).await.unwrap_err(),
            AppError::InvalidMetadata(_)
        ));

        let mut unrouted = metadata();
        unrouted.insert("meta_ext_event".to_string(), "unknown".to_string());
        assert!(matches!(
            h.intake.create(Some(10), unrouted).await.unwrap_err(),
            AppError::InvalidMetadata(_)
        ));
    }
}
