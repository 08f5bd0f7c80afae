//! Copy-status reconciler: worker pool, polling, and per-delivery merge.
//!
//! Shutdown: [`ReconcilerHandle::shutdown`] stops the polling loop; deliveries already
//! being processed finish on their own and unacknowledged ones return to the queue once
//! their visibility window lapses.

use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, OwnedSemaphorePermit, Semaphore};
use tokio::task::JoinHandle;
use tokio::time::sleep;

use ferry_core::models::ItemInternalCopyStatus;
use ferry_core::PipelineConfig;

use crate::merge::CopyStatusMerger;
use crate::queue::{CopyStatusQueue, Delivery};

#[derive(Debug, Clone)]
pub struct ReconcilerConfig {
    pub max_workers: usize,
    pub poll_interval: Duration,
    pub visibility_timeout: Duration,
}

impl Default for ReconcilerConfig {
    fn default() -> Self {
        Self {
            max_workers: 4,
            poll_interval: Duration::from_millis(500),
            visibility_timeout: Duration::from_secs(30),
        }
    }
}

impl From<&PipelineConfig> for ReconcilerConfig {
    fn from(config: &PipelineConfig) -> Self {
        Self {
            max_workers: config.reconciler_workers.max(1),
            poll_interval: config.reconciler_poll_interval,
            visibility_timeout: config.reconciler_visibility_timeout,
        }
    }
}

/// What happened to a single delivery
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeliveryOutcome {
    /// Merged (or found redundant) and acknowledged
    Applied,
    /// Undecodable or missing its tguid; acknowledged and dropped
    Dropped,
    /// Left unacknowledged; the queue redelivers it after the visibility timeout
    Deferred,
}

pub struct CopyStatusReconciler {
    queue: Arc<dyn CopyStatusQueue>,
    merger: CopyStatusMerger,
    config: ReconcilerConfig,
}

/// Running reconciler pool
pub struct ReconcilerHandle {
    shutdown_tx: mpsc::Sender<()>,
    join: JoinHandle<()>,
}

impl ReconcilerHandle {
    /// Stop polling and wait for the loop to exit.
    pub async fn shutdown(self) {
        let _ = self.shutdown_tx.send(()).await;
        if let Err(e) = self.join.await {
            tracing::error!(error = %e, "Reconciler loop panicked");
        }
    }
}

impl CopyStatusReconciler {
    pub fn new(
        queue: Arc<dyn CopyStatusQueue>,
        merger: CopyStatusMerger,
        config: ReconcilerConfig,
    ) -> Self {
        Self {
            queue,
            merger,
            config,
        }
    }

    /// Spawn the polling loop with up to `max_workers` deliveries in flight.
    pub fn start(self: Arc<Self>) -> ReconcilerHandle {
        let (shutdown_tx, shutdown_rx) = mpsc::channel(1);
        let join = tokio::spawn(self.worker_pool(shutdown_rx));
        ReconcilerHandle { shutdown_tx, join }
    }

    async fn worker_pool(self: Arc<Self>, mut shutdown_rx: mpsc::Receiver<()>) {
        tracing::info!(
            max_workers = self.config.max_workers,
            poll_interval_ms = self.config.poll_interval.as_millis() as u64,
            visibility_timeout_secs = self.config.visibility_timeout.as_secs(),
            "Copy-status reconciler started"
        );

        let semaphore = Arc::new(Semaphore::new(self.config.max_workers));

        loop {
            tokio::select! {
                _ = shutdown_rx.recv() => {
                    tracing::info!("Copy-status reconciler shutting down");
                    break;
                }
                _ = sleep(self.config.poll_interval) => {
                    self.claim_and_dispatch(&semaphore).await;
                }
            }
        }

        tracing::info!("Copy-status reconciler stopped");
    }

    async fn claim_and_dispatch(self: &Arc<Self>, semaphore: &Arc<Semaphore>) {
        let mut permits: Vec<OwnedSemaphorePermit> = Vec::new();
        while let Ok(permit) = semaphore.clone().try_acquire_owned() {
            permits.push(permit);
        }
        if permits.is_empty() {
            tracing::debug!("No reconciler workers available, skipping poll");
            return;
        }

        let deliveries = match self
            .queue
            .receive(permits.len(), self.config.visibility_timeout)
            .await
        {
            Ok(deliveries) => deliveries,
            Err(e) => {
                tracing::error!(error = %e, "Failed to receive copy-status messages");
                return;
            }
        };

        for (delivery, permit) in deliveries.into_iter().zip(permits) {
            let this = Arc::clone(self);
            tokio::spawn(async move {
                let _permit = permit;
                this.process_delivery(delivery).await;
            });
        }
    }

    /// Receive one batch and process it to completion. Returns the outcomes in delivery order.
    pub async fn run_once(&self) -> Vec<DeliveryOutcome> {
        let deliveries = match self
            .queue
            .receive(self.config.max_workers, self.config.visibility_timeout)
            .await
        {
            Ok(deliveries) => deliveries,
            Err(e) => {
                tracing::error!(error = %e, "Failed to receive copy-status messages");
                return Vec::new();
            }
        };

        let mut outcomes = Vec::with_capacity(deliveries.len());
        for delivery in deliveries {
            outcomes.push(self.process_delivery(delivery).await);
        }
        outcomes
    }

    /// Process queued messages until a receive comes back empty.
    pub async fn drain(&self) -> Vec<DeliveryOutcome> {
        let mut all = Vec::new();
        loop {
            let batch = self.run_once().await;
            if batch.is_empty() {
                return all;
            }
            all.extend(batch);
        }
    }

    #[tracing::instrument(skip(self, delivery), fields(message.id = delivery.id, receive_count = delivery.receive_count))]
    pub async fn process_delivery(&self, delivery: Delivery) -> DeliveryOutcome {
        let message: ItemInternalCopyStatus = match serde_json::from_str(&delivery.payload) {
            Ok(message) => message,
            Err(e) => {
                tracing::warn!(
                    error = %e,
                    raw_tguid = ?raw_tguid(&delivery.payload),
                    "Dropping undecodable copy-status message"
                );
                return self.ack(delivery.id, DeliveryOutcome::Dropped).await;
            }
        };

        match self.merger.apply(&message).await {
            Ok(outcome) => {
                let tguid = message.tguid.as_ref().map(|t| t.to_string());
                if outcome.merge.rejected > 0 {
                    tracing::info!(
                        tguid = ?tguid,
                        rejected = outcome.merge.rejected,
                        "Ignored copy-status fields older than the stored state"
                    );
                }
                tracing::debug!(
                    tguid = ?tguid,
                    applied = outcome.merge.applied,
                    created = outcome.created,
                    attempts = outcome.attempts,
                    "Copy-status message reconciled"
                );
                self.ack(delivery.id, DeliveryOutcome::Applied).await
            }
            Err(e) if e.is_redeliverable() => {
                tracing::warn!(error = %e, "Copy-status merge failed, leaving message for redelivery");
                DeliveryOutcome::Deferred
            }
            Err(e) => {
                tracing::error!(error = %e, "Dropping copy-status message that cannot be applied");
                self.ack(delivery.id, DeliveryOutcome::Dropped).await
            }
        }
    }

    async fn ack(&self, id: i64, outcome: DeliveryOutcome) -> DeliveryOutcome {
        match self.queue.ack(id).await {
            Ok(()) => outcome,
            Err(e) => {
                // The message comes back after the visibility timeout; merging it again is harmless.
                tracing::warn!(error = %e, message.id = id, "Failed to acknowledge copy-status message");
                DeliveryOutcome::Deferred
            }
        }
    }
}

/// The `Tguid` field of a payload that failed to decode, as sent.
fn raw_tguid(payload: &str) -> Option<String> {
    let value: serde_json::Value = serde_json::from_str(payload).ok()?;
    match value.get("Tguid")? {
        serde_json::Value::String(raw) => Some(raw.clone()),
        other => Some(other.to_string()),
    }
}
