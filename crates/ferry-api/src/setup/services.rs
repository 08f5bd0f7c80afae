//! Pipeline wiring: stores, queue, background workers and application state.

use crate::state::AppState;
use anyhow::{Context, Result};
use ferry_core::Config;
use ferry_db::{
    run_migrations, shared_pool, CopyStatusStore, MemoryCopyStatusStore, MemoryTraceStore,
    PostgresCopyStatusStore, PostgresTraceStore, TraceStore,
};
use ferry_services::{
    CopyStatusQueryService, DispatchConfig, IntakeSettings, ReplicationDispatcher, RoutingConfig,
    PublisherTasks, RoutingTable, StatusPublisher, SweeperHandle, TraceQueryService, UploadIntake,
};
use ferry_storage::{create_storage, Storage, StorageTarget};
use ferry_worker::{
    CopyStatusMerger, CopyStatusQueue, CopyStatusReconciler, MemoryCopyStatusQueue,
    PostgresCopyStatusQueue, ReconcilerConfig, ReconcilerHandle,
};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

const DRAIN_TIMEOUT: Duration = Duration::from_secs(30);

/// Trace store, copy-status store and durable queue
#[derive(Clone)]
pub struct Backends {
    pub traces: Arc<dyn TraceStore>,
    pub copy_status: Arc<dyn CopyStatusStore>,
    pub queue: Arc<dyn CopyStatusQueue>,
}

impl Backends {
    /// Process-local backends; state is lost on restart.
    pub fn in_memory() -> Self {
        Self {
            traces: Arc::new(MemoryTraceStore::new()),
            copy_status: Arc::new(MemoryCopyStatusStore::new()),
            queue: Arc::new(MemoryCopyStatusQueue::new()),
        }
    }

    /// PostgreSQL backends sharing the process-wide pool.
    pub async fn postgres(config: &Config) -> Result<Self> {
        let pool = shared_pool(&config.base).await?;
        run_migrations(&pool).await?;
        Ok(Self {
            traces: Arc::new(PostgresTraceStore::new(pool.clone())),
            copy_status: Arc::new(PostgresCopyStatusStore::new(pool.clone())),
            queue: Arc::new(PostgresCopyStatusQueue::new(pool)),
        })
    }

    pub async fn from_config(config: &Config) -> Result<Self> {
        if config.database_url().is_some() {
            tracing::info!("Using PostgreSQL for traces, copy status and the status queue");
            Self::postgres(config).await
        } else {
            tracing::warn!("DATABASE_URL not set, using in-memory stores; state is lost on restart");
            Ok(Self::in_memory())
        }
    }
}

/// Application state plus the background tasks that drive replication and reconciliation
pub struct Pipeline {
    pub state: Arc<AppState>,
    publisher: StatusPublisher,
    publisher_tasks: PublisherTasks,
    dispatcher_task: JoinHandle<()>,
    reconciler: ReconcilerHandle,
    sweeper: SweeperHandle,
}

/// Start the pipeline on already constructed backends, staging store and routing table.
pub fn build_pipeline(
    config: &Config,
    backends: Backends,
    staging: Arc<dyn Storage>,
    routing: RoutingTable,
) -> Pipeline {
    let routing = Arc::new(routing);
    let (publisher, publisher_tasks) = StatusPublisher::spawn(
        Arc::clone(&backends.traces),
        Arc::clone(&backends.queue),
        config.pipeline.publish_backoff,
    );
    let merger = CopyStatusMerger::new(
        Arc::clone(&backends.copy_status),
        config.pipeline.reconciler_max_conflict_retries,
    );

    let (completed_tx, completed_rx) = mpsc::unbounded_channel();
    let intake = Arc::new(UploadIntake::new(
        Arc::clone(&staging),
        Arc::clone(&routing),
        publisher.clone(),
        completed_tx,
        IntakeSettings::from(config),
    ));

    let dispatcher_task = ReplicationDispatcher::new(
        Arc::clone(&staging),
        Arc::clone(&routing),
        publisher.clone(),
        merger.clone(),
        DispatchConfig::from(config),
    )
    .spawn(completed_rx);

    let reconciler = Arc::new(CopyStatusReconciler::new(
        Arc::clone(&backends.queue),
        merger,
        ReconcilerConfig::from(&config.pipeline),
    ))
    .start();

    let sweeper = intake.spawn_sweeper(config.intake.sweep_interval);

    let state = Arc::new(AppState {
        config: config.clone(),
        intake,
        traces: TraceQueryService::new(Arc::clone(&backends.traces)),
        copy_status: CopyStatusQueryService::new(Arc::clone(&backends.copy_status)),
        queue: backends.queue,
        staging,
    });

    tracing::info!(
        routes = routing.route_count(),
        reconciler_workers = config.pipeline.reconciler_workers,
        "Upload pipeline started"
    );

    Pipeline {
        state,
        publisher,
        publisher_tasks,
        dispatcher_task,
        reconciler,
        sweeper,
    }
}

/// Build backends, staging and routing from configuration, then start the pipeline.
pub async fn initialize_services(config: &Config) -> Result<Pipeline> {
    let backends = Backends::from_config(config).await?;

    let staging = create_storage(&StorageTarget::local(
        config.intake.staging_storage_path.clone(),
    ))
    .await
    .context("Failed to create staging storage")?;

    let routing_config = RoutingConfig::load(&config.pipeline.routing_config_path).await?;
    let routing = RoutingTable::from_config(routing_config).await?;

    Ok(build_pipeline(config, backends, staging, routing))
}

impl Pipeline {
    /// Stop accepting work and drain what is in flight.
    ///
    /// Call after the HTTP server has stopped so no new uploads arrive.
    pub async fn shutdown(self) {
        let Pipeline {
            state,
            publisher,
            publisher_tasks,
            dispatcher_task,
            reconciler,
            sweeper,
        } = self;

        sweeper.shutdown().await;
        // the dispatcher exits once the intake, and with it the completion sender, is gone
        drop(state);
        match tokio::time::timeout(DRAIN_TIMEOUT, dispatcher_task).await {
            Ok(Err(e)) => tracing::error!(error = %e, "Dispatcher task failed"),
            Err(_) => tracing::warn!("Timed out waiting for in-flight replication"),
            Ok(Ok(())) => {}
        }

        drop(publisher);
        publisher_tasks.shutdown(DRAIN_TIMEOUT).await;

        reconciler.shutdown().await;
        tracing::info!("Upload pipeline stopped");
    }
}
