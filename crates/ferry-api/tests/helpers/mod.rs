//! Test helpers: build the pipeline and router on in-memory backends.
//!
//! Run from workspace root: `cargo test -p ferry-api`. No database is needed; staging and
//! destination stores live in a temp directory.

pub mod storage;

use axum_test::TestServer;
use base64::{engine::general_purpose::STANDARD, Engine as _};
use ferry_api::setup::{build_pipeline, routes, Backends, Pipeline};
use ferry_core::models::Destination;
use ferry_core::{BackoffPolicy, Config};
use ferry_services::routing::RouteConfig;
use ferry_services::RoutingTable;
use ferry_storage::{LocalStorage, Storage};
use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;

pub use storage::FlakyStorage;

pub const DESTINATION_ID: &str = "dextesting";
pub const EXT_EVENT: &str = "testevent1";

/// Test application: server, backends and owned resources.
pub struct TestApp {
    pub server: TestServer,
    pub backends: Backends,
    pub dex: Arc<FlakyStorage>,
    pub edav: Arc<FlakyStorage>,
    pub _pipeline: Pipeline,
    pub _temp_dir: TempDir,
}

impl TestApp {
    pub fn client(&self) -> &TestServer {
        &self.server
    }
}

pub fn create_test_config() -> Config {
    let mut config = Config::default();
    config.intake.max_upload_size_bytes = 1024 * 1024;
    config.intake.inactivity_timeout = Duration::from_secs(60);
    config.intake.sweep_interval = Duration::from_secs(3600);
    config.pipeline.copy_backoff = BackoffPolicy::immediate(3);
    config.pipeline.copy_attempt_timeout = Duration::from_secs(5);
    config.pipeline.publish_backoff = BackoffPolicy::immediate(3);
    config.pipeline.reconciler_workers = 2;
    config.pipeline.reconciler_poll_interval = Duration::from_millis(10);
    config.pipeline.reconciler_visibility_timeout = Duration::from_millis(200);
    config
}

/// App whose EDAV destination fails its first `edav_failures` writes.
pub async fn setup_test_app_with(edav_failures: u32, config: Config) -> TestApp {
    let temp_dir = tempfile::tempdir().expect("Failed to create temp directory");

    let staging: Arc<dyn Storage> = Arc::new(
        LocalStorage::new(temp_dir.path().join("staging"), "file:///staging".to_string())
            .await
            .expect("Failed to create staging storage"),
    );
    let dex = Arc::new(FlakyStorage::new(&temp_dir.path().join("dex"), 0).await);
    let edav = Arc::new(FlakyStorage::new(&temp_dir.path().join("edav"), edav_failures).await);

    let mut stores: HashMap<Destination, Arc<dyn Storage>> = HashMap::new();
    stores.insert(Destination::Dex, dex.clone());
    stores.insert(Destination::Edav, edav.clone());
    let routing = RoutingTable::new(
        vec![RouteConfig {
            destination_id: DESTINATION_ID.to_string(),
            ext_event: EXT_EVENT.to_string(),
            targets: vec![Destination::Dex, Destination::Edav],
        }],
        stores,
    )
    .expect("Failed to build routing table");

    let backends = Backends::in_memory();
    let pipeline = build_pipeline(&config, backends.clone(), staging, routing);
    let router = routes::setup_routes(&config, pipeline.state.clone());
    let server = TestServer::new(router).expect("Failed to create test server");

    TestApp {
        server,
        backends,
        dex,
        edav,
        _pipeline: pipeline,
        _temp_dir: temp_dir,
    }
}

pub async fn setup_test_app() -> TestApp {
    setup_test_app_with(0, create_test_config()).await
}

/// tus `Upload-Metadata` header value
pub fn metadata_header(pairs: &[(&str, &str)]) -> String {
    pairs
        .iter()
        .map(|(key, value)| format!("{} {}", key, STANDARD.encode(value)))
        .collect::<Vec<_>>()
        .join(",")
}

pub fn routed_metadata(filename: &str) -> String {
    metadata_header(&[
        ("meta_destination_id", DESTINATION_ID),
        ("meta_ext_event", EXT_EVENT),
        ("filename", filename),
    ])
}

/// Create an upload and return its tguid.
pub async fn create_upload(server: &TestServer, length: u64) -> String {
    let response = server
        .post("/files")
        .add_header("Tus-Resumable", "1.0.0")
        .add_header("Upload-Length", length.to_string())
        .add_header("Upload-Metadata", routed_metadata("10MB-test-file"))
        .await;
    assert_eq!(response.status_code(), 201, "{}", response.text());
    response
        .header("tguid")
        .to_str()
        .expect("tguid header is ASCII")
        .to_string()
}

/// Poll `check` until it returns `Some`, for at most five seconds.
pub async fn eventually<T, F, Fut>(mut check: F) -> T
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Option<T>>,
{
    for _ in 0..500 {
        if let Some(value) = check().await {
            return value;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("condition not reached within 5s");
}
