//! Thin binary crate wiring configuration, a Postgres pool, and the HTTP
//! collaborators into `batch-core`'s types, then driving the Task Runner's
//! worker loop.
//!
//! Grounded on `sharepoint-ingest/src/main.rs`'s wiring (structured JSON
//! logging via `tracing_subscriber`, a `deadpool_postgres::Pool` built from
//! `tokio_postgres::Config`) minus its `actix_web` HTTP server: the REST
//! ingress surface is out of scope here, so this binary exposes the job
//! ingress API (`batch_core::ingress::enqueue`) only to itself, driven by
//! `RUN_JOB_ID` / `RUN_JOB_URLS` at startup, and otherwise just keeps the
//! worker pool alive until signalled to stop.

use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use batch_core::converter::{Converter, HttpConverter};
use batch_core::downloader::{Downloader, HttpDownloader};
use batch_core::fileservice::{FileService, HttpFileService};
use batch_core::ingress::{enqueue, EnqueueRequest};
use batch_core::store::{PostgresStateStore, StateStore};
use batch_core::task_runner::TaskRunner;
use batch_core::tracer::Tracer;
use deadpool_postgres::{Manager, ManagerConfig, Pool, RecyclingMethod};
use tokio_postgres::NoTls;
use tracing::{error, info, warn};

fn build_pool(database_url: &str) -> anyhow::Result<Pool> {
    let pg_config = tokio_postgres::Config::from_str(database_url)?;
    let manager = Manager::from_config(
        pg_config,
        NoTls,
        ManagerConfig {
            recycling_method: RecyclingMethod::Fast,
        },
    );
    Ok(Pool::builder(manager).max_size(16).build()?)
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .json()
        .init();

    let settings = shared::config::Settings::new().expect("configuration error");

    let pool = build_pool(&settings.database_url).map_err(|err| {
        error!(error = %err, "failed to build postgres pool");
        err
    })?;
    info!("created postgres pool");

    let store: Arc<dyn StateStore> = Arc::new(PostgresStateStore::new(pool));
    let downloader: Arc<dyn Downloader> = Arc::new(HttpDownloader::new()?);

    let http_client = reqwest::Client::builder()
        .timeout(Duration::from_secs(settings.upload_timeout_seconds))
        .build()?;
    let file_service: Arc<dyn FileService> = Arc::new(HttpFileService::new(
        http_client,
        settings.file_service_base_url.clone(),
        settings.file_service_token.clone(),
    ));

    let converter: Arc<dyn Converter> = Arc::new(HttpConverter::new(
        settings.converter_base_url.clone(),
        settings.converter_token.clone(),
        Duration::from_secs(settings.upload_timeout_seconds),
    )?);

    let tracer = Arc::new(Tracer::new());

    let coordinator = Arc::new(batch_core::coordinator::Coordinator::new(
        store.clone(),
        downloader,
        file_service,
        settings.max_requests_per_minute,
        settings.max_concurrent_uploads,
        converter,
        tracer,
    ));

    let runner = TaskRunner::spawn(coordinator, settings.worker_pool_size);

    if let (Ok(job_id), Ok(urls_csv)) = (std::env::var("RUN_JOB_ID"), std::env::var("RUN_JOB_URLS")) {
        let urls: Vec<String> = urls_csv.split(',').map(|s| s.trim().to_string()).filter(|s| !s.is_empty()).collect();
        let request = EnqueueRequest {
            job_id: job_id.clone(),
            urls,
            download_timeout: Duration::from_secs(settings.download_timeout_seconds),
            max_download_size_bytes: settings.max_download_size_mb * 1024 * 1024,
            drive_integration_enabled: !settings.file_service_base_url.is_empty(),
            folder_pattern: Some(settings.folder_pattern_default.clone()),
            request_previews: settings.preview_on_upload,
        };
        match enqueue(&store, &runner, request).await {
            Ok(result) => info!(job_id = %job_id, status = %result.status, "job invocation finished"),
            Err(err) => warn!(job_id = %job_id, error = %err, "job invocation failed"),
        }
    }

    match tokio::signal::ctrl_c().await {
        Ok(()) => info!("shutdown signal received"),
        Err(err) => error!(error = %err, "failed to listen for shutdown signal"),
    }

    Ok(())
}
