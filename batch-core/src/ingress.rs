//! The internal Job ingress API: `enqueue` and `progress`.
//!
//! The REST surface shape is out of scope; this module is the narrow
//! internal entry point an HTTP ingress layer would sit on top of, keeping
//! the same arm's-length separation between web handlers and the
//! underlying job/state types that `sharepoint-ingest`'s `actix_web`
//! handlers keep from its `job.rs`/`msgraph.rs` types. `enqueue` performs
//! the boundary validation the Coordinator itself does not repeat.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;

use crate::coordinator::{CoordinatorOptions, CoordinatorResult, JobCommand};
use crate::error::AppError;
use crate::store::{progress, JobProgress, StateStore};
use crate::task_runner::TaskRunner;

#[derive(Debug, Clone)]
pub struct EnqueueRequest {
    pub job_id: String,
    pub urls: Vec<String>,
    pub download_timeout: Duration,
    pub max_download_size_bytes: u64,
    pub drive_integration_enabled: bool,
    pub folder_pattern: Option<String>,
    pub request_previews: bool,
}

/// Validates the request and runs the Coordinator invocation to completion
/// via the given `TaskRunner` (either `spawn`-backed or `immediate`).
///
/// The job must already exist (created externally, per the data model's Job
/// lifecycle) before an empty URL list is even considered, since a caller
/// referencing a nonexistent job is a more fundamental mistake than a
/// malformed payload.
pub async fn enqueue(
    store: &Arc<dyn StateStore>,
    runner: &TaskRunner,
    req: EnqueueRequest,
) -> Result<CoordinatorResult, AppError> {
    store.get_job(&req.job_id).await?;

    if req.urls.is_empty() {
        return Err(AppError::ValidationError(
            "url list must not be empty".to_string(),
        ));
    }

    let (_tx, cancel_rx) = watch::channel(JobCommand::Run);
    let options = CoordinatorOptions {
        urls: req.urls,
        download_timeout: req.download_timeout,
        max_download_size_bytes: req.max_download_size_bytes,
        drive_integration_enabled: req.drive_integration_enabled,
        folder_pattern: req.folder_pattern,
        request_previews: req.request_previews,
    };

    runner.submit(req.job_id, options, cancel_rx).await
}

/// `progress(job_id) -> { total, completed, failed, pending, percent }`,
/// computed purely from `FileMeta` counts.
pub async fn get_progress(store: &Arc<dyn StateStore>, job_id: &str) -> Result<JobProgress, AppError> {
    progress(store.as_ref(), job_id).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::coordinator::Coordinator;
    use crate::converter::testing::NoopConverter;
    use crate::downloader::testing::ScriptedDownloader;
    use crate::fileservice::testing::InMemoryFileService;
    use crate::model::Job;
    use crate::store::InMemoryStateStore;
    use crate::tracer::Tracer;
    use chrono::Utc;

    fn make_runner(store: Arc<dyn StateStore>) -> TaskRunner {
        let downloader = Arc::new(ScriptedDownloader::new(vec![Some(b"<svg/>".to_vec())]));
        let file_service = Arc::new(InMemoryFileService::new());
        let converter = Arc::new(NoopConverter);
        let tracer = Arc::new(Tracer::new());
        let coordinator = Arc::new(Coordinator::new(store, downloader, file_service, 100, 10, converter, tracer));
        TaskRunner::immediate(coordinator)
    }

    #[tokio::test]
    async fn empty_url_list_is_a_validation_error() {
        let store: Arc<dyn StateStore> = Arc::new(InMemoryStateStore::new());
        store.put_job(Job::new("J1", 1, Utc::now())).await.unwrap();
        let runner = make_runner(store.clone());

        let result = enqueue(
            &store,
            &runner,
            EnqueueRequest {
                job_id: "J1".into(),
                urls: vec![],
                download_timeout: Duration::from_secs(30),
                max_download_size_bytes: 1024,
                drive_integration_enabled: false,
                folder_pattern: None,
                request_previews: false,
            },
        )
        .await;

        match result {
            Err(AppError::ValidationError(_)) => {}
            other => panic!("expected ValidationError, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn enqueue_against_unknown_job_is_job_not_found() {
        let store: Arc<dyn StateStore> = Arc::new(InMemoryStateStore::new());
        let runner = make_runner(store.clone());

        let result = enqueue(
            &store,
            &runner,
            EnqueueRequest {
                job_id: "missing".into(),
                urls: vec!["https://x/a.svg".into()],
                download_timeout: Duration::from_secs(30),
                max_download_size_bytes: 1024,
                drive_integration_enabled: false,
                folder_pattern: None,
                request_previews: false,
            },
        )
        .await;

        match result {
            Err(AppError::JobNotFound(_)) => {}
            other => panic!("expected JobNotFound, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn enqueue_runs_the_job_to_completion() {
        let store: Arc<dyn StateStore> = Arc::new(InMemoryStateStore::new());
        store.put_job(Job::new("J1", 1, Utc::now())).await.unwrap();
        let runner = make_runner(store.clone());

        let result = enqueue(
            &store,
            &runner,
            EnqueueRequest {
                job_id: "J1".into(),
                urls: vec!["https://x/a.svg".into()],
                download_timeout: Duration::from_secs(30),
                max_download_size_bytes: 1024,
                drive_integration_enabled: false,
                folder_pattern: None,
                request_previews: false,
            },
        )
        .await
        .unwrap();

        assert_eq!(result.status, crate::model::JobStatus::Completed);

        let progress = get_progress(&store, "J1").await.unwrap();
        assert_eq!(progress.total, 0, "no drive integration means no FileMeta rows");
    }
}
