//! End-to-end scenario tests against the `InMemoryStateStore` +
//! `InMemoryFileService` + `ScriptedConverter`/`ScriptedDownloader` test
//! quadruple. Multi-component scenario tests live under the crate's
//! `tests/` directory; component-local edge cases stay in `#[cfg(test)]`
//! modules next to the code they test.

use std::sync::Arc;
use std::time::Duration;

use batch_core::converter::testing::{NoopConverter, ScriptedConverter, ScriptedResult};
use batch_core::converter::{ConvertFailure, ConvertSuccess};
use batch_core::coordinator::{Coordinator, CoordinatorOptions, JobCommand};
use batch_core::downloader::testing::ScriptedDownloader;
use batch_core::fileservice::testing::{InMemoryFileService, ScriptedOutcome};
use batch_core::fileservice::{CreateFolderResult, FileServiceError, UploadFileResult};
use batch_core::model::{ErrorClass, Job, JobStatus};
use batch_core::store::{InMemoryStateStore, StateStore};
use batch_core::tracer::Tracer;
use chrono::Utc;
use tokio::sync::watch;

fn coordinator_options(urls: Vec<&str>, drive_enabled: bool, previews: bool) -> CoordinatorOptions {
    CoordinatorOptions {
        urls: urls.into_iter().map(str::to_string).collect(),
        download_timeout: Duration::from_secs(30),
        max_download_size_bytes: 10 * 1024 * 1024,
        drive_integration_enabled: drive_enabled,
        folder_pattern: None,
        request_previews: previews,
    }
}

fn running_rx() -> watch::Receiver<JobCommand> {
    let (_tx, rx) = watch::channel(JobCommand::Run);
    rx
}

async fn seed_job(store: &InMemoryStateStore, job_id: &str, total_files: u32) {
    store.put_job(Job::new(job_id, total_files, Utc::now())).await.unwrap();
}

#[tokio::test]
async fn scenario_1_happy_path_no_drive() {
    let store = Arc::new(InMemoryStateStore::new());
    seed_job(&store, "J1", 2).await;

    let downloader = Arc::new(ScriptedDownloader::new(vec![
        Some(b"<svg>one</svg>".to_vec()),
        Some(b"<svg>two</svg>".to_vec()),
    ]));
    let file_service = Arc::new(InMemoryFileService::new());
    let converter = Arc::new(ScriptedConverter::new(vec![ScriptedResult::Success(ConvertSuccess {
        output_path: "output.pptx".into(),
        page_count: 2,
        output_size_bytes: 1024,
        debug_trace: serde_json::json!({}),
    })]));
    let tracer = Arc::new(Tracer::new());

    let coordinator = Coordinator::new(
        store.clone(),
        downloader,
        file_service,
        100,
        10,
        converter,
        tracer,
    );

    let result = coordinator
        .run("J1", coordinator_options(vec!["https://x/a.svg", "https://x/b.svg"], false, false), running_rx())
        .await
        .unwrap();

    assert_eq!(result.status, JobStatus::Completed);
    let job = store.get_job("J1").await.unwrap();
    assert_eq!(job.status, JobStatus::Completed);
    assert!(job.trace().total.is_some());
    assert!(job.trace().parse.is_some());
    let files = store.list_file_meta("J1").await.unwrap();
    assert!(files.is_empty(), "no upload occurred, so no FileMetas are expected");
}

#[tokio::test]
async fn scenario_2_happy_path_with_drive_and_previews() {
    let store = Arc::new(InMemoryStateStore::new());
    seed_job(&store, "J2", 1).await;

    let downloader = Arc::new(ScriptedDownloader::new(vec![Some(b"<svg>only</svg>".to_vec())]));
    let file_service = Arc::new(InMemoryFileService::new());
    file_service.push_create_folder(ScriptedOutcome::Ok(CreateFolderResult {
        folder_id: "F1".into(),
        folder_url: "https://files.example/F1".into(),
    }));
    file_service.push_upload_file(ScriptedOutcome::Ok(UploadFileResult {
        file_id: "X1".into(),
        file_url: "https://files.example/X1".into(),
        download_url: None,
    }));
    file_service.push_preview(ScriptedOutcome::Ok(batch_core::fileservice::PreviewResult {
        preview_url: "P1".into(),
        thumbnail_url: None,
    }));

    let converter = Arc::new(NoopConverter);
    let tracer = Arc::new(Tracer::new());

    let coordinator = Coordinator::new(store.clone(), downloader, file_service, 100, 10, converter, tracer);

    let result = coordinator
        .run("J2", coordinator_options(vec!["https://x/only.svg"], true, true), running_rx())
        .await
        .unwrap();

    assert_eq!(result.status, JobStatus::Completed);
    let job = store.get_job("J2").await.unwrap();
    assert_eq!(job.drive_upload_status, batch_core::model::DriveUploadStatus::Completed);

    let folder = store.get_folder_meta("J2").await.unwrap();
    assert_eq!(folder.folder_id.as_deref(), Some("F1"));

    let files = store.list_file_meta("J2").await.unwrap();
    assert_eq!(files.len(), 1);
    assert_eq!(files[0].upload_status, batch_core::model::UploadStatus::Completed);
    assert_eq!(files[0].preview_url.as_deref(), Some("P1"));
}

#[tokio::test]
async fn scenario_3_conversion_ok_upload_fails() {
    let store = Arc::new(InMemoryStateStore::new());
    seed_job(&store, "J3", 1).await;

    let downloader = Arc::new(ScriptedDownloader::new(vec![Some(b"<svg>only</svg>".to_vec())]));
    let file_service = Arc::new(InMemoryFileService::new());
    // upload fails on every attempt, including the 3 per-call retries.
    for _ in 0..3 {
        file_service.push_upload_file(ScriptedOutcome::Err(FileServiceError {
            class: ErrorClass::PermanentOther,
            message: "rejected by backend".into(),
            quota_reason: None,
        }));
    }

    let converter = Arc::new(NoopConverter);
    let tracer = Arc::new(Tracer::new());

    let coordinator = Coordinator::new(store.clone(), downloader, file_service, 100, 10, converter, tracer);

    let result = coordinator
        .run("J3", coordinator_options(vec!["https://x/only.svg"], true, false), running_rx())
        .await
        .unwrap();

    assert_eq!(result.status, JobStatus::CompletedUploadFailed);
    assert!(result.upload_error.is_some());

    let files = store.list_file_meta("J3").await.unwrap();
    assert_eq!(files.len(), 1);
    assert_eq!(files[0].upload_status, batch_core::model::UploadStatus::Failed);
    assert!(files[0].upload_error.is_some());
}

#[tokio::test]
async fn scenario_4_quota_exceeded_on_first_upload_parks_job_in_quota_wait() {
    let store = Arc::new(InMemoryStateStore::new());
    seed_job(&store, "J4", 1).await;

    let downloader = Arc::new(ScriptedDownloader::new(vec![Some(b"<svg>only</svg>".to_vec())]));
    let file_service = Arc::new(InMemoryFileService::new());
    file_service.push_create_folder(ScriptedOutcome::Ok(CreateFolderResult {
        folder_id: "F4".into(),
        folder_url: "https://files.example/F4".into(),
    }));
    file_service.push_upload_file(ScriptedOutcome::Err(FileServiceError {
        class: ErrorClass::QuotaExceeded,
        message: "quota exceeded".into(),
        quota_reason: Some(batch_core::model::QuotaErrorReason::RateLimit),
    }));

    let converter = Arc::new(NoopConverter);
    let tracer = Arc::new(Tracer::new());

    let coordinator = Coordinator::new(store.clone(), downloader, file_service, 100, 10, converter, tracer);

    let result = coordinator
        .run("J4", coordinator_options(vec!["https://x/only.svg"], true, false), running_rx())
        .await
        .unwrap();

    assert_eq!(result.status, JobStatus::Uploading);

    let job = store.get_job("J4").await.unwrap();
    assert_eq!(job.status, JobStatus::Uploading);
    assert_eq!(job.drive_upload_status, batch_core::model::DriveUploadStatus::QuotaWait);

    let files = store.list_file_meta("J4").await.unwrap();
    assert_eq!(files.len(), 1);
    assert_eq!(files[0].upload_status, batch_core::model::UploadStatus::Failed);
}

#[tokio::test]
async fn scenario_5_partial_download() {
    let downloader = ScriptedDownloader::new(vec![
        Some(b"<svg>one</svg>".to_vec()),
        None,
        Some(b"<svg>three</svg>".to_vec()),
    ]);
    use batch_core::downloader::{DownloadRequest, Downloader};
    let outcome = downloader
        .download(DownloadRequest {
            urls: vec!["https://x/1".into(), "https://x/2".into(), "https://x/3".into()],
            timeout: Duration::from_secs(30),
            max_size_bytes: 1024,
            job_id: Some("J5".into()),
        })
        .await
        .unwrap();

    assert!(outcome.success);
    assert_eq!(outcome.file_paths.len(), 2);
    assert_eq!(outcome.errors.len(), 1);
    assert_eq!(outcome.errors[0].error_type, "http_error");
}

#[tokio::test(start_paused = true)]
async fn scenario_6_recovery_after_failure() {
    let store = Arc::new(InMemoryStateStore::new());
    seed_job(&store, "J6", 3).await;
    {
        let mut job = store.get_job("J6").await.unwrap();
        job.status = JobStatus::Failed;
        store.put_job(job).await.unwrap();
    }
    let mut folder = batch_core::model::FolderMeta::new("J6", Utc::now());
    folder.folder_id = Some("F6".into());
    folder.folder_url = Some("https://files.example/F6".into());
    store.put_folder_meta(folder).await.unwrap();

    for name in ["a.svg", "b.svg", "c.svg"] {
        let mut meta = batch_core::model::FileMeta::new("J6", name, Utc::now());
        meta.upload_status = batch_core::model::UploadStatus::Failed;
        meta.upload_error = Some("permanent rejection".into());
        meta.local_path = Some(format!("/tmp/J6-{name}"));
        store.put_file_meta(meta).await.unwrap();
    }

    let downloader = Arc::new(ScriptedDownloader::new(vec![]));
    let file_service = Arc::new(InMemoryFileService::new());
    file_service.set_connection_status(batch_core::fileservice::ConnectionStatus::Ok);
    for name in ["a.svg", "b.svg", "c.svg"] {
        file_service.push_upload_file(ScriptedOutcome::Ok(UploadFileResult {
            file_id: format!("id-{name}"),
            file_url: format!("https://files.example/{name}"),
            download_url: None,
        }));
    }

    let converter: Arc<dyn batch_core::converter::Converter> = Arc::new(NoopConverter);
    let tracer = Arc::new(Tracer::new());

    let coordinator = Coordinator::new(store.clone(), downloader, file_service, 100, 10, converter, tracer);

    let result = coordinator.recover("J6").await.unwrap();
    assert_eq!(result.status, JobStatus::Processing);

    let files = store.list_file_meta("J6").await.unwrap();
    assert!(files.iter().all(|f| f.upload_status == batch_core::model::UploadStatus::Completed));
}

#[test]
fn conversion_failure_category_is_carried_on_failure() {
    let failure = ConvertFailure {
        error_message: "bad path data".into(),
        category: "parsing".into(),
    };
    assert_eq!(failure.category, "parsing");
}
