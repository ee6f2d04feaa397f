//! The per-job state machine sequencing download, convert, upload, preview,
//! and finalization.
//!
//! Grounded on `sharepoint-ingest/src/main.rs`'s
//! `spawn_job_worker`/`run_job_inner`/`wait_until_running` trio (a
//! `tokio::sync::watch::Receiver<JobCommand>` checked between stages) for
//! the cancellation-checkpoint shape, and on `core/batch/coordinator.py`'s
//! `coordinate_batch_workflow_clean_slate` for the exact stage sequencing,
//! status writes, and the `completed_upload_failed` branch when conversion
//! succeeds but upload does not.

use std::path::PathBuf;
use std::sync::Arc;

use chrono::Utc;
use tokio::sync::watch;
use tracing::{error, info};

use crate::converter::{ConvertOptions, Converter};
use crate::downloader::{DownloadRequest, Downloader};
use crate::error::AppError;
use crate::fileservice::FileService;
use crate::model::{DriveUploadStatus, Job, JobStatus, RateLimiterState, StageTiming, Trace};
use crate::rate_governor::RateGovernor;
use crate::store::StateStore;
use crate::tracer::{ErrorCategory, ErrorContext, Severity, Tracer};
use crate::uploader::{UploadManifestEntry, UploadOptions, Uploader};

/// Cooperative cancellation signal, checked between stages and inside every
/// remote wrapper. Mirrors `wait_until_running`'s polling pattern.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobCommand {
    Run,
    Cancel,
}

pub type CancelReceiver = watch::Receiver<JobCommand>;

#[derive(Debug)]
pub struct JobCancelled;

fn check_cancelled(rx: &CancelReceiver) -> Result<(), JobCancelled> {
    if *rx.borrow() == JobCommand::Cancel {
        Err(JobCancelled)
    } else {
        Ok(())
    }
}

pub struct CoordinatorOptions {
    pub urls: Vec<String>,
    pub download_timeout: std::time::Duration,
    pub max_download_size_bytes: u64,
    pub drive_integration_enabled: bool,
    pub folder_pattern: Option<String>,
    pub request_previews: bool,
}

#[derive(Debug, Clone)]
pub struct CoordinatorResult {
    pub job_id: String,
    pub status: JobStatus,
    pub conversion_error: Option<String>,
    pub upload_error: Option<String>,
}

pub struct Coordinator {
    store: Arc<dyn StateStore>,
    downloader: Arc<dyn Downloader>,
    file_service: Arc<dyn FileService>,
    /// Seed limits for a job's `RateLimiterState` the first time it is
    /// uploaded; thereafter each job's own persisted state is the source of
    /// truth, since the Rate Governor's budget is per-job, not shared
    /// process-wide.
    default_max_requests_per_minute: u32,
    default_max_concurrent_uploads: u32,
    converter: Arc<dyn Converter>,
    tracer: Arc<Tracer>,
}

impl Coordinator {
    pub fn new(
        store: Arc<dyn StateStore>,
        downloader: Arc<dyn Downloader>,
        file_service: Arc<dyn FileService>,
        default_max_requests_per_minute: u32,
        default_max_concurrent_uploads: u32,
        converter: Arc<dyn Converter>,
        tracer: Arc<Tracer>,
    ) -> Self {
        Self {
            store,
            downloader,
            file_service,
            default_max_requests_per_minute,
            default_max_concurrent_uploads,
            converter,
            tracer,
        }
    }

    /// Runs one full job invocation. `cancel_rx` is checked between every
    /// stage; cancellation aborts the current stage but still performs
    /// bounded cleanup (write final Job status `failed` with reason
    /// "cancelled").
    pub async fn run(
        &self,
        job_id: &str,
        options: CoordinatorOptions,
        cancel_rx: CancelReceiver,
    ) -> Result<CoordinatorResult, AppError> {
        if options.urls.is_empty() {
            return Err(AppError::ValidationError("url list must not be empty".into()));
        }

        let job_start = Utc::now();
        let mut trace = Trace::default();

        let mut job = self.store.get_job(job_id).await?;

        job.status = JobStatus::Processing;
        job.touch(Utc::now());
        job = self.store.put_job(job).await?;

        if check_cancelled(&cancel_rx).is_err() {
            return self.finish_cancelled(job, job_start, trace).await;
        }

        // download stage
        let download_start = Utc::now();
        let mut download = self
            .downloader
            .download(DownloadRequest {
                urls: options.urls.clone(),
                timeout: options.download_timeout,
                max_size_bytes: options.max_download_size_bytes,
                job_id: Some(job_id.to_string()),
            })
            .await
            .map_err(|e| AppError::DownloadError(e.to_string()))?;
        trace.parse = Some(StageTiming::new(download_start, Utc::now()));

        if !download.success {
            self.tracer.report(
                "no input URLs could be downloaded",
                Severity::High,
                ErrorCategory::Network,
                ErrorContext {
                    stage: Some("download".into()),
                    operation: Some("download".into()),
                    input_summary: Some(format!("{} urls", options.urls.len())),
                },
                "DownloadError",
                None,
                serde_json::json!({ "errors": download.errors.iter().map(|e| &e.message).collect::<Vec<_>>() }),
                Utc::now(),
            );
            return self
                .finish_failed(job, "no input URLs could be downloaded".into(), job_start, trace)
                .await;
        }

        if check_cancelled(&cancel_rx).is_err() {
            return self.finish_cancelled(job, job_start, trace).await;
        }

        // Persist the download's working directory past this invocation: it
        // will hold the converted artifact, which job-level recovery needs to
        // be able to re-upload after this call returns and scoped temporary
        // directories would otherwise already be gone.
        let work_dir: PathBuf = match download.temp_dir.take() {
            Some(dir) => dir.into_path(),
            None => PathBuf::from("."),
        };

        // convert stage (external collaborator)
        let convert_start = Utc::now();
        let output_path = work_dir.join("output.pptx");
        let convert_options = ConvertOptions {
            enable_debug_trace: true,
        };
        let convert_result = self
            .converter
            .convert(&download.file_paths, &output_path, &convert_options)
            .await;
        trace.packaging = Some(StageTiming::new(convert_start, Utc::now()));

        let convert_success = match convert_result {
            Ok(success) => success,
            Err(failure) => {
                self.tracer.report(
                    failure.error_message.clone(),
                    Severity::High,
                    ErrorCategory::Packaging,
                    ErrorContext {
                        stage: Some("convert".into()),
                        operation: Some("convert".into()),
                        input_summary: None,
                    },
                    "ConversionError",
                    None,
                    serde_json::json!({ "category": failure.category }),
                    Utc::now(),
                );
                return self
                    .finish_failed(job, failure.error_message, job_start, trace)
                    .await;
            }
        };

        if !options.drive_integration_enabled {
            job.status = JobStatus::Completed;
            job.touch(Utc::now());
            trace.total = Some(StageTiming::new(job_start, Utc::now()));
            job.set_trace(&trace);
            self.store.put_job(job.clone()).await?;
            return Ok(CoordinatorResult {
                job_id: job_id.to_string(),
                status: job.status,
                conversion_error: None,
                upload_error: None,
            });
        }

        if check_cancelled(&cancel_rx).is_err() {
            return self.finish_cancelled(job, job_start, trace).await;
        }

        job.status = JobStatus::Uploading;
        job.drive_integration_enabled = true;
        job.drive_upload_status = DriveUploadStatus::InProgress;
        job.touch(Utc::now());
        job = self.store.put_job(job).await?;

        let upload_start = Utc::now();
        let limiter_state = job.rate_limiter_state().unwrap_or_else(|| {
            RateLimiterState::new(self.default_max_requests_per_minute, self.default_max_concurrent_uploads)
        });
        let governor = Arc::new(RateGovernor::new(limiter_state));
        governor.adjust(Utc::now());
        let uploader = Uploader::new(self.store.clone(), self.file_service.clone(), governor.clone());
        let manifest = vec![UploadManifestEntry {
            local_path: convert_success.output_path.clone(),
            remote_name: format!("{job_id}.pptx"),
            original_filename: format!("{job_id}.pptx"),
        }];
        let upload_result = uploader
            .run(
                job_id,
                manifest,
                UploadOptions {
                    folder_pattern: options
                        .folder_pattern
                        .clone()
                        .unwrap_or_else(|| "SVG2PPTX-Batches/{date}/batch-{job_id}/".to_string()),
                    request_previews: options.request_previews,
                },
            )
            .await;
        trace.upload = Some(StageTiming::new(upload_start, Utc::now()));

        let upload_error = match upload_result {
            Ok(report) if report.success => None,
            Ok(report) => Some(report.errors.join("; ")),
            Err(e) => Some(e.to_string()),
        };

        trace.total = Some(StageTiming::new(job_start, Utc::now()));
        job.set_trace(&trace);
        let limiter_snapshot = governor.snapshot();
        job.set_rate_limiter_state(&limiter_snapshot);

        if let Some(ref err) = upload_error {
            self.tracer.report(
                err.clone(),
                Severity::High,
                ErrorCategory::Upload,
                ErrorContext {
                    stage: Some("upload".into()),
                    operation: Some("upload".into()),
                    input_summary: None,
                },
                "UploadError",
                None,
                serde_json::json!({}),
                Utc::now(),
            );
            if limiter_snapshot.quota_exceeded {
                // the upload stage is blocked on a quota reset, not failed outright;
                // the job stays in `uploading` until recovery or a future retry.
                job.status = JobStatus::Uploading;
                job.drive_upload_status = DriveUploadStatus::QuotaWait;
            } else {
                job.status = JobStatus::CompletedUploadFailed;
                job.drive_upload_status = DriveUploadStatus::Failed;
            }
        } else {
            job.status = JobStatus::Completed;
            job.drive_upload_status = DriveUploadStatus::Completed;
        }
        job.touch(Utc::now());
        self.store.put_job(job.clone()).await?;

        info!(job_id = %job_id, status = %job.status, "job invocation finished");

        Ok(CoordinatorResult {
            job_id: job_id.to_string(),
            status: job.status,
            conversion_error: None,
            upload_error,
        })
    }

    async fn finish_failed(
        &self,
        mut job: Job,
        message: String,
        job_start: chrono::DateTime<Utc>,
        mut trace: Trace,
    ) -> Result<CoordinatorResult, AppError> {
        trace.total = Some(StageTiming::new(job_start, Utc::now()));
        job.set_trace(&trace);
        job.status = JobStatus::Failed;
        job.touch(Utc::now());
        self.store.put_job(job.clone()).await?;
        error!(job_id = %job.job_id, error = %message, "job invocation failed");
        Ok(CoordinatorResult {
            job_id: job.job_id,
            status: job.status,
            conversion_error: Some(message),
            upload_error: None,
        })
    }

    async fn finish_cancelled(
        &self,
        mut job: Job,
        job_start: chrono::DateTime<Utc>,
        mut trace: Trace,
    ) -> Result<CoordinatorResult, AppError> {
        trace.total = Some(StageTiming::new(job_start, Utc::now()));
        job.set_trace(&trace);
        job.status = JobStatus::Failed;
        job.touch(Utc::now());
        self.store.put_job(job.clone()).await?;
        Err(AppError::Cancelled(job.job_id))
    }

    /// Job-level recovery: requires `job.status = failed`, requires
    /// `test_connection` to succeed first, retries each failed FileMeta, and
    /// on full success transitions `failed -> processing` and marks
    /// `drive_upload_status = completed` where appropriate.
    pub async fn recover(&self, job_id: &str) -> Result<CoordinatorResult, AppError> {
        let mut job = self.store.get_job(job_id).await?;
        if job.status != JobStatus::Failed {
            return Err(AppError::ValidationError(format!(
                "job {job_id} is not in failed state"
            )));
        }

        match self.file_service.test_connection().await {
            crate::fileservice::ConnectionStatus::Ok => {}
            _ => {
                return Err(AppError::ServiceUnavailable(
                    "test_connection failed; recovery aborted".into(),
                ))
            }
        }

        let failed_files = self
            .store
            .list_file_meta_by_status(job_id, crate::model::UploadStatus::Failed)
            .await?;

        let folder_meta = self.store.get_folder_meta(job_id).await.map_err(|_| {
            AppError::FolderCreationError(format!(
                "no folder recorded for job {job_id}; recovery cannot resolve an upload destination"
            ))
        })?;
        let folder_id = folder_meta.folder_id.clone().ok_or_else(|| {
            AppError::FolderCreationError(format!("folder metadata for job {job_id} has no folder_id yet"))
        })?;

        let mut all_succeeded = true;
        for mut file in failed_files {
            let local_path = match file.local_path.clone() {
                Some(p) => p,
                None => {
                    file.upload_error = Some("no recorded local artifact path; cannot retry upload".into());
                    all_succeeded = false;
                    self.store.put_file_meta(file).await?;
                    continue;
                }
            };
            let previous_error = file.upload_error.clone().unwrap_or_default();
            let mut succeeded = false;
            for k in 0..3u32 {
                let delay = crate::retry::single_file_retry_delay(&previous_error, k);
                if !delay.is_zero() {
                    tokio::time::sleep(delay).await;
                }
                match self
                    .file_service
                    .upload_file(std::path::Path::new(&local_path), &folder_id, &file.original_filename)
                    .await
                {
                    Ok(uploaded) => {
                        file.upload_status = crate::model::UploadStatus::Completed;
                        file.file_id = Some(uploaded.file_id);
                        file.file_url = Some(uploaded.file_url);
                        file.upload_error = None;
                        succeeded = true;
                        break;
                    }
                    Err(e) => {
                        file.upload_error = Some(e.to_string());
                    }
                }
            }
            if !succeeded {
                all_succeeded = false;
            }
            self.store.put_file_meta(file).await?;
        }

        if all_succeeded {
            job.status = JobStatus::Processing;
            if job.drive_integration_enabled {
                job.drive_upload_status = DriveUploadStatus::Completed;
            }
        }
        job.touch(Utc::now());
        self.store.put_job(job.clone()).await?;

        Ok(CoordinatorResult {
            job_id: job_id.to_string(),
            status: job.status,
            conversion_error: None,
            upload_error: if all_succeeded { None } else { Some("some files still failed after recovery".into()) },
        })
    }
}
