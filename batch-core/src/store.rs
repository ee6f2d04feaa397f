//! Durable state for `Job`, `FolderMeta`, and `FileMeta`.
//!
//! Grounded on `job.rs::JobStore` (upsert via `ON CONFLICT ... DO UPDATE`
//! against a `deadpool_postgres::Pool`) for `PostgresStateStore`, and on
//! `job.rs::JobRegistry` (`Arc<RwLock<HashMap<..>>>`) for `InMemoryStateStore`.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use deadpool_postgres::Pool;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};

use crate::error::AppError;
use crate::model::{FileMeta, FolderMeta, Job, UploadStatus};

#[async_trait]
pub trait StateStore: Send + Sync {
    async fn put_job(&self, job: Job) -> Result<Job, AppError>;
    async fn get_job(&self, job_id: &str) -> Result<Job, AppError>;

    async fn put_folder_meta(&self, meta: FolderMeta) -> Result<FolderMeta, AppError>;
    async fn get_folder_meta(&self, job_id: &str) -> Result<FolderMeta, AppError>;

    async fn put_file_meta(&self, meta: FileMeta) -> Result<FileMeta, AppError>;
    async fn list_file_meta(&self, job_id: &str) -> Result<Vec<FileMeta>, AppError>;
    async fn list_file_meta_by_status(
        &self,
        job_id: &str,
        status: UploadStatus,
    ) -> Result<Vec<FileMeta>, AppError>;
}

/// In-memory `StateStore`, used across coordinator/uploader/retry tests so
/// they do not require a live database. Mirrors `job.rs::JobRegistry`'s
/// `Arc<RwLock<HashMap<..>>>` shape, guarded by `parking_lot`.
#[derive(Default, Clone)]
pub struct InMemoryStateStore {
    inner: Arc<RwLock<Inner>>,
}

#[derive(Default)]
struct Inner {
    jobs: HashMap<String, Job>,
    folders: HashMap<String, FolderMeta>,
    // keyed by (job_id, original_filename)
    files: HashMap<(String, String), FileMeta>,
}

impl InMemoryStateStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl StateStore for InMemoryStateStore {
    async fn put_job(&self, mut job: Job) -> Result<Job, AppError> {
        let mut inner = self.inner.write();
        job.touch(Utc::now());
        inner.jobs.insert(job.job_id.clone(), job.clone());
        Ok(job)
    }

    async fn get_job(&self, job_id: &str) -> Result<Job, AppError> {
        self.inner
            .read()
            .jobs
            .get(job_id)
            .cloned()
            .ok_or_else(|| AppError::JobNotFound(job_id.to_string()))
    }

    async fn put_folder_meta(&self, mut meta: FolderMeta) -> Result<FolderMeta, AppError> {
        let mut inner = self.inner.write();
        if !inner.jobs.contains_key(&meta.job_id) {
            return Err(AppError::JobNotFound(meta.job_id.clone()));
        }
        meta.updated_at = Utc::now();
        inner.folders.insert(meta.job_id.clone(), meta.clone());
        Ok(meta)
    }

    async fn get_folder_meta(&self, job_id: &str) -> Result<FolderMeta, AppError> {
        self.inner
            .read()
            .folders
            .get(job_id)
            .cloned()
            .ok_or_else(|| AppError::JobNotFound(job_id.to_string()))
    }

    async fn put_file_meta(&self, mut meta: FileMeta) -> Result<FileMeta, AppError> {
        let mut inner = self.inner.write();
        if !inner.jobs.contains_key(&meta.job_id) {
            return Err(AppError::JobNotFound(meta.job_id.clone()));
        }
        meta.updated_at = Utc::now();
        inner
            .files
            .insert((meta.job_id.clone(), meta.original_filename.clone()), meta.clone());
        Ok(meta)
    }

    async fn list_file_meta(&self, job_id: &str) -> Result<Vec<FileMeta>, AppError> {
        let inner = self.inner.read();
        let mut out: Vec<FileMeta> = inner
            .files
            .values()
            .filter(|f| f.job_id == job_id)
            .cloned()
            .collect();
        out.sort_by_key(|f| f.created_at);
        Ok(out)
    }

    async fn list_file_meta_by_status(
        &self,
        job_id: &str,
        status: UploadStatus,
    ) -> Result<Vec<FileMeta>, AppError> {
        Ok(self
            .list_file_meta(job_id)
            .await?
            .into_iter()
            .filter(|f| f.upload_status == status)
            .collect())
    }
}

/// PostgreSQL-backed `StateStore`. Every mutator is a single upsert
/// statement against `batch_jobs` / `batch_folder_meta` / `batch_file_meta`,
/// run through a pooled connection so the write itself is atomic; the
/// logical foreign-key check (job must exist) is enforced here rather than
/// left to the database.
pub struct PostgresStateStore {
    pool: Pool,
}

impl PostgresStateStore {
    pub fn new(pool: Pool) -> Self {
        Self { pool }
    }

    async fn conn(&self) -> Result<deadpool_postgres::Object, AppError> {
        self.pool
            .get()
            .await
            .map_err(|e| AppError::ServiceUnavailable(format!("postgres pool: {e}")))
    }
}

#[async_trait]
impl StateStore for PostgresStateStore {
    async fn put_job(&self, mut job: Job) -> Result<Job, AppError> {
        job.touch(Utc::now());
        let client = self.conn().await?;
        client
            .execute(
                "INSERT INTO batch_jobs (job_id, status, total_files, drive_integration_enabled, \
                 drive_upload_status, folder_pattern, metadata, created_at, updated_at) \
                 VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9) \
                 ON CONFLICT (job_id) DO UPDATE SET \
                 status = EXCLUDED.status, \
                 total_files = EXCLUDED.total_files, \
                 drive_integration_enabled = EXCLUDED.drive_integration_enabled, \
                 drive_upload_status = EXCLUDED.drive_upload_status, \
                 folder_pattern = EXCLUDED.folder_pattern, \
                 metadata = EXCLUDED.metadata, \
                 updated_at = EXCLUDED.updated_at",
                &[
                    &job.job_id,
                    &job.status.to_string(),
                    &(job.total_files as i32),
                    &job.drive_integration_enabled,
                    &job.drive_upload_status.to_string(),
                    &job.folder_pattern,
                    &job.metadata,
                    &job.created_at,
                    &job.updated_at,
                ],
            )
            .await
            .map_err(|e| AppError::ServiceUnavailable(format!("put_job: {e}")))?;
        Ok(job)
    }

    async fn get_job(&self, job_id: &str) -> Result<Job, AppError> {
        let client = self.conn().await?;
        let row = client
            .query_opt(
                "SELECT job_id, status, total_files, drive_integration_enabled, \
                 drive_upload_status, folder_pattern, metadata, created_at, updated_at \
                 FROM batch_jobs WHERE job_id = $1",
                &[&job_id],
            )
            .await
            .map_err(|e| AppError::ServiceUnavailable(format!("get_job: {e}")))?
            .ok_or_else(|| AppError::JobNotFound(job_id.to_string()))?;

        let status: String = row.get("status");
        let drive_upload_status: String = row.get("drive_upload_status");
        Ok(Job {
            job_id: row.get("job_id"),
            status: status.parse().map_err(|_| {
                AppError::UnexpectedError(format!("corrupt job status: {status}"))
            })?,
            total_files: row.get::<_, i32>("total_files") as u32,
            drive_integration_enabled: row.get("drive_integration_enabled"),
            drive_upload_status: drive_upload_status.parse().map_err(|_| {
                AppError::UnexpectedError(format!("corrupt drive_upload_status: {drive_upload_status}"))
            })?,
            folder_pattern: row.get("folder_pattern"),
            created_at: row.get("created_at"),
            updated_at: row.get("updated_at"),
            metadata: row.get("metadata"),
        })
    }

    async fn put_folder_meta(&self, mut meta: FolderMeta) -> Result<FolderMeta, AppError> {
        self.get_job(&meta.job_id).await?;
        meta.updated_at = Utc::now();
        let client = self.conn().await?;
        client
            .execute(
                "INSERT INTO batch_folder_meta (job_id, folder_id, folder_url, created_at, updated_at) \
                 VALUES ($1, $2, $3, $4, $5) \
                 ON CONFLICT (job_id) DO UPDATE SET \
                 folder_id = EXCLUDED.folder_id, \
                 folder_url = EXCLUDED.folder_url, \
                 updated_at = EXCLUDED.updated_at",
                &[
                    &meta.job_id,
                    &meta.folder_id,
                    &meta.folder_url,
                    &meta.created_at,
                    &meta.updated_at,
                ],
            )
            .await
            .map_err(|e| AppError::ServiceUnavailable(format!("put_folder_meta: {e}")))?;
        Ok(meta)
    }

    async fn get_folder_meta(&self, job_id: &str) -> Result<FolderMeta, AppError> {
        let client = self.conn().await?;
        let row = client
            .query_opt(
                "SELECT job_id, folder_id, folder_url, created_at, updated_at \
                 FROM batch_folder_meta WHERE job_id = $1",
                &[&job_id],
            )
            .await
            .map_err(|e| AppError::ServiceUnavailable(format!("get_folder_meta: {e}")))?
            .ok_or_else(|| AppError::JobNotFound(job_id.to_string()))?;
        Ok(FolderMeta {
            job_id: row.get("job_id"),
            folder_id: row.get("folder_id"),
            folder_url: row.get("folder_url"),
            created_at: row.get("created_at"),
            updated_at: row.get("updated_at"),
        })
    }

    async fn put_file_meta(&self, mut meta: FileMeta) -> Result<FileMeta, AppError> {
        self.get_job(&meta.job_id).await?;
        meta.updated_at = Utc::now();
        let client = self.conn().await?;
        client
            .execute(
                "INSERT INTO batch_file_meta \
                 (job_id, original_filename, file_id, file_url, preview_url, upload_status, \
                  upload_error, local_path, created_at, updated_at) \
                 VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10) \
                 ON CONFLICT (job_id, original_filename) DO UPDATE SET \
                 file_id = EXCLUDED.file_id, \
                 file_url = EXCLUDED.file_url, \
                 preview_url = EXCLUDED.preview_url, \
                 upload_status = EXCLUDED.upload_status, \
                 upload_error = EXCLUDED.upload_error, \
                 local_path = EXCLUDED.local_path, \
                 updated_at = EXCLUDED.updated_at",
                &[
                    &meta.job_id,
                    &meta.original_filename,
                    &meta.file_id,
                    &meta.file_url,
                    &meta.preview_url,
                    &meta.upload_status.to_string(),
                    &meta.upload_error,
                    &meta.local_path,
                    &meta.created_at,
                    &meta.updated_at,
                ],
            )
            .await
            .map_err(|e| AppError::ServiceUnavailable(format!("put_file_meta: {e}")))?;
        Ok(meta)
    }

    async fn list_file_meta(&self, job_id: &str) -> Result<Vec<FileMeta>, AppError> {
        let client = self.conn().await?;
        let rows = client
            .query(
                "SELECT job_id, original_filename, file_id, file_url, preview_url, \
                 upload_status, upload_error, local_path, created_at, updated_at \
                 FROM batch_file_meta WHERE job_id = $1 ORDER BY created_at ASC",
                &[&job_id],
            )
            .await
            .map_err(|e| AppError::ServiceUnavailable(format!("list_file_meta: {e}")))?;
        rows.into_iter().map(row_to_file_meta).collect()
    }

    async fn list_file_meta_by_status(
        &self,
        job_id: &str,
        status: UploadStatus,
    ) -> Result<Vec<FileMeta>, AppError> {
        let client = self.conn().await?;
        let rows = client
            .query(
                "SELECT job_id, original_filename, file_id, file_url, preview_url, \
                 upload_status, upload_error, local_path, created_at, updated_at \
                 FROM batch_file_meta WHERE job_id = $1 AND upload_status = $2 ORDER BY created_at ASC",
                &[&job_id, &status.to_string()],
            )
            .await
            .map_err(|e| AppError::ServiceUnavailable(format!("list_file_meta_by_status: {e}")))?;
        rows.into_iter().map(row_to_file_meta).collect()
    }
}

/// The Job ingress's `progress(job_id)` entry point: computed purely from
/// `FileMeta` counts, no separate counters tracked.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct JobProgress {
    pub total: u32,
    pub completed: u32,
    pub failed: u32,
    pub pending: u32,
    pub percent: f64,
}

pub async fn progress(store: &dyn StateStore, job_id: &str) -> Result<JobProgress, AppError> {
    let files = store.list_file_meta(job_id).await?;
    let total = files.len() as u32;
    let completed = files.iter().filter(|f| f.upload_status == UploadStatus::Completed).count() as u32;
    let failed = files.iter().filter(|f| f.upload_status == UploadStatus::Failed).count() as u32;
    let pending = files
        .iter()
        .filter(|f| matches!(f.upload_status, UploadStatus::Pending | UploadStatus::InProgress))
        .count() as u32;
    let percent = if total == 0 {
        0.0
    } else {
        (completed as f64 / total as f64) * 100.0
    };
    Ok(JobProgress {
        total,
        completed,
        failed,
        pending,
        percent,
    })
}

fn row_to_file_meta(row: tokio_postgres::Row) -> Result<FileMeta, AppError> {
    let upload_status: String = row.get("upload_status");
    Ok(FileMeta {
        job_id: row.get("job_id"),
        original_filename: row.get("original_filename"),
        file_id: row.get("file_id"),
        file_url: row.get("file_url"),
        preview_url: row.get("preview_url"),
        upload_status: upload_status
            .parse()
            .map_err(|_| AppError::UnexpectedError(format!("corrupt upload_status: {upload_status}")))?,
        upload_error: row.get("upload_error"),
        local_path: row.get("local_path"),
        created_at: row.get("created_at"),
        updated_at: row.get("updated_at"),
    })
}
