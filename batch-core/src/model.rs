//! Core data model: `Job`, `FolderMeta`, `FileMeta`, and the two schemas
//! embedded in `Job.metadata` (`RateLimiterState`, `Trace`).
//!
//! Grounded on `core/batch/models.py` for field names, invariants, and
//! lifecycle transitions, and on `job.rs::JobState`/`JobStatus` for the Rust
//! shape (plain structs with `updated_at`-bumping mutators, enums with
//! `as_str`/`FromStr`).

use std::collections::VecDeque;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use strum_macros::{Display, EnumString};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Display, EnumString)]
#[strum(serialize_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Created,
    Processing,
    Uploading,
    Completed,
    CompletedUploadFailed,
    Failed,
    Archived,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Display, EnumString)]
#[strum(serialize_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum DriveUploadStatus {
    NotRequested,
    Pending,
    InProgress,
    Completed,
    Failed,
    QuotaWait,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Display, EnumString)]
#[strum(serialize_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum UploadStatus {
    Pending,
    InProgress,
    Completed,
    Failed,
}

/// Classified quota-exceeded reason, carried on `RateLimiterState` and used
/// to index the backoff table in `rate_governor`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Display, EnumString)]
#[strum(serialize_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum QuotaErrorReason {
    DailyLimit,
    RateLimit,
    UserRateLimit,
    UnknownQuota,
}

/// Closed classification of a `FileService` failure, the basis for retry
/// policy selection in `retry`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Display, EnumString)]
#[strum(serialize_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum ErrorClass {
    Transient,
    RateLimited,
    QuotaExceeded,
    Auth,
    NotFound,
    PermanentOther,
}

/// `RateLimiterState`, embedded in `Job.metadata["rate_limiter"]`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RateLimiterState {
    pub max_requests_per_minute: u32,
    pub max_concurrent_uploads: u32,
    /// Timestamps of admitted requests within the trailing 60s window.
    pub request_timestamps: VecDeque<DateTime<Utc>>,
    /// In-flight operations admitted under the concurrency budget.
    pub active_operations: Vec<ActiveOperation>,
    pub quota_exceeded: bool,
    pub quota_reset_time: Option<DateTime<Utc>>,
    pub quota_error_reason: Option<QuotaErrorReason>,
    /// Consecutive quota-exceeded occurrences, used as `k` in the backoff
    /// table (`min(60 * 2^k, 480)` minutes).
    pub quota_retry_count: u32,
}

impl RateLimiterState {
    pub fn new(max_requests_per_minute: u32, max_concurrent_uploads: u32) -> Self {
        Self {
            max_requests_per_minute,
            max_concurrent_uploads,
            request_timestamps: VecDeque::new(),
            active_operations: Vec::new(),
            quota_exceeded: false,
            quota_reset_time: None,
            quota_error_reason: None,
            quota_retry_count: 0,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ActiveOperation {
    pub operation_id: String,
    pub started_at: DateTime<Utc>,
}

/// Per-stage timings aggregated into `Job.metadata["trace"]` by the
/// Coordinator.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Trace {
    pub parse: Option<StageTiming>,
    pub analyze: Option<StageTiming>,
    pub mapping: Option<StageTiming>,
    pub embedding: Option<StageTiming>,
    pub packaging: Option<StageTiming>,
    pub upload: Option<StageTiming>,
    pub preview: Option<StageTiming>,
    pub total: Option<StageTiming>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StageTiming {
    pub started_at: DateTime<Utc>,
    pub ended_at: DateTime<Utc>,
    pub duration_ms: i64,
}

impl StageTiming {
    pub fn new(started_at: DateTime<Utc>, ended_at: DateTime<Utc>) -> Self {
        let duration_ms = (ended_at - started_at).num_milliseconds();
        Self {
            started_at,
            ended_at,
            duration_ms,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Job {
    pub job_id: String,
    pub status: JobStatus,
    pub total_files: u32,
    pub drive_integration_enabled: bool,
    pub drive_upload_status: DriveUploadStatus,
    pub folder_pattern: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    /// Opaque to external callers; `rate_limiter` and `trace` are the two
    /// internally-enforced schemas.
    pub metadata: serde_json::Value,
}

impl Job {
    pub fn new(job_id: impl Into<String>, total_files: u32, now: DateTime<Utc>) -> Self {
        Self {
            job_id: job_id.into(),
            status: JobStatus::Created,
            total_files,
            drive_integration_enabled: false,
            drive_upload_status: DriveUploadStatus::NotRequested,
            folder_pattern: None,
            created_at: now,
            updated_at: now,
            metadata: serde_json::json!({}),
        }
    }

    pub fn rate_limiter_state(&self) -> Option<RateLimiterState> {
        self.metadata
            .get("rate_limiter")
            .and_then(|v| serde_json::from_value(v.clone()).ok())
    }

    pub fn set_rate_limiter_state(&mut self, state: &RateLimiterState) {
        if let serde_json::Value::Object(ref mut map) = self.metadata {
            map.insert(
                "rate_limiter".to_string(),
                serde_json::to_value(state).expect("RateLimiterState always serializes"),
            );
        }
    }

    pub fn trace(&self) -> Trace {
        self.metadata
            .get("trace")
            .and_then(|v| serde_json::from_value(v.clone()).ok())
            .unwrap_or_default()
    }

    pub fn set_trace(&mut self, trace: &Trace) {
        if let serde_json::Value::Object(ref mut map) = self.metadata {
            map.insert(
                "trace".to_string(),
                serde_json::to_value(trace).expect("Trace always serializes"),
            );
        }
    }

    pub fn touch(&mut self, now: DateTime<Utc>) {
        self.updated_at = now;
    }

    /// Terminal statuses are write-locked except by recovery (`failed -> processing`).
    pub fn is_terminal(&self) -> bool {
        matches!(
            self.status,
            JobStatus::Completed | JobStatus::CompletedUploadFailed | JobStatus::Failed | JobStatus::Archived
        )
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FolderMeta {
    pub job_id: String,
    pub folder_id: Option<String>,
    pub folder_url: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl FolderMeta {
    pub fn new(job_id: impl Into<String>, now: DateTime<Utc>) -> Self {
        Self {
            job_id: job_id.into(),
            folder_id: None,
            folder_url: None,
            created_at: now,
            updated_at: now,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FileMeta {
    pub job_id: String,
    pub original_filename: String,
    pub file_id: Option<String>,
    pub file_url: Option<String>,
    pub preview_url: Option<String>,
    pub upload_status: UploadStatus,
    pub upload_error: Option<String>,
    /// On-disk path of the converted artifact this entry uploads, recorded so
    /// job-level recovery can re-upload the real file instead of guessing one
    /// from the display name.
    pub local_path: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl FileMeta {
    pub fn new(job_id: impl Into<String>, original_filename: impl Into<String>, now: DateTime<Utc>) -> Self {
        Self {
            job_id: job_id.into(),
            original_filename: original_filename.into(),
            file_id: None,
            file_url: None,
            preview_url: None,
            upload_status: UploadStatus::Pending,
            upload_error: None,
            local_path: None,
            created_at: now,
            updated_at: now,
        }
    }
}
