//! The closed error taxonomy surfaced across every component boundary.
//!
//! Internal helpers are free to use `anyhow::Result` with rich `.context(...)`
//! chains; this type is what callers outside `batch-core` ever see, following
//! the same closed-taxonomy shape as `shared::error::AppError` but with the
//! full domain-specific variant set this crate requires.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum AppError {
    #[error("job not found: {0}")]
    JobNotFound(String),

    #[error("validation error: {0}")]
    ValidationError(String),

    #[error("http error: {0}")]
    HttpError(String),

    #[error("download error: {0}")]
    DownloadError(String),

    #[error("conversion error: {0}")]
    ConversionError(String),

    #[error("folder creation error: {0}")]
    FolderCreationError(String),

    #[error("upload error: {0}")]
    UploadError(String),

    #[error("preview error: {0}")]
    PreviewError(String),

    #[error("rate limit exceeded: {0}")]
    RateLimitExceeded(String),

    #[error("quota exceeded: {0}")]
    QuotaExceeded(String),

    #[error("auth error: {0}")]
    AuthError(String),

    #[error("service unavailable: {0}")]
    ServiceUnavailable(String),

    #[error("timeout: {0}")]
    Timeout(String),

    #[error("cancelled: {0}")]
    Cancelled(String),

    #[error("unexpected error: {0}")]
    UnexpectedError(String),
}

impl AppError {
    /// The stable `error_type` string carried in the user-visible error
    /// envelope alongside `error_message` and optional remediation hints.
    pub fn error_type(&self) -> &'static str {
        match self {
            AppError::JobNotFound(_) => "job_not_found",
            AppError::ValidationError(_) => "validation_error",
            AppError::HttpError(_) => "http_error",
            AppError::DownloadError(_) => "download_error",
            AppError::ConversionError(_) => "conversion_error",
            AppError::FolderCreationError(_) => "folder_creation_error",
            AppError::UploadError(_) => "upload_error",
            AppError::PreviewError(_) => "preview_error",
            AppError::RateLimitExceeded(_) => "rate_limit_exceeded",
            AppError::QuotaExceeded(_) => "quota_exceeded",
            AppError::AuthError(_) => "auth_error",
            AppError::ServiceUnavailable(_) => "service_unavailable",
            AppError::Timeout(_) => "timeout",
            AppError::Cancelled(_) => "cancelled",
            AppError::UnexpectedError(_) => "unexpected_error",
        }
    }

    /// Default remediation hints per error type, following the same
    /// category-keyed shape as `tracer::suggestions_for` but indexed by the
    /// closed error taxonomy rather than the Tracer's broader category set.
    pub fn remediation_hints(&self) -> &'static [&'static str] {
        match self {
            AppError::JobNotFound(_) => &["verify the job_id was created before enqueueing"],
            AppError::ValidationError(_) => &["check the request payload against the documented contract"],
            AppError::HttpError(_) => &["check connectivity and retry", "verify the source URL is reachable"],
            AppError::DownloadError(_) => &["verify the input is well-formed SVG within the configured size limit"],
            AppError::ConversionError(_) => &["inspect the converter debug trace for the offending element"],
            AppError::FolderCreationError(_) => &["verify folder permissions in the destination file service"],
            AppError::UploadError(_) => &["verify folder permissions and retry the upload"],
            AppError::PreviewError(_) => &["preview generation failures do not require action; the file upload still succeeded"],
            AppError::RateLimitExceeded(_) => &["reduce concurrency or wait for the request window to reset"],
            AppError::QuotaExceeded(_) => &["wait for reset", "reduce concurrency"],
            AppError::AuthError(_) => &["re-authenticate", "verify credentials"],
            AppError::ServiceUnavailable(_) => &["retry later; check the external service's status"],
            AppError::Timeout(_) => &["check connectivity and retry with a larger timeout"],
            AppError::Cancelled(_) => &["resubmit the job if cancellation was unintended"],
            AppError::UnexpectedError(_) => &["consult the stack trace in the local error store"],
        }
    }

    /// The user-visible error envelope: `error_message`, `error_type`, and
    /// remediation hints. No stack traces are exposed here; those stay in
    /// the Tracer's local history.
    pub fn to_envelope(&self) -> ErrorEnvelope {
        ErrorEnvelope {
            success: false,
            error_message: self.to_string(),
            error_type: self.error_type(),
            remediation_hints: self.remediation_hints().to_vec(),
        }
    }
}

#[derive(Debug, Clone, serde::Serialize)]
pub struct ErrorEnvelope {
    pub success: bool,
    pub error_message: String,
    pub error_type: &'static str,
    pub remediation_hints: Vec<&'static str>,
}

pub type Result<T> = std::result::Result<T, AppError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn envelope_never_carries_a_stack_trace_field() {
        let err = AppError::UploadError("backend rejected file".into());
        let envelope = err.to_envelope();
        let value = serde_json::to_value(&envelope).unwrap();
        assert!(value.get("stack_trace").is_none());
        assert_eq!(value["error_type"], "upload_error");
        assert!(!envelope.remediation_hints.is_empty());
    }
}
