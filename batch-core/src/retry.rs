//! Retry wrapper for remote calls, and job-level recovery orchestration.
//!
//! The per-call loop shape (`for attempt in 0..=retries { ... sleep(delay)
//! }`) is grounded on `pipeline-runner/src/runner.rs`'s
//! `call_extract_with_retries`/`call_score_with_retries`. The job-level
//! recovery algorithm and its error-message-sniffing backoff rules are
//! grounded on `core/batch/drive_tasks.py`'s `retry_failed_drive_uploads` /
//! `_retry_single_file_upload` / `recover_batch_job_from_failure`.

use std::future::Future;
use std::time::Duration;

use tracing::warn;

use crate::fileservice::FileServiceError;
use crate::model::ErrorClass;

const BASE_DELAY: Duration = Duration::from_secs(5);
const MAX_ATTEMPTS: u32 = 3;

#[derive(Debug, Clone, Copy)]
pub enum RetryOutcome {
    /// Retry immediately (after an optional delay).
    Retry { delay: Duration },
    /// Hand off to the Rate Governor's quota backoff; not counted as a retry.
    DeferToQuota,
    /// Do not retry; surface immediately.
    Surface,
}

/// Decides what to do after a classified failure at attempt `k` (0-based).
pub fn classify_retry(class: ErrorClass, k: u32) -> RetryOutcome {
    match class {
        ErrorClass::Transient => RetryOutcome::Retry {
            delay: BASE_DELAY * k,
        },
        ErrorClass::RateLimited => RetryOutcome::Retry {
            delay: BASE_DELAY * 2u32.pow(k),
        },
        ErrorClass::QuotaExceeded => RetryOutcome::DeferToQuota,
        ErrorClass::Auth | ErrorClass::NotFound | ErrorClass::PermanentOther => RetryOutcome::Surface,
    }
}

/// Runs `op` with the per-call retry policy: up to `MAX_ATTEMPTS`
/// attempts, `k` in `{0,1,2}`. On `QuotaExceeded`, the caller is responsible
/// for handing off to the Rate Governor; this function returns the error
/// immediately in that case rather than sleeping, since a quota wait is the
/// governor's concern, not a counted retry.
pub async fn with_retry<T, F, Fut>(mut op: F) -> Result<T, FileServiceError>
where
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = Result<T, FileServiceError>>,
{
    let mut last_err = None;
    for k in 0..MAX_ATTEMPTS {
        match op(k).await {
            Ok(v) => return Ok(v),
            Err(err) => {
                match classify_retry(err.class, k) {
                    RetryOutcome::Retry { delay } => {
                        warn!(attempt = k, delay_ms = delay.as_millis() as u64, error = %err, "retrying after transient failure");
                        if !delay.is_zero() {
                            tokio::time::sleep(delay).await;
                        }
                        last_err = Some(err);
                    }
                    RetryOutcome::DeferToQuota | RetryOutcome::Surface => {
                        return Err(err);
                    }
                }
            }
        }
    }
    Err(last_err.expect("loop ran at least once"))
}

/// Error-class-aware backoff for a single-file retry during job-level
/// recovery: previous error mentioning "quota" backs off longer
/// (`base * 2^(k+1)`), "network"/"timeout" backs off linearly (`base * k`),
/// otherwise exponential (`base * 2^k`).
pub fn single_file_retry_delay(previous_error: &str, k: u32) -> Duration {
    let lower = previous_error.to_ascii_lowercase();
    if lower.contains("quota") {
        BASE_DELAY * 2u32.pow(k + 1)
    } else if lower.contains("network") || lower.contains("timeout") {
        BASE_DELAY * k
    } else {
        BASE_DELAY * 2u32.pow(k)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transient_schedule_is_linear() {
        assert_eq!(
            match classify_retry(ErrorClass::Transient, 0) {
                RetryOutcome::Retry { delay } => delay,
                _ => panic!("expected retry"),
            },
            Duration::from_secs(0)
        );
        assert_eq!(
            match classify_retry(ErrorClass::Transient, 2) {
                RetryOutcome::Retry { delay } => delay,
                _ => panic!("expected retry"),
            },
            Duration::from_secs(10)
        );
    }

    #[test]
    fn rate_limited_schedule_is_exponential() {
        assert_eq!(
            match classify_retry(ErrorClass::RateLimited, 2) {
                RetryOutcome::Retry { delay } => delay,
                _ => panic!("expected retry"),
            },
            Duration::from_secs(20)
        );
    }

    #[test]
    fn quota_exceeded_defers_rather_than_retries() {
        assert!(matches!(
            classify_retry(ErrorClass::QuotaExceeded, 0),
            RetryOutcome::DeferToQuota
        ));
    }

    #[test]
    fn auth_errors_never_retry() {
        assert!(matches!(classify_retry(ErrorClass::Auth, 0), RetryOutcome::Surface));
    }

    #[test]
    fn single_file_retry_backs_off_longer_for_quota_mentions() {
        let d = single_file_retry_delay("quota exceeded for this tenant", 0);
        assert_eq!(d, Duration::from_secs(10));
    }

    #[test]
    fn single_file_retry_is_linear_for_network_mentions() {
        let d = single_file_retry_delay("network timeout while connecting", 3);
        assert_eq!(d, Duration::from_secs(15));
    }

    #[test]
    fn single_file_retry_is_exponential_otherwise() {
        let d = single_file_retry_delay("permission denied", 2);
        assert_eq!(d, Duration::from_secs(20));
    }
}
