//! Per-job admission control: token-minute window, concurrency cap, and
//! quota-exceeded backoff.
//!
//! Grounded on `core/batch/drive_tasks.py`'s `check_rate_limit`,
//! `release_rate_limit_slot`, `handle_quota_exceeded_with_backoff`, and
//! `monitor_drive_api_usage` for the exact thresholds, multipliers, and
//! floors/caps. All admission state lives behind a `parking_lot::Mutex`, so
//! that two admissions can never both see the last remaining token.

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use parking_lot::Mutex;
use uuid::Uuid;

use crate::model::{ActiveOperation, QuotaErrorReason, RateLimiterState};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AdmissionDecision {
    Admitted,
    RejectedRateLimited,
    RejectedConcurrencyLimited,
    RejectedQuotaExceeded,
}

pub struct RateGovernor {
    state: Mutex<RateLimiterState>,
}

impl RateGovernor {
    pub fn new(state: RateLimiterState) -> Self {
        Self {
            state: Mutex::new(state),
        }
    }

    pub fn snapshot(&self) -> RateLimiterState {
        self.state.lock().clone()
    }

    /// Admits a plain request against the token-minute window (no
    /// concurrency slot consumed).
    pub fn admit_request(&self, now: DateTime<Utc>) -> AdmissionDecision {
        let mut state = self.state.lock();
        if let Some(decision) = check_quota_gate(&state, now) {
            return decision;
        }
        prune_window(&mut state, now);
        if state.request_timestamps.len() as u32 >= state.max_requests_per_minute {
            return AdmissionDecision::RejectedRateLimited;
        }
        state.request_timestamps.push_back(now);
        AdmissionDecision::Admitted
    }

    /// Admits an upload operation: consumes both a request-window token and
    /// a concurrency slot. Returns the operation id to release later.
    pub fn admit_upload(&self, now: DateTime<Utc>) -> Result<String, AdmissionDecision> {
        let mut state = self.state.lock();
        if let Some(decision) = check_quota_gate(&state, now) {
            return Err(decision);
        }
        prune_window(&mut state, now);
        if state.request_timestamps.len() as u32 >= state.max_requests_per_minute {
            return Err(AdmissionDecision::RejectedRateLimited);
        }
        if state.active_operations.len() as u32 >= state.max_concurrent_uploads {
            return Err(AdmissionDecision::RejectedConcurrencyLimited);
        }
        state.request_timestamps.push_back(now);
        let operation_id = Uuid::new_v4().to_string();
        state.active_operations.push(ActiveOperation {
            operation_id: operation_id.clone(),
            started_at: now,
        });
        Ok(operation_id)
    }

    pub fn release(&self, operation_id: &str) {
        let mut state = self.state.lock();
        state.active_operations.retain(|op| op.operation_id != operation_id);
    }

    /// Records a quota-exceeded response from the adapter and computes the
    /// reset time from the backoff table.
    pub fn handle_quota_exceeded(&self, reason: QuotaErrorReason, now: DateTime<Utc>) {
        let mut state = self.state.lock();
        let k = state.quota_retry_count;
        let delay = backoff_for_reason(reason, k);
        state.quota_exceeded = true;
        state.quota_reset_time = Some(now + delay);
        state.quota_error_reason = Some(reason);
        state.quota_retry_count = k.saturating_add(1);
    }

    pub fn clear_quota(&self) {
        let mut state = self.state.lock();
        state.quota_exceeded = false;
        state.quota_reset_time = None;
        state.quota_error_reason = None;
        state.quota_retry_count = 0;
    }

    /// Periodic dynamic adjustment (recommended cadence: every 5 seconds or
    /// every 100 admissions, whichever comes first). Utilization is judged
    /// over the trailing 60s window for requests, and the current
    /// concurrency snapshot for uploads.
    pub fn adjust(&self, now: DateTime<Utc>) {
        let mut state = self.state.lock();
        if state.quota_exceeded && state.quota_reset_time.map(|t| now < t).unwrap_or(false) {
            return;
        }
        prune_window(&mut state, now);

        let request_utilization =
            state.request_timestamps.len() as f64 / state.max_requests_per_minute.max(1) as f64;
        let concurrency_utilization =
            state.active_operations.len() as f64 / state.max_concurrent_uploads.max(1) as f64;
        let utilization = request_utilization.max(concurrency_utilization);

        if utilization > 0.8 {
            state.max_concurrent_uploads = ((state.max_concurrent_uploads as f64 * 0.8) as u32).max(1);
            state.max_requests_per_minute = ((state.max_requests_per_minute as f64 * 0.8) as u32).max(10);
        } else if utilization < 0.4 {
            state.max_concurrent_uploads = (((state.max_concurrent_uploads as f64 * 1.2) as u32)).min(20);
            state.max_requests_per_minute = (((state.max_requests_per_minute as f64 * 1.1) as u32)).min(150);
        }
    }
}

fn check_quota_gate(state: &RateLimiterState, now: DateTime<Utc>) -> Option<AdmissionDecision> {
    if state.quota_exceeded {
        if let Some(reset) = state.quota_reset_time {
            if now < reset {
                return Some(AdmissionDecision::RejectedQuotaExceeded);
            }
        }
    }
    None
}

fn prune_window(state: &mut RateLimiterState, now: DateTime<Utc>) {
    let window_start = now - ChronoDuration::seconds(60);
    while let Some(front) = state.request_timestamps.front() {
        if *front < window_start {
            state.request_timestamps.pop_front();
        } else {
            break;
        }
    }
}

/// Backoff table: reason -> base delay, `k` = consecutive quota-exceeded
/// occurrences for this job.
fn backoff_for_reason(reason: QuotaErrorReason, k: u32) -> ChronoDuration {
    match reason {
        QuotaErrorReason::DailyLimit => ChronoDuration::hours(24),
        QuotaErrorReason::RateLimit | QuotaErrorReason::UserRateLimit => {
            let minutes = (60u64.saturating_mul(1u64 << k.min(32))).min(480);
            ChronoDuration::minutes(minutes as i64)
        }
        QuotaErrorReason::UnknownQuota => ChronoDuration::hours(2),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rate_limit_rejects_once_window_is_full() {
        let governor = RateGovernor::new(RateLimiterState::new(2, 10));
        let now = Utc::now();
        assert_eq!(governor.admit_request(now), AdmissionDecision::Admitted);
        assert_eq!(governor.admit_request(now), AdmissionDecision::Admitted);
        assert_eq!(governor.admit_request(now), AdmissionDecision::RejectedRateLimited);
    }

    #[test]
    fn concurrency_cap_rejects_uploads_beyond_limit() {
        let governor = RateGovernor::new(RateLimiterState::new(100, 1));
        let now = Utc::now();
        let op = governor.admit_upload(now).expect("first upload admitted");
        assert_eq!(
            governor.admit_upload(now).unwrap_err(),
            AdmissionDecision::RejectedConcurrencyLimited
        );
        governor.release(&op);
        assert!(governor.admit_upload(now).is_ok());
    }

    #[test]
    fn quota_exceeded_computes_rate_limit_reset_for_k_zero() {
        let governor = RateGovernor::new(RateLimiterState::new(100, 10));
        let now = Utc::now();
        governor.handle_quota_exceeded(QuotaErrorReason::RateLimit, now);
        let state = governor.snapshot();
        assert!(state.quota_exceeded);
        let reset = state.quota_reset_time.unwrap();
        assert_eq!((reset - now).num_minutes(), 60);
        assert_eq!(
            governor.admit_request(now),
            AdmissionDecision::RejectedQuotaExceeded
        );
    }

    #[test]
    fn quota_backoff_caps_at_480_minutes() {
        assert_eq!(backoff_for_reason(QuotaErrorReason::RateLimit, 10).num_minutes(), 480);
    }

    #[test]
    fn daily_limit_backs_off_24_hours() {
        assert_eq!(backoff_for_reason(QuotaErrorReason::DailyLimit, 0).num_hours(), 24);
    }

    #[test]
    fn high_utilization_shrinks_limits_with_floors() {
        let governor = RateGovernor::new(RateLimiterState::new(10, 1));
        let now = Utc::now();
        for _ in 0..9 {
            governor.admit_request(now);
        }
        governor.adjust(now);
        let state = governor.snapshot();
        assert_eq!(state.max_concurrent_uploads, 1);
        assert_eq!(state.max_requests_per_minute, 10);
    }

    #[test]
    fn low_utilization_grows_limits_with_caps() {
        let governor = RateGovernor::new(RateLimiterState::new(140, 18));
        let now = Utc::now();
        governor.adjust(now);
        let state = governor.snapshot();
        assert_eq!(state.max_concurrent_uploads, 20);
        assert_eq!(state.max_requests_per_minute, 150);
    }
}
