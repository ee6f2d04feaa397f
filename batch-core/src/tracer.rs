//! Structured error records and stage-timing telemetry.
//!
//! Grounded on `core/pipeline/error_reporter.py`'s `PipelineErrorReporter`
//! (category-keyed suggestion lists, `_detect_error_patterns`'s
//! repeated-message and cascade rules), translated into a `tracing`-friendly
//! shape: every `ErrorReport` is both returned to the caller and emitted as
//! a `tracing::error!`/`warn!` event, with the same
//! `warn!(job_id = %state.id, error = %err, ...)` structured-field style
//! used throughout `job.rs` and `msgraph.rs`. Stack traces are never
//! exposed to external callers.

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use strum_macros::{Display, EnumString};
use tracing::{error, warn};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize, Display, EnumString)]
#[strum(serialize_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    Low,
    Medium,
    High,
    Critical,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Display, EnumString)]
#[strum(serialize_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum ErrorCategory {
    Parsing,
    Analysis,
    Mapping,
    Embedding,
    Packaging,
    Configuration,
    Resource,
    Validation,
    Upload,
    Quota,
    Auth,
    Network,
    Unknown,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorContext {
    pub stage: Option<String>,
    pub operation: Option<String>,
    pub input_summary: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorReport {
    pub error_id: String,
    pub message: String,
    pub severity: Severity,
    pub category: ErrorCategory,
    pub context: ErrorContext,
    pub exception_type: String,
    /// Never exposed to external callers; only held in the Tracer's local
    /// history.
    #[serde(skip_serializing)]
    pub stack_trace: Option<String>,
    pub recovery_suggestions: Vec<String>,
    pub debug_info: serde_json::Value,
    pub related_errors: Vec<String>,
    pub occurred_at: DateTime<Utc>,
    pub repeated_error: Option<u32>,
    pub error_cascade: bool,
}

fn suggestions_for(category: ErrorCategory) -> Vec<String> {
    let raw: &[&str] = match category {
        ErrorCategory::Parsing => &["check input is well-formed SVG", "validate against the XML schema"],
        ErrorCategory::Analysis => &["inspect converter debug trace for the offending element"],
        ErrorCategory::Mapping => &["check shape/style mapping tables for unsupported constructs"],
        ErrorCategory::Embedding => &["check embedded raster/font resources for corruption"],
        ErrorCategory::Packaging => &["verify disk space and output path permissions"],
        ErrorCategory::Configuration => &["verify environment configuration and recognized options"],
        ErrorCategory::Resource => &["check memory/disk limits; retry with a smaller batch"],
        ErrorCategory::Validation => &["verify the request payload against the documented contract"],
        ErrorCategory::Upload => &["verify folder permissions and retry the upload"],
        ErrorCategory::Quota => &["wait for reset", "reduce concurrency"],
        ErrorCategory::Auth => &["re-authenticate", "verify credentials"],
        ErrorCategory::Network => &["check connectivity and retry", "verify DNS/firewall rules"],
        ErrorCategory::Unknown => &["consult the stack trace in the local error store"],
    };
    raw.iter().map(|s| s.to_string()).collect()
}

/// Per-session error history and cascade detection. One `Tracer` is created
/// per job invocation.
pub struct Tracer {
    history: Mutex<Vec<ErrorReport>>,
}

impl Default for Tracer {
    fn default() -> Self {
        Self::new()
    }
}

impl Tracer {
    pub fn new() -> Self {
        Self {
            history: Mutex::new(Vec::new()),
        }
    }

    /// Records and classifies an error, detecting repeated messages and
    /// cascades (>=3 errors within 1 second) against the session history so
    /// far, then emits a `tracing` event and returns the report.
    pub fn report(
        &self,
        message: impl Into<String>,
        severity: Severity,
        category: ErrorCategory,
        context: ErrorContext,
        exception_type: impl Into<String>,
        stack_trace: Option<String>,
        debug_info: serde_json::Value,
        occurred_at: DateTime<Utc>,
    ) -> ErrorReport {
        let message = message.into();
        let mut history = self.history.lock();

        let repeated_count = history.iter().filter(|r| r.message == message).count() as u32;
        let repeated_error = if repeated_count > 0 {
            Some(repeated_count + 1)
        } else {
            None
        };

        let cascade_window_start = occurred_at - chrono::Duration::seconds(1);
        let recent_count = history
            .iter()
            .filter(|r| r.occurred_at >= cascade_window_start)
            .count();
        let error_cascade = recent_count + 1 >= 3;

        let related_errors: Vec<String> = history
            .iter()
            .filter(|r| r.message == message || r.occurred_at >= cascade_window_start)
            .map(|r| r.error_id.clone())
            .collect();

        let report = ErrorReport {
            error_id: Uuid::new_v4().to_string(),
            message,
            severity,
            category,
            context,
            exception_type: exception_type.into(),
            stack_trace,
            recovery_suggestions: suggestions_for(category),
            debug_info,
            related_errors,
            occurred_at,
            repeated_error,
            error_cascade,
        };

        match severity {
            Severity::Critical | Severity::High => {
                error!(
                    error_id = %report.error_id,
                    category = %report.category,
                    repeated = ?report.repeated_error,
                    cascade = report.error_cascade,
                    "{}", report.message
                );
            }
            Severity::Medium | Severity::Low => {
                warn!(
                    error_id = %report.error_id,
                    category = %report.category,
                    repeated = ?report.repeated_error,
                    cascade = report.error_cascade,
                    "{}", report.message
                );
            }
        }

        history.push(report.clone());
        report
    }

    pub fn history(&self) -> Vec<ErrorReport> {
        self.history.lock().clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ctx() -> ErrorContext {
        ErrorContext {
            stage: Some("upload".into()),
            operation: Some("upload_file".into()),
            input_summary: None,
        }
    }

    #[test]
    fn flags_repeated_identical_messages() {
        let tracer = Tracer::new();
        let now = Utc::now();
        tracer.report("boom", Severity::High, ErrorCategory::Upload, ctx(), "Err", None, serde_json::json!({}), now);
        let second = tracer.report(
            "boom",
            Severity::High,
            ErrorCategory::Upload,
            ctx(),
            "Err",
            None,
            serde_json::json!({}),
            now,
        );
        assert_eq!(second.repeated_error, Some(2));
    }

    #[test]
    fn flags_cascade_at_three_errors_within_one_second() {
        let tracer = Tracer::new();
        let t0 = Utc::now();
        tracer.report("a", Severity::Low, ErrorCategory::Network, ctx(), "E", None, serde_json::json!({}), t0);
        tracer.report(
            "b",
            Severity::Low,
            ErrorCategory::Network,
            ctx(),
            "E",
            None,
            serde_json::json!({}),
            t0 + chrono::Duration::milliseconds(200),
        );
        let third = tracer.report(
            "c",
            Severity::Low,
            ErrorCategory::Network,
            ctx(),
            "E",
            None,
            serde_json::json!({}),
            t0 + chrono::Duration::milliseconds(400),
        );
        assert!(third.error_cascade);
    }

    #[test]
    fn no_cascade_when_errors_are_spaced_out() {
        let tracer = Tracer::new();
        let t0 = Utc::now();
        tracer.report("a", Severity::Low, ErrorCategory::Network, ctx(), "E", None, serde_json::json!({}), t0);
        let second = tracer.report(
            "b",
            Severity::Low,
            ErrorCategory::Network,
            ctx(),
            "E",
            None,
            serde_json::json!({}),
            t0 + chrono::Duration::seconds(5),
        );
        assert!(!second.error_cascade);
    }

    #[test]
    fn stack_trace_is_not_serialized() {
        let tracer = Tracer::new();
        let report = tracer.report(
            "boom",
            Severity::Critical,
            ErrorCategory::Unknown,
            ctx(),
            "Err",
            Some("at line 1".into()),
            serde_json::json!({}),
            Utc::now(),
        );
        let value = serde_json::to_value(&report).unwrap();
        assert!(value.get("stack_trace").is_none());
    }
}
