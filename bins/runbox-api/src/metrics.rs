// Prometheus metrics for finished runs

use axum::http::{header, StatusCode};
use axum::response::IntoResponse;
use lazy_static::lazy_static;
use prometheus::{
    register_histogram_vec, register_int_counter_vec, Encoder, HistogramVec, IntCounterVec, TextEncoder,
};
use runbox_common::types::RunRecord;
use runbox_sandbox::LanguageProfiles;
use tracing::error;

/// Label for languages outside the profile table
pub const OTHER_LANGUAGE: &str = "other";

lazy_static! {
    static ref KNOWN_LANGUAGES: LanguageProfiles = LanguageProfiles::builtin();
    pub static ref RUNS_TOTAL: IntCounterVec = register_int_counter_vec!(
        "runbox_runs_total",
        "Runs that reached a terminal status",
        &["language", "status"]
    )
    .unwrap();
    pub static ref RUN_DURATION_SECONDS: HistogramVec = register_histogram_vec!(
        "runbox_run_duration_seconds",
        "Wall-clock time from submission to terminal status",
        &["language"],
        vec![0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0, 30.0, 60.0]
    )
    .unwrap();
}

/// Profile id for known languages, `other` for anything else, so request
/// input cannot create new series.
pub fn language_label(language: &str) -> &'static str {
    KNOWN_LANGUAGES
        .get(language)
        .map(|profile| profile.language.as_str())
        .unwrap_or(OTHER_LANGUAGE)
}

pub fn observe_run(record: &RunRecord) {
    let language = language_label(&record.language);
    let status = record.status.to_string();
    RUNS_TOTAL
        .with_label_values(&[language, status.as_str()])
        .inc();

    if let Some(ms) = record.runtime_ms {
        RUN_DURATION_SECONDS
            .with_label_values(&[language])
            .observe(ms.max(0) as f64 / 1000.0);
    }
}

/// GET /metrics
pub async fn metrics_handler() -> impl IntoResponse {
    let encoder = TextEncoder::new();
    let mut buffer = Vec::new();

    if let Err(e) = encoder.encode(&prometheus::gather(), &mut buffer) {
        error!(error = %e, "Failed to encode metrics");
        return (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()).into_response();
    }

    (
        StatusCode::OK,
        [(header::CONTENT_TYPE, encoder.format_type().to_string())],
        buffer,
    )
        .into_response()
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use runbox_common::types::{ExecutionResult, RunFile, RunRequest};
    use uuid::Uuid;

    fn failed_record(language: &str) -> RunRecord {
        let request = RunRequest::new(language, vec![RunFile::new("a.txt", "")]);
        let mut record = RunRecord::queued(Uuid::new_v4(), &request, Utc::now());
        record.complete(&ExecutionResult::new(3, "", "boom"), Utc::now());
        record
    }

    fn series_count() -> usize {
        prometheus::gather()
            .iter()
            .filter(|family| family.get_name() == "runbox_runs_total")
            .map(|family| family.get_metric().len())
            .sum()
    }

    #[test]
    fn test_language_label() {
        assert_eq!(language_label("python"), "python");
        assert_eq!(language_label("Rust"), "rust");
        assert_eq!(language_label("cobol"), OTHER_LANGUAGE);
        assert_eq!(language_label(""), OTHER_LANGUAGE);
    }

    #[test]
    fn test_observe_counts_by_status() {
        let before = RUNS_TOTAL.with_label_values(&["go", "failed"]).get();
        observe_run(&failed_record("GO"));
        let after = RUNS_TOTAL.with_label_values(&["go", "failed"]).get();

        assert!(after >= before + 1);
    }

    #[test]
    fn test_unmapped_languages_share_one_series() {
        observe_run(&failed_record("cobol-warmup"));
        let before = series_count();

        for i in 0..20 {
            observe_run(&failed_record(&format!("cobol{}", i)));
        }

        assert_eq!(series_count(), before);
        assert!(RUNS_TOTAL.with_label_values(&[OTHER_LANGUAGE, "failed"]).get() >= 21);
    }
}
