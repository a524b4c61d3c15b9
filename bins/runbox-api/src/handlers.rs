// HTTP route handlers for the RunBox API

use axum::{
    extract::{rejection::JsonRejection, Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Json, Response},
};
use runbox_common::types::RunRequest;
use runbox_sandbox::LanguageProfile;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{info, warn};
use uuid::Uuid;

use crate::coordinator::MAX_RECENT_RUNS;
use crate::AppState;

#[derive(Debug, Deserialize)]
pub struct ListParams {
    pub limit: Option<usize>,
}

#[derive(Debug, Serialize)]
pub struct LanguageInfo {
    pub language: String,
    pub image: String,
    pub run_cmd: String,
    pub build_cmd: Option<String>,
    pub env: HashMap<String, String>,
}

impl From<&LanguageProfile> for LanguageInfo {
    fn from(profile: &LanguageProfile) -> Self {
        Self {
            language: profile.language.clone(),
            image: profile.image.clone(),
            run_cmd: profile.run_cmd.clone(),
            build_cmd: profile.build_cmd.clone(),
            env: profile.env.clone(),
        }
    }
}

fn error_response(status: StatusCode, message: impl Into<String>) -> Response {
    (status, Json(serde_json::json!({ "error": message.into() }))).into_response()
}

/// POST /runs - Execute a run and return its terminal record
pub async fn create_run(
    State(state): State<Arc<AppState>>,
    payload: Result<Json<RunRequest>, JsonRejection>,
) -> Response {
    let Json(request) = match payload {
        Ok(payload) => payload,
        Err(rejection) => {
            warn!(error = %rejection, "Rejected undecodable run request");
            return error_response(StatusCode::BAD_REQUEST, rejection.body_text());
        }
    };

    match state.coordinator.create(request).await {
        Ok(record) => (StatusCode::CREATED, Json(record)).into_response(),
        Err(e) if e.is_client_error() => {
            warn!(error = %e, "Rejected invalid run request");
            error_response(StatusCode::BAD_REQUEST, e.to_string())
        }
        Err(e) => error_response(StatusCode::INTERNAL_SERVER_ERROR, e.to_string()),
    }
}

/// GET /runs - Most recent runs first
pub async fn list_runs(State(state): State<Arc<AppState>>, Query(params): Query<ListParams>) -> impl IntoResponse {
    let limit = params.limit.unwrap_or(MAX_RECENT_RUNS);
    Json(state.coordinator.list_recent(limit).await)
}

/// GET /runs/:id - Fetch one run record
pub async fn get_run(State(state): State<Arc<AppState>>, Path(run_id): Path<String>) -> Response {
    let run_uuid = match Uuid::parse_str(&run_id) {
        Ok(id) => id,
        Err(_) => return error_response(StatusCode::BAD_REQUEST, "Invalid run ID format"),
    };

    match state.coordinator.get(&run_uuid).await {
        Some(record) => {
            info!(run_id = %run_uuid, status = %record.status, "Run record retrieved");
            (StatusCode::OK, Json(record)).into_response()
        }
        None => error_response(StatusCode::NOT_FOUND, format!("Run {} not found", run_uuid)),
    }
}

/// GET /languages - Builtin language profiles
pub async fn list_languages(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let languages: Vec<LanguageInfo> = state.profiles.iter().map(LanguageInfo::from).collect();
    Json(languages)
}

/// GET /health - Health check endpoint
pub async fn health_check() -> impl IntoResponse {
    (StatusCode::OK, "OK")
}
