//! HTTP routes
//!
//! `GET /health`, `GET /status`, `POST /extract-features` (multipart field
//! `file`) and `POST /extract-features-batch` (repeated field `files`).

use std::sync::Arc;

use axum::extract::multipart::{Multipart, MultipartRejection};
use axum::extract::{DefaultBodyLimit, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde_json::json;
use tower_http::cors::CorsLayer;
use tracing::error;

use clipserve_core::{Error, ServerConfig};

use crate::gate::HealthReport;
use crate::service::{BatchResult, Extraction, ImageInput, InferenceService};
use crate::status::{ServerStatus, StatusReport};

pub const HEALTH_ROUTE: &str = "/health";
pub const STATUS_ROUTE: &str = "/status";
pub const EXTRACT_ROUTE: &str = "/extract-features";
pub const EXTRACT_BATCH_ROUTE: &str = "/extract-features-batch";

/// Shared state injected into every handler
pub struct AppState {
    pub service: InferenceService,
    pub status: ServerStatus,
}

impl AppState {
    pub fn new(service: InferenceService) -> Self {
        Self {
            service,
            status: ServerStatus::new(),
        }
    }
}

/// Errors rendered as `{"detail": ...}` bodies
#[derive(Debug)]
pub enum ApiError {
    /// Model not loaded yet (503)
    Unavailable,
    /// Decode or inference failure (500)
    Extraction(String),
    /// Malformed multipart body
    Multipart { status: StatusCode, detail: String },
    /// Required upload field absent (422)
    MissingField(&'static str),
    /// Worker task failed (500)
    Internal(String),
}

impl From<Error> for ApiError {
    fn from(err: Error) -> Self {
        match err {
            Error::NotReady => ApiError::Unavailable,
            // Decode and inference causes share one external message
            other => ApiError::Extraction(other.to_string()),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, detail) = match self {
            ApiError::Unavailable => (
                StatusCode::SERVICE_UNAVAILABLE,
                Error::NotReady.to_string(),
            ),
            ApiError::Extraction(cause) => (
                StatusCode::INTERNAL_SERVER_ERROR,
                format!("Feature extraction failed: {}", cause),
            ),
            ApiError::Multipart { status, detail } => (status, detail),
            ApiError::MissingField(field) => (
                StatusCode::UNPROCESSABLE_ENTITY,
                format!("Field required: {}", field),
            ),
            ApiError::Internal(cause) => (StatusCode::INTERNAL_SERVER_ERROR, cause),
        };
        (status, Json(json!({ "detail": detail }))).into_response()
    }
}

/// Build the application router
pub fn router(state: Arc<AppState>, server: &ServerConfig) -> Router {
    let router = Router::new()
        .route(HEALTH_ROUTE, get(health))
        .route(STATUS_ROUTE, get(status))
        .route(EXTRACT_ROUTE, post(extract_features))
        .route(EXTRACT_BATCH_ROUTE, post(extract_features_batch))
        .layer(DefaultBodyLimit::max(server.max_upload_bytes()))
        .with_state(state);

    if server.cors_permissive {
        router.layer(CorsLayer::very_permissive())
    } else {
        router
    }
}

async fn health(State(state): State<Arc<AppState>>) -> Json<HealthReport> {
    state.status.record_success(HEALTH_ROUTE);
    Json(state.service.gate().health())
}

async fn status(State(state): State<Arc<AppState>>) -> Json<StatusReport> {
    state.status.record_success(STATUS_ROUTE);
    let inference = state.service.gate().engine().ok().map(|e| e.metrics());
    Json(state.status.report(inference))
}

async fn extract_features(
    State(state): State<Arc<AppState>>,
    multipart: Result<Multipart, MultipartRejection>,
) -> Result<Json<Extraction>, ApiError> {
    let result = extract_single(&state, multipart).await;
    record(&state.status, EXTRACT_ROUTE, &result);
    result.map(Json)
}

async fn extract_features_batch(
    State(state): State<Arc<AppState>>,
    multipart: Result<Multipart, MultipartRejection>,
) -> Result<Json<BatchResult>, ApiError> {
    let result = extract_many(&state, multipart).await;
    record(&state.status, EXTRACT_BATCH_ROUTE, &result);
    result.map(Json)
}

async fn extract_single(
    state: &AppState,
    multipart: Result<Multipart, MultipartRejection>,
) -> Result<Extraction, ApiError> {
    ensure_ready(state)?;
    let mut inputs = read_files(multipart, "file").await?;
    if inputs.is_empty() {
        return Err(ApiError::MissingField("file"));
    }
    let input = inputs.swap_remove(0);

    let service = state.service.clone();
    let result = tokio::task::spawn_blocking(move || service.extract(&input))
        .await
        .map_err(|e| {
            error!(error = %e, "Inference task failed");
            ApiError::Internal(format!("Inference task failed: {}", e))
        })?;

    Ok(result?)
}

async fn extract_many(
    state: &AppState,
    multipart: Result<Multipart, MultipartRejection>,
) -> Result<BatchResult, ApiError> {
    ensure_ready(state)?;
    let inputs = read_files(multipart, "files").await?;
    if inputs.is_empty() {
        return Err(ApiError::MissingField("files"));
    }

    let service = state.service.clone();
    let result = tokio::task::spawn_blocking(move || service.extract_batch(&inputs))
        .await
        .map_err(|e| {
            error!(error = %e, "Batch inference task failed");
            ApiError::Internal(format!("Inference task failed: {}", e))
        })?;

    Ok(result?)
}

/// Reject before touching the body when the model is not loaded
fn ensure_ready(state: &AppState) -> Result<(), ApiError> {
    if state.service.gate().is_ready() {
        Ok(())
    } else {
        Err(ApiError::Unavailable)
    }
}

/// Collect every file uploaded under `field_name`, in request order
async fn read_files(
    multipart: Result<Multipart, MultipartRejection>,
    field_name: &str,
) -> Result<Vec<ImageInput>, ApiError> {
    let mut multipart = multipart.map_err(|rejection| ApiError::Multipart {
        status: rejection.status(),
        detail: rejection.body_text(),
    })?;

    let mut inputs = Vec::new();
    while let Some(field) = multipart.next_field().await.map_err(|e| ApiError::Multipart {
        status: e.status(),
        detail: format!("Multipart error: {}", e.body_text()),
    })? {
        if field.name() != Some(field_name) {
            continue;
        }
        let filename = field.file_name().map(str::to_string);
        let data = field.bytes().await.map_err(|e| ApiError::Multipart {
            status: e.status(),
            detail: format!("Failed to read upload: {}", e.body_text()),
        })?;
        inputs.push(ImageInput::new(filename, data.to_vec()));
    }

    Ok(inputs)
}

fn record<T>(status: &ServerStatus, route: &str, result: &Result<T, ApiError>) {
    match result {
        Ok(_) => status.record_success(route),
        Err(ApiError::Unavailable) => status.record_unavailable(route),
        Err(_) => status.record_error(route),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_mapping() {
        assert!(matches!(ApiError::from(Error::NotReady), ApiError::Unavailable));
        assert!(matches!(
            ApiError::from(Error::Decode("bad".into())),
            ApiError::Extraction(_)
        ));
        assert!(matches!(
            ApiError::from(Error::Inference("oom".into())),
            ApiError::Extraction(_)
        ));
    }

    #[test]
    fn test_status_codes() {
        assert_eq!(
            ApiError::Unavailable.into_response().status(),
            StatusCode::SERVICE_UNAVAILABLE
        );
        assert_eq!(
            ApiError::Extraction("x".into()).into_response().status(),
            StatusCode::INTERNAL_SERVER_ERROR
        );
        assert_eq!(
            ApiError::MissingField("file").into_response().status(),
            StatusCode::UNPROCESSABLE_ENTITY
        );
    }
}
