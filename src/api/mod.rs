//! HTTP surface consumed by the UI: admin pipeline control, hybrid search,
//! and read-only conversation views.

pub mod admin;
pub mod conversations;
pub mod search;

use crate::context::AppContext;
use crate::error::{Error, PipelineError};
use axum::Json;
use axum::Router;
use axum::extract::DefaultBodyLimit;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use std::sync::Arc;
use tower_http::cors::CorsLayer;

/// Build the service router.
pub fn router(context: Arc<AppContext>) -> Router {
    Router::new()
        .route("/admin/upload", post(admin::upload))
        .route("/admin/import-status", get(admin::import_status_all))
        .route("/admin/import/{job_id}/status", get(admin::import_status))
        .route("/admin/import/{job_id}/start", post(admin::start_import))
        .route("/admin/import/{job_id}/cancel", post(admin::cancel_import))
        .route("/admin/restart-import/{job_id}", post(admin::restart_import))
        .route("/admin/clear-all", post(admin::clear_all))
        .route("/admin/clear", post(admin::clear))
        .route("/api/v1/search", post(search::search))
        .route("/conversations", get(conversations::list))
        .route("/conversations/{id}", get(conversations::detail))
        // Workspace exports run to gigabytes; the default multipart cap
        // would reject them.
        .layer(DefaultBodyLimit::disable())
        .layer(CorsLayer::permissive())
        .with_state(context)
}

/// Error wrapper mapping component failures onto HTTP responses.
pub struct ApiError {
    status: StatusCode,
    message: String,
}

impl ApiError {
    pub fn bad_request(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::BAD_REQUEST,
            message: message.into(),
        }
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::NOT_FOUND,
            message: message.into(),
        }
    }
}

impl From<Error> for ApiError {
    fn from(error: Error) -> Self {
        let status = match &error {
            Error::Pipeline(PipelineError::JobNotFound(_)) => StatusCode::NOT_FOUND,
            Error::Pipeline(
                PipelineError::InvalidTransition { .. } | PipelineError::AlreadyRunning(_),
            ) => StatusCode::CONFLICT,
            Error::Config(_) => StatusCode::BAD_REQUEST,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };
        Self {
            status,
            message: error.to_string(),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        if self.status.is_server_error() {
            tracing::error!(error = %self.message, "request failed");
        }
        (
            self.status,
            Json(serde_json::json!({"error": self.message})),
        )
            .into_response()
    }
}
