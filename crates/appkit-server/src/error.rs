//! JSON error bodies for non-streaming failures.

use appkit_types::AppKitError;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;

/// Wraps [`AppKitError`] so handlers can return it with `?`.
#[derive(Debug)]
pub struct ApiError(pub AppKitError);

impl From<AppKitError> for ApiError {
    fn from(err: AppKitError) -> Self {
        ApiError(err)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status =
            StatusCode::from_u16(self.0.http_status()).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
        if status.is_server_error() {
            tracing::error!(error = %self.0, "Request failed");
        } else {
            tracing::debug!(error = %self.0, %status, "Request rejected");
        }
        (status, Json(self.0.to_payload())).into_response()
    }
}
