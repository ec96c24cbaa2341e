use axum::Json;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use ghost_protocol::{AppError, ErrorBody};

/// Wraps `ghost_protocol::AppError` so handlers can return it directly from axum
/// handlers via `?`. A thin newtype is needed because `IntoResponse` can only be
/// implemented here, not on the protocol crate's own type.
pub struct HttpError(pub AppError);

impl From<AppError> for HttpError {
    fn from(e: AppError) -> Self {
        Self(e)
    }
}

impl From<anyhow::Error> for HttpError {
    fn from(e: anyhow::Error) -> Self {
        Self(AppError::Other(e))
    }
}

impl IntoResponse for HttpError {
    fn into_response(self) -> Response {
        let status =
            StatusCode::from_u16(self.0.status_code()).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
        let body: ErrorBody = (&self.0).into();
        if status.is_server_error() {
            tracing::error!(error = %self.0, "request failed");
        } else {
            tracing::warn!(error = %self.0, "request rejected");
        }
        (status, Json(body)).into_response()
    }
}

pub type HttpResult<T> = Result<T, HttpError>;
