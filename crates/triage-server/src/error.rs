use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use triage_core::TriageError;

// ---------------------------------------------------------------------------
// AppError: unified error type for HTTP responses
// ---------------------------------------------------------------------------

/// Unified error type for HTTP responses.
#[derive(Debug)]
pub struct AppError(pub anyhow::Error);

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let status = match self.0.downcast_ref::<TriageError>() {
            Some(TriageError::UnknownCollection(_) | TriageError::UnknownRule(_)) => {
                StatusCode::NOT_FOUND
            }
            Some(
                TriageError::Config(_)
                | TriageError::InvalidRegex { .. }
                | TriageError::InvalidRange(_)
                | TriageError::InvalidDuration { .. }
                | TriageError::InvalidRepo(_),
            ) => StatusCode::BAD_REQUEST,
            Some(TriageError::RateLimited { .. }) => StatusCode::SERVICE_UNAVAILABLE,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };
        if status.is_server_error() {
            tracing::error!(error = %self.0, "request failed");
        }

        let body = serde_json::json!({ "error": self.0.to_string() });
        (status, axum::Json(body)).into_response()
    }
}

impl<E> From<E> for AppError
where
    E: Into<anyhow::Error>,
{
    fn from(err: E) -> Self {
        Self(err.into())
    }
}
