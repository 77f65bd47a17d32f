use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use hookgate_core::error::GateError;
use hookgate_core::types::ReasonCode;

// ---------------------------------------------------------------------------
// AppError: unified error type for HTTP responses
// ---------------------------------------------------------------------------

/// Unified error type for HTTP responses.
///
/// The body is always `{rejected, reason, message}` where `message` is the
/// fixed text for the reason code. Error details stay in the server log.
#[derive(Debug)]
pub struct AppError(pub anyhow::Error);

impl AppError {
    /// Construct a 400 `schema_invalid` error.
    pub fn bad_request(msg: impl Into<String>) -> Self {
        Self(GateError::SchemaInvalid(msg.into()).into())
    }

    pub fn reason(&self) -> ReasonCode {
        self.0
            .downcast_ref::<GateError>()
            .map(GateError::reason)
            .unwrap_or(ReasonCode::Internal)
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let reason = self.reason();
        let status =
            StatusCode::from_u16(reason.http_status()).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);

        if status.is_server_error() {
            tracing::error!(reason = %reason, error = %format!("{:#}", self.0), "request failed");
        } else {
            tracing::debug!(reason = %reason, error = %self.0, "request rejected");
        }

        let body = serde_json::json!({
            "rejected": true,
            "reason": reason.as_str(),
            "message": reason.public_message(),
        });
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
