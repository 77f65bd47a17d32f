use axum::{
    extract::{Request, State},
    middleware::Next,
    response::{IntoResponse, Response},
};
use hookgate_core::auth::bearer_token;
use hookgate_core::error::GateError;
use subtle::ConstantTimeEq;

use crate::error::AppError;
use crate::state::AppState;

/// Axum middleware guarding the admin API with a bearer token.
///
/// Auth flow (evaluated in order):
/// 1. No admin token configured → 403 `auth_not_configured` (fail closed)
/// 2. Missing or malformed `Authorization: Bearer` header → 401
/// 3. Token mismatch (constant-time) → 401
/// 4. Otherwise → passthrough
///
/// The token is read from the live config snapshot, so a reload that
/// rotates it takes effect on the next request.
pub async fn admin_auth(State(app): State<AppState>, req: Request, next: Next) -> Response {
    let token = match app.pipeline.admin_token() {
        Ok(Some(token)) => token,
        Ok(None) => {
            tracing::warn!(path = %req.uri().path(), "admin call refused: no admin token configured");
            return AppError(GateError::AuthNotConfigured.into()).into_response();
        }
        Err(e) => return AppError(e.into()).into_response(),
    };

    let presented = req
        .headers()
        .get(axum::http::header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(bearer_token);

    match presented {
        Some(candidate) if bool::from(candidate.as_bytes().ct_eq(token.as_bytes())) => next.run(req).await,
        Some(_) => {
            tracing::info!(path = %req.uri().path(), "admin call refused: bad token");
            AppError(GateError::Unauthorized("admin token mismatch".into()).into()).into_response()
        }
        None => AppError(GateError::Unauthorized("missing admin bearer token".into()).into()).into_response(),
    }
}
