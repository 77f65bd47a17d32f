use axum::body::Bytes;
use axum::extract::{Path, Query, State};
use axum::http::{HeaderMap, StatusCode};
use axum::Json;
use hookgate_core::auth::Envelope;
use hookgate_core::pipeline::{SubmitResponse, ValidationReport};
use hookgate_core::types::Lane;
use serde::Deserialize;

use crate::error::AppError;
use crate::state::AppState;

#[derive(Debug, Default, Deserialize)]
pub struct WebhookQuery {
    /// Named mapping profile applied before normalization.
    pub mapping: Option<String>,
}

fn envelope(lane: Lane, headers: &HeaderMap, query: WebhookQuery, body: Bytes) -> Envelope {
    let mut env = Envelope::new(lane, body).with_mapping(query.mapping);
    for (name, value) in headers {
        if let Ok(v) = value.to_str() {
            env.insert_header(name.as_str(), v);
        }
    }
    env
}

async fn submit_on(
    app: AppState,
    env: Envelope,
) -> Result<(StatusCode, Json<SubmitResponse>), AppError> {
    let pipeline = app.pipeline.clone();
    let outcome = tokio::task::spawn_blocking(move || pipeline.submit_webhook(&env))
        .await
        .map_err(|e| AppError(anyhow::anyhow!("task join error: {e}")))??;

    let status = StatusCode::from_u16(outcome.http_status()).unwrap_or(StatusCode::OK);
    Ok((status, Json(outcome.response())))
}

/// POST /api/webhook: submit a job on the webhook lane.
pub async fn submit_webhook(
    State(app): State<AppState>,
    Query(query): Query<WebhookQuery>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<(StatusCode, Json<SubmitResponse>), AppError> {
    let env = envelope(Lane::Webhook, &headers, query, body);
    submit_on(app, env).await
}

/// POST /api/lanes/{lane}/submit: submit a job on an explicit lane.
pub async fn submit_lane(
    State(app): State<AppState>,
    Path(lane): Path<String>,
    Query(query): Query<WebhookQuery>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<(StatusCode, Json<SubmitResponse>), AppError> {
    let lane: Lane = lane.parse()?;
    let env = envelope(lane, &headers, query, body);
    submit_on(app, env).await
}

/// POST /api/webhook/validate: authenticated dry run, nothing is reserved or sent.
pub async fn validate_webhook(
    State(app): State<AppState>,
    Query(query): Query<WebhookQuery>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Json<ValidationReport>, AppError> {
    let env = envelope(Lane::Webhook, &headers, query, body);
    let pipeline = app.pipeline.clone();
    let report = tokio::task::spawn_blocking(move || pipeline.validate_webhook(&env))
        .await
        .map_err(|e| AppError(anyhow::anyhow!("task join error: {e}")))??;
    Ok(Json(report))
}
