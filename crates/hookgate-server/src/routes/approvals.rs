use axum::body::Bytes;
use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::Json;
use hookgate_core::approval::{ApprovalRecord, ApprovalStatus};
use hookgate_core::pipeline::ApprovalDecision;
use hookgate_core::types::Lane;
use serde::Deserialize;

use super::{admin_actor, json_body, optional_body};
use crate::error::AppError;
use crate::state::AppState;

#[derive(Debug, Default, Deserialize)]
pub struct ListQuery {
    pub status: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct CreateBody {
    #[serde(default)]
    pub lane: Option<Lane>,
    #[serde(default)]
    pub actor: Option<String>,
    /// A canonical job request, as a webhook would send it.
    pub request: serde_json::Value,
}

#[derive(Debug, Default, Deserialize)]
pub struct DecisionBody {
    #[serde(default)]
    pub actor: Option<String>,
    #[serde(default)]
    pub auto_execute: bool,
}

/// GET /api/approvals: list approvals, newest first.
pub async fn list_approvals(
    State(app): State<AppState>,
    Query(query): Query<ListQuery>,
) -> Result<Json<Vec<ApprovalRecord>>, AppError> {
    let status = query
        .status
        .as_deref()
        .map(str::parse::<ApprovalStatus>)
        .transpose()?;
    let pipeline = app.pipeline.clone();
    let records = tokio::task::spawn_blocking(move || pipeline.list_approvals(status))
        .await
        .map_err(|e| AppError(anyhow::anyhow!("task join error: {e}")))??;
    Ok(Json(records))
}

/// POST /api/approvals: gate a job request for operator review.
pub async fn create_approval(
    State(app): State<AppState>,
    body: Bytes,
) -> Result<(StatusCode, Json<ApprovalRecord>), AppError> {
    let body: CreateBody = json_body(&body)?;
    let actor = admin_actor(body.actor.as_deref());
    let lane = body.lane.unwrap_or(Lane::Webhook);
    let request = serde_json::to_vec(&body.request).map_err(hookgate_core::GateError::from)?;
    let pipeline = app.pipeline.clone();
    let record = tokio::task::spawn_blocking(move || pipeline.create_approval(lane, &request, &actor))
        .await
        .map_err(|e| AppError(anyhow::anyhow!("task join error: {e}")))??;
    Ok((StatusCode::CREATED, Json(record)))
}

/// GET /api/approvals/{id}
pub async fn get_approval(
    State(app): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<ApprovalRecord>, AppError> {
    let pipeline = app.pipeline.clone();
    let record = tokio::task::spawn_blocking(move || pipeline.get_approval(&id))
        .await
        .map_err(|e| AppError(anyhow::anyhow!("task join error: {e}")))??;
    Ok(Json(record))
}

/// POST /api/approvals/{id}/approve: body `{actor?, auto_execute?}`.
pub async fn approve(
    State(app): State<AppState>,
    Path(id): Path<String>,
    body: Bytes,
) -> Result<Json<ApprovalDecision>, AppError> {
    let body: DecisionBody = optional_body(&body)?;
    let actor = admin_actor(body.actor.as_deref());
    let pipeline = app.pipeline.clone();
    let decision = tokio::task::spawn_blocking(move || pipeline.approve(&id, &actor, body.auto_execute))
        .await
        .map_err(|e| AppError(anyhow::anyhow!("task join error: {e}")))??;
    Ok(Json(decision))
}

/// POST /api/approvals/{id}/reject
pub async fn reject(
    State(app): State<AppState>,
    Path(id): Path<String>,
    body: Bytes,
) -> Result<Json<ApprovalRecord>, AppError> {
    let body: DecisionBody = optional_body(&body)?;
    let actor = admin_actor(body.actor.as_deref());
    let pipeline = app.pipeline.clone();
    let record = tokio::task::spawn_blocking(move || pipeline.reject(&id, &actor))
        .await
        .map_err(|e| AppError(anyhow::anyhow!("task join error: {e}")))??;
    Ok(Json(record))
}

/// POST /api/approvals/{id}/execute: hand an approved record to the engine.
pub async fn execute(
    State(app): State<AppState>,
    Path(id): Path<String>,
    body: Bytes,
) -> Result<Json<ApprovalRecord>, AppError> {
    let body: DecisionBody = optional_body(&body)?;
    let actor = admin_actor(body.actor.as_deref());
    let pipeline = app.pipeline.clone();
    let record = tokio::task::spawn_blocking(move || pipeline.execute_approval(&id, &actor))
        .await
        .map_err(|e| AppError(anyhow::anyhow!("task join error: {e}")))??;
    Ok(Json(record))
}
