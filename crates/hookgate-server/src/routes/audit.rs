use axum::extract::{Query, State};
use axum::Json;
use hookgate_core::audit::{AuditEntry, AuditQuery, ChainReport};

use crate::error::AppError;
use crate::state::AppState;

/// GET /api/audit: newest first; `?limit=&offset=&action=&actor=&subject_id=`.
pub async fn list_audit(
    State(app): State<AppState>,
    Query(query): Query<AuditQuery>,
) -> Result<Json<Vec<AuditEntry>>, AppError> {
    let pipeline = app.pipeline.clone();
    let entries = tokio::task::spawn_blocking(move || pipeline.audit_query(query))
        .await
        .map_err(|e| AppError(anyhow::anyhow!("task join error: {e}")))??;
    Ok(Json(entries))
}

/// GET /api/audit/verify: recompute the persisted chain front to back.
pub async fn verify_audit(State(app): State<AppState>) -> Result<Json<ChainReport>, AppError> {
    let pipeline = app.pipeline.clone();
    let report = tokio::task::spawn_blocking(move || pipeline.audit_verify())
        .await
        .map_err(|e| AppError(anyhow::anyhow!("task join error: {e}")))??;
    Ok(Json(report))
}
