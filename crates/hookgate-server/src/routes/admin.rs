use axum::extract::State;
use axum::Json;
use hookgate_core::admission::AdmissionSnapshot;
use hookgate_core::config::Config;

use crate::error::AppError;
use crate::state::AppState;

/// GET /api/health: liveness, no auth.
pub async fn health() -> Json<serde_json::Value> {
    Json(serde_json::json!({
        "status": "ok",
        "version": env!("CARGO_PKG_VERSION"),
    }))
}

/// GET /api/admission: per-lane and total slot usage.
pub async fn admission(State(app): State<AppState>) -> Result<Json<AdmissionSnapshot>, AppError> {
    Ok(Json(app.pipeline.admission_snapshot()?))
}

/// POST /api/config/reload: re-read the config file and swap it in atomically.
///
/// A config with error-level findings is refused and the running
/// configuration stays in force.
pub async fn reload_config(State(app): State<AppState>) -> Result<Json<serde_json::Value>, AppError> {
    let root = app.root.clone();
    let pipeline = app.pipeline.clone();
    let warnings = tokio::task::spawn_blocking(move || {
        let config = Config::load(&root)?;
        pipeline.reload(config, "admin")
    })
    .await
    .map_err(|e| AppError(anyhow::anyhow!("task join error: {e}")))??;

    Ok(Json(serde_json::json!({
        "reloaded": true,
        "warnings": warnings,
    })))
}
