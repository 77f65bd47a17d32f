pub mod auth;
pub mod error;
pub mod routes;
pub mod state;

use axum::routing::{get, post};
use axum::Router;
use std::path::PathBuf;
use tower_http::trace::TraceLayer;

use hookgate_core::Pipeline;

/// Build the axum Router with all API routes and middleware.
/// Used by `serve()` and available for integration testing.
pub fn build_router(app_state: state::AppState) -> Router {
    let admin = Router::new()
        // Approvals
        .route(
            "/api/approvals",
            get(routes::approvals::list_approvals).post(routes::approvals::create_approval),
        )
        .route("/api/approvals/{id}", get(routes::approvals::get_approval))
        .route(
            "/api/approvals/{id}/approve",
            post(routes::approvals::approve),
        )
        .route("/api/approvals/{id}/reject", post(routes::approvals::reject))
        .route(
            "/api/approvals/{id}/execute",
            post(routes::approvals::execute),
        )
        // Audit
        .route("/api/audit", get(routes::audit::list_audit))
        .route("/api/audit/verify", get(routes::audit::verify_audit))
        // Admission and config
        .route("/api/admission", get(routes::admin::admission))
        .route("/api/config/reload", post(routes::admin::reload_config))
        .route_layer(axum::middleware::from_fn_with_state(
            app_state.clone(),
            auth::admin_auth,
        ));

    Router::new()
        // Inbound lanes
        .route("/api/webhook", post(routes::webhook::submit_webhook))
        .route(
            "/api/webhook/validate",
            post(routes::webhook::validate_webhook),
        )
        .route(
            "/api/lanes/{lane}/submit",
            post(routes::webhook::submit_lane),
        )
        .route("/api/health", get(routes::admin::health))
        .merge(admin)
        .layer(TraceLayer::new_for_http())
        .with_state(app_state)
}

/// Open the pipeline under `root` and serve on `port` until shutdown.
pub async fn serve(root: PathBuf, port: u16) -> anyhow::Result<()> {
    let addr = format!("0.0.0.0:{port}");
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    serve_on(root, listener).await
}

/// Serve on a pre-bound listener.
///
/// Unlike `serve`, this accepts a `TcpListener` that was already bound so the
/// caller can read the actual port before starting (useful when `port = 0` and
/// the OS picks a free port).
pub async fn serve_on(root: PathBuf, listener: tokio::net::TcpListener) -> anyhow::Result<()> {
    let actual_port = listener.local_addr()?.port();
    let open_root = root.clone();
    let pipeline = tokio::task::spawn_blocking(move || Pipeline::open(&open_root))
        .await
        .map_err(|e| anyhow::anyhow!("task join error: {e}"))??;
    let app = build_router(state::AppState::new(root, pipeline));

    tracing::info!("hookgate listening on http://localhost:{actual_port}");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;
    tracing::info!("hookgate stopped");
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::warn!("could not install ctrl-c handler: {e}");
        std::future::pending::<()>().await;
    }
}
