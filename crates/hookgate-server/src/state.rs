use std::path::PathBuf;
use std::sync::Arc;

use hookgate_core::Pipeline;

/// Shared application state passed to all route handlers.
#[derive(Clone)]
pub struct AppState {
    pub root: PathBuf,
    pub pipeline: Arc<Pipeline>,
}

impl AppState {
    pub fn new(root: PathBuf, pipeline: Pipeline) -> Self {
        let state = Self {
            root,
            pipeline: Arc::new(pipeline),
        };

        // Expire stale approvals and idempotency records in the background.
        // Guard: only spawn if inside a Tokio runtime (skipped in sync unit tests).
        if tokio::runtime::Handle::try_current().is_ok() {
            let pipeline = Arc::clone(&state.pipeline);
            tokio::spawn(async move {
                loop {
                    let interval = pipeline
                        .approval_sweep_interval()
                        .unwrap_or(std::time::Duration::from_secs(60))
                        .max(std::time::Duration::from_secs(1));
                    tokio::time::sleep(interval).await;
                    let p = Arc::clone(&pipeline);
                    match tokio::task::spawn_blocking(move || p.sweep_expired()).await {
                        Ok(Ok(report)) => {
                            if report.approvals_expired > 0 || report.idempotency_purged > 0 {
                                tracing::info!(
                                    approvals_expired = report.approvals_expired,
                                    idempotency_purged = report.idempotency_purged,
                                    "expiry sweep"
                                );
                            }
                        }
                        Ok(Err(e)) => tracing::warn!(error = %e, "expiry sweep failed"),
                        Err(e) => tracing::warn!("expiry sweep task join error: {e}"),
                    }
                }
            });
        }

        state
    }
}
