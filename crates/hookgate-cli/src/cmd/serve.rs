use anyhow::Context;
use hookgate_core::config::Config;
use std::path::Path;

pub fn run(root: &Path, port: u16) -> anyhow::Result<()> {
    // Fail fast with the validation findings before binding anything.
    let (_, warnings) = Config::load_validated(root).context("refusing to start")?;
    for w in &warnings {
        tracing::warn!("config: {}", w.message);
    }

    let rt = tokio::runtime::Runtime::new()?;
    rt.block_on(async move {
        let listener = tokio::net::TcpListener::bind(("0.0.0.0", port))
            .await
            .with_context(|| format!("failed to bind port {port}"))?;
        hookgate_server::serve_on(root.to_path_buf(), listener).await
    })
}
