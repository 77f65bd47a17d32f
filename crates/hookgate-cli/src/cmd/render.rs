use crate::output::print_json;
use anyhow::Context;
use hookgate_core::approval::MemoryApprovalStore;
use hookgate_core::audit::AuditTrail;
use hookgate_core::config::Config;
use hookgate_core::engine::UnconfiguredEngine;
use hookgate_core::idempotency::MemoryIdempotencyStore;
use hookgate_core::template::DirTemplateStore;
use hookgate_core::{Pipeline, PipelineParts};
use std::io::Read;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

pub fn run(root: &Path, file: &Path, mapping: Option<&str>, json: bool) -> anyhow::Result<()> {
    let body = if file.as_os_str() == "-" {
        let mut buf = Vec::new();
        std::io::stdin()
            .read_to_end(&mut buf)
            .context("failed to read stdin")?;
        buf
    } else {
        std::fs::read(file).with_context(|| format!("failed to read {}", file.display()))?
    };

    let report = dry_run_pipeline(root)?
        .render_local(&body, mapping)
        .context("render failed")?;

    if json {
        return print_json(&report);
    }
    println!("job_id:            {}", report.job_id);
    println!("idempotency_key:   {}", report.idempotency_key);
    println!("requires_approval: {}", report.requires_approval);
    println!("size:              {} bytes", report.size_bytes);
    for w in &report.render_warnings {
        println!("warning: unresolved {{{{{}}}}} at {}", w.placeholder, w.path);
    }
    println!("{}", serde_json::to_string_pretty(&report.document)?);
    Ok(())
}

/// Real templates and config, throwaway everything else: nothing is
/// reserved, audited or sent.
fn dry_run_pipeline(root: &Path) -> anyhow::Result<Pipeline> {
    let (config, _) = Config::load_validated(root).context("failed to load config")?;
    let parts = PipelineParts {
        config,
        templates: Arc::new(DirTemplateStore::for_root(root)),
        idempotency: Arc::new(MemoryIdempotencyStore::new(Duration::from_secs(60))),
        approvals: Box::new(MemoryApprovalStore::new()),
        audit: Arc::new(AuditTrail::in_memory()?),
        engine: Arc::new(UnconfiguredEngine),
    };
    Ok(Pipeline::new(parts)?)
}
