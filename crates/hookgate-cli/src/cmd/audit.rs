use crate::output::{print_json, print_table, short_time};
use anyhow::Context;
use clap::Subcommand;
use hookgate_core::audit::{self, AuditQuery};
use hookgate_core::paths;
use std::path::Path;

#[derive(Subcommand)]
pub enum AuditSubcommand {
    /// Recompute the hash chain front to back
    Verify,

    /// List entries, newest first
    List {
        #[arg(long, default_value = "20")]
        limit: usize,
        #[arg(long)]
        offset: Option<usize>,
        /// Only this action (e.g. `auth.reject`)
        #[arg(long)]
        action: Option<String>,
        #[arg(long)]
        actor: Option<String>,
        /// Only entries about this job or approval id
        #[arg(long)]
        subject: Option<String>,
    },
}

pub fn run(root: &Path, subcmd: AuditSubcommand, json: bool) -> anyhow::Result<()> {
    match subcmd {
        AuditSubcommand::Verify => verify(root, json),
        AuditSubcommand::List {
            limit,
            offset,
            action,
            actor,
            subject,
        } => list(
            root,
            AuditQuery {
                limit: Some(limit),
                offset,
                action,
                actor,
                subject_id: subject,
            },
            json,
        ),
    }
}

// The trail is read straight from disk so these work while `serve` runs.

fn verify(root: &Path, json: bool) -> anyhow::Result<()> {
    let path = paths::audit_path(root);
    let report = audit::verify_file(&path)
        .with_context(|| format!("audit trail {} failed verification", path.display()))?;
    if json {
        print_json(&report)?;
    } else {
        println!(
            "Audit trail intact: {} entries, head seq {} ({})",
            report.entries, report.head_seq, report.head_hash
        );
    }
    Ok(())
}

fn list(root: &Path, query: AuditQuery, json: bool) -> anyhow::Result<()> {
    let entries = audit::read_entries(&paths::audit_path(root)).context("failed to read audit trail")?;
    let entries = query.apply(entries);
    if json {
        return print_json(&entries);
    }
    if entries.is_empty() {
        println!("No audit entries.");
        return Ok(());
    }
    let rows = entries
        .iter()
        .map(|e| {
            vec![
                e.seq.to_string(),
                short_time(&e.timestamp),
                e.action.clone(),
                e.outcome.as_str().to_string(),
                e.actor.clone(),
                e.subject_id.clone(),
                e.reason.clone().unwrap_or_default(),
            ]
        })
        .collect();
    print_table(&["SEQ", "TIME", "ACTION", "OUTCOME", "ACTOR", "SUBJECT", "REASON"], rows);
    Ok(())
}
