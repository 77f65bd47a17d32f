use crate::output::{print_json, print_table, short_time};
use anyhow::Context;
use clap::Subcommand;
use hookgate_core::approval::{ApprovalRecord, ApprovalStatus, ApprovalStore, DirApprovalStore};
use hookgate_core::Pipeline;
use std::path::Path;

// ---------------------------------------------------------------------------
// Subcommand types
// ---------------------------------------------------------------------------

#[derive(Subcommand)]
pub enum ApprovalSubcommand {
    /// List approvals, newest first
    List {
        /// pending, approved, rejected, expired, executed, execution_failed
        #[arg(long)]
        status: Option<String>,
    },

    /// Show one approval record
    Show { id: String },

    /// Approve a pending record
    Approve {
        id: String,
        /// Hand the job to the engine immediately
        #[arg(long)]
        execute: bool,
        #[arg(long, env = "USER", default_value = "operator")]
        actor: String,
    },

    /// Reject a pending or approved record
    Reject {
        id: String,
        #[arg(long, env = "USER", default_value = "operator")]
        actor: String,
    },

    /// Hand an approved record to the engine
    Execute {
        id: String,
        #[arg(long, env = "USER", default_value = "operator")]
        actor: String,
    },
}

pub fn run(root: &Path, subcmd: ApprovalSubcommand, json: bool) -> anyhow::Result<()> {
    match subcmd {
        ApprovalSubcommand::List { status } => list(root, status.as_deref(), json),
        ApprovalSubcommand::Show { id } => show(root, &id, json),
        ApprovalSubcommand::Approve { id, execute, actor } => {
            let decision = open(root)?
                .approve(&id, &cli_actor(&actor), execute)
                .with_context(|| format!("failed to approve '{id}'"))?;
            if json {
                return print_json(&decision);
            }
            print_record(&decision.record);
            if let Some(reason) = decision.deferred {
                println!("execution deferred: {reason}; run `hookgate approval execute {id}` later");
            }
            Ok(())
        }
        ApprovalSubcommand::Reject { id, actor } => {
            let record = open(root)?
                .reject(&id, &cli_actor(&actor))
                .with_context(|| format!("failed to reject '{id}'"))?;
            emit(&record, json)
        }
        ApprovalSubcommand::Execute { id, actor } => {
            let record = open(root)?
                .execute_approval(&id, &cli_actor(&actor))
                .with_context(|| format!("failed to execute '{id}'"))?;
            emit(&record, json)
        }
    }
}

fn cli_actor(name: &str) -> String {
    format!("cli:{name}")
}

/// Decisions go through the full pipeline so they are audited and admitted.
fn open(root: &Path) -> anyhow::Result<Pipeline> {
    Pipeline::open(root).context("failed to open hookgate (is `serve` holding the stores?)")
}

// ---------------------------------------------------------------------------
// Read-only views
// ---------------------------------------------------------------------------

fn list(root: &Path, status: Option<&str>, json: bool) -> anyhow::Result<()> {
    let status: Option<ApprovalStatus> = status.map(str::parse).transpose()?;
    let mut records = DirApprovalStore::for_root(root)
        .list()
        .context("failed to read approvals")?;
    records.retain(|r| status.map_or(true, |s| r.status == s));
    records.sort_by(|a, b| b.created_at.cmp(&a.created_at));

    if json {
        return print_json(&records);
    }
    if records.is_empty() {
        println!("No approvals.");
        return Ok(());
    }
    let rows = records
        .iter()
        .map(|r| {
            vec![
                r.approval_id.clone(),
                r.status.to_string(),
                r.lane.to_string(),
                r.template_id.clone(),
                r.payload.job_id.clone(),
                short_time(&r.expires_at),
            ]
        })
        .collect();
    print_table(&["ID", "STATUS", "LANE", "TEMPLATE", "JOB", "EXPIRES"], rows);
    Ok(())
}

fn show(root: &Path, id: &str, json: bool) -> anyhow::Result<()> {
    let record = DirApprovalStore::for_root(root)
        .load(id)
        .with_context(|| format!("approval '{id}' not found"))?;
    if json {
        print_json(&record)
    } else {
        print_record(&record);
        println!("document:");
        println!("{}", serde_json::to_string_pretty(&record.payload.document)?);
        Ok(())
    }
}

fn emit(record: &ApprovalRecord, json: bool) -> anyhow::Result<()> {
    if json {
        print_json(record)
    } else {
        print_record(record);
        Ok(())
    }
}

fn print_record(r: &ApprovalRecord) {
    println!("approval:  {}", r.approval_id);
    println!("status:    {}", r.status);
    println!("lane:      {}", r.lane);
    println!("template:  {}", r.template_id);
    println!("job:       {}", r.payload.job_id);
    println!("expires:   {}", short_time(&r.expires_at));
    if let Some(by) = &r.decided_by {
        println!("decided:   {by}");
    }
    if let Some(job) = &r.job_id {
        println!("engine:    {job}");
    }
    if let Some(reason) = &r.failure_reason {
        println!("failure:   {reason}");
    }
}
