use clap::{Parser, Subcommand};
use hookgate_cli::cmd::{
    self, approval::ApprovalSubcommand, audit::AuditSubcommand, config::ConfigSubcommand,
};
use hookgate_cli::root;
use std::path::PathBuf;

#[derive(Parser)]
#[command(
    name = "hookgate",
    about = "Webhook admission gateway: authenticate, dedupe, render, gate and hand off jobs",
    version,
    propagate_version = true
)]
struct Cli {
    /// Project root (default: auto-detect from .hookgate/)
    #[arg(long, global = true, env = "HOOKGATE_ROOT")]
    root: Option<PathBuf>,

    /// Output as JSON
    #[arg(long, global = true, short = 'j')]
    json: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Scaffold .hookgate/ with a starter config and example template
    Init,

    /// Run the HTTP gateway
    Serve {
        /// Port to listen on (0 = OS-assigned)
        #[arg(long, default_value = "8787")]
        port: u16,
    },

    /// Validate or show the configuration
    Config {
        #[command(subcommand)]
        subcommand: ConfigSubcommand,
    },

    /// Verify or list the audit trail
    Audit {
        #[command(subcommand)]
        subcommand: AuditSubcommand,
    },

    /// Review and decide gated jobs
    Approval {
        #[command(subcommand)]
        subcommand: ApprovalSubcommand,
    },

    /// Render a job request locally without submitting it
    Render {
        /// Path to a JSON job request (`-` for stdin)
        file: PathBuf,

        /// Mapping profile to apply before normalization
        #[arg(long)]
        mapping: Option<String>,
    },
}

fn main() {
    let cli = Cli::parse();

    let default_level = match &cli.command {
        Commands::Serve { .. } => tracing::Level::INFO,
        _ => tracing::Level::WARN,
    };

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env().add_directive(default_level.into()),
        )
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    let root = root::resolve_root(cli.root.as_deref());

    let result = match cli.command {
        Commands::Init => cmd::init::run(&root),
        Commands::Serve { port } => cmd::serve::run(&root, port),
        Commands::Config { subcommand } => cmd::config::run(&root, subcommand, cli.json),
        Commands::Audit { subcommand } => cmd::audit::run(&root, subcommand, cli.json),
        Commands::Approval { subcommand } => cmd::approval::run(&root, subcommand, cli.json),
        Commands::Render { file, mapping } => {
            cmd::render::run(&root, &file, mapping.as_deref(), cli.json)
        }
    };

    if let Err(e) = result {
        // Print the full error chain (anyhow's alternate Display)
        eprintln!("error: {e:#}");
        std::process::exit(1);
    }
}
