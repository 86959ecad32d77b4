#![forbid(unsafe_code)]

mod cmd;
mod output;

use clap::{Parser, Subcommand};
use loam_core::config::resolve_engine_config;
use output::{CliError, OutputMode, render_error};
use std::env;
use std::path::PathBuf;
use std::process::ExitCode;
use tracing::debug;
use tracing_subscriber::{EnvFilter, fmt, prelude::*};

#[derive(Parser, Debug)]
#[command(
    author,
    version,
    about = "loam: inspect and maintain a replica store",
    long_about = None
)]
struct Cli {
    /// Path to the SQLite replica store. Defaults to `$LOAM_DB`, then the
    /// platform data directory.
    #[arg(long, global = true)]
    db: Option<PathBuf>,

    /// Output format.
    #[arg(long, global = true, value_enum)]
    format: Option<OutputMode>,

    /// Shorthand for `--format json`.
    #[arg(long, global = true, hide = true)]
    json: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    #[command(
        next_help_heading = "Store",
        about = "Create a replica store",
        long_about = "Create the store if missing and assign it a replica id."
    )]
    Init(cmd::init::InitArgs),

    #[command(
        next_help_heading = "Read",
        about = "Summarize the store",
        long_about = "Show the replica id, schema version, acknowledgement watermarks and record counts."
    )]
    Status,

    #[command(next_help_heading = "Read", about = "List operations, optionally under one OID")]
    Ops(cmd::inspect::OpsArgs),

    #[command(next_help_heading = "Read", about = "List baselines, optionally under one OID")]
    Baselines(cmd::inspect::BaselinesArgs),

    #[command(next_help_heading = "Read", about = "Show the merged documents of a collection")]
    Docs(cmd::inspect::DocsArgs),

    #[command(next_help_heading = "Read", about = "List replicas known to this store")]
    Replicas,

    #[command(
        next_help_heading = "Maintenance",
        about = "Compact history into baselines",
        long_about = "Fold every operation at or below the cutoff into baselines. The cutoff defaults to the stored global acknowledgement."
    )]
    Rebase(cmd::rebase::RebaseArgs),

    #[command(
        next_help_heading = "Maintenance",
        about = "Check stored history for integrity problems"
    )]
    Verify,

    #[command(next_help_heading = "Development", about = "Run deterministic sync simulations")]
    Sim(cmd::sim::SimArgs),
}

fn init_tracing() {
    let filter = EnvFilter::try_from_env("LOAM_LOG").unwrap_or_else(|_| {
        EnvFilter::new(if env::var("DEBUG").is_ok() {
            "loam=debug,loam_core=debug,info"
        } else {
            "loam=info,warn"
        })
    });

    let format = env::var("LOAM_LOG_FORMAT").unwrap_or_else(|_| "compact".to_string());
    let registry = tracing_subscriber::registry().with(filter);

    match format.as_str() {
        "json" => registry
            .with(fmt::layer().json().with_ansi(false).with_writer(std::io::stderr))
            .init(),
        _ => registry.with(fmt::layer().compact().with_writer(std::io::stderr)).init(),
    }
}

fn main() -> ExitCode {
    init_tracing();
    let cli = Cli::parse();
    let project_root = env::current_dir().unwrap_or_else(|_| PathBuf::from("."));

    let effective = match resolve_engine_config(&project_root, cli.json) {
        Ok(effective) => effective,
        Err(err) => {
            let mode = OutputMode::resolve(cli.format, if cli.json { "json" } else { "text" });
            let _ = render_error(mode, &CliError::new(format!("{err:#}")));
            return ExitCode::FAILURE;
        }
    };
    let output = OutputMode::resolve(cli.format, &effective.resolved_output);
    debug!(?output, rebase = effective.engine.rebase.enabled, "resolved configuration");

    let db = cli.db.as_deref();
    let result = match &cli.command {
        Commands::Init(args) => cmd::init::run_init(args, db, &project_root, &effective.engine, output),
        Commands::Status => cmd::status::run_status(db, output),
        Commands::Ops(args) => cmd::inspect::run_ops(args, db, output),
        Commands::Baselines(args) => cmd::inspect::run_baselines(args, db, output),
        Commands::Docs(args) => cmd::inspect::run_docs(args, db, output),
        Commands::Replicas => cmd::inspect::run_replicas(db, output),
        Commands::Rebase(args) => cmd::rebase::run_rebase(args, db, &effective.engine, output),
        Commands::Verify => cmd::verify::run_verify(db, output),
        Commands::Sim(args) => cmd::sim::run_sim(args, output),
    };

    match result {
        Ok(code) => code,
        Err(err) => {
            let _ = render_error(output, &CliError::new(format!("{err:#}")));
            ExitCode::FAILURE
        }
    }
}
