#![forbid(unsafe_code)]

use std::env;
use std::process::ExitCode;

use anyhow::Result;
use clap::Parser;
use loam_sim::campaign::{CampaignConfig, run_campaign};
use tracing_subscriber::{EnvFilter, fmt, prelude::*};

/// Run a deterministic convergence campaign.
#[derive(Parser, Debug)]
#[command(author, version, about = "loam-sim: deterministic sync simulation", long_about = None)]
struct Args {
    /// Number of seeds to run.
    #[arg(long, default_value_t = 50)]
    seeds: u64,

    /// First seed.
    #[arg(long, default_value_t = 0)]
    seed_start: u64,

    /// Replicas per run.
    #[arg(long, default_value_t = 4)]
    agents: usize,

    /// Fault-phase rounds per run.
    #[arg(long, default_value_t = 40)]
    rounds: u64,

    /// Percentage of messages dropped.
    #[arg(long, default_value_t = 10)]
    drop_percent: u8,

    /// Percentage chance per round of toggling a partition.
    #[arg(long, default_value_t = 5)]
    partition_percent: u8,

    /// Emit the report as JSON.
    #[arg(long)]
    json: bool,
}

fn init_tracing() {
    let filter = EnvFilter::try_from_env("LOAM_LOG").unwrap_or_else(|_| EnvFilter::new("loam_sim=info,warn"));
    let registry = tracing_subscriber::registry().with(filter);
    if env::var("LOAM_LOG_FORMAT").is_ok_and(|format| format == "json") {
        registry.with(fmt::layer().json().with_ansi(false).with_writer(std::io::stderr)).init();
    } else {
        registry.with(fmt::layer().compact().with_writer(std::io::stderr)).init();
    }
}

fn main() -> Result<ExitCode> {
    init_tracing();
    let args = Args::parse();

    let mut config = CampaignConfig {
        seeds: args.seed_start..args.seed_start.saturating_add(args.seeds),
        ..CampaignConfig::default()
    };
    config.run.agent_count = args.agents;
    config.run.rounds = args.rounds;
    config.run.fault.drop_rate_percent = args.drop_percent;
    config.run.fault.partition_rate_percent = args.partition_percent;
    let report = run_campaign(&config)?;

    if args.json {
        println!("{}", serde_json::to_string_pretty(&report)?);
    } else {
        println!(
            "campaign seeds_run={} passed={} failed={} interesting={}",
            report.seeds_run,
            report.seeds_passed,
            report.failures.len(),
            report.interesting_states_reached
        );
        for failure in &report.failures {
            println!("failure seed={}", failure.seed);
            for violation in &failure.violations {
                println!("  - {violation}");
            }
        }
    }

    Ok(if report.all_passed() {
        ExitCode::SUCCESS
    } else {
        ExitCode::FAILURE
    })
}
