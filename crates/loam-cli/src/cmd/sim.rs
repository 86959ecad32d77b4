//! `loam sim`: deterministic simulation campaigns.
//!
//! `loam sim run` executes a campaign across many seeds; `loam sim replay`
//! reruns one seed and shows what every replica ended up with.

use anyhow::Result;
use clap::{Args, Subcommand};
use loam_sim::campaign::{CampaignConfig, replay_seed, run_campaign};
use loam_sim::network::FaultConfig;
use serde::Serialize;
use std::process::ExitCode;

use crate::output::{OutputMode, pretty_kv, pretty_section, render_mode};

/// Failure samples shown before truncating.
const FAILURE_SAMPLES: usize = 5;

#[derive(Args, Debug)]
pub struct SimArgs {
    #[command(subcommand)]
    pub command: SimCommand,
}

#[derive(Subcommand, Debug)]
pub enum SimCommand {
    #[command(
        about = "Run a simulation campaign across multiple seeds",
        long_about = "Run replicas against a hub over a faulty network for each seed, then\n\
                      check convergence, commutativity, idempotence and acknowledgement.",
        after_help = "EXAMPLES:\n    # Run 100 seeds with defaults\n    loam sim run --seeds 100\n\n\
                      # Heavier faults\n    loam sim run --seeds 200 --agents 6 --faults 40\n\n\
                      # Machine-readable output\n    loam sim run --seeds 100 --format json"
    )]
    Run(SimRunArgs),

    #[command(
        about = "Replay a single seed with detailed output",
        after_help = "EXAMPLES:\n    loam sim replay --seed 42\n    loam sim replay --seed 42 --agents 6 --format json"
    )]
    Replay(SimReplayArgs),
}

/// Knobs shared by both subcommands.
#[derive(Args, Debug, Clone, Copy)]
pub struct SimShape {
    /// Replicas per run.
    #[arg(long, default_value_t = 4)]
    pub agents: usize,

    /// Fault-phase rounds per run.
    #[arg(long, default_value_t = 40)]
    pub rounds: u64,

    /// Overall fault percentage (0-100); scales drop, duplicate, reorder,
    /// partition and freeze rates.
    #[arg(long, default_value_t = 20, value_parser = clap::value_parser!(u8).range(0..=100))]
    pub faults: u8,

    /// Maximum delivery delay in rounds.
    #[arg(long, default_value_t = 3)]
    pub max_delay: u8,
}

#[derive(Args, Debug)]
pub struct SimRunArgs {
    /// Number of seeds to run.
    #[arg(long, default_value_t = 100)]
    pub seeds: u64,

    /// First seed.
    #[arg(long, default_value_t = 0)]
    pub seed_start: u64,

    #[command(flatten)]
    pub shape: SimShape,
}

#[derive(Args, Debug)]
pub struct SimReplayArgs {
    #[arg(long)]
    pub seed: u64,

    #[command(flatten)]
    pub shape: SimShape,
}

#[derive(Debug, Serialize)]
struct RunOutput {
    seeds_run: usize,
    seeds_passed: usize,
    seeds_failed: usize,
    first_failure: Option<u64>,
    interesting_states_reached: usize,
    all_passed: bool,
    failures: Vec<FailureOutput>,
}

#[derive(Debug, Serialize)]
struct FailureOutput {
    seed: u64,
    violations: Vec<String>,
}

#[derive(Debug, Serialize)]
struct ReplayOutput {
    seed: u64,
    trace_events: usize,
    edits: usize,
    converged: bool,
    oracle_passed: bool,
    interesting_state_reached: bool,
    hub_operations: usize,
    hub_global_ack: Option<String>,
    violations: Vec<String>,
    agents: Vec<AgentOutput>,
}

#[derive(Debug, Serialize)]
struct AgentOutput {
    replica: String,
    documents: usize,
    authored: usize,
    pending: usize,
    global_ack: Option<String>,
}

fn campaign_config(seed_start: u64, seeds: u64, shape: SimShape) -> CampaignConfig {
    let mut config = CampaignConfig {
        seeds: seed_start..seed_start.saturating_add(seeds),
        ..CampaignConfig::default()
    };
    config.run.agent_count = shape.agents;
    config.run.rounds = shape.rounds;
    config.run.fault = FaultConfig {
        max_delay_rounds: shape.max_delay,
        drop_rate_percent: scale_fault(shape.faults, 50),
        duplicate_rate_percent: scale_fault(shape.faults, 25),
        reorder_rate_percent: scale_fault(shape.faults, 50),
        partition_rate_percent: scale_fault(shape.faults, 25),
        freeze_rate_percent: scale_fault(shape.faults, 25),
        ..config.run.fault
    };
    config
}

/// `weight_pct` percent of the overall fault percentage.
fn scale_fault(faults: u8, weight_pct: u8) -> u8 {
    let scaled = u16::from(faults) * u16::from(weight_pct) / 100;
    u8::try_from(scaled.min(100)).unwrap_or(100)
}

/// Execute `loam sim`.
pub fn run_sim(args: &SimArgs, output: OutputMode) -> Result<ExitCode> {
    match &args.command {
        SimCommand::Run(run) => run_sim_run(run, output),
        SimCommand::Replay(replay) => run_sim_replay(replay, output),
    }
}

fn run_sim_run(args: &SimRunArgs, output: OutputMode) -> Result<ExitCode> {
    let report = run_campaign(&campaign_config(args.seed_start, args.seeds, args.shape))?;
    let out = RunOutput {
        seeds_run: report.seeds_run,
        seeds_passed: report.seeds_passed,
        seeds_failed: report.failures.len(),
        first_failure: report.first_failure,
        interesting_states_reached: report.interesting_states_reached,
        all_passed: report.all_passed(),
        failures: report
            .failures
            .iter()
            .map(|f| FailureOutput {
                seed: f.seed,
                violations: f.violations.clone(),
            })
            .collect(),
    };
    let shape = args.shape;

    render_mode(
        output,
        &out,
        |out, w| {
            writeln!(
                w,
                "campaign seeds_run={} agents={} rounds={} faults_pct={}",
                out.seeds_run, shape.agents, shape.rounds, shape.faults
            )?;
            writeln!(
                w,
                "results passed={} failed={} interesting_states={} all_passed={}",
                out.seeds_passed, out.seeds_failed, out.interesting_states_reached, out.all_passed
            )?;
            for failure in out.failures.iter().take(FAILURE_SAMPLES) {
                writeln!(w, "failure seed={} violations={}", failure.seed, failure.violations.len())?;
            }
            if out.failures.len() > FAILURE_SAMPLES {
                writeln!(w, "failures_truncated count={}", out.failures.len() - FAILURE_SAMPLES)?;
            }
            if let Some(seed) = out.first_failure {
                writeln!(w, "hint replay_seed={seed} agents={} rounds={}", shape.agents, shape.rounds)?;
            }
            Ok(())
        },
        |out, w| {
            pretty_section(w, "Simulation Campaign")?;
            pretty_kv(w, "Seeds", out.seeds_run.to_string())?;
            pretty_kv(w, "Agents", shape.agents.to_string())?;
            pretty_kv(w, "Rounds", shape.rounds.to_string())?;
            pretty_kv(w, "Fault rate", format!("{}%", shape.faults))?;
            pretty_kv(
                w,
                "Results",
                format!(
                    "{} passed / {} failed ({} interesting states)",
                    out.seeds_passed, out.seeds_failed, out.interesting_states_reached
                ),
            )?;
            let Some(first) = out.first_failure else {
                return pretty_kv(w, "Status", "all seeds passed");
            };
            pretty_kv(w, "Status", format!("{} failures (first at seed {first})", out.seeds_failed))?;
            writeln!(w)?;
            pretty_section(w, "Failure Samples")?;
            for failure in out.failures.iter().take(FAILURE_SAMPLES) {
                writeln!(w, "seed {:<8} violations={}", failure.seed, failure.violations.len())?;
                for violation in &failure.violations {
                    writeln!(w, "  - {violation}")?;
                }
            }
            if out.failures.len() > FAILURE_SAMPLES {
                writeln!(w, "... and {} more failures", out.failures.len() - FAILURE_SAMPLES)?;
            }
            writeln!(w)?;
            pretty_kv(
                w,
                "Replay",
                format!(
                    "loam sim replay --seed {first} --agents {} --rounds {} --faults {}",
                    shape.agents, shape.rounds, shape.faults
                ),
            )
        },
    )?;

    Ok(if out.all_passed {
        ExitCode::SUCCESS
    } else {
        ExitCode::FAILURE
    })
}

fn run_sim_replay(args: &SimReplayArgs, output: OutputMode) -> Result<ExitCode> {
    let trace = replay_seed(args.seed, &campaign_config(args.seed, 1, args.shape))?;
    let result = &trace.result;
    let out = ReplayOutput {
        seed: args.seed,
        trace_events: result.trace.len(),
        edits: result.edit_count(),
        converged: result.converged,
        oracle_passed: trace.oracle.passed,
        interesting_state_reached: result.interesting_state_reached,
        hub_operations: result.hub.operations.len(),
        hub_global_ack: result.hub.global_ack.as_ref().map(ToString::to_string),
        violations: trace.oracle.violations.iter().map(ToString::to_string).collect(),
        agents: result
            .states
            .iter()
            .map(|state| AgentOutput {
                replica: state.replica.clone(),
                documents: state.documents.len(),
                authored: state.authored.len(),
                pending: state.pending,
                global_ack: state.global_ack.as_ref().map(ToString::to_string),
            })
            .collect(),
    };

    render_mode(
        output,
        &out,
        |out, w| {
            writeln!(
                w,
                "replay seed={} converged={} oracle_passed={} trace_events={} edits={} interesting_state_reached={}",
                out.seed,
                out.converged,
                out.oracle_passed,
                out.trace_events,
                out.edits,
                out.interesting_state_reached
            )?;
            for agent in &out.agents {
                writeln!(
                    w,
                    "agent replica={} documents={} authored={} pending={}",
                    agent.replica, agent.documents, agent.authored, agent.pending
                )?;
            }
            for violation in &out.violations {
                writeln!(w, "violation={violation}")?;
            }
            Ok(())
        },
        |out, w| {
            pretty_section(w, &format!("Replay Seed {}", out.seed))?;
            pretty_kv(w, "Trace events", out.trace_events.to_string())?;
            pretty_kv(w, "Edits", out.edits.to_string())?;
            pretty_kv(w, "Converged", out.converged.to_string())?;
            pretty_kv(w, "Interesting", out.interesting_state_reached.to_string())?;
            pretty_kv(w, "Hub ops", out.hub_operations.to_string())?;
            pretty_kv(w, "Hub ack", out.hub_global_ack.as_deref().unwrap_or("(none)"))?;
            pretty_kv(w, "Oracle", if out.oracle_passed { "passed" } else { "FAILED" })?;
            writeln!(w)?;
            pretty_section(w, "Replicas")?;
            for agent in &out.agents {
                pretty_kv(
                    w,
                    &agent.replica,
                    format!(
                        "{} docs, {} authored, {} pending",
                        agent.documents, agent.authored, agent.pending
                    ),
                )?;
            }
            if !out.violations.is_empty() {
                writeln!(w)?;
                pretty_section(w, "Violations")?;
                for violation in &out.violations {
                    writeln!(w, "  - {violation}")?;
                }
            }
            Ok(())
        },
    )?;

    Ok(if out.oracle_passed {
        ExitCode::SUCCESS
    } else {
        ExitCode::FAILURE
    })
}
