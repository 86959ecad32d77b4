//! Many seeds, one shape: run the simulator over a seed range and name the
//! first seed that breaks convergence.

use std::ops::Range;

use anyhow::{Result, bail};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::network::FaultConfig;
use crate::oracle::{ConvergenceOracle, OracleResult};
use crate::rng::DeterministicRng;
use crate::{SimulationConfig, SimulationResult, Simulator};

/// Salt for the oracle's shuffles, so they do not reuse the run's stream.
const ORACLE_SALT: u64 = 0x0AC1E;

/// A seed range plus the run every seed gets. `run.seed` is ignored.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CampaignConfig {
    pub seeds: Range<u64>,
    pub run: SimulationConfig,
}

impl Default for CampaignConfig {
    fn default() -> Self {
        Self {
            seeds: 0..50,
            run: SimulationConfig {
                agent_count: 4,
                fault: FaultConfig {
                    max_delay_rounds: 3,
                    drop_rate_percent: 10,
                    duplicate_rate_percent: 5,
                    reorder_rate_percent: 10,
                    partition_rate_percent: 5,
                    freeze_rate_percent: 5,
                    freeze_duration_rounds: 2,
                },
                ..SimulationConfig::default()
            },
        }
    }
}

impl CampaignConfig {
    /// # Errors
    ///
    /// Returns an error if the range is empty or a rate exceeds 100.
    pub fn validate(&self) -> Result<()> {
        if self.seeds.is_empty() {
            bail!("seed range must not be empty");
        }
        if self.run.agent_count == 0 || self.run.rounds == 0 {
            bail!("a run needs at least one agent and one round");
        }
        let fault = &self.run.fault;
        let rates = [
            ("edit", self.run.edit_percent),
            ("drop", fault.drop_rate_percent),
            ("duplicate", fault.duplicate_rate_percent),
            ("reorder", fault.reorder_rate_percent),
            ("partition", fault.partition_rate_percent),
            ("freeze", fault.freeze_rate_percent),
        ];
        if let Some((name, rate)) = rates.into_iter().find(|(_, rate)| *rate > 100) {
            bail!("{name} rate is a percentage, got {rate}");
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SeedFailure {
    pub seed: u64,
    pub violations: Vec<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CampaignReport {
    pub seeds_run: usize,
    pub seeds_passed: usize,
    pub first_failure: Option<u64>,
    pub failures: Vec<SeedFailure>,
    /// Seeds in which some fault actually fired.
    pub interesting_states_reached: usize,
}

impl CampaignReport {
    #[must_use]
    pub fn all_passed(&self) -> bool {
        self.failures.is_empty()
    }
}

/// One finished run and the oracle's verdict on it.
#[derive(Debug, Clone)]
pub struct SeedRun {
    pub result: SimulationResult,
    pub oracle: OracleResult,
}

/// # Errors
///
/// Returns an error if the config is invalid or a simulation hits an
/// internal error. Convergence failures land in the report instead.
pub fn run_campaign(config: &CampaignConfig) -> Result<CampaignReport> {
    config.validate()?;
    let mut report = CampaignReport::default();

    for seed in config.seeds.clone() {
        let run = run_seed(seed, config)?;
        report.seeds_run += 1;
        report.interesting_states_reached += usize::from(run.result.interesting_state_reached);
        if run.oracle.passed {
            report.seeds_passed += 1;
            continue;
        }
        warn!(seed, violations = run.oracle.violations.len(), "seed failed");
        report.first_failure.get_or_insert(seed);
        report.failures.push(SeedFailure {
            seed,
            violations: run.oracle.violations.iter().map(ToString::to_string).collect(),
        });
    }

    info!(
        seeds_run = report.seeds_run,
        seeds_passed = report.seeds_passed,
        interesting = report.interesting_states_reached,
        "campaign finished"
    );
    Ok(report)
}

/// Run a single seed of the campaign and keep its full trace.
///
/// # Errors
///
/// Returns an error when config validation or the simulation fails.
pub fn replay_seed(seed: u64, config: &CampaignConfig) -> Result<SeedRun> {
    config.validate()?;
    run_seed(seed, config)
}

fn run_seed(seed: u64, config: &CampaignConfig) -> Result<SeedRun> {
    let result = Simulator::new(SimulationConfig {
        seed,
        ..config.run.clone()
    })?
    .run()?;
    let mut oracle_rng = DeterministicRng::new(seed ^ ORACLE_SALT);
    let oracle = ConvergenceOracle::check_all(&result.states, &result.hub, &mut oracle_rng)?;
    Ok(SeedRun { result, oracle })
}
