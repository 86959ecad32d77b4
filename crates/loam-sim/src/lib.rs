//! loam-sim library.
//!
//! Deterministic simulation of a loam hub and its replicas over a lossy
//! network. A run is fully determined by its [`SimulationConfig`]: the
//! same seed replays the same edits, faults and deliveries, so a failing
//! seed can be replayed and traced.
//!
//! Each run has two phases. During the fault phase agents edit at random
//! while the network drops, duplicates, delays and reorders messages,
//! partitions replicas and freezes their clocks. The drain phase then
//! heals the network and lets every replica resync until it matches the
//! hub. [`oracle::ConvergenceOracle`] checks the final state.
//!
//! # Conventions
//!
//! - **Errors**: Use `anyhow::Result` for return types.
//! - **Logging**: Use `tracing` macros (`info!`, `warn!`, `debug!`, `trace!`).

pub mod agent;
pub mod campaign;
pub mod clock;
pub mod network;
pub mod oracle;
pub mod rng;

use anyhow::{Context, Result, bail};
use loam_core::config::EngineConfig;
use loam_core::store::MemoryStore;
use loam_core::sync::{
    ClientMessage, ServerMessage, SyncHub, decode_client_message, decode_server_message, encode,
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::agent::{Action, AgentId, AgentState, SCHEMA_VERSION, SimStore, SimulatedAgent, agent_for_replica};
use crate::clock::{ClockConfig, ClockSpec, SimulatedClock};
use crate::network::{Endpoint, FaultConfig, NetworkMessage, SimulatedNetwork};
use crate::oracle::HubSnapshot;
use crate::rng::DeterministicRng;

/// Resync passes the drain phase tries before giving up.
const MAX_DRAIN_PASSES: u64 = 8;

/// Delivery rounds per drain pass.
const MAX_DRAIN_STEPS: u64 = 32;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SimulationConfig {
    pub seed: u64,
    pub agent_count: usize,
    /// Rounds in the fault phase.
    pub rounds: u64,
    /// Chance per round that an agent edits.
    pub edit_percent: u8,
    /// An agent with nothing to push sends a heartbeat every this many
    /// rounds.
    pub heartbeat_every: u64,
    pub truancy_timeout_ms: u64,
    pub fault: FaultConfig,
    pub clock: ClockConfig,
}

impl Default for SimulationConfig {
    fn default() -> Self {
        Self {
            seed: 0,
            agent_count: 3,
            rounds: 40,
            edit_percent: 40,
            heartbeat_every: 5,
            truancy_timeout_ms: 1_500,
            fault: FaultConfig::default(),
            clock: ClockConfig::default(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TraceEvent {
    pub round: u64,
    pub kind: TraceEventKind,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "kebab-case")]
pub enum TraceEventKind {
    Edit {
        agent: AgentId,
        action: Action,
    },
    Send {
        from: Endpoint,
        to: Endpoint,
        kind: String,
        dropped: bool,
        duplicated: bool,
        delay_rounds: u8,
    },
    Deliver {
        from: Endpoint,
        to: Endpoint,
        kind: String,
    },
    Reorder {
        count: usize,
    },
    Partition {
        agent: AgentId,
        isolated: bool,
    },
    Freeze {
        agent: AgentId,
        rounds: u8,
    },
    /// A replica or the hub refused a message.
    Error {
        at: Endpoint,
        detail: String,
    },
    Heal,
    Drain {
        pass: u64,
        converged: bool,
    },
}

/// Everything a run produced.
#[derive(Debug, Clone)]
pub struct SimulationResult {
    pub seed: u64,
    pub trace: Vec<TraceEvent>,
    pub states: Vec<AgentState>,
    pub hub: HubSnapshot,
    /// Whether every replica matched the hub when the drain ended.
    pub converged: bool,
    /// Whether a fault actually hit: a dropped, duplicated or reordered
    /// message, a partition, or a frozen clock.
    pub interesting_state_reached: bool,
}

impl SimulationResult {
    #[must_use]
    pub fn edit_count(&self) -> usize {
        self.trace
            .iter()
            .filter(|event| matches!(event.kind, TraceEventKind::Edit { .. }))
            .count()
    }
}

pub struct Simulator {
    config: SimulationConfig,
    rng: DeterministicRng,
    network: SimulatedNetwork,
    hub: SyncHub<SimStore>,
    hub_clock: SimulatedClock,
    agents: Vec<SimulatedAgent>,
    trace: Vec<TraceEvent>,
    round: u64,
    interesting: bool,
}

impl std::fmt::Debug for Simulator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Simulator")
            .field("seed", &self.config.seed)
            .field("round", &self.round)
            .field("hub", &self.hub)
            .field("agents", &self.agents.len())
            .finish_non_exhaustive()
    }
}

impl Simulator {
    /// # Errors
    ///
    /// Returns an error if the config has no agents or a replica fails to
    /// open.
    pub fn new(config: SimulationConfig) -> Result<Self> {
        if config.agent_count == 0 {
            bail!("agent_count must be > 0");
        }
        let mut rng = DeterministicRng::new(config.seed);
        let mut clock_rng = rng.fork(0xC10C);

        let mut engine = EngineConfig::default();
        engine.sync.truancy_timeout_ms = config.truancy_timeout_ms;

        let hub_clock = SimulatedClock::new(ClockSpec::exact(&config.clock));
        let hub = SyncHub::open(
            Arc::new(MemoryStore::new()),
            SCHEMA_VERSION,
            &engine,
            hub_clock.handle(),
        )
        .context("open hub")?;

        let agents = (0..config.agent_count)
            .map(|id| {
                let clock = SimulatedClock::new(ClockSpec::draw(&config.clock, &mut clock_rng));
                SimulatedAgent::new(id, clock, &engine).with_context(|| format!("open agent {id}"))
            })
            .collect::<Result<Vec<_>>>()?;

        Ok(Self {
            network: SimulatedNetwork::new(config.fault),
            config,
            rng,
            hub,
            hub_clock,
            agents,
            trace: Vec::new(),
            round: 0,
            interesting: false,
        })
    }

    /// Run both phases and snapshot the result.
    ///
    /// # Errors
    ///
    /// Returns an error if a message fails to encode or decode, or a store
    /// read fails. Protocol refusals are traced, not returned.
    pub fn run(&mut self) -> Result<SimulationResult> {
        info!(seed = self.config.seed, agents = self.agents.len(), rounds = self.config.rounds, "simulation started");
        for _ in 0..self.config.rounds {
            self.step(true)?;
        }
        let converged = self.drain()?;
        if !converged {
            warn!(seed = self.config.seed, "replicas did not converge during drain");
        }

        let states = self
            .agents
            .iter()
            .map(SimulatedAgent::snapshot)
            .collect::<Result<Vec<_>, _>>()
            .context("snapshot agents")?;
        let hub = HubSnapshot::capture(self.hub.storage(), self.hub.global_ack()).context("snapshot hub")?;
        info!(seed = self.config.seed, converged, documents = hub.documents.len(), "simulation finished");

        Ok(SimulationResult {
            seed: self.config.seed,
            trace: std::mem::take(&mut self.trace),
            states,
            hub,
            converged,
            interesting_state_reached: self.interesting,
        })
    }

    fn record(&mut self, kind: TraceEventKind) {
        self.trace.push(TraceEvent {
            round: self.round,
            kind,
        });
    }

    /// One round: clocks, faults, edits, pushes, hub housekeeping, then
    /// delivery of everything due.
    fn step(&mut self, editing: bool) -> Result<()> {
        self.round += 1;
        let round = self.round;
        self.hub_clock.tick(round);
        for agent in &mut self.agents {
            agent.clock_mut().tick(round);
        }

        if editing {
            self.roll_faults();
            for index in 0..self.agents.len() {
                if !self.rng.hit_rate_percent(self.config.edit_percent) {
                    continue;
                }
                if let Some(action) = self.agents[index].act(&mut self.rng).context("agent edit")? {
                    self.record(TraceEventKind::Edit { agent: index, action });
                }
            }
            for index in 0..self.agents.len() {
                let agent = &self.agents[index];
                let message = match agent.outgoing() {
                    Some(message) => Some(message),
                    None if round % self.config.heartbeat_every.max(1) == 0 => Some(agent.client().heartbeat()),
                    None => None,
                };
                if let Some(message) = message {
                    self.send_to_hub(index, &message)?;
                }
            }
        }

        match self.hub.tick() {
            Ok(deliveries) => {
                for delivery in deliveries {
                    self.send_to_agent(delivery.to.as_str(), &delivery.message)?;
                }
            }
            Err(err) => self.record(TraceEventKind::Error {
                at: Endpoint::Hub,
                detail: err.to_string(),
            }),
        }

        self.deliver()
    }

    fn roll_faults(&mut self) {
        let fault = self.network.fault_config();
        if self.rng.hit_rate_percent(fault.partition_rate_percent) {
            let agent = self.rng.next_index(self.agents.len());
            let isolated = !self.network.is_partitioned(agent);
            self.network.set_partitioned(agent, isolated);
            debug!(agent, isolated, "partition toggled");
            self.interesting = true;
            self.record(TraceEventKind::Partition { agent, isolated });
        }
        if self.rng.hit_rate_percent(fault.freeze_rate_percent) {
            let agent = self.rng.next_index(self.agents.len());
            let rounds = fault.freeze_duration_rounds;
            self.agents[agent].clock_mut().freeze(self.round, u64::from(rounds));
            self.interesting = true;
            self.record(TraceEventKind::Freeze { agent, rounds });
        }
    }

    fn send(&mut self, message: NetworkMessage) {
        let (from, to, kind) = (message.from, message.to, message.kind.clone());
        let outcome = self.network.send(message, self.round, &mut self.rng);
        if outcome.dropped || outcome.duplicated {
            self.interesting = true;
        }
        self.record(TraceEventKind::Send {
            from,
            to,
            kind,
            dropped: outcome.dropped,
            duplicated: outcome.duplicated,
            delay_rounds: outcome.delay_rounds,
        });
    }

    fn send_to_hub(&mut self, agent: AgentId, message: &ClientMessage) -> Result<()> {
        let payload = encode(message).context("encode client message")?;
        self.send(NetworkMessage {
            from: Endpoint::Agent(agent),
            to: Endpoint::Hub,
            kind: message.kind().to_string(),
            payload,
        });
        Ok(())
    }

    fn send_to_agent(&mut self, replica: &str, message: &ServerMessage) -> Result<()> {
        let Some(agent) = agent_for_replica(replica) else {
            warn!(replica, "hub addressed an unknown replica");
            return Ok(());
        };
        let payload = encode(message).context("encode server message")?;
        self.send(NetworkMessage {
            from: Endpoint::Hub,
            to: Endpoint::Agent(agent),
            kind: message.kind().to_string(),
            payload,
        });
        Ok(())
    }

    fn deliver(&mut self) -> Result<()> {
        let outcome = self.network.deliver_ready(self.round, &mut self.rng);
        if outcome.reordered {
            self.interesting = true;
            self.record(TraceEventKind::Reorder {
                count: outcome.delivered.len(),
            });
        }
        for message in outcome.delivered {
            self.record(TraceEventKind::Deliver {
                from: message.from,
                to: message.to,
                kind: message.kind.clone(),
            });
            match message.to {
                Endpoint::Hub => self.deliver_to_hub(&message.payload)?,
                Endpoint::Agent(agent) => self.deliver_to_agent(agent, &message.payload)?,
            }
        }
        Ok(())
    }

    fn deliver_to_hub(&mut self, payload: &str) -> Result<()> {
        let message = decode_client_message(payload).context("decode client message")?;
        match self.hub.handle(message) {
            Ok(deliveries) => {
                for delivery in deliveries {
                    self.send_to_agent(delivery.to.as_str(), &delivery.message)?;
                }
            }
            Err(err) => self.record(TraceEventKind::Error {
                at: Endpoint::Hub,
                detail: err.to_string(),
            }),
        }
        Ok(())
    }

    fn deliver_to_agent(&mut self, agent: AgentId, payload: &str) -> Result<()> {
        let message = decode_server_message(payload).context("decode server message")?;
        let Some(target) = self.agents.get_mut(agent) else {
            bail!("delivery to unknown agent {agent}");
        };
        match target.receive(message) {
            Ok(Some(reply)) => self.send_to_hub(agent, &reply)?,
            Ok(None) => {}
            Err(err) => self.record(TraceEventKind::Error {
                at: Endpoint::Agent(agent),
                detail: err.to_string(),
            }),
        }
        Ok(())
    }

    /// Heal the network, then resync every replica until all of them
    /// match the hub.
    fn drain(&mut self) -> Result<bool> {
        self.network.heal();
        for agent in &mut self.agents {
            agent.clock_mut().unfreeze();
        }
        self.record(TraceEventKind::Heal);

        for pass in 0..MAX_DRAIN_PASSES {
            for index in 0..self.agents.len() {
                let request = self.agents[index].client().sync_request();
                self.send_to_hub(index, &request)?;
            }
            for _ in 0..MAX_DRAIN_STEPS {
                self.step(false)?;
                if self.network.pending_len() == 0 {
                    break;
                }
            }
            let converged = self.converged()?;
            self.record(TraceEventKind::Drain { pass, converged });
            if converged {
                return Ok(true);
            }
        }
        Ok(false)
    }

    fn converged(&self) -> Result<bool> {
        let hub = HubSnapshot::capture(self.hub.storage(), self.hub.global_ack())?;
        for agent in &self.agents {
            let state = agent.snapshot()?;
            if state.pending > 0 || state.documents != hub.documents {
                return Ok(false);
            }
        }
        Ok(true)
    }
}
