use std::collections::BTreeSet;
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::agent::AgentId;
use crate::rng::DeterministicRng;

/// Fault injection settings for the simulated network.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct FaultConfig {
    /// Maximum delivery delay in rounds.
    pub max_delay_rounds: u8,
    /// Percentage of sends dropped.
    pub drop_rate_percent: u8,
    /// Percentage of sends duplicated.
    pub duplicate_rate_percent: u8,
    /// Percentage chance of reversing the ready messages of a round.
    pub reorder_rate_percent: u8,
    /// Percentage chance per round to toggle a random replica's partition.
    pub partition_rate_percent: u8,
    /// Percentage chance per round to freeze a random replica's clock.
    pub freeze_rate_percent: u8,
    /// Rounds a frozen clock stays frozen.
    pub freeze_duration_rounds: u8,
}

impl Default for FaultConfig {
    fn default() -> Self {
        Self {
            max_delay_rounds: 2,
            drop_rate_percent: 5,
            duplicate_rate_percent: 3,
            reorder_rate_percent: 5,
            partition_rate_percent: 2,
            freeze_rate_percent: 2,
            freeze_duration_rounds: 2,
        }
    }
}

impl FaultConfig {
    /// A network that delivers everything, once, in order, immediately.
    #[must_use]
    pub const fn none() -> Self {
        Self {
            max_delay_rounds: 0,
            drop_rate_percent: 0,
            duplicate_rate_percent: 0,
            reorder_rate_percent: 0,
            partition_rate_percent: 0,
            freeze_rate_percent: 0,
            freeze_duration_rounds: 0,
        }
    }
}

/// One end of a link. Replicas only ever talk to the hub.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum Endpoint {
    Hub,
    Agent(AgentId),
}

impl Endpoint {
    #[must_use]
    pub const fn agent(self) -> Option<AgentId> {
        match self {
            Self::Hub => None,
            Self::Agent(id) => Some(id),
        }
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Hub => f.write_str("hub"),
            Self::Agent(id) => write!(f, "agent-{id}"),
        }
    }
}

/// An encoded protocol message in flight.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NetworkMessage {
    pub from: Endpoint,
    pub to: Endpoint,
    /// Message kind, for the trace.
    pub kind: String,
    /// The JSON wire form.
    pub payload: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct PendingMessage {
    deliver_at_round: u64,
    message: NetworkMessage,
}

/// What happened to a send.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SendOutcome {
    pub dropped: bool,
    pub duplicated: bool,
    pub delay_rounds: u8,
}

impl SendOutcome {
    const DROPPED: Self = Self {
        dropped: true,
        duplicated: false,
        delay_rounds: 0,
    };
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeliverOutcome {
    pub delivered: Vec<NetworkMessage>,
    pub reordered: bool,
}

/// Deterministic lossy network between the hub and its replicas.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SimulatedNetwork {
    pending: Vec<PendingMessage>,
    partitioned: BTreeSet<AgentId>,
    fault: FaultConfig,
}

impl SimulatedNetwork {
    #[must_use]
    pub const fn new(fault: FaultConfig) -> Self {
        Self {
            pending: Vec::new(),
            partitioned: BTreeSet::new(),
            fault,
        }
    }

    #[must_use]
    pub const fn fault_config(&self) -> FaultConfig {
        self.fault
    }

    /// Cut a replica off from the hub, or reconnect it.
    pub fn set_partitioned(&mut self, agent: AgentId, isolated: bool) {
        if isolated {
            self.partitioned.insert(agent);
        } else {
            self.partitioned.remove(&agent);
        }
    }

    #[must_use]
    pub fn is_partitioned(&self, agent: AgentId) -> bool {
        self.partitioned.contains(&agent)
    }

    /// Reconnect everyone and stop injecting faults. Messages already in
    /// flight keep their delivery round.
    pub fn heal(&mut self) {
        self.partitioned.clear();
        self.fault = FaultConfig::none();
    }

    #[must_use]
    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }

    /// True if either end is cut off.
    fn severed(&self, message: &NetworkMessage) -> bool {
        [message.from, message.to]
            .iter()
            .filter_map(|end| end.agent())
            .any(|agent| self.is_partitioned(agent))
    }

    pub fn send(
        &mut self,
        message: NetworkMessage,
        round: u64,
        rng: &mut DeterministicRng,
    ) -> SendOutcome {
        if self.severed(&message) || rng.hit_rate_percent(self.fault.drop_rate_percent) {
            return SendOutcome::DROPPED;
        }

        let delay_bound = u64::from(self.fault.max_delay_rounds) + 1;
        let delay = u8::try_from(rng.next_bounded(delay_bound)).unwrap_or(self.fault.max_delay_rounds);
        let deliver_at_round = round.saturating_add(u64::from(delay));

        let duplicated = rng.hit_rate_percent(self.fault.duplicate_rate_percent);
        if duplicated {
            self.pending.push(PendingMessage {
                deliver_at_round,
                message: message.clone(),
            });
        }
        self.pending.push(PendingMessage {
            deliver_at_round,
            message,
        });

        SendOutcome {
            dropped: false,
            duplicated,
            delay_rounds: delay,
        }
    }

    /// Take every message due by `round`. Messages to or from a replica
    /// that was partitioned while they were in flight are lost.
    pub fn deliver_ready(&mut self, round: u64, rng: &mut DeterministicRng) -> DeliverOutcome {
        let (ready, future): (Vec<_>, Vec<_>) = self
            .pending
            .drain(..)
            .partition(|pending| pending.deliver_at_round <= round);
        self.pending = future;

        let mut delivered: Vec<NetworkMessage> = ready
            .into_iter()
            .map(|pending| pending.message)
            .filter(|message| !self.severed(message))
            .collect();

        let reordered = delivered.len() > 1 && rng.hit_rate_percent(self.fault.reorder_rate_percent);
        if reordered {
            delivered.reverse();
        }

        DeliverOutcome {
            delivered,
            reordered,
        }
    }
}
