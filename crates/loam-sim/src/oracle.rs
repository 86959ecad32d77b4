//! Invariant checks over the final state of a run.
//!
//! Every check compares replicas against the hub, which holds the
//! authoritative history after the drain phase.

use std::collections::BTreeMap;
use std::sync::Arc;

use loam_core::clock::Timestamp;
use loam_core::operation::{Baseline, Operation};
use loam_core::store::{MemoryStore, Storage, StoreError, WriteBatch, documents};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::agent::{AgentId, AgentState, COLLECTION};
use crate::rng::DeterministicRng;

/// Number of shuffled replays tried by the commutativity check.
const PERMUTATIONS: usize = 3;

/// Documents keyed by OID text.
pub type Documents = BTreeMap<String, Value>;

/// Outcome of one or more invariant checks.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OracleResult {
    pub passed: bool,
    pub violations: Vec<InvariantViolation>,
}

impl OracleResult {
    const fn pass() -> Self {
        Self {
            passed: true,
            violations: Vec::new(),
        }
    }

    fn from_violations(violations: Vec<InvariantViolation>) -> Self {
        Self {
            passed: violations.is_empty(),
            violations,
        }
    }

    #[must_use]
    fn merge(mut self, other: Self) -> Self {
        if !other.passed {
            self.passed = false;
            self.violations.extend(other.violations);
        }
        self
    }
}

/// A failed invariant, with enough detail to start debugging a replay.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "invariant", rename_all = "kebab-case")]
pub enum InvariantViolation {
    /// A replica's documents differ from the hub's after the drain.
    Convergence {
        agent: AgentId,
        only_on_agent: Vec<String>,
        only_on_hub: Vec<String>,
        differing: Vec<String>,
    },
    /// Replaying the hub's history in another order changed the result.
    Commutativity { permutation: usize, differing: Vec<String> },
    /// Storing the hub's history twice changed the result.
    Idempotence { differing: Vec<String> },
    /// A replica minted a timestamp not above its previous one.
    ClockRegression {
        agent: AgentId,
        previous: String,
        next: String,
    },
    /// A replica still holds work the hub never confirmed.
    UnconfirmedWork { agent: AgentId, pending: usize },
    /// A replica believes in a global ack the hub never reached.
    AckAhead {
        agent: AgentId,
        agent_ack: String,
        hub_ack: Option<String>,
    },
}

impl std::fmt::Display for InvariantViolation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Convergence {
                agent,
                only_on_agent,
                only_on_hub,
                differing,
            } => write!(
                f,
                "convergence: agent {agent} diverges from the hub \
                 (only_on_agent={only_on_agent:?}, only_on_hub={only_on_hub:?}, differing={differing:?})"
            ),
            Self::Commutativity {
                permutation,
                differing,
            } => write!(f, "commutativity: permutation {permutation} diverges on {differing:?}"),
            Self::Idempotence { differing } => {
                write!(f, "idempotence: re-storing history changed {differing:?}")
            }
            Self::ClockRegression {
                agent,
                previous,
                next,
            } => write!(f, "clock: agent {agent} minted {next} after {previous}"),
            Self::UnconfirmedWork { agent, pending } => {
                write!(f, "unconfirmed: agent {agent} still holds {pending} pending operations")
            }
            Self::AckAhead {
                agent,
                agent_ack,
                hub_ack,
            } => write!(f, "ack: agent {agent} holds global ack {agent_ack}, hub has {hub_ack:?}"),
        }
    }
}

/// The hub's view at the end of a run.
#[derive(Debug, Clone, PartialEq)]
pub struct HubSnapshot {
    pub documents: Documents,
    pub baselines: Vec<Baseline>,
    pub operations: Vec<Operation>,
    pub global_ack: Option<Timestamp>,
}

impl HubSnapshot {
    /// # Errors
    ///
    /// Returns [`StoreError`] if reading the hub store failed.
    pub fn capture(storage: &dyn Storage, global_ack: Option<&Timestamp>) -> Result<Self, StoreError> {
        Ok(Self {
            documents: collect_documents(storage)?,
            baselines: storage.all_baselines()?,
            operations: storage.operations_after(None)?,
            global_ack: global_ack.cloned(),
        })
    }
}

fn collect_documents(storage: &dyn Storage) -> Result<Documents, StoreError> {
    Ok(documents(storage, COLLECTION)?
        .into_iter()
        .map(|(oid, doc)| (oid.to_string(), doc))
        .collect())
}

/// Keys whose values differ between two document sets, including keys
/// present on one side only.
fn diff_keys(left: &Documents, right: &Documents) -> Vec<String> {
    let mut keys: Vec<String> = left
        .iter()
        .filter(|(key, value)| right.get(*key) != Some(*value))
        .map(|(key, _)| key.clone())
        .collect();
    keys.extend(right.keys().filter(|key| !left.contains_key(*key)).cloned());
    keys.sort();
    keys
}

/// Store `baselines` and `operations` in the given order into a fresh
/// store, `times` times over, and read the documents back.
fn replay(baselines: &[Baseline], operations: &[Operation], times: usize) -> Result<Documents, StoreError> {
    let store = Arc::new(MemoryStore::new());
    for _ in 0..times {
        let mut batch = WriteBatch::new();
        for baseline in baselines {
            batch.put_baseline(baseline.clone());
        }
        for op in operations {
            batch.put_operation(op.clone());
        }
        store.commit(batch)?;
    }
    collect_documents(&store)
}

pub struct ConvergenceOracle;

impl ConvergenceOracle {
    /// Every replica shows exactly the hub's documents.
    #[must_use]
    pub fn check_convergence(states: &[AgentState], hub: &HubSnapshot) -> OracleResult {
        let violations = states
            .iter()
            .filter(|state| state.documents != hub.documents)
            .map(|state| InvariantViolation::Convergence {
                agent: state.id,
                only_on_agent: state
                    .documents
                    .keys()
                    .filter(|key| !hub.documents.contains_key(*key))
                    .cloned()
                    .collect(),
                only_on_hub: hub
                    .documents
                    .keys()
                    .filter(|key| !state.documents.contains_key(*key))
                    .cloned()
                    .collect(),
                differing: state
                    .documents
                    .iter()
                    .filter(|(key, value)| hub.documents.get(*key).is_some_and(|hub_value| hub_value != *value))
                    .map(|(key, _)| key.clone())
                    .collect(),
            })
            .collect();
        OracleResult::from_violations(violations)
    }

    /// The hub's history yields the same documents in any storage order.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] if a scratch store fails.
    pub fn check_commutativity(hub: &HubSnapshot, rng: &mut DeterministicRng) -> Result<OracleResult, StoreError> {
        let mut violations = Vec::new();
        for permutation in 0..PERMUTATIONS {
            let mut operations = hub.operations.clone();
            let mut baselines = hub.baselines.clone();
            rng.shuffle(&mut operations);
            rng.shuffle(&mut baselines);
            let replayed = replay(&baselines, &operations, 1)?;
            let differing = diff_keys(&replayed, &hub.documents);
            if !differing.is_empty() {
                violations.push(InvariantViolation::Commutativity {
                    permutation,
                    differing,
                });
            }
        }
        Ok(OracleResult::from_violations(violations))
    }

    /// Storing the hub's history twice yields the same documents as once.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] if a scratch store fails.
    pub fn check_idempotence(hub: &HubSnapshot) -> Result<OracleResult, StoreError> {
        let differing = diff_keys(&replay(&hub.baselines, &hub.operations, 2)?, &hub.documents);
        if differing.is_empty() {
            Ok(OracleResult::pass())
        } else {
            Ok(OracleResult::from_violations(vec![InvariantViolation::Idempotence { differing }]))
        }
    }

    /// Each replica minted strictly increasing timestamps.
    #[must_use]
    pub fn check_clock_monotonicity(states: &[AgentState]) -> OracleResult {
        let violations = states
            .iter()
            .flat_map(|state| {
                state
                    .authored
                    .windows(2)
                    .filter(|pair| pair[0] >= pair[1])
                    .map(|pair| InvariantViolation::ClockRegression {
                        agent: state.id,
                        previous: pair[0].to_string(),
                        next: pair[1].to_string(),
                    })
            })
            .collect();
        OracleResult::from_violations(violations)
    }

    /// Nothing is left unconfirmed and no replica is ahead of the hub's
    /// global ack.
    #[must_use]
    pub fn check_acknowledgement(states: &[AgentState], hub: &HubSnapshot) -> OracleResult {
        let mut violations = Vec::new();
        for state in states {
            if state.pending > 0 {
                violations.push(InvariantViolation::UnconfirmedWork {
                    agent: state.id,
                    pending: state.pending,
                });
            }
            if let Some(agent_ack) = &state.global_ack
                && hub.global_ack.as_ref().is_none_or(|hub_ack| agent_ack > hub_ack)
            {
                violations.push(InvariantViolation::AckAhead {
                    agent: state.id,
                    agent_ack: agent_ack.to_string(),
                    hub_ack: hub.global_ack.as_ref().map(ToString::to_string),
                });
            }
        }
        OracleResult::from_violations(violations)
    }

    /// Run every check.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] if a scratch store fails.
    pub fn check_all(
        states: &[AgentState],
        hub: &HubSnapshot,
        rng: &mut DeterministicRng,
    ) -> Result<OracleResult, StoreError> {
        Ok(OracleResult::pass()
            .merge(Self::check_convergence(states, hub))
            .merge(Self::check_commutativity(hub, rng)?)
            .merge(Self::check_idempotence(hub)?)
            .merge(Self::check_clock_monotonicity(states))
            .merge(Self::check_acknowledgement(states, hub)))
    }
}
