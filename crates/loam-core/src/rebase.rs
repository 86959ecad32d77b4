//! Baseline compaction ("rebase").
//!
//! Once every live replica has acknowledged a cutoff timestamp, the
//! operations at or below it can be folded into baselines and discarded.
//! [`plan_rebase`] computes what to write for one OID as a pure function;
//! [`Rebaser::run`] applies one plan per OID as a single atomic
//! [`WriteBatch`], so an OID always has either its old baseline and
//! operations or the new baseline, never a mix.
//!
//! A failed batch is logged and counted; the OID keeps its old state and is
//! picked up again on the next cycle.

use std::collections::BTreeMap;

use serde_json::Value;
use tracing::{debug, info, instrument, warn};

use crate::clock::Timestamp;
use crate::error::ErrorCode;
use crate::merge::{ObjectState, merge};
use crate::oid::{Oid, oid_range};
use crate::operation::{Baseline, Operation};
use crate::store::{Storage, StoreError, WriteBatch};

#[derive(Debug, thiserror::Error)]
pub enum RebaseError {
    #[error("could not read rebase candidates: {0}")]
    Store(#[from] StoreError),

    #[error("rebase of {oid} does not reproduce the merged value")]
    Diverged { oid: Oid },
}

impl RebaseError {
    #[must_use]
    pub const fn code(&self) -> ErrorCode {
        ErrorCode::RebaseFailed
    }
}

/// What happens to the baseline row of an OID.
#[derive(Debug, Clone, PartialEq)]
pub enum BaselineAction {
    /// Write a new baseline stamped at the cutoff.
    Put(Baseline),
    /// The OID is tombstoned: drop any baseline.
    Remove,
}

/// The writes that compact one OID.
#[derive(Debug, Clone, PartialEq)]
pub struct RebasePlan {
    pub oid: Oid,
    pub action: BaselineAction,
    /// Timestamps of every operation the plan deletes.
    pub compacted: Vec<Timestamp>,
}

impl RebasePlan {
    /// The plan as one atomic batch.
    #[must_use]
    pub fn to_batch(&self) -> WriteBatch {
        let mut batch = WriteBatch::new();
        match &self.action {
            BaselineAction::Put(baseline) => batch.put_baseline(baseline.clone()),
            BaselineAction::Remove => batch.delete_baseline(self.oid.clone()),
        };
        for ts in &self.compacted {
            batch.delete_operation(self.oid.clone(), ts.clone());
        }
        batch
    }
}

/// Plan the compaction of `oid` at `cutoff`.
///
/// Operations above the cutoff are left alone. Operations already covered
/// by `baseline` are deleted along with the newly folded ones. Returns
/// `None` when there is nothing at or below the cutoff to fold, or when
/// nothing at or below it creates the object: a replica that has not yet
/// received an `Initialize` keeps the later edits until it arrives.
#[must_use]
pub fn plan_rebase(
    oid: &Oid,
    baseline: Option<&Baseline>,
    ops: &[Operation],
    cutoff: &Timestamp,
) -> Option<RebasePlan> {
    let eligible: Vec<Operation> = ops
        .iter()
        .filter(|op| op.oid == *oid && op.timestamp <= *cutoff)
        .cloned()
        .collect();
    if eligible.is_empty() {
        return None;
    }

    let merged = merge(oid, baseline, &eligible);
    let action = match merged.state {
        ObjectState::Live(snapshot) => BaselineAction::Put(Baseline {
            oid: oid.clone(),
            snapshot,
            timestamp: cutoff.clone(),
            authz: merged.authz,
        }),
        ObjectState::Deleted => BaselineAction::Remove,
        ObjectState::Absent => {
            debug!(
                oid = %oid,
                eligible = eligible.len(),
                "no create at or below cutoff; keeping history"
            );
            return None;
        }
    };

    let mut compacted: Vec<Timestamp> = eligible.into_iter().map(|op| op.timestamp).collect();
    compacted.sort();
    compacted.dedup();

    Some(RebasePlan {
        oid: oid.clone(),
        action,
        compacted,
    })
}

/// Outcome counters of one rebase cycle.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RebaseReport {
    /// OIDs whose batch committed.
    pub oids_rebased: usize,
    /// Operations deleted across all committed batches.
    pub operations_compacted: usize,
    pub baselines_written: usize,
    pub baselines_removed: usize,
    /// OIDs whose batch failed; they are retried next cycle.
    pub failed: Vec<Oid>,
}

/// Drives compaction against a store.
#[derive(Debug, Clone, Copy)]
pub struct Rebaser {
    enabled: bool,
}

impl Default for Rebaser {
    fn default() -> Self {
        Self { enabled: true }
    }
}

impl Rebaser {
    #[must_use]
    pub const fn new(enabled: bool) -> Self {
        Self { enabled }
    }

    #[must_use]
    pub const fn is_enabled(&self) -> bool {
        self.enabled
    }

    /// Compact every OID that has operations at or below `cutoff`.
    ///
    /// When disabled, returns an empty report without touching the store.
    ///
    /// # Errors
    ///
    /// Returns [`RebaseError::Store`] only if the candidate scan fails.
    /// Per-OID failures are reported in [`RebaseReport::failed`].
    #[instrument(skip(self, store), fields(cutoff = %cutoff))]
    pub fn run(&self, store: &dyn Storage, cutoff: &Timestamp) -> Result<RebaseReport, RebaseError> {
        let mut report = RebaseReport::default();
        if !self.enabled {
            debug!("rebase disabled; keeping full history");
            return Ok(report);
        }

        let mut by_oid: BTreeMap<Oid, Vec<Operation>> = BTreeMap::new();
        for op in store.operations_through(cutoff)? {
            by_oid.entry(op.oid.clone()).or_default().push(op);
        }

        // Roots removed this cycle. Descendants sort right after their root,
        // so they are already folded away when the loop reaches them.
        let mut tombstoned: Vec<Oid> = Vec::new();
        for (oid, ops) in by_oid {
            if tombstoned.iter().any(|root| oid.is_descendant_of(root)) {
                continue;
            }
            let baseline = match store.baseline(&oid) {
                Ok(baseline) => baseline,
                Err(err) => {
                    warn!(oid = %oid, error = %err, "rebase skipped: baseline read failed");
                    report.failed.push(oid);
                    continue;
                }
            };
            let Some(plan) = plan_rebase(&oid, baseline.as_ref(), &ops, cutoff) else {
                continue;
            };

            let mut compacted = plan.compacted.len();
            let wrote_baseline = matches!(plan.action, BaselineAction::Put(_));
            let mut batch = plan.to_batch();
            let mut children = 0;
            if !wrote_baseline && oid.is_root() {
                match fold_descendants(store, &oid, cutoff, &mut batch) {
                    Ok((ops, baselines)) => {
                        compacted += ops;
                        children = baselines;
                    }
                    Err(err) => {
                        warn!(oid = %oid, error = %err, "rebase skipped: descendant scan failed");
                        report.failed.push(oid);
                        continue;
                    }
                }
            }
            match store.commit(batch) {
                Ok(()) => {
                    report.oids_rebased += 1;
                    report.operations_compacted += compacted;
                    if wrote_baseline {
                        report.baselines_written += 1;
                    } else {
                        report.baselines_removed += 1 + children;
                        if oid.is_root() {
                            tombstoned.push(oid);
                        }
                    }
                }
                Err(err) => {
                    warn!(oid = %oid, error = %err, "rebase abandoned for this cycle");
                    report.failed.push(oid);
                }
            }
        }

        info!(
            oids = report.oids_rebased,
            operations = report.operations_compacted,
            failed = report.failed.len(),
            "rebase cycle complete"
        );
        Ok(report)
    }
}

/// Queue the removal of everything below a tombstoned root: operations at or
/// below `cutoff` and every baseline. Later operations stay, since a newer
/// `Initialize` of the root may still bring the children back.
///
/// Returns the number of operations and baselines queued.
fn fold_descendants(
    store: &dyn Storage,
    root: &Oid,
    cutoff: &Timestamp,
    batch: &mut WriteBatch,
) -> Result<(usize, usize), StoreError> {
    let range = oid_range(root);
    let mut ops = 0;
    for op in store.operations_in(&range)? {
        if op.oid != *root && op.timestamp <= *cutoff {
            batch.delete_operation(op.oid, op.timestamp);
            ops += 1;
        }
    }
    let mut baselines = 0;
    for baseline in store.baselines_in(&range)? {
        if baseline.oid != *root {
            batch.delete_baseline(baseline.oid);
            baselines += 1;
        }
    }
    if ops + baselines > 0 {
        debug!(root = %root, ops, baselines, "folding descendants of deleted root");
    }
    Ok((ops, baselines))
}

/// Check that a baseline plus the remaining operations reproduce the value
/// obtained from the full history.
///
/// # Errors
///
/// Returns [`RebaseError::Diverged`] if the two values differ.
pub fn verify_rebase(
    oid: &Oid,
    full_history: &[Operation],
    baseline: Option<&Baseline>,
    remaining: &[Operation],
) -> Result<(), RebaseError> {
    let expected: Option<Value> = merge(oid, None, full_history).value().cloned();
    let actual: Option<Value> = merge(oid, baseline, remaining).value().cloned();
    if expected == actual {
        Ok(())
    } else {
        Err(RebaseError::Diverged { oid: oid.clone() })
    }
}
