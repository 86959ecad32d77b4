//! In-memory [`Storage`] implementation.
//!
//! Batches are applied to a copy of the state and swapped in only when every
//! write succeeded. Tests can make commits fail on demand to exercise the
//! rollback paths of rebase and migration.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Mutex, MutexGuard};

use super::{Storage, StoreError, WriteBatch, WriteOp};
use crate::clock::Timestamp;
use crate::oid::{Oid, OidRange};
use crate::operation::{Baseline, Operation};
use crate::replica::ReplicaInfo;

#[derive(Debug, Clone, Default)]
struct MemoryState {
    operations: BTreeMap<String, BTreeMap<Timestamp, Operation>>,
    baselines: BTreeMap<String, Baseline>,
    replicas: BTreeMap<String, ReplicaInfo>,
    meta: BTreeMap<String, String>,
}

#[derive(Debug, Default)]
struct FailurePlan {
    touching: Vec<Oid>,
}

/// Ordered in-memory store.
#[derive(Debug, Default)]
pub struct MemoryStore {
    state: Mutex<MemoryState>,
    failures: Mutex<FailurePlan>,
    fail_next: AtomicUsize,
}

impl MemoryStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Make the next `n` commits fail without applying anything.
    pub fn fail_next_commits(&self, n: usize) {
        self.fail_next.store(n, Ordering::SeqCst);
    }

    /// Make every commit that writes to `oid` fail until cleared.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Poisoned`] if the failure plan lock is poisoned.
    pub fn fail_commits_touching(&self, oid: Oid) -> Result<(), StoreError> {
        self.failures
            .lock()
            .map_err(|_| StoreError::Poisoned)?
            .touching
            .push(oid);
        Ok(())
    }

    /// Remove every injected failure.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Poisoned`] if the failure plan lock is poisoned.
    pub fn clear_failures(&self) -> Result<(), StoreError> {
        self.fail_next.store(0, Ordering::SeqCst);
        self.failures
            .lock()
            .map_err(|_| StoreError::Poisoned)?
            .touching
            .clear();
        Ok(())
    }

    /// Total number of stored operations.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Poisoned`] if the state lock is poisoned.
    pub fn operation_count(&self) -> Result<usize, StoreError> {
        Ok(self.lock()?.operations.values().map(BTreeMap::len).sum())
    }

    fn lock(&self) -> Result<MutexGuard<'_, MemoryState>, StoreError> {
        self.state.lock().map_err(|_| StoreError::Poisoned)
    }

    fn check_injected(&self, batch: &WriteBatch) -> Result<(), StoreError> {
        let pending = self.fail_next.load(Ordering::SeqCst);
        if pending > 0 {
            self.fail_next.store(pending - 1, Ordering::SeqCst);
            return Err(StoreError::Injected("commit failure".to_string()));
        }
        let plan = self.failures.lock().map_err(|_| StoreError::Poisoned)?;
        if let Some(oid) = batch
            .writes
            .iter()
            .filter_map(WriteOp::oid)
            .find(|oid| plan.touching.contains(oid))
        {
            return Err(StoreError::Injected(format!("commit touching {oid}")));
        }
        Ok(())
    }
}

fn scan<'a, V: 'a>(
    map: &'a BTreeMap<String, V>,
    range: &OidRange,
) -> impl Iterator<Item = &'a V> + 'a {
    map.range(range.start.clone()..range.end.clone()).map(|(_, v)| v)
}

impl Storage for MemoryStore {
    fn operations_in(&self, range: &OidRange) -> Result<Vec<Operation>, StoreError> {
        let state = self.lock()?;
        Ok(scan(&state.operations, range)
            .flat_map(BTreeMap::values)
            .cloned()
            .collect())
    }

    fn baselines_in(&self, range: &OidRange) -> Result<Vec<Baseline>, StoreError> {
        let state = self.lock()?;
        Ok(scan(&state.baselines, range).cloned().collect())
    }

    fn operations_through(&self, cutoff: &Timestamp) -> Result<Vec<Operation>, StoreError> {
        let state = self.lock()?;
        let mut ops: Vec<Operation> = state
            .operations
            .values()
            .flat_map(|by_ts| by_ts.range(..=cutoff.clone()).map(|(_, op)| op.clone()))
            .collect();
        ops.sort_by(|a, b| a.timestamp.cmp(&b.timestamp));
        Ok(ops)
    }

    fn operations_after(&self, since: Option<&Timestamp>) -> Result<Vec<Operation>, StoreError> {
        let state = self.lock()?;
        let mut ops: Vec<Operation> = state
            .operations
            .values()
            .flat_map(BTreeMap::values)
            .filter(|op| since.is_none_or(|s| op.timestamp > *s))
            .cloned()
            .collect();
        ops.sort_by(|a, b| a.timestamp.cmp(&b.timestamp));
        Ok(ops)
    }

    fn all_baselines(&self) -> Result<Vec<Baseline>, StoreError> {
        Ok(self.lock()?.baselines.values().cloned().collect())
    }

    fn meta(&self, key: &str) -> Result<Option<String>, StoreError> {
        Ok(self.lock()?.meta.get(key).cloned())
    }

    fn replicas(&self) -> Result<Vec<ReplicaInfo>, StoreError> {
        Ok(self.lock()?.replicas.values().cloned().collect())
    }

    fn commit(&self, batch: WriteBatch) -> Result<(), StoreError> {
        self.check_injected(&batch)?;
        let mut state = self.lock()?;
        let mut next = state.clone();
        for write in batch.writes {
            match write {
                WriteOp::PutOperation(op) => {
                    next.operations
                        .entry(op.oid.as_str().to_string())
                        .or_default()
                        .entry(op.timestamp.clone())
                        .or_insert(op);
                }
                WriteOp::DeleteOperation { oid, timestamp } => {
                    if let Some(by_ts) = next.operations.get_mut(oid.as_str()) {
                        by_ts.remove(&timestamp);
                        if by_ts.is_empty() {
                            next.operations.remove(oid.as_str());
                        }
                    }
                }
                WriteOp::PutBaseline(baseline) => {
                    next.baselines
                        .insert(baseline.oid.as_str().to_string(), baseline);
                }
                WriteOp::DeleteBaseline(oid) => {
                    next.baselines.remove(oid.as_str());
                }
                WriteOp::PutReplica(info) => {
                    next.replicas.insert(info.id.as_str().to_string(), info);
                }
                WriteOp::SetMeta { key, value } => {
                    next.meta.insert(key, value);
                }
            }
        }
        *state = next;
        Ok(())
    }
}
