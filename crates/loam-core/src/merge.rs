//! Deterministic merge of a baseline and an operation stream.
//!
//! [`merge`] is a pure fold: it sorts its input by timestamp, so the result
//! depends only on the operation *set*, never on arrival order. Duplicate
//! `(oid, timestamp)` identities collapse to the first occurrence and
//! anything at or below the baseline timestamp is already folded into the
//! baseline and skipped.
//!
//! Per patch kind:
//!
//! * `Initialize` replaces the whole object, and is the only patch that
//!   revives a tombstone.
//! * `Set` / `Remove` replay in timestamp order, which makes every field
//!   last-write-wins.
//! * List patches replay positionally in timestamp order, so concurrent
//!   inserts at one index end up ordered by timestamp.
//! * `Delete` tombstones the object.
//!
//! Patches that do not fit the current shape are skipped. Skipping depends
//! only on the folded state, so every replica skips the same patches.

use std::collections::BTreeMap;

use serde_json::Value;
use tracing::debug;

use crate::authz::Authorization;
use crate::clock::Timestamp;
use crate::oid::Oid;
use crate::operation::{Baseline, Operation, Patch, denormalize};

/// State of one OID after merging.
#[derive(Debug, Clone, PartialEq)]
pub enum ObjectState {
    /// Never initialized.
    Absent,
    /// Present with a shallow value.
    Live(Value),
    /// Tombstoned.
    Deleted,
}

/// Result of folding one OID.
#[derive(Debug, Clone, PartialEq)]
pub struct MergedObject {
    pub oid: Oid,
    pub state: ObjectState,
    /// Greatest timestamp folded into this state (baseline included).
    pub latest: Option<Timestamp>,
    /// Most recent authorization tag seen on the baseline or an applied op.
    pub authz: Option<Authorization>,
}

impl MergedObject {
    #[must_use]
    pub const fn value(&self) -> Option<&Value> {
        match &self.state {
            ObjectState::Live(value) => Some(value),
            ObjectState::Absent | ObjectState::Deleted => None,
        }
    }

    #[must_use]
    pub const fn is_deleted(&self) -> bool {
        matches!(self.state, ObjectState::Deleted)
    }
}

/// Fold `baseline` and `ops` for `oid` into its current state.
///
/// Operations addressed to other OIDs are ignored.
#[must_use]
pub fn merge(oid: &Oid, baseline: Option<&Baseline>, ops: &[Operation]) -> MergedObject {
    let floor = baseline.map(|b| &b.timestamp);

    let mut ordered: Vec<&Operation> = ops.iter().filter(|op| op.oid == *oid).collect();
    // Stable sort keeps the first occurrence of a duplicate identity first.
    ordered.sort_by(|a, b| a.timestamp.cmp(&b.timestamp));
    ordered.dedup_by(|later, earlier| later.timestamp == earlier.timestamp);

    let mut merged = MergedObject {
        oid: oid.clone(),
        state: baseline.map_or(ObjectState::Absent, |b| ObjectState::Live(b.snapshot.clone())),
        latest: floor.cloned(),
        authz: baseline.and_then(|b| b.authz.clone()),
    };

    for op in ordered {
        if floor.is_some_and(|f| op.timestamp <= *f) {
            continue;
        }
        match apply_patch(&mut merged.state, &op.data) {
            Ok(()) => {
                merged.latest = Some(op.timestamp.clone());
                if op.authz.is_some() {
                    merged.authz.clone_from(&op.authz);
                }
            }
            Err(reason) => {
                debug!(
                    oid = %op.oid,
                    timestamp = %op.timestamp,
                    patch = op.data.kind(),
                    reason,
                    "skipping patch"
                );
            }
        }
    }

    merged
}

/// Apply one patch to a folded state.
///
/// # Errors
///
/// Returns a short reason when the patch does not fit the current state.
/// The state is left untouched in that case.
pub fn apply_patch(state: &mut ObjectState, patch: &Patch) -> Result<(), &'static str> {
    match patch {
        Patch::Initialize { value } => {
            *state = ObjectState::Live(value.clone());
            return Ok(());
        }
        Patch::Delete => {
            return match state {
                ObjectState::Live(_) => {
                    *state = ObjectState::Deleted;
                    Ok(())
                }
                ObjectState::Deleted => Err("already deleted"),
                ObjectState::Absent => Err("delete of absent object"),
            };
        }
        _ => {}
    }

    let value = match state {
        ObjectState::Live(value) => value,
        ObjectState::Absent => return Err("edit of absent object"),
        ObjectState::Deleted => return Err("edit of deleted object"),
    };

    match patch {
        Patch::Set { name, value: field } => {
            let map = value.as_object_mut().ok_or("field set on non-object")?;
            map.insert(name.clone(), field.clone());
        }
        Patch::Remove { name } => {
            let map = value.as_object_mut().ok_or("field remove on non-object")?;
            map.remove(name);
        }
        Patch::ListInsert { index, value: item } => {
            let list = value.as_array_mut().ok_or("list insert on non-list")?;
            let at = (*index).min(list.len());
            list.insert(at, item.clone());
        }
        Patch::ListDelete { index, count } => {
            let list = value.as_array_mut().ok_or("list delete on non-list")?;
            if *index >= list.len() {
                return Err("list delete out of bounds");
            }
            let end = index.saturating_add(*count).min(list.len());
            list.drain(*index..end);
        }
        Patch::ListSet { index, value: item } => {
            let list = value.as_array_mut().ok_or("list set on non-list")?;
            match (*index).cmp(&list.len()) {
                std::cmp::Ordering::Less => list[*index] = item.clone(),
                std::cmp::Ordering::Equal => list.push(item.clone()),
                std::cmp::Ordering::Greater => return Err("list set out of bounds"),
            }
        }
        Patch::ListPush { value: item } => {
            let list = value.as_array_mut().ok_or("list push on non-list")?;
            list.push(item.clone());
        }
        Patch::ListMove { from, to } => {
            let list = value.as_array_mut().ok_or("list move on non-list")?;
            if *from >= list.len() {
                return Err("list move out of bounds");
            }
            let item = list.remove(*from);
            let at = (*to).min(list.len());
            list.insert(at, item);
        }
        Patch::Initialize { .. } | Patch::Delete => {}
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Subtree merge
// ---------------------------------------------------------------------------

/// A whole document merged and reassembled.
#[derive(Debug, Clone, PartialEq)]
pub struct MergedDocument {
    pub root: Oid,
    /// Denormalized document, or `None` if the root is absent or deleted.
    pub value: Option<Value>,
    /// Every OID in the subtree that had a baseline or an operation.
    pub objects: BTreeMap<Oid, MergedObject>,
}

impl MergedDocument {
    /// Greatest timestamp folded anywhere in the document.
    #[must_use]
    pub fn latest(&self) -> Option<&Timestamp> {
        self.objects.values().filter_map(|o| o.latest.as_ref()).max()
    }
}

/// Merge every OID that has a baseline or an operation in `baselines`/`ops`.
#[must_use]
pub fn merge_all(baselines: &[Baseline], ops: &[Operation]) -> BTreeMap<Oid, MergedObject> {
    let mut by_oid: BTreeMap<&Oid, (Option<&Baseline>, Vec<Operation>)> = BTreeMap::new();
    for baseline in baselines {
        by_oid.entry(&baseline.oid).or_default().0 = Some(baseline);
    }
    for op in ops {
        by_oid.entry(&op.oid).or_default().1.push(op.clone());
    }
    by_oid
        .into_iter()
        .map(|(oid, (baseline, ops))| (oid.clone(), merge(oid, baseline, &ops)))
        .collect()
}

/// Merge the subtree rooted at `root` and denormalize it.
///
/// Baselines and operations outside the subtree are ignored.
#[must_use]
pub fn merge_subtree(root: &Oid, baselines: &[Baseline], ops: &[Operation]) -> MergedDocument {
    let baselines: Vec<Baseline> = baselines
        .iter()
        .filter(|b| b.oid.is_descendant_of(root))
        .cloned()
        .collect();
    let ops: Vec<Operation> = ops
        .iter()
        .filter(|op| op.oid.is_descendant_of(root))
        .cloned()
        .collect();

    let objects = merge_all(&baselines, &ops);
    let live: BTreeMap<Oid, Value> = objects
        .iter()
        .filter_map(|(oid, obj)| obj.value().map(|v| (oid.clone(), v.clone())))
        .collect();

    MergedDocument {
        root: root.clone(),
        value: denormalize(root, &live),
        objects,
    }
}
