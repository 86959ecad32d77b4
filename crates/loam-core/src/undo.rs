//! Undo/redo of local edits.
//!
//! Operations are immutable, so undo never removes history. It authors new
//! operations whose patches restore the previous observable state:
//!
//! | Patch | Inverse |
//! |---|---|
//! | `Initialize` on absent/deleted | `Delete` |
//! | `Initialize` on live | `Initialize` with the prior value |
//! | `Delete` | `Initialize` with the prior value |
//! | `Set` | `Set` with the prior value, or `Remove` if the field was missing |
//! | `Remove` | `Set` with the prior value |
//! | `ListInsert` at `i` | `ListDelete` at the clamped `i` |
//! | `ListDelete` at `i` | `ListInsert` of each removed value at `i`, `i+1`, ... |
//! | `ListSet` at `i < len` | `ListSet` at `i` with the prior value |
//! | `ListSet` at `len` / `ListPush` | `ListDelete` of the appended element |
//! | `ListMove` | `ListMove` back from the landing index |
//!
//! Inverses are index-aware: deleting index 2 is undone by inserting at
//! index 2, never by appending.

use serde_json::Value;

use crate::error::ErrorCode;
use crate::merge::ObjectState;
use crate::oid::Oid;
use crate::operation::Patch;

/// Default cap on the number of undo entries kept.
pub const DEFAULT_UNDO_LIMIT: usize = 100;

#[derive(Debug, thiserror::Error)]
pub enum UndoError<E: std::error::Error + 'static> {
    #[error("nothing to undo or redo")]
    Empty,

    #[error(transparent)]
    Target(E),
}

impl<E: std::error::Error + 'static> UndoError<E> {
    #[must_use]
    pub const fn code(&self) -> ErrorCode {
        match self {
            Self::Empty => ErrorCode::NothingToUndo,
            Self::Target(_) => ErrorCode::StorageFailure,
        }
    }
}

/// Patches that reverse `patch` applied to `before`, in application order.
///
/// Empty when `patch` would not change `before` (it would be skipped by the
/// merge), so there is nothing to restore.
#[must_use]
pub fn inverse_patch(before: &ObjectState, patch: &Patch) -> Vec<Patch> {
    let live = match before {
        ObjectState::Live(value) => Some(value),
        ObjectState::Absent | ObjectState::Deleted => None,
    };

    match (patch, live) {
        (Patch::Initialize { .. }, None) => vec![Patch::Delete],
        (Patch::Initialize { .. } | Patch::Delete, Some(prior)) => {
            vec![Patch::Initialize {
                value: prior.clone(),
            }]
        }
        (Patch::Set { name, .. }, Some(Value::Object(map))) => match map.get(name) {
            Some(prior) => vec![Patch::Set {
                name: name.clone(),
                value: prior.clone(),
            }],
            None => vec![Patch::Remove { name: name.clone() }],
        },
        (Patch::Remove { name }, Some(Value::Object(map))) => map
            .get(name)
            .map(|prior| Patch::Set {
                name: name.clone(),
                value: prior.clone(),
            })
            .into_iter()
            .collect(),
        (Patch::ListInsert { index, .. }, Some(Value::Array(list))) => vec![Patch::ListDelete {
            index: (*index).min(list.len()),
            count: 1,
        }],
        (Patch::ListDelete { index, count }, Some(Value::Array(list))) => {
            let end = index.saturating_add(*count).min(list.len());
            list.get(*index..end)
                .unwrap_or_default()
                .iter()
                .enumerate()
                .map(|(offset, prior)| Patch::ListInsert {
                    index: index + offset,
                    value: prior.clone(),
                })
                .collect()
        }
        (Patch::ListSet { index, .. }, Some(Value::Array(list))) => match list.get(*index) {
            Some(prior) => vec![Patch::ListSet {
                index: *index,
                value: prior.clone(),
            }],
            None if *index == list.len() => vec![Patch::ListDelete {
                index: *index,
                count: 1,
            }],
            None => Vec::new(),
        },
        (Patch::ListPush { .. }, Some(Value::Array(list))) => vec![Patch::ListDelete {
            index: list.len(),
            count: 1,
        }],
        (Patch::ListMove { from, to }, Some(Value::Array(list))) if *from < list.len() => {
            let landed = (*to).min(list.len() - 1);
            vec![Patch::ListMove {
                from: landed,
                to: *from,
            }]
        }
        _ => Vec::new(),
    }
}

/// A group of patches applied as one transaction.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct UndoEntry {
    pub changes: Vec<(Oid, Patch)>,
}

impl UndoEntry {
    #[must_use]
    pub const fn new() -> Self {
        Self {
            changes: Vec::new(),
        }
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.changes.is_empty()
    }
}

/// Collects inverses while a transaction applies forward patches in order.
#[derive(Debug, Default)]
pub struct InverseRecorder {
    inverses: Vec<Vec<(Oid, Patch)>>,
}

impl InverseRecorder {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Record that `patch` is about to be applied to `oid` in state `before`.
    pub fn record(&mut self, oid: &Oid, before: &ObjectState, patch: &Patch) {
        let inverse = inverse_patch(before, patch);
        if !inverse.is_empty() {
            self.inverses
                .push(inverse.into_iter().map(|p| (oid.clone(), p)).collect());
        }
    }

    /// The entry undoing everything recorded: per-patch inverses in reverse
    /// order of application.
    #[must_use]
    pub fn finish(self) -> UndoEntry {
        UndoEntry {
            changes: self.inverses.into_iter().rev().flatten().collect(),
        }
    }
}

/// Something that can apply an [`UndoEntry`] atomically.
pub trait UndoTarget {
    type Error: std::error::Error + 'static;

    /// Apply `entry` as one transaction and return the entry that reverses
    /// it. On error nothing may have been applied.
    ///
    /// # Errors
    ///
    /// Returns the target's error if the transaction fails.
    fn apply_undo(&mut self, entry: &UndoEntry) -> Result<UndoEntry, Self::Error>;
}

/// Undo and redo stacks.
#[derive(Debug, Clone)]
pub struct UndoHistory {
    undo: Vec<UndoEntry>,
    redo: Vec<UndoEntry>,
    limit: usize,
}

impl Default for UndoHistory {
    fn default() -> Self {
        Self::new(DEFAULT_UNDO_LIMIT)
    }
}

impl UndoHistory {
    #[must_use]
    pub const fn new(limit: usize) -> Self {
        Self {
            undo: Vec::new(),
            redo: Vec::new(),
            limit,
        }
    }

    /// Push an entry for a new edit. Clears the redo stack.
    pub fn add_undo(&mut self, entry: UndoEntry) {
        if entry.is_empty() {
            return;
        }
        self.redo.clear();
        self.undo.push(entry);
        if self.undo.len() > self.limit {
            let excess = self.undo.len() - self.limit;
            self.undo.drain(..excess);
        }
    }

    #[must_use]
    pub fn can_undo(&self) -> bool {
        !self.undo.is_empty()
    }

    #[must_use]
    pub fn can_redo(&self) -> bool {
        !self.redo.is_empty()
    }

    pub fn clear(&mut self) {
        self.undo.clear();
        self.redo.clear();
    }

    /// Undo the most recent edit through `target`.
    ///
    /// # Errors
    ///
    /// [`UndoError::Empty`] if there is nothing to undo; the target's error
    /// if applying fails, in which case the entry stays on the stack.
    pub fn undo<T: UndoTarget>(&mut self, target: &mut T) -> Result<(), UndoError<T::Error>> {
        let entry = self.undo.pop().ok_or(UndoError::Empty)?;
        match target.apply_undo(&entry) {
            Ok(inverse) => {
                self.redo.push(inverse);
                Ok(())
            }
            Err(err) => {
                self.undo.push(entry);
                Err(UndoError::Target(err))
            }
        }
    }

    /// Redo the most recently undone edit through `target`.
    ///
    /// # Errors
    ///
    /// [`UndoError::Empty`] if there is nothing to redo; the target's error
    /// if applying fails, in which case the entry stays on the stack.
    pub fn redo<T: UndoTarget>(&mut self, target: &mut T) -> Result<(), UndoError<T::Error>> {
        let entry = self.redo.pop().ok_or(UndoError::Empty)?;
        match target.apply_undo(&entry) {
            Ok(inverse) => {
                self.undo.push(inverse);
                Ok(())
            }
            Err(err) => {
                self.redo.push(entry);
                Err(UndoError::Target(err))
            }
        }
    }
}
