//! Operation and baseline data model.
//!
//! An [`Operation`] is the immutable unit of mutation: a typed [`Patch`]
//! addressed to one OID at one timestamp. Its identity is `(oid, timestamp)`;
//! receiving the same pair twice is a no-op.
//!
//! A [`Baseline`] is the compacted state of one OID as of its timestamp. It
//! supersedes every operation on that OID at or below the timestamp.
//!
//! Documents are stored normalized: every nested object or list lives under
//! its own child OID and the parent holds a reference value (see [`refs`]).
//! Patch values are therefore always *shallow*: scalars or references.

pub mod refs;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::authz::Authorization;
use crate::clock::Timestamp;
use crate::error::ErrorCode;
use crate::oid::Oid;

pub use refs::{denormalize, is_ref, normalize, object_ref, ref_target};

/// Errors raised when a patch is structurally invalid.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum PatchError {
    #[error("initialize value for {oid} must be an object or a list")]
    InitializeNotContainer { oid: Oid },

    #[error("patch value for {oid} must be a scalar or a reference, found nested {kind}")]
    NestedValue { oid: Oid, kind: &'static str },

    #[error("list delete on {oid} must remove at least one element")]
    EmptyDelete { oid: Oid },
}

impl PatchError {
    #[must_use]
    pub const fn code(&self) -> ErrorCode {
        ErrorCode::InvalidPatch
    }
}

// ---------------------------------------------------------------------------
// Patch
// ---------------------------------------------------------------------------

/// A typed mutation. The merge engine matches on this exhaustively, so a new
/// patch kind cannot be added without deciding how it merges.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "kebab-case")]
pub enum Patch {
    /// Create (or re-create) the object with a complete shallow value.
    Initialize { value: Value },
    /// Assign one object field. Last write wins per field.
    Set { name: String, value: Value },
    /// Remove one object field. Competes with `Set` under last-write-wins.
    Remove { name: String },
    /// Insert before `index`; an index past the end appends.
    ListInsert { index: usize, value: Value },
    /// Remove `count` elements starting at `index`.
    ListDelete { index: usize, count: usize },
    /// Overwrite the element at `index`; `index == len` appends.
    ListSet { index: usize, value: Value },
    /// Append to the end of the list.
    ListPush { value: Value },
    /// Move one element from `from` to `to` (indices in the pre-move list).
    ListMove { from: usize, to: usize },
    /// Tombstone the object.
    Delete,
}

impl Patch {
    /// Short kebab-case name used in logs.
    #[must_use]
    pub const fn kind(&self) -> &'static str {
        match self {
            Self::Initialize { .. } => "initialize",
            Self::Set { .. } => "set",
            Self::Remove { .. } => "remove",
            Self::ListInsert { .. } => "list-insert",
            Self::ListDelete { .. } => "list-delete",
            Self::ListSet { .. } => "list-set",
            Self::ListPush { .. } => "list-push",
            Self::ListMove { .. } => "list-move",
            Self::Delete => "delete",
        }
    }

    /// True for patches that only make sense on list objects.
    #[must_use]
    pub const fn is_list_patch(&self) -> bool {
        matches!(
            self,
            Self::ListInsert { .. }
                | Self::ListDelete { .. }
                | Self::ListSet { .. }
                | Self::ListPush { .. }
                | Self::ListMove { .. }
        )
    }

    /// Validate the patch shape for `oid`.
    ///
    /// # Errors
    ///
    /// Returns a [`PatchError`] when values are nested (they must be split
    /// into child OIDs first) or an initialize value is not a container.
    pub fn validate(&self, oid: &Oid) -> Result<(), PatchError> {
        match self {
            Self::Initialize { value } => match value {
                Value::Object(map) => map.values().try_for_each(|v| check_shallow(oid, v)),
                Value::Array(items) => items.iter().try_for_each(|v| check_shallow(oid, v)),
                _ => Err(PatchError::InitializeNotContainer { oid: oid.clone() }),
            },
            Self::Set { value, .. }
            | Self::ListInsert { value, .. }
            | Self::ListSet { value, .. }
            | Self::ListPush { value } => check_shallow(oid, value),
            Self::ListDelete { count, .. } => {
                if *count == 0 {
                    Err(PatchError::EmptyDelete { oid: oid.clone() })
                } else {
                    Ok(())
                }
            }
            Self::Remove { .. } | Self::ListMove { .. } | Self::Delete => Ok(()),
        }
    }
}

fn check_shallow(oid: &Oid, value: &Value) -> Result<(), PatchError> {
    match value {
        Value::Array(_) => Err(PatchError::NestedValue {
            oid: oid.clone(),
            kind: "list",
        }),
        Value::Object(_) if !is_ref(value) => Err(PatchError::NestedValue {
            oid: oid.clone(),
            kind: "object",
        }),
        _ => Ok(()),
    }
}

// ---------------------------------------------------------------------------
// Operation / Baseline
// ---------------------------------------------------------------------------

/// One immutable mutation record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Operation {
    pub oid: Oid,
    pub timestamp: Timestamp,
    pub data: Patch,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub authz: Option<Authorization>,
}

impl Operation {
    #[must_use]
    pub const fn new(oid: Oid, timestamp: Timestamp, data: Patch) -> Self {
        Self {
            oid,
            timestamp,
            data,
            authz: None,
        }
    }

    #[must_use]
    pub fn with_authz(mut self, authz: Option<Authorization>) -> Self {
        self.authz = authz;
        self
    }

    /// Identity of the operation.
    #[must_use]
    pub const fn key(&self) -> (&Oid, &Timestamp) {
        (&self.oid, &self.timestamp)
    }
}

/// Compacted state of one OID as of `timestamp`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Baseline {
    pub oid: Oid,
    pub snapshot: Value,
    pub timestamp: Timestamp,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub authz: Option<Authorization>,
}

/// Sort operations into canonical `(oid, timestamp)` order and drop
/// duplicate identities, keeping the first occurrence.
#[must_use]
pub fn canonical_order(mut ops: Vec<Operation>) -> Vec<Operation> {
    ops.sort_by(|a, b| a.oid.cmp(&b.oid).then_with(|| a.timestamp.cmp(&b.timestamp)));
    ops.dedup_by(|later, earlier| later.key() == earlier.key());
    ops
}
