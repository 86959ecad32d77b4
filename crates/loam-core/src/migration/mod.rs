//! Schema migrations: the version graph and path resolution.
//!
//! A [`Migration`] is a directed edge `old_version -> new_version` carrying a
//! procedure that rewrites documents. The catalog need not be a chain;
//! optional or skippable steps show up as branches.
//!
//! [`resolve_path`] searches depth-first, always trying the largest forward
//! step first and backing off to smaller ones when a step overshoots the
//! target or dead-ends. Steps of equal size are tried in declaration order.
//! Failure to find a path is fatal: running against the wrong schema
//! corrupts data.

pub mod runner;
pub mod schema;

use std::collections::HashSet;
use std::fmt;
use std::sync::Arc;

use tracing::warn;

use crate::error::ErrorCode;
use crate::oid::OidError;
use crate::store::StoreError;

pub use runner::{MigrationContext, MigrationRunner};
pub use schema::{
    CollectionSchema, FieldKind, FieldSchema, IndexSchema, Schema, SchemaError,
};

#[derive(Debug, thiserror::Error)]
pub enum MigrationError {
    #[error("no migration path from schema version {from} to {to}")]
    NoPath { from: u32, to: u32 },

    #[error("migration {from} -> {to} failed: {reason}")]
    Procedure { from: u32, to: u32, reason: String },

    #[error("migration cancelled at schema version {at}")]
    Cancelled { at: u32 },

    #[error("stored schema version {0:?} is not a number")]
    CorruptVersion(String),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Oid(#[from] OidError),

    #[error(transparent)]
    Schema(#[from] SchemaError),
}

impl MigrationError {
    #[must_use]
    pub const fn code(&self) -> ErrorCode {
        match self {
            Self::NoPath { .. } => ErrorCode::NoMigrationPath,
            Self::Store(_) => ErrorCode::StorageFailure,
            Self::Schema(_) => ErrorCode::SchemaViolation,
            Self::Procedure { .. }
            | Self::Cancelled { .. }
            | Self::CorruptVersion(_)
            | Self::Oid(_) => ErrorCode::MigrationFailed,
        }
    }
}

/// Document rewrite run for one migration step.
pub type Procedure =
    Arc<dyn Fn(&mut MigrationContext<'_>) -> Result<(), MigrationError> + Send + Sync>;

/// One edge of the version graph.
#[derive(Clone)]
pub struct Migration {
    pub old_version: u32,
    pub new_version: u32,
    pub procedure: Procedure,
}

impl Migration {
    pub fn new<F>(old_version: u32, new_version: u32, procedure: F) -> Self
    where
        F: Fn(&mut MigrationContext<'_>) -> Result<(), MigrationError> + Send + Sync + 'static,
    {
        Self {
            old_version,
            new_version,
            procedure: Arc::new(procedure),
        }
    }

    /// A migration that only bumps the version.
    #[must_use]
    pub fn noop(old_version: u32, new_version: u32) -> Self {
        Self::new(old_version, new_version, |_| Ok(()))
    }

    #[must_use]
    pub const fn step(&self) -> u32 {
        self.new_version.saturating_sub(self.old_version)
    }
}

impl fmt::Debug for Migration {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Migration({} -> {})", self.old_version, self.new_version)
    }
}

/// Migrations in declaration order, at most one per `(old, new)` pair.
#[derive(Debug, Clone, Default)]
pub struct MigrationCatalog {
    migrations: Vec<Migration>,
}

impl MigrationCatalog {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Declare a migration. A later duplicate of an existing pair is ignored.
    pub fn add(&mut self, migration: Migration) -> &mut Self {
        if self.get(migration.old_version, migration.new_version).is_some() {
            warn!(
                old = migration.old_version,
                new = migration.new_version,
                "duplicate migration ignored; first declaration wins"
            );
        } else {
            self.migrations.push(migration);
        }
        self
    }

    #[must_use]
    pub fn with(mut self, migration: Migration) -> Self {
        self.add(migration);
        self
    }

    #[must_use]
    pub fn get(&self, old_version: u32, new_version: u32) -> Option<&Migration> {
        self.migrations
            .iter()
            .find(|m| m.old_version == old_version && m.new_version == new_version)
    }

    pub fn iter(&self) -> impl Iterator<Item = &Migration> {
        self.migrations.iter()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.migrations.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.migrations.is_empty()
    }

    /// Forward edges out of `version`, largest step first, ties in
    /// declaration order.
    fn forward_from(&self, version: u32) -> Vec<&Migration> {
        let mut edges: Vec<&Migration> = self
            .migrations
            .iter()
            .filter(|m| m.old_version == version && m.new_version > version)
            .collect();
        edges.sort_by(|a, b| b.step().cmp(&a.step()));
        edges
    }
}

/// Find a sequence of migrations leading from `current` to `target`.
///
/// # Errors
///
/// Returns [`MigrationError::NoPath`] if no sequence of forward steps
/// connects the two versions.
pub fn resolve_path(
    catalog: &MigrationCatalog,
    current: u32,
    target: u32,
) -> Result<Vec<&Migration>, MigrationError> {
    let mut path = Vec::new();
    let mut dead_ends = HashSet::new();
    if search(catalog, current, target, &mut path, &mut dead_ends) {
        Ok(path)
    } else {
        Err(MigrationError::NoPath {
            from: current,
            to: target,
        })
    }
}

fn search<'a>(
    catalog: &'a MigrationCatalog,
    at: u32,
    target: u32,
    path: &mut Vec<&'a Migration>,
    dead_ends: &mut HashSet<u32>,
) -> bool {
    if at == target {
        return true;
    }
    if at > target || dead_ends.contains(&at) {
        return false;
    }
    for edge in catalog.forward_from(at) {
        if edge.new_version > target {
            continue;
        }
        path.push(edge);
        if search(catalog, edge.new_version, target, path, dead_ends) {
            return true;
        }
        path.pop();
    }
    dead_ends.insert(at);
    false
}
