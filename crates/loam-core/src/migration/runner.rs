//! Executing a migration path against a store.
//!
//! Every write a procedure makes is stamped `Timestamp::zero(new_version)`,
//! which sorts above all data of older versions and below anything authored
//! organically under the new one. Nested objects get sub-ids derived from
//! their parent OID and key, so every replica running the same migration
//! produces byte-identical operations that deduplicate on sync.
//!
//! Each step commits its writes and the new schema version in one batch.
//! Cancelling between steps leaves the store at the last completed version.

use std::collections::BTreeMap;

use serde_json::Value;
use tracing::{debug, info, instrument};

use super::{MigrationCatalog, MigrationError, resolve_path};
use crate::clock::Timestamp;
use crate::oid::{Oid, create_oid, derived_sub_id};
use crate::operation::{Operation, Patch, normalize};
use crate::store::{META_SCHEMA_VERSION, Storage, WriteBatch, documents};
use crate::sync::CancelFlag;

/// Handle given to a migration procedure.
pub struct MigrationContext<'a> {
    storage: &'a dyn Storage,
    from: u32,
    to: u32,
    pending: BTreeMap<Oid, Patch>,
}

impl<'a> MigrationContext<'a> {
    fn new(storage: &'a dyn Storage, from: u32, to: u32) -> Self {
        Self {
            storage,
            from,
            to,
            pending: BTreeMap::new(),
        }
    }

    #[must_use]
    pub const fn from_version(&self) -> u32 {
        self.from
    }

    #[must_use]
    pub const fn to_version(&self) -> u32 {
        self.to
    }

    /// Every live document of `collection` as stored before this step.
    ///
    /// # Errors
    ///
    /// Returns an error if the store read fails.
    pub fn documents(&self, collection: &str) -> Result<Vec<(Oid, Value)>, MigrationError> {
        Ok(documents(self.storage, collection)?)
    }

    /// Rewrite every document of `collection`. Returning `None` from `f`
    /// leaves that document unchanged.
    ///
    /// # Errors
    ///
    /// Returns an error if the store read fails.
    pub fn migrate<F>(&mut self, collection: &str, mut f: F) -> Result<usize, MigrationError>
    where
        F: FnMut(&Oid, &Value) -> Option<Value>,
    {
        let mut rewritten = 0;
        for (oid, value) in self.documents(collection)? {
            if let Some(next) = f(&oid, &value) {
                self.write_document(&oid, &next)?;
                rewritten += 1;
            }
        }
        debug!(collection, rewritten, "migrated documents");
        Ok(rewritten)
    }

    /// Create (or replace) a document.
    ///
    /// # Errors
    ///
    /// Returns an error if the collection or id is empty.
    pub fn create(
        &mut self,
        collection: &str,
        primary_key: &str,
        value: &Value,
    ) -> Result<Oid, MigrationError> {
        let oid = create_oid(collection, primary_key, &[])?;
        self.write_document(&oid, value)?;
        Ok(oid)
    }

    /// Tombstone a document.
    pub fn delete(&mut self, oid: &Oid) {
        self.pending.insert(oid.clone(), Patch::Delete);
    }

    fn write_document(&mut self, oid: &Oid, value: &Value) -> Result<(), MigrationError> {
        let objects = normalize(oid, value, &mut |parent, key| derived_sub_id(parent, key))?;
        for (target, shallow) in objects {
            self.pending
                .insert(target, Patch::Initialize { value: shallow });
        }
        Ok(())
    }

    fn into_batch(self) -> WriteBatch {
        let timestamp = Timestamp::zero(self.to);
        let mut batch = WriteBatch::new();
        for (oid, patch) in self.pending {
            batch.put_operation(Operation::new(oid, timestamp.clone(), patch));
        }
        batch.set_meta(META_SCHEMA_VERSION, self.to.to_string());
        batch
    }
}

/// The schema version recorded in `storage`, if any.
///
/// # Errors
///
/// Returns an error if the read fails or the stored value is not a number.
pub fn stored_schema_version(storage: &dyn Storage) -> Result<Option<u32>, MigrationError> {
    storage
        .meta(META_SCHEMA_VERSION)?
        .map(|raw| {
            raw.parse::<u32>()
                .map_err(|_| MigrationError::CorruptVersion(raw))
        })
        .transpose()
}

/// Brings a store up to a target schema version.
#[derive(Debug, Clone, Copy)]
pub struct MigrationRunner<'a> {
    catalog: &'a MigrationCatalog,
}

impl<'a> MigrationRunner<'a> {
    #[must_use]
    pub const fn new(catalog: &'a MigrationCatalog) -> Self {
        Self { catalog }
    }

    /// Migrate `storage` to `target` and return the version it ends at.
    ///
    /// A store with no recorded version holds no data yet and is stamped
    /// with `target` directly.
    ///
    /// # Errors
    ///
    /// - [`MigrationError::NoPath`] if the catalog cannot reach `target`.
    ///   Nothing is written in that case.
    /// - [`MigrationError::Cancelled`] if `cancel` fires between steps.
    /// - Procedure or store failures of the step being run; earlier steps
    ///   stay committed.
    #[instrument(skip(self, storage, cancel))]
    pub fn run(
        &self,
        storage: &dyn Storage,
        target: u32,
        cancel: Option<&CancelFlag>,
    ) -> Result<u32, MigrationError> {
        let Some(current) = stored_schema_version(storage)? else {
            let mut batch = WriteBatch::new();
            batch.set_meta(META_SCHEMA_VERSION, target.to_string());
            storage.commit(batch)?;
            info!(version = target, "initialized fresh store");
            return Ok(target);
        };

        let path = resolve_path(self.catalog, current, target)?;
        let mut at = current;
        for step in path {
            if cancel.is_some_and(CancelFlag::is_cancelled) {
                info!(at, "migration cancelled");
                return Err(MigrationError::Cancelled { at });
            }

            let mut ctx = MigrationContext::new(storage, step.old_version, step.new_version);
            (step.procedure)(&mut ctx).map_err(|err| match err {
                MigrationError::Procedure { .. } => err,
                other => MigrationError::Procedure {
                    from: step.old_version,
                    to: step.new_version,
                    reason: other.to_string(),
                },
            })?;
            let batch = ctx.into_batch();
            let writes = batch.len().saturating_sub(1);
            storage.commit(batch)?;
            at = step.new_version;
            info!(from = step.old_version, to = at, writes, "applied migration");
        }
        Ok(at)
    }
}
