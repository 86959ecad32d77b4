use serde_json::Value;

use super::{EntityCache, EntityHandle};
use crate::merge::merge_subtree;
use crate::oid::{Oid, oid_range};
use crate::store::{Storage, StoreError};

/// Reconstructs entity values from a store on demand.
#[derive(Debug)]
pub struct Materializer<S: Storage> {
    storage: S,
    cache: EntityCache,
}

impl<S: Storage> Materializer<S> {
    #[must_use]
    pub fn new(storage: S) -> Self {
        Self {
            storage,
            cache: EntityCache::new(),
        }
    }

    #[must_use]
    pub const fn storage(&self) -> &S {
        &self.storage
    }

    /// The identity-stable handle for `oid`. Nothing is read yet.
    pub fn get(&mut self, oid: &Oid) -> EntityHandle {
        self.cache.get(oid)
    }

    /// The current value of `handle`'s subtree, hydrating it if stale.
    ///
    /// `None` if the object is absent or deleted.
    ///
    /// # Errors
    ///
    /// Returns a [`StoreError`] if reading the subtree fails.
    pub fn view(&self, handle: &EntityHandle) -> Result<Option<Value>, StoreError> {
        let entity = handle.entity();
        if entity.is_hydrated()? {
            return entity.cached();
        }
        let range = oid_range(entity.oid());
        let baselines = self.storage.baselines_in(&range)?;
        let ops = self.storage.operations_in(&range)?;
        let value = merge_subtree(entity.oid(), &baselines, &ops).value;
        entity.hydrate(value.clone())?;
        Ok(value)
    }

    /// Mark cached views of the document containing `oid` stale.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Poisoned`] if an entity lock is poisoned.
    pub fn invalidate(&self, oid: &Oid) -> Result<(), StoreError> {
        self.cache.invalidate(oid).map(|_| ())
    }

    /// Mark every cached view stale, e.g. after a reset from the server.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Poisoned`] if an entity lock is poisoned.
    pub fn invalidate_all(&self) -> Result<(), StoreError> {
        for entity in self.cache.slots.values() {
            entity.mark_stale()?;
        }
        Ok(())
    }

    /// Reclaim entities no handle refers to any more.
    pub fn collect(&mut self) -> usize {
        self.cache.collect()
    }

    #[must_use]
    pub fn cached_len(&self) -> usize {
        self.cache.len()
    }
}
