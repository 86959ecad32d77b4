//! Identity-stable entity views.
//!
//! [`EntityCache`] is an arena of entities addressed by OID. Asking for the
//! same OID twice yields handles to the same [`Entity`] for as long as any
//! handle is alive. Dropping an [`EntityHandle`] posts a [`DropNotice`];
//! [`EntityCache::collect`] drains notices and reclaims a slot only when the
//! notice's generation still matches the slot and no handle remains. A stale
//! notice for a slot that was reclaimed and re-created is ignored.

pub mod materializer;

use std::collections::HashMap;
use std::sync::mpsc::{Receiver, Sender, channel};
use std::sync::{Arc, RwLock};

use serde_json::Value;

use crate::oid::Oid;
use crate::store::StoreError;

pub use materializer::Materializer;

/// Posted when a handle is dropped.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DropNotice {
    pub oid: Oid,
    pub generation: u64,
}

#[derive(Debug, Default)]
struct EntityState {
    hydrated: bool,
    value: Option<Value>,
}

/// A lazily hydrated view of one OID's subtree.
#[derive(Debug)]
pub struct Entity {
    oid: Oid,
    generation: u64,
    state: RwLock<EntityState>,
}

impl Entity {
    fn new(oid: Oid, generation: u64) -> Self {
        Self {
            oid,
            generation,
            state: RwLock::new(EntityState::default()),
        }
    }

    #[must_use]
    pub const fn oid(&self) -> &Oid {
        &self.oid
    }

    #[must_use]
    pub const fn generation(&self) -> u64 {
        self.generation
    }

    /// Whether the cached value is current.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Poisoned`] if the state lock is poisoned.
    pub fn is_hydrated(&self) -> Result<bool, StoreError> {
        Ok(self.state.read().map_err(|_| StoreError::Poisoned)?.hydrated)
    }

    /// The cached value without hydrating.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Poisoned`] if the state lock is poisoned.
    pub fn cached(&self) -> Result<Option<Value>, StoreError> {
        Ok(self
            .state
            .read()
            .map_err(|_| StoreError::Poisoned)?
            .value
            .clone())
    }

    fn hydrate(&self, value: Option<Value>) -> Result<(), StoreError> {
        let mut state = self.state.write().map_err(|_| StoreError::Poisoned)?;
        state.value = value;
        state.hydrated = true;
        Ok(())
    }

    fn mark_stale(&self) -> Result<(), StoreError> {
        self.state
            .write()
            .map_err(|_| StoreError::Poisoned)?
            .hydrated = false;
        Ok(())
    }
}

/// A live reference to a cached entity.
#[derive(Debug)]
pub struct EntityHandle {
    entity: Arc<Entity>,
    notify: Sender<DropNotice>,
}

impl EntityHandle {
    #[must_use]
    pub fn entity(&self) -> &Entity {
        &self.entity
    }

    #[must_use]
    pub fn oid(&self) -> &Oid {
        &self.entity.oid
    }

    /// True if both handles point at the same entity.
    #[must_use]
    pub fn same_entity(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.entity, &other.entity)
    }
}

impl Clone for EntityHandle {
    fn clone(&self) -> Self {
        Self {
            entity: Arc::clone(&self.entity),
            notify: self.notify.clone(),
        }
    }
}

impl Drop for EntityHandle {
    fn drop(&mut self) {
        // The cache may already be gone; nothing to reclaim then.
        let _ = self.notify.send(DropNotice {
            oid: self.entity.oid.clone(),
            generation: self.entity.generation,
        });
    }
}

/// Arena of entities keyed by OID.
#[derive(Debug)]
pub struct EntityCache {
    slots: HashMap<Oid, Arc<Entity>>,
    next_generation: u64,
    notify: Sender<DropNotice>,
    notices: Receiver<DropNotice>,
}

impl Default for EntityCache {
    fn default() -> Self {
        Self::new()
    }
}

impl EntityCache {
    #[must_use]
    pub fn new() -> Self {
        let (notify, notices) = channel();
        Self {
            slots: HashMap::new(),
            next_generation: 0,
            notify,
            notices,
        }
    }

    /// The handle for `oid`, creating an unhydrated entity if needed.
    pub fn get(&mut self, oid: &Oid) -> EntityHandle {
        let entity = match self.slots.get(oid) {
            Some(entity) => Arc::clone(entity),
            None => {
                self.next_generation += 1;
                let entity = Arc::new(Entity::new(oid.clone(), self.next_generation));
                self.slots.insert(oid.clone(), Arc::clone(&entity));
                entity
            }
        };
        EntityHandle {
            entity,
            notify: self.notify.clone(),
        }
    }

    /// The handle for `oid` only if it is already cached.
    #[must_use]
    pub fn peek(&self, oid: &Oid) -> Option<EntityHandle> {
        self.slots.get(oid).map(|entity| EntityHandle {
            entity: Arc::clone(entity),
            notify: self.notify.clone(),
        })
    }

    /// Mark every cached entity of the document containing `oid` stale.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Poisoned`] if an entity lock is poisoned.
    pub fn invalidate(&self, oid: &Oid) -> Result<usize, StoreError> {
        let root = oid.root();
        let mut marked = 0;
        for entity in self.slots.values().filter(|e| e.oid.is_descendant_of(&root)) {
            entity.mark_stale()?;
            marked += 1;
        }
        Ok(marked)
    }

    /// Reclaim slots whose handles have all been dropped.
    pub fn collect(&mut self) -> usize {
        let mut reclaimed = 0;
        while let Ok(notice) = self.notices.try_recv() {
            let unreferenced = self.slots.get(&notice.oid).is_some_and(|entity| {
                entity.generation == notice.generation && Arc::strong_count(entity) == 1
            });
            if unreferenced {
                self.slots.remove(&notice.oid);
                reclaimed += 1;
            }
        }
        reclaimed
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.slots.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }
}
