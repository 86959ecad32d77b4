//! Replica registry: acknowledgment watermarks, liveness and truancy.
//!
//! Every replica that talks to a library is tracked with the highest
//! timestamp it has acknowledged. The minimum acknowledgment over all
//! non-truant replicas is the *global ack*, the only value that gates
//! compaction: everything at or below it has been incorporated everywhere
//! that still matters.
//!
//! A replica that stops sending messages for longer than the truancy timeout
//! is marked [`ReplicaStatus::Truant`] and drops out of the global ack, so a
//! device that disappears forever cannot block compaction. If it comes back
//! after history it never saw was compacted, it must reset from baselines.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, info};

use crate::clock::{ReplicaId, Timestamp};
use crate::store::{Storage, StoreError, WriteBatch};

/// Default keepalive timeout after which a silent replica becomes truant.
pub const DEFAULT_TRUANCY_TIMEOUT_MS: u64 = 5 * 60 * 1_000;

/// How a replica participates in sync.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ReplicaType {
    /// Pushes and pulls continuously.
    #[default]
    Realtime,
    /// Pushes and pulls on demand.
    Periodic,
    /// Pulls only; never authors operations.
    ReadOnly,
    /// Server-side process acting on behalf of a library.
    Server,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ReplicaStatus {
    #[default]
    Active,
    Truant,
}

/// Persistent record for one replica.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReplicaInfo {
    pub id: ReplicaId,
    pub library_id: String,
    #[serde(default)]
    pub client_id: Option<String>,
    /// Highest timestamp this replica has acknowledged, if any.
    #[serde(default)]
    pub acked_logical_time: Option<Timestamp>,
    pub last_seen_wall_clock_time: u64,
    #[serde(default)]
    pub replica_type: ReplicaType,
    /// Highest server-assigned sequence number acknowledged.
    #[serde(default)]
    pub acked_server_order: u64,
    #[serde(default)]
    pub status: ReplicaStatus,
}

impl ReplicaInfo {
    #[must_use]
    pub fn new(id: ReplicaId, library_id: impl Into<String>, now_ms: u64) -> Self {
        Self {
            id,
            library_id: library_id.into(),
            client_id: None,
            acked_logical_time: None,
            last_seen_wall_clock_time: now_ms,
            replica_type: ReplicaType::default(),
            acked_server_order: 0,
            status: ReplicaStatus::Active,
        }
    }

    #[must_use]
    pub fn is_truant(&self) -> bool {
        self.status == ReplicaStatus::Truant
    }
}

/// Lifecycle events emitted by the registry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReplicaEvent {
    /// First contact from a replica.
    Joined { id: ReplicaId },
    /// The keepalive expired; the replica is now truant.
    Lost { id: ReplicaId },
    /// A truant replica made contact again. `requires_reset` is set when
    /// history it never acknowledged may already have been compacted.
    Rejoined { id: ReplicaId, requires_reset: bool },
}

#[derive(Debug, Clone)]
struct Entry {
    info: ReplicaInfo,
    presence: Option<Value>,
}

/// In-memory registry for one library.
#[derive(Debug, Clone)]
pub struct ReplicaRegistry {
    library_id: String,
    truancy_timeout_ms: u64,
    replicas: BTreeMap<ReplicaId, Entry>,
}

impl ReplicaRegistry {
    #[must_use]
    pub fn new(library_id: impl Into<String>, truancy_timeout_ms: u64) -> Self {
        Self {
            library_id: library_id.into(),
            truancy_timeout_ms,
            replicas: BTreeMap::new(),
        }
    }

    /// Load persisted replica records for `library_id`.
    ///
    /// # Errors
    ///
    /// Returns a [`StoreError`] if the store read fails.
    pub fn load(
        storage: &dyn Storage,
        library_id: impl Into<String>,
        truancy_timeout_ms: u64,
    ) -> Result<Self, StoreError> {
        let mut registry = Self::new(library_id, truancy_timeout_ms);
        for info in storage.replicas()? {
            if info.library_id == registry.library_id {
                registry.replicas.insert(
                    info.id.clone(),
                    Entry {
                        info,
                        presence: None,
                    },
                );
            }
        }
        debug!(count = registry.replicas.len(), "loaded replica registry");
        Ok(registry)
    }

    /// Persist every replica record in one batch.
    ///
    /// # Errors
    ///
    /// Returns a [`StoreError`] if the commit fails.
    pub fn save(&self, storage: &dyn Storage) -> Result<(), StoreError> {
        let mut batch = WriteBatch::new();
        for entry in self.replicas.values() {
            batch.put_replica(entry.info.clone());
        }
        storage.commit(batch)
    }

    #[must_use]
    pub fn library_id(&self) -> &str {
        &self.library_id
    }

    #[must_use]
    pub fn get(&self, id: &ReplicaId) -> Option<&ReplicaInfo> {
        self.replicas.get(id).map(|e| &e.info)
    }

    pub fn iter(&self) -> impl Iterator<Item = &ReplicaInfo> {
        self.replicas.values().map(|e| &e.info)
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.replicas.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.replicas.is_empty()
    }

    /// Register a replica record, replacing any previous one.
    pub fn register(&mut self, info: ReplicaInfo) {
        self.replicas.insert(
            info.id.clone(),
            Entry {
                info,
                presence: None,
            },
        );
    }

    /// Record contact from `id` at `now_ms`, resetting its keepalive.
    ///
    /// Unknown replicas are registered. A truant replica becomes active
    /// again and reports whether it has to reset.
    pub fn heartbeat(&mut self, id: &ReplicaId, now_ms: u64) -> Option<ReplicaEvent> {
        let global = self.global_ack_excluding(Some(id));
        let Some(entry) = self.replicas.get_mut(id) else {
            let info = ReplicaInfo::new(id.clone(), self.library_id.clone(), now_ms);
            self.register(info);
            info!(replica = %id, "replica joined");
            return Some(ReplicaEvent::Joined { id: id.clone() });
        };

        entry.info.last_seen_wall_clock_time = entry.info.last_seen_wall_clock_time.max(now_ms);
        if entry.info.status != ReplicaStatus::Truant {
            return None;
        }

        entry.info.status = ReplicaStatus::Active;
        let requires_reset = match (&entry.info.acked_logical_time, &global) {
            (_, None) => false,
            (None, Some(_)) => true,
            (Some(acked), Some(global)) => acked < global,
        };
        info!(replica = %id, requires_reset, "truant replica rejoined");
        Some(ReplicaEvent::Rejoined {
            id: id.clone(),
            requires_reset,
        })
    }

    /// Mark every active replica whose keepalive expired as truant.
    ///
    /// Expiry is polled, never timer-driven: a silent replica stays active,
    /// and keeps holding back the global ack, until someone calls this.
    /// [`SyncHub::tick`](crate::sync::SyncHub::tick) does, so a hub host
    /// must call `tick` at least once per truancy timeout.
    pub fn check_truancy(&mut self, now_ms: u64) -> Vec<ReplicaEvent> {
        let expired: Vec<ReplicaId> = self
            .replicas
            .values()
            .filter(|e| {
                e.info.status == ReplicaStatus::Active
                    && now_ms.saturating_sub(e.info.last_seen_wall_clock_time)
                        > self.truancy_timeout_ms
            })
            .map(|e| e.info.id.clone())
            .collect();
        expired
            .iter()
            .filter_map(|id| self.mark_truant(id))
            .collect()
    }

    /// Mark `id` truant immediately. Returns `None` if it is unknown or
    /// already truant.
    pub fn mark_truant(&mut self, id: &ReplicaId) -> Option<ReplicaEvent> {
        let entry = self.replicas.get_mut(id)?;
        if entry.info.status == ReplicaStatus::Truant {
            return None;
        }
        entry.info.status = ReplicaStatus::Truant;
        entry.presence = None;
        info!(replica = %id, "replica lost (truant)");
        Some(ReplicaEvent::Lost { id: id.clone() })
    }

    /// Advance the acknowledgment watermark of `id`. Never moves backwards.
    ///
    /// Returns `true` if the watermark advanced.
    pub fn acknowledge(&mut self, id: &ReplicaId, timestamp: &Timestamp) -> bool {
        let Some(entry) = self.replicas.get_mut(id) else {
            return false;
        };
        if entry
            .info
            .acked_logical_time
            .as_ref()
            .is_some_and(|acked| acked >= timestamp)
        {
            return false;
        }
        entry.info.acked_logical_time = Some(timestamp.clone());
        true
    }

    /// Record the type a replica announced for itself.
    pub fn set_replica_type(&mut self, id: &ReplicaId, replica_type: ReplicaType) {
        if let Some(entry) = self.replicas.get_mut(id) {
            entry.info.replica_type = replica_type;
        }
    }

    /// Ids of every replica that is not truant.
    pub fn active_ids(&self) -> impl Iterator<Item = &ReplicaId> {
        self.replicas
            .values()
            .filter(|e| e.info.status == ReplicaStatus::Active)
            .map(|e| &e.info.id)
    }

    /// Advance the server-order watermark of `id`. Never moves backwards.
    pub fn acknowledge_server_order(&mut self, id: &ReplicaId, order: u64) {
        if let Some(entry) = self.replicas.get_mut(id) {
            entry.info.acked_server_order = entry.info.acked_server_order.max(order);
        }
    }

    /// Minimum acknowledgment over non-truant replicas.
    ///
    /// `None` if no replica is active or any active replica has not
    /// acknowledged anything yet.
    #[must_use]
    pub fn global_ack(&self) -> Option<Timestamp> {
        self.global_ack_excluding(None)
    }

    fn global_ack_excluding(&self, skip: Option<&ReplicaId>) -> Option<Timestamp> {
        let mut active = self
            .replicas
            .values()
            .filter(|e| e.info.status == ReplicaStatus::Active)
            .filter(|e| skip != Some(&e.info.id))
            .peekable();
        active.peek()?;
        active
            .map(|e| e.info.acked_logical_time.clone())
            .collect::<Option<Vec<_>>>()?
            .into_iter()
            .min()
    }

    /// Attach a presence payload to an active replica.
    pub fn set_presence(&mut self, id: &ReplicaId, presence: Value) -> bool {
        match self.replicas.get_mut(id) {
            Some(entry) if entry.info.status == ReplicaStatus::Active => {
                entry.presence = Some(presence);
                true
            }
            _ => false,
        }
    }

    #[must_use]
    pub fn presence(&self, id: &ReplicaId) -> Option<&Value> {
        self.replicas.get(id).and_then(|e| e.presence.as_ref())
    }

    /// Presence payloads of every active replica.
    #[must_use]
    pub fn active_presence(&self) -> BTreeMap<ReplicaId, Value> {
        self.replicas
            .iter()
            .filter_map(|(id, e)| e.presence.clone().map(|p| (id.clone(), p)))
            .collect()
    }
}
