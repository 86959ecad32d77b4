//! The long-lived replica context.
//!
//! A [`Client`] owns everything one replica needs: its clock, store,
//! entity cache, undo history and sync watermarks. It is created once at
//! startup with [`Client::open`], which refuses to open a store that
//! cannot be migrated to the schema's version.
//!
//! Every mutation is staged in a [`Transaction`], stamped with fresh
//! timestamps, committed as one batch, recorded for undo and queued for
//! the hub. Remote changes arrive through [`Client::receive`].

use std::collections::BTreeMap;
use std::collections::btree_map::Entry;
use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;
use tracing::{debug, info, warn};

use crate::authz::Authorization;
use crate::clock::{ClockError, HybridClock, ReplicaId, Timestamp, WallClock};
use crate::config::EngineConfig;
use crate::entity::{EntityHandle, Materializer};
use crate::error::ErrorCode;
use crate::merge::{ObjectState, apply_patch, merge, merge_subtree};
use crate::migration::{MigrationCatalog, MigrationError, MigrationRunner, Schema, SchemaError};
use crate::oid::{Oid, OidError, create_oid, oid_range, random_sub_id};
use crate::operation::refs::normalize_child;
use crate::operation::{Baseline, Operation, Patch, PatchError, normalize, ref_target};
use crate::rebase::{RebaseError, RebaseReport, Rebaser};
use crate::replica::ReplicaType;
use crate::store::{
    META_CONFIRMED_THROUGH, META_GLOBAL_ACK, META_REPLICA_ID, Storage, StoreError, WriteBatch,
    documents,
};
use crate::sync::{
    Backoff, CancelFlag, ClientMessage, Purge, RejectReason, ServerMessage, SyncError,
    SyncReport, SyncTransport, sync_with_retry,
};
use crate::undo::{InverseRecorder, UndoEntry, UndoError, UndoHistory, UndoTarget};

/// Upper bound on follow-up exchanges within one [`Client::sync`] call.
const MAX_SYNC_ROUNDS: usize = 8;

#[derive(Debug, thiserror::Error)]
pub enum ClientError {
    #[error(transparent)]
    Migration(#[from] MigrationError),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Schema(#[from] SchemaError),

    #[error(transparent)]
    Oid(#[from] OidError),

    #[error(transparent)]
    Patch(#[from] PatchError),

    #[error(transparent)]
    Clock(#[from] ClockError),

    #[error(transparent)]
    Rebase(#[from] RebaseError),

    #[error(transparent)]
    Sync(#[from] SyncError),

    #[error("cannot apply {patch} to {oid}: {reason}")]
    InvalidTarget {
        oid: Oid,
        patch: &'static str,
        reason: &'static str,
    },

    #[error("replica is read-only")]
    ReadOnly,

    #[error("sync rejected: {0}")]
    Rejected(RejectReason),
}

impl ClientError {
    #[must_use]
    pub const fn code(&self) -> ErrorCode {
        match self {
            Self::Migration(err) => err.code(),
            Self::Store(err) => err.code(),
            Self::Schema(_) => ErrorCode::SchemaViolation,
            Self::Oid(err) => err.code(),
            Self::Patch(_) | Self::InvalidTarget { .. } | Self::ReadOnly => ErrorCode::InvalidPatch,
            Self::Clock(err) => err.code(),
            Self::Rebase(err) => err.code(),
            Self::Sync(err) => err.code(),
            Self::Rejected(_) => ErrorCode::SyncRejected,
        }
    }
}

// ---------------------------------------------------------------------------
// Transaction
// ---------------------------------------------------------------------------

/// Changes staged by [`Client::batch`], applied atomically on success.
///
/// Nested objects and lists are split into child OIDs with fresh random
/// sub-ids and initialized in the same transaction.
#[derive(Debug)]
pub struct Transaction<'a> {
    schema: &'a Schema,
    changes: Vec<(Oid, Patch)>,
}

impl<'a> Transaction<'a> {
    const fn new(schema: &'a Schema) -> Self {
        Self {
            schema,
            changes: Vec::new(),
        }
    }

    /// Stage a new document. Schema defaults are filled in first.
    ///
    /// The primary key names the document in its OID, so it must be a
    /// string. An integer key is stored as its decimal text: `{"id": 7}`
    /// becomes `todos/7` with `"id": "7"`.
    ///
    /// # Errors
    ///
    /// Returns [`ClientError::Schema`] if the document does not validate,
    /// including a primary key that is missing or neither a string nor an
    /// integer.
    pub fn create(&mut self, collection: &str, mut value: Value) -> Result<Oid, ClientError> {
        let primary_key = &self.schema.get(collection)?.primary_key;
        if let Some(slot) = value.get_mut(primary_key)
            && (slot.is_i64() || slot.is_u64())
        {
            *slot = Value::String(slot.to_string());
        }
        self.schema.apply_defaults(collection, &mut value)?;
        self.schema.validate_document(collection, &value)?;
        let id = value
            .get(primary_key)
            .and_then(Value::as_str)
            .ok_or_else(|| SchemaError::MissingPrimaryKey {
                collection: collection.to_string(),
                field: primary_key.clone(),
            })?;
        let oid = create_oid(collection, id, &[])?;
        for (target, shallow) in normalize(&oid, &value, &mut |_, _| random_sub_id())? {
            self.changes.push((target, Patch::Initialize { value: shallow }));
        }
        Ok(oid)
    }

    /// # Errors
    ///
    /// Returns [`ClientError::Schema`] if `oid` is a document root and the
    /// value does not fit the declared field.
    pub fn set(&mut self, oid: &Oid, name: &str, value: Value) -> Result<(), ClientError> {
        if oid.is_root() {
            self.schema.validate_field(&oid.collection(), name, &value)?;
        }
        let value = self.nest(oid, name, &value)?;
        self.changes.push((
            oid.clone(),
            Patch::Set {
                name: name.to_string(),
                value,
            },
        ));
        Ok(())
    }

    pub fn remove(&mut self, oid: &Oid, name: &str) {
        self.changes.push((
            oid.clone(),
            Patch::Remove {
                name: name.to_string(),
            },
        ));
    }

    /// # Errors
    ///
    /// Returns [`ClientError::Oid`] if a nested value cannot be given an OID.
    pub fn list_push(&mut self, oid: &Oid, value: Value) -> Result<(), ClientError> {
        let value = self.nest(oid, "item", &value)?;
        self.changes.push((oid.clone(), Patch::ListPush { value }));
        Ok(())
    }

    /// # Errors
    ///
    /// Returns [`ClientError::Oid`] if a nested value cannot be given an OID.
    pub fn list_insert(&mut self, oid: &Oid, index: usize, value: Value) -> Result<(), ClientError> {
        let value = self.nest(oid, "item", &value)?;
        self.changes.push((oid.clone(), Patch::ListInsert { index, value }));
        Ok(())
    }

    /// Replace element `index`; `index == len` appends.
    ///
    /// # Errors
    ///
    /// Returns [`ClientError::Oid`] if a nested value cannot be given an OID.
    pub fn list_set(&mut self, oid: &Oid, index: usize, value: Value) -> Result<(), ClientError> {
        let value = self.nest(oid, "item", &value)?;
        self.changes.push((oid.clone(), Patch::ListSet { index, value }));
        Ok(())
    }

    pub fn list_delete(&mut self, oid: &Oid, index: usize, count: usize) {
        self.changes
            .push((oid.clone(), Patch::ListDelete { index, count }));
    }

    pub fn list_move(&mut self, oid: &Oid, from: usize, to: usize) {
        self.changes.push((oid.clone(), Patch::ListMove { from, to }));
    }

    /// Tombstone `oid`. Deleting a document root hides the whole document.
    pub fn delete(&mut self, oid: &Oid) {
        self.changes.push((oid.clone(), Patch::Delete));
    }

    fn nest(&mut self, parent: &Oid, key: &str, value: &Value) -> Result<Value, ClientError> {
        let mut objects = BTreeMap::new();
        let slot = normalize_child(parent, key, value, &mut |_, _| random_sub_id(), &mut objects)?;
        for (target, shallow) in objects {
            self.changes.push((target, Patch::Initialize { value: shallow }));
        }
        Ok(slot)
    }
}

// ---------------------------------------------------------------------------
// Client
// ---------------------------------------------------------------------------

/// One replica of a library.
pub struct Client<S: Storage> {
    config: EngineConfig,
    schema: Schema,
    replica_id: ReplicaId,
    clock: HybridClock,
    materializer: Materializer<S>,
    history: UndoHistory,
    rebaser: Rebaser,
    authz: Option<Authorization>,
    /// Local operations the hub has not confirmed yet.
    outbound: Vec<Operation>,
    /// Highest timestamp received from the hub with no gap before it.
    /// Starts empty on open and is rebuilt by the first sync.
    acked: Option<Timestamp>,
    global_ack: Option<Timestamp>,
    /// Last contiguous server order seen; `None` before the first sync.
    server_order: Option<u64>,
    needs_resync: bool,
    presence: BTreeMap<ReplicaId, Value>,
}

impl<S: Storage> std::fmt::Debug for Client<S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Client")
            .field("replica_id", &self.replica_id)
            .field("schema_version", &self.schema.version)
            .field("outbound", &self.outbound.len())
            .field("acked", &self.acked)
            .field("global_ack", &self.global_ack)
            .field("server_order", &self.server_order)
            .finish_non_exhaustive()
    }
}

impl<S: Storage> Client<S> {
    /// Open a replica over `storage`, migrating it to `schema.version`.
    ///
    /// # Errors
    ///
    /// - [`ClientError::Migration`] if no migration path reaches the schema
    ///   version or a migration step fails. The client does not open.
    /// - [`ClientError::Store`] / [`ClientError::Clock`] if persisted state
    ///   cannot be read.
    pub fn open(
        config: EngineConfig,
        schema: Schema,
        catalog: &MigrationCatalog,
        storage: S,
        wall: Arc<dyn WallClock>,
    ) -> Result<Self, ClientError> {
        let version = MigrationRunner::new(catalog).run(&storage, schema.version, None)?;
        let replica_id = resolve_replica_id(&config, &storage)?;

        let mut clock = HybridClock::new(replica_id.clone(), wall)
            .with_skew_threshold_ms(config.clock.skew_threshold_secs.saturating_mul(1_000));
        let stored = storage.operations_after(None)?;
        if let Some(last) = stored.last() {
            clock.update(&last.timestamp);
        }

        let confirmed = read_timestamp(&storage, META_CONFIRMED_THROUGH)?;
        let outbound: Vec<Operation> = stored
            .into_iter()
            .filter(|op| op.timestamp.replica() == replica_id.as_str())
            .filter(|op| confirmed.as_ref().is_none_or(|c| op.timestamp > *c))
            .collect();
        let global_ack = read_timestamp(&storage, META_GLOBAL_ACK)?;

        info!(
            replica = %replica_id,
            schema_version = version,
            pending = outbound.len(),
            "client opened"
        );
        Ok(Self {
            history: UndoHistory::new(config.undo.limit),
            rebaser: Rebaser::new(config.rebase.enabled),
            config,
            schema,
            replica_id,
            clock,
            materializer: Materializer::new(storage),
            authz: None,
            outbound,
            acked: None,
            global_ack,
            server_order: None,
            needs_resync: false,
            presence: BTreeMap::new(),
        })
    }

    #[must_use]
    pub const fn replica_id(&self) -> &ReplicaId {
        &self.replica_id
    }

    #[must_use]
    pub const fn schema(&self) -> &Schema {
        &self.schema
    }

    #[must_use]
    pub const fn storage(&self) -> &S {
        self.materializer.storage()
    }

    #[must_use]
    pub const fn global_ack(&self) -> Option<&Timestamp> {
        self.global_ack.as_ref()
    }

    #[must_use]
    pub const fn acked(&self) -> Option<&Timestamp> {
        self.acked.as_ref()
    }

    /// Operations authored here that the hub has not confirmed.
    #[must_use]
    pub fn pending(&self) -> &[Operation] {
        &self.outbound
    }

    /// Last server order this replica received without a gap.
    #[must_use]
    pub const fn server_order(&self) -> Option<u64> {
        self.server_order
    }

    /// True after a gap in the server stream or a reset request; the next
    /// exchange must be a [`sync_request`](Self::sync_request).
    #[must_use]
    pub const fn needs_resync(&self) -> bool {
        self.needs_resync || self.server_order.is_none()
    }

    #[must_use]
    pub const fn presence(&self) -> &BTreeMap<ReplicaId, Value> {
        &self.presence
    }

    /// Attach `authz` to every operation authored from now on.
    pub fn set_authorization(&mut self, authz: Option<Authorization>) {
        self.authz = authz;
    }

    fn is_read_only(&self) -> bool {
        self.config.replica.replica_type == ReplicaType::ReadOnly
    }

    // -- mutations ----------------------------------------------------------

    /// Run `f` against a fresh [`Transaction`] and apply everything it
    /// staged as one atomic, undoable edit.
    ///
    /// # Errors
    ///
    /// Returns the first error from `f` or from applying the changes. Nothing
    /// is written in that case.
    pub fn batch<T, F>(&mut self, f: F) -> Result<T, ClientError>
    where
        F: FnOnce(&mut Transaction<'_>) -> Result<T, ClientError>,
    {
        let mut tx = Transaction::new(&self.schema);
        let out = f(&mut tx)?;
        let changes = tx.changes;
        let entry = self.apply(changes, true)?;
        self.history.add_undo(entry);
        Ok(out)
    }

    /// # Errors
    ///
    /// See [`Transaction::create`] and [`batch`](Self::batch).
    pub fn create(&mut self, collection: &str, value: Value) -> Result<Oid, ClientError> {
        self.batch(|tx| tx.create(collection, value))
    }

    /// # Errors
    ///
    /// See [`Transaction::set`] and [`batch`](Self::batch).
    pub fn set(&mut self, oid: &Oid, name: &str, value: Value) -> Result<(), ClientError> {
        self.batch(|tx| tx.set(oid, name, value))
    }

    /// # Errors
    ///
    /// Returns [`ClientError::InvalidTarget`] if `oid` is not a live object.
    pub fn remove(&mut self, oid: &Oid, name: &str) -> Result<(), ClientError> {
        self.batch(|tx| {
            tx.remove(oid, name);
            Ok(())
        })
    }

    /// # Errors
    ///
    /// Returns [`ClientError::InvalidTarget`] if `oid` is not a live list.
    pub fn list_push(&mut self, oid: &Oid, value: Value) -> Result<(), ClientError> {
        self.batch(|tx| tx.list_push(oid, value))
    }

    /// # Errors
    ///
    /// Returns [`ClientError::InvalidTarget`] if `oid` is not a live list.
    pub fn list_insert(&mut self, oid: &Oid, index: usize, value: Value) -> Result<(), ClientError> {
        self.batch(|tx| tx.list_insert(oid, index, value))
    }

    /// # Errors
    ///
    /// Returns [`ClientError::InvalidTarget`] if `oid` is not a live list or
    /// `index` is past the end.
    pub fn list_set(&mut self, oid: &Oid, index: usize, value: Value) -> Result<(), ClientError> {
        self.batch(|tx| tx.list_set(oid, index, value))
    }

    /// # Errors
    ///
    /// Returns [`ClientError::InvalidTarget`] if `oid` is not a live list or
    /// `index` is out of bounds.
    pub fn list_delete(&mut self, oid: &Oid, index: usize, count: usize) -> Result<(), ClientError> {
        self.batch(|tx| {
            tx.list_delete(oid, index, count);
            Ok(())
        })
    }

    /// # Errors
    ///
    /// Returns [`ClientError::InvalidTarget`] if `oid` is not a live list or
    /// `from` is out of bounds.
    pub fn list_move(&mut self, oid: &Oid, from: usize, to: usize) -> Result<(), ClientError> {
        self.batch(|tx| {
            tx.list_move(oid, from, to);
            Ok(())
        })
    }

    /// # Errors
    ///
    /// Returns [`ClientError::InvalidTarget`] if `oid` is not live.
    pub fn delete(&mut self, oid: &Oid) -> Result<(), ClientError> {
        self.batch(|tx| {
            tx.delete(oid);
            Ok(())
        })
    }

    /// Stamp, commit and queue `changes`, returning the entry that undoes
    /// them.
    ///
    /// With `strict`, a patch that does not fit its target fails the whole
    /// transaction. Otherwise it is skipped, which is what undo needs when
    /// remote edits changed the shape in the meantime.
    fn apply(&mut self, changes: Vec<(Oid, Patch)>, strict: bool) -> Result<UndoEntry, ClientError> {
        if self.is_read_only() {
            return Err(ClientError::ReadOnly);
        }

        let storage = self.materializer.storage();
        let mut states: BTreeMap<Oid, ObjectState> = BTreeMap::new();
        let mut recorder = InverseRecorder::new();
        let mut batch = WriteBatch::new();
        let mut ops = Vec::with_capacity(changes.len());

        for (oid, patch) in changes {
            patch.validate(&oid)?;
            let state = match states.entry(oid.clone()) {
                Entry::Occupied(slot) => slot.into_mut(),
                Entry::Vacant(slot) => {
                    let baseline = storage.baseline(&oid)?;
                    let history = storage.operations_for(&oid)?;
                    slot.insert(merge(&oid, baseline.as_ref(), &history).state)
                }
            };

            let before = state.clone();
            if let Err(reason) = apply_patch(state, &patch) {
                if strict {
                    return Err(ClientError::InvalidTarget {
                        oid,
                        patch: patch.kind(),
                        reason,
                    });
                }
                debug!(oid = %oid, patch = patch.kind(), reason, "skipping undo patch");
                continue;
            }
            recorder.record(&oid, &before, &patch);

            let op = Operation::new(oid, self.clock.now(self.schema.version), patch)
                .with_authz(self.authz.clone());
            batch.put_operation(op.clone());
            ops.push(op);
        }

        if ops.is_empty() {
            return Ok(UndoEntry::new());
        }
        storage.commit(batch)?;
        for op in &ops {
            self.materializer.invalidate(&op.oid)?;
        }
        debug!(replica = %self.replica_id, operations = ops.len(), "applied local edit");
        self.outbound.extend(ops);
        Ok(recorder.finish())
    }

    // -- undo ---------------------------------------------------------------

    /// # Errors
    ///
    /// [`UndoError::Empty`] if there is nothing to undo.
    pub fn undo(&mut self) -> Result<(), UndoError<ClientError>> {
        let mut history = std::mem::take(&mut self.history);
        let result = history.undo(self);
        self.history = history;
        result
    }

    /// # Errors
    ///
    /// [`UndoError::Empty`] if there is nothing to redo.
    pub fn redo(&mut self) -> Result<(), UndoError<ClientError>> {
        let mut history = std::mem::take(&mut self.history);
        let result = history.redo(self);
        self.history = history;
        result
    }

    #[must_use]
    pub fn can_undo(&self) -> bool {
        self.history.can_undo()
    }

    #[must_use]
    pub fn can_redo(&self) -> bool {
        self.history.can_redo()
    }

    // -- reads --------------------------------------------------------------

    /// The current value of a document.
    ///
    /// # Errors
    ///
    /// Returns an error if the id is empty or the store read fails.
    pub fn get(&self, collection: &str, id: &str) -> Result<Option<Value>, ClientError> {
        self.read(&create_oid(collection, id, &[])?)
    }

    /// The current value of the subtree rooted at `oid`.
    ///
    /// # Errors
    ///
    /// Returns [`ClientError::Store`] if the store read fails.
    pub fn read(&self, oid: &Oid) -> Result<Option<Value>, ClientError> {
        let storage = self.storage();
        let range = oid_range(oid);
        let baselines = storage.baselines_in(&range)?;
        let ops = storage.operations_in(&range)?;
        Ok(merge_subtree(oid, &baselines, &ops).value)
    }

    /// The OID of the nested object or list stored in field `name` of
    /// `oid`, if that field holds one.
    ///
    /// # Errors
    ///
    /// Returns [`ClientError::Store`] if the store read fails.
    pub fn child(&self, oid: &Oid, name: &str) -> Result<Option<Oid>, ClientError> {
        let storage = self.storage();
        let merged = merge(oid, storage.baseline(oid)?.as_ref(), &storage.operations_for(oid)?);
        Ok(merged
            .value()
            .and_then(|value| value.get(name))
            .and_then(ref_target))
    }

    /// Every live document of `collection`.
    ///
    /// # Errors
    ///
    /// Returns [`ClientError::Store`] if the store read fails.
    pub fn list(&self, collection: &str) -> Result<Vec<(Oid, Value)>, ClientError> {
        Ok(documents(self.storage(), collection)?)
    }

    /// Documents of `collection` whose index `index` equals `value`.
    ///
    /// # Errors
    ///
    /// Returns [`ClientError::Schema`] if the collection is not declared.
    pub fn find(
        &self,
        collection: &str,
        index: &str,
        value: &Value,
    ) -> Result<Vec<(Oid, Value)>, ClientError> {
        let mut found = Vec::new();
        for (oid, doc) in self.list(collection)? {
            if self.schema.index_values(collection, &doc)?.get(index) == Some(value) {
                found.push((oid, doc));
            }
        }
        Ok(found)
    }

    /// The identity-stable entity for `oid`.
    pub fn entity(&mut self, oid: &Oid) -> EntityHandle {
        self.materializer.get(oid)
    }

    /// # Errors
    ///
    /// Returns [`ClientError::Store`] if hydration fails.
    pub fn view(&self, handle: &EntityHandle) -> Result<Option<Value>, ClientError> {
        Ok(self.materializer.view(handle)?)
    }

    /// Reclaim entities no handle refers to.
    pub fn collect_entities(&mut self) -> usize {
        self.materializer.collect()
    }

    // -- compaction ---------------------------------------------------------

    /// Compact local history at the last trusted global ack.
    ///
    /// # Errors
    ///
    /// Returns [`ClientError::Rebase`] if the candidate scan fails.
    pub fn rebase(&mut self) -> Result<RebaseReport, ClientError> {
        let Some(cutoff) = self.global_ack.clone() else {
            return Ok(RebaseReport::default());
        };
        if self.needs_resync {
            debug!("rebase deferred until resync");
            return Ok(RebaseReport::default());
        }
        let eligible = self.storage().operations_through(&cutoff)?.len();
        if eligible == 0 || eligible < self.config.rebase.min_operations {
            return Ok(RebaseReport::default());
        }
        let report = self.rebaser.run(self.storage(), &cutoff)?;
        self.materializer.invalidate_all()?;
        Ok(report)
    }

    // -- sync ---------------------------------------------------------------

    /// A pull of everything since the last contiguous server order, pushing
    /// every unconfirmed operation.
    #[must_use]
    pub fn sync_request(&self) -> ClientMessage {
        ClientMessage::Sync {
            replica_id: self.replica_id.clone(),
            schema_version: self.schema.version,
            replica_type: self.config.replica.replica_type,
            since: self.server_order,
            acked: self.acked.clone(),
            operations: self.outbound.clone(),
        }
    }

    /// Unconfirmed operations as a batch, or `None` if there are none.
    #[must_use]
    pub fn outbound(&self) -> Option<ClientMessage> {
        if self.outbound.is_empty() {
            return None;
        }
        Some(ClientMessage::OperationBatch {
            replica_id: self.replica_id.clone(),
            acked: self.acked.clone(),
            operations: self.outbound.clone(),
        })
    }

    #[must_use]
    pub fn heartbeat(&self) -> ClientMessage {
        ClientMessage::Heartbeat {
            replica_id: self.replica_id.clone(),
            acked: self.reportable_ack(),
        }
    }

    /// Announce a presence payload to the other replicas.
    #[must_use]
    pub fn presence_message(&self, presence: Value) -> ClientMessage {
        ClientMessage::Presence {
            replica_id: self.replica_id.clone(),
            acked: self.reportable_ack(),
            presence,
        }
    }

    fn ack_message(&self) -> Option<ClientMessage> {
        let server_order = self.server_order?;
        Some(ClientMessage::Ack {
            replica_id: self.replica_id.clone(),
            acked: self.reportable_ack(),
            server_order,
        })
    }

    /// The watermark a message without operations may carry: only when
    /// nothing authored here is still in flight.
    fn reportable_ack(&self) -> Option<Timestamp> {
        if self.outbound.is_empty() {
            self.acked.clone()
        } else {
            None
        }
    }

    /// Apply one message from the hub. Returns a follow-up message to send,
    /// if any.
    ///
    /// # Errors
    ///
    /// - [`ClientError::Rejected`] if the hub refused the session, e.g.
    ///   because of a schema mismatch.
    /// - [`ClientError::Store`] if persisting received data failed; the
    ///   message can be re-applied.
    pub fn receive(&mut self, message: ServerMessage) -> Result<Option<ClientMessage>, ClientError> {
        match message {
            ServerMessage::SyncResponse {
                baselines,
                operations,
                purged,
                overwrite_local,
                global_ack,
                server_order,
                accepted_through,
            } => {
                let mut batch = WriteBatch::new();
                if overwrite_local {
                    self.reset_local(&mut batch, global_ack.as_ref())?;
                }
                self.purge(&mut batch, &purged)?;
                self.ingest(&mut batch, baselines, operations, overwrite_local, true)?;
                self.confirm(&mut batch, accepted_through.as_ref(), true);
                let advance = overwrite_local || global_ack > self.global_ack;
                if let (true, Some(ack)) = (advance, &global_ack) {
                    batch.set_meta(META_GLOBAL_ACK, ack.encode());
                }
                self.storage().commit(batch)?;

                self.server_order = Some(server_order);
                self.needs_resync = false;
                if advance {
                    self.global_ack = global_ack;
                }
                self.materializer.invalidate_all()?;
                info!(replica = %self.replica_id, server_order, overwrite_local, "synced");
                self.auto_rebase();
                Ok(self.ack_message())
            }
            ServerMessage::BatchAccepted {
                server_order,
                accepted_through,
            } => {
                // Our own batch is the only entry this message vouches for.
                // Without an order the push landed in some batch we never
                // saw numbered, so the watermark stays where it is.
                let contiguous = !self.needs_resync
                    && server_order.is_some_and(|order| {
                        self.server_order.is_some_and(|current| order <= current + 1)
                    });
                let mut batch = WriteBatch::new();
                self.confirm(&mut batch, accepted_through.as_ref(), contiguous);
                self.storage().commit(batch)?;
                Ok(match server_order {
                    Some(order) => self.follow_up(order),
                    None => self.ack_message(),
                })
            }
            ServerMessage::OperationRebroadcast {
                origin,
                operations,
                server_order,
            } => {
                debug!(origin = %origin, count = operations.len(), server_order, "received rebroadcast");
                let contiguous = !self.needs_resync
                    && self.server_order.is_some_and(|current| server_order <= current + 1);
                let mut batch = WriteBatch::new();
                self.ingest(&mut batch, Vec::new(), operations, false, contiguous)?;
                self.storage().commit(batch)?;
                self.materializer.invalidate_all()?;
                Ok(self.follow_up(server_order))
            }
            ServerMessage::PresenceChanged {
                replica_id,
                presence,
            } => {
                self.presence.insert(replica_id, presence);
                Ok(None)
            }
            ServerMessage::PresenceOffline { replica_id } => {
                self.presence.remove(&replica_id);
                Ok(None)
            }
            ServerMessage::HeartbeatResponse { server_order } => {
                if self.server_order.is_some_and(|current| current >= server_order) {
                    Ok(None)
                } else {
                    self.needs_resync = true;
                    Ok(Some(self.sync_request()))
                }
            }
            ServerMessage::GlobalAck {
                timestamp,
                server_order,
            } => {
                if self.needs_resync() || self.server_order.is_some_and(|o| o < server_order) {
                    debug!(global_ack = %timestamp, "ignoring global ack until caught up");
                    self.needs_resync = true;
                    return Ok(Some(self.sync_request()));
                }
                if self.global_ack.as_ref().is_none_or(|current| *current < timestamp) {
                    let mut batch = WriteBatch::new();
                    batch.set_meta(META_GLOBAL_ACK, timestamp.encode());
                    self.storage().commit(batch)?;
                    self.global_ack = Some(timestamp);
                    self.auto_rebase();
                }
                Ok(None)
            }
            ServerMessage::Rejected { reason } => match reason {
                RejectReason::ResetRequired => {
                    info!(replica = %self.replica_id, "hub requested a reset");
                    self.needs_resync = true;
                    Ok(Some(self.sync_request()))
                }
                reason => {
                    warn!(replica = %self.replica_id, %reason, "sync rejected");
                    Err(ClientError::Rejected(reason))
                }
            },
        }
    }

    /// Run a full sync session over `transport`: push, pull, then any
    /// follow-ups the replies call for.
    ///
    /// # Errors
    ///
    /// - [`ClientError::Sync`] if the transport kept failing or `cancel`
    ///   fired. Data received before that point is kept.
    /// - Any error from [`receive`](Self::receive).
    pub fn sync<T: SyncTransport>(
        &mut self,
        transport: &mut T,
        cancel: &CancelFlag,
        sleep: &mut dyn FnMut(Duration),
    ) -> Result<SyncReport, ClientError> {
        let backoff = Backoff::from_config(&self.config.sync);
        let mut queue = vec![self.sync_request()];
        let mut total = SyncReport::default();
        let mut rounds = 0;
        while let Some(message) = queue.pop() {
            rounds += 1;
            if rounds > MAX_SYNC_ROUNDS {
                warn!(replica = %self.replica_id, "sync still has follow-ups; stopping");
                break;
            }
            let (replies, report) = sync_with_retry(transport, &message, &backoff, cancel, sleep)?;
            total.attempts += report.attempts;
            total.waited += report.waited;
            for reply in replies {
                if let Some(next) = self.receive(reply)? {
                    queue.push(next);
                }
            }
        }
        Ok(total)
    }

    /// Record the server order of an entry just ingested; on a gap, ask
    /// for a resync instead of an ack.
    fn follow_up(&mut self, order: u64) -> Option<ClientMessage> {
        match self.server_order {
            Some(current) if order <= current => self.ack_message(),
            Some(current) if order == current + 1 => {
                self.server_order = Some(order);
                self.ack_message()
            }
            _ => {
                debug!(replica = %self.replica_id, order, "gap in server stream");
                self.needs_resync = true;
                Some(self.sync_request())
            }
        }
    }

    fn auto_rebase(&mut self) {
        if !self.config.rebase.enabled {
            return;
        }
        if let Err(err) = self.rebase() {
            warn!(replica = %self.replica_id, error = %err, "local rebase failed");
        }
    }

    /// Replace local history with the hub's full state. Unconfirmed local
    /// operations newer than the hub's global ack survive and are pushed
    /// again; everything else is dropped.
    fn reset_local(
        &mut self,
        batch: &mut WriteBatch,
        global_ack: Option<&Timestamp>,
    ) -> Result<(), ClientError> {
        let before = self.outbound.len();
        self.outbound
            .retain(|op| global_ack.is_none_or(|ack| op.timestamp > *ack));
        let discarded = before - self.outbound.len();
        if discarded > 0 {
            warn!(
                replica = %self.replica_id,
                discarded,
                "discarding local operations behind the hub's compacted history"
            );
        }

        let storage = self.materializer.storage();
        for op in storage.operations_after(None)? {
            if !self.outbound.iter().any(|kept| kept.key() == op.key()) {
                batch.delete_operation(op.oid, op.timestamp);
            }
        }
        for baseline in storage.all_baselines()? {
            batch.delete_baseline(baseline.oid);
        }
        self.history.clear();
        self.acked = None;
        Ok(())
    }

    fn purge(&self, batch: &mut WriteBatch, purged: &[Purge]) -> Result<(), ClientError> {
        let storage = self.storage();
        for purge in purged {
            for op in storage.operations_for(&purge.oid)? {
                if op.timestamp <= purge.through {
                    batch.delete_operation(op.oid, op.timestamp);
                }
            }
            if storage
                .baseline(&purge.oid)?
                .is_some_and(|b| b.timestamp <= purge.through)
            {
                batch.delete_baseline(purge.oid.clone());
            }
        }
        Ok(())
    }

    fn ingest(
        &mut self,
        batch: &mut WriteBatch,
        baselines: Vec<Baseline>,
        operations: Vec<Operation>,
        replace: bool,
        advance_ack: bool,
    ) -> Result<(), ClientError> {
        for baseline in baselines {
            self.observe(&baseline.timestamp, advance_ack);
            let newer = replace
                || self
                    .storage()
                    .baseline(&baseline.oid)?
                    .is_none_or(|local| local.timestamp < baseline.timestamp);
            if newer {
                batch.put_baseline(baseline);
            }
        }
        for op in operations {
            self.observe(&op.timestamp, advance_ack);
            batch.put_operation(op);
        }
        Ok(())
    }

    /// Feed a received timestamp to the clock. The acknowledged watermark
    /// only moves when nothing before it can still be missing.
    fn observe(&mut self, timestamp: &Timestamp, advance_ack: bool) {
        self.clock.update(timestamp);
        if advance_ack && self.acked.as_ref().is_none_or(|acked| acked < timestamp) {
            self.acked = Some(timestamp.clone());
        }
    }

    /// Drop outbound operations the hub confirmed. The acknowledged
    /// watermark follows only when the server stream has no gap.
    fn confirm(&mut self, batch: &mut WriteBatch, through: Option<&Timestamp>, advance_ack: bool) {
        let Some(through) = through else {
            return;
        };
        self.outbound.retain(|op| op.timestamp > *through);
        batch.set_meta(META_CONFIRMED_THROUGH, through.encode());
        if advance_ack && self.acked.as_ref().is_none_or(|acked| acked < through) {
            self.acked = Some(through.clone());
        }
    }
}

impl<S: Storage> UndoTarget for Client<S> {
    type Error = ClientError;

    fn apply_undo(&mut self, entry: &UndoEntry) -> Result<UndoEntry, ClientError> {
        self.apply(entry.changes.clone(), false)
    }
}

fn resolve_replica_id(config: &EngineConfig, storage: &dyn Storage) -> Result<ReplicaId, ClientError> {
    let stored = storage.meta(META_REPLICA_ID)?;
    let id = match (&config.replica.id, &stored) {
        (Some(configured), _) => ReplicaId::new(configured)?,
        (None, Some(raw)) => ReplicaId::new(raw)?,
        (None, None) => ReplicaId::generate(),
    };
    if stored.as_deref() != Some(id.as_str()) {
        let mut batch = WriteBatch::new();
        batch.set_meta(META_REPLICA_ID, id.as_str());
        storage.commit(batch)?;
        debug!(replica = %id, "recorded replica id");
    }
    Ok(id)
}

fn read_timestamp(storage: &dyn Storage, key: &str) -> Result<Option<Timestamp>, ClientError> {
    Ok(storage
        .meta(key)?
        .map(|raw| Timestamp::parse(&raw))
        .transpose()?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualWallClock;
    use crate::migration::{CollectionSchema, FieldKind, FieldSchema, IndexSchema, Migration};
    use crate::store::{MemoryStore, META_SCHEMA_VERSION};
    use serde_json::json;

    fn schema(version: u32) -> Schema {
        Schema::new(version).collection(
            "todos",
            CollectionSchema::new("id")
                .field("title", FieldSchema::new(FieldKind::String).nullable())
                .field(
                    "done",
                    FieldSchema::new(FieldKind::Boolean).with_default(json!(false)),
                )
                .index("by_done", IndexSchema::Direct {
                    field: "done".into(),
                }),
        )
    }

    fn open(id: &str) -> Client<Arc<MemoryStore>> {
        open_with(id, Arc::new(MemoryStore::new()))
    }

    fn open_with(id: &str, store: Arc<MemoryStore>) -> Client<Arc<MemoryStore>> {
        let mut config = EngineConfig::default();
        config.replica.id = Some(id.to_string());
        Client::open(
            config,
            schema(1),
            &MigrationCatalog::new(),
            store,
            Arc::new(ManualWallClock::new(1_000)),
        )
        .expect("open")
    }

    #[test]
    fn create_fills_defaults_and_reads_back() {
        let mut client = open("a");
        let oid = client
            .create("todos", json!({"id": "1", "title": "milk", "tags": ["x"]}))
            .expect("create");
        assert_eq!(
            client.get("todos", "1").expect("get"),
            Some(json!({"id": "1", "title": "milk", "done": false, "tags": ["x"]}))
        );
        assert_eq!(client.read(&oid).expect("read"), client.get("todos", "1").expect("get"));
        // Root plus the nested list.
        assert_eq!(client.pending().len(), 2);
    }

    #[test]
    fn integer_primary_keys_are_stored_as_text() {
        let mut client = open("a");
        let oid = client
            .create("todos", json!({"id": 7, "title": "bread"}))
            .expect("create");
        assert_eq!(oid.as_str(), "todos/7");
        assert_eq!(
            client.get("todos", "7").expect("get"),
            Some(json!({"id": "7", "title": "bread", "done": false}))
        );

        let err = client
            .create("todos", json!({"id": 1.5}))
            .expect_err("fractional key");
        assert_eq!(err.code(), ErrorCode::SchemaViolation);
    }

    #[test]
    fn invalid_documents_are_rejected_without_writes() {
        let mut client = open("a");
        let err = client
            .create("todos", json!({"id": "1", "title": 7}))
            .expect_err("type mismatch");
        assert!(matches!(err, ClientError::Schema(_)));
        assert_eq!(err.code(), ErrorCode::SchemaViolation);
        assert!(client.pending().is_empty());
        assert!(client.create("nope", json!({"id": "1"})).is_err());
    }

    #[test]
    fn edits_on_missing_objects_fail() {
        let mut client = open("a");
        let ghost = create_oid("todos", "ghost", &[]).expect("oid");
        let err = client.set(&ghost, "title", json!("x")).expect_err("absent");
        assert!(matches!(err, ClientError::InvalidTarget { .. }));
    }

    #[test]
    fn list_append_undo_and_redo() {
        let mut client = open("a");
        let oid = client
            .create("todos", json!({"id": "1", "tags": [1, 2]}))
            .expect("create");
        let tags = client.child(&oid, "tags").expect("read").expect("tags ref");
        assert_eq!(client.child(&oid, "id").expect("read"), None);

        client.list_set(&tags, 2, json!(3)).expect("append");
        assert_eq!(client.read(&tags).expect("read"), Some(json!([1, 2, 3])));
        client.undo().expect("undo");
        assert_eq!(client.read(&tags).expect("read"), Some(json!([1, 2])));
        client.redo().expect("redo");
        assert_eq!(client.read(&tags).expect("read"), Some(json!([1, 2, 3])));
    }

    #[test]
    fn undo_of_delete_restores_document() {
        let mut client = open("a");
        let oid = client
            .create("todos", json!({"id": "1", "title": "milk"}))
            .expect("create");
        client.delete(&oid).expect("delete");
        assert_eq!(client.get("todos", "1").expect("get"), None);
        client.undo().expect("undo");
        assert_eq!(
            client.get("todos", "1").expect("get"),
            Some(json!({"id": "1", "title": "milk", "done": false}))
        );
        client.undo().expect("undo create");
        assert_eq!(client.get("todos", "1").expect("get"), None);
        assert!(matches!(client.undo(), Err(UndoError::Empty)));
    }

    #[test]
    fn batch_is_one_undo_step() {
        let mut client = open("a");
        let oid = client
            .create("todos", json!({"id": "1", "title": "milk"}))
            .expect("create");
        client
            .batch(|tx| {
                tx.set(&oid, "title", json!("eggs"))?;
                tx.set(&oid, "done", json!(true))
            })
            .expect("batch");
        client.undo().expect("undo");
        assert_eq!(
            client.get("todos", "1").expect("get"),
            Some(json!({"id": "1", "title": "milk", "done": false}))
        );
    }

    #[test]
    fn failed_batch_writes_nothing() {
        let mut client = open("a");
        let oid = client
            .create("todos", json!({"id": "1", "title": "milk"}))
            .expect("create");
        let before = client.pending().len();
        let result = client.batch(|tx| {
            tx.set(&oid, "title", json!("eggs"))?;
            tx.list_push(&oid, json!(1))
        });
        assert!(matches!(result, Err(ClientError::InvalidTarget { .. })));
        assert_eq!(client.pending().len(), before);
        assert_eq!(
            client.get("todos", "1").expect("get").and_then(|v| v.get("title").cloned()),
            Some(json!("milk"))
        );
    }

    #[test]
    fn find_uses_declared_indexes() {
        let mut client = open("a");
        client.create("todos", json!({"id": "1"})).expect("create");
        let second = client.create("todos", json!({"id": "2"})).expect("create");
        client.set(&second, "done", json!(true)).expect("set");
        let done = client.find("todos", "by_done", &json!(true)).expect("find");
        assert_eq!(done.len(), 1);
        assert_eq!(done[0].0, second);
        assert_eq!(client.list("todos").expect("list").len(), 2);
    }

    #[test]
    fn entities_refresh_after_local_edits() {
        let mut client = open("a");
        let oid = client
            .create("todos", json!({"id": "1", "title": "milk"}))
            .expect("create");
        let handle = client.entity(&oid);
        assert_eq!(
            client.view(&handle).expect("view").and_then(|v| v["title"].as_str().map(String::from)),
            Some("milk".to_string())
        );
        client.set(&oid, "title", json!("eggs")).expect("set");
        assert_eq!(
            client.view(&handle).expect("view").and_then(|v| v["title"].as_str().map(String::from)),
            Some("eggs".to_string())
        );
        assert!(client.entity(&oid).same_entity(&handle));
    }

    #[test]
    fn missing_migration_path_refuses_to_open() {
        let store = Arc::new(MemoryStore::new());
        let mut batch = WriteBatch::new();
        batch.set_meta(META_SCHEMA_VERSION, "1");
        store.commit(batch).expect("seed");

        let err = Client::open(
            EngineConfig::default(),
            schema(4),
            &MigrationCatalog::new().with(Migration::noop(1, 2)),
            store,
            Arc::new(ManualWallClock::new(0)),
        )
        .expect_err("no path");
        assert_eq!(err.code(), ErrorCode::NoMigrationPath);
    }

    #[test]
    fn replica_id_is_generated_once_and_persisted() {
        let store = Arc::new(MemoryStore::new());
        let first = Client::open(
            EngineConfig::default(),
            schema(1),
            &MigrationCatalog::new(),
            Arc::clone(&store),
            Arc::new(ManualWallClock::new(0)),
        )
        .expect("open")
        .replica_id()
        .clone();
        let second = Client::open(
            EngineConfig::default(),
            schema(1),
            &MigrationCatalog::new(),
            store,
            Arc::new(ManualWallClock::new(0)),
        )
        .expect("reopen")
        .replica_id()
        .clone();
        assert_eq!(first, second);
    }

    #[test]
    fn unconfirmed_operations_survive_reopen() {
        let store = Arc::new(MemoryStore::new());
        let mut client = open_with("a", Arc::clone(&store));
        client.create("todos", json!({"id": "1"})).expect("create");
        let pending = client.pending().to_vec();
        drop(client);
        let reopened = open_with("a", store);
        assert_eq!(reopened.pending(), &pending[..]);
    }

    #[test]
    fn read_only_replicas_cannot_edit() {
        let mut config = EngineConfig::default();
        config.replica.replica_type = ReplicaType::ReadOnly;
        let mut client = Client::open(
            config,
            schema(1),
            &MigrationCatalog::new(),
            MemoryStore::new(),
            Arc::new(ManualWallClock::new(0)),
        )
        .expect("open");
        assert!(matches!(
            client.create("todos", json!({"id": "1"})),
            Err(ClientError::ReadOnly)
        ));
    }

    #[test]
    fn rejected_schema_is_surfaced() {
        let mut client = open("a");
        let err = client
            .receive(ServerMessage::Rejected {
                reason: RejectReason::SchemaTooOld {
                    client: 1,
                    server: 2,
                },
            })
            .expect_err("rejected");
        assert_eq!(err.code(), ErrorCode::SyncRejected);
    }

    #[test]
    fn gap_in_server_stream_requests_resync() {
        let mut client = open("a");
        let follow = client
            .receive(ServerMessage::SyncResponse {
                baselines: vec![],
                operations: vec![],
                purged: vec![],
                overwrite_local: false,
                global_ack: None,
                server_order: 3,
                accepted_through: None,
            })
            .expect("sync");
        assert!(matches!(follow, Some(ClientMessage::Ack { server_order: 3, .. })));
        assert!(!client.needs_resync());

        let follow = client
            .receive(ServerMessage::OperationRebroadcast {
                origin: ReplicaId::new("b").expect("id"),
                operations: vec![],
                server_order: 5,
            })
            .expect("rebroadcast");
        assert!(matches!(follow, Some(ClientMessage::Sync { since: Some(3), .. })));
        assert!(client.needs_resync());
    }

    #[test]
    fn reportable_ack_waits_for_confirmation() {
        let mut client = open("a");
        client
            .receive(ServerMessage::SyncResponse {
                baselines: vec![],
                operations: vec![],
                purged: vec![],
                overwrite_local: false,
                global_ack: None,
                server_order: 0,
                accepted_through: None,
            })
            .expect("sync");
        client.create("todos", json!({"id": "1"})).expect("create");
        assert!(matches!(client.heartbeat(), ClientMessage::Heartbeat { acked: None, .. }));
        let through = client.pending().last().map(|op| op.timestamp.clone());
        client
            .receive(ServerMessage::BatchAccepted {
                server_order: Some(1),
                accepted_through: through.clone(),
            })
            .expect("accepted");
        assert!(client.pending().is_empty());
        assert!(matches!(
            client.heartbeat(),
            ClientMessage::Heartbeat { acked, .. } if acked == through
        ));
    }

    #[test]
    fn batch_accepted_after_a_missed_entry_requests_resync() {
        let mut client = open("a");
        client
            .receive(ServerMessage::SyncResponse {
                baselines: vec![],
                operations: vec![],
                purged: vec![],
                overwrite_local: false,
                global_ack: None,
                server_order: 4,
                accepted_through: None,
            })
            .expect("sync");
        client.create("todos", json!({"id": "1"})).expect("create");
        let through = client.pending().last().map(|op| op.timestamp.clone());

        // Order 5 went to another replica's batch and never arrived here.
        let follow = client
            .receive(ServerMessage::BatchAccepted {
                server_order: Some(6),
                accepted_through: through,
            })
            .expect("accepted");
        assert!(matches!(follow, Some(ClientMessage::Sync { since: Some(4), .. })));
        assert!(client.needs_resync());
        assert_eq!(client.server_order(), Some(4));
        assert!(client.pending().is_empty());
        assert_eq!(client.acked(), None);
    }

    #[test]
    fn batch_accepted_without_an_order_keeps_the_watermark() {
        let mut client = open("a");
        client
            .receive(ServerMessage::SyncResponse {
                baselines: vec![],
                operations: vec![],
                purged: vec![],
                overwrite_local: false,
                global_ack: None,
                server_order: 2,
                accepted_through: None,
            })
            .expect("sync");
        client.create("todos", json!({"id": "1"})).expect("create");
        let through = client.pending().last().map(|op| op.timestamp.clone());

        let follow = client
            .receive(ServerMessage::BatchAccepted {
                server_order: None,
                accepted_through: through,
            })
            .expect("accepted");
        assert!(matches!(follow, Some(ClientMessage::Ack { server_order: 2, acked: None, .. })));
        assert_eq!(client.server_order(), Some(2));
        assert!(client.pending().is_empty());
        assert_eq!(client.acked(), None);
    }
}
