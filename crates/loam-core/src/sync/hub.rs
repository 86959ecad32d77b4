//! Transport-agnostic server core.
//!
//! A [`SyncHub`] owns the authoritative store of one library. It accepts
//! pushed operations, numbers every stored batch with a monotonically
//! increasing *server order*, fans the batch out to the other active
//! replicas and tracks acknowledgments in a [`ReplicaRegistry`]. Whenever
//! the global ack advances it compacts history with the [`Rebaser`] and
//! announces the new watermark.
//!
//! The hub never talks to a socket. [`SyncHub::handle`] and
//! [`SyncHub::tick`] return [`Delivery`] values for the caller to route.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use tracing::{debug, info, warn};

use super::SyncError;
use super::protocol::{
    ClientMessage, Purge, RejectReason, ServerMessage, decode_client_message, encode,
};
use super::transport::SyncTransport;
use crate::clock::{ReplicaId, Timestamp, WallClock};
use crate::config::EngineConfig;
use crate::oid::Oid;
use crate::operation::{Baseline, Operation};
use crate::rebase::Rebaser;
use crate::replica::{ReplicaEvent, ReplicaRegistry, ReplicaType};
use crate::store::{META_GLOBAL_ACK, META_SERVER_ORDER, Storage, StoreError, WriteBatch};

/// A message addressed to one replica.
#[derive(Debug, Clone, PartialEq)]
pub struct Delivery {
    pub to: ReplicaId,
    pub message: ServerMessage,
}

/// Result of accepting a pushed batch.
#[derive(Debug, Default)]
struct Accepted {
    through: Option<Timestamp>,
    stored: usize,
    order: Option<u64>,
}

/// Authoritative sync endpoint for one library.
pub struct SyncHub<S: Storage> {
    storage: S,
    registry: ReplicaRegistry,
    rebaser: Rebaser,
    schema_version: u32,
    wall: Arc<dyn WallClock>,
    server_order: u64,
    /// `(oid, timestamp)` keys of every batch after `log_start`.
    log: BTreeMap<u64, Vec<(Oid, Timestamp)>>,
    log_start: u64,
    global_ack: Option<Timestamp>,
    resets: BTreeSet<ReplicaId>,
}

impl<S: Storage> std::fmt::Debug for SyncHub<S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SyncHub")
            .field("schema_version", &self.schema_version)
            .field("server_order", &self.server_order)
            .field("log_start", &self.log_start)
            .field("global_ack", &self.global_ack)
            .field("replicas", &self.registry.len())
            .finish_non_exhaustive()
    }
}

impl<S: Storage> SyncHub<S> {
    /// Open a hub over `storage`, restoring its registry and counters.
    ///
    /// Replicas that synced before a restart fall back to a full pull,
    /// since the per-batch log is not persisted.
    ///
    /// # Errors
    ///
    /// Returns [`SyncError::Store`] if the store cannot be read or holds
    /// corrupt counters.
    pub fn open(
        storage: S,
        schema_version: u32,
        config: &EngineConfig,
        wall: Arc<dyn WallClock>,
    ) -> Result<Self, SyncError> {
        let registry = ReplicaRegistry::load(
            &storage,
            config.replica.library_id.clone(),
            config.sync.truancy_timeout_ms,
        )?;
        let server_order = match storage.meta(META_SERVER_ORDER)? {
            Some(raw) => raw.parse::<u64>().map_err(|err| StoreError::Corrupt {
                what: "server order",
                reason: err.to_string(),
            })?,
            None => 0,
        };
        let global_ack = storage
            .meta(META_GLOBAL_ACK)?
            .map(|raw| Timestamp::parse(&raw))
            .transpose()
            .map_err(|err| StoreError::Corrupt {
                what: "global ack",
                reason: err.to_string(),
            })?;

        info!(schema_version, server_order, replicas = registry.len(), "sync hub opened");
        Ok(Self {
            storage,
            registry,
            rebaser: Rebaser::new(config.rebase.enabled),
            schema_version,
            wall,
            server_order,
            log: BTreeMap::new(),
            log_start: server_order,
            global_ack,
            resets: BTreeSet::new(),
        })
    }

    #[must_use]
    pub const fn storage(&self) -> &S {
        &self.storage
    }

    #[must_use]
    pub const fn registry(&self) -> &ReplicaRegistry {
        &self.registry
    }

    #[must_use]
    pub const fn server_order(&self) -> u64 {
        self.server_order
    }

    #[must_use]
    pub const fn schema_version(&self) -> u32 {
        self.schema_version
    }

    /// Cutoff of the last compaction.
    #[must_use]
    pub const fn global_ack(&self) -> Option<&Timestamp> {
        self.global_ack.as_ref()
    }

    /// Number of batches still held in the delta log.
    #[must_use]
    pub fn log_len(&self) -> usize {
        self.log.len()
    }

    /// Process one message from a replica.
    ///
    /// # Errors
    ///
    /// Returns [`SyncError::Store`] if persisting the message failed. The
    /// sender should retry; nothing it sent was acknowledged.
    pub fn handle(&mut self, message: ClientMessage) -> Result<Vec<Delivery>, SyncError> {
        let sender = message.replica_id().clone();
        let now = self.wall.now_ms();
        if let Some(ReplicaEvent::Rejoined {
            requires_reset: true,
            ..
        }) = self.registry.heartbeat(&sender, now)
        {
            self.resets.insert(sender.clone());
        }

        let mut out = Vec::new();
        if self.resets.contains(&sender) && !matches!(message, ClientMessage::Sync { .. }) {
            debug!(replica = %sender, kind = message.kind(), "refusing message until reset");
            reply(&mut out, &sender, ServerMessage::Rejected {
                reason: RejectReason::ResetRequired,
            });
            self.registry.save(&self.storage)?;
            return Ok(out);
        }

        match message {
            ClientMessage::Sync {
                schema_version,
                replica_type,
                since,
                acked,
                operations,
                ..
            } => {
                if let Some(reason) = self.check_schema(schema_version) {
                    reply(&mut out, &sender, ServerMessage::Rejected { reason });
                } else {
                    self.registry.set_replica_type(&sender, replica_type);
                    let reset = self.resets.remove(&sender);
                    match self.accept(&sender, operations, reset, &mut out)? {
                        Err(reason) => {
                            if reset {
                                self.resets.insert(sender.clone());
                            }
                            reply(&mut out, &sender, ServerMessage::Rejected { reason });
                        }
                        Ok(accepted) => {
                            let (baselines, operations, purged, full) = self.pull(since, reset)?;
                            info!(
                                replica = %sender,
                                reset,
                                full,
                                pushed = accepted.stored,
                                baselines = baselines.len(),
                                operations = operations.len(),
                                "sync served"
                            );
                            self.acknowledge(&sender, acked.as_ref(), since);
                            reply(&mut out, &sender, ServerMessage::SyncResponse {
                                baselines,
                                operations,
                                purged,
                                overwrite_local: full,
                                global_ack: self.global_ack.clone(),
                                server_order: self.server_order,
                                accepted_through: accepted.through,
                            });
                        }
                    }
                }
            }
            ClientMessage::OperationBatch {
                acked, operations, ..
            } => match self.accept(&sender, operations, false, &mut out)? {
                Err(reason) => reply(&mut out, &sender, ServerMessage::Rejected { reason }),
                Ok(accepted) => {
                    self.acknowledge(&sender, acked.as_ref(), None);
                    reply(&mut out, &sender, ServerMessage::BatchAccepted {
                        server_order: accepted.order,
                        accepted_through: accepted.through,
                    });
                }
            },
            ClientMessage::Presence {
                acked, presence, ..
            } => {
                self.acknowledge(&sender, acked.as_ref(), None);
                if self.registry.set_presence(&sender, presence.clone()) {
                    self.broadcast(&mut out, Some(&sender), &ServerMessage::PresenceChanged {
                        replica_id: sender.clone(),
                        presence,
                    });
                }
            }
            ClientMessage::Heartbeat { acked, .. } => {
                self.acknowledge(&sender, acked.as_ref(), None);
                reply(&mut out, &sender, ServerMessage::HeartbeatResponse {
                    server_order: self.server_order,
                });
            }
            ClientMessage::Ack {
                acked,
                server_order,
                ..
            } => self.acknowledge(&sender, acked.as_ref(), Some(server_order)),
        }

        self.advance_global_ack(&mut out)?;
        self.registry.save(&self.storage)?;
        Ok(out)
    }

    /// Expire silent replicas and compact if that advanced the global ack.
    ///
    /// # Errors
    ///
    /// Returns [`SyncError::Store`] if persisting the registry failed.
    pub fn tick(&mut self) -> Result<Vec<Delivery>, SyncError> {
        let mut out = Vec::new();
        let lost = self.registry.check_truancy(self.wall.now_ms());
        for event in &lost {
            if let ReplicaEvent::Lost { id } = event {
                self.broadcast(&mut out, Some(id), &ServerMessage::PresenceOffline {
                    replica_id: id.clone(),
                });
            }
        }
        self.advance_global_ack(&mut out)?;
        if !lost.is_empty() {
            self.registry.save(&self.storage)?;
        }
        Ok(out)
    }

    fn check_schema(&self, client: u32) -> Option<RejectReason> {
        let server = self.schema_version;
        match client.cmp(&server) {
            std::cmp::Ordering::Greater => Some(RejectReason::SchemaTooNew { client, server }),
            std::cmp::Ordering::Less => Some(RejectReason::SchemaTooOld { client, server }),
            std::cmp::Ordering::Equal => None,
        }
    }

    /// Validate and store pushed operations, rebroadcasting what was new.
    ///
    /// Nothing is stored if any operation is invalid.
    fn accept(
        &mut self,
        sender: &ReplicaId,
        operations: Vec<Operation>,
        reset: bool,
        out: &mut Vec<Delivery>,
    ) -> Result<Result<Accepted, RejectReason>, SyncError> {
        if operations.is_empty() {
            return Ok(Ok(Accepted::default()));
        }
        if self
            .registry
            .get(sender)
            .is_some_and(|info| info.replica_type == ReplicaType::ReadOnly)
        {
            return Ok(Err(RejectReason::ReadOnly));
        }
        for op in &operations {
            if op.timestamp.version() > self.schema_version {
                return Ok(Err(RejectReason::SchemaTooNew {
                    client: op.timestamp.version(),
                    server: self.schema_version,
                }));
            }
            if let Err(err) = op.data.validate(&op.oid) {
                return Ok(Err(RejectReason::InvalidOperation {
                    oid: op.oid.to_string(),
                    detail: err.to_string(),
                }));
            }
        }

        let through = operations.iter().map(|op| op.timestamp.clone()).max();
        let mut by_oid: BTreeMap<Oid, Vec<Operation>> = BTreeMap::new();
        for op in operations {
            by_oid.entry(op.oid.clone()).or_default().push(op);
        }

        let mut fresh = Vec::new();
        for (oid, ops) in by_oid {
            let floor = self.storage.baseline(&oid)?.map(|b| b.timestamp);
            let known: BTreeSet<Timestamp> = self
                .storage
                .operations_for(&oid)?
                .into_iter()
                .map(|op| op.timestamp)
                .collect();
            for op in ops {
                let stale = floor.as_ref().is_some_and(|f| op.timestamp <= *f)
                    || (reset && self.global_ack.as_ref().is_some_and(|g| op.timestamp <= *g));
                if stale {
                    warn!(
                        oid = %op.oid,
                        timestamp = %op.timestamp,
                        replica = %sender,
                        "dropping operation older than compacted history"
                    );
                } else if !known.contains(&op.timestamp)
                    && !fresh.iter().any(|f: &Operation| f.key() == op.key())
                {
                    fresh.push(op);
                }
            }
        }

        if fresh.is_empty() {
            return Ok(Ok(Accepted {
                through,
                stored: 0,
                order: None,
            }));
        }

        let order = self.server_order + 1;
        let mut batch = WriteBatch::new();
        for op in &fresh {
            batch.put_operation(op.clone());
        }
        batch.set_meta(META_SERVER_ORDER, order.to_string());
        self.storage.commit(batch)?;

        self.server_order = order;
        self.log.insert(
            order,
            fresh.iter().map(|op| (op.oid.clone(), op.timestamp.clone())).collect(),
        );
        debug!(replica = %sender, order, stored = fresh.len(), "stored batch");

        let stored = fresh.len();
        self.broadcast(out, Some(sender), &ServerMessage::OperationRebroadcast {
            origin: sender.clone(),
            operations: fresh,
            server_order: order,
        });
        Ok(Ok(Accepted {
            through,
            stored,
            order: Some(order),
        }))
    }

    fn acknowledge(&mut self, id: &ReplicaId, acked: Option<&Timestamp>, order: Option<u64>) {
        if let Some(ts) = acked {
            self.registry.acknowledge(id, ts);
        }
        if let Some(order) = order {
            self.registry
                .acknowledge_server_order(id, order.min(self.server_order));
        }
    }

    /// Everything a replica at server order `since` is missing, and whether
    /// that is the full state.
    ///
    /// Operations compacted away since then are replaced by their OID's
    /// baseline, or by a [`Purge`] when the OID was compacted to a
    /// tombstone. A full state cannot name what was purged, so the replica
    /// must replace its compacted history with it.
    fn pull(&self, since: Option<u64>, reset: bool) -> Result<Pull, SyncError> {
        let since = match since {
            Some(since) if !reset && since >= self.log_start && since <= self.server_order => since,
            _ => {
                return Ok((
                    self.storage.all_baselines()?,
                    self.storage.operations_after(None)?,
                    Vec::new(),
                    true,
                ));
            }
        };

        let mut wanted: BTreeMap<&Oid, BTreeSet<&Timestamp>> = BTreeMap::new();
        for keys in self.log.range(since + 1..).map(|(_, keys)| keys) {
            for (oid, ts) in keys {
                wanted.entry(oid).or_default().insert(ts);
            }
        }

        let mut baselines = Vec::new();
        let mut operations = Vec::new();
        let mut purged = Vec::new();
        for (oid, stamps) in wanted {
            let present: Vec<Operation> = self
                .storage
                .operations_for(oid)?
                .into_iter()
                .filter(|op| stamps.contains(&op.timestamp))
                .collect();
            if present.len() < stamps.len() {
                match self.storage.baseline(oid)? {
                    Some(baseline) => baselines.push(baseline),
                    None => {
                        let through = stamps
                            .iter()
                            .filter(|ts| !present.iter().any(|op| op.timestamp == ***ts))
                            .max()
                            .map(|ts| (*ts).clone());
                        if let Some(through) = through {
                            purged.push(Purge {
                                oid: oid.clone(),
                                through,
                            });
                        }
                    }
                }
            }
            operations.extend(present);
        }
        operations.sort_by(|a, b| a.timestamp.cmp(&b.timestamp));
        Ok((baselines, operations, purged, false))
    }

    fn advance_global_ack(&mut self, out: &mut Vec<Delivery>) -> Result<(), SyncError> {
        let Some(ack) = self.registry.global_ack() else {
            return Ok(());
        };
        if self.global_ack.as_ref().is_some_and(|current| *current >= ack) {
            return Ok(());
        }

        match self.rebaser.run(&self.storage, &ack) {
            Ok(report) if !report.failed.is_empty() => {
                warn!(failed = report.failed.len(), "some objects kept their history");
            }
            Ok(_) => {}
            Err(err) => warn!(error = %err, "rebase skipped"),
        }

        let mut batch = WriteBatch::new();
        batch.set_meta(META_GLOBAL_ACK, ack.encode());
        self.storage.commit(batch)?;
        info!(global_ack = %ack, "global ack advanced");
        self.global_ack = Some(ack.clone());
        self.prune_log();

        self.broadcast(out, None, &ServerMessage::GlobalAck {
            timestamp: ack,
            server_order: self.server_order,
        });
        Ok(())
    }

    /// Drop log entries every active replica has acknowledged.
    fn prune_log(&mut self) {
        let floor = self
            .registry
            .active_ids()
            .filter_map(|id| self.registry.get(id))
            .map(|info| info.acked_server_order)
            .min()
            .unwrap_or(0);
        if floor > self.log_start {
            self.log = self.log.split_off(&(floor + 1));
            self.log_start = floor;
            debug!(log_start = floor, retained = self.log.len(), "pruned delta log");
        }
    }

    fn broadcast(&self, out: &mut Vec<Delivery>, skip: Option<&ReplicaId>, message: &ServerMessage) {
        for id in self.registry.active_ids().filter(|id| Some(*id) != skip) {
            out.push(Delivery {
                to: id.clone(),
                message: message.clone(),
            });
        }
    }
}

type Pull = (Vec<Baseline>, Vec<Operation>, Vec<Purge>, bool);

fn reply(out: &mut Vec<Delivery>, to: &ReplicaId, message: ServerMessage) {
    out.push(Delivery {
        to: to.clone(),
        message,
    });
}

// ---------------------------------------------------------------------------
// LoopbackTransport
// ---------------------------------------------------------------------------

/// In-process transport that hands messages to a hub through the JSON
/// codec, for tests and the simulator.
///
/// Replies addressed to the sender are returned from
/// [`exchange`](SyncTransport::exchange); deliveries for other replicas
/// collect in [`outbox`](Self::outbox).
pub struct LoopbackTransport<'a, S: Storage> {
    hub: &'a mut SyncHub<S>,
    pub outbox: Vec<Delivery>,
    fail_next: u32,
}

impl<'a, S: Storage> LoopbackTransport<'a, S> {
    pub fn new(hub: &'a mut SyncHub<S>) -> Self {
        Self {
            hub,
            outbox: Vec::new(),
            fail_next: 0,
        }
    }

    /// Fail the next `n` exchanges before they reach the hub.
    #[must_use]
    pub const fn failing(mut self, n: u32) -> Self {
        self.fail_next = n;
        self
    }
}

impl<S: Storage> SyncTransport for LoopbackTransport<'_, S> {
    type Error = String;

    fn exchange(&mut self, message: &ClientMessage) -> Result<Vec<ServerMessage>, String> {
        if self.fail_next > 0 {
            self.fail_next -= 1;
            return Err("connection refused".to_string());
        }
        let raw = encode(message).map_err(|err| err.to_string())?;
        let decoded = match decode_client_message(&raw) {
            Ok(decoded) => decoded,
            Err(err) => {
                return Ok(vec![ServerMessage::Rejected {
                    reason: RejectReason::Malformed {
                        detail: err.to_string(),
                    },
                }]);
            }
        };
        let sender = decoded.replica_id().clone();
        let deliveries = self.hub.handle(decoded).map_err(|err| err.to_string())?;
        let (mine, others): (Vec<Delivery>, Vec<Delivery>) =
            deliveries.into_iter().partition(|d| d.to == sender);
        self.outbox.extend(others);
        Ok(mine.into_iter().map(|d| d.message).collect())
    }
}
