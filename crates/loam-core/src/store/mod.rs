//! Persistence backend contract.
//!
//! The engine needs three things from a store: point reads by OID, ordered
//! range scans over OIDs (see [`crate::oid::oid_range`]) and atomic
//! multi-write batches. [`Storage`] captures exactly that; [`MemoryStore`]
//! and [`SqliteStore`] implement it.
//!
//! All methods take `&self`. Implementations serialize writers internally,
//! which lets a client, its materializer and a sync hub share one store
//! behind an `Arc`.

pub mod memory;
pub mod schema;
pub mod sqlite;

use std::collections::BTreeSet;

use serde_json::Value;

use crate::clock::Timestamp;
use crate::error::ErrorCode;
use crate::merge::merge_subtree;
use crate::oid::{Oid, OidRange, collection_range, oid_range};
use crate::operation::{Baseline, Operation};
use crate::replica::ReplicaInfo;

pub use memory::MemoryStore;
pub use sqlite::SqliteStore;

/// Metadata key holding the schema version the store was migrated to.
pub const META_SCHEMA_VERSION: &str = "schema_version";
/// Metadata key holding this replica's id.
pub const META_REPLICA_ID: &str = "replica_id";
/// Metadata key holding the last global ack received from the server.
pub const META_GLOBAL_ACK: &str = "global_ack";
/// Metadata key holding the last server order a hub assigned.
pub const META_SERVER_ORDER: &str = "server_order";
/// Metadata key holding the newest local operation the server confirmed.
pub const META_CONFIRMED_THROUGH: &str = "confirmed_through";

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("serialization error: {0}")]
    Serde(#[from] serde_json::Error),

    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),

    #[error("corrupt {what} row: {reason}")]
    Corrupt { what: &'static str, reason: String },

    #[error("store lock poisoned")]
    Poisoned,

    #[error("injected failure: {0}")]
    Injected(String),
}

impl StoreError {
    #[must_use]
    pub const fn code(&self) -> ErrorCode {
        ErrorCode::StorageFailure
    }
}

/// One write inside a [`WriteBatch`].
#[derive(Debug, Clone, PartialEq)]
pub enum WriteOp {
    /// Insert an operation; an existing `(oid, timestamp)` is left as is.
    PutOperation(Operation),
    DeleteOperation { oid: Oid, timestamp: Timestamp },
    /// Insert or replace the baseline for its OID.
    PutBaseline(Baseline),
    DeleteBaseline(Oid),
    PutReplica(ReplicaInfo),
    SetMeta { key: String, value: String },
}

impl WriteOp {
    /// The OID this write touches, if any.
    #[must_use]
    pub const fn oid(&self) -> Option<&Oid> {
        match self {
            Self::PutOperation(op) => Some(&op.oid),
            Self::DeleteOperation { oid, .. } | Self::DeleteBaseline(oid) => Some(oid),
            Self::PutBaseline(b) => Some(&b.oid),
            Self::PutReplica(_) | Self::SetMeta { .. } => None,
        }
    }
}

/// An all-or-nothing group of writes.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct WriteBatch {
    pub writes: Vec<WriteOp>,
}

impl WriteBatch {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn put_operation(&mut self, op: Operation) -> &mut Self {
        self.writes.push(WriteOp::PutOperation(op));
        self
    }

    pub fn delete_operation(&mut self, oid: Oid, timestamp: Timestamp) -> &mut Self {
        self.writes.push(WriteOp::DeleteOperation { oid, timestamp });
        self
    }

    pub fn put_baseline(&mut self, baseline: Baseline) -> &mut Self {
        self.writes.push(WriteOp::PutBaseline(baseline));
        self
    }

    pub fn delete_baseline(&mut self, oid: Oid) -> &mut Self {
        self.writes.push(WriteOp::DeleteBaseline(oid));
        self
    }

    pub fn put_replica(&mut self, info: ReplicaInfo) -> &mut Self {
        self.writes.push(WriteOp::PutReplica(info));
        self
    }

    pub fn set_meta(&mut self, key: impl Into<String>, value: impl Into<String>) -> &mut Self {
        self.writes.push(WriteOp::SetMeta {
            key: key.into(),
            value: value.into(),
        });
        self
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.writes.is_empty()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.writes.len()
    }
}

/// Key-range store for operations, baselines, replicas and metadata.
///
/// Scans return rows ordered by `(oid, timestamp)`.
pub trait Storage: Send + Sync {
    /// Operations whose OID falls in `range`.
    ///
    /// # Errors
    ///
    /// Returns a [`StoreError`] if the backend read fails.
    fn operations_in(&self, range: &OidRange) -> Result<Vec<Operation>, StoreError>;

    /// Baselines whose OID falls in `range`.
    ///
    /// # Errors
    ///
    /// Returns a [`StoreError`] if the backend read fails.
    fn baselines_in(&self, range: &OidRange) -> Result<Vec<Baseline>, StoreError>;

    /// Every operation with a timestamp at or below `cutoff`.
    ///
    /// # Errors
    ///
    /// Returns a [`StoreError`] if the backend read fails.
    fn operations_through(&self, cutoff: &Timestamp) -> Result<Vec<Operation>, StoreError>;

    /// Every operation with a timestamp strictly above `since` (all of them
    /// when `since` is `None`), in timestamp order.
    ///
    /// # Errors
    ///
    /// Returns a [`StoreError`] if the backend read fails.
    fn operations_after(&self, since: Option<&Timestamp>) -> Result<Vec<Operation>, StoreError>;

    /// Every baseline in the store.
    ///
    /// # Errors
    ///
    /// Returns a [`StoreError`] if the backend read fails.
    fn all_baselines(&self) -> Result<Vec<Baseline>, StoreError>;

    /// # Errors
    ///
    /// Returns a [`StoreError`] if the backend read fails.
    fn meta(&self, key: &str) -> Result<Option<String>, StoreError>;

    /// # Errors
    ///
    /// Returns a [`StoreError`] if the backend read fails.
    fn replicas(&self) -> Result<Vec<ReplicaInfo>, StoreError>;

    /// Apply `batch` atomically: either every write lands or none does.
    ///
    /// # Errors
    ///
    /// Returns a [`StoreError`] if the batch could not be committed. The
    /// store is unchanged in that case.
    fn commit(&self, batch: WriteBatch) -> Result<(), StoreError>;

    /// Operations addressed to exactly `oid`.
    ///
    /// # Errors
    ///
    /// Returns a [`StoreError`] if the backend read fails.
    fn operations_for(&self, oid: &Oid) -> Result<Vec<Operation>, StoreError> {
        let mut ops = self.operations_in(&oid_range(oid))?;
        ops.retain(|op| op.oid == *oid);
        Ok(ops)
    }

    /// The baseline of exactly `oid`.
    ///
    /// # Errors
    ///
    /// Returns a [`StoreError`] if the backend read fails.
    fn baseline(&self, oid: &Oid) -> Result<Option<Baseline>, StoreError> {
        Ok(self
            .baselines_in(&oid_range(oid))?
            .into_iter()
            .find(|b| b.oid == *oid))
    }
}

impl<S: Storage + ?Sized> Storage for std::sync::Arc<S> {
    fn operations_in(&self, range: &OidRange) -> Result<Vec<Operation>, StoreError> {
        (**self).operations_in(range)
    }

    fn baselines_in(&self, range: &OidRange) -> Result<Vec<Baseline>, StoreError> {
        (**self).baselines_in(range)
    }

    fn operations_through(&self, cutoff: &Timestamp) -> Result<Vec<Operation>, StoreError> {
        (**self).operations_through(cutoff)
    }

    fn operations_after(&self, since: Option<&Timestamp>) -> Result<Vec<Operation>, StoreError> {
        (**self).operations_after(since)
    }

    fn all_baselines(&self) -> Result<Vec<Baseline>, StoreError> {
        (**self).all_baselines()
    }

    fn meta(&self, key: &str) -> Result<Option<String>, StoreError> {
        (**self).meta(key)
    }

    fn replicas(&self) -> Result<Vec<ReplicaInfo>, StoreError> {
        (**self).replicas()
    }

    fn commit(&self, batch: WriteBatch) -> Result<(), StoreError> {
        (**self).commit(batch)
    }
}

/// Every live document of `collection`, merged and denormalized.
///
/// # Errors
///
/// Returns a [`StoreError`] if a range scan fails.
pub fn documents(storage: &dyn Storage, collection: &str) -> Result<Vec<(Oid, Value)>, StoreError> {
    let range = collection_range(collection);
    let ops = storage.operations_in(&range)?;
    let baselines = storage.baselines_in(&range)?;

    let roots: BTreeSet<Oid> = ops
        .iter()
        .map(|op| op.oid.root())
        .chain(baselines.iter().map(|b| b.oid.root()))
        .collect();

    Ok(roots
        .into_iter()
        .filter_map(|root| {
            let doc = merge_subtree(&root, &baselines, &ops);
            doc.value.map(|value| (root, value))
        })
        .collect())
}

#[cfg(test)]
pub(crate) mod contract {
    //! Behaviour every [`Storage`] implementation must share.

    use super::*;
    use crate::clock::ReplicaId;
    use crate::oid::{collection_range, create_oid};
    use crate::operation::Patch;
    use serde_json::json;

    pub fn ts(wall: u64) -> Timestamp {
        Timestamp::new(1, wall, 0, &ReplicaId::new("r1").expect("id")).expect("ts")
    }

    fn init(oid: &Oid, wall: u64) -> Operation {
        Operation::new(oid.clone(), ts(wall), Patch::Initialize { value: json!({}) })
    }

    pub fn range_scan_returns_exact_subtree(store: &dyn Storage) {
        let doc = create_oid("todos", "1", &[]).expect("oid");
        let child = doc.child("a").expect("child");
        let grandchild = child.child("b").expect("child");
        let sibling = create_oid("todos", "10", &[]).expect("oid");
        let other = create_oid("todosx", "1", &[]).expect("oid");

        let mut batch = WriteBatch::new();
        for oid in [&doc, &child, &grandchild, &sibling, &other] {
            batch.put_operation(init(oid, 1));
        }
        store.commit(batch).expect("commit");

        let found: Vec<Oid> = store
            .operations_in(&oid_range(&doc))
            .expect("scan")
            .into_iter()
            .map(|op| op.oid)
            .collect();
        assert_eq!(found, vec![doc.clone(), child, grandchild]);

        let todos: Vec<Oid> = store
            .operations_in(&collection_range("todos"))
            .expect("scan")
            .into_iter()
            .map(|op| op.oid)
            .collect();
        assert_eq!(todos.len(), 4);
        assert!(!todos.contains(&other));
    }

    pub fn put_operation_is_idempotent(store: &dyn Storage) {
        let doc = create_oid("todos", "1", &[]).expect("oid");
        let mut batch = WriteBatch::new();
        batch.put_operation(init(&doc, 1)).put_operation(init(&doc, 1));
        store.commit(batch).expect("commit");
        let mut again = WriteBatch::new();
        again.put_operation(init(&doc, 1));
        store.commit(again).expect("commit");
        assert_eq!(store.operations_for(&doc).expect("read").len(), 1);
    }

    pub fn timestamp_queries_compare_in_order(store: &dyn Storage) {
        let doc = create_oid("todos", "1", &[]).expect("oid");
        let mut batch = WriteBatch::new();
        for wall in [3, 1, 20, 100] {
            batch.put_operation(init(&doc, wall));
        }
        store.commit(batch).expect("commit");

        let through: Vec<u64> = store
            .operations_through(&ts(20))
            .expect("read")
            .iter()
            .map(|op| op.timestamp.wall_ms())
            .collect();
        assert_eq!(through, vec![1, 3, 20]);

        let after: Vec<u64> = store
            .operations_after(Some(&ts(3)))
            .expect("read")
            .iter()
            .map(|op| op.timestamp.wall_ms())
            .collect();
        assert_eq!(after, vec![20, 100]);
        assert_eq!(store.operations_after(None).expect("read").len(), 4);
    }

    pub fn baselines_meta_and_deletes(store: &dyn Storage) {
        let doc = create_oid("todos", "1", &[]).expect("oid");
        let mut batch = WriteBatch::new();
        batch
            .put_operation(init(&doc, 1))
            .put_baseline(Baseline {
                oid: doc.clone(),
                snapshot: json!({"a": 1}),
                timestamp: ts(5),
                authz: None,
            })
            .set_meta(META_SCHEMA_VERSION, "3");
        store.commit(batch).expect("commit");

        assert_eq!(
            store.baseline(&doc).expect("read").map(|b| b.snapshot),
            Some(json!({"a": 1}))
        );
        assert_eq!(
            store.meta(META_SCHEMA_VERSION).expect("read").as_deref(),
            Some("3")
        );
        assert_eq!(store.all_baselines().expect("read").len(), 1);

        let mut removal = WriteBatch::new();
        removal
            .delete_operation(doc.clone(), ts(1))
            .delete_baseline(doc.clone());
        store.commit(removal).expect("commit");
        assert!(store.operations_for(&doc).expect("read").is_empty());
        assert!(store.baseline(&doc).expect("read").is_none());
    }
}
