//! Replicas that hold the same operations agree, whatever order the
//! operations arrived in and whichever backend stores them.

use loam_core::clock::{ReplicaId, Timestamp};
use loam_core::merge::merge;
use loam_core::oid::{Oid, collection_range, create_oid, oid_range};
use loam_core::operation::{Operation, Patch, object_ref};
use loam_core::store::{MemoryStore, SqliteStore, Storage, WriteBatch, documents};
use serde_json::{Value, json};

fn ts(wall: u64, replica: &str) -> Timestamp {
    Timestamp::new(1, wall, 0, &ReplicaId::new(replica).expect("id")).expect("ts")
}

fn op(oid: &Oid, wall: u64, replica: &str, data: Patch) -> Operation {
    Operation::new(oid.clone(), ts(wall, replica), data)
}

fn set(oid: &Oid, wall: u64, replica: &str, name: &str, value: Value) -> Operation {
    op(
        oid,
        wall,
        replica,
        Patch::Set {
            name: name.to_string(),
            value,
        },
    )
}

fn deliver(store: &dyn Storage, ops: &[Operation]) {
    for op in ops {
        let mut batch = WriteBatch::new();
        batch.put_operation(op.clone());
        store.commit(batch).expect("commit");
    }
}

/// A shopping list edited concurrently by two replicas.
fn scenario() -> Vec<Operation> {
    let doc = create_oid("lists", "groceries", &[]).expect("oid");
    let items = doc.child("items").expect("child");
    vec![
        op(&doc, 1, "a", Patch::Initialize {
            value: json!({"id": "groceries", "owner": "a", "items": object_ref(&items)}),
        }),
        op(&items, 1, "a", Patch::Initialize { value: json!(["milk"]) }),
        op(&items, 3, "b", Patch::ListPush { value: json!("eggs") }),
        op(&items, 4, "a", Patch::ListInsert { index: 0, value: json!("bread") }),
        set(&doc, 5, "b", "owner", json!("b")),
        set(&doc, 5, "a", "owner", json!("a2")),
        op(&items, 6, "b", Patch::ListMove { from: 2, to: 0 }),
        op(&items, 7, "a", Patch::ListDelete { index: 1, count: 1 }),
        set(&doc, 8, "a", "note", json!("by saturday")),
        op(&doc, 9, "b", Patch::Remove { name: "note".into() }),
    ]
}

#[test]
fn lww_keeps_the_greater_timestamp_regardless_of_arrival() {
    let oid = create_oid("todos", "1", &[]).expect("oid");
    let init = op(&oid, 1, "a", Patch::Initialize { value: json!({}) });
    let newer = set(&oid, 10, "a", "x", json!(1));
    let older = set(&oid, 5, "b", "x", json!(2));

    let forward = merge(&oid, None, &[init.clone(), newer.clone(), older.clone()]);
    let backward = merge(&oid, None, &[older, newer, init]);
    assert_eq!(forward.value(), Some(&json!({"x": 1})));
    assert_eq!(forward, backward);
}

#[test]
fn stores_converge_under_any_delivery_order() {
    let ops = scenario();
    let expected = json!({
        "id": "groceries",
        "owner": "b",
        "items": ["eggs", "milk"],
    });

    let mut orders = vec![ops.clone()];
    let mut reversed = ops.clone();
    reversed.reverse();
    orders.push(reversed);
    let mut interleaved: Vec<Operation> = ops.iter().step_by(2).cloned().collect();
    interleaved.extend(ops.iter().skip(1).step_by(2).cloned());
    orders.push(interleaved);

    for order in orders {
        let store = MemoryStore::new();
        deliver(&store, &order);
        let docs = documents(&store, "lists").expect("documents");
        assert_eq!(docs.len(), 1);
        assert_eq!(docs[0].1, expected);
    }
}

#[test]
fn sqlite_and_memory_agree() {
    let dir = tempfile::tempdir().expect("tempdir");
    let sqlite = SqliteStore::open(&dir.path().join("replica.db")).expect("open");
    let memory = MemoryStore::new();
    let ops = scenario();
    deliver(&sqlite, &ops);
    let mut reversed = ops;
    reversed.reverse();
    deliver(&memory, &reversed);

    assert_eq!(
        documents(&sqlite, "lists").expect("sqlite docs"),
        documents(&memory, "lists").expect("memory docs")
    );
}

#[test]
fn redelivery_is_idempotent() {
    let store = MemoryStore::new();
    let ops = scenario();
    deliver(&store, &ops);
    let once = documents(&store, "lists").expect("documents");
    deliver(&store, &ops);
    assert_eq!(documents(&store, "lists").expect("documents"), once);
    assert_eq!(store.operation_count().expect("count"), ops.len());
}

#[test]
fn oid_range_returns_exactly_the_subtree() {
    let dir = tempfile::tempdir().expect("tempdir");
    let sqlite = SqliteStore::open(&dir.path().join("range.db")).expect("open");
    let memory = MemoryStore::new();

    let parent = create_oid("notes", "a", &[]).expect("oid");
    let child = parent.child("body").expect("child");
    let grandchild = child.child("0").expect("grandchild");
    // Sibling ids sharing a prefix with the parent.
    let sibling = create_oid("notes", "ab", &[]).expect("oid");
    let other = create_oid("notesx", "a", &[]).expect("oid");

    let ops: Vec<Operation> = [&parent, &child, &grandchild, &sibling, &other]
        .into_iter()
        .enumerate()
        .map(|(i, oid)| op(oid, i as u64 + 1, "a", Patch::Initialize { value: json!({}) }))
        .collect();

    for store in [&sqlite as &dyn Storage, &memory] {
        deliver(store, &ops);
        let found: Vec<Oid> = store
            .operations_in(&oid_range(&parent))
            .expect("scan")
            .into_iter()
            .map(|op| op.oid)
            .collect();
        assert_eq!(found, vec![parent.clone(), child.clone(), grandchild.clone()]);

        let collection: Vec<Oid> = store
            .operations_in(&collection_range("notes"))
            .expect("scan")
            .into_iter()
            .map(|op| op.oid)
            .collect();
        assert_eq!(collection.len(), 4, "{collection:?}");
        assert!(!collection.contains(&other));
    }
}

#[test]
fn deleted_root_hides_the_document_but_not_siblings() {
    let store = MemoryStore::new();
    let mut ops = scenario();
    let doc = create_oid("lists", "groceries", &[]).expect("oid");
    let other = create_oid("lists", "hardware", &[]).expect("oid");
    ops.push(op(&other, 2, "b", Patch::Initialize { value: json!({"id": "hardware"}) }));
    ops.push(op(&doc, 20, "b", Patch::Delete));
    deliver(&store, &ops);

    let docs = documents(&store, "lists").expect("documents");
    assert_eq!(docs, vec![(other, json!({"id": "hardware"}))]);
}
