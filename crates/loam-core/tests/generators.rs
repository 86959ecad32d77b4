use loam_core::clock::{ReplicaId, Timestamp};
use loam_core::oid::{Oid, create_oid};
use loam_core::operation::{Operation, Patch};
use proptest::prelude::*;
use serde_json::{Value, json};

pub const REPLICAS: [&str; 3] = ["alpha", "beta", "gamma"];

pub fn object_oid() -> Oid {
    create_oid("todos", "1", &[]).expect("oid")
}

pub fn list_oid() -> Oid {
    object_oid().child("tags").expect("child oid")
}

pub fn arb_scalar() -> impl Strategy<Value = Value> + Clone {
    prop_oneof![
        Just(Value::Null),
        any::<bool>().prop_map(Value::Bool),
        (-1_000i64..1_000).prop_map(|n| json!(n)),
        "[a-z]{0,6}".prop_map(Value::String),
    ]
}

pub fn arb_field() -> impl Strategy<Value = String> + Clone {
    prop_oneof![Just("title"), Just("done"), Just("rank")].prop_map(String::from)
}

pub fn arb_object_patch() -> impl Strategy<Value = Patch> + Clone {
    prop_oneof![
        1 => prop::collection::btree_map(arb_field(), arb_scalar(), 0..3)
            .prop_map(|fields| Patch::Initialize { value: json!(fields) }),
        6 => (arb_field(), arb_scalar()).prop_map(|(name, value)| Patch::Set { name, value }),
        2 => arb_field().prop_map(|name| Patch::Remove { name }),
        1 => Just(Patch::Delete),
    ]
}

pub fn arb_list_patch() -> impl Strategy<Value = Patch> + Clone {
    prop_oneof![
        1 => prop::collection::vec(arb_scalar(), 0..4)
            .prop_map(|items| Patch::Initialize { value: Value::Array(items) }),
        3 => arb_scalar().prop_map(|value| Patch::ListPush { value }),
        2 => (0usize..6, arb_scalar()).prop_map(|(index, value)| Patch::ListInsert { index, value }),
        2 => (0usize..6, arb_scalar()).prop_map(|(index, value)| Patch::ListSet { index, value }),
        2 => (0usize..6, 1usize..3).prop_map(|(index, count)| Patch::ListDelete { index, count }),
        2 => (0usize..6, 0usize..6).prop_map(|(from, to)| Patch::ListMove { from, to }),
        1 => Just(Patch::Delete),
    ]
}

/// Timestamps made unique by construction: the counter is the position in
/// the generated history.
fn stamp(index: usize, wall: u64, replica: usize) -> Timestamp {
    let replica = ReplicaId::new(REPLICAS[replica % REPLICAS.len()]).expect("replica id");
    Timestamp::new(1, wall, u32::try_from(index).expect("small index"), &replica).expect("ts")
}

fn history(
    oid: Oid,
    patch: impl Strategy<Value = Patch> + Clone,
    max: usize,
) -> impl Strategy<Value = Vec<Operation>> + Clone {
    prop::collection::vec((patch, 1u64..50, 0usize..REPLICAS.len()), 0..max).prop_map(move |raw| {
        raw.into_iter()
            .enumerate()
            .map(|(i, (patch, wall, replica))| Operation::new(oid.clone(), stamp(i, wall, replica), patch))
            .collect()
    })
}

/// A history of edits on one object OID, starting with an initialize.
pub fn arb_object_history() -> impl Strategy<Value = Vec<Operation>> + Clone {
    history(object_oid(), arb_object_patch(), 24).prop_map(|mut ops| {
        ops.insert(
            0,
            Operation::new(object_oid(), stamp(1_000, 0, 0), Patch::Initialize { value: json!({}) }),
        );
        ops
    })
}

/// A history of edits on one list OID, starting with an initialize.
pub fn arb_list_history() -> impl Strategy<Value = Vec<Operation>> + Clone {
    history(list_oid(), arb_list_patch(), 24).prop_map(|mut ops| {
        ops.insert(
            0,
            Operation::new(list_oid(), stamp(1_000, 0, 0), Patch::Initialize { value: json!([]) }),
        );
        ops
    })
}
