#![no_main]

use libfuzzer_sys::fuzz_target;

use loam_core::clock::{ReplicaId, Timestamp};
use loam_core::merge::merge;
use loam_core::oid::create_oid;
use loam_core::operation::{Operation, Patch};

// Arrival order never changes the merged value.
fuzz_target!(|data: &[u8]| {
    let Ok(patches) = serde_json::from_slice::<Vec<Patch>>(data) else {
        return;
    };
    let Ok(oid) = create_oid("fuzz", "doc", &[]) else {
        return;
    };
    let Ok(replica) = ReplicaId::new("fuzz") else {
        return;
    };
    let ops: Vec<Operation> = patches
        .into_iter()
        .enumerate()
        .filter_map(|(i, patch)| {
            let ts = Timestamp::new(1, 1 + i as u64, 0, &replica).ok()?;
            Some(Operation::new(oid.clone(), ts, patch))
        })
        .collect();

    let forward = merge(&oid, None, &ops);
    let mut reversed = ops.clone();
    reversed.reverse();
    let backward = merge(&oid, None, &reversed);
    assert_eq!(forward.value(), backward.value());
});
