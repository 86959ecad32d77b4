//! Acknowledgment watermarks, truancy, compaction and migrations working
//! against real stores.

use loam_core::clock::{ReplicaId, Timestamp};
use loam_core::error::ErrorCode;
use loam_core::migration::{
    Migration, MigrationCatalog, MigrationError, MigrationRunner, resolve_path,
};
use loam_core::oid::{Oid, create_oid};
use loam_core::operation::{Operation, Patch};
use loam_core::rebase::{Rebaser, verify_rebase};
use loam_core::replica::{ReplicaEvent, ReplicaInfo, ReplicaRegistry};
use loam_core::store::{
    META_SCHEMA_VERSION, MemoryStore, SqliteStore, Storage, WriteBatch, documents,
};
use serde_json::json;

fn id(raw: &str) -> ReplicaId {
    ReplicaId::new(raw).expect("id")
}

fn ts(wall: u64, replica: &str) -> Timestamp {
    Timestamp::new(1, wall, 0, &id(replica)).expect("ts")
}

fn seed(store: &dyn Storage, ops: &[Operation]) {
    let mut batch = WriteBatch::new();
    for op in ops {
        batch.put_operation(op.clone());
    }
    store.commit(batch).expect("seed");
}

/// One counter document edited at walls 1..=12 by replica `w`.
fn counter_history(oid: &Oid) -> Vec<Operation> {
    let mut ops = vec![Operation::new(
        oid.clone(),
        ts(1, "w"),
        Patch::Initialize {
            value: json!({"id": "c", "n": 0}),
        },
    )];
    for wall in 2..=12 {
        ops.push(Operation::new(oid.clone(), ts(wall, "w"), Patch::Set {
            name: "n".into(),
            value: json!(wall),
        }));
    }
    ops
}

#[test]
fn truant_replica_releases_the_watermark_and_rebase_compacts() {
    let mut registry = ReplicaRegistry::new("lib", 60_000);
    for (name, acked) in [("r5", 5), ("r8", 8), ("r9", 9)] {
        registry.register(ReplicaInfo::new(id(name), "lib", 0));
        registry.acknowledge(&id(name), &ts(acked, "w"));
    }
    assert_eq!(registry.global_ack(), Some(ts(5, "w")));

    assert_eq!(
        registry.mark_truant(&id("r5")),
        Some(ReplicaEvent::Lost { id: id("r5") })
    );
    let cutoff = registry.global_ack().expect("ack");
    assert_eq!(cutoff, ts(8, "w"));

    let store = MemoryStore::new();
    let oid = create_oid("counters", "c", &[]).expect("oid");
    let history = counter_history(&oid);
    seed(&store, &history);

    let report = Rebaser::default().run(&store, &cutoff).expect("rebase");
    assert_eq!(report.oids_rebased, 1);
    assert_eq!(report.operations_compacted, 8);
    assert!(report.failed.is_empty());

    let remaining = store.operations_for(&oid).expect("ops");
    assert!(remaining.iter().all(|op| op.timestamp > cutoff));
    assert_eq!(remaining.len(), 4);
    let baseline = store.baseline(&oid).expect("read").expect("baseline");
    assert_eq!(baseline.timestamp, cutoff);
    assert_eq!(baseline.snapshot, json!({"id": "c", "n": 8}));

    verify_rebase(&oid, &history, Some(&baseline), &remaining).expect("equivalent");
    assert_eq!(
        documents(&store, "counters").expect("docs"),
        vec![(oid, json!({"id": "c", "n": 12}))]
    );
}

#[test]
fn rebase_on_sqlite_survives_reopen() {
    let dir = tempfile::tempdir().expect("tempdir");
    let path = dir.path().join("replica.db");
    let oid = create_oid("counters", "c", &[]).expect("oid");
    {
        let store = SqliteStore::open(&path).expect("open");
        seed(&store, &counter_history(&oid));
        Rebaser::default().run(&store, &ts(12, "w")).expect("rebase");
    }

    let store = SqliteStore::open(&path).expect("reopen");
    assert!(store.operations_for(&oid).expect("ops").is_empty());
    assert_eq!(
        store.baseline(&oid).expect("read").map(|b| b.snapshot),
        Some(json!({"id": "c", "n": 12}))
    );
}

#[test]
fn tombstoned_objects_lose_their_baseline() {
    let store = MemoryStore::new();
    let oid = create_oid("counters", "c", &[]).expect("oid");
    let mut history = counter_history(&oid);
    Rebaser::default().run(&store, &ts(0, "w")).expect("nothing to do");
    seed(&store, &history);
    Rebaser::default().run(&store, &ts(6, "w")).expect("first cycle");
    assert!(store.baseline(&oid).expect("read").is_some());

    history.push(Operation::new(oid.clone(), ts(13, "w"), Patch::Delete));
    seed(&store, &history[history.len() - 1..]);
    let report = Rebaser::default().run(&store, &ts(13, "w")).expect("second cycle");
    assert_eq!(report.baselines_removed, 1);
    assert!(store.baseline(&oid).expect("read").is_none());
    assert_eq!(store.operation_count().expect("count"), 0);
    assert!(documents(&store, "counters").expect("docs").is_empty());
}

#[test]
fn disabled_rebaser_keeps_history() {
    let store = MemoryStore::new();
    let oid = create_oid("counters", "c", &[]).expect("oid");
    seed(&store, &counter_history(&oid));
    let report = Rebaser::new(false).run(&store, &ts(12, "w")).expect("run");
    assert_eq!(report.oids_rebased, 0);
    assert_eq!(store.operation_count().expect("count"), 12);
}

#[test]
fn failed_commit_leaves_the_oid_for_the_next_cycle() {
    let store = MemoryStore::new();
    let failing = create_oid("counters", "c", &[]).expect("oid");
    let healthy = create_oid("counters", "d", &[]).expect("oid");
    seed(&store, &counter_history(&failing));
    seed(&store, &[Operation::new(healthy.clone(), ts(3, "w"), Patch::Initialize {
        value: json!({"id": "d"}),
    })]);

    store.fail_commits_touching(failing.clone()).expect("inject");
    let report = Rebaser::default().run(&store, &ts(12, "w")).expect("run");
    assert_eq!(report.failed, vec![failing.clone()]);
    assert_eq!(report.oids_rebased, 1);
    assert_eq!(store.operations_for(&failing).expect("ops").len(), 12);

    store.clear_failures().expect("clear");
    let retry = Rebaser::default().run(&store, &ts(12, "w")).expect("retry");
    assert_eq!(retry.oids_rebased, 1);
    assert!(store.operations_for(&failing).expect("ops").is_empty());
}

#[test]
fn migration_path_resolves_chains_and_rejects_gaps() {
    let catalog = MigrationCatalog::new()
        .with(Migration::noop(1, 2))
        .with(Migration::noop(2, 3));

    let path: Vec<(u32, u32)> = resolve_path(&catalog, 1, 3)
        .expect("path")
        .iter()
        .map(|m| (m.old_version, m.new_version))
        .collect();
    assert_eq!(path, vec![(1, 2), (2, 3)]);

    let err = resolve_path(&catalog, 1, 4).expect_err("no edge to 4");
    assert!(matches!(err, MigrationError::NoPath { from: 1, to: 4 }));
    assert_eq!(err.code(), ErrorCode::NoMigrationPath);
    assert!(err.code().is_fatal());
}

#[test]
fn migrations_rewrite_documents_on_sqlite() {
    let dir = tempfile::tempdir().expect("tempdir");
    let store = SqliteStore::open(&dir.path().join("migrate.db")).expect("open");
    let catalog = MigrationCatalog::new()
        .with(Migration::new(1, 2, |ctx| {
            ctx.migrate("todos", |_, doc| {
                let mut next = doc.clone();
                let title = next.get("name").cloned()?;
                let map = next.as_object_mut()?;
                map.remove("name");
                map.insert("title".into(), title);
                map.insert("labels".into(), json!(["imported"]));
                Some(next)
            })?;
            Ok(())
        }))
        .with(Migration::new(2, 3, |ctx| {
            ctx.create("todos", "welcome", &json!({"id": "welcome", "title": "hi"}))?;
            Ok(())
        }));

    MigrationRunner::new(&catalog).run(&store, 1, None).expect("stamp fresh store");
    seed(&store, &[Operation::new(
        create_oid("todos", "1", &[]).expect("oid"),
        ts(5, "w"),
        Patch::Initialize {
            value: json!({"id": "1", "name": "milk"}),
        },
    )]);

    let version = MigrationRunner::new(&catalog).run(&store, 3, None).expect("migrate");
    assert_eq!(version, 3);
    assert_eq!(store.meta(META_SCHEMA_VERSION).expect("meta"), Some("3".into()));

    let docs: Vec<serde_json::Value> = documents(&store, "todos")
        .expect("docs")
        .into_iter()
        .map(|(_, doc)| doc)
        .collect();
    assert_eq!(docs, vec![
        json!({"id": "1", "title": "milk", "labels": ["imported"]}),
        json!({"id": "welcome", "title": "hi"}),
    ]);

    // Running again is a no-op.
    assert_eq!(MigrationRunner::new(&catalog).run(&store, 3, None).expect("again"), 3);
}
