//! Boundary values, empty state and malformed input.

use std::sync::Arc;

use loam_core::authz::{AuthzError, Authorization, MAX_AUTHZ_LEN};
use loam_core::client::{Client, ClientError};
use loam_core::clock::timestamp::{MAX_COUNTER, MAX_VERSION, MAX_WALL_MS};
use loam_core::clock::{HybridClock, ManualWallClock, ReplicaId, Timestamp};
use loam_core::config::EngineConfig;
use loam_core::error::ErrorCode;
use loam_core::merge::{ObjectState, merge, merge_subtree};
use loam_core::migration::{CollectionSchema, FieldKind, FieldSchema, MigrationCatalog, Schema};
use loam_core::oid::{Oid, collection_range, create_oid, decompose_oid, oid_range};
use loam_core::operation::{Operation, Patch};
use loam_core::rebase::{Rebaser, plan_rebase};
use loam_core::store::{MemoryStore, SqliteStore, Storage, documents};
use loam_core::sync::{decode_client_message, decode_server_message, encode};
use loam_core::undo::UndoError;
use serde_json::json;

fn replica(raw: &str) -> ReplicaId {
    ReplicaId::new(raw).expect("replica id")
}

fn ts(wall: u64) -> Timestamp {
    Timestamp::new(1, wall, 0, &replica("a")).expect("ts")
}

fn client() -> Client<MemoryStore> {
    let schema = Schema::new(1).collection(
        "notes",
        CollectionSchema::new("id")
            .field("body", FieldSchema::new(FieldKind::String).nullable())
            .field("lines", FieldSchema::new(FieldKind::Array).with_default(json!([]))),
    );
    let mut config = EngineConfig::default();
    config.replica.id = Some("edge".into());
    Client::open(
        config,
        schema,
        &MigrationCatalog::new(),
        MemoryStore::new(),
        Arc::new(ManualWallClock::new(1_000)),
    )
    .expect("open")
}

fn lines_of(client: &Client<MemoryStore>, note: &Oid) -> Oid {
    client.child(note, "lines").expect("read").expect("lines ref")
}

// ---------------------------------------------------------------------------
// Empty state
// ---------------------------------------------------------------------------

#[test]
fn empty_stores_answer_every_query() {
    let dir = tempfile::tempdir().expect("tempdir");
    let sqlite = SqliteStore::open(&dir.path().join("empty.db")).expect("open");
    let memory = MemoryStore::new();
    let oid = create_oid("notes", "1", &[]).expect("oid");

    for store in [&sqlite as &dyn Storage, &memory] {
        assert!(documents(store, "notes").expect("docs").is_empty());
        assert!(store.operations_in(&oid_range(&oid)).expect("scan").is_empty());
        assert!(store.operations_after(None).expect("after").is_empty());
        assert!(store.all_baselines().expect("baselines").is_empty());
        assert!(store.replicas().expect("replicas").is_empty());
        assert_eq!(store.meta("missing").expect("meta"), None);
        assert_eq!(store.baseline(&oid).expect("baseline"), None);

        let report = Rebaser::default().run(store, &ts(100)).expect("rebase");
        assert_eq!(report.oids_rebased, 0);
    }
}

#[test]
fn merging_nothing_is_absent() {
    let oid = create_oid("notes", "1", &[]).expect("oid");
    let merged = merge(&oid, None, &[]);
    assert_eq!(merged.state, ObjectState::Absent);
    assert_eq!(merged.value(), None);
    assert!(merge_subtree(&oid, &[], &[]).value.is_none());
    assert!(plan_rebase(&oid, None, &[], &ts(5)).is_none());
}

#[test]
fn undo_and_redo_on_a_fresh_client_report_empty() {
    let mut client = client();
    assert!(!client.can_undo());
    assert!(matches!(client.undo(), Err(UndoError::Empty)));
    assert!(matches!(client.redo(), Err(UndoError::Empty)));
    assert_eq!(client.list("notes").expect("list"), Vec::new());
    assert_eq!(client.get("notes", "nope").expect("get"), None);
}

// ---------------------------------------------------------------------------
// List edits at the edges
// ---------------------------------------------------------------------------

#[test]
fn list_set_past_the_end_appends_and_undoes_by_deleting() {
    let mut client = client();
    let note = client
        .create("notes", json!({"id": "1", "lines": [1, 2]}))
        .expect("create");
    let lines = lines_of(&client, &note);

    client.list_set(&lines, 2, json!(3)).expect("set at len");
    assert_eq!(client.read(&lines).expect("read"), Some(json!([1, 2, 3])));
    client.undo().expect("undo");
    assert_eq!(client.read(&lines).expect("read"), Some(json!([1, 2])));
    client.redo().expect("redo");
    assert_eq!(client.read(&lines).expect("read"), Some(json!([1, 2, 3])));

    let err = client.list_set(&lines, 9, json!(0)).expect_err("beyond len");
    assert!(matches!(err, ClientError::InvalidTarget { .. }));
    assert_eq!(err.code(), ErrorCode::InvalidPatch);
}

#[test]
fn list_delete_and_move_clamp_at_the_tail() {
    let mut client = client();
    let note = client
        .create("notes", json!({"id": "1", "lines": ["a", "b", "c"]}))
        .expect("create");
    let lines = lines_of(&client, &note);

    client.list_delete(&lines, 1, 10).expect("count past the end");
    assert_eq!(client.read(&lines).expect("read"), Some(json!(["a"])));
    client.undo().expect("undo");
    assert_eq!(client.read(&lines).expect("read"), Some(json!(["a", "b", "c"])));

    client.list_move(&lines, 0, 99).expect("move to the end");
    assert_eq!(client.read(&lines).expect("read"), Some(json!(["b", "c", "a"])));
    client.undo().expect("undo move");
    assert_eq!(client.read(&lines).expect("read"), Some(json!(["a", "b", "c"])));

    assert!(client.list_delete(&lines, 3, 1).is_err());
    assert!(client.list_move(&lines, 3, 0).is_err());
}

#[test]
fn concurrent_out_of_range_list_edits_are_skipped_by_merge() {
    let oid = create_oid("notes", "1", &["lines"]).expect("oid");
    let ops = vec![
        Operation::new(oid.clone(), ts(1), Patch::Initialize { value: json!(["x"]) }),
        Operation::new(oid.clone(), ts(2), Patch::ListDelete { index: 0, count: 1 }),
        // Authored concurrently against ["x"], lands after the delete.
        Operation::new(oid.clone(), ts(3), Patch::ListSet { index: 0, value: json!("y") }),
        Operation::new(oid.clone(), ts(4), Patch::ListPush { value: json!("z") }),
    ];
    assert_eq!(merge(&oid, None, &ops).value(), Some(&json!(["y", "z"])));

    let late = vec![
        ops[0].clone(),
        Operation::new(oid.clone(), ts(5), Patch::ListSet { index: 7, value: json!("far") }),
        Operation::new(oid.clone(), ts(6), Patch::ListMove { from: 4, to: 0 }),
    ];
    assert_eq!(merge(&oid, None, &late).value(), Some(&json!(["x"])));
}

#[test]
fn edits_after_delete_stay_hidden_until_reinitialized() {
    let oid = create_oid("notes", "1", &[]).expect("oid");
    let mut ops = vec![
        Operation::new(oid.clone(), ts(1), Patch::Initialize { value: json!({"body": "a"}) }),
        Operation::new(oid.clone(), ts(2), Patch::Delete),
        Operation::new(oid.clone(), ts(3), Patch::Set { name: "body".into(), value: json!("b") }),
    ];
    assert!(merge(&oid, None, &ops).is_deleted());

    ops.push(Operation::new(oid.clone(), ts(4), Patch::Initialize { value: json!({}) }));
    ops.push(Operation::new(oid.clone(), ts(5), Patch::Set { name: "body".into(), value: json!("c") }));
    assert_eq!(merge(&oid, None, &ops).value(), Some(&json!({"body": "c"})));
}

// ---------------------------------------------------------------------------
// Timestamps
// ---------------------------------------------------------------------------

#[test]
fn timestamp_bounds_round_trip_and_reject_overflow() {
    let max = Timestamp::new(MAX_VERSION, MAX_WALL_MS, MAX_COUNTER, &replica("z")).expect("max");
    assert_eq!(max.encode(), "999999-9999999999999-999999-z");
    assert_eq!(Timestamp::parse(&max.encode()).expect("parse"), max);

    assert!(Timestamp::new(MAX_VERSION + 1, 0, 0, &replica("z")).is_err());
    assert!(Timestamp::new(1, MAX_WALL_MS + 1, 0, &replica("z")).is_err());
    assert!(Timestamp::new(1, 0, MAX_COUNTER + 1, &replica("z")).is_err());

    let zero = Timestamp::zero(2);
    assert_eq!(zero.encode(), "000002-0000000000000-000000-");
    assert!(zero > Timestamp::new(1, MAX_WALL_MS, MAX_COUNTER, &replica("z")).expect("ts"));
    assert!(zero < Timestamp::new(2, 0, 0, &replica("a")).expect("ts"));
}

#[test]
fn malformed_timestamps_are_rejected() {
    for raw in [
        "",
        "1-2-3-a",
        "000001-0000000000001-000000",
        "000001-000000000000x-000000-a",
        "000001-0000000000001-000001-",
        "000001-0000000000001-000000-bad replica",
        "+00001-0000000000001-000000-a",
    ] {
        let err = Timestamp::parse(raw).expect_err(raw);
        assert_eq!(err.code(), ErrorCode::InvalidTimestamp, "{raw}");
    }
}

#[test]
fn clock_counter_overflow_bumps_the_wall() {
    let wall = ManualWallClock::new(500);
    let mut clock = HybridClock::new(replica("a"), Arc::new(wall));
    let remote = Timestamp::new(1, 500, MAX_COUNTER, &replica("b")).expect("remote");
    clock.update(&remote);
    let next = clock.now(1);
    assert!(next > remote);
    assert_eq!(next.wall_ms(), 501);
    assert_eq!(next.counter(), 0);
}

// ---------------------------------------------------------------------------
// OIDs
// ---------------------------------------------------------------------------

#[test]
fn oids_escape_reserved_characters_and_round_trip() {
    let oid = create_oid("my notes", "a/b#c$d", &["100%", "ünï"]).expect("oid");
    assert_eq!(oid.as_str(), "my%20notes/a%2Fb%23c%24d#100%25#%C3%BCn%C3%AF");
    let parts = decompose_oid(&oid);
    assert_eq!(parts.collection, "my notes");
    assert_eq!(parts.id, "a/b#c$d");
    assert_eq!(parts.path, vec!["100%", "ünï"]);
    assert_eq!(Oid::parse(oid.as_str()).expect("parse"), oid);

    // A key ending in the range sentinel never lands in a sibling's range.
    let plain = create_oid("notes", "a", &[]).expect("oid");
    let dollar = create_oid("notes", "a$", &[]).expect("oid");
    assert!(!oid_range(&plain).contains(&dollar));
    assert!(collection_range("notes").contains(&dollar));
    assert!(!collection_range("note").contains(&plain));
}

#[test]
fn malformed_oids_are_rejected() {
    for raw in ["", "notes", "/1", "notes/", "notes/1#", "notes/a b", "notes/%2", "notes/%zz", "notes/%2f"] {
        let err = Oid::parse(raw).expect_err(raw);
        assert_eq!(err.code(), ErrorCode::InvalidOid, "{raw}");
    }
    assert!(create_oid("notes", "", &[]).is_err());
    assert!(create_oid("notes", "1", &[""]).is_err());
}

// ---------------------------------------------------------------------------
// Authorization and wire input
// ---------------------------------------------------------------------------

#[test]
fn authorization_envelopes_are_checked_not_interpreted() {
    let tag = Authorization::parse("jwt:eyJhbGciOi.payload").expect("valid");
    assert_eq!(tag.scheme(), "jwt");

    assert_eq!(Authorization::parse(""), Err(AuthzError::Empty));
    assert!(matches!(Authorization::parse("public"), Err(AuthzError::MissingScheme(_))));
    assert!(matches!(Authorization::parse("JWT:x"), Err(AuthzError::InvalidScheme(_))));
    assert!(matches!(Authorization::parse("jwt:a b"), Err(AuthzError::InvalidPayload(_))));
    let long = format!("jwt:{}", "x".repeat(MAX_AUTHZ_LEN));
    assert_eq!(Authorization::parse(&long), Err(AuthzError::TooLong));
}

#[test]
fn malformed_wire_messages_fail_to_decode() {
    let good = encode(&loam_core::sync::ClientMessage::Heartbeat {
        replica_id: replica("a"),
        acked: Some(ts(5)),
    })
    .expect("encode");
    assert!(decode_client_message(&good).is_ok());

    let bad_ts = good.replace("000001-0000000000005-000000-a", "yesterday");
    let bad_authz = json!({
        "type": "operation-batch",
        "replica_id": "a",
        "acked": null,
        "operations": [{
            "oid": "notes/1",
            "timestamp": "000001-0000000000005-000000-a",
            "data": {"op": "delete"},
            "authz": "no-scheme",
        }],
    })
    .to_string();
    let bad_oid = bad_authz.replace("notes/1", "notes/a b").replace("\"no-scheme\"", "null");
    let unknown_patch = bad_oid.replace("notes/a b", "notes/1").replace("delete", "explode");

    for raw in [bad_ts.as_str(), &bad_authz, &bad_oid, &unknown_patch, "", "{}", "[1,2]"] {
        let err = decode_client_message(raw).expect_err(raw);
        assert_eq!(err.code(), ErrorCode::SyncRejected, "{raw}");
    }
    assert!(decode_server_message("{\"type\":\"global-ack\"}").is_err());
}
