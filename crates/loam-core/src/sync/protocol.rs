//! Wire messages exchanged between replicas and a sync hub.
//!
//! Messages are serde enums tagged by `type`. Framing (HTTP, WebSocket,
//! pipes) is left to the transport; [`encode`] and the `decode_*`
//! helpers cover the JSON text form.

use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::SyncError;
use crate::clock::{ReplicaId, Timestamp};
use crate::oid::Oid;
use crate::operation::{Baseline, Operation};
use crate::replica::ReplicaType;

// ---------------------------------------------------------------------------
// Client -> hub
// ---------------------------------------------------------------------------

/// A message sent by a replica.
///
/// Every variant carries the sender's acknowledged watermark. `acked` is
/// only `Some` when the message also delivers every operation the sender
/// authored at or below it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum ClientMessage {
    /// Pull everything after server order `since` and push pending work.
    /// `since: None` asks for the full state.
    Sync {
        replica_id: ReplicaId,
        schema_version: u32,
        #[serde(default)]
        replica_type: ReplicaType,
        since: Option<u64>,
        acked: Option<Timestamp>,
        operations: Vec<Operation>,
    },
    /// Push locally authored operations.
    OperationBatch {
        replica_id: ReplicaId,
        acked: Option<Timestamp>,
        operations: Vec<Operation>,
    },
    Presence {
        replica_id: ReplicaId,
        acked: Option<Timestamp>,
        presence: Value,
    },
    Heartbeat {
        replica_id: ReplicaId,
        acked: Option<Timestamp>,
    },
    /// Advance the sender's watermarks without sending data.
    Ack {
        replica_id: ReplicaId,
        acked: Option<Timestamp>,
        server_order: u64,
    },
}

impl ClientMessage {
    #[must_use]
    pub const fn replica_id(&self) -> &ReplicaId {
        match self {
            Self::Sync { replica_id, .. }
            | Self::OperationBatch { replica_id, .. }
            | Self::Presence { replica_id, .. }
            | Self::Heartbeat { replica_id, .. }
            | Self::Ack { replica_id, .. } => replica_id,
        }
    }

    #[must_use]
    pub const fn acked(&self) -> Option<&Timestamp> {
        match self {
            Self::Sync { acked, .. }
            | Self::OperationBatch { acked, .. }
            | Self::Presence { acked, .. }
            | Self::Heartbeat { acked, .. }
            | Self::Ack { acked, .. } => acked.as_ref(),
        }
    }

    /// Operations carried by the message, if any.
    #[must_use]
    pub fn operations(&self) -> &[Operation] {
        match self {
            Self::Sync { operations, .. } | Self::OperationBatch { operations, .. } => operations,
            _ => &[],
        }
    }

    #[must_use]
    pub const fn kind(&self) -> &'static str {
        match self {
            Self::Sync { .. } => "sync",
            Self::OperationBatch { .. } => "operation-batch",
            Self::Presence { .. } => "presence",
            Self::Heartbeat { .. } => "heartbeat",
            Self::Ack { .. } => "ack",
        }
    }
}

// ---------------------------------------------------------------------------
// Hub -> client
// ---------------------------------------------------------------------------

/// A message sent by the hub.
///
/// `server_order` numbers every batch the hub stored. A replica that sees
/// a gap in the sequence has missed a rebroadcast and must sync again.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum ServerMessage {
    SyncResponse {
        baselines: Vec<Baseline>,
        operations: Vec<Operation>,
        /// History the hub compacted into a tombstone since `since`.
        #[serde(default)]
        purged: Vec<Purge>,
        /// Discard all local state before applying this response.
        overwrite_local: bool,
        global_ack: Option<Timestamp>,
        server_order: u64,
        /// Newest pushed operation the hub took responsibility for.
        accepted_through: Option<Timestamp>,
    },
    /// Confirms an [`ClientMessage::OperationBatch`].
    ///
    /// `server_order` is the order assigned to the operations this push
    /// stored, or `None` when every one of them was already known or
    /// stale. It says nothing about batches other replicas pushed.
    BatchAccepted {
        server_order: Option<u64>,
        accepted_through: Option<Timestamp>,
    },
    OperationRebroadcast {
        origin: ReplicaId,
        operations: Vec<Operation>,
        server_order: u64,
    },
    PresenceChanged {
        replica_id: ReplicaId,
        presence: Value,
    },
    PresenceOffline {
        replica_id: ReplicaId,
    },
    HeartbeatResponse {
        server_order: u64,
    },
    /// Every active replica has seen every operation at or below
    /// `timestamp`, as of `server_order`.
    GlobalAck {
        timestamp: Timestamp,
        server_order: u64,
    },
    Rejected {
        reason: RejectReason,
    },
}

impl ServerMessage {
    #[must_use]
    pub const fn kind(&self) -> &'static str {
        match self {
            Self::SyncResponse { .. } => "sync-response",
            Self::BatchAccepted { .. } => "batch-accepted",
            Self::OperationRebroadcast { .. } => "operation-rebroadcast",
            Self::PresenceChanged { .. } => "presence-changed",
            Self::PresenceOffline { .. } => "presence-offline",
            Self::HeartbeatResponse { .. } => "heartbeat-response",
            Self::GlobalAck { .. } => "global-ack",
            Self::Rejected { .. } => "rejected",
        }
    }
}

/// Tells a replica that the hub dropped every operation of `oid` at or
/// below `through` while compacting a deleted object.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Purge {
    pub oid: Oid,
    pub through: Timestamp,
}

/// Why the hub refused a message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "reason", rename_all = "kebab-case")]
pub enum RejectReason {
    /// The sender runs a newer schema than the hub.
    SchemaTooNew { client: u32, server: u32 },
    /// The sender must migrate before syncing.
    SchemaTooOld { client: u32, server: u32 },
    /// The message could not be decoded, e.g. a malformed timestamp.
    Malformed { detail: String },
    /// An operation failed validation.
    InvalidOperation { oid: String, detail: String },
    /// Read-only replicas cannot push operations.
    ReadOnly,
    /// The sender was truant and fell behind compaction; it must send a
    /// full [`ClientMessage::Sync`] and accept an overwrite.
    ResetRequired,
}

impl fmt::Display for RejectReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::SchemaTooNew { client, server } => {
                write!(f, "schema version {client} is newer than the server's {server}")
            }
            Self::SchemaTooOld { client, server } => {
                write!(f, "schema version {client} is older than the server's {server}")
            }
            Self::Malformed { detail } => write!(f, "malformed message: {detail}"),
            Self::InvalidOperation { oid, detail } => {
                write!(f, "invalid operation on {oid}: {detail}")
            }
            Self::ReadOnly => f.write_str("read-only replicas cannot push operations"),
            Self::ResetRequired => f.write_str("replica must reset before syncing"),
        }
    }
}

// ---------------------------------------------------------------------------
// Codec
// ---------------------------------------------------------------------------

/// Encode a message as a JSON line.
///
/// # Errors
///
/// Returns [`SyncError::Decode`] if serialization fails.
pub fn encode<T: Serialize>(message: &T) -> Result<String, SyncError> {
    Ok(serde_json::to_string(message)?)
}

/// # Errors
///
/// Returns [`SyncError::Decode`] if `raw` is not a valid client message,
/// including operations whose timestamp or OID fails to parse.
pub fn decode_client_message(raw: &str) -> Result<ClientMessage, SyncError> {
    Ok(serde_json::from_str(raw)?)
}

/// # Errors
///
/// Returns [`SyncError::Decode`] if `raw` is not a valid server message.
pub fn decode_server_message(raw: &str) -> Result<ServerMessage, SyncError> {
    Ok(serde_json::from_str(raw)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::oid::create_oid;
    use crate::operation::Patch;
    use serde_json::json;

    fn replica() -> ReplicaId {
        ReplicaId::new("laptop").expect("id")
    }

    #[test]
    fn client_messages_are_tagged() {
        let ts = Timestamp::new(1, 5, 0, &replica()).expect("ts");
        let msg = ClientMessage::OperationBatch {
            replica_id: replica(),
            acked: Some(ts.clone()),
            operations: vec![Operation::new(
                create_oid("todos", "1", &[]).expect("oid"),
                ts,
                Patch::Set {
                    name: "done".into(),
                    value: json!(true),
                },
            )],
        };
        let raw = encode(&msg).expect("encode");
        assert!(raw.contains(r#""type":"operation-batch""#), "{raw}");
        assert_eq!(decode_client_message(&raw).expect("decode"), msg);
        assert_eq!(msg.kind(), "operation-batch");
        assert_eq!(msg.operations().len(), 1);
    }

    #[test]
    fn malformed_timestamp_is_a_decode_error() {
        let raw = r#"{"type":"heartbeat","replica_id":"laptop","acked":"not-a-timestamp"}"#;
        let err = decode_client_message(raw).expect_err("must fail");
        assert!(matches!(err, SyncError::Decode(_)));
    }

    #[test]
    fn sync_defaults_replica_type() {
        let raw = r#"{"type":"sync","replica_id":"laptop","schema_version":2,"since":null,"acked":null,"operations":[]}"#;
        let msg = decode_client_message(raw).expect("decode");
        assert!(matches!(
            msg,
            ClientMessage::Sync {
                replica_type: ReplicaType::Realtime,
                schema_version: 2,
                ..
            }
        ));
    }

    #[test]
    fn reject_reasons_round_trip_with_context() {
        let msg = ServerMessage::Rejected {
            reason: RejectReason::SchemaTooNew {
                client: 4,
                server: 3,
            },
        };
        let raw = encode(&msg).expect("encode");
        assert!(raw.contains(r#""reason":"schema-too-new""#), "{raw}");
        assert_eq!(decode_server_message(&raw).expect("decode"), msg);
        assert_eq!(
            RejectReason::SchemaTooOld {
                client: 1,
                server: 2
            }
            .to_string(),
            "schema version 1 is older than the server's 2"
        );
    }
}
