use std::collections::BTreeMap;
use std::sync::Arc;

use loam_core::client::{Client, ClientError};
use loam_core::clock::Timestamp;
use loam_core::config::EngineConfig;
use loam_core::migration::{CollectionSchema, FieldKind, FieldSchema, MigrationCatalog, Schema};
use loam_core::oid::Oid;
use loam_core::store::MemoryStore;
use loam_core::sync::{ClientMessage, ServerMessage};
use loam_core::undo::UndoError;
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use tracing::debug;

use crate::clock::SimulatedClock;
use crate::rng::DeterministicRng;

/// Index of an agent within a run.
pub type AgentId = usize;

/// Storage every simulated replica and the hub run on.
pub type SimStore = Arc<MemoryStore>;

/// The one collection agents edit.
pub const COLLECTION: &str = "todos";

pub const SCHEMA_VERSION: u32 = 1;

#[must_use]
pub fn todo_schema() -> Schema {
    Schema::new(SCHEMA_VERSION).collection(
        COLLECTION,
        CollectionSchema::new("id")
            .field("title", FieldSchema::new(FieldKind::String).nullable())
            .field("done", FieldSchema::new(FieldKind::Boolean).with_default(json!(false)))
            .field("tags", FieldSchema::new(FieldKind::Array).with_default(json!([]))),
    )
}

#[must_use]
pub fn replica_name(id: AgentId) -> String {
    format!("agent-{id}")
}

/// Maps a replica id from a hub delivery back to its agent.
#[must_use]
pub fn agent_for_replica(replica: &str) -> Option<AgentId> {
    replica.strip_prefix("agent-")?.parse().ok()
}

/// A random local edit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Action {
    Create,
    SetTitle,
    ToggleDone,
    PushTag,
    DeleteTag,
    Delete,
    Undo,
}

impl Action {
    fn pick(rng: &mut DeterministicRng, have_documents: bool) -> Self {
        if !have_documents {
            return Self::Create;
        }
        match rng.next_bounded(100) {
            0..25 => Self::Create,
            25..45 => Self::SetTitle,
            45..60 => Self::ToggleDone,
            60..75 => Self::PushTag,
            75..85 => Self::DeleteTag,
            85..92 => Self::Delete,
            _ => Self::Undo,
        }
    }
}

/// A snapshot of one replica after a run, compared by the oracle.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentState {
    pub id: AgentId,
    pub replica: String,
    /// Live documents keyed by OID text.
    pub documents: BTreeMap<String, Value>,
    /// Local operations the hub never confirmed.
    pub pending: usize,
    pub global_ack: Option<Timestamp>,
    /// Timestamps of every operation this replica authored, in authoring
    /// order.
    pub authored: Vec<Timestamp>,
}

/// One replica: a client over its own memory store and drifting clock.
pub struct SimulatedAgent {
    id: AgentId,
    client: Client<SimStore>,
    clock: SimulatedClock,
    created: u64,
    authored: Vec<Timestamp>,
}

impl std::fmt::Debug for SimulatedAgent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SimulatedAgent")
            .field("id", &self.id)
            .field("client", &self.client)
            .field("authored", &self.authored.len())
            .finish_non_exhaustive()
    }
}

impl SimulatedAgent {
    /// # Errors
    ///
    /// Returns the client's error if it fails to open.
    pub fn new(id: AgentId, clock: SimulatedClock, config: &EngineConfig) -> Result<Self, ClientError> {
        let mut config = config.clone();
        config.replica.id = Some(replica_name(id));
        let client = Client::open(
            config,
            todo_schema(),
            &MigrationCatalog::new(),
            Arc::new(MemoryStore::new()),
            clock.handle(),
        )?;
        Ok(Self {
            id,
            client,
            clock,
            created: 0,
            authored: Vec::new(),
        })
    }

    #[must_use]
    pub const fn id(&self) -> AgentId {
        self.id
    }

    #[must_use]
    pub const fn client(&self) -> &Client<SimStore> {
        &self.client
    }

    pub const fn clock_mut(&mut self) -> &mut SimulatedClock {
        &mut self.clock
    }

    /// Perform one random edit. Returns the action if it produced
    /// operations.
    ///
    /// Edits that do not fit the current state (a concurrent delete, an
    /// empty undo stack) are skipped.
    ///
    /// # Errors
    ///
    /// Returns [`ClientError::Store`] if reading local state failed.
    pub fn act(&mut self, rng: &mut DeterministicRng) -> Result<Option<Action>, ClientError> {
        let documents = self.client.list(COLLECTION)?;
        let action = Action::pick(rng, !documents.is_empty());
        let before = self.client.pending().len();

        let target = (!documents.is_empty()).then(|| documents[rng.next_index(documents.len())].clone());
        let applied = match (action, target) {
            (Action::Create, _) => self.create(),
            (Action::SetTitle, Some((oid, _))) => {
                let title = format!("title {}", rng.next_bounded(1_000));
                self.client.set(&oid, "title", json!(title))
            }
            (Action::ToggleDone, Some((oid, doc))) => {
                let done = doc.get("done").and_then(Value::as_bool).unwrap_or(false);
                self.client.set(&oid, "done", json!(!done))
            }
            (Action::PushTag, Some((oid, _))) => self.push_tag(&oid, rng),
            (Action::DeleteTag, Some((oid, doc))) => self.delete_tag(&oid, &doc, rng),
            (Action::Delete, Some((oid, _))) => self.client.delete(&oid),
            (Action::Undo, _) => match self.client.undo() {
                Ok(()) => Ok(()),
                Err(UndoError::Empty) => return Ok(None),
                Err(UndoError::Target(err)) => Err(err),
            },
            (_, None) => return Ok(None),
        };

        if let Err(err) = applied {
            debug!(agent = self.id, ?action, %err, "edit skipped");
            return Ok(None);
        }

        let fresh = &self.client.pending()[before.min(self.client.pending().len())..];
        self.authored.extend(fresh.iter().map(|op| op.timestamp.clone()));
        Ok((!fresh.is_empty()).then_some(action))
    }

    fn create(&mut self) -> Result<(), ClientError> {
        let id = format!("{}-{}", replica_name(self.id), self.created);
        self.created += 1;
        self.client
            .create(COLLECTION, json!({ "id": id, "title": id }))
            .map(|_| ())
    }

    fn push_tag(&mut self, oid: &Oid, rng: &mut DeterministicRng) -> Result<(), ClientError> {
        match self.client.child(oid, "tags")? {
            Some(tags) => self
                .client
                .list_push(&tags, json!(format!("tag-{}", rng.next_bounded(8)))),
            None => Ok(()),
        }
    }

    fn delete_tag(&mut self, oid: &Oid, doc: &Value, rng: &mut DeterministicRng) -> Result<(), ClientError> {
        let len = doc.get("tags").and_then(Value::as_array).map_or(0, Vec::len);
        match self.client.child(oid, "tags")? {
            Some(tags) if len > 0 => self.client.list_delete(&tags, rng.next_index(len), 1),
            _ => Ok(()),
        }
    }

    /// # Errors
    ///
    /// Any error from [`Client::receive`].
    pub fn receive(&mut self, message: ServerMessage) -> Result<Option<ClientMessage>, ClientError> {
        self.client.receive(message)
    }

    /// The message this replica sends on its own initiative this round:
    /// a full sync when it knows it is behind, otherwise any pending work.
    #[must_use]
    pub fn outgoing(&self) -> Option<ClientMessage> {
        if self.client.needs_resync() {
            Some(self.client.sync_request())
        } else {
            self.client.outbound()
        }
    }

    /// # Errors
    ///
    /// Returns [`ClientError::Store`] if listing documents failed.
    pub fn snapshot(&self) -> Result<AgentState, ClientError> {
        let documents = self
            .client
            .list(COLLECTION)?
            .into_iter()
            .map(|(oid, doc)| (oid.to_string(), doc))
            .collect();
        Ok(AgentState {
            id: self.id,
            replica: replica_name(self.id),
            documents,
            pending: self.client.pending().len(),
            global_ack: self.client.global_ack().cloned(),
            authored: self.authored.clone(),
        })
    }
}
