#![forbid(unsafe_code)]
//! loam-core library.
//!
//! A replicated document engine: every replica keeps an append-only log of
//! small typed [`operation::Operation`]s addressed by [`oid::Oid`] and
//! ordered by [`clock::Timestamp`]s from a hybrid logical clock. Current
//! state is a deterministic [`merge`] of a compacted baseline and the
//! operations after it, so replicas that hold the same operations agree.
//! Once every replica has acknowledged a prefix of history, the
//! [`rebase`] pass folds it into baselines.
//!
//! [`client::Client`] ties the pieces together for one replica;
//! [`sync::SyncHub`] is the relay replicas exchange operations through.
//!
//! # Conventions
//!
//! - **Errors**: typed `thiserror` enums per module, each with a
//!   [`error::ErrorCode`]. `anyhow::Result` only at configuration loading.
//! - **Logging**: `tracing` macros (`info!`, `warn!`, `debug!`, `trace!`).

pub mod authz;
pub mod client;
pub mod clock;
pub mod config;
pub mod entity;
pub mod error;
pub mod merge;
pub mod migration;
pub mod oid;
pub mod operation;
pub mod rebase;
pub mod replica;
pub mod store;
pub mod sync;
pub mod undo;

pub use client::{Client, ClientError, Transaction};
pub use clock::{ReplicaId, Timestamp};
pub use error::ErrorCode;
pub use oid::Oid;
pub use operation::{Baseline, Operation, Patch};
pub use store::{MemoryStore, SqliteStore, Storage};
