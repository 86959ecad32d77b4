//! Replica synchronisation.
//!
//! - [`protocol`]: the wire messages and their JSON codec.
//! - [`hub`]: the server core that stores, numbers and fans out batches.
//! - [`transport`]: the transport seam, retry with backoff and
//!   cancellation.

pub mod hub;
pub mod protocol;
pub mod transport;

use crate::error::ErrorCode;
use crate::store::StoreError;

pub use hub::{Delivery, LoopbackTransport, SyncHub};
pub use protocol::{
    ClientMessage, Purge, RejectReason, ServerMessage, decode_client_message, decode_server_message,
    encode,
};
pub use transport::{Backoff, CancelFlag, SyncReport, SyncTransport, sync_with_retry};

#[derive(Debug, thiserror::Error)]
pub enum SyncError {
    #[error("sync rejected: {0}")]
    Rejected(RejectReason),

    #[error("transport failed after {attempts} attempt(s): {last}")]
    Transport { attempts: u32, last: String },

    #[error("sync cancelled")]
    Cancelled,

    #[error("malformed sync message: {0}")]
    Decode(#[from] serde_json::Error),

    #[error(transparent)]
    Store(#[from] StoreError),
}

impl SyncError {
    #[must_use]
    pub const fn code(&self) -> ErrorCode {
        match self {
            Self::Rejected(_) | Self::Decode(_) => ErrorCode::SyncRejected,
            Self::Transport { .. } | Self::Cancelled => ErrorCode::SyncTransport,
            Self::Store(_) => ErrorCode::StorageFailure,
        }
    }

    /// Whether retrying the same exchange later can succeed.
    #[must_use]
    pub const fn is_transient(&self) -> bool {
        matches!(self, Self::Transport { .. } | Self::Store(_))
    }
}
