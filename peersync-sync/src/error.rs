//! Error types for the sync layer.

use crate::state::SessionState;
use peersync_types::{DeviceId, SessionId};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Result type for sync operations.
pub type SyncResult<T> = Result<T, SyncError>;

/// Errors that can occur in sync operations.
#[derive(Debug, Error)]
pub enum SyncError {
    /// No transport able to reach the device is available.
    #[error("transport unavailable: {0}")]
    TransportUnavailable(String),

    /// The device has not completed pairing with this device.
    #[error("device not paired: {0}")]
    DeviceNotPaired(DeviceId),

    /// The device has no live connection.
    #[error("device not connected: {0}")]
    DeviceNotConnected(DeviceId),

    /// No session with this id is known.
    #[error("session not found: {0}")]
    SessionNotFound(SessionId),

    /// The session already reached a terminal state.
    #[error("session {session_id} is already {state}")]
    SessionClosed {
        session_id: SessionId,
        state: SessionState,
    },

    /// A payload could not be decrypted (missing metadata, wrong key, tampering).
    #[error("decryption failed: {0}")]
    DecryptionFailure(String),

    /// A payload did not contain a valid operation list.
    #[error("failed to parse operations: {0}")]
    OperationParseFailure(String),

    /// The engine was used before `initialize`.
    #[error("sync engine not initialized")]
    NotInitialized,

    /// `initialize` was called twice.
    #[error("sync engine already initialized")]
    AlreadyInitialized,

    /// A local change was rejected.
    #[error("invalid operation: {0}")]
    InvalidOperation(String),

    /// A session was asked to move to a state it cannot reach.
    #[error("session {session_id} cannot move from {from} to {to}")]
    InvalidSessionTransition {
        session_id: SessionId,
        from: SessionState,
        to: SessionState,
    },

    /// Pairing failed.
    #[error("pairing error: {0}")]
    Pairing(String),

    /// Transport-level failure.
    #[error("network error: {0}")]
    Network(String),

    /// Compressing or decompressing a payload failed.
    #[error("compression error: {0}")]
    Compression(String),

    /// Serialization error.
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Trust store I/O failed.
    #[error("storage error: {0}")]
    Storage(#[from] std::io::Error),

    /// Channel closed.
    #[error("channel closed")]
    ChannelClosed,
}

impl SyncError {
    /// Classifies the error for reporting on the event stream.
    #[must_use]
    pub fn failure_kind(&self) -> FailureKind {
        match self {
            Self::DecryptionFailure(_) => FailureKind::Decryption,
            Self::Compression(_) => FailureKind::Decompression,
            Self::OperationParseFailure(_) | Self::Serialization(_) => FailureKind::Parse,
            Self::TransportUnavailable(_)
            | Self::DeviceNotConnected(_)
            | Self::Network(_)
            | Self::ChannelClosed => FailureKind::Transport,
            Self::DeviceNotPaired(_) | Self::Pairing(_) => FailureKind::Trust,
            _ => FailureKind::Other,
        }
    }
}

impl From<peersync_crdt::CrdtError> for SyncError {
    fn from(err: peersync_crdt::CrdtError) -> Self {
        Self::InvalidOperation(err.to_string())
    }
}

impl From<peersync_types::Error> for SyncError {
    fn from(err: peersync_types::Error) -> Self {
        Self::InvalidOperation(err.to_string())
    }
}

/// Category of a failure reported through `SyncEvent::Error`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum FailureKind {
    Decryption,
    Decompression,
    Parse,
    Transport,
    Trust,
    Other,
}
