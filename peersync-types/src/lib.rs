//! Core type definitions for PeerSync.
//!
//! This crate defines the fundamental types shared by every layer of the
//! synchronization core:
//! - Device and document identifiers (caller-chosen strings)
//! - Operation, session, connection, chunk and conflict identifiers (UUID v7)
//! - Hybrid Logical Clock timestamps and the clock that issues them
//!
//! Nothing in here performs I/O.

mod ids;
mod timestamp;

pub use ids::{ChunkId, ConflictId, ConnectionId, DeviceId, DocumentId, OperationId, SessionId};
pub use timestamp::{HybridLogicalClock, HybridTimestamp};

/// Result type alias using the crate's error type.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur in type operations.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("invalid UUID: {0}")]
    InvalidUuid(#[from] uuid::Error),

    #[error("invalid identifier: {0}")]
    InvalidIdentifier(String),
}
