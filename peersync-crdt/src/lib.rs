//! CRDT documents and causality tracking for PeerSync.
//!
//! This crate provides the replication data model:
//!
//! - [`VectorClock`]: per-document causality tracking across devices
//! - [`CrdtOperation`]: the immutable, field-level unit of replication
//! - [`CrdtDocument`]: a sorted operation log with materialized field values
//! - [`ConflictPolicy`]: deterministic resolution of concurrent writes
//!
//! Merging is commutative, associative and idempotent at the document level:
//! a document's materialized state is a pure function of the *set* of
//! operations it holds, so replicas converge regardless of delivery order.

mod document;
mod operation;
mod resolution;
mod vector_clock;

pub use document::CrdtDocument;
pub use operation::{
    CrdtOperation, OperationDraft, OperationType, METADATA_POSITION, METADATA_TARGET,
};
pub use resolution::{causal_order, concurrent_with, happens_before, ConflictKind, ConflictPolicy};
pub use vector_clock::{CausalOrder, VectorClock};

/// Result type for CRDT operations.
pub type CrdtResult<T> = Result<T, CrdtError>;

/// Errors raised while building operations.
#[derive(Debug, thiserror::Error)]
pub enum CrdtError {
    /// The textual operation type is not one of the six known kinds.
    #[error("unknown operation type: {0}")]
    UnknownOperationType(String),

    /// The operation is structurally invalid.
    #[error("invalid operation: {0}")]
    InvalidOperation(String),
}
