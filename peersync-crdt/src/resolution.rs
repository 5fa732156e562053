//! Concurrency detection and deterministic conflict resolution.
//!
//! Causality between two operations is read from their causal contexts
//! (vector clocks). Operations that arrive without a context fall back to
//! the hybrid timestamp order, under which two writes are only concurrent
//! when their clock components are identical.

use crate::operation::{CrdtOperation, OperationType};
use crate::vector_clock::CausalOrder;
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;

/// How concurrent writes to the same field are resolved.
///
/// Causally ordered writes always resolve to the later write; the policy
/// only decides between writes that are concurrent.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ConflictPolicy {
    /// The write whose origin device id sorts greatest wins.
    #[default]
    HighestDeviceId,
    /// The write with the greatest hybrid timestamp wins.
    LastWriterWins,
}

impl ConflictPolicy {
    /// Orders two concurrent writes; `Greater` means `a` wins.
    #[must_use]
    pub fn compare(&self, a: &CrdtOperation, b: &CrdtOperation) -> Ordering {
        let by_clock = a
            .causal_timestamp
            .cmp(&b.causal_timestamp)
            .then(a.operation_id.cmp(&b.operation_id));
        match self {
            Self::HighestDeviceId => a.origin_device_id.cmp(&b.origin_device_id).then(by_clock),
            Self::LastWriterWins => by_clock,
        }
    }

    /// Picks the surviving write among `writes`.
    ///
    /// Only writes that no other write causally follows are candidates; the
    /// policy chooses among those. The result depends only on the set of
    /// writes, never on the order they were received in.
    pub fn winner<'a, I>(&self, writes: I) -> Option<&'a CrdtOperation>
    where
        I: IntoIterator<Item = &'a CrdtOperation>,
    {
        let writes: Vec<&CrdtOperation> = writes.into_iter().collect();
        writes
            .iter()
            .copied()
            .filter(|candidate| {
                !writes
                    .iter()
                    .any(|other| happens_before(candidate, other))
            })
            .max_by(|a, b| self.compare(a, b))
    }
}

/// Determines the causal relationship between two operations.
#[must_use]
pub fn causal_order(a: &CrdtOperation, b: &CrdtOperation) -> CausalOrder {
    if a.operation_id == b.operation_id {
        return CausalOrder::Equal;
    }
    if !a.causal_context.is_empty() && !b.causal_context.is_empty() {
        return a.causal_context.compare(&b.causal_context);
    }
    match a.causal_timestamp.cmp_clock(&b.causal_timestamp) {
        Ordering::Less => CausalOrder::Before,
        Ordering::Greater => CausalOrder::After,
        Ordering::Equal if a.origin_device_id == b.origin_device_id => {
            // Same device, same clock reading: fall back to the total order.
            if a.causal_timestamp <= b.causal_timestamp {
                CausalOrder::Before
            } else {
                CausalOrder::After
            }
        }
        Ordering::Equal => CausalOrder::Concurrent,
    }
}

/// True if `a` causally precedes `b`.
#[must_use]
pub fn happens_before(a: &CrdtOperation, b: &CrdtOperation) -> bool {
    causal_order(a, b) == CausalOrder::Before
}

/// True if neither operation causally precedes the other.
#[must_use]
pub fn concurrent_with(a: &CrdtOperation, b: &CrdtOperation) -> bool {
    causal_order(a, b) == CausalOrder::Concurrent
}

/// The shape of a detected conflict.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ConflictKind {
    /// Two concurrent `set`s of the same field.
    ConcurrentUpdate,
    /// A `set` concurrent with a `delete` of the same field.
    UpdateDelete,
    /// Two concurrent `delete`s of the same field.
    ConcurrentDelete,
}

impl ConflictKind {
    /// Classifies a conflict between two register writes.
    #[must_use]
    pub fn between(local: &CrdtOperation, remote: &CrdtOperation) -> Self {
        match (local.operation_type, remote.operation_type) {
            (OperationType::Delete, OperationType::Delete) => Self::ConcurrentDelete,
            (OperationType::Delete, _) | (_, OperationType::Delete) => Self::UpdateDelete,
            _ => Self::ConcurrentUpdate,
        }
    }
}
