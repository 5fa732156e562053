//! Replicated documents.
//!
//! A document is an operation log kept sorted by causal timestamp, plus a
//! vector clock summarizing which writes from each device it has seen.
//! Field values are never stored directly; they are materialized from the
//! log on read, which is what makes the merge order-independent.

use crate::operation::{CrdtOperation, OperationType};
use crate::resolution::{concurrent_with, happens_before, ConflictPolicy};
use crate::vector_clock::VectorClock;
use peersync_types::{DeviceId, DocumentId, HybridTimestamp, OperationId};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Number, Value};
use std::cmp::Ordering;
use std::collections::HashSet;

/// A replicated document owned by the sync engine.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CrdtDocument {
    document_id: DocumentId,
    document_type: String,
    operations: Vec<CrdtOperation>,
    vector_clock: VectorClock,
    last_modified: Option<HybridTimestamp>,
    #[serde(skip)]
    known_ids: HashSet<OperationId>,
}

impl CrdtDocument {
    /// Creates an empty document.
    #[must_use]
    pub fn new(document_id: DocumentId, document_type: impl Into<String>) -> Self {
        Self {
            document_id,
            document_type: document_type.into(),
            operations: Vec::new(),
            vector_clock: VectorClock::new(),
            last_modified: None,
            known_ids: HashSet::new(),
        }
    }

    #[must_use]
    pub fn document_id(&self) -> &DocumentId {
        &self.document_id
    }

    #[must_use]
    pub fn document_type(&self) -> &str {
        &self.document_type
    }

    /// The operation log, sorted by causal timestamp (ties by device).
    #[must_use]
    pub fn operations(&self) -> &[CrdtOperation] {
        &self.operations
    }

    #[must_use]
    pub fn vector_clock(&self) -> &VectorClock {
        &self.vector_clock
    }

    #[must_use]
    pub fn last_modified(&self) -> Option<&HybridTimestamp> {
        self.last_modified.as_ref()
    }

    /// Number of operations in the log.
    #[must_use]
    pub fn len(&self) -> usize {
        self.operations.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.operations.is_empty()
    }

    /// Returns true if the log already holds this operation.
    #[must_use]
    pub fn contains(&self, operation_id: &OperationId) -> bool {
        self.known_ids.contains(operation_id)
            || self.operations.iter().any(|op| op.operation_id == *operation_id)
    }

    /// Ticks the local device's entry and returns the resulting clock,
    /// to be attached to the write being created.
    pub fn advance_local_clock(&mut self, device_id: &DeviceId) -> VectorClock {
        self.vector_clock.tick_node(device_id);
        self.vector_clock.clone()
    }

    /// Adds an operation to the log.
    ///
    /// Returns false (and changes nothing) if the operation is already known.
    /// Otherwise the operation is inserted at its sorted position, the vector
    /// clock absorbs the operation's causal context and `last_modified`
    /// becomes `observed_at`.
    pub fn apply_operation(&mut self, operation: CrdtOperation, observed_at: HybridTimestamp) -> bool {
        if self.contains(&operation.operation_id) {
            return false;
        }

        if operation.causal_context.is_empty() {
            self.vector_clock.tick_node(&operation.origin_device_id);
        } else {
            self.vector_clock.merge(&operation.causal_context);
        }

        let index = self
            .operations
            .partition_point(|existing| log_order(existing, &operation) == Ordering::Less);
        self.known_ids.insert(operation.operation_id);
        self.operations.insert(index, operation);

        if self
            .last_modified
            .as_ref()
            .is_none_or(|current| observed_at > *current)
        {
            self.last_modified = Some(observed_at);
        }
        true
    }

    /// Operations addressing `field_path`, in log order.
    pub fn operations_for_field<'a>(
        &'a self,
        field_path: &str,
    ) -> impl Iterator<Item = &'a CrdtOperation> {
        self.operations
            .iter()
            .filter(move |op| op.field_path == field_path)
    }

    /// Operations whose causal timestamp is after `since` (all if `None`).
    pub fn operations_since(
        &self,
        since: Option<&HybridTimestamp>,
    ) -> impl Iterator<Item = &CrdtOperation> {
        let start = since.map_or(0, |since| {
            self.operations
                .partition_point(|op| op.causal_timestamp <= *since)
        });
        self.operations[start..].iter()
    }

    /// The register write currently determining `field_path`'s value.
    #[must_use]
    pub fn current_writer(&self, field_path: &str, policy: ConflictPolicy) -> Option<&CrdtOperation> {
        policy.winner(
            self.operations_for_field(field_path)
                .filter(|op| op.is_register_write()),
        )
    }

    /// Returns the write that `incoming` conflicts with, if any.
    ///
    /// A conflict exists when `incoming` is a register write and the write
    /// currently determining the field is concurrent with it.
    #[must_use]
    pub fn detect_conflict(
        &self,
        incoming: &CrdtOperation,
        policy: ConflictPolicy,
    ) -> Option<&CrdtOperation> {
        if !incoming.is_register_write() {
            return None;
        }
        self.current_writer(&incoming.field_path, policy)
            .filter(|current| concurrent_with(current, incoming))
    }

    /// True if the document carries a winning document-level tombstone.
    #[must_use]
    pub fn is_deleted(&self, policy: ConflictPolicy) -> bool {
        self.current_writer("", policy)
            .is_some_and(|op| op.operation_type == OperationType::Delete)
    }

    /// Materializes the current value of a field.
    ///
    /// Returns `None` for fields never written or whose winning write is a
    /// tombstone.
    #[must_use]
    pub fn field_value(&self, field_path: &str, policy: ConflictPolicy) -> Option<Value> {
        let ops: Vec<&CrdtOperation> = self.operations_for_field(field_path).collect();
        if ops.is_empty() {
            return None;
        }
        if ops.iter().any(|op| op.operation_type == OperationType::Insert) {
            return Some(sequence_value(&ops));
        }

        let register = policy.winner(ops.iter().copied().filter(|op| op.is_register_write()));
        let counters: Vec<&CrdtOperation> = ops
            .iter()
            .copied()
            .filter(|op| op.is_counter())
            .filter(|op| register.is_none_or(|writer| !happens_before(op, writer)))
            .collect();

        if counters.is_empty() {
            return register.and_then(CrdtOperation::register_value);
        }
        let base = register.and_then(CrdtOperation::register_value);
        Some(counter_value(base.as_ref(), &counters))
    }

    /// Materializes every field (except the document-level path) into a map.
    #[must_use]
    pub fn snapshot(&self, policy: ConflictPolicy) -> Map<String, Value> {
        let mut fields: Vec<&str> = self
            .operations
            .iter()
            .map(|op| op.field_path.as_str())
            .filter(|path| !path.is_empty())
            .collect();
        fields.sort_unstable();
        fields.dedup();

        fields
            .into_iter()
            .filter_map(|path| self.field_value(path, policy).map(|v| (path.to_string(), v)))
            .collect()
    }
}

fn log_order(a: &CrdtOperation, b: &CrdtOperation) -> Ordering {
    a.causal_timestamp
        .cmp(&b.causal_timestamp)
        .then(a.operation_id.cmp(&b.operation_id))
}

fn counter_value(base: Option<&Value>, counters: &[&CrdtOperation]) -> Value {
    fn delta(op: &CrdtOperation) -> Value {
        if op.value.is_null() { Value::from(1) } else { op.value.clone() }
    }
    fn sign(op: &CrdtOperation) -> i64 {
        if op.operation_type == OperationType::Decrement { -1 } else { 1 }
    }

    let base = base.cloned().unwrap_or_else(|| Value::from(0));
    let all_integral = base.as_i64().is_some()
        && counters.iter().copied().all(|op| delta(op).as_i64().is_some());

    if all_integral {
        let total = counters
            .iter()
            .copied()
            .fold(base.as_i64().unwrap_or(0), |acc, op| {
                acc.saturating_add(sign(op).saturating_mul(delta(op).as_i64().unwrap_or(0)))
            });
        Value::from(total)
    } else {
        let total = counters
            .iter()
            .copied()
            .fold(base.as_f64().unwrap_or(0.0), |acc, op| {
                acc + sign(op) as f64 * delta(op).as_f64().unwrap_or(0.0)
            });
        Number::from_f64(total).map_or(Value::Null, Value::Number)
    }
}

fn sequence_value(ops: &[&CrdtOperation]) -> Value {
    let targeting = |kind: OperationType, id: &str| -> Vec<&CrdtOperation> {
        ops.iter()
            .copied()
            .filter(|op| op.operation_type == kind && op.target() == Some(id))
            .collect()
    };

    let mut elements: Vec<(f64, &CrdtOperation)> = ops
        .iter()
        .copied()
        .filter(|op| op.operation_type == OperationType::Insert)
        .filter_map(|insert| {
            let id = insert.operation_id.to_string();
            if !targeting(OperationType::Delete, &id).is_empty() {
                return None;
            }
            let position = targeting(OperationType::Move, &id)
                .into_iter()
                .max_by(|a, b| log_order(a, b))
                .and_then(CrdtOperation::position)
                .or_else(|| insert.position())
                .unwrap_or(insert.causal_timestamp.wall_clock_millis() as f64);
            Some((position, insert))
        })
        .collect();

    elements.sort_by(|(pa, a), (pb, b)| pa.total_cmp(pb).then_with(|| log_order(a, b)));
    Value::Array(elements.into_iter().map(|(_, op)| op.value.clone()).collect())
}
