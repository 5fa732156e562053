//! CRDT operations: the only atomic unit of replication.
//!
//! An operation is an opaque field-level write tagged with the document it
//! targets. Once stamped by its origin device it is immutable; every replica
//! that receives it stores exactly the same record.

use crate::vector_clock::VectorClock;
use crate::{CrdtError, CrdtResult};
use peersync_types::{DeviceId, DocumentId, HybridTimestamp, OperationId};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

/// Metadata key holding the fractional position of a sequence element.
pub const METADATA_POSITION: &str = "position";

/// Metadata key naming the sequence element a `move`/`delete` targets.
pub const METADATA_TARGET: &str = "target";

/// The kind of write an operation performs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum OperationType {
    Set,
    Insert,
    Delete,
    Move,
    Increment,
    Decrement,
}

impl OperationType {
    /// Returns the wire name of the operation type.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Set => "set",
            Self::Insert => "insert",
            Self::Delete => "delete",
            Self::Move => "move",
            Self::Increment => "increment",
            Self::Decrement => "decrement",
        }
    }
}

impl fmt::Display for OperationType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for OperationType {
    type Err = CrdtError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "set" => Ok(Self::Set),
            "insert" => Ok(Self::Insert),
            "delete" => Ok(Self::Delete),
            "move" => Ok(Self::Move),
            "increment" => Ok(Self::Increment),
            "decrement" => Ok(Self::Decrement),
            other => Err(CrdtError::UnknownOperationType(other.to_string())),
        }
    }
}

/// A stamped, immutable CRDT operation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CrdtOperation {
    pub operation_id: OperationId,
    pub document_id: DocumentId,
    pub document_type: String,
    pub operation_type: OperationType,
    /// Field addressed by the write. Empty addresses the document itself.
    #[serde(default)]
    pub field_path: String,
    #[serde(default)]
    pub value: Value,
    #[serde(default)]
    pub previous_value: Value,
    #[serde(rename = "deviceId")]
    pub origin_device_id: DeviceId,
    #[serde(rename = "timestamp")]
    pub causal_timestamp: HybridTimestamp,
    #[serde(default)]
    pub metadata: BTreeMap<String, Value>,
    /// The document's vector clock as seen by the origin right after this write.
    #[serde(default, skip_serializing_if = "VectorClock::is_empty")]
    pub causal_context: VectorClock,
}

impl CrdtOperation {
    /// Stamps a draft with its identity and causality information.
    #[must_use]
    pub fn from_draft(
        draft: OperationDraft,
        origin_device_id: DeviceId,
        causal_timestamp: HybridTimestamp,
        causal_context: VectorClock,
    ) -> Self {
        Self {
            operation_id: OperationId::new(),
            document_id: draft.document_id,
            document_type: draft.document_type,
            operation_type: draft.operation_type,
            field_path: draft.field_path,
            value: draft.value,
            previous_value: draft.previous_value,
            origin_device_id,
            causal_timestamp,
            metadata: draft.metadata,
            causal_context,
        }
    }

    /// True for writes that replace a field's value (`set`, field `delete`).
    #[must_use]
    pub fn is_register_write(&self) -> bool {
        match self.operation_type {
            OperationType::Set => true,
            OperationType::Delete => self.target().is_none(),
            _ => false,
        }
    }

    /// True for `increment`/`decrement`.
    #[must_use]
    pub fn is_counter(&self) -> bool {
        matches!(
            self.operation_type,
            OperationType::Increment | OperationType::Decrement
        )
    }

    /// The value this write leaves in a register, `None` for a tombstone.
    #[must_use]
    pub fn register_value(&self) -> Option<Value> {
        match self.operation_type {
            OperationType::Set => Some(self.value.clone()),
            _ => None,
        }
    }

    /// The sequence element this operation targets, if any.
    #[must_use]
    pub fn target(&self) -> Option<&str> {
        self.metadata.get(METADATA_TARGET).and_then(Value::as_str)
    }

    /// The fractional position carried in metadata, if any.
    #[must_use]
    pub fn position(&self) -> Option<f64> {
        self.metadata.get(METADATA_POSITION).and_then(Value::as_f64)
    }
}

/// An unstamped local change, as handed over by the domain layer.
#[derive(Debug, Clone, PartialEq)]
pub struct OperationDraft {
    pub document_id: DocumentId,
    pub document_type: String,
    pub operation_type: OperationType,
    pub field_path: String,
    pub value: Value,
    pub previous_value: Value,
    pub metadata: BTreeMap<String, Value>,
}

impl OperationDraft {
    /// Creates a draft of any operation type.
    pub fn new(
        document_id: impl Into<DocumentId>,
        document_type: impl Into<String>,
        operation_type: OperationType,
        field_path: impl Into<String>,
        value: Value,
    ) -> Self {
        Self {
            document_id: document_id.into(),
            document_type: document_type.into(),
            operation_type,
            field_path: field_path.into(),
            value,
            previous_value: Value::Null,
            metadata: BTreeMap::new(),
        }
    }

    /// Creates a draft from a textual operation type, as received across an
    /// untyped boundary.
    pub fn from_parts(
        document_id: impl Into<DocumentId>,
        document_type: impl Into<String>,
        operation_type: &str,
        field_path: impl Into<String>,
        value: Value,
    ) -> CrdtResult<Self> {
        let operation_type = operation_type.parse()?;
        Ok(Self::new(
            document_id,
            document_type,
            operation_type,
            field_path,
            value,
        ))
    }

    /// `set(document, field, value)`: the domain layer's per-column write.
    pub fn set(
        document_id: impl Into<DocumentId>,
        document_type: impl Into<String>,
        field_path: impl Into<String>,
        value: Value,
    ) -> Self {
        Self::new(document_id, document_type, OperationType::Set, field_path, value)
    }

    /// Removes a field's value.
    pub fn delete_field(
        document_id: impl Into<DocumentId>,
        document_type: impl Into<String>,
        field_path: impl Into<String>,
    ) -> Self {
        Self::new(
            document_id,
            document_type,
            OperationType::Delete,
            field_path,
            Value::Null,
        )
    }

    /// Tombstones the whole document.
    pub fn delete_document(
        document_id: impl Into<DocumentId>,
        document_type: impl Into<String>,
    ) -> Self {
        Self::delete_field(document_id, document_type, "")
    }

    /// Adds `amount` to a numeric field.
    pub fn increment(
        document_id: impl Into<DocumentId>,
        document_type: impl Into<String>,
        field_path: impl Into<String>,
        amount: Value,
    ) -> Self {
        Self::new(
            document_id,
            document_type,
            OperationType::Increment,
            field_path,
            amount,
        )
    }

    /// Subtracts `amount` from a numeric field.
    pub fn decrement(
        document_id: impl Into<DocumentId>,
        document_type: impl Into<String>,
        field_path: impl Into<String>,
        amount: Value,
    ) -> Self {
        Self::new(
            document_id,
            document_type,
            OperationType::Decrement,
            field_path,
            amount,
        )
    }

    /// Inserts an element into a sequence field at a fractional position.
    pub fn insert(
        document_id: impl Into<DocumentId>,
        document_type: impl Into<String>,
        field_path: impl Into<String>,
        value: Value,
        position: f64,
    ) -> Self {
        Self::new(
            document_id,
            document_type,
            OperationType::Insert,
            field_path,
            value,
        )
        .with_metadata(METADATA_POSITION, Value::from(position))
    }

    /// Moves a previously inserted element to a new position.
    pub fn move_element(
        document_id: impl Into<DocumentId>,
        document_type: impl Into<String>,
        field_path: impl Into<String>,
        target: OperationId,
        position: f64,
    ) -> Self {
        Self::new(
            document_id,
            document_type,
            OperationType::Move,
            field_path,
            Value::Null,
        )
        .with_metadata(METADATA_TARGET, Value::from(target.to_string()))
        .with_metadata(METADATA_POSITION, Value::from(position))
    }

    /// Removes a previously inserted element from a sequence field.
    pub fn remove_element(
        document_id: impl Into<DocumentId>,
        document_type: impl Into<String>,
        field_path: impl Into<String>,
        target: OperationId,
    ) -> Self {
        Self::new(
            document_id,
            document_type,
            OperationType::Delete,
            field_path,
            Value::Null,
        )
        .with_metadata(METADATA_TARGET, Value::from(target.to_string()))
    }

    /// Records the value the field held before this change.
    pub fn with_previous_value(mut self, previous: Value) -> Self {
        self.previous_value = previous;
        self
    }

    /// Attaches a metadata entry.
    pub fn with_metadata(mut self, key: impl Into<String>, value: Value) -> Self {
        self.metadata.insert(key.into(), value);
        self
    }

    /// Checks the structural invariants the engine relies on.
    pub fn validate(&self) -> CrdtResult<()> {
        if self.document_id.is_empty() {
            return Err(CrdtError::InvalidOperation(
                "document id must not be empty".to_string(),
            ));
        }
        match self.operation_type {
            OperationType::Move if !self.metadata.contains_key(METADATA_TARGET) => {
                Err(CrdtError::InvalidOperation(
                    "move requires a target element".to_string(),
                ))
            }
            OperationType::Increment | OperationType::Decrement
                if !(self.value.is_null() || self.value.is_number()) =>
            {
                Err(CrdtError::InvalidOperation(format!(
                    "{} amount must be numeric",
                    self.operation_type
                )))
            }
            _ => Ok(()),
        }
    }
}
