//! Session, conflict and progress records.

use crate::error::{SyncError, SyncResult};
use crate::protocol::SessionConfiguration;
use chrono::{DateTime, Utc};
use peersync_crdt::{ConflictKind, CrdtOperation};
use peersync_types::{
    ConflictId, DeviceId, DocumentId, HybridTimestamp, OperationId, SessionId,
};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;

/// Lifecycle of a sync session.
///
/// `Initializing → Active → {Completed | Cancelled | Failed}`. Terminal
/// states are final.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum SessionState {
    Initializing,
    Active,
    Completed,
    Cancelled,
    Failed,
}

impl SessionState {
    #[must_use]
    pub const fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Cancelled | Self::Failed)
    }

    /// Returns true if a session in this state may move to `next`.
    #[must_use]
    pub const fn can_transition_to(&self, next: Self) -> bool {
        matches!(
            (self, next),
            (Self::Initializing, Self::Active)
                | (Self::Initializing, Self::Cancelled)
                | (Self::Initializing, Self::Failed)
                | (Self::Active, Self::Completed)
                | (Self::Active, Self::Cancelled)
                | (Self::Active, Self::Failed)
        )
    }

    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Initializing => "initializing",
            Self::Active => "active",
            Self::Completed => "completed",
            Self::Cancelled => "cancelled",
            Self::Failed => "failed",
        }
    }
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Progress of a session, as published on the progress stream.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncProgress {
    pub session_id: SessionId,
    /// Documents known locally when the session started, raised if more
    /// documents are touched during the session.
    pub total_documents: usize,
    pub processed_documents: usize,
    pub operations_merged: usize,
    pub conflicts_detected: usize,
}

impl SyncProgress {
    #[must_use]
    pub fn new(session_id: SessionId, total_documents: usize) -> Self {
        Self {
            session_id,
            total_documents,
            processed_documents: 0,
            operations_merged: 0,
            conflicts_detected: 0,
        }
    }

    /// Fraction of documents processed, in `0.0..=1.0`.
    #[must_use]
    pub fn fraction(&self) -> f64 {
        if self.total_documents == 0 {
            return 0.0;
        }
        (self.processed_documents as f64 / self.total_documents as f64).min(1.0)
    }
}

/// A detected concurrent write, recorded before resolution.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncConflict {
    pub conflict_id: ConflictId,
    pub document_type: String,
    pub document_id: DocumentId,
    pub field_path: String,
    pub kind: ConflictKind,
    pub local_operation: CrdtOperation,
    pub remote_operation: CrdtOperation,
    pub local_modified_at: HybridTimestamp,
    pub remote_modified_at: HybridTimestamp,
    /// The write that determines the field after resolution.
    pub winning_operation_id: OperationId,
    pub detected_at: DateTime<Utc>,
}

impl SyncConflict {
    /// Records a conflict between the locally winning write and an incoming one.
    #[must_use]
    pub fn new(local: &CrdtOperation, remote: &CrdtOperation, winner: OperationId) -> Self {
        Self {
            conflict_id: ConflictId::new(),
            document_type: remote.document_type.clone(),
            document_id: remote.document_id.clone(),
            field_path: remote.field_path.clone(),
            kind: ConflictKind::between(local, remote),
            local_modified_at: local.causal_timestamp.clone(),
            remote_modified_at: remote.causal_timestamp.clone(),
            local_operation: local.clone(),
            remote_operation: remote.clone(),
            winning_operation_id: winner,
            detected_at: Utc::now(),
        }
    }
}

/// A sync exchange between this device and one or more peers.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncSession {
    pub session_id: SessionId,
    /// Device that opened the session.
    pub initiator: DeviceId,
    /// The devices this device exchanges data with in this session.
    pub participants: BTreeSet<DeviceId>,
    pub state: SessionState,
    pub started_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    pub configuration: SessionConfiguration,
    pub progress: SyncProgress,
    pub conflicts: Vec<SyncConflict>,
    /// Participants that acknowledged this device's data.
    pub acknowledged: BTreeSet<DeviceId>,
    /// Participants whose data this device has merged.
    pub received_from: BTreeSet<DeviceId>,
    pub failure_reason: Option<String>,
}

impl SyncSession {
    #[must_use]
    pub fn new(
        session_id: SessionId,
        initiator: DeviceId,
        participants: BTreeSet<DeviceId>,
        configuration: SessionConfiguration,
        total_documents: usize,
    ) -> Self {
        Self {
            session_id,
            initiator,
            participants,
            state: SessionState::Initializing,
            started_at: Utc::now(),
            completed_at: None,
            configuration,
            progress: SyncProgress::new(session_id, total_documents),
            conflicts: Vec::new(),
            acknowledged: BTreeSet::new(),
            received_from: BTreeSet::new(),
            failure_reason: None,
        }
    }

    #[must_use]
    pub fn is_active(&self) -> bool {
        !self.state.is_terminal()
    }

    /// Moves the session to `next`, rejecting transitions out of terminal
    /// states and skipped steps.
    pub fn transition(&mut self, next: SessionState) -> SyncResult<()> {
        if !self.state.can_transition_to(next) {
            return Err(SyncError::InvalidSessionTransition {
                session_id: self.session_id,
                from: self.state,
                to: next,
            });
        }
        self.state = next;
        if next.is_terminal() {
            self.completed_at = Some(Utc::now());
        }
        Ok(())
    }

    /// True once every participant has both acknowledged our data and
    /// delivered theirs.
    #[must_use]
    pub fn exchange_complete(&self) -> bool {
        self.participants
            .iter()
            .all(|p| self.acknowledged.contains(p) && self.received_from.contains(p))
    }
}

/// Read-only aggregate exposed to the presentation layer.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncStatistics {
    pub device_id: Option<DeviceId>,
    pub document_count: usize,
    pub operation_count: usize,
    pub active_sessions: usize,
    pub total_conflicts: usize,
    pub known_peers: usize,
}
