//! Events published by the engine and the orchestrator.

use crate::error::FailureKind;
use crate::state::{SessionState, SyncConflict};
use peersync_types::{DeviceId, SessionId};
use serde::{Deserialize, Serialize};

/// Something observable happened during synchronization.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "camelCase")]
pub enum SyncEvent {
    SessionStarted {
        session_id: SessionId,
        participants: Vec<DeviceId>,
    },
    SessionStateChanged {
        session_id: SessionId,
        state: SessionState,
    },
    OperationsMerged {
        session_id: SessionId,
        from_device: DeviceId,
        merged: usize,
        duplicates: usize,
    },
    ConflictDetected {
        session_id: SessionId,
        conflict: Box<SyncConflict>,
    },
    /// A non-fatal failure; the session (if any) keeps running.
    Error {
        session_id: Option<SessionId>,
        message: String,
        failure: FailureKind,
    },
}

/// A session changed state, as seen by the orchestrator.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionUpdate {
    pub session_id: SessionId,
    pub state: SessionState,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}
