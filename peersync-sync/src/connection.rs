//! Connection handles.
//!
//! A connection is a lightweight handle for a link to one remote device over
//! one transport. Clones share state, so a transition made by the health
//! monitor is visible to every holder.

use crate::device::{DeviceInfo, TransportKind};
use peersync_types::{ConnectionId, DeviceId};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::sync::atomic::{AtomicU8, Ordering};

/// State of a connection.
///
/// `Disconnected → Connecting → Connected → {Disconnected | Failed}`;
/// `Connecting` may also fail directly.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    Failed,
}

impl ConnectionState {
    const fn to_u8(self) -> u8 {
        match self {
            Self::Disconnected => 0,
            Self::Connecting => 1,
            Self::Connected => 2,
            Self::Failed => 3,
        }
    }

    const fn from_u8(value: u8) -> Self {
        match value {
            1 => Self::Connecting,
            2 => Self::Connected,
            3 => Self::Failed,
            _ => Self::Disconnected,
        }
    }

    /// Returns true if a connection in this state may move to `next`.
    #[must_use]
    pub const fn can_transition_to(self, next: Self) -> bool {
        matches!(
            (self, next),
            (Self::Disconnected, Self::Connecting)
                | (Self::Connecting, Self::Connected)
                | (Self::Connecting, Self::Failed)
                | (Self::Connected, Self::Disconnected)
                | (Self::Connected, Self::Failed)
        )
    }
}

/// A handle to a link with a remote device.
#[derive(Clone)]
pub struct P2pConnection {
    connection_id: ConnectionId,
    remote_device: DeviceInfo,
    transport: TransportKind,
    state: Arc<AtomicU8>,
}

impl std::fmt::Debug for P2pConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("P2pConnection")
            .field("connection_id", &self.connection_id)
            .field("remote_device", &self.remote_device.device_id)
            .field("transport", &self.transport)
            .field("state", &self.state())
            .finish()
    }
}

impl P2pConnection {
    /// Creates a handle in the given state.
    #[must_use]
    pub fn new(
        connection_id: ConnectionId,
        remote_device: DeviceInfo,
        transport: TransportKind,
        state: ConnectionState,
    ) -> Self {
        Self {
            connection_id,
            remote_device,
            transport,
            state: Arc::new(AtomicU8::new(state.to_u8())),
        }
    }

    #[must_use]
    pub fn connection_id(&self) -> ConnectionId {
        self.connection_id
    }

    #[must_use]
    pub fn remote_device(&self) -> &DeviceInfo {
        &self.remote_device
    }

    #[must_use]
    pub fn remote_device_id(&self) -> &DeviceId {
        &self.remote_device.device_id
    }

    #[must_use]
    pub fn transport(&self) -> TransportKind {
        self.transport
    }

    #[must_use]
    pub fn state(&self) -> ConnectionState {
        ConnectionState::from_u8(self.state.load(Ordering::SeqCst))
    }

    #[must_use]
    pub fn is_connected(&self) -> bool {
        self.state() == ConnectionState::Connected
    }

    /// Moves to `next` if allowed. Returns false (leaving the state alone)
    /// otherwise.
    pub fn transition(&self, next: ConnectionState) -> bool {
        self.state
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |current| {
                ConnectionState::from_u8(current)
                    .can_transition_to(next)
                    .then_some(next.to_u8())
            })
            .is_ok()
    }
}
