//! Transport layer abstraction.
//!
//! Every medium (short-range radio, wireless direct, local network) sits
//! behind the same [`Transport`] contract so the orchestrator can fan out
//! discovery and pick whichever medium both devices share.

pub mod loopback;

use crate::connection::{ConnectionState, P2pConnection};
use crate::device::{DeviceInfo, TransportKind};
use crate::error::SyncResult;
use async_trait::async_trait;
use peersync_types::{ConnectionId, DeviceId};
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, mpsc};

/// Bytes received from a remote device.
#[derive(Debug, Clone)]
pub struct IncomingPacket {
    pub transport: TransportKind,
    pub connection_id: ConnectionId,
    pub from_device: DeviceId,
    pub bytes: Vec<u8>,
}

/// A connection changed state.
#[derive(Debug, Clone)]
pub struct ConnectionStateChange {
    pub transport: TransportKind,
    pub connection_id: ConnectionId,
    pub remote_device: DeviceInfo,
    pub state: ConnectionState,
}

/// A medium that can discover devices and exchange packets with them.
#[async_trait]
pub trait Transport: Send + Sync {
    /// The medium this transport runs over.
    fn kind(&self) -> TransportKind;

    /// Whether the medium is currently usable (radio on, network joined).
    async fn is_available(&self) -> bool;

    /// Starts discovery. Discovered devices are streamed until `timeout`
    /// elapses or [`Transport::stop_discovery`] is called.
    async fn start_discovery(&self, timeout: Duration) -> SyncResult<mpsc::Receiver<DeviceInfo>>;

    async fn stop_discovery(&self) -> SyncResult<()>;

    /// Makes `device` discoverable with the given metadata.
    async fn start_advertising(
        &self,
        device: DeviceInfo,
        metadata: HashMap<String, String>,
    ) -> SyncResult<()>;

    async fn stop_advertising(&self) -> SyncResult<()>;

    /// Opens a connection to `device`.
    async fn connect(&self, device: &DeviceInfo) -> SyncResult<P2pConnection>;

    async fn disconnect(&self, connection_id: ConnectionId) -> SyncResult<()>;

    /// Sends one packet over an open connection.
    async fn send(&self, connection_id: ConnectionId, bytes: Vec<u8>) -> SyncResult<()>;

    /// Stream of packets received on any connection of this transport.
    fn subscribe_packets(&self) -> broadcast::Receiver<IncomingPacket>;

    /// Stream of connection state changes on this transport.
    fn subscribe_connection_state(&self) -> broadcast::Receiver<ConnectionStateChange>;
}

/// The transports available to a device, keyed by kind.
#[derive(Clone, Default)]
pub struct TransportRegistry {
    transports: BTreeMap<TransportKind, Arc<dyn Transport>>,
}

impl TransportRegistry {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a transport, replacing any previous one of the same kind.
    pub fn register(&mut self, transport: Arc<dyn Transport>) {
        self.transports.insert(transport.kind(), transport);
    }

    #[must_use]
    pub fn get(&self, kind: TransportKind) -> Option<&Arc<dyn Transport>> {
        self.transports.get(&kind)
    }

    pub fn kinds(&self) -> impl Iterator<Item = TransportKind> + '_ {
        self.transports.keys().copied()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Arc<dyn Transport>> {
        self.transports.values()
    }

    /// Registered transports restricted to `kinds` (all if `None`).
    pub fn select(&self, kinds: Option<&[TransportKind]>) -> Vec<Arc<dyn Transport>> {
        self.transports
            .iter()
            .filter(|(kind, _)| kinds.is_none_or(|kinds| kinds.contains(*kind)))
            .map(|(_, transport)| Arc::clone(transport))
            .collect()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.transports.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.transports.is_empty()
    }
}

impl std::fmt::Debug for TransportRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_list().entries(self.transports.keys()).finish()
    }
}
