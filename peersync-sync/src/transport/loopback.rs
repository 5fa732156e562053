//! In-memory transport for tests and simulations.
//!
//! A [`LoopbackNetwork`] is a shared medium; each device attaches one
//! [`LoopbackTransport`] per transport kind. Advertising, discovery,
//! connections and packet delivery behave like a real medium that never
//! loses or reorders packets, and availability can be toggled to simulate
//! a radio being switched off.

use crate::connection::{ConnectionState, P2pConnection};
use crate::device::{DeviceInfo, TransportKind};
use crate::error::{SyncError, SyncResult};
use crate::transport::{ConnectionStateChange, IncomingPacket, Transport};
use async_trait::async_trait;
use peersync_types::{ConnectionId, DeviceId};
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio::sync::{Mutex, broadcast, mpsc};
use tracing::debug;

const CHANNEL_CAPACITY: usize = 256;
const DISCOVERY_CAPACITY: usize = 32;

type EndpointKey = (TransportKind, DeviceId);

struct Endpoint {
    device: DeviceInfo,
    packets: broadcast::Sender<IncomingPacket>,
    states: broadcast::Sender<ConnectionStateChange>,
    available: Arc<AtomicBool>,
}

struct Link {
    kind: TransportKind,
    a: DeviceId,
    b: DeviceId,
}

impl Link {
    fn peer_of(&self, device: &DeviceId) -> Option<&DeviceId> {
        if *device == self.a {
            Some(&self.b)
        } else if *device == self.b {
            Some(&self.a)
        } else {
            None
        }
    }
}

#[derive(Default)]
struct Medium {
    endpoints: HashMap<EndpointKey, Endpoint>,
    advertised: HashMap<EndpointKey, DeviceInfo>,
    discoverers: HashMap<EndpointKey, mpsc::Sender<DeviceInfo>>,
    links: HashMap<ConnectionId, Link>,
}

/// A shared in-memory medium.
#[derive(Default)]
pub struct LoopbackNetwork {
    medium: Mutex<Medium>,
}

impl LoopbackNetwork {
    #[must_use]
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Attaches `device` to the medium over `kind`.
    pub async fn attach(self: &Arc<Self>, kind: TransportKind, device: DeviceInfo) -> Arc<LoopbackTransport> {
        let (packets, _) = broadcast::channel(CHANNEL_CAPACITY);
        let (states, _) = broadcast::channel(CHANNEL_CAPACITY);
        let available = Arc::new(AtomicBool::new(true));

        let endpoint = Endpoint {
            device: device.clone(),
            packets: packets.clone(),
            states: states.clone(),
            available: Arc::clone(&available),
        };
        self.medium
            .lock()
            .await
            .endpoints
            .insert((kind, device.device_id.clone()), endpoint);

        Arc::new(LoopbackTransport {
            network: Arc::clone(self),
            kind,
            local: device,
            packets,
            states,
            available,
        })
    }

    /// Number of open links on the medium.
    pub async fn link_count(&self) -> usize {
        self.medium.lock().await.links.len()
    }
}

/// One device's view of a [`LoopbackNetwork`] for one transport kind.
pub struct LoopbackTransport {
    network: Arc<LoopbackNetwork>,
    kind: TransportKind,
    local: DeviceInfo,
    packets: broadcast::Sender<IncomingPacket>,
    states: broadcast::Sender<ConnectionStateChange>,
    available: Arc<AtomicBool>,
}

impl LoopbackTransport {
    /// Simulates the medium being switched on or off.
    pub fn set_available(&self, available: bool) {
        self.available.store(available, Ordering::SeqCst);
    }

    fn key(&self) -> EndpointKey {
        (self.kind, self.local.device_id.clone())
    }

    fn ensure_available(&self) -> SyncResult<()> {
        if self.available.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(SyncError::TransportUnavailable(format!(
                "{} is switched off",
                self.kind
            )))
        }
    }
}

#[async_trait]
impl Transport for LoopbackTransport {
    fn kind(&self) -> TransportKind {
        self.kind
    }

    async fn is_available(&self) -> bool {
        self.available.load(Ordering::SeqCst)
    }

    async fn start_discovery(&self, timeout: Duration) -> SyncResult<mpsc::Receiver<DeviceInfo>> {
        self.ensure_available()?;
        let (tx, rx) = mpsc::channel(DISCOVERY_CAPACITY);

        let mut medium = self.network.medium.lock().await;
        for ((kind, device_id), info) in &medium.advertised {
            if *kind == self.kind && *device_id != self.local.device_id {
                // A full buffer only drops the duplicate announcement.
                let _ = tx.try_send(info.clone());
            }
        }
        let weak = tx.downgrade();
        medium.discoverers.insert(self.key(), tx);
        drop(medium);

        let network = Arc::clone(&self.network);
        let key = self.key();
        tokio::spawn(async move {
            tokio::time::sleep(timeout).await;
            let Some(tx) = weak.upgrade() else {
                return;
            };
            let mut medium = network.medium.lock().await;
            if medium
                .discoverers
                .get(&key)
                .is_some_and(|current| current.same_channel(&tx))
            {
                medium.discoverers.remove(&key);
            }
        });

        debug!("{}: discovery started on {}", self.local.device_id, self.kind);
        Ok(rx)
    }

    async fn stop_discovery(&self) -> SyncResult<()> {
        self.network.medium.lock().await.discoverers.remove(&self.key());
        Ok(())
    }

    async fn start_advertising(
        &self,
        device: DeviceInfo,
        metadata: HashMap<String, String>,
    ) -> SyncResult<()> {
        self.ensure_available()?;
        let mut medium = self.network.medium.lock().await;
        for ((kind, device_id), discoverer) in &medium.discoverers {
            if *kind == self.kind && *device_id != device.device_id {
                let _ = discoverer.try_send(device.clone());
            }
        }
        medium.advertised.insert(self.key(), device);
        debug!(
            "{}: advertising on {} ({} metadata entries)",
            self.local.device_id,
            self.kind,
            metadata.len()
        );
        Ok(())
    }

    async fn stop_advertising(&self) -> SyncResult<()> {
        self.network.medium.lock().await.advertised.remove(&self.key());
        Ok(())
    }

    async fn connect(&self, device: &DeviceInfo) -> SyncResult<P2pConnection> {
        self.ensure_available()?;
        let mut medium = self.network.medium.lock().await;
        let remote = medium
            .endpoints
            .get(&(self.kind, device.device_id.clone()))
            .filter(|endpoint| endpoint.available.load(Ordering::SeqCst))
            .ok_or_else(|| {
                SyncError::Network(format!(
                    "{} unreachable over {}",
                    device.device_id, self.kind
                ))
            })?;
        let remote_info = remote.device.clone();
        let remote_states = remote.states.clone();

        let connection_id = ConnectionId::new();
        medium.links.insert(
            connection_id,
            Link {
                kind: self.kind,
                a: self.local.device_id.clone(),
                b: device.device_id.clone(),
            },
        );
        drop(medium);

        let _ = remote_states.send(ConnectionStateChange {
            transport: self.kind,
            connection_id,
            remote_device: self.local.clone(),
            state: ConnectionState::Connected,
        });

        let connection = P2pConnection::new(
            connection_id,
            remote_info,
            self.kind,
            ConnectionState::Connecting,
        );
        connection.transition(ConnectionState::Connected);
        let _ = self.states.send(ConnectionStateChange {
            transport: self.kind,
            connection_id,
            remote_device: connection.remote_device().clone(),
            state: ConnectionState::Connected,
        });
        debug!("{}: connected to {} over {}", self.local.device_id, device.device_id, self.kind);
        Ok(connection)
    }

    async fn disconnect(&self, connection_id: ConnectionId) -> SyncResult<()> {
        let mut medium = self.network.medium.lock().await;
        let Some(link) = medium.links.remove(&connection_id) else {
            return Ok(());
        };
        for (device_id, peer_id) in [(&link.a, &link.b), (&link.b, &link.a)] {
            let remote_device = medium
                .endpoints
                .get(&(link.kind, peer_id.clone()))
                .map(|endpoint| endpoint.device.clone());
            if let (Some(endpoint), Some(remote_device)) =
                (medium.endpoints.get(&(link.kind, device_id.clone())), remote_device)
            {
                let _ = endpoint.states.send(ConnectionStateChange {
                    transport: link.kind,
                    connection_id,
                    remote_device,
                    state: ConnectionState::Disconnected,
                });
            }
        }
        Ok(())
    }

    async fn send(&self, connection_id: ConnectionId, bytes: Vec<u8>) -> SyncResult<()> {
        self.ensure_available()?;
        let medium = self.network.medium.lock().await;
        let link = medium
            .links
            .get(&connection_id)
            .ok_or_else(|| SyncError::Network(format!("unknown connection {connection_id}")))?;
        let peer = link
            .peer_of(&self.local.device_id)
            .ok_or_else(|| SyncError::Network(format!("connection {connection_id} is not ours")))?;
        let endpoint = medium
            .endpoints
            .get(&(link.kind, peer.clone()))
            .filter(|endpoint| endpoint.available.load(Ordering::SeqCst))
            .ok_or_else(|| SyncError::Network(format!("{peer} unreachable")))?;

        // Nobody listening on the other end is indistinguishable from loss.
        let _ = endpoint.packets.send(IncomingPacket {
            transport: self.kind,
            connection_id,
            from_device: self.local.device_id.clone(),
            bytes,
        });
        Ok(())
    }

    fn subscribe_packets(&self) -> broadcast::Receiver<IncomingPacket> {
        self.packets.subscribe()
    }

    fn subscribe_connection_state(&self) -> broadcast::Receiver<ConnectionStateChange> {
        self.states.subscribe()
    }
}
