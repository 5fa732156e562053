//! Sync orchestration: connects the engine to the transports.
//!
//! The orchestrator owns a single command loop. Inbound packets, session
//! timeouts and explicit cancellations all travel through the same queue,
//! so a timeout and a cancel for one session can never race. Caller-facing
//! methods that only read or open connections run directly.

use crate::codec;
use crate::connection::{ConnectionState, P2pConnection};
use crate::device::{DeviceInfo, TransportKind};
use crate::engine::SyncEngine;
use crate::error::{FailureKind, SyncError, SyncResult};
use crate::event::{SessionUpdate, SyncEvent};
use crate::pairing::DeviceAuthenticationService;
use crate::protocol::{
    AcknowledgmentMessage, PROTOCOL_VERSION, SessionCancelledMessage, SessionConfiguration,
    SyncDataChunk, SyncMessage, SyncRequestMessage,
};
use crate::state::{SessionState, SyncProgress, SyncStatistics};
use crate::transport::{ConnectionStateChange, IncomingPacket, Transport, TransportRegistry};
use peersync_types::{ConnectionId, DeviceId, SessionId};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, RwLock, broadcast, mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Configuration for the orchestrator.
#[derive(Debug, Clone)]
pub struct OrchestratorConfig {
    /// A session still open after this long is cancelled.
    pub session_timeout: Duration,
    /// Default discovery window.
    pub discovery_timeout: Duration,
    /// How often open connections are checked.
    pub health_check_interval: Duration,
    /// Capacity of the command queue.
    pub command_capacity: usize,
    /// Capacity of the orchestrator's own broadcast channels.
    pub event_capacity: usize,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            session_timeout: Duration::from_secs(30 * 60),
            discovery_timeout: Duration::from_secs(30),
            health_check_interval: Duration::from_secs(5),
            command_capacity: 256,
            event_capacity: 64,
        }
    }
}

/// Work item for the command loop.
#[derive(Debug)]
pub enum SyncCommand {
    /// A packet arrived on some transport.
    Inbound(IncomingPacket),
    /// A session's timer expired.
    SessionTimeout(SessionId),
    /// The caller asked to cancel a session.
    Cancel {
        session_id: SessionId,
        reply: oneshot::Sender<SyncResult<bool>>,
    },
    /// Stop the loop.
    Shutdown,
}

struct Inner {
    engine: Arc<SyncEngine>,
    auth: Arc<DeviceAuthenticationService>,
    registry: TransportRegistry,
    config: OrchestratorConfig,
    commands: mpsc::Sender<SyncCommand>,
    connections: RwLock<HashMap<DeviceId, P2pConnection>>,
    monitors: Mutex<HashMap<ConnectionId, JoinHandle<()>>>,
    timers: Mutex<HashMap<SessionId, JoinHandle<()>>>,
    discovery_tasks: Mutex<HashMap<TransportKind, JoinHandle<()>>>,
    session_updates: broadcast::Sender<SessionUpdate>,
    discovered: broadcast::Sender<DeviceInfo>,
    connection_changes: broadcast::Sender<ConnectionStateChange>,
}

/// Drives sync sessions between this device and its peers.
pub struct SyncOrchestrator {
    inner: Arc<Inner>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl SyncOrchestrator {
    /// Starts the command loop and subscribes to every registered transport.
    pub fn start(
        engine: Arc<SyncEngine>,
        auth: Arc<DeviceAuthenticationService>,
        registry: TransportRegistry,
        config: OrchestratorConfig,
    ) -> Self {
        let (commands, command_rx) = mpsc::channel(config.command_capacity.max(1));
        let capacity = config.event_capacity.max(1);
        let inner = Arc::new(Inner {
            engine,
            auth,
            registry,
            config,
            commands,
            connections: RwLock::new(HashMap::new()),
            monitors: Mutex::new(HashMap::new()),
            timers: Mutex::new(HashMap::new()),
            discovery_tasks: Mutex::new(HashMap::new()),
            session_updates: broadcast::channel(capacity).0,
            discovered: broadcast::channel(capacity).0,
            connection_changes: broadcast::channel(capacity).0,
        });

        let mut tasks = vec![tokio::spawn(Inner::run_command_loop(
            Arc::clone(&inner),
            command_rx,
        ))];
        for transport in inner.registry.iter() {
            tasks.push(tokio::spawn(forward_packets(
                transport.subscribe_packets(),
                inner.commands.clone(),
            )));
            tasks.push(tokio::spawn(Inner::track_connections(
                Arc::clone(&inner),
                transport.subscribe_connection_state(),
            )));
        }

        info!(
            "Sync orchestrator started for {} over {:?}",
            inner.auth.local_device().device_id,
            inner.registry
        );
        Self {
            inner,
            tasks: Mutex::new(tasks),
        }
    }

    #[must_use]
    pub fn engine(&self) -> &Arc<SyncEngine> {
        &self.inner.engine
    }

    #[must_use]
    pub fn local_device(&self) -> &DeviceInfo {
        self.inner.auth.local_device()
    }

    // ── Discovery & advertising ─────────────────────────────────

    /// Starts discovery on the selected transports (all if `None`). Results
    /// are published on [`Self::discovered_devices`] until `timeout`
    /// (the configured default if `None`) elapses. Returns how many
    /// transports started.
    pub async fn start_discovery(
        &self,
        kinds: Option<&[TransportKind]>,
        timeout: Option<Duration>,
    ) -> SyncResult<usize> {
        let timeout = timeout.unwrap_or(self.inner.config.discovery_timeout);
        let local = self.local_device().device_id.clone();
        let mut started = 0;

        for transport in self.inner.available(kinds).await {
            let mut rx = match transport.start_discovery(timeout).await {
                Ok(rx) => rx,
                Err(e) => {
                    warn!("Discovery failed on {}: {e}", transport.kind());
                    continue;
                }
            };
            let discovered = self.inner.discovered.clone();
            let local = local.clone();
            let kind = transport.kind();
            let task = tokio::spawn(async move {
                let forward = async {
                    while let Some(device) = rx.recv().await {
                        if device.device_id != local {
                            debug!("Discovered {} over {kind}", device.device_id);
                            let _ = discovered.send(device);
                        }
                    }
                };
                let _ = tokio::time::timeout(timeout, forward).await;
                if let Err(e) = transport.stop_discovery().await {
                    warn!("Failed to stop discovery on {kind}: {e}");
                }
            });
            if let Some(previous) = self.inner.discovery_tasks.lock().await.insert(kind, task) {
                previous.abort();
            }
            started += 1;
        }

        if started == 0 {
            return Err(SyncError::TransportUnavailable(
                "no transport available for discovery".to_string(),
            ));
        }
        info!("Discovery started on {started} transports");
        Ok(started)
    }

    /// Stops discovery on the selected transports (all if `None`).
    pub async fn stop_discovery(&self, kinds: Option<&[TransportKind]>) -> SyncResult<()> {
        for transport in self.inner.registry.select(kinds) {
            if let Some(task) = self.inner.discovery_tasks.lock().await.remove(&transport.kind()) {
                task.abort();
            }
            transport.stop_discovery().await?;
        }
        Ok(())
    }

    /// Advertises this device on the selected transports (all if `None`).
    /// Returns how many transports are advertising.
    pub async fn start_advertising(
        &self,
        kinds: Option<&[TransportKind]>,
        metadata: HashMap<String, String>,
    ) -> SyncResult<usize> {
        let mut started = 0;
        for transport in self.inner.available(kinds).await {
            match transport
                .start_advertising(self.local_device().clone(), metadata.clone())
                .await
            {
                Ok(()) => started += 1,
                Err(e) => warn!("Advertising failed on {}: {e}", transport.kind()),
            }
        }
        if started == 0 {
            return Err(SyncError::TransportUnavailable(
                "no transport available for advertising".to_string(),
            ));
        }
        Ok(started)
    }

    pub async fn stop_advertising(&self, kinds: Option<&[TransportKind]>) -> SyncResult<()> {
        for transport in self.inner.registry.select(kinds) {
            transport.stop_advertising().await?;
        }
        Ok(())
    }

    // ── Connections ─────────────────────────────────────────────

    /// Connects to a paired device over a transport both sides support,
    /// trying `preferred` first.
    pub async fn connect_to_device(
        &self,
        device: &DeviceInfo,
        preferred: Option<TransportKind>,
    ) -> SyncResult<P2pConnection> {
        if !self.inner.auth.is_trusted(&device.device_id).await {
            return Err(SyncError::DeviceNotPaired(device.device_id.clone()));
        }

        let local = self.local_device();
        let mut candidates: Vec<TransportKind> = Vec::new();
        for kind in preferred.into_iter().chain(TransportKind::ALL) {
            if local.supports(kind) && device.supports(kind) && !candidates.contains(&kind) {
                candidates.push(kind);
            }
        }

        let mut last_error = None;
        for kind in candidates {
            let Some(transport) = self.inner.registry.get(kind) else {
                continue;
            };
            if !transport.is_available().await {
                debug!("Skipping {kind}: unavailable");
                continue;
            }
            match transport.connect(device).await {
                Ok(connection) => {
                    self.inner
                        .connections
                        .write()
                        .await
                        .insert(device.device_id.clone(), connection.clone());
                    self.inner.monitor(connection.clone()).await;
                    if let Err(e) = self.inner.auth.mark_seen(&device.device_id).await {
                        warn!("Failed to record {} as seen: {e}", device.device_id);
                    }
                    info!("Connected to {} over {kind}", device.device_id);
                    return Ok(connection);
                }
                Err(e) => {
                    warn!("Connecting to {} over {kind} failed: {e}", device.device_id);
                    last_error = Some(e);
                }
            }
        }

        Err(last_error.unwrap_or_else(|| {
            SyncError::TransportUnavailable(format!(
                "no shared transport available for {}",
                device.device_id
            ))
        }))
    }

    /// Closes a connection. Returns false if it was not open.
    pub async fn disconnect(&self, connection_id: ConnectionId) -> SyncResult<bool> {
        let connection = {
            let mut connections = self.inner.connections.write().await;
            let device = connections
                .iter()
                .find(|(_, c)| c.connection_id() == connection_id)
                .map(|(device, _)| device.clone());
            match device {
                Some(device) => connections.remove(&device),
                None => None,
            }
        };
        let Some(connection) = connection else {
            return Ok(false);
        };

        self.inner.stop_monitor(connection_id).await;
        connection.transition(ConnectionState::Disconnected);
        if let Some(transport) = self.inner.registry.get(connection.transport()) {
            transport.disconnect(connection_id).await?;
        }
        info!("Disconnected from {}", connection.remote_device_id());
        Ok(true)
    }

    /// Open connections, keyed by remote device.
    pub async fn connections(&self) -> Vec<P2pConnection> {
        self.inner.connections.read().await.values().cloned().collect()
    }

    // ── Sessions ────────────────────────────────────────────────

    /// Opens a session with `devices`, each of which must be connected.
    pub async fn start_sync_session(
        &self,
        devices: Vec<DeviceId>,
        configuration: Option<SessionConfiguration>,
    ) -> SyncResult<SessionId> {
        let targets = {
            let connections = self.inner.connections.read().await;
            devices
                .iter()
                .map(|device| {
                    connections
                        .get(device)
                        .filter(|c| c.is_connected())
                        .cloned()
                        .ok_or_else(|| SyncError::DeviceNotConnected(device.clone()))
                })
                .collect::<SyncResult<Vec<_>>>()?
        };

        let session_id = self
            .inner
            .engine
            .start_sync_session(devices, configuration)
            .await?;
        self.inner.arm_timer(session_id).await;
        self.inner.publish_update(session_id, SessionState::Active, None);

        let session = self
            .inner
            .engine
            .session(session_id)
            .await
            .ok_or(SyncError::SessionNotFound(session_id))?;
        let request = SyncMessage::SyncRequest(SyncRequestMessage {
            version: PROTOCOL_VERSION,
            session_id,
            initiator: self.local_device().clone(),
            participants: session.participants.iter().cloned().collect(),
            configuration: session.configuration,
        });

        let result = async {
            for connection in &targets {
                self.inner
                    .send(connection.transport(), connection.connection_id(), &request)
                    .await?;
            }
            self.push_changes(session_id).await
        }
        .await;

        if let Err(e) = result {
            warn!("Session {session_id} could not be started: {e}");
            if self.inner.engine.fail_sync_session(session_id, e.to_string()).await? {
                self.inner.finish(session_id, SessionState::Failed, Some(e.to_string())).await;
            }
            return Err(e);
        }
        Ok(session_id)
    }

    /// Sends this device's changes to every other party of a session.
    /// Returns how many chunks were sent.
    pub async fn push_changes(&self, session_id: SessionId) -> SyncResult<usize> {
        let session = self
            .inner
            .engine
            .session(session_id)
            .await
            .ok_or(SyncError::SessionNotFound(session_id))?;
        if !session.is_active() {
            return Err(SyncError::InvalidOperation(format!(
                "session {session_id} is {}",
                session.state
            )));
        }

        let mut sent = 0;
        for device in &session.participants {
            let connection = self
                .inner
                .connection_to(device)
                .await
                .ok_or_else(|| SyncError::DeviceNotConnected(device.clone()))?;
            self.inner
                .send_changes(session_id, device, connection.transport(), connection.connection_id())
                .await?;
            sent += 1;
        }
        Ok(sent)
    }

    /// Cancels a session. Idempotent: cancelling a finished session
    /// returns `Ok(false)`.
    pub async fn cancel_sync_session(&self, session_id: SessionId) -> SyncResult<bool> {
        let (reply, response) = oneshot::channel();
        self.inner
            .commands
            .send(SyncCommand::Cancel { session_id, reply })
            .await
            .map_err(|_| SyncError::ChannelClosed)?;
        response.await.map_err(|_| SyncError::ChannelClosed)?
    }

    pub async fn get_sync_statistics(&self) -> SyncStatistics {
        self.inner.engine.get_sync_statistics().await
    }

    // ── Streams ─────────────────────────────────────────────────

    pub fn sync_events(&self) -> broadcast::Receiver<SyncEvent> {
        self.inner.engine.subscribe_events()
    }

    pub fn progress_updates(&self) -> broadcast::Receiver<SyncProgress> {
        self.inner.engine.subscribe_progress()
    }

    pub fn session_updates(&self) -> broadcast::Receiver<SessionUpdate> {
        self.inner.session_updates.subscribe()
    }

    pub fn discovered_devices(&self) -> broadcast::Receiver<DeviceInfo> {
        self.inner.discovered.subscribe()
    }

    pub fn connection_state_changes(&self) -> broadcast::Receiver<ConnectionStateChange> {
        self.inner.connection_changes.subscribe()
    }

    /// Stops the command loop, background tasks and every connection.
    pub async fn shutdown(&self) -> SyncResult<()> {
        // The loop may already be gone; that is what we want anyway.
        let _ = self.inner.commands.send(SyncCommand::Shutdown).await;

        for (_, task) in self.inner.discovery_tasks.lock().await.drain() {
            task.abort();
        }
        for (_, timer) in self.inner.timers.lock().await.drain() {
            timer.abort();
        }
        for (_, monitor) in self.inner.monitors.lock().await.drain() {
            monitor.abort();
        }

        let connections: Vec<P2pConnection> = self
            .inner
            .connections
            .write()
            .await
            .drain()
            .map(|(_, c)| c)
            .collect();
        for connection in connections {
            connection.transition(ConnectionState::Disconnected);
            if let Some(transport) = self.inner.registry.get(connection.transport()) {
                if let Err(e) = transport.disconnect(connection.connection_id()).await {
                    warn!("Failed to close {}: {e}", connection.connection_id());
                }
            }
        }
        for transport in self.inner.registry.iter() {
            let _ = transport.stop_discovery().await;
            let _ = transport.stop_advertising().await;
        }
        for task in self.tasks.lock().await.drain(..) {
            task.abort();
        }

        info!("Sync orchestrator stopped");
        Ok(())
    }
}

async fn forward_packets(
    mut packets: broadcast::Receiver<IncomingPacket>,
    commands: mpsc::Sender<SyncCommand>,
) {
    loop {
        match packets.recv().await {
            Ok(packet) => {
                if commands.send(SyncCommand::Inbound(packet)).await.is_err() {
                    break;
                }
            }
            Err(broadcast::error::RecvError::Lagged(missed)) => {
                warn!("Dropped {missed} inbound packets");
            }
            Err(broadcast::error::RecvError::Closed) => break,
        }
    }
}

impl Inner {
    async fn run_command_loop(self: Arc<Self>, mut commands: mpsc::Receiver<SyncCommand>) {
        while let Some(command) = commands.recv().await {
            match command {
                SyncCommand::Inbound(packet) => self.handle_packet(packet).await,
                SyncCommand::SessionTimeout(session_id) => self.handle_timeout(session_id).await,
                SyncCommand::Cancel { session_id, reply } => {
                    let result = self.cancel(session_id, "cancelled by user").await;
                    let _ = reply.send(result);
                }
                SyncCommand::Shutdown => break,
            }
        }
        debug!("Command loop finished");
    }

    async fn track_connections(
        self: Arc<Self>,
        mut changes: broadcast::Receiver<ConnectionStateChange>,
    ) {
        loop {
            let change = match changes.recv().await {
                Ok(change) => change,
                Err(broadcast::error::RecvError::Lagged(missed)) => {
                    warn!("Dropped {missed} connection state changes");
                    continue;
                }
                Err(broadcast::error::RecvError::Closed) => break,
            };

            let device = change.remote_device.device_id.clone();
            match change.state {
                ConnectionState::Connected => {
                    let mut connections = self.connections.write().await;
                    let known = connections
                        .get(&device)
                        .is_some_and(|c| c.connection_id() == change.connection_id);
                    if !known {
                        debug!("Inbound connection from {device} over {}", change.transport);
                        connections.insert(
                            device,
                            P2pConnection::new(
                                change.connection_id,
                                change.remote_device.clone(),
                                change.transport,
                                ConnectionState::Connected,
                            ),
                        );
                    }
                }
                ConnectionState::Disconnected | ConnectionState::Failed => {
                    let removed = {
                        let mut connections = self.connections.write().await;
                        if connections
                            .get(&device)
                            .is_some_and(|c| c.connection_id() == change.connection_id)
                        {
                            connections.remove(&device)
                        } else {
                            None
                        }
                    };
                    if let Some(connection) = removed {
                        connection.transition(change.state);
                        self.stop_monitor(change.connection_id).await;
                        info!("Connection to {device} is {:?}", change.state);
                    }
                }
                ConnectionState::Connecting => {}
            }
            let _ = self.connection_changes.send(change);
        }
    }

    async fn available(&self, kinds: Option<&[TransportKind]>) -> Vec<Arc<dyn Transport>> {
        let mut available = Vec::new();
        for transport in self.registry.select(kinds) {
            if transport.is_available().await {
                available.push(transport);
            } else {
                debug!("Skipping {}: unavailable", transport.kind());
            }
        }
        available
    }

    async fn connection_to(&self, device: &DeviceId) -> Option<P2pConnection> {
        self.connections
            .read()
            .await
            .get(device)
            .filter(|c| c.is_connected())
            .cloned()
    }

    // ── Health monitoring ───────────────────────────────────────

    async fn monitor(self: &Arc<Self>, connection: P2pConnection) {
        let inner = Arc::clone(self);
        let connection_id = connection.connection_id();
        let task = tokio::spawn(async move {
            let mut interval = tokio::time::interval(inner.config.health_check_interval);
            interval.tick().await;
            loop {
                interval.tick().await;
                if !connection.is_connected() {
                    break;
                }
                let healthy = match inner.registry.get(connection.transport()) {
                    Some(transport) => transport.is_available().await,
                    None => false,
                };
                if healthy {
                    continue;
                }

                warn!(
                    "Connection to {} lost: {} unavailable",
                    connection.remote_device_id(),
                    connection.transport()
                );
                connection.transition(ConnectionState::Failed);
                {
                    let mut connections = inner.connections.write().await;
                    if connections
                        .get(connection.remote_device_id())
                        .is_some_and(|c| c.connection_id() == connection.connection_id())
                    {
                        connections.remove(connection.remote_device_id());
                    }
                }
                let _ = inner.connection_changes.send(ConnectionStateChange {
                    transport: connection.transport(),
                    connection_id: connection.connection_id(),
                    remote_device: connection.remote_device().clone(),
                    state: ConnectionState::Failed,
                });
                break;
            }
        });
        if let Some(previous) = self.monitors.lock().await.insert(connection_id, task) {
            previous.abort();
        }
    }

    async fn stop_monitor(&self, connection_id: ConnectionId) {
        if let Some(task) = self.monitors.lock().await.remove(&connection_id) {
            task.abort();
        }
    }

    // ── Session bookkeeping ─────────────────────────────────────

    async fn arm_timer(&self, session_id: SessionId) {
        let commands = self.commands.clone();
        let timeout = self.config.session_timeout;
        let timer = tokio::spawn(async move {
            tokio::time::sleep(timeout).await;
            let _ = commands.send(SyncCommand::SessionTimeout(session_id)).await;
        });
        if let Some(previous) = self.timers.lock().await.insert(session_id, timer) {
            previous.abort();
        }
    }

    fn publish_update(&self, session_id: SessionId, state: SessionState, reason: Option<String>) {
        let _ = self.session_updates.send(SessionUpdate {
            session_id,
            state,
            reason,
        });
    }

    /// Disarms the timer of a session that reached a terminal state.
    async fn finish(&self, session_id: SessionId, state: SessionState, reason: Option<String>) {
        if let Some(timer) = self.timers.lock().await.remove(&session_id) {
            timer.abort();
        }
        self.publish_update(session_id, state, reason);
    }

    async fn cancel(&self, session_id: SessionId, reason: &str) -> SyncResult<bool> {
        if !self.engine.cancel_sync_session(session_id).await? {
            return Ok(false);
        }
        self.finish(session_id, SessionState::Cancelled, Some(reason.to_string()))
            .await;
        self.notify_cancelled(session_id, reason).await;
        Ok(true)
    }

    async fn notify_cancelled(&self, session_id: SessionId, reason: &str) {
        let Some(session) = self.engine.session(session_id).await else {
            return;
        };
        let message = SyncMessage::SessionCancelled(SessionCancelledMessage {
            session_id,
            from_device_id: self.auth.local_device().device_id.clone(),
            reason: reason.to_string(),
        });
        for device in &session.participants {
            let Some(connection) = self.connection_to(device).await else {
                continue;
            };
            if let Err(e) = self
                .send(connection.transport(), connection.connection_id(), &message)
                .await
            {
                warn!("Could not tell {device} about cancelled session {session_id}: {e}");
            }
        }
    }

    async fn handle_timeout(&self, session_id: SessionId) {
        self.timers.lock().await.remove(&session_id);
        match self.cancel(session_id, "session timed out").await {
            Ok(true) => warn!("Session {session_id} timed out"),
            Ok(false) => {}
            Err(e) => warn!("Timeout for session {session_id} failed: {e}"),
        }
    }

    async fn complete_if_done(&self, session_id: SessionId) -> SyncResult<()> {
        if self.engine.exchange_complete(session_id).await?
            && self.engine.complete_sync_session(session_id).await?
        {
            self.finish(session_id, SessionState::Completed, None).await;
        }
        Ok(())
    }

    // ── Outbound ────────────────────────────────────────────────

    async fn send(
        &self,
        kind: TransportKind,
        connection_id: ConnectionId,
        message: &SyncMessage,
    ) -> SyncResult<()> {
        let transport = self
            .registry
            .get(kind)
            .ok_or_else(|| SyncError::TransportUnavailable(format!("{kind} is not registered")))?;
        let bytes = codec::encode_message(message)?;
        debug!("Sending {} ({} bytes) over {kind}", message.kind(), bytes.len());
        transport.send(connection_id, bytes).await
    }

    async fn send_changes(
        &self,
        session_id: SessionId,
        device: &DeviceId,
        kind: TransportKind,
        connection_id: ConnectionId,
    ) -> SyncResult<()> {
        let since = self.engine.peer_cursor(device).await;
        let chunk = self
            .engine
            .generate_sync_data(session_id, device, since.as_ref())
            .await?;
        self.send(kind, connection_id, &SyncMessage::DataChunk(chunk))
            .await
    }

    // ── Inbound ─────────────────────────────────────────────────

    async fn handle_packet(&self, packet: IncomingPacket) {
        let message = match codec::decode_message(&packet.bytes) {
            Ok(message) => message,
            Err(e) => {
                warn!("Undecodable packet from {}: {e}", packet.from_device);
                self.engine.report_error(None, &e);
                return;
            }
        };
        let session_id = message.session_id();
        debug!("Received {} from {}", message.kind(), packet.from_device);

        if !self.auth.is_trusted(&packet.from_device).await {
            let err = SyncError::DeviceNotPaired(packet.from_device.clone());
            warn!("Ignoring {} from untrusted device: {err}", message.kind());
            self.engine.report_error(Some(session_id), &err);
            return;
        }

        let result = match message {
            SyncMessage::SyncRequest(request) => self.on_sync_request(&packet, request).await,
            SyncMessage::DataChunk(chunk) => self.on_data_chunk(&packet, chunk).await,
            SyncMessage::Acknowledgment(ack) => self.on_acknowledgment(&packet, ack).await,
            SyncMessage::SessionCancelled(cancelled) => self.on_cancelled(cancelled).await,
        };
        if let Err(e) = result {
            warn!("Session {session_id}: {e}");
            self.engine.report_error(Some(session_id), &e);
        }
    }

    async fn on_sync_request(
        &self,
        packet: &IncomingPacket,
        request: SyncRequestMessage,
    ) -> SyncResult<()> {
        if request.initiator.device_id != packet.from_device {
            return Err(SyncError::InvalidOperation(format!(
                "sync request from {} claims to come from {}",
                packet.from_device, request.initiator.device_id
            )));
        }
        if request.version != PROTOCOL_VERSION {
            let reply = SyncMessage::SessionCancelled(SessionCancelledMessage {
                session_id: request.session_id,
                from_device_id: self.auth.local_device().device_id.clone(),
                reason: format!("unsupported protocol version {}", request.version),
            });
            return self.send(packet.transport, packet.connection_id, &reply).await;
        }

        let joined = self
            .engine
            .join_sync_session(
                request.session_id,
                request.initiator.device_id.clone(),
                Some(request.configuration),
            )
            .await?;
        if joined {
            self.arm_timer(request.session_id).await;
            self.publish_update(request.session_id, SessionState::Active, None);
            if let Err(e) = self.auth.mark_seen(&packet.from_device).await {
                warn!("Failed to record {} as seen: {e}", packet.from_device);
            }
        }
        Ok(())
    }

    async fn on_data_chunk(&self, packet: &IncomingPacket, chunk: SyncDataChunk) -> SyncResult<()> {
        if chunk.from_device_id != packet.from_device {
            return Err(SyncError::InvalidOperation(format!(
                "chunk from {} claims to come from {}",
                packet.from_device, chunk.from_device_id
            )));
        }
        let session_id = chunk.session_id;

        let report = match self
            .engine
            .process_sync_data(session_id, &packet.from_device, &chunk)
            .await
        {
            Ok(report) => report,
            // Already published as a sync event; the session keeps going.
            Err(e)
                if matches!(
                    e.failure_kind(),
                    FailureKind::Decryption | FailureKind::Decompression | FailureKind::Parse
                ) =>
            {
                return Ok(());
            }
            Err(e) => return Err(e),
        };

        let ack = SyncMessage::Acknowledgment(AcknowledgmentMessage {
            session_id,
            chunk_id: chunk.chunk_id,
            from_device_id: self.auth.local_device().device_id.clone(),
            operations_merged: report.merged,
            conflicts_detected: report.conflicts,
            cursor: report.cursor,
        });
        self.send(packet.transport, packet.connection_id, &ack).await?;

        // A responder answers the initiator's data with its own.
        let session = self
            .engine
            .session(session_id)
            .await
            .ok_or(SyncError::SessionNotFound(session_id))?;
        if session.initiator == packet.from_device && session.is_active() {
            self.send_changes(
                session_id,
                &packet.from_device,
                packet.transport,
                packet.connection_id,
            )
            .await?;
        }

        self.complete_if_done(session_id).await
    }

    async fn on_acknowledgment(
        &self,
        packet: &IncomingPacket,
        ack: AcknowledgmentMessage,
    ) -> SyncResult<()> {
        debug!(
            "Session {}: {} merged {} operations ({} conflicts)",
            ack.session_id, packet.from_device, ack.operations_merged, ack.conflicts_detected
        );
        self.engine
            .record_acknowledgment(ack.session_id, &packet.from_device, ack.chunk_id, ack.cursor)
            .await?;
        self.complete_if_done(ack.session_id).await
    }

    async fn on_cancelled(&self, cancelled: SessionCancelledMessage) -> SyncResult<()> {
        match self.engine.cancel_sync_session(cancelled.session_id).await {
            Ok(true) => {
                info!(
                    "Session {} cancelled by {}: {}",
                    cancelled.session_id, cancelled.from_device_id, cancelled.reason
                );
                self.finish(
                    cancelled.session_id,
                    SessionState::Cancelled,
                    Some(cancelled.reason),
                )
                .await;
                Ok(())
            }
            Ok(false) | Err(SyncError::SessionNotFound(_)) => Ok(()),
            Err(e) => Err(e),
        }
    }
}

impl Drop for SyncOrchestrator {
    fn drop(&mut self) {
        for task in self.tasks.get_mut().drain(..) {
            task.abort();
        }
        if let Ok(mut monitors) = self.inner.monitors.try_lock() {
            monitors.drain().for_each(|(_, task)| task.abort());
        }
        if let Ok(mut discovery) = self.inner.discovery_tasks.try_lock() {
            discovery.drain().for_each(|(_, task)| task.abort());
        }
        if let Ok(mut timers) = self.inner.timers.try_lock() {
            timers.drain().for_each(|(_, timer)| timer.abort());
        }
    }
}

impl std::fmt::Debug for SyncOrchestrator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SyncOrchestrator")
            .field("device", &self.inner.auth.local_device().device_id)
            .field("transports", &self.inner.registry)
            .finish_non_exhaustive()
    }
}
