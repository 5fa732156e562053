//! In-process demo: N simulated devices on a loopback medium.
//!
//! Every device pairs with every other one over QR, edits a shared
//! inventory document plus a note of its own, and then the first device
//! acts as a hub. It opens one session with all peers, twice, so edits it
//! collects in the first round reach every other peer in the second.

use anyhow::{Context, Result, bail, ensure};
use peersync_crdt::OperationDraft;
use peersync_sync::{
    DeviceAuthenticationService, DeviceInfo, LoopbackNetwork, OrchestratorConfig,
    PairingConfig, SessionState, SyncConfig, SyncEngine, SyncOrchestrator, TransportKind,
    TransportRegistry,
};
use peersync_types::{DeviceId, DocumentId, SessionId};
use serde_json::{Map, Value, json};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info};

pub const INVENTORY_DOCUMENT: &str = "inventory-1";

/// One simulated device.
pub struct DemoDevice {
    pub info: DeviceInfo,
    pub auth: Arc<DeviceAuthenticationService>,
    pub orchestrator: Arc<SyncOrchestrator>,
}

impl DemoDevice {
    pub fn id(&self) -> &DeviceId {
        &self.info.device_id
    }

    pub fn engine(&self) -> &Arc<SyncEngine> {
        self.orchestrator.engine()
    }

    /// Materialized view of every document, keyed by id.
    pub async fn snapshot(&self) -> Vec<(DocumentId, Map<String, Value>)> {
        let engine = self.engine();
        let policy = engine.config().conflict_policy;
        let mut documents = Vec::new();
        for id in engine.document_ids().await {
            if let Some(document) = engine.document(&id).await {
                documents.push((id, document.snapshot(policy)));
            }
        }
        documents
    }
}

/// A running demo network.
pub struct Demo {
    network: Arc<LoopbackNetwork>,
    devices: Vec<DemoDevice>,
    wait: Duration,
}

impl Demo {
    /// Boots `count` devices, pairs them all and starts advertising.
    pub async fn start(count: usize) -> Result<Self> {
        ensure!(count >= 2, "the demo needs at least two devices, got {count}");
        let network = LoopbackNetwork::new();

        let mut devices = Vec::with_capacity(count);
        for n in 1..=count {
            let device_id = DeviceId::new(format!("device-{n}"))?;
            let name = format!("Device {n}");
            let info = DeviceInfo::new(device_id.clone(), &name, std::env::consts::OS)
                .with_transports([TransportKind::LocalNetwork]);

            let auth = Arc::new(DeviceAuthenticationService::new(
                info.clone(),
                PairingConfig::default(),
            ));
            let config = SyncConfig {
                device_name: name,
                ..SyncConfig::default()
            };
            let engine = Arc::new(SyncEngine::new(config, auth.clone()));
            engine.initialize(device_id).await?;

            let transport = network.attach(TransportKind::LocalNetwork, info.clone()).await;
            let mut registry = TransportRegistry::new();
            registry.register(transport);
            let orchestrator = Arc::new(SyncOrchestrator::start(
                engine,
                auth.clone(),
                registry,
                OrchestratorConfig::default(),
            ));
            orchestrator
                .start_advertising(
                    None,
                    HashMap::from([("app".to_string(), "peersync-node".to_string())]),
                )
                .await?;
            devices.push(DemoDevice {
                info,
                auth,
                orchestrator,
            });
        }

        for (i, a) in devices.iter().enumerate() {
            for b in &devices[i + 1..] {
                let offer = a.auth.initiate_pairing_with_qr().await?;
                let response = b.auth.process_scanned_qr(&offer.encode()?).await?;
                a.auth.complete_pairing(&response).await?;
                debug!("Paired {} with {}", a.id(), b.id());
            }
        }
        info!("Demo network up with {count} paired devices");

        Ok(Self {
            network,
            devices,
            wait: Duration::from_secs(10),
        })
    }

    /// How long to wait for discovery and for each session.
    pub fn with_wait(mut self, wait: Duration) -> Self {
        self.wait = wait;
        self
    }

    pub fn devices(&self) -> &[DemoDevice] {
        &self.devices
    }

    pub fn network(&self) -> &Arc<LoopbackNetwork> {
        &self.network
    }

    /// Every device sets the inventory quantity concurrently, bumps a shared
    /// view counter and writes a note of its own.
    pub async fn edit(&self) -> Result<()> {
        for (n, device) in (1i64..).zip(&self.devices) {
            let engine = device.engine();
            engine
                .apply_local_change(INVENTORY_DOCUMENT, "items", "set", "qty", json!(n * 10))
                .await?;
            engine
                .apply_local_operation(OperationDraft::increment(
                    INVENTORY_DOCUMENT,
                    "items",
                    "views",
                    json!(n),
                ))
                .await?;
            engine
                .apply_local_change(
                    format!("note-{n}"),
                    "notes",
                    "set",
                    "text",
                    json!(format!("written on {}", device.info.device_name)),
                )
                .await?;
        }
        Ok(())
    }

    /// Connects the hub to every peer it discovers, then runs two sessions
    /// that include all of them. Returns the completed sessions.
    pub async fn sync_all(&self) -> Result<Vec<SessionId>> {
        let (hub, peers) = self
            .devices
            .split_first()
            .context("demo has no devices")?;

        let mut discovered = hub.orchestrator.discovered_devices();
        hub.orchestrator.start_discovery(None, Some(self.wait)).await?;
        let mut found: HashMap<DeviceId, DeviceInfo> = HashMap::new();
        let expected: HashSet<&DeviceId> = peers.iter().map(DemoDevice::id).collect();
        tokio::time::timeout(self.wait, async {
            while found.len() < expected.len() {
                match discovered.recv().await {
                    Ok(device) if expected.contains(&device.device_id) => {
                        found.insert(device.device_id.clone(), device);
                    }
                    Ok(_) => {}
                    Err(e) => return Err(e),
                }
            }
            Ok(())
        })
        .await
        .context("discovery timed out")??;
        hub.orchestrator.stop_discovery(None).await?;
        info!("Hub {} discovered {} peers", hub.id(), found.len());

        for peer in peers {
            let info = found
                .get(peer.id())
                .with_context(|| format!("{} was not discovered", peer.id()))?;
            hub.orchestrator.connect_to_device(info, None).await?;
        }

        let participants: Vec<DeviceId> = peers.iter().map(|peer| peer.id().clone()).collect();
        let mut sessions = Vec::new();
        for round in 1..=2 {
            let session_id = self.sync_round(hub, &participants).await?;
            debug!("Round {round}: {} synced with {} peers", hub.id(), participants.len());
            sessions.push(session_id);
        }
        Ok(sessions)
    }

    async fn sync_round(&self, hub: &DemoDevice, participants: &[DeviceId]) -> Result<SessionId> {
        let mut updates = hub.orchestrator.session_updates();
        let session_id = hub
            .orchestrator
            .start_sync_session(participants.to_vec(), None)
            .await?;

        let update = tokio::time::timeout(self.wait, async {
            loop {
                let update = updates.recv().await?;
                if update.session_id == session_id && update.state.is_terminal() {
                    return Ok::<_, anyhow::Error>(update);
                }
            }
        })
        .await
        .with_context(|| format!("session {session_id} stalled"))??;

        if update.state != SessionState::Completed {
            bail!(
                "session {session_id} with {} peers ended {}: {}",
                participants.len(),
                update.state,
                update.reason.unwrap_or_default()
            );
        }
        Ok(session_id)
    }

    /// True once every device materializes the same documents.
    pub async fn converged(&self) -> bool {
        let mut snapshots = Vec::with_capacity(self.devices.len());
        for device in &self.devices {
            snapshots.push(device.snapshot().await);
        }
        snapshots.windows(2).all(|pair| pair[0] == pair[1])
    }

    pub async fn shutdown(&self) -> Result<()> {
        for device in &self.devices {
            device.orchestrator.shutdown().await?;
        }
        Ok(())
    }
}
