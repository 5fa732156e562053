use peersync_sync::codec::{decode_message, encode_message};
use peersync_sync::{
    ConnectionState, DeviceAuthenticationService, DeviceInfo, FailureKind, LoopbackNetwork,
    LoopbackTransport, OrchestratorConfig, PROTOCOL_VERSION, PairingConfig,
    SessionConfiguration, SessionState, SessionUpdate, SyncConfig, SyncEngine, SyncError,
    SyncEvent, SyncMessage, SyncOrchestrator, SyncRequestMessage, Transport, TransportKind,
    TransportRegistry,
};
use peersync_types::{DeviceId, DocumentId, SessionId};
use pretty_assertions::assert_eq;
use serde_json::json;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;

const KIND: TransportKind = TransportKind::LocalNetwork;
const WAIT: Duration = Duration::from_secs(5);

struct Peer {
    info: DeviceInfo,
    auth: Arc<DeviceAuthenticationService>,
    engine: Arc<SyncEngine>,
    transport: Arc<LoopbackTransport>,
}

impl Peer {
    fn id(&self) -> DeviceId {
        self.info.device_id.clone()
    }

    fn orchestrator(&self) -> SyncOrchestrator {
        let mut registry = TransportRegistry::new();
        registry.register(self.transport.clone());
        SyncOrchestrator::start(
            self.engine.clone(),
            self.auth.clone(),
            registry,
            OrchestratorConfig::default(),
        )
    }

    async fn set(&self, field: &str, value: serde_json::Value) {
        self.engine
            .apply_local_change("order-1", "orders", "set", field, value)
            .await
            .unwrap();
    }

    async fn value(&self, field: &str) -> Option<serde_json::Value> {
        self.engine
            .field_value(&DocumentId::from("order-1"), field)
            .await
    }
}

async fn peer(network: &Arc<LoopbackNetwork>, name: &str) -> Peer {
    let info = DeviceInfo::new(DeviceId::new(name).unwrap(), name, "test");
    let auth = Arc::new(DeviceAuthenticationService::new(
        info.clone(),
        PairingConfig::default(),
    ));
    let engine = Arc::new(SyncEngine::new(SyncConfig::default(), auth.clone()));
    engine.initialize(info.device_id.clone()).await.unwrap();
    let transport = network.attach(KIND, info.clone()).await;
    Peer {
        info,
        auth,
        engine,
        transport,
    }
}

async fn pair(a: &Peer, b: &Peer) {
    let offer = a.auth.initiate_pairing_with_qr().await.unwrap();
    let response = b.auth.process_scanned_qr(&offer.encode().unwrap()).await.unwrap();
    a.auth.complete_pairing(&response).await.unwrap();
}

/// Honors `RUST_LOG` when debugging a failing exchange.
fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

async fn wait_for_state(
    updates: &mut broadcast::Receiver<SessionUpdate>,
    session_id: SessionId,
    state: SessionState,
) -> SessionUpdate {
    tokio::time::timeout(WAIT, async {
        loop {
            let update = updates.recv().await.unwrap();
            if update.session_id == session_id && update.state == state {
                return update;
            }
        }
    })
    .await
    .unwrap_or_else(|_| panic!("session {session_id} never reached {state}"))
}

// ── Full exchange ───────────────────────────────────────────────

#[tokio::test]
async fn two_devices_sync_over_loopback() {
    init_tracing();
    let network = LoopbackNetwork::new();
    let alpha = peer(&network, "alpha").await;
    let bravo = peer(&network, "bravo").await;
    pair(&alpha, &bravo).await;

    alpha.set("qty", json!(5)).await;
    bravo.set("qty", json!(7)).await;
    bravo.set("note", json!("fragile")).await;

    let alpha_orch = alpha.orchestrator();
    let bravo_orch = bravo.orchestrator();
    let mut alpha_updates = alpha_orch.session_updates();
    let mut bravo_updates = bravo_orch.session_updates();

    let connection = alpha_orch
        .connect_to_device(&bravo.info, None)
        .await
        .unwrap();
    assert!(connection.is_connected());
    assert_eq!(alpha_orch.connections().await.len(), 1);

    let session_id = alpha_orch
        .start_sync_session(vec![bravo.id()], None)
        .await
        .unwrap();

    wait_for_state(&mut alpha_updates, session_id, SessionState::Completed).await;
    wait_for_state(&mut bravo_updates, session_id, SessionState::Completed).await;

    for peer in [&alpha, &bravo] {
        assert_eq!(peer.value("qty").await, Some(json!(7)));
        assert_eq!(peer.value("note").await, Some(json!("fragile")));
        let session = peer.engine.session(session_id).await.unwrap();
        assert_eq!(session.conflicts.len(), 1);
    }
    let stats = alpha_orch.get_sync_statistics().await;
    assert_eq!(stats.active_sessions, 0);
    assert_eq!(stats.total_conflicts, 1);

    alpha_orch.shutdown().await.unwrap();
    bravo_orch.shutdown().await.unwrap();
}

#[tokio::test]
async fn second_session_only_sends_new_changes() {
    init_tracing();
    let network = LoopbackNetwork::new();
    let alpha = peer(&network, "alpha").await;
    let bravo = peer(&network, "bravo").await;
    pair(&alpha, &bravo).await;
    alpha.set("qty", json!(1)).await;

    let alpha_orch = alpha.orchestrator();
    let bravo_orch = bravo.orchestrator();
    let mut updates = alpha_orch.session_updates();
    alpha_orch.connect_to_device(&bravo.info, None).await.unwrap();

    let first = alpha_orch
        .start_sync_session(vec![bravo.id()], None)
        .await
        .unwrap();
    wait_for_state(&mut updates, first, SessionState::Completed).await;

    alpha.set("qty", json!(2)).await;
    let mut events = bravo_orch.sync_events();
    let second = alpha_orch
        .start_sync_session(vec![bravo.id()], None)
        .await
        .unwrap();
    wait_for_state(&mut updates, second, SessionState::Completed).await;

    assert_eq!(bravo.value("qty").await, Some(json!(2)));
    let merged: Vec<(usize, usize)> = std::iter::from_fn(|| events.try_recv().ok())
        .filter_map(|event| match event {
            SyncEvent::OperationsMerged {
                session_id,
                merged,
                duplicates,
                ..
            } if session_id == second => Some((merged, duplicates)),
            _ => None,
        })
        .collect();
    assert_eq!(merged, vec![(1, 0)]);
}

#[tokio::test]
async fn hub_session_with_two_peers_converges_all_three() {
    init_tracing();
    let network = LoopbackNetwork::new();
    let hub = peer(&network, "hub").await;
    let alpha = peer(&network, "alpha").await;
    let bravo = peer(&network, "bravo").await;
    pair(&hub, &alpha).await;
    pair(&hub, &bravo).await;

    alpha.set("qty", json!(1)).await;
    hub.set("note", json!("rush")).await;
    bravo.set("price", json!(9)).await;

    let hub_orch = hub.orchestrator();
    let alpha_orch = alpha.orchestrator();
    let bravo_orch = bravo.orchestrator();
    let mut updates = hub_orch.session_updates();
    let mut alpha_updates = alpha_orch.session_updates();
    let mut bravo_updates = bravo_orch.session_updates();
    hub_orch.connect_to_device(&alpha.info, None).await.unwrap();
    hub_orch.connect_to_device(&bravo.info, None).await.unwrap();

    // The first session brings everything to the hub, the second fans it out.
    for _ in 0..2 {
        let session_id = hub_orch
            .start_sync_session(vec![alpha.id(), bravo.id()], None)
            .await
            .unwrap();
        wait_for_state(&mut updates, session_id, SessionState::Completed).await;
        wait_for_state(&mut alpha_updates, session_id, SessionState::Completed).await;
        wait_for_state(&mut bravo_updates, session_id, SessionState::Completed).await;
    }

    for device in [&hub, &alpha, &bravo] {
        assert_eq!(device.value("qty").await, Some(json!(1)), "{}", device.id());
        assert_eq!(device.value("note").await, Some(json!("rush")), "{}", device.id());
        assert_eq!(device.value("price").await, Some(json!(9)), "{}", device.id());
    }

    for orchestrator in [hub_orch, alpha_orch, bravo_orch] {
        orchestrator.shutdown().await.unwrap();
    }
}

// ── Preconditions ───────────────────────────────────────────────

#[tokio::test]
async fn session_with_unconnected_device_is_not_created() {
    let network = LoopbackNetwork::new();
    let alpha = peer(&network, "alpha").await;
    let bravo = peer(&network, "bravo").await;
    pair(&alpha, &bravo).await;
    let alpha_orch = alpha.orchestrator();

    let err = alpha_orch
        .start_sync_session(vec![bravo.id()], None)
        .await
        .unwrap_err();
    assert!(matches!(err, SyncError::DeviceNotConnected(id) if id == bravo.id()));
    assert!(alpha.engine.active_sessions().await.is_empty());
    assert_eq!(alpha_orch.get_sync_statistics().await.active_sessions, 0);
}

#[tokio::test]
async fn connecting_requires_pairing() {
    let network = LoopbackNetwork::new();
    let alpha = peer(&network, "alpha").await;
    let stranger = peer(&network, "stranger").await;
    let alpha_orch = alpha.orchestrator();

    let err = alpha_orch
        .connect_to_device(&stranger.info, None)
        .await
        .unwrap_err();
    assert!(matches!(err, SyncError::DeviceNotPaired(_)));
    assert!(alpha_orch.connections().await.is_empty());
}

#[tokio::test]
async fn connecting_needs_a_shared_available_transport() {
    let network = LoopbackNetwork::new();
    let alpha = peer(&network, "alpha").await;
    let bravo = peer(&network, "bravo").await;
    pair(&alpha, &bravo).await;
    let alpha_orch = alpha.orchestrator();

    alpha.transport.set_available(false);
    let err = alpha_orch
        .connect_to_device(&bravo.info, None)
        .await
        .unwrap_err();
    assert!(matches!(err, SyncError::TransportUnavailable(_)));

    alpha.transport.set_available(true);
    let radio_only = bravo
        .info
        .clone()
        .with_transports([TransportKind::ShortRangeRadio]);
    let err = alpha_orch
        .connect_to_device(&radio_only, Some(TransportKind::ShortRangeRadio))
        .await
        .unwrap_err();
    assert!(matches!(err, SyncError::TransportUnavailable(_)));
}

// ── Cancellation & timeout ──────────────────────────────────────

#[tokio::test]
async fn cancel_notifies_participants_and_is_idempotent() {
    let network = LoopbackNetwork::new();
    let alpha = peer(&network, "alpha").await;
    let bravo = peer(&network, "bravo").await;
    pair(&alpha, &bravo).await;

    // Bravo runs no orchestrator, so the session never completes by itself.
    let mut bravo_packets = bravo.transport.subscribe_packets();
    let alpha_orch = alpha.orchestrator();
    let mut updates = alpha_orch.session_updates();
    alpha_orch.connect_to_device(&bravo.info, None).await.unwrap();
    let session_id = alpha_orch
        .start_sync_session(vec![bravo.id()], None)
        .await
        .unwrap();

    assert!(alpha_orch.cancel_sync_session(session_id).await.unwrap());
    let update = wait_for_state(&mut updates, session_id, SessionState::Cancelled).await;
    assert!(update.reason.is_some());
    assert!(!alpha_orch.cancel_sync_session(session_id).await.unwrap());

    let kinds: Vec<&'static str> = std::iter::from_fn(|| bravo_packets.try_recv().ok())
        .map(|packet| decode_message(&packet.bytes).unwrap().kind())
        .collect();
    assert_eq!(kinds, vec!["syncRequest", "dataChunk", "sessionCancelled"]);
}

#[tokio::test]
async fn cancelling_an_unknown_session_fails() {
    let network = LoopbackNetwork::new();
    let alpha = peer(&network, "alpha").await;
    let alpha_orch = alpha.orchestrator();

    let err = alpha_orch
        .cancel_sync_session(SessionId::new())
        .await
        .unwrap_err();
    assert!(matches!(err, SyncError::SessionNotFound(_)));
}

#[tokio::test(start_paused = true)]
async fn stalled_session_times_out_after_thirty_minutes() {
    let network = LoopbackNetwork::new();
    let alpha = peer(&network, "alpha").await;
    let bravo = peer(&network, "bravo").await;
    pair(&alpha, &bravo).await;

    let alpha_orch = alpha.orchestrator();
    let mut updates = alpha_orch.session_updates();
    alpha_orch.connect_to_device(&bravo.info, None).await.unwrap();
    let session_id = alpha_orch
        .start_sync_session(vec![bravo.id()], None)
        .await
        .unwrap();
    wait_for_state(&mut updates, session_id, SessionState::Active).await;

    tokio::time::sleep(Duration::from_secs(29 * 60)).await;
    assert!(alpha.engine.session(session_id).await.unwrap().is_active());

    tokio::time::sleep(Duration::from_secs(2 * 60)).await;
    wait_for_state(&mut updates, session_id, SessionState::Cancelled).await;
    let session = alpha.engine.session(session_id).await.unwrap();
    assert_eq!(session.state, SessionState::Cancelled);

    assert!(!alpha_orch.cancel_sync_session(session_id).await.unwrap());
}

// ── Inbound handling ────────────────────────────────────────────

#[tokio::test]
async fn requests_from_untrusted_devices_are_ignored() {
    let network = LoopbackNetwork::new();
    let alpha = peer(&network, "alpha").await;
    let stranger = peer(&network, "stranger").await;
    let alpha_orch = alpha.orchestrator();
    let mut events = alpha_orch.sync_events();

    let connection = stranger.transport.connect(&alpha.info).await.unwrap();
    let request = SyncMessage::SyncRequest(SyncRequestMessage {
        version: PROTOCOL_VERSION,
        session_id: SessionId::new(),
        initiator: stranger.info.clone(),
        participants: vec![alpha.id()],
        configuration: SessionConfiguration::default(),
    });
    stranger
        .transport
        .send(connection.connection_id(), encode_message(&request).unwrap())
        .await
        .unwrap();

    let event = tokio::time::timeout(WAIT, events.recv())
        .await
        .unwrap()
        .unwrap();
    assert!(matches!(
        event,
        SyncEvent::Error {
            failure: FailureKind::Trust,
            ..
        }
    ));
    assert!(alpha.engine.active_sessions().await.is_empty());
}

#[tokio::test]
async fn inbound_connections_are_tracked() {
    let network = LoopbackNetwork::new();
    let alpha = peer(&network, "alpha").await;
    let bravo = peer(&network, "bravo").await;
    pair(&alpha, &bravo).await;

    let alpha_orch = alpha.orchestrator();
    let bravo_orch = bravo.orchestrator();
    let mut changes = bravo_orch.connection_state_changes();

    let connection = alpha_orch
        .connect_to_device(&bravo.info, None)
        .await
        .unwrap();
    let change = tokio::time::timeout(WAIT, changes.recv())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(change.state, ConnectionState::Connected);
    assert_eq!(change.remote_device.device_id, alpha.id());
    assert_eq!(bravo_orch.connections().await.len(), 1);

    assert!(alpha_orch.disconnect(connection.connection_id()).await.unwrap());
    assert!(!alpha_orch.disconnect(connection.connection_id()).await.unwrap());
    assert!(alpha_orch.connections().await.is_empty());

    let change = tokio::time::timeout(WAIT, changes.recv())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(change.state, ConnectionState::Disconnected);
    assert!(bravo_orch.connections().await.is_empty());
}

#[tokio::test(start_paused = true)]
async fn health_monitor_fails_connections_on_dead_transports() {
    let network = LoopbackNetwork::new();
    let alpha = peer(&network, "alpha").await;
    let bravo = peer(&network, "bravo").await;
    pair(&alpha, &bravo).await;

    let alpha_orch = alpha.orchestrator();
    let connection = alpha_orch
        .connect_to_device(&bravo.info, None)
        .await
        .unwrap();
    let mut changes = alpha_orch.connection_state_changes();

    alpha.transport.set_available(false);
    let change = tokio::time::timeout(Duration::from_secs(30), async {
        loop {
            let change = changes.recv().await.unwrap();
            if change.state == ConnectionState::Failed {
                return change;
            }
        }
    })
    .await
    .unwrap();

    assert_eq!(change.connection_id, connection.connection_id());
    assert_eq!(connection.state(), ConnectionState::Failed);
    assert!(alpha_orch.connections().await.is_empty());
}

// ── Discovery ───────────────────────────────────────────────────

#[tokio::test]
async fn discovery_reports_advertising_devices() {
    let network = LoopbackNetwork::new();
    let alpha = peer(&network, "alpha").await;
    let bravo = peer(&network, "bravo").await;
    let alpha_orch = alpha.orchestrator();
    let bravo_orch = bravo.orchestrator();

    let advertising = bravo_orch
        .start_advertising(None, HashMap::from([("app".to_string(), "orders".to_string())]))
        .await
        .unwrap();
    assert_eq!(advertising, 1);

    let mut discovered = alpha_orch.discovered_devices();
    assert_eq!(
        alpha_orch
            .start_discovery(None, Some(Duration::from_secs(5)))
            .await
            .unwrap(),
        1
    );
    let device = tokio::time::timeout(WAIT, discovered.recv())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(device.device_id, bravo.id());

    alpha_orch.stop_discovery(None).await.unwrap();
    bravo_orch.stop_advertising(None).await.unwrap();
}

#[tokio::test]
async fn discovery_without_transports_fails() {
    let network = LoopbackNetwork::new();
    let alpha = peer(&network, "alpha").await;
    let alpha_orch = alpha.orchestrator();
    alpha.transport.set_available(false);

    let err = alpha_orch.start_discovery(None, None).await.unwrap_err();
    assert!(matches!(err, SyncError::TransportUnavailable(_)));
    let err = alpha_orch
        .start_advertising(Some(&[TransportKind::WirelessDirect][..]), HashMap::new())
        .await
        .unwrap_err();
    assert!(matches!(err, SyncError::TransportUnavailable(_)));
}

// ── Shutdown ────────────────────────────────────────────────────

#[tokio::test]
async fn shutdown_closes_connections_and_the_command_loop() {
    let network = LoopbackNetwork::new();
    let alpha = peer(&network, "alpha").await;
    let bravo = peer(&network, "bravo").await;
    pair(&alpha, &bravo).await;

    let alpha_orch = alpha.orchestrator();
    alpha_orch.connect_to_device(&bravo.info, None).await.unwrap();
    assert_eq!(network.link_count().await, 1);

    alpha_orch.shutdown().await.unwrap();
    assert_eq!(network.link_count().await, 0);
    assert!(alpha_orch.connections().await.is_empty());

    let err = alpha_orch
        .cancel_sync_session(SessionId::new())
        .await
        .unwrap_err();
    assert!(matches!(err, SyncError::ChannelClosed));
}
