use peersync_sync::{
    ConnectionState, DeviceInfo, LoopbackNetwork, SyncError, Transport, TransportKind,
    TransportRegistry,
};
use peersync_types::DeviceId;
use pretty_assertions::assert_eq;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

const KIND: TransportKind = TransportKind::LocalNetwork;

fn info(name: &str) -> DeviceInfo {
    DeviceInfo::new(DeviceId::new(name).unwrap(), name, "test")
}

// ── Discovery ───────────────────────────────────────────────────

#[tokio::test]
async fn discovery_finds_existing_advertisers() {
    let network = LoopbackNetwork::new();
    let alpha = network.attach(KIND, info("alpha")).await;
    let bravo = network.attach(KIND, info("bravo")).await;

    bravo
        .start_advertising(info("bravo"), HashMap::new())
        .await
        .unwrap();
    let mut found = alpha.start_discovery(Duration::from_secs(5)).await.unwrap();

    let device = found.recv().await.unwrap();
    assert_eq!(device.device_id, DeviceId::new("bravo").unwrap());
}

#[tokio::test]
async fn discovery_sees_later_advertisers() {
    let network = LoopbackNetwork::new();
    let alpha = network.attach(KIND, info("alpha")).await;
    let bravo = network.attach(KIND, info("bravo")).await;

    let mut found = alpha.start_discovery(Duration::from_secs(5)).await.unwrap();
    bravo
        .start_advertising(info("bravo"), HashMap::new())
        .await
        .unwrap();

    assert_eq!(found.recv().await.unwrap().device_name, "bravo");
}

#[tokio::test]
async fn discovery_is_scoped_to_the_transport_kind() {
    let network = LoopbackNetwork::new();
    let alpha = network.attach(TransportKind::ShortRangeRadio, info("alpha")).await;
    let bravo = network.attach(KIND, info("bravo")).await;

    bravo
        .start_advertising(info("bravo"), HashMap::new())
        .await
        .unwrap();
    let mut found = alpha.start_discovery(Duration::from_secs(5)).await.unwrap();
    assert!(found.try_recv().is_err());
}

#[tokio::test(start_paused = true)]
async fn discovery_stops_after_timeout() {
    let network = LoopbackNetwork::new();
    let alpha = network.attach(KIND, info("alpha")).await;

    let mut found = alpha.start_discovery(Duration::from_secs(30)).await.unwrap();
    tokio::time::sleep(Duration::from_secs(31)).await;
    assert!(found.recv().await.is_none());
}

#[tokio::test]
async fn stop_discovery_closes_the_stream() {
    let network = LoopbackNetwork::new();
    let alpha = network.attach(KIND, info("alpha")).await;

    let mut found = alpha.start_discovery(Duration::from_secs(60)).await.unwrap();
    alpha.stop_discovery().await.unwrap();
    assert!(found.recv().await.is_none());
}

// ── Connections & packets ───────────────────────────────────────

#[tokio::test]
async fn connect_notifies_both_sides() {
    let network = LoopbackNetwork::new();
    let alpha = network.attach(KIND, info("alpha")).await;
    let bravo = network.attach(KIND, info("bravo")).await;
    let mut alpha_states = alpha.subscribe_connection_state();
    let mut bravo_states = bravo.subscribe_connection_state();

    let connection = alpha.connect(&info("bravo")).await.unwrap();
    assert!(connection.is_connected());
    assert_eq!(connection.transport(), KIND);
    assert_eq!(network.link_count().await, 1);

    let local = alpha_states.recv().await.unwrap();
    assert_eq!(local.state, ConnectionState::Connected);
    assert_eq!(local.remote_device.device_name, "bravo");

    let remote = bravo_states.recv().await.unwrap();
    assert_eq!(remote.connection_id, connection.connection_id());
    assert_eq!(remote.remote_device.device_name, "alpha");
}

#[tokio::test]
async fn packets_flow_both_ways_on_one_connection() {
    let network = LoopbackNetwork::new();
    let alpha = network.attach(KIND, info("alpha")).await;
    let bravo = network.attach(KIND, info("bravo")).await;
    let mut alpha_packets = alpha.subscribe_packets();
    let mut bravo_packets = bravo.subscribe_packets();

    let connection = alpha.connect(&info("bravo")).await.unwrap();
    alpha
        .send(connection.connection_id(), b"ping".to_vec())
        .await
        .unwrap();
    let packet = bravo_packets.recv().await.unwrap();
    assert_eq!(packet.bytes, b"ping");
    assert_eq!(packet.from_device, DeviceId::new("alpha").unwrap());

    bravo.send(packet.connection_id, b"pong".to_vec()).await.unwrap();
    assert_eq!(alpha_packets.recv().await.unwrap().bytes, b"pong");
}

#[tokio::test]
async fn disconnect_closes_the_link() {
    let network = LoopbackNetwork::new();
    let alpha = network.attach(KIND, info("alpha")).await;
    let bravo = network.attach(KIND, info("bravo")).await;

    let connection = alpha.connect(&info("bravo")).await.unwrap();
    let mut bravo_states = bravo.subscribe_connection_state();
    alpha.disconnect(connection.connection_id()).await.unwrap();

    assert_eq!(
        bravo_states.recv().await.unwrap().state,
        ConnectionState::Disconnected
    );
    assert_eq!(network.link_count().await, 0);
    let err = alpha
        .send(connection.connection_id(), vec![1])
        .await
        .unwrap_err();
    assert!(matches!(err, SyncError::Network(_)));
}

#[tokio::test]
async fn connecting_to_an_absent_device_fails() {
    let network = LoopbackNetwork::new();
    let alpha = network.attach(KIND, info("alpha")).await;
    let err = alpha.connect(&info("ghost")).await.unwrap_err();
    assert!(matches!(err, SyncError::Network(_)));
}

#[tokio::test]
async fn switched_off_transport_is_unavailable() {
    let network = LoopbackNetwork::new();
    let alpha = network.attach(KIND, info("alpha")).await;
    let _bravo = network.attach(KIND, info("bravo")).await;

    alpha.set_available(false);
    assert!(!alpha.is_available().await);
    let err = alpha.connect(&info("bravo")).await.unwrap_err();
    assert!(matches!(err, SyncError::TransportUnavailable(_)));

    alpha.set_available(true);
    assert!(alpha.connect(&info("bravo")).await.is_ok());
}

// ── Registry ────────────────────────────────────────────────────

#[tokio::test]
async fn registry_selects_by_kind() {
    let network = LoopbackNetwork::new();
    let mut registry = TransportRegistry::new();
    assert!(registry.is_empty());

    registry.register(network.attach(TransportKind::LocalNetwork, info("alpha")).await);
    registry.register(network.attach(TransportKind::ShortRangeRadio, info("alpha")).await);
    assert_eq!(registry.len(), 2);
    assert!(registry.get(TransportKind::WirelessDirect).is_none());

    let all = registry.select(None);
    assert_eq!(all.len(), 2);

    let radio = registry.select(Some(&[TransportKind::ShortRangeRadio]));
    assert_eq!(radio.len(), 1);
    assert_eq!(radio[0].kind(), TransportKind::ShortRangeRadio);

    let kinds: Vec<TransportKind> = registry.kinds().collect();
    assert_eq!(
        kinds,
        vec![TransportKind::ShortRangeRadio, TransportKind::LocalNetwork]
    );
}

#[tokio::test]
async fn registering_a_kind_twice_replaces_it() {
    let network = LoopbackNetwork::new();
    let mut registry = TransportRegistry::new();
    let first: Arc<dyn Transport> = network.attach(KIND, info("alpha")).await;
    let second: Arc<dyn Transport> = network.attach(KIND, info("alpha")).await;

    registry.register(Arc::clone(&first));
    registry.register(Arc::clone(&second));
    assert_eq!(registry.len(), 1);
    assert!(Arc::ptr_eq(registry.get(KIND).unwrap(), &second));
}
