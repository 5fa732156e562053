use peersync_types::{DeviceId, DocumentId, OperationId, SessionId};
use std::str::FromStr;

#[test]
fn device_id_rejects_empty() {
    assert!(DeviceId::new("").is_err());
    assert!(DeviceId::new("   ").is_err());
}

#[test]
fn device_id_orders_lexicographically() {
    let alpha = DeviceId::new("alpha").unwrap();
    let bravo = DeviceId::new("bravo").unwrap();
    assert!(bravo > alpha);
}

#[test]
fn device_id_serializes_as_plain_string() {
    let id = DeviceId::new("tablet-7").unwrap();
    assert_eq!(serde_json::to_string(&id).unwrap(), "\"tablet-7\"");
    let back: DeviceId = serde_json::from_str("\"tablet-7\"").unwrap();
    assert_eq!(back, id);
}

#[test]
fn generated_device_ids_are_unique() {
    assert_ne!(DeviceId::generate(), DeviceId::generate());
}

#[test]
fn document_id_from_str() {
    let id: DocumentId = "invoice-42".into();
    assert_eq!(id.as_str(), "invoice-42");
    assert_eq!(id.to_string(), "invoice-42");
    assert!(!id.is_empty());
    assert!(DocumentId::new("").is_empty());
}

#[test]
fn uuid_ids_round_trip_through_display() {
    let op = OperationId::new();
    let parsed = OperationId::from_str(&op.to_string()).unwrap();
    assert_eq!(op, parsed);

    let session = SessionId::new();
    assert_eq!(SessionId::from_str(&session.to_string()).unwrap(), session);
}

#[test]
fn uuid_ids_are_time_ordered() {
    let first = OperationId::new();
    let second = OperationId::new();
    assert_ne!(first, second);
    assert!(SessionId::from_str("not-a-uuid").is_err());
}
