//! Sync protocol messages.
//!
//! A session is a bidirectional exchange:
//! 1. The initiator sends `syncRequest` followed by a `dataChunk`
//! 2. The responder joins, merges, replies with `acknowledgment` and its own `dataChunk`
//! 3. The initiator merges and acknowledges; both sides complete
//!
//! Either side may send `sessionCancelled` at any time.

use crate::device::DeviceInfo;
use peersync_crypto::EnvelopeMetadata;
use peersync_types::{ChunkId, DeviceId, HybridTimestamp, SessionId};
use serde::{Deserialize, Serialize};

/// Protocol version for compatibility checking.
pub const PROTOCOL_VERSION: u32 = 1;

/// Maximum size of an encoded message (16 MiB).
pub const MAX_MESSAGE_SIZE: usize = 16 * 1024 * 1024;

/// Key and nonce needed to open an encrypted chunk.
pub type EncryptionMetadata = EnvelopeMetadata;

/// Per-session payload options.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionConfiguration {
    pub compress: bool,
    pub encrypt: bool,
}

impl Default for SessionConfiguration {
    fn default() -> Self {
        Self {
            compress: true,
            encrypt: true,
        }
    }
}

/// A batch of operations travelling from one device to another.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncDataChunk {
    pub chunk_id: ChunkId,
    pub session_id: SessionId,
    pub from_device_id: DeviceId,
    pub to_device_id: DeviceId,
    /// Serialized operations, possibly compressed and/or encrypted.
    #[serde(with = "base64_bytes")]
    pub data: Vec<u8>,
    pub compressed: bool,
    pub encrypted: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub encryption_metadata: Option<EncryptionMetadata>,
    pub timestamp: HybridTimestamp,
    pub operations_count: usize,
}

/// Opens a session on the receiving device.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncRequestMessage {
    pub version: u32,
    pub session_id: SessionId,
    pub initiator: DeviceInfo,
    pub participants: Vec<DeviceId>,
    pub configuration: SessionConfiguration,
}

/// Confirms that a chunk was merged.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AcknowledgmentMessage {
    pub session_id: SessionId,
    pub chunk_id: ChunkId,
    pub from_device_id: DeviceId,
    pub operations_merged: usize,
    pub conflicts_detected: usize,
    /// Greatest operation timestamp contained in the acknowledged chunk.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cursor: Option<HybridTimestamp>,
}

/// Tells the peer a session ended early.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionCancelledMessage {
    pub session_id: SessionId,
    pub from_device_id: DeviceId,
    pub reason: String,
}

/// A transport packet, tagged by `type`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum SyncMessage {
    SyncRequest(SyncRequestMessage),
    DataChunk(SyncDataChunk),
    Acknowledgment(AcknowledgmentMessage),
    SessionCancelled(SessionCancelledMessage),
}

impl SyncMessage {
    /// The session the message belongs to.
    #[must_use]
    pub fn session_id(&self) -> SessionId {
        match self {
            Self::SyncRequest(m) => m.session_id,
            Self::DataChunk(m) => m.session_id,
            Self::Acknowledgment(m) => m.session_id,
            Self::SessionCancelled(m) => m.session_id,
        }
    }

    /// Wire name of the message type.
    #[must_use]
    pub const fn kind(&self) -> &'static str {
        match self {
            Self::SyncRequest(_) => "syncRequest",
            Self::DataChunk(_) => "dataChunk",
            Self::Acknowledgment(_) => "acknowledgment",
            Self::SessionCancelled(_) => "sessionCancelled",
        }
    }
}

mod base64_bytes {
    use base64::{Engine, engine::general_purpose::STANDARD};
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&STANDARD.encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let encoded = String::deserialize(deserializer)?;
        STANDARD.decode(encoded).map_err(serde::de::Error::custom)
    }
}
