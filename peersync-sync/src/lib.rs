//! Offline-first peer-to-peer sync for PeerSync.
//!
//! # Architecture
//!
//! ## Components
//!
//! - **Engine**: owns the replicated documents and sync sessions; merges
//!   remote operations and produces outbound data chunks
//! - **Protocol / codec**: the JSON messages exchanged between devices and
//!   the payload pipeline (serialize, gzip, seal)
//! - **Pairing**: device identity, the persistent trust store and the QR/PIN
//!   pairing handshakes that establish pairwise keys
//! - **Transport**: an abstract medium contract, a registry keyed by
//!   transport kind and an in-memory loopback medium
//! - **Orchestrator**: discovery, connections and the session protocol,
//!   driven by a single command loop
//!
//! ## Sync Process
//!
//! 1. **Pairing**: two devices exchange a QR payload or a PIN offer and end
//!    up sharing a pairwise key
//! 2. **Discovery**: find paired devices on any available transport
//! 3. **Connect**: pick a transport both sides support
//! 4. **Exchange**: the initiator sends a `syncRequest` and its changes; the
//!    responder merges, acknowledges and sends its own changes back
//! 5. **Complete**: once every participant has acknowledged and delivered
//!    data, the session completes on both sides
//!
//! # Example
//!
//! ```
//! use peersync_sync::{
//!     DeviceAuthenticationService, DeviceInfo, PairingConfig, SyncConfig, SyncEngine,
//! };
//! use peersync_types::DeviceId;
//! use std::sync::Arc;
//!
//! let device_id = DeviceId::new("laptop").unwrap();
//! let local = DeviceInfo::new(device_id, "My Laptop", "linux");
//! let auth = Arc::new(DeviceAuthenticationService::new(local, PairingConfig::default()));
//! let engine = SyncEngine::new(SyncConfig::default(), auth);
//! ```

pub mod codec;
mod connection;
mod device;
mod engine;
mod error;
mod event;
mod orchestrator;
pub mod pairing;
pub mod protocol;
mod state;
pub mod transport;

pub use connection::{ConnectionState, P2pConnection};
pub use device::{DeviceInfo, TransportKind};
pub use engine::{MergeReport, SyncConfig, SyncEngine};
pub use error::{FailureKind, SyncError, SyncResult};
pub use event::{SessionUpdate, SyncEvent};
pub use orchestrator::{OrchestratorConfig, SyncCommand, SyncOrchestrator};
pub use pairing::{
    DeviceAuthenticationService, PairedDevice, PairingConfig, PairingMethod, PairingResponse,
    PairwiseKeyStore, PinPairing, PinPairingOffer, QrPairingOffer, TrustStore,
};
pub use protocol::{
    AcknowledgmentMessage, EncryptionMetadata, MAX_MESSAGE_SIZE, PROTOCOL_VERSION,
    SessionCancelledMessage, SessionConfiguration, SyncDataChunk, SyncMessage,
    SyncRequestMessage,
};
pub use state::{SessionState, SyncConflict, SyncProgress, SyncSession, SyncStatistics};
pub use transport::loopback::{LoopbackNetwork, LoopbackTransport};
pub use transport::{ConnectionStateChange, IncomingPacket, Transport, TransportRegistry};
