//! Device pairing and the persistent trust store.
//!
//! Two devices become mutually trusted in three steps:
//! 1. The initiator publishes an offer (a QR code, or a PIN plus salt) that
//!    lets the responder derive a one-time offer key
//! 2. The responder creates the pairwise key, trusts the initiator and
//!    returns a response sealed under the offer key
//! 3. The initiator opens the response and trusts the responder
//!
//! The trust store is the only state that outlives the process; it is kept
//! as pretty-printed JSON.

use crate::device::DeviceInfo;
use crate::error::{SyncError, SyncResult};
use async_trait::async_trait;
use base64::{Engine, engine::general_purpose::STANDARD};
use chrono::{DateTime, TimeDelta, Utc};
use peersync_crypto::{
    EncryptedData, KdfParams, Salt, SymmetricKey, decrypt, derive_key, encrypt, generate_key,
    generate_pin,
};
use peersync_types::DeviceId;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Looks up the symmetric key shared with a paired device.
#[async_trait]
pub trait PairwiseKeyStore: Send + Sync {
    /// Returns the pairwise key, or `None` if the device is not paired.
    async fn pairwise_key(&self, device_id: &DeviceId) -> Option<SymmetricKey>;
}

/// Pairing parameters.
#[derive(Debug, Clone)]
pub struct PairingConfig {
    /// How long an offer stays valid.
    pub offer_ttl: Duration,
    /// Argon2id parameters for PIN-derived offer keys.
    pub kdf: KdfParams,
}

impl Default for PairingConfig {
    fn default() -> Self {
        Self {
            offer_ttl: Duration::from_secs(10 * 60),
            kdf: KdfParams::default(),
        }
    }
}

/// How a device was paired.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum PairingMethod {
    QrCode,
    Pin,
}

/// A device in the trust store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PairedDevice {
    pub device: DeviceInfo,
    pub pairwise_key: SymmetricKey,
    pub method: PairingMethod,
    pub paired_at: DateTime<Utc>,
    pub last_seen: Option<DateTime<Utc>>,
}

impl PairedDevice {
    #[must_use]
    pub fn device_id(&self) -> &DeviceId {
        &self.device.device_id
    }
}

/// Persistent set of trusted devices.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TrustStore {
    devices: BTreeMap<DeviceId, PairedDevice>,
}

impl TrustStore {
    /// Loads the trust store from JSON.
    pub fn from_json(json: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(json)
    }

    /// Serializes the trust store to JSON.
    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string_pretty(self)
    }

    pub fn get(&self, device_id: &DeviceId) -> Option<&PairedDevice> {
        self.devices.get(device_id)
    }

    pub fn contains(&self, device_id: &DeviceId) -> bool {
        self.devices.contains_key(device_id)
    }

    pub fn insert(&mut self, device: PairedDevice) {
        self.devices.insert(device.device_id().clone(), device);
    }

    pub fn remove(&mut self, device_id: &DeviceId) -> Option<PairedDevice> {
        self.devices.remove(device_id)
    }

    pub fn devices(&self) -> impl Iterator<Item = &PairedDevice> {
        self.devices.values()
    }

    pub fn len(&self) -> usize {
        self.devices.len()
    }

    pub fn is_empty(&self) -> bool {
        self.devices.is_empty()
    }

    /// Updates `last_seen`. Returns false for unknown devices.
    pub fn mark_seen(&mut self, device_id: &DeviceId, at: DateTime<Utc>) -> bool {
        match self.devices.get_mut(device_id) {
            Some(device) => {
                device.last_seen = Some(at);
                true
            }
            None => false,
        }
    }
}

/// Contents of a pairing QR code.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QrPairingOffer {
    pub pairing_id: Uuid,
    pub device: DeviceInfo,
    pub offer_key: SymmetricKey,
    pub expires_at: DateTime<Utc>,
}

impl QrPairingOffer {
    /// Encodes the offer as the string shown in the QR code.
    pub fn encode(&self) -> SyncResult<String> {
        Ok(STANDARD.encode(serde_json::to_vec(self)?))
    }

    /// Decodes a scanned QR string.
    pub fn decode(payload: &str) -> SyncResult<Self> {
        let bytes = STANDARD
            .decode(payload.trim())
            .map_err(|e| SyncError::Pairing(format!("invalid QR payload: {e}")))?;
        serde_json::from_slice(&bytes)
            .map_err(|e| SyncError::Pairing(format!("invalid QR payload: {e}")))
    }
}

/// Public half of a PIN pairing, published to nearby devices. The PIN itself
/// is shown on screen and typed on the other device.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PinPairingOffer {
    pub pairing_id: Uuid,
    pub device: DeviceInfo,
    /// Argon2id salt (base64).
    pub salt: String,
    pub expires_at: DateTime<Utc>,
}

/// A started PIN pairing: the PIN to display and the offer to publish.
#[derive(Debug, Clone)]
pub struct PinPairing {
    pub pin: String,
    pub offer: PinPairingOffer,
}

/// The responder's answer to an offer, sealed under the offer key.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PairingResponse {
    pub pairing_id: Uuid,
    pub responder_id: DeviceId,
    /// `ResponseBody` encrypted with the offer key (base64).
    pub sealed: String,
}

#[derive(Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ResponseBody {
    device: DeviceInfo,
    pairwise_key: SymmetricKey,
}

struct PendingOffer {
    key: SymmetricKey,
    method: PairingMethod,
    expires_at: DateTime<Utc>,
}

/// Device identity plus trust store; runs both sides of pairing.
pub struct DeviceAuthenticationService {
    local: DeviceInfo,
    config: PairingConfig,
    store_path: Option<PathBuf>,
    trust: Mutex<TrustStore>,
    pending: Mutex<HashMap<Uuid, PendingOffer>>,
}

impl DeviceAuthenticationService {
    /// Creates a service with an in-memory trust store.
    #[must_use]
    pub fn new(local: DeviceInfo, config: PairingConfig) -> Self {
        Self {
            local,
            config,
            store_path: None,
            trust: Mutex::new(TrustStore::default()),
            pending: Mutex::new(HashMap::new()),
        }
    }

    /// Creates a service backed by a JSON trust store at `path`, loading it
    /// if it exists.
    pub async fn open(
        local: DeviceInfo,
        config: PairingConfig,
        path: impl AsRef<Path>,
    ) -> SyncResult<Self> {
        let path = path.as_ref().to_path_buf();
        let trust = match tokio::fs::read_to_string(&path).await {
            Ok(json) => TrustStore::from_json(&json)?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => TrustStore::default(),
            Err(e) => return Err(e.into()),
        };
        debug!("Loaded trust store with {} devices from {}", trust.len(), path.display());

        Ok(Self {
            local,
            config,
            store_path: Some(path),
            trust: Mutex::new(trust),
            pending: Mutex::new(HashMap::new()),
        })
    }

    /// This device's public description.
    #[must_use]
    pub fn local_device(&self) -> &DeviceInfo {
        &self.local
    }

    // ── Initiator side ──────────────────────────────────────────

    /// Starts a QR pairing. The returned offer's [`QrPairingOffer::encode`]
    /// output is what the QR code shows.
    pub async fn initiate_pairing_with_qr(&self) -> SyncResult<QrPairingOffer> {
        let offer = QrPairingOffer {
            pairing_id: Uuid::new_v4(),
            device: self.local.clone(),
            offer_key: generate_key(),
            expires_at: self.expiry()?,
        };
        self.pending.lock().await.insert(
            offer.pairing_id,
            PendingOffer {
                key: offer.offer_key.clone(),
                method: PairingMethod::QrCode,
                expires_at: offer.expires_at,
            },
        );
        info!("Started QR pairing {}", offer.pairing_id);
        Ok(offer)
    }

    /// Starts a PIN pairing.
    pub async fn initiate_pairing_with_pin(&self) -> SyncResult<PinPairing> {
        let pin = generate_pin();
        let salt = Salt::random();
        let key = self.derive_pin_key(&pin, &salt).await?;

        let offer = PinPairingOffer {
            pairing_id: Uuid::new_v4(),
            device: self.local.clone(),
            salt: salt.to_base64(),
            expires_at: self.expiry()?,
        };
        self.pending.lock().await.insert(
            offer.pairing_id,
            PendingOffer {
                key,
                method: PairingMethod::Pin,
                expires_at: offer.expires_at,
            },
        );
        info!("Started PIN pairing {}", offer.pairing_id);
        Ok(PinPairing { pin, offer })
    }

    /// Opens the responder's answer and trusts the responder.
    pub async fn complete_pairing(&self, response: &PairingResponse) -> SyncResult<PairedDevice> {
        let pending = self
            .pending
            .lock()
            .await
            .remove(&response.pairing_id)
            .ok_or_else(|| SyncError::Pairing("unknown pairing offer".to_string()))?;
        if Utc::now() > pending.expires_at {
            return Err(SyncError::Pairing("pairing offer expired".to_string()));
        }

        let sealed = EncryptedData::from_base64(&response.sealed)
            .map_err(|e| SyncError::Pairing(e.to_string()))?;
        let body = decrypt(&pending.key, &sealed).map_err(|_| {
            SyncError::Pairing("could not open pairing response (wrong PIN?)".to_string())
        })?;
        let body: ResponseBody = serde_json::from_slice(&body)?;
        if body.device.device_id != response.responder_id {
            return Err(SyncError::Pairing(
                "responder identity does not match response".to_string(),
            ));
        }

        let paired = self
            .trust_device(body.device, body.pairwise_key, pending.method)
            .await?;
        info!("Paired with {} via {:?}", paired.device_id(), paired.method);
        Ok(paired)
    }

    // ── Responder side ──────────────────────────────────────────

    /// Accepts a scanned QR offer.
    pub async fn process_scanned_qr(&self, payload: &str) -> SyncResult<PairingResponse> {
        let offer = QrPairingOffer::decode(payload)?;
        self.check_offer(&offer.device, offer.expires_at)?;
        self.respond(offer.pairing_id, offer.device, &offer.offer_key, PairingMethod::QrCode)
            .await
    }

    /// Accepts a PIN offer with the PIN typed by the user.
    pub async fn process_pin(
        &self,
        offer: &PinPairingOffer,
        pin: &str,
    ) -> SyncResult<PairingResponse> {
        self.check_offer(&offer.device, offer.expires_at)?;
        let salt = Salt::from_base64(&offer.salt).map_err(|e| SyncError::Pairing(e.to_string()))?;
        let key = self.derive_pin_key(pin.trim(), &salt).await?;
        self.respond(offer.pairing_id, offer.device.clone(), &key, PairingMethod::Pin)
            .await
    }

    // ── Trust store ─────────────────────────────────────────────

    pub async fn is_trusted(&self, device_id: &DeviceId) -> bool {
        self.trust.lock().await.contains(device_id)
    }

    pub async fn paired_device(&self, device_id: &DeviceId) -> Option<PairedDevice> {
        self.trust.lock().await.get(device_id).cloned()
    }

    pub async fn paired_devices(&self) -> Vec<PairedDevice> {
        self.trust.lock().await.devices().cloned().collect()
    }

    /// Removes a device from the trust store. Returns false if it was unknown.
    pub async fn revoke_device(&self, device_id: &DeviceId) -> SyncResult<bool> {
        let revoked = self
            .update_trust(|trust| trust.remove(device_id).is_some())
            .await?;
        if revoked {
            warn!("Revoked trust for {device_id}");
        }
        Ok(revoked)
    }

    /// Records that a paired device was just reachable.
    pub async fn mark_seen(&self, device_id: &DeviceId) -> SyncResult<bool> {
        self.update_trust(|trust| trust.mark_seen(device_id, Utc::now()))
            .await
    }

    /// Drops offers whose time-to-live has passed. Returns how many.
    pub async fn purge_expired_offers(&self) -> usize {
        let now = Utc::now();
        let mut pending = self.pending.lock().await;
        let before = pending.len();
        pending.retain(|_, offer| offer.expires_at >= now);
        before - pending.len()
    }

    // ── Internals ───────────────────────────────────────────────

    async fn respond(
        &self,
        pairing_id: Uuid,
        initiator: DeviceInfo,
        offer_key: &SymmetricKey,
        method: PairingMethod,
    ) -> SyncResult<PairingResponse> {
        let pairwise_key = generate_key();
        let body = ResponseBody {
            device: self.local.clone(),
            pairwise_key: pairwise_key.clone(),
        };
        let sealed = encrypt(offer_key, &serde_json::to_vec(&body)?)
            .map_err(|e| SyncError::Pairing(e.to_string()))?;

        let initiator_id = initiator.device_id.clone();
        self.trust_device(initiator, pairwise_key, method).await?;
        info!("Accepted pairing {pairing_id} from {initiator_id}");

        Ok(PairingResponse {
            pairing_id,
            responder_id: self.local.device_id.clone(),
            sealed: sealed.to_base64(),
        })
    }

    async fn trust_device(
        &self,
        mut device: DeviceInfo,
        pairwise_key: SymmetricKey,
        method: PairingMethod,
    ) -> SyncResult<PairedDevice> {
        device.is_trusted = true;
        let paired = PairedDevice {
            device,
            pairwise_key,
            method,
            paired_at: Utc::now(),
            last_seen: None,
        };
        self.update_trust(|trust| {
            trust.insert(paired.clone());
            true
        })
        .await?;
        Ok(paired)
    }

    /// Applies `change` to a copy of the trust store and makes the copy
    /// current only once it is on disk. Returns what `change` returned; a
    /// `false` skips the write.
    async fn update_trust<F>(&self, change: F) -> SyncResult<bool>
    where
        F: FnOnce(&mut TrustStore) -> bool,
    {
        let mut trust = self.trust.lock().await;
        let mut next = trust.clone();
        if !change(&mut next) {
            return Ok(false);
        }
        self.persist(&next).await?;
        *trust = next;
        Ok(true)
    }

    fn check_offer(&self, device: &DeviceInfo, expires_at: DateTime<Utc>) -> SyncResult<()> {
        if device.device_id == self.local.device_id {
            return Err(SyncError::Pairing("cannot pair with self".to_string()));
        }
        if Utc::now() > expires_at {
            return Err(SyncError::Pairing("pairing offer expired".to_string()));
        }
        Ok(())
    }

    fn expiry(&self) -> SyncResult<DateTime<Utc>> {
        let ttl = TimeDelta::from_std(self.config.offer_ttl)
            .map_err(|e| SyncError::Pairing(format!("invalid offer ttl: {e}")))?;
        Ok(Utc::now() + ttl)
    }

    async fn derive_pin_key(&self, pin: &str, salt: &Salt) -> SyncResult<SymmetricKey> {
        let pin = pin.to_string();
        let salt = salt.clone();
        let params = self.config.kdf.clone();
        tokio::task::spawn_blocking(move || derive_key(&pin, &salt, &params))
            .await
            .map_err(|e| SyncError::Pairing(format!("key derivation task failed: {e}")))?
            .map_err(|e| SyncError::Pairing(e.to_string()))
    }

    async fn persist(&self, trust: &TrustStore) -> SyncResult<()> {
        let Some(path) = &self.store_path else {
            return Ok(());
        };
        tokio::fs::write(path, trust.to_json()?).await?;
        debug!("Saved trust store ({} devices)", trust.len());
        Ok(())
    }
}

#[async_trait]
impl PairwiseKeyStore for DeviceAuthenticationService {
    async fn pairwise_key(&self, device_id: &DeviceId) -> Option<SymmetricKey> {
        self.trust
            .lock()
            .await
            .get(device_id)
            .map(|device| device.pairwise_key.clone())
    }
}
