//! Device descriptions exchanged during discovery and pairing.

use peersync_types::DeviceId;
use serde::{Deserialize, Serialize};
use std::fmt;

/// The physical medium a transport runs over.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum TransportKind {
    /// Short-range radio (e.g. Bluetooth LE).
    ShortRangeRadio,
    /// Local wireless direct links (e.g. Wi-Fi Direct).
    WirelessDirect,
    /// Service discovery on the local network (e.g. mDNS).
    LocalNetwork,
}

impl TransportKind {
    /// Every transport kind, in default preference order.
    pub const ALL: [Self; 3] = [Self::LocalNetwork, Self::WirelessDirect, Self::ShortRangeRadio];

    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::ShortRangeRadio => "shortRangeRadio",
            Self::WirelessDirect => "wirelessDirect",
            Self::LocalNetwork => "localNetwork",
        }
    }
}

impl fmt::Display for TransportKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Public description of a device.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeviceInfo {
    pub device_id: DeviceId,
    pub device_name: String,
    pub platform: String,
    pub supported_transports: Vec<TransportKind>,
    /// Whether the local trust store holds this device.
    #[serde(default)]
    pub is_trusted: bool,
    /// Public key material advertised by the device, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub public_key: Option<String>,
}

impl DeviceInfo {
    /// Creates a device description supporting every transport kind.
    pub fn new(
        device_id: DeviceId,
        device_name: impl Into<String>,
        platform: impl Into<String>,
    ) -> Self {
        Self {
            device_id,
            device_name: device_name.into(),
            platform: platform.into(),
            supported_transports: TransportKind::ALL.to_vec(),
            is_trusted: false,
            public_key: None,
        }
    }

    /// Restricts the transports the device supports.
    pub fn with_transports(mut self, transports: impl IntoIterator<Item = TransportKind>) -> Self {
        self.supported_transports = transports.into_iter().collect();
        self
    }

    #[must_use]
    pub fn supports(&self, kind: TransportKind) -> bool {
        self.supported_transports.contains(&kind)
    }
}
