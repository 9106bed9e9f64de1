//! Interface to the radio driver.
//!
//! The driver performs the actual I/O and reports everything asynchronously:
//! calls on [`GattHandle`] only *request* an operation, and the outcome comes
//! back later as a [`GattEvent`] delivered to the [`GattEventHandler`] given
//! at connect time. Handlers are invoked from the driver's own threads and
//! must not block.

use btleplug::api::{CharPropFlags, ScanFilter, WriteType};
use bytes::Bytes;
use std::collections::HashMap;
use std::sync::Arc;
use uuid::Uuid;

use crate::error::Result;

#[cfg(test)]
use mockall::automock;

/// Opaque, stable identifier of a remote peripheral.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct RemoteAddress(String);

impl RemoteAddress {
    /// Create an address from its string form.
    pub fn new(address: impl Into<String>) -> Self {
        Self(address.into())
    }

    /// Get the string form.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for RemoteAddress {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for RemoteAddress {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

impl From<String> for RemoteAddress {
    fn from(value: String) -> Self {
        Self(value)
    }
}

impl From<&RemoteAddress> for RemoteAddress {
    fn from(value: &RemoteAddress) -> Self {
        value.clone()
    }
}

/// Status code attached to driver completions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct GattStatus(pub i32);

impl GattStatus {
    /// The operation completed successfully.
    pub const SUCCESS: GattStatus = GattStatus(0);
    /// Generic failure reported by the driver.
    pub const FAILURE: GattStatus = GattStatus(0x101);

    /// Check if the status denotes success.
    pub fn is_success(&self) -> bool {
        *self == Self::SUCCESS
    }
}

impl std::fmt::Display for GattStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Link state as reported by the driver.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LinkState {
    /// No link.
    Disconnected,
    /// Link being established.
    Connecting,
    /// Link established.
    Connected,
    /// Link being torn down.
    Disconnecting,
}

impl std::fmt::Display for LinkState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Disconnected => write!(f, "STATE_DISCONNECTED"),
            Self::Connecting => write!(f, "STATE_CONNECTING"),
            Self::Connected => write!(f, "STATE_CONNECTED"),
            Self::Disconnecting => write!(f, "STATE_DISCONNECTING"),
        }
    }
}

/// A characteristic as reported by service discovery.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GattCharacteristic {
    /// Characteristic UUID.
    pub uuid: Uuid,
    /// Property bits.
    pub properties: CharPropFlags,
    /// UUIDs of the characteristic's descriptors.
    pub descriptors: Vec<Uuid>,
}

/// A service as reported by service discovery.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GattService {
    /// Service UUID.
    pub uuid: Uuid,
    /// Characteristics belonging to the service.
    pub characteristics: Vec<GattCharacteristic>,
}

/// An addressable characteristic of a connected peripheral.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Endpoint {
    /// Owning service.
    pub service: Uuid,
    /// Characteristic.
    pub characteristic: Uuid,
    /// Property bits the characteristic advertised.
    pub properties: CharPropFlags,
    /// Write mode used when writing to this endpoint.
    pub write_type: WriteType,
}

impl Endpoint {
    /// Build an endpoint from a discovered characteristic.
    pub fn new(service: Uuid, characteristic: &GattCharacteristic) -> Self {
        Self {
            service,
            characteristic: characteristic.uuid,
            properties: characteristic.properties,
            write_type: WriteType::WithoutResponse,
        }
    }

    /// Check for the READ property.
    pub fn is_readable(&self) -> bool {
        self.properties.contains(CharPropFlags::READ)
    }

    /// Check for the NOTIFY property.
    pub fn is_notifiable(&self) -> bool {
        self.properties.contains(CharPropFlags::NOTIFY)
    }

    /// Check for the WRITE property.
    pub fn is_writable(&self) -> bool {
        self.properties.contains(CharPropFlags::WRITE)
    }
}

/// An event reported by the driver for one connection.
#[derive(Debug, Clone)]
pub enum GattEvent {
    /// The link state changed.
    ConnectionStateChanged {
        /// Completion status.
        status: GattStatus,
        /// The new link state.
        state: LinkState,
    },
    /// Service discovery finished.
    ServicesDiscovered {
        /// Completion status.
        status: GattStatus,
        /// Discovered topology (empty on failure).
        services: Vec<GattService>,
    },
    /// A characteristic read completed.
    CharacteristicRead {
        /// Completion status.
        status: GattStatus,
        /// The characteristic that was read.
        characteristic: Uuid,
        /// The value read.
        value: Bytes,
    },
    /// The peripheral pushed a notification.
    CharacteristicChanged {
        /// The notifying characteristic.
        characteristic: Uuid,
        /// The pushed value.
        value: Bytes,
    },
    /// A characteristic write completed.
    CharacteristicWrite {
        /// Completion status.
        status: GattStatus,
        /// The characteristic written.
        characteristic: Uuid,
        /// The value written.
        value: Bytes,
    },
    /// A descriptor read completed.
    DescriptorRead {
        /// Completion status.
        status: GattStatus,
        /// The descriptor read.
        descriptor: Uuid,
        /// The value read.
        value: Bytes,
    },
    /// A descriptor write completed.
    DescriptorWrite {
        /// Completion status.
        status: GattStatus,
        /// The descriptor written.
        descriptor: Uuid,
        /// The value written.
        value: Bytes,
    },
    /// A remote RSSI read completed.
    ReadRemoteRssi {
        /// Completion status.
        status: GattStatus,
        /// Signal strength in dBm.
        rssi: i16,
    },
    /// The ATT MTU changed.
    MtuChanged {
        /// Completion status.
        status: GattStatus,
        /// New MTU.
        mtu: u16,
    },
    /// The PHY was read.
    PhyRead {
        /// Completion status.
        status: GattStatus,
        /// Transmitter PHY.
        tx_phy: u8,
        /// Receiver PHY.
        rx_phy: u8,
    },
    /// The PHY was updated.
    PhyUpdate {
        /// Completion status.
        status: GattStatus,
        /// Transmitter PHY.
        tx_phy: u8,
        /// Receiver PHY.
        rx_phy: u8,
    },
    /// A reliable write transaction completed.
    ReliableWriteCompleted {
        /// Completion status.
        status: GattStatus,
    },
}

impl GattEvent {
    /// Name of the driver callback this event corresponds to.
    pub fn tag(&self) -> &'static str {
        match self {
            Self::ConnectionStateChanged { .. } => "onConnectionStateChange",
            Self::ServicesDiscovered { .. } => "onServicesDiscovered",
            Self::CharacteristicRead { .. } => "onCharacteristicRead",
            Self::CharacteristicChanged { .. } => "onCharacteristicChanged",
            Self::CharacteristicWrite { .. } => "onCharacteristicWrite",
            Self::DescriptorRead { .. } => "onDescriptorRead",
            Self::DescriptorWrite { .. } => "onDescriptorWrite",
            Self::ReadRemoteRssi { .. } => "onReadRemoteRssi",
            Self::MtuChanged { .. } => "onMtuChanged",
            Self::PhyRead { .. } => "onPhyRead",
            Self::PhyUpdate { .. } => "onPhyUpdate",
            Self::ReliableWriteCompleted { .. } => "onReliableWriteCompleted",
        }
    }

    /// Completion status, if the event carries one.
    pub fn status(&self) -> Option<GattStatus> {
        match self {
            Self::CharacteristicChanged { .. } => None,
            Self::ConnectionStateChanged { status, .. }
            | Self::ServicesDiscovered { status, .. }
            | Self::CharacteristicRead { status, .. }
            | Self::CharacteristicWrite { status, .. }
            | Self::DescriptorRead { status, .. }
            | Self::DescriptorWrite { status, .. }
            | Self::ReadRemoteRssi { status, .. }
            | Self::MtuChanged { status, .. }
            | Self::PhyRead { status, .. }
            | Self::PhyUpdate { status, .. }
            | Self::ReliableWriteCompleted { status } => Some(*status),
        }
    }
}

/// Something discovered during a scan.
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct DiscoveryEvent {
    /// Address of the advertiser.
    pub address: RemoteAddress,
    /// Advertised local name.
    pub local_name: Option<String>,
    /// Signal strength in dBm.
    pub rssi: Option<i16>,
    /// Manufacturer data keyed by company id.
    pub manufacturer_data: HashMap<u16, Vec<u8>>,
    /// Advertised service UUIDs.
    pub services: Vec<Uuid>,
}

impl DiscoveryEvent {
    /// Create an event carrying only an address.
    pub fn new(address: impl Into<RemoteAddress>) -> Self {
        Self {
            address: address.into(),
            local_name: None,
            rssi: None,
            manufacturer_data: HashMap::new(),
            services: Vec::new(),
        }
    }
}

/// An event reported by the driver during a scan.
#[derive(Debug, Clone)]
pub enum ScanEvent {
    /// A single advertisement.
    Result(DiscoveryEvent),
    /// Several advertisements reported together.
    Batch(Vec<DiscoveryEvent>),
    /// The scan could not be started or was aborted by the platform.
    Failed {
        /// Platform error code.
        code: i32,
    },
}

/// Receives connection events from the driver.
pub trait GattEventHandler: Send + Sync {
    /// Handle one event. Must not block.
    fn on_gatt_event(&self, event: GattEvent);
}

/// Receives scan events from the driver.
pub trait ScanEventHandler: Send + Sync {
    /// Handle one event. Must not block.
    fn on_scan_event(&self, event: ScanEvent);
}

/// A live link to one peripheral owned by the driver.
#[cfg_attr(test, automock)]
pub trait GattHandle: Send + Sync {
    /// Re-establish the link using this same handle.
    fn reconnect(&self) -> bool;

    /// Request the link to be torn down. The handle stays usable.
    fn disconnect(&self);

    /// Release the handle and every resource behind it.
    fn close(&self);

    /// Request service discovery.
    fn discover_services(&self) -> bool;

    /// Request a characteristic write. `true` means accepted, not delivered.
    fn write_characteristic(&self, endpoint: &Endpoint, value: &[u8], write_type: WriteType)
        -> bool;

    /// Enable or disable local delivery of notifications.
    fn set_characteristic_notification(&self, endpoint: &Endpoint, enabled: bool) -> Result<()>;

    /// Request a descriptor write.
    fn write_descriptor(&self, endpoint: &Endpoint, descriptor: Uuid, value: &[u8]) -> Result<()>;

    /// Request a remote RSSI read.
    fn read_remote_rssi(&self) -> bool;
}

/// Scan and connection control of the radio driver.
#[cfg_attr(test, automock)]
pub trait Transport: Send + Sync {
    /// Start scanning, delivering results to `handler`.
    fn start_scan(&self, filter: ScanFilter, handler: Arc<dyn ScanEventHandler>) -> Result<()>;

    /// Stop the current scan, if any.
    fn stop_scan(&self);

    /// Create a handle for `address` and start connecting.
    fn connect(
        &self,
        address: &RemoteAddress,
        auto_reconnect: bool,
        handler: Arc<dyn GattEventHandler>,
    ) -> Result<Arc<dyn GattHandle>>;
}
