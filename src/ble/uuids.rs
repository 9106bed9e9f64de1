//! Well-known GATT UUIDs and descriptor values.

use uuid::Uuid;

/// Build a UUID from a 16-bit SIG-assigned number using the Bluetooth base UUID.
pub const fn uuid_from_u16(short: u16) -> Uuid {
    Uuid::from_u128(0x0000_0000_0000_1000_8000_00805f9b34fb | ((short as u128) << 96))
}

/// Client Characteristic Configuration descriptor UUID (0x2902).
pub const CLIENT_CHARACTERISTIC_CONFIG_UUID: Uuid =
    Uuid::from_u128(0x0000_2902_0000_1000_8000_00805f9b34fb);

/// CCCD value enabling notifications.
pub const ENABLE_NOTIFICATION_VALUE: [u8; 2] = [0x01, 0x00];

// Nordic UART Service, the most common request/response channel on hobby peripherals
/// Nordic UART Service UUID.
pub const NUS_SERVICE_UUID: Uuid = Uuid::from_u128(0x6e40_0001_b5a3_f393_e0a9_e50e24dcca9e);
/// NUS RX characteristic UUID (write to peripheral).
pub const NUS_RX_UUID: Uuid = Uuid::from_u128(0x6e40_0002_b5a3_f393_e0a9_e50e24dcca9e);
/// NUS TX characteristic UUID (notifications from peripheral).
pub const NUS_TX_UUID: Uuid = Uuid::from_u128(0x6e40_0003_b5a3_f393_e0a9_e50e24dcca9e);

/// Check if a descriptor UUID is the client characteristic configuration descriptor.
pub fn is_cccd(uuid: &Uuid) -> bool {
    *uuid == CLIENT_CHARACTERISTIC_CONFIG_UUID
}
