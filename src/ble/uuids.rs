//! BLE Service and Characteristic UUIDs.
//!
//! The session talks to one service/characteristic pair, used both for
//! inbound notifications and outbound writes.

use uuid::Uuid;

/// Bluetooth SIG base UUID (`0000xxxx-0000-1000-8000-00805f9b34fb`).
const BLUETOOTH_BASE_UUID: u128 = 0x0000_0000_0000_1000_8000_00805f9b34fb;

/// Session service UUID (Heart Rate service slot, 0x180D).
pub const SESSION_SERVICE_UUID: Uuid = uuid_from_u16(0x180d);

/// Session characteristic UUID (Heart Rate Measurement slot, 0x2A37).
/// Notify for inbound data, write-with-response for outbound.
pub const SESSION_CHARACTERISTIC_UUID: Uuid = uuid_from_u16(0x2a37);

/// Expand a 16-bit assigned number into a full 128-bit UUID.
pub const fn uuid_from_u16(short: u16) -> Uuid {
    Uuid::from_u128(BLUETOOTH_BASE_UUID | ((short as u128) << 96))
}
