//! Discovery and link backend seam.
//!
//! The session manager never touches a radio directly. Everything it
//! needs from the platform goes through [`BleBackend`], so the same state
//! machine runs over `btleplug` on a desktop host or over an in-memory
//! fake in tests.

use async_trait::async_trait;
use futures::stream::BoxStream;
use uuid::Uuid;

use crate::data::PeripheralHandle;
use crate::error::Result;

/// Power state of the local Bluetooth adapter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum AdapterState {
    /// State not reported yet.
    #[default]
    Unknown,
    /// Adapter is on and usable.
    PoweredOn,
    /// Adapter is off.
    PoweredOff,
}

impl AdapterState {
    /// Check if the adapter is powered on.
    pub fn is_powered_on(&self) -> bool {
        matches!(self, Self::PoweredOn)
    }
}

/// A service and the characteristics found under it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServiceDescriptor {
    /// Service UUID.
    pub uuid: Uuid,
    /// Characteristic UUIDs within the service.
    pub characteristics: Vec<Uuid>,
}

impl ServiceDescriptor {
    /// Check if the service exposes a characteristic.
    pub fn has_characteristic(&self, uuid: &Uuid) -> bool {
        self.characteristics.contains(uuid)
    }
}

/// One item of a characteristic monitor stream.
///
/// `Ok(Some(value))` carries a base64-encoded payload, `Ok(None)` is a
/// notification without a value and `Err` is a per-notification error
/// reported by the platform. None of these end the stream.
pub type RawNotification = Result<Option<String>>;

/// Stream of discovered peripherals.
pub type DiscoveryStream = BoxStream<'static, PeripheralHandle>;

/// Stream of raw characteristic notifications.
pub type NotificationStream = BoxStream<'static, RawNotification>;

/// Stream of adapter power state changes.
pub type AdapterStateStream = BoxStream<'static, AdapterState>;

/// Platform discovery and link operations.
///
/// Characteristic values cross this boundary in the transport-safe
/// (base64) form produced by [`crate::protocol::encode`].
#[async_trait]
pub trait BleBackend: Send + Sync {
    /// Begin scanning. Each call returns a fresh stream; a previous
    /// stream may end or go quiet once a new one is started.
    async fn start_discovery(&self) -> Result<DiscoveryStream>;

    /// Stop scanning. Stopping while idle is not an error.
    async fn stop_discovery(&self) -> Result<()>;

    /// Stream of adapter power state changes.
    async fn adapter_states(&self) -> Result<AdapterStateStream>;

    /// Establish a link to the peripheral.
    async fn connect(&self, identifier: &str) -> Result<()>;

    /// Tear down the link to the peripheral.
    async fn disconnect(&self, identifier: &str) -> Result<()>;

    /// Discover all services and characteristics on a connected peripheral.
    async fn discover_services(&self, identifier: &str) -> Result<Vec<ServiceDescriptor>>;

    /// Enable notifications on a characteristic and stream them.
    async fn monitor(
        &self,
        identifier: &str,
        service: Uuid,
        characteristic: Uuid,
    ) -> Result<NotificationStream>;

    /// Disable notifications on a characteristic.
    async fn stop_monitor(&self, identifier: &str, service: Uuid, characteristic: Uuid)
        -> Result<()>;

    /// Write an encoded value and wait for the acknowledgement.
    async fn write_with_response(
        &self,
        identifier: &str,
        service: Uuid,
        characteristic: Uuid,
        value: &str,
    ) -> Result<()>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_adapter_state() {
        assert!(AdapterState::PoweredOn.is_powered_on());
        assert!(!AdapterState::PoweredOff.is_powered_on());
        assert!(!AdapterState::default().is_powered_on());
    }

    #[test]
    fn test_service_descriptor() {
        let service = ServiceDescriptor {
            uuid: Uuid::from_u128(1),
            characteristics: vec![Uuid::from_u128(2)],
        };
        assert!(service.has_characteristic(&Uuid::from_u128(2)));
        assert!(!service.has_characteristic(&Uuid::from_u128(3)));
    }
}
