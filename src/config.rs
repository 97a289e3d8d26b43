//! Session configuration.

use std::time::Duration;
use uuid::Uuid;

#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

use crate::ble::uuids::{SESSION_CHARACTERISTIC_UUID, SESSION_SERVICE_UUID};

/// What to do when `connect` is called while a session is busy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub enum ConnectionPolicy {
    /// Refuse with `AlreadyConnected` while connecting, discovering or ready.
    #[default]
    RejectWhileBusy,
    /// Tear down the current connection, then connect to the new device.
    Supersede,
}

/// Tunables for a [`SessionFacade`](crate::SessionFacade).
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct SessionConfig {
    /// Service carrying the data characteristic.
    pub service_uuid: Uuid,
    /// Characteristic used for both notifications and writes.
    pub characteristic_uuid: Uuid,
    /// Upper bound on establishing the link.
    pub connect_timeout: Duration,
    /// Upper bound on service and characteristic discovery.
    pub discovery_timeout: Duration,
    /// Upper bound on a write-with-response acknowledgement.
    pub write_timeout: Duration,
    /// Behaviour of `connect` while another connection is active.
    pub connection_policy: ConnectionPolicy,
    /// Capacity of each broadcast event channel.
    pub event_capacity: usize,
}

impl SessionConfig {
    /// Default link establishment timeout (10 seconds).
    pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(10);
    /// Default service discovery timeout (10 seconds).
    pub const DEFAULT_DISCOVERY_TIMEOUT: Duration = Duration::from_secs(10);
    /// Default write acknowledgement timeout (5 seconds).
    pub const DEFAULT_WRITE_TIMEOUT: Duration = Duration::from_secs(5);

    /// Use a different service/characteristic pair.
    pub fn with_addresses(mut self, service_uuid: Uuid, characteristic_uuid: Uuid) -> Self {
        self.service_uuid = service_uuid;
        self.characteristic_uuid = characteristic_uuid;
        self
    }

    /// Set the connect timeout.
    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    /// Set the service discovery timeout.
    pub fn with_discovery_timeout(mut self, timeout: Duration) -> Self {
        self.discovery_timeout = timeout;
        self
    }

    /// Set the write timeout.
    pub fn with_write_timeout(mut self, timeout: Duration) -> Self {
        self.write_timeout = timeout;
        self
    }

    /// Set the concurrent-connect policy.
    pub fn with_connection_policy(mut self, policy: ConnectionPolicy) -> Self {
        self.connection_policy = policy;
        self
    }

    /// Set the broadcast channel capacity (minimum 1).
    pub fn with_event_capacity(mut self, capacity: usize) -> Self {
        self.event_capacity = capacity.max(1);
        self
    }
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            service_uuid: SESSION_SERVICE_UUID,
            characteristic_uuid: SESSION_CHARACTERISTIC_UUID,
            connect_timeout: Self::DEFAULT_CONNECT_TIMEOUT,
            discovery_timeout: Self::DEFAULT_DISCOVERY_TIMEOUT,
            write_timeout: Self::DEFAULT_WRITE_TIMEOUT,
            connection_policy: ConnectionPolicy::default(),
            event_capacity: 64,
        }
    }
}
