//! In-memory backend.
//!
//! Scripts discovery, notifications and failures without a radio, and
//! records every link call so tests (and UI work without hardware) can
//! observe what the session did.

use async_trait::async_trait;
use futures::channel::mpsc::{unbounded, UnboundedSender};
use futures::stream::StreamExt;
use parking_lot::Mutex;
use std::collections::HashSet;
use std::time::Duration;
use tracing::debug;
use uuid::Uuid;

use crate::ble::backend::{
    AdapterState, AdapterStateStream, BleBackend, DiscoveryStream, NotificationStream,
    RawNotification, ServiceDescriptor,
};
use crate::ble::uuids::{SESSION_CHARACTERISTIC_UUID, SESSION_SERVICE_UUID};
use crate::data::PeripheralHandle;
use crate::error::{Error, Result};

/// A link call observed by the [`MockBackend`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BackendCall {
    /// `start_discovery`.
    StartDiscovery,
    /// `stop_discovery`.
    StopDiscovery,
    /// `connect(identifier)`.
    Connect(String),
    /// `disconnect(identifier)`.
    Disconnect(String),
    /// `discover_services(identifier)`.
    DiscoverServices(String),
    /// `monitor(identifier, service, characteristic)`.
    Monitor {
        /// Peripheral identifier.
        identifier: String,
        /// Service UUID.
        service: Uuid,
        /// Characteristic UUID.
        characteristic: Uuid,
    },
    /// `stop_monitor(identifier, service, characteristic)`.
    StopMonitor {
        /// Peripheral identifier.
        identifier: String,
        /// Service UUID.
        service: Uuid,
        /// Characteristic UUID.
        characteristic: Uuid,
    },
    /// `write_with_response(identifier, service, characteristic, value)`.
    Write {
        /// Peripheral identifier.
        identifier: String,
        /// Service UUID.
        service: Uuid,
        /// Characteristic UUID.
        characteristic: Uuid,
        /// Encoded value.
        value: String,
    },
}

struct MockState {
    calls: Vec<BackendCall>,
    services: Vec<ServiceDescriptor>,
    discovery_failure: Option<String>,
    connect_failure: Option<String>,
    service_discovery_failure: Option<String>,
    write_failure: Option<String>,
    connect_delay: Option<Duration>,
    discovery_delay: Option<Duration>,
    write_delay: Option<Duration>,
    connected: HashSet<String>,
    discovery_tx: Option<UnboundedSender<PeripheralHandle>>,
    notification_tx: Option<UnboundedSender<RawNotification>>,
    adapter_state: AdapterState,
    adapter_txs: Vec<UnboundedSender<AdapterState>>,
}

/// In-memory [`BleBackend`].
pub struct MockBackend {
    state: Mutex<MockState>,
}

impl MockBackend {
    /// Create a backend whose peripherals expose the session service.
    pub fn new() -> Self {
        Self {
            state: Mutex::new(MockState {
                calls: Vec::new(),
                services: vec![ServiceDescriptor {
                    uuid: SESSION_SERVICE_UUID,
                    characteristics: vec![SESSION_CHARACTERISTIC_UUID],
                }],
                discovery_failure: None,
                connect_failure: None,
                service_discovery_failure: None,
                write_failure: None,
                connect_delay: None,
                discovery_delay: None,
                write_delay: None,
                connected: HashSet::new(),
                discovery_tx: None,
                notification_tx: None,
                adapter_state: AdapterState::PoweredOn,
                adapter_txs: Vec::new(),
            }),
        }
    }

    /// Replace the services reported by `discover_services`.
    pub fn set_services(&self, services: Vec<ServiceDescriptor>) {
        self.state.lock().services = services;
    }

    /// Make every `start_discovery` fail with the given reason.
    pub fn fail_discovery(&self, reason: impl Into<String>) {
        self.state.lock().discovery_failure = Some(reason.into());
    }

    /// Make every `connect` fail with the given reason.
    pub fn fail_connect(&self, reason: impl Into<String>) {
        self.state.lock().connect_failure = Some(reason.into());
    }

    /// Make every `discover_services` fail with the given reason.
    pub fn fail_service_discovery(&self, reason: impl Into<String>) {
        self.state.lock().service_discovery_failure = Some(reason.into());
    }

    /// Make every write fail with the given reason.
    pub fn fail_writes(&self, reason: impl Into<String>) {
        self.state.lock().write_failure = Some(reason.into());
    }

    /// Delay each `connect` by the given duration.
    pub fn set_connect_delay(&self, delay: Duration) {
        self.state.lock().connect_delay = Some(delay);
    }

    /// Delay each `discover_services` by the given duration.
    ///
    /// The link is checked after the delay, so a disconnect in the
    /// meantime fails the discovery.
    pub fn set_discovery_delay(&self, delay: Duration) {
        self.state.lock().discovery_delay = Some(delay);
    }

    /// Delay each write by the given duration.
    pub fn set_write_delay(&self, delay: Duration) {
        self.state.lock().write_delay = Some(delay);
    }

    /// Feed a discovery event into the current scan.
    ///
    /// Returns `false` if no scan is running.
    pub fn emit_discovery(&self, handle: PeripheralHandle) -> bool {
        match &self.state.lock().discovery_tx {
            Some(tx) => tx.unbounded_send(handle).is_ok(),
            None => false,
        }
    }

    /// Feed a notification into the active monitor.
    ///
    /// Returns `false` if nothing is monitored.
    pub fn emit_notification(&self, notification: RawNotification) -> bool {
        match &self.state.lock().notification_tx {
            Some(tx) => tx.unbounded_send(notification).is_ok(),
            None => false,
        }
    }

    /// Change the adapter power state and notify listeners.
    pub fn set_adapter_state(&self, adapter_state: AdapterState) {
        let mut state = self.state.lock();
        state.adapter_state = adapter_state;
        state
            .adapter_txs
            .retain(|tx| tx.unbounded_send(adapter_state).is_ok());
    }

    /// All calls observed so far, in order.
    pub fn calls(&self) -> Vec<BackendCall> {
        self.state.lock().calls.clone()
    }

    /// Encoded values of all writes observed so far.
    pub fn writes(&self) -> Vec<String> {
        self.state
            .lock()
            .calls
            .iter()
            .filter_map(|call| match call {
                BackendCall::Write { value, .. } => Some(value.clone()),
                _ => None,
            })
            .collect()
    }

    /// Number of times a call matching the predicate was observed.
    pub fn count_calls(&self, predicate: impl Fn(&BackendCall) -> bool) -> usize {
        self.state.lock().calls.iter().filter(|c| predicate(c)).count()
    }

    /// Check if the link to a peripheral is up.
    pub fn is_connected(&self, identifier: &str) -> bool {
        self.state.lock().connected.contains(identifier)
    }

    /// Check if a scan is running.
    pub fn is_discovering(&self) -> bool {
        self.state.lock().discovery_tx.is_some()
    }

    /// Check if a characteristic monitor is active.
    pub fn is_monitoring(&self) -> bool {
        self.state.lock().notification_tx.is_some()
    }

    fn record(&self, call: BackendCall) {
        debug!("Mock backend call: {:?}", call);
        self.state.lock().calls.push(call);
    }

    fn ensure_connected(&self, identifier: &str) -> Result<()> {
        if self.is_connected(identifier) {
            Ok(())
        } else {
            Err(Error::NoActiveConnection)
        }
    }
}

impl Default for MockBackend {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl BleBackend for MockBackend {
    async fn start_discovery(&self) -> Result<DiscoveryStream> {
        self.record(BackendCall::StartDiscovery);

        if let Some(reason) = self.state.lock().discovery_failure.clone() {
            return Err(Error::DiscoveryFailed { reason });
        }

        let (tx, rx) = unbounded();
        self.state.lock().discovery_tx = Some(tx);

        Ok(rx.boxed())
    }

    async fn stop_discovery(&self) -> Result<()> {
        self.record(BackendCall::StopDiscovery);
        self.state.lock().discovery_tx = None;
        Ok(())
    }

    async fn adapter_states(&self) -> Result<AdapterStateStream> {
        let (tx, rx) = unbounded();
        {
            let mut state = self.state.lock();
            let _ = tx.unbounded_send(state.adapter_state);
            state.adapter_txs.push(tx);
        }
        Ok(rx.boxed())
    }

    async fn connect(&self, identifier: &str) -> Result<()> {
        self.record(BackendCall::Connect(identifier.to_string()));

        let (delay, failure) = {
            let state = self.state.lock();
            (state.connect_delay, state.connect_failure.clone())
        };

        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }

        if let Some(reason) = failure {
            return Err(Error::connection_failed(reason));
        }

        self.state.lock().connected.insert(identifier.to_string());
        Ok(())
    }

    async fn disconnect(&self, identifier: &str) -> Result<()> {
        self.record(BackendCall::Disconnect(identifier.to_string()));

        let mut state = self.state.lock();
        state.connected.remove(identifier);
        state.notification_tx = None;
        Ok(())
    }

    async fn discover_services(&self, identifier: &str) -> Result<Vec<ServiceDescriptor>> {
        self.record(BackendCall::DiscoverServices(identifier.to_string()));

        let delay = self.state.lock().discovery_delay;
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        self.ensure_connected(identifier)?;

        let state = self.state.lock();
        if let Some(reason) = &state.service_discovery_failure {
            return Err(Error::ServiceDiscoveryFailed {
                reason: reason.clone(),
            });
        }
        Ok(state.services.clone())
    }

    async fn monitor(
        &self,
        identifier: &str,
        service: Uuid,
        characteristic: Uuid,
    ) -> Result<NotificationStream> {
        self.record(BackendCall::Monitor {
            identifier: identifier.to_string(),
            service,
            characteristic,
        });
        self.ensure_connected(identifier)?;

        let (tx, rx) = unbounded();
        self.state.lock().notification_tx = Some(tx);

        Ok(rx.boxed())
    }

    async fn stop_monitor(
        &self,
        identifier: &str,
        service: Uuid,
        characteristic: Uuid,
    ) -> Result<()> {
        self.record(BackendCall::StopMonitor {
            identifier: identifier.to_string(),
            service,
            characteristic,
        });
        self.state.lock().notification_tx = None;
        Ok(())
    }

    async fn write_with_response(
        &self,
        identifier: &str,
        service: Uuid,
        characteristic: Uuid,
        value: &str,
    ) -> Result<()> {
        self.record(BackendCall::Write {
            identifier: identifier.to_string(),
            service,
            characteristic,
            value: value.to_string(),
        });

        let delay = self.state.lock().write_delay;
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        self.ensure_connected(identifier)?;

        if let Some(reason) = self.state.lock().write_failure.clone() {
            return Err(Error::WriteFailed { reason });
        }
        Ok(())
    }
}
