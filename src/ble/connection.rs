//! BLE connection management.
//!
//! Owns the lifecycle of at most one active connection: link
//! establishment, service discovery, and teardown.

use parking_lot::RwLock;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::ble::backend::{BleBackend, ServiceDescriptor};
use crate::config::{ConnectionPolicy, SessionConfig};
use crate::data::PeripheralHandle;
use crate::error::{Error, Result};

/// Session connection state.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Default)]
pub enum ConnectionState {
    /// Nothing in progress.
    #[default]
    Idle,
    /// Discovery is running and no device is connected.
    Scanning,
    /// Establishing the link.
    Connecting,
    /// Link is up, discovering services and characteristics.
    Discovering,
    /// Link is up and the data characteristic is usable.
    Ready,
    /// The link was torn down.
    Disconnected,
    /// The last connection attempt failed.
    Failed(String),
}

impl ConnectionState {
    /// Check if the session is ready for data.
    pub fn is_ready(&self) -> bool {
        matches!(self, Self::Ready)
    }

    /// Check if a connection is active or being established.
    pub fn is_busy(&self) -> bool {
        matches!(self, Self::Connecting | Self::Discovering | Self::Ready)
    }

    /// Check if in a transitional state.
    pub fn is_transitioning(&self) -> bool {
        matches!(self, Self::Connecting | Self::Discovering)
    }
}

impl std::fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Idle => write!(f, "Idle"),
            Self::Scanning => write!(f, "Scanning"),
            Self::Connecting => write!(f, "Connecting"),
            Self::Discovering => write!(f, "Discovering"),
            Self::Ready => write!(f, "Ready"),
            Self::Disconnected => write!(f, "Disconnected"),
            Self::Failed(reason) => write!(f, "Failed: {}", reason),
        }
    }
}

/// Event for connection state changes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionEvent {
    /// The peripheral the transition concerns, if any.
    pub peripheral: Option<PeripheralHandle>,
    /// The new connection state.
    pub state: ConnectionState,
}

struct Inner {
    state: ConnectionState,
    /// Set exactly while `Connecting`, `Discovering` or `Ready`.
    active: Option<PeripheralHandle>,
}

/// Manages the single session connection.
pub struct ConnectionManager {
    /// Link backend.
    backend: Arc<dyn BleBackend>,
    /// Current state and active peripheral.
    inner: RwLock<Inner>,
    /// Incremented on every connect and teardown; stale attempts bail out.
    attempt: AtomicU64,
    /// Channel for connection events.
    event_tx: broadcast::Sender<ConnectionEvent>,
    connect_timeout: Duration,
    discovery_timeout: Duration,
    policy: ConnectionPolicy,
    service_uuid: Uuid,
    characteristic_uuid: Uuid,
}

impl ConnectionManager {
    /// Create a connection manager.
    pub fn new(backend: Arc<dyn BleBackend>, config: &SessionConfig) -> Self {
        let (event_tx, _) = broadcast::channel(config.event_capacity.max(1));

        Self {
            backend,
            inner: RwLock::new(Inner {
                state: ConnectionState::Idle,
                active: None,
            }),
            attempt: AtomicU64::new(0),
            event_tx,
            connect_timeout: config.connect_timeout,
            discovery_timeout: config.discovery_timeout,
            policy: config.connection_policy,
            service_uuid: config.service_uuid,
            characteristic_uuid: config.characteristic_uuid,
        }
    }

    /// Get the current connection state.
    pub fn state(&self) -> ConnectionState {
        self.inner.read().state.clone()
    }

    /// Check if ready for data.
    pub fn is_ready(&self) -> bool {
        self.inner.read().state.is_ready()
    }

    /// The peripheral in the `Ready` state, if any.
    pub fn connected_device(&self) -> Option<PeripheralHandle> {
        let inner = self.inner.read();
        match inner.state {
            ConnectionState::Ready => inner.active.clone(),
            _ => None,
        }
    }

    /// The peripheral being connected or connected, if any.
    pub fn active_peripheral(&self) -> Option<PeripheralHandle> {
        self.inner.read().active.clone()
    }

    /// Subscribe to connection events.
    pub fn subscribe(&self) -> broadcast::Receiver<ConnectionEvent> {
        self.event_tx.subscribe()
    }

    /// Reflect discovery activity while no device is connected.
    pub fn set_scanning(&self, scanning: bool) {
        let state = self.state();

        match (scanning, state) {
            (
                true,
                ConnectionState::Idle | ConnectionState::Disconnected | ConnectionState::Failed(_),
            ) => self.set_state(ConnectionState::Scanning, None),
            (false, ConnectionState::Scanning) => self.set_state(ConnectionState::Idle, None),
            _ => {}
        }
    }

    /// Connect to a peripheral and discover its services.
    ///
    /// The connection is only usable once this returns; on any failure
    /// the state goes through `Failed(reason)` back to `Idle`. Nothing is
    /// retried.
    ///
    /// # Errors
    ///
    /// - [`Error::AlreadyConnected`] if busy and the policy rejects.
    /// - [`Error::ConnectionFailed`] or [`Error::Timeout`] if the link fails.
    /// - [`Error::ServiceDiscoveryFailed`] if the data characteristic is missing.
    /// - [`Error::Cancelled`] if disconnected while connecting.
    pub async fn connect(&self, peripheral: &PeripheralHandle) -> Result<Vec<ServiceDescriptor>> {
        let busy_with = {
            let inner = self.inner.read();
            if inner.state.is_busy() {
                inner.active.clone()
            } else {
                None
            }
        };

        if let Some(current) = busy_with {
            match self.policy {
                ConnectionPolicy::RejectWhileBusy => {
                    warn!(
                        "Rejecting connect to {}: session busy with {}",
                        peripheral, current
                    );
                    return Err(Error::AlreadyConnected {
                        identifier: current.identifier,
                    });
                }
                ConnectionPolicy::Supersede => {
                    info!("Superseding connection to {} with {}", current, peripheral);
                    self.disconnect().await;
                }
            }
        }

        let attempt = self.attempt.fetch_add(1, Ordering::SeqCst) + 1;
        let identifier = peripheral.identifier.as_str();

        info!("Connecting to {}", peripheral);
        self.set_state(ConnectionState::Connecting, Some(peripheral.clone()));

        let linked = match tokio::time::timeout(
            self.connect_timeout,
            self.backend.connect(identifier),
        )
        .await
        {
            Ok(Ok(())) => Ok(()),
            Ok(Err(e @ Error::ConnectionFailed { .. })) => Err(e),
            Ok(Err(e)) => Err(Error::connection_failed(e.to_string())),
            Err(_) => Err(Error::timeout("connect")),
        };

        if let Err(e) = linked {
            // The link may come up after a timeout; make sure it does not linger.
            let link_may_be_up = matches!(e, Error::Timeout { .. });
            return Err(self.fail(attempt, peripheral, e, link_may_be_up).await);
        }

        self.ensure_current(attempt, identifier).await?;
        debug!("Link established with {}", identifier);
        self.set_state(ConnectionState::Discovering, Some(peripheral.clone()));

        let discovered = match tokio::time::timeout(
            self.discovery_timeout,
            self.backend.discover_services(identifier),
        )
        .await
        {
            Ok(Ok(services)) => self.check_services(services),
            Ok(Err(e @ Error::ServiceDiscoveryFailed { .. })) => Err(e),
            Ok(Err(e)) => Err(Error::ServiceDiscoveryFailed {
                reason: e.to_string(),
            }),
            Err(_) => Err(Error::timeout("service discovery")),
        };

        let services = match discovered {
            Ok(services) => services,
            Err(e) => return Err(self.fail(attempt, peripheral, e, true).await),
        };

        self.ensure_current(attempt, identifier).await?;
        self.set_state(ConnectionState::Ready, Some(peripheral.clone()));
        info!("Connected to {}", peripheral);

        Ok(services)
    }

    /// Tear down the active connection, or cancel one in progress.
    ///
    /// Returns the peripheral that was released, or `None` if nothing was
    /// connected. Backend errors during teardown are logged; the session
    /// always ends up `Idle`.
    pub async fn disconnect(&self) -> Option<PeripheralHandle> {
        let (previous, active) = {
            let inner = self.inner.read();
            (inner.state.clone(), inner.active.clone())
        };

        let Some(active) = active else {
            debug!("No Device Connected");
            return None;
        };

        self.attempt.fetch_add(1, Ordering::SeqCst);

        if previous.is_transitioning() {
            info!("Cancelling connection to {}", active);
        } else {
            info!("Disconnecting from {}", active);
            self.set_state(ConnectionState::Disconnected, None);
        }

        if let Err(e) = self.backend.disconnect(&active.identifier).await {
            warn!("Failed to disconnect from {}: {}", active, e);
        }

        self.set_state(ConnectionState::Idle, None);
        Some(active)
    }

    /// Tear down after the link to `peripheral` dropped on its own.
    ///
    /// Does nothing unless `peripheral` is the `Ready` device. Returns
    /// whether the session was torn down.
    pub async fn handle_link_lost(&self, peripheral: &PeripheralHandle) -> bool {
        let current = {
            let inner = self.inner.read();
            inner.state.is_ready() && inner.active.as_ref() == Some(peripheral)
        };

        if !current {
            return false;
        }

        warn!("Link to {} lost", peripheral);
        self.disconnect().await.is_some()
    }

    fn check_services(&self, services: Vec<ServiceDescriptor>) -> Result<Vec<ServiceDescriptor>> {
        let service = services
            .iter()
            .find(|s| s.uuid == self.service_uuid)
            .ok_or_else(|| Error::ServiceDiscoveryFailed {
                reason: format!("service {} not found", self.service_uuid),
            })?;

        if !service.has_characteristic(&self.characteristic_uuid) {
            return Err(Error::ServiceDiscoveryFailed {
                reason: format!("characteristic {} not found", self.characteristic_uuid),
            });
        }

        debug!(
            "Found characteristic {} in service {}",
            self.characteristic_uuid, self.service_uuid
        );

        Ok(services)
    }

    /// Bail out if a disconnect (or newer connect) superseded this attempt,
    /// releasing the link this attempt brought up.
    async fn ensure_current(&self, attempt: u64, identifier: &str) -> Result<()> {
        if self.attempt.load(Ordering::SeqCst) == attempt {
            return Ok(());
        }

        debug!("Connection attempt to {} was cancelled", identifier);
        if self.is_claimed(identifier) {
            debug!("Newer attempt owns the link to {}, keeping it", identifier);
        } else if let Err(e) = self.backend.disconnect(identifier).await {
            warn!("Failed to release cancelled link to {}: {}", identifier, e);
        }

        Err(Error::Cancelled)
    }

    /// Check if the session currently targets `identifier`.
    fn is_claimed(&self, identifier: &str) -> bool {
        self.inner
            .read()
            .active
            .as_ref()
            .map_or(false, |p| p.identifier == identifier)
    }

    /// Record a failed attempt and return the error to report.
    async fn fail(
        &self,
        attempt: u64,
        peripheral: &PeripheralHandle,
        error: Error,
        release_link: bool,
    ) -> Error {
        error!("FAILED TO CONNECT to {}: {}", peripheral, error);

        let superseded = self.attempt.load(Ordering::SeqCst) != attempt;

        if release_link && !(superseded && self.is_claimed(&peripheral.identifier)) {
            if let Err(e) = self.backend.disconnect(&peripheral.identifier).await {
                debug!("Link release after failure: {}", e);
            }
        }

        if superseded || self.attempt.load(Ordering::SeqCst) != attempt {
            return Error::Cancelled;
        }

        self.set_state(
            ConnectionState::Failed(error.to_string()),
            Some(peripheral.clone()),
        );
        self.set_state(ConnectionState::Idle, None);

        error
    }

    /// Update the state and emit an event.
    fn set_state(&self, new_state: ConnectionState, peripheral: Option<PeripheralHandle>) {
        let old_state = {
            let mut inner = self.inner.write();
            let old = std::mem::replace(&mut inner.state, new_state.clone());
            inner.active = if new_state.is_busy() {
                peripheral.clone()
            } else {
                None
            };
            old
        };

        if old_state != new_state {
            debug!("Connection state changed: {} -> {}", old_state, new_state);

            let _ = self.event_tx.send(ConnectionEvent {
                peripheral,
                state: new_state,
            });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ble::mock::{BackendCall, MockBackend};
    use crate::ble::uuids::{SESSION_CHARACTERISTIC_UUID, SESSION_SERVICE_UUID};
    use pretty_assertions::assert_eq;

    fn manager_with(config: SessionConfig) -> (Arc<MockBackend>, Arc<ConnectionManager>) {
        let backend = Arc::new(MockBackend::new());
        let manager = Arc::new(ConnectionManager::new(backend.clone(), &config));
        (backend, manager)
    }

    fn manager() -> (Arc<MockBackend>, Arc<ConnectionManager>) {
        manager_with(SessionConfig::default())
    }

    fn drain(rx: &mut broadcast::Receiver<ConnectionEvent>) -> Vec<ConnectionState> {
        let mut states = Vec::new();
        while let Ok(event) = rx.try_recv() {
            states.push(event.state);
        }
        states
    }

    #[test]
    fn test_connection_state() {
        assert!(ConnectionState::Ready.is_ready());
        assert!(!ConnectionState::Connecting.is_ready());

        assert!(ConnectionState::Connecting.is_busy());
        assert!(ConnectionState::Discovering.is_busy());
        assert!(ConnectionState::Ready.is_busy());
        assert!(!ConnectionState::Scanning.is_busy());
        assert!(!ConnectionState::Failed("x".into()).is_busy());

        assert!(ConnectionState::Discovering.is_transitioning());
        assert!(!ConnectionState::Ready.is_transitioning());
    }

    #[test]
    fn test_connection_state_display() {
        assert_eq!(format!("{}", ConnectionState::Ready), "Ready");
        assert_eq!(format!("{}", ConnectionState::Idle), "Idle");
        assert_eq!(
            format!("{}", ConnectionState::Failed("timeout".into())),
            "Failed: timeout"
        );
    }

    #[tokio::test]
    async fn test_connect_walks_through_discovery_to_ready() {
        let (backend, manager) = manager();
        let mut rx = manager.subscribe();
        let device = PeripheralHandle::new("AA:BB");

        manager.connect(&device).await.unwrap();

        assert_eq!(manager.state(), ConnectionState::Ready);
        assert_eq!(manager.connected_device(), Some(device));
        assert_eq!(
            drain(&mut rx),
            vec![
                ConnectionState::Connecting,
                ConnectionState::Discovering,
                ConnectionState::Ready,
            ]
        );
        assert_eq!(
            backend.calls(),
            vec![
                BackendCall::Connect("AA:BB".into()),
                BackendCall::DiscoverServices("AA:BB".into()),
            ]
        );
    }

    #[tokio::test]
    async fn test_connect_failure_returns_to_idle() {
        let (backend, manager) = manager();
        backend.fail_connect("out of range");
        let mut rx = manager.subscribe();

        let err = manager
            .connect(&PeripheralHandle::new("AA:BB"))
            .await
            .unwrap_err();

        assert!(matches!(err, Error::ConnectionFailed { .. }));
        assert_eq!(manager.state(), ConnectionState::Idle);
        assert!(manager.active_peripheral().is_none());

        let states = drain(&mut rx);
        assert_eq!(states.len(), 3);
        assert_eq!(states[0], ConnectionState::Connecting);
        assert!(matches!(states[1], ConnectionState::Failed(_)));
        assert_eq!(states[2], ConnectionState::Idle);
    }

    #[tokio::test]
    async fn test_missing_characteristic_fails_discovery() {
        let (backend, manager) = manager();
        backend.set_services(vec![ServiceDescriptor {
            uuid: SESSION_SERVICE_UUID,
            characteristics: vec![],
        }]);

        let err = manager
            .connect(&PeripheralHandle::new("AA:BB"))
            .await
            .unwrap_err();

        assert!(matches!(err, Error::ServiceDiscoveryFailed { .. }));
        assert_eq!(manager.state(), ConnectionState::Idle);
        assert!(!backend.is_connected("AA:BB"));
    }

    #[tokio::test]
    async fn test_service_discovery_error_releases_link() {
        let (backend, manager) = manager();
        backend.fail_service_discovery("gatt error 133");

        let err = manager
            .connect(&PeripheralHandle::new("AA:BB"))
            .await
            .unwrap_err();

        assert!(matches!(err, Error::ServiceDiscoveryFailed { .. }));
        assert!(!backend.is_connected("AA:BB"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_connect_timeout() {
        let (backend, manager) = manager_with(
            SessionConfig::default().with_connect_timeout(Duration::from_millis(100)),
        );
        backend.set_connect_delay(Duration::from_secs(5));

        let err = manager
            .connect(&PeripheralHandle::new("AA:BB"))
            .await
            .unwrap_err();

        assert!(matches!(err, Error::Timeout { .. }));
        assert_eq!(manager.state(), ConnectionState::Idle);
    }

    #[tokio::test(start_paused = true)]
    async fn test_service_discovery_timeout_releases_link() {
        let (backend, manager) = manager_with(
            SessionConfig::default().with_discovery_timeout(Duration::from_millis(100)),
        );
        backend.set_discovery_delay(Duration::from_secs(5));

        let err = manager
            .connect(&PeripheralHandle::new("AA:BB"))
            .await
            .unwrap_err();

        assert!(matches!(err, Error::Timeout { .. }));
        assert_eq!(manager.state(), ConnectionState::Idle);
        assert!(manager.active_peripheral().is_none());
        assert!(!backend.is_connected("AA:BB"));
    }

    #[tokio::test]
    async fn test_reject_while_busy() {
        let (backend, manager) = manager();
        manager.connect(&PeripheralHandle::new("AA:BB")).await.unwrap();

        let err = manager
            .connect(&PeripheralHandle::new("CC:DD"))
            .await
            .unwrap_err();

        match err {
            Error::AlreadyConnected { identifier } => assert_eq!(identifier, "AA:BB"),
            other => panic!("expected AlreadyConnected, got {:?}", other),
        }
        assert_eq!(manager.connected_device().unwrap().identifier, "AA:BB");
        assert!(!backend.is_connected("CC:DD"));
    }

    #[tokio::test]
    async fn test_supersede_policy_reconnects() {
        let (backend, manager) = manager_with(
            SessionConfig::default().with_connection_policy(ConnectionPolicy::Supersede),
        );
        manager.connect(&PeripheralHandle::new("AA:BB")).await.unwrap();
        manager.connect(&PeripheralHandle::new("CC:DD")).await.unwrap();

        assert_eq!(manager.connected_device().unwrap().identifier, "CC:DD");
        assert!(!backend.is_connected("AA:BB"));
        assert!(backend.is_connected("CC:DD"));
    }

    #[tokio::test]
    async fn test_disconnect_from_ready() {
        let (backend, manager) = manager();
        manager.connect(&PeripheralHandle::new("AA:BB")).await.unwrap();
        let mut rx = manager.subscribe();

        let released = manager.disconnect().await;

        assert_eq!(released.unwrap().identifier, "AA:BB");
        assert_eq!(
            drain(&mut rx),
            vec![ConnectionState::Disconnected, ConnectionState::Idle]
        );
        assert!(manager.connected_device().is_none());
        assert!(!backend.is_connected("AA:BB"));
    }

    #[tokio::test]
    async fn test_disconnect_without_connection_is_noop() {
        let (backend, manager) = manager();

        assert!(manager.disconnect().await.is_none());
        assert!(backend.calls().is_empty());
        assert_eq!(manager.state(), ConnectionState::Idle);
    }

    #[tokio::test(start_paused = true)]
    async fn test_disconnect_cancels_pending_connect() {
        let (backend, manager) = manager();
        backend.set_connect_delay(Duration::from_millis(500));

        let pending = {
            let manager = manager.clone();
            tokio::spawn(async move { manager.connect(&PeripheralHandle::new("AA:BB")).await })
        };

        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(manager.state(), ConnectionState::Connecting);

        assert!(manager.disconnect().await.is_some());
        assert_eq!(manager.state(), ConnectionState::Idle);

        let result = pending.await.unwrap();
        assert!(matches!(result, Err(Error::Cancelled)));
        assert_eq!(manager.state(), ConnectionState::Idle);
        assert!(!backend.is_connected("AA:BB"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_disconnect_cancels_pending_discovery() {
        let (backend, manager) = manager();
        backend.set_discovery_delay(Duration::from_millis(500));
        let mut rx = manager.subscribe();

        let pending = {
            let manager = manager.clone();
            tokio::spawn(async move { manager.connect(&PeripheralHandle::new("AA:BB")).await })
        };

        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(manager.state(), ConnectionState::Discovering);

        assert!(manager.disconnect().await.is_some());

        let result = pending.await.unwrap();
        assert!(matches!(result, Err(Error::Cancelled)));
        assert_eq!(manager.state(), ConnectionState::Idle);
        assert!(!backend.is_connected("AA:BB"));

        // The cancelled attempt never reports Failed.
        assert_eq!(
            drain(&mut rx),
            vec![
                ConnectionState::Connecting,
                ConnectionState::Discovering,
                ConnectionState::Idle,
            ]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_stale_attempt_keeps_newer_link_to_same_device() {
        let (backend, manager) = manager();
        backend.set_connect_delay(Duration::from_millis(500));
        let device = PeripheralHandle::new("AA:BB");

        let first = {
            let manager = manager.clone();
            let device = device.clone();
            tokio::spawn(async move { manager.connect(&device).await })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert!(manager.disconnect().await.is_some());

        let second = {
            let manager = manager.clone();
            let device = device.clone();
            tokio::spawn(async move { manager.connect(&device).await })
        };

        assert!(matches!(first.await.unwrap(), Err(Error::Cancelled)));
        second.await.unwrap().unwrap();

        assert_eq!(manager.connected_device(), Some(device));
        assert!(backend.is_connected("AA:BB"));
        assert_eq!(
            backend.count_calls(|c| matches!(c, BackendCall::Disconnect(_))),
            1
        );
    }

    #[tokio::test]
    async fn test_link_lost_returns_to_idle() {
        let (_, manager) = manager();
        let device = PeripheralHandle::new("AA:BB");
        manager.connect(&device).await.unwrap();
        let mut rx = manager.subscribe();

        assert!(!manager.handle_link_lost(&PeripheralHandle::new("CC:DD")).await);
        assert_eq!(manager.state(), ConnectionState::Ready);

        assert!(manager.handle_link_lost(&device).await);
        assert_eq!(
            drain(&mut rx),
            vec![ConnectionState::Disconnected, ConnectionState::Idle]
        );
        assert!(manager.connected_device().is_none());
    }

    #[tokio::test]
    async fn test_scanning_state() {
        let (_, manager) = manager();

        manager.set_scanning(true);
        assert_eq!(manager.state(), ConnectionState::Scanning);

        manager.connect(&PeripheralHandle::new("AA:BB")).await.unwrap();
        manager.set_scanning(false);
        assert_eq!(manager.state(), ConnectionState::Ready);

        manager.set_scanning(true);
        assert_eq!(manager.state(), ConnectionState::Ready);
    }

    #[test]
    fn test_default_addresses() {
        let config = SessionConfig::default();
        assert_eq!(config.service_uuid, SESSION_SERVICE_UUID);
        assert_eq!(config.characteristic_uuid, SESSION_CHARACTERISTIC_UUID);
    }
}
