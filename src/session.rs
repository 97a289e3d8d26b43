//! Session facade.
//!
//! Composes permissions, discovery, connection and the data channel into
//! the single object presentation code observes and drives.

use parking_lot::Mutex;
use std::sync::Arc;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::ble::adapter::BtleplugBackend;
use crate::ble::backend::{AdapterStateStream, BleBackend};
use crate::ble::channel::{DataChannel, SubscriptionInfo};
use crate::ble::connection::{ConnectionEvent, ConnectionManager, ConnectionState};
use crate::ble::registry::DeviceRegistry;
use crate::config::{ConnectionPolicy, SessionConfig};
use crate::data::{Message, PeripheralHandle, SendOutcome};
use crate::error::{Error, Result};
use crate::permissions::PermissionGate;

/// The BLE session: one adapter, one connected peripheral at a time.
pub struct SessionFacade {
    backend: Arc<dyn BleBackend>,
    permissions: PermissionGate,
    registry: Arc<DeviceRegistry>,
    connection: Arc<ConnectionManager>,
    channel: Arc<DataChannel>,
    policy: ConnectionPolicy,
    /// Tears the session down if the ready device drops the link.
    link_watch: Mutex<Option<JoinHandle<()>>>,
}

impl SessionFacade {
    /// Create a session over an explicitly owned backend.
    pub fn new(
        backend: Arc<dyn BleBackend>,
        permissions: PermissionGate,
        config: SessionConfig,
    ) -> Self {
        Self {
            registry: Arc::new(DeviceRegistry::new(backend.clone(), config.event_capacity)),
            connection: Arc::new(ConnectionManager::new(backend.clone(), &config)),
            channel: Arc::new(DataChannel::new(backend.clone(), &config)),
            policy: config.connection_policy,
            link_watch: Mutex::new(None),
            backend,
            permissions,
        }
    }

    /// Create a session on the host's first Bluetooth adapter.
    ///
    /// # Errors
    ///
    /// Returns an error if Bluetooth is not available.
    pub async fn with_default_adapter(
        permissions: PermissionGate,
        config: SessionConfig,
    ) -> Result<Self> {
        let backend = BtleplugBackend::new().await?;
        Ok(Self::new(Arc::new(backend), permissions, config))
    }

    // === Permissions & discovery ===

    /// Request the runtime permissions needed to scan and connect.
    pub async fn request_permissions(&self) -> bool {
        self.permissions.request_permissions().await
    }

    /// Start (or restart) discovery.
    ///
    /// # Errors
    ///
    /// Returns [`Error::DiscoveryFailed`] if the backend cannot scan.
    pub async fn scan_for_peripherals(&self) -> Result<()> {
        self.registry.start_discovery().await?;
        self.connection.set_scanning(true);
        Ok(())
    }

    /// Request permissions, then scan only if all were granted.
    ///
    /// Returns whether scanning started.
    ///
    /// # Errors
    ///
    /// Returns [`Error::DiscoveryFailed`] if the backend cannot scan.
    pub async fn scan_for_devices(&self) -> Result<bool> {
        if !self.request_permissions().await {
            warn!("Permissions not granted, not scanning");
            return Ok(false);
        }

        self.scan_for_peripherals().await?;
        Ok(true)
    }

    /// Stop discovery.
    pub async fn stop_scan(&self) -> Result<()> {
        let result = self.registry.stop_discovery().await;
        self.connection.set_scanning(false);
        result
    }

    /// Check if discovery is running.
    pub fn is_scanning(&self) -> bool {
        self.registry.is_discovering()
    }

    /// Discovered devices in first-seen order.
    pub fn devices(&self) -> Vec<PeripheralHandle> {
        self.registry.devices()
    }

    /// Discovered devices, strongest signal first.
    pub fn devices_by_signal(&self) -> Vec<PeripheralHandle> {
        self.registry.devices_by_signal()
    }

    /// Subscribe to device add/replace events.
    pub fn device_events(&self) -> broadcast::Receiver<PeripheralHandle> {
        self.registry.subscribe()
    }

    /// Stream of adapter power state changes.
    pub async fn adapter_states(&self) -> Result<AdapterStateStream> {
        self.backend.adapter_states().await
    }

    // === Connection ===

    /// Connect to a device, discover its services and start streaming.
    ///
    /// Discovery is stopped once the connection is up. On failure the
    /// session returns to `Idle` (or `Scanning`, if discovery is still
    /// running) and the error is returned; nothing is retried.
    ///
    /// # Errors
    ///
    /// See [`ConnectionManager::connect`]; also [`Error::NotificationError`]
    /// if the characteristic cannot be monitored.
    pub async fn connect_to_device(&self, device: &PeripheralHandle) -> Result<()> {
        if self.policy == ConnectionPolicy::Supersede && self.connection.state().is_busy() {
            self.disconnect_from_device().await;
        }

        if let Err(e) = self.connection.connect(device).await {
            self.resume_scanning_state();
            return Err(e);
        }

        if let Err(e) = self.registry.stop_discovery().await {
            warn!("Failed to stop discovery after connecting: {}", e);
        }
        self.connection.set_scanning(false);

        let ended = self.channel.stream_ended();

        if let Err(e) = self.channel.start_streaming(device).await {
            error!("Failed to start streaming from {}: {}", device, e);
            self.connection.disconnect().await;
            return Err(e);
        }

        self.watch_link(device.clone(), ended);
        Ok(())
    }

    /// Disconnect from the current device.
    ///
    /// Returns `false` (and does nothing) if no device was connected.
    pub async fn disconnect_from_device(&self) -> bool {
        self.stop_link_watch();
        self.channel.stop_streaming().await;
        let released = self.connection.disconnect().await;
        self.resume_scanning_state();

        match released {
            Some(device) => {
                info!("Disconnected from {}", device);
                true
            }
            None => false,
        }
    }

    /// The device in the `Ready` state, if any.
    pub fn connected_device(&self) -> Option<PeripheralHandle> {
        self.connection.connected_device()
    }

    /// Current connection state.
    pub fn connection_state(&self) -> ConnectionState {
        self.connection.state()
    }

    /// Subscribe to connection state changes.
    pub fn connection_events(&self) -> broadcast::Receiver<ConnectionEvent> {
        self.connection.subscribe()
    }

    // === Data ===

    /// Send a text message to the connected device.
    ///
    /// With no connected device this is a no-op reported as
    /// [`SendOutcome::NoActiveConnection`].
    ///
    /// # Errors
    ///
    /// - [`Error::NotReady`] if `device` is not the connected device.
    /// - [`Error::WriteFailed`] or [`Error::Timeout`] if the write fails.
    pub async fn send_message(
        &self,
        device: &PeripheralHandle,
        message: &str,
    ) -> Result<SendOutcome> {
        let Some(connected) = self.connection.connected_device() else {
            info!("No Device Connected");
            return Ok(SendOutcome::NoActiveConnection);
        };

        if connected != *device {
            return Err(Error::NotReady {
                identifier: device.identifier.clone(),
            });
        }

        self.channel.send(&connected, message).await?;
        Ok(SendOutcome::Sent)
    }

    /// Receive decoded inbound messages.
    pub fn messages(&self) -> broadcast::Receiver<Message> {
        self.channel.subscribe()
    }

    /// Details of the active subscription, if any.
    pub fn subscription(&self) -> Option<SubscriptionInfo> {
        self.channel.subscription()
    }

    /// Stop discovery and release the connection.
    pub async fn shutdown(&self) -> Result<()> {
        info!("Shutting down session");

        self.disconnect_from_device().await;
        self.stop_scan().await
    }

    fn resume_scanning_state(&self) {
        if self.registry.is_discovering() {
            self.connection.set_scanning(true);
        }
    }

    /// Wait for the notification stream of `device` to end on its own,
    /// then release the subscription and the connection.
    fn watch_link(
        &self,
        device: PeripheralHandle,
        mut ended: broadcast::Receiver<PeripheralHandle>,
    ) {
        let registry = self.registry.clone();
        let connection = self.connection.clone();
        let channel = self.channel.clone();

        let handle = tokio::spawn(async move {
            loop {
                match ended.recv().await {
                    Ok(lost) if lost == device => break,
                    Ok(_) | Err(broadcast::error::RecvError::Lagged(_)) => continue,
                    Err(broadcast::error::RecvError::Closed) => return,
                }
            }

            warn!("Connection to {} dropped", device);
            channel.stop_streaming_from(&device).await;

            if connection.handle_link_lost(&device).await && registry.is_discovering() {
                connection.set_scanning(true);
            }
        });

        if let Some(previous) = self.link_watch.lock().replace(handle) {
            previous.abort();
        }
    }

    fn stop_link_watch(&self) {
        if let Some(handle) = self.link_watch.lock().take() {
            debug!("Stopping link watch");
            handle.abort();
        }
    }
}

impl Drop for SessionFacade {
    fn drop(&mut self) {
        self.stop_link_watch();
    }
}
