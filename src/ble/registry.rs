//! Discovered device registry.
//!
//! Collects peripherals reported by the backend into an ordered list
//! with at most one entry per identifier.

use futures::stream::StreamExt;
use parking_lot::{Mutex, RwLock};
use std::sync::Arc;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{debug, info, trace, warn};

use crate::ble::backend::BleBackend;
use crate::data::PeripheralHandle;
use crate::error::{Error, Result};

/// Ordered, deduplicated set of discovered peripherals.
pub struct DeviceRegistry {
    /// Discovery backend.
    backend: Arc<dyn BleBackend>,
    /// Devices in first-seen order.
    devices: Arc<RwLock<Vec<PeripheralHandle>>>,
    /// Channel for add/replace events.
    event_tx: broadcast::Sender<PeripheralHandle>,
    /// Task draining the discovery stream.
    scan_handle: Mutex<Option<JoinHandle<()>>>,
}

impl DeviceRegistry {
    /// Create an empty registry.
    pub fn new(backend: Arc<dyn BleBackend>, event_capacity: usize) -> Self {
        let (event_tx, _) = broadcast::channel(event_capacity.max(1));

        Self {
            backend,
            devices: Arc::new(RwLock::new(Vec::new())),
            event_tx,
            scan_handle: Mutex::new(None),
        }
    }

    /// Start discovery.
    ///
    /// Calling this while a scan is running restarts the scan; the
    /// registry contents are kept.
    ///
    /// # Errors
    ///
    /// Returns [`Error::DiscoveryFailed`] if the backend cannot scan.
    pub async fn start_discovery(&self) -> Result<()> {
        if self.is_discovering() {
            debug!("Discovery already running, restarting");
            self.stop_discovery().await?;
        }

        info!("Starting discovery");

        let mut stream = self
            .backend
            .start_discovery()
            .await
            .map_err(|e| match e {
                Error::DiscoveryFailed { .. } => e,
                other => Error::DiscoveryFailed {
                    reason: other.to_string(),
                },
            })?;

        let devices = self.devices.clone();
        let event_tx = self.event_tx.clone();

        let handle = tokio::spawn(async move {
            while let Some(handle) = stream.next().await {
                Self::insert(&devices, &event_tx, handle);
            }

            debug!("Discovery stream ended");
        });

        if let Some(previous) = self.scan_handle.lock().replace(handle) {
            previous.abort();
        }

        Ok(())
    }

    /// Stop discovery. Stopping while idle is a no-op.
    pub async fn stop_discovery(&self) -> Result<()> {
        let handle = self.scan_handle.lock().take();

        let Some(handle) = handle else {
            trace!("Not discovering, ignoring stop request");
            return Ok(());
        };

        info!("Stopping discovery");
        handle.abort();

        if let Err(e) = self.backend.stop_discovery().await {
            warn!("Failed to stop discovery: {}", e);
            return Err(e);
        }

        Ok(())
    }

    /// Check if a discovery scan is running.
    pub fn is_discovering(&self) -> bool {
        self.scan_handle
            .lock()
            .as_ref()
            .map(|h| !h.is_finished())
            .unwrap_or(false)
    }

    /// Add or replace a device.
    ///
    /// Returns `true` if the identifier was not known before.
    pub fn record(&self, handle: PeripheralHandle) -> bool {
        Self::insert(&self.devices, &self.event_tx, handle)
    }

    /// Current devices in first-seen order.
    pub fn devices(&self) -> Vec<PeripheralHandle> {
        self.devices.read().clone()
    }

    /// Current devices sorted by signal strength (strongest first).
    pub fn devices_by_signal(&self) -> Vec<PeripheralHandle> {
        let mut devices = self.devices();
        devices.sort_by_key(|d| std::cmp::Reverse(d.rssi.unwrap_or(i16::MIN)));
        devices
    }

    /// Look up a device by identifier.
    pub fn get(&self, identifier: &str) -> Option<PeripheralHandle> {
        self.devices
            .read()
            .iter()
            .find(|d| d.identifier == identifier)
            .cloned()
    }

    /// Number of known devices.
    pub fn len(&self) -> usize {
        self.devices.read().len()
    }

    /// Check if no device is known.
    pub fn is_empty(&self) -> bool {
        self.devices.read().is_empty()
    }

    /// Forget every device.
    pub fn clear(&self) {
        self.devices.write().clear();
    }

    /// Subscribe to add/replace events.
    pub fn subscribe(&self) -> broadcast::Receiver<PeripheralHandle> {
        self.event_tx.subscribe()
    }

    fn insert(
        devices: &RwLock<Vec<PeripheralHandle>>,
        event_tx: &broadcast::Sender<PeripheralHandle>,
        handle: PeripheralHandle,
    ) -> bool {
        let (stored, is_new) = {
            let mut devices = devices.write();

            match devices.iter_mut().find(|d| **d == handle) {
                Some(existing) => {
                    // Updates often arrive without the name; keep the last one seen.
                    if handle.name.is_some() {
                        existing.name = handle.name;
                    }
                    if handle.rssi.is_some() {
                        existing.rssi = handle.rssi;
                    }
                    (existing.clone(), false)
                }
                None => {
                    devices.push(handle.clone());
                    (handle, true)
                }
            }
        };

        if is_new {
            info!("Discovered new device: {}", stored);
        } else {
            trace!("Updated device: {}", stored);
        }

        let _ = event_tx.send(stored);
        is_new
    }
}

impl Drop for DeviceRegistry {
    fn drop(&mut self) {
        if let Some(handle) = self.scan_handle.lock().take() {
            handle.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ble::mock::{BackendCall, MockBackend};
    use pretty_assertions::assert_eq;
    use proptest::prelude::*;

    fn registry() -> (Arc<MockBackend>, DeviceRegistry) {
        let backend = Arc::new(MockBackend::new());
        let registry = DeviceRegistry::new(backend.clone(), 16);
        (backend, registry)
    }

    #[test]
    fn test_same_identifier_is_replaced_in_place() {
        let (_, registry) = registry();

        assert!(registry.record(PeripheralHandle::new("AA:BB").with_name("X")));
        assert!(registry.record(PeripheralHandle::new("CC:DD")));
        assert!(!registry.record(PeripheralHandle::new("AA:BB").with_name("Y")));

        let devices = registry.devices();
        assert_eq!(devices.len(), 2);
        assert_eq!(devices[0].identifier, "AA:BB");
        assert_eq!(devices[0].name.as_deref(), Some("Y"));
        assert_eq!(devices[1].identifier, "CC:DD");
    }

    #[test]
    fn test_update_without_name_keeps_previous_name() {
        let (_, registry) = registry();

        registry.record(PeripheralHandle::new("AA:BB").with_name("X").with_rssi(-70));
        registry.record(PeripheralHandle::new("AA:BB").with_rssi(-50));

        let device = registry.get("AA:BB").unwrap();
        assert_eq!(device.name.as_deref(), Some("X"));
        assert_eq!(device.rssi, Some(-50));
    }

    #[test]
    fn test_devices_by_signal() {
        let (_, registry) = registry();

        registry.record(PeripheralHandle::new("weak").with_rssi(-90));
        registry.record(PeripheralHandle::new("none"));
        registry.record(PeripheralHandle::new("strong").with_rssi(-30));

        let order: Vec<_> = registry
            .devices_by_signal()
            .into_iter()
            .map(|d| d.identifier)
            .collect();
        assert_eq!(order, vec!["strong", "weak", "none"]);
    }

    #[tokio::test]
    async fn test_discovery_stream_fills_registry() {
        let (backend, registry) = registry();
        let mut events = registry.subscribe();

        registry.start_discovery().await.unwrap();
        assert!(registry.is_discovering());

        backend.emit_discovery(PeripheralHandle::new("AA:BB").with_name("X"));
        backend.emit_discovery(PeripheralHandle::new("AA:BB").with_name("Y"));

        assert_eq!(events.recv().await.unwrap().name.as_deref(), Some("X"));
        assert_eq!(events.recv().await.unwrap().name.as_deref(), Some("Y"));

        assert_eq!(registry.len(), 1);
        assert_eq!(registry.devices()[0].identifier, "AA:BB");
    }

    #[tokio::test]
    async fn test_restart_is_idempotent() {
        let (backend, registry) = registry();

        registry.start_discovery().await.unwrap();
        registry.start_discovery().await.unwrap();

        assert!(registry.is_discovering());
        assert_eq!(
            backend.calls(),
            vec![
                BackendCall::StartDiscovery,
                BackendCall::StopDiscovery,
                BackendCall::StartDiscovery,
            ]
        );

        let mut events = registry.subscribe();
        backend.emit_discovery(PeripheralHandle::new("AA:BB"));
        events.recv().await.unwrap();
        assert_eq!(registry.len(), 1);
    }

    #[tokio::test]
    async fn test_stop_when_idle_is_noop() {
        let (backend, registry) = registry();

        registry.stop_discovery().await.unwrap();
        assert!(backend.calls().is_empty());
    }

    #[tokio::test]
    async fn test_discovery_failure() {
        let (backend, registry) = registry();
        backend.fail_discovery("adapter off");

        let err = registry.start_discovery().await.unwrap_err();
        assert!(matches!(err, Error::DiscoveryFailed { .. }));
        assert!(!registry.is_discovering());
    }

    proptest! {
        #[test]
        fn prop_count_never_exceeds_distinct_identifiers(
            ids in proptest::collection::vec("[A-F]{2}:[A-F]{2}", 0..64)
        ) {
            let (_, registry) = registry();
            let mut distinct = std::collections::HashSet::new();

            for id in &ids {
                registry.record(PeripheralHandle::new(id.clone()));
                distinct.insert(id.clone());
                prop_assert!(registry.len() <= distinct.len());
            }

            prop_assert_eq!(registry.len(), distinct.len());
        }
    }
}
