//! `btleplug` implementation of the backend seam.
//!
//! Wraps the first Bluetooth adapter of the host and maps its
//! peripherals, GATT tables and notifications onto [`BleBackend`].

use async_trait::async_trait;
use btleplug::api::{
    Central, CentralEvent, CentralState, Characteristic, Manager as _, Peripheral as _,
    ScanFilter, WriteType,
};
use btleplug::platform::{Adapter, Manager, Peripheral, PeripheralId};
use futures::stream::StreamExt;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, info, trace};
use uuid::Uuid;

use crate::ble::backend::{
    AdapterState, AdapterStateStream, BleBackend, DiscoveryStream, NotificationStream,
    ServiceDescriptor,
};
use crate::data::PeripheralHandle;
use crate::error::{Error, Result};
use crate::protocol;

/// [`BleBackend`] backed by the host Bluetooth stack.
pub struct BtleplugBackend {
    /// The BLE adapter in use.
    adapter: Adapter,
    /// Peripherals seen during discovery, by identifier.
    peripherals: Arc<RwLock<HashMap<String, Peripheral>>>,
}

impl BtleplugBackend {
    /// Open the first adapter of the platform manager.
    ///
    /// # Errors
    ///
    /// Returns an error if Bluetooth is not available.
    pub async fn new() -> Result<Self> {
        let manager = Manager::new()
            .await
            .map_err(|_e| Error::BluetoothUnavailable)?;

        let adapters = manager.adapters().await.map_err(Error::Bluetooth)?;

        let adapter = adapters
            .into_iter()
            .next()
            .ok_or(Error::BluetoothUnavailable)?;

        info!(
            "Using Bluetooth adapter: {:?}",
            adapter.adapter_info().await.ok()
        );

        Ok(Self::with_adapter(adapter))
    }

    /// Use a specific adapter.
    pub fn with_adapter(adapter: Adapter) -> Self {
        Self {
            adapter,
            peripherals: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    /// Get the underlying adapter.
    pub fn adapter(&self) -> &Adapter {
        &self.adapter
    }

    /// Resolve an identifier to a peripheral, falling back to the
    /// adapter's own list for devices seen before this scan.
    async fn peripheral(&self, identifier: &str) -> Result<Peripheral> {
        let cached = self.peripherals.read().get(identifier).cloned();
        if let Some(peripheral) = cached {
            return Ok(peripheral);
        }

        let peripheral = self
            .adapter
            .peripherals()
            .await?
            .into_iter()
            .find(|p| p.id().to_string() == identifier)
            .ok_or_else(|| Error::PeripheralNotFound {
                identifier: identifier.to_string(),
            })?;

        self.peripherals
            .write()
            .insert(identifier.to_string(), peripheral.clone());

        Ok(peripheral)
    }

    /// Find a characteristic in the discovered GATT table.
    fn characteristic(
        peripheral: &Peripheral,
        service: Uuid,
        characteristic: Uuid,
    ) -> Result<Characteristic> {
        if !peripheral.services().iter().any(|s| s.uuid == service) {
            return Err(Error::ServiceNotFound {
                uuid: service.to_string(),
            });
        }

        peripheral
            .characteristics()
            .into_iter()
            .find(|c| c.uuid == characteristic && c.service_uuid == service)
            .ok_or_else(|| Error::CharacteristicNotFound {
                uuid: characteristic.to_string(),
            })
    }

    /// Map a discovered peripheral onto a handle and remember it.
    async fn process_peripheral(
        adapter: &Adapter,
        id: PeripheralId,
        peripherals: &RwLock<HashMap<String, Peripheral>>,
    ) -> Option<PeripheralHandle> {
        let peripheral = match adapter.peripheral(&id).await {
            Ok(p) => p,
            Err(e) => {
                trace!("Failed to get peripheral: {}", e);
                return None;
            }
        };

        let properties = peripheral.properties().await.ok().flatten()?;
        let identifier = id.to_string();

        peripherals.write().insert(identifier.clone(), peripheral);

        Some(PeripheralHandle {
            identifier,
            name: properties.local_name,
            rssi: properties.rssi,
        })
    }
}

fn adapter_state(state: CentralState) -> AdapterState {
    match state {
        CentralState::PoweredOn => AdapterState::PoweredOn,
        CentralState::PoweredOff => AdapterState::PoweredOff,
        _ => AdapterState::Unknown,
    }
}

#[async_trait]
impl BleBackend for BtleplugBackend {
    async fn start_discovery(&self) -> Result<DiscoveryStream> {
        info!("Starting BLE scan");

        let events = self.adapter.events().await?;

        self.adapter
            .start_scan(ScanFilter::default())
            .await
            .map_err(|e| Error::DiscoveryFailed {
                reason: e.to_string(),
            })?;

        let adapter = self.adapter.clone();
        let peripherals = self.peripherals.clone();

        let stream = events.filter_map(move |event| {
            let adapter = adapter.clone();
            let peripherals = peripherals.clone();
            async move {
                match event {
                    CentralEvent::DeviceDiscovered(id) | CentralEvent::DeviceUpdated(id) => {
                        trace!("Device discovered/updated: {:?}", id);
                        Self::process_peripheral(&adapter, id, &peripherals).await
                    }
                    _ => None,
                }
            }
        });

        Ok(stream.boxed())
    }

    async fn stop_discovery(&self) -> Result<()> {
        info!("Stopping BLE scan");
        self.adapter.stop_scan().await?;
        Ok(())
    }

    async fn adapter_states(&self) -> Result<AdapterStateStream> {
        let events = self.adapter.events().await?;

        let stream = events.filter_map(|event| async move {
            match event {
                CentralEvent::StateUpdate(state) => Some(adapter_state(state)),
                _ => None,
            }
        });

        Ok(stream.boxed())
    }

    async fn connect(&self, identifier: &str) -> Result<()> {
        let peripheral = self.peripheral(identifier).await?;

        if peripheral.is_connected().await.unwrap_or(false) {
            info!("Peripheral {} already connected at BLE level", identifier);
            return Ok(());
        }

        peripheral
            .connect()
            .await
            .map_err(|e| Error::connection_failed(e.to_string()))
    }

    async fn disconnect(&self, identifier: &str) -> Result<()> {
        let peripheral = self.peripheral(identifier).await?;
        peripheral.disconnect().await?;
        Ok(())
    }

    async fn discover_services(&self, identifier: &str) -> Result<Vec<ServiceDescriptor>> {
        let peripheral = self.peripheral(identifier).await?;

        peripheral
            .discover_services()
            .await
            .map_err(|e| Error::ServiceDiscoveryFailed {
                reason: e.to_string(),
            })?;

        let services: Vec<_> = peripheral
            .services()
            .into_iter()
            .map(|service| ServiceDescriptor {
                uuid: service.uuid,
                characteristics: service.characteristics.iter().map(|c| c.uuid).collect(),
            })
            .collect();

        debug!("Discovered {} services on {}", services.len(), identifier);

        Ok(services)
    }

    async fn monitor(
        &self,
        identifier: &str,
        service: Uuid,
        characteristic: Uuid,
    ) -> Result<NotificationStream> {
        let peripheral = self.peripheral(identifier).await?;
        let target = Self::characteristic(&peripheral, service, characteristic)?;

        debug!(
            "Subscribing to {}, properties: {:?}",
            characteristic, target.properties
        );

        peripheral.subscribe(&target).await?;
        let notifications = peripheral.notifications().await?;

        // End the stream when the link drops so the session can tear down.
        let id = peripheral.id();
        let mut events = self.adapter.events().await?;
        let disconnected = async move {
            while let Some(event) = events.next().await {
                if matches!(&event, CentralEvent::DeviceDisconnected(lost) if *lost == id) {
                    debug!("Peripheral {:?} disconnected", id);
                    break;
                }
            }
        };

        let stream = notifications
            .take_until(disconnected)
            .filter(move |n| futures::future::ready(n.uuid == characteristic))
            .map(|n| {
                if n.value.is_empty() {
                    Ok(None)
                } else {
                    Ok(Some(protocol::encode(&n.value)))
                }
            });

        Ok(stream.boxed())
    }

    async fn stop_monitor(
        &self,
        identifier: &str,
        service: Uuid,
        characteristic: Uuid,
    ) -> Result<()> {
        let peripheral = self.peripheral(identifier).await?;
        let target = Self::characteristic(&peripheral, service, characteristic)?;

        peripheral.unsubscribe(&target).await?;
        debug!("Unsubscribed from notifications from {}", characteristic);

        Ok(())
    }

    async fn write_with_response(
        &self,
        identifier: &str,
        service: Uuid,
        characteristic: Uuid,
        value: &str,
    ) -> Result<()> {
        let peripheral = self.peripheral(identifier).await?;
        let target = Self::characteristic(&peripheral, service, characteristic)?;
        let data = protocol::decode(value)?;

        peripheral
            .write(&target, &data, WriteType::WithResponse)
            .await
            .map_err(|e| Error::WriteFailed {
                reason: e.to_string(),
            })?;

        trace!("Wrote {} bytes to characteristic {}", data.len(), characteristic);

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_adapter_state_mapping() {
        assert_eq!(adapter_state(CentralState::PoweredOn), AdapterState::PoweredOn);
        assert_eq!(
            adapter_state(CentralState::PoweredOff),
            AdapterState::PoweredOff
        );
        assert_eq!(adapter_state(CentralState::Unknown), AdapterState::Unknown);
    }

    #[test]
    fn test_backend_is_send_sync() {
        fn assert_send_sync<T: Send + Sync>() {}
        assert_send_sync::<BtleplugBackend>();
    }
}
