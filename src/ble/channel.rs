//! Notification and write channel on the session characteristic.
//!
//! Once a connection is ready the channel monitors the characteristic
//! and republishes decoded payloads as [`Message`]s. Writes go out on the
//! same characteristic with acknowledgement.

use futures::stream::StreamExt;
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{debug, info, trace, warn};
use uuid::Uuid;

use crate::ble::backend::{BleBackend, RawNotification};
use crate::config::SessionConfig;
use crate::data::{Message, PeripheralHandle};
use crate::error::{Error, Result};
use crate::protocol;

/// An active notification stream on the ready peripheral.
///
/// Dropping or cancelling the subscription stops delivery.
pub(crate) struct Subscription {
    peripheral: PeripheralHandle,
    service: Uuid,
    characteristic: Uuid,
    handle: JoinHandle<()>,
}

impl Subscription {
    fn cancel(&self) {
        self.handle.abort();
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.cancel();
    }
}

/// Details of the current subscription.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubscriptionInfo {
    /// The peripheral being monitored.
    pub peripheral: PeripheralHandle,
    /// Monitored service UUID.
    pub service: Uuid,
    /// Monitored characteristic UUID.
    pub characteristic: Uuid,
}

/// Data channel on the session characteristic.
pub struct DataChannel {
    backend: Arc<dyn BleBackend>,
    /// At most one subscription, present exactly while streaming.
    subscription: Mutex<Option<Subscription>>,
    /// Channel for decoded inbound messages.
    message_tx: broadcast::Sender<Message>,
    /// Peripherals whose notification stream ended without `stop_streaming`.
    ended_tx: broadcast::Sender<PeripheralHandle>,
    service: Uuid,
    characteristic: Uuid,
    write_timeout: Duration,
}

impl DataChannel {
    /// Create a data channel.
    pub fn new(backend: Arc<dyn BleBackend>, config: &SessionConfig) -> Self {
        let (message_tx, _) = broadcast::channel(config.event_capacity.max(1));
        let (ended_tx, _) = broadcast::channel(config.event_capacity.max(1));

        Self {
            backend,
            subscription: Mutex::new(None),
            message_tx,
            ended_tx,
            service: config.service_uuid,
            characteristic: config.characteristic_uuid,
            write_timeout: config.write_timeout,
        }
    }

    /// Start monitoring the characteristic on a peripheral.
    ///
    /// Replaces any existing subscription.
    ///
    /// # Errors
    ///
    /// Returns [`Error::NotificationError`] if the monitor cannot be set up.
    pub async fn start_streaming(&self, peripheral: &PeripheralHandle) -> Result<()> {
        self.stop_streaming().await;

        let mut notifications = self
            .backend
            .monitor(&peripheral.identifier, self.service, self.characteristic)
            .await
            .map_err(|e| Error::NotificationError {
                reason: e.to_string(),
            })?;

        let message_tx = self.message_tx.clone();
        let ended_tx = self.ended_tx.clone();
        let source = peripheral.clone();

        let handle = tokio::spawn(async move {
            debug!("Notification listener started for {}", source);

            while let Some(notification) = notifications.next().await {
                if let Some(message) = Self::handle_notification(notification) {
                    trace!("Message from {}: {} bytes", source, message.len());
                    let _ = message_tx.send(message);
                }
            }

            // Only reached when the backend closed the stream; `stop_streaming`
            // aborts this task first.
            warn!("Notification stream from {} ended", source);
            let _ = ended_tx.send(source);
        });

        info!(
            "Monitoring {} / {} on {}",
            self.service, self.characteristic, peripheral
        );

        *self.subscription.lock() = Some(Subscription {
            peripheral: peripheral.clone(),
            service: self.service,
            characteristic: self.characteristic,
            handle,
        });

        Ok(())
    }

    /// Release the subscription, if any.
    ///
    /// Returns `true` if a subscription was released.
    pub async fn stop_streaming(&self) -> bool {
        let subscription = self.subscription.lock().take();

        let Some(subscription) = subscription else {
            return false;
        };

        subscription.cancel();

        if let Err(e) = self
            .backend
            .stop_monitor(
                &subscription.peripheral.identifier,
                subscription.service,
                subscription.characteristic,
            )
            .await
        {
            debug!("Failed to stop monitor: {}", e);
        }

        debug!("Released subscription on {}", subscription.peripheral);
        true
    }

    /// Check if a subscription is held.
    pub fn is_streaming(&self) -> bool {
        self.subscription.lock().is_some()
    }

    /// Details of the current subscription, if any.
    pub fn subscription(&self) -> Option<SubscriptionInfo> {
        self.subscription.lock().as_ref().map(|s| SubscriptionInfo {
            peripheral: s.peripheral.clone(),
            service: s.service,
            characteristic: s.characteristic,
        })
    }

    /// Receive decoded inbound messages.
    pub fn subscribe(&self) -> broadcast::Receiver<Message> {
        self.message_tx.subscribe()
    }

    /// Receive the peripheral whenever its notification stream ends on its
    /// own, typically because the link dropped.
    pub fn stream_ended(&self) -> broadcast::Receiver<PeripheralHandle> {
        self.ended_tx.subscribe()
    }

    /// Release the subscription only if it is bound to `peripheral`.
    pub async fn stop_streaming_from(&self, peripheral: &PeripheralHandle) -> bool {
        let bound = self
            .subscription
            .lock()
            .as_ref()
            .map_or(false, |s| s.peripheral == *peripheral);

        bound && self.stop_streaming().await
    }

    /// Encode a text message and write it with acknowledgement.
    ///
    /// # Errors
    ///
    /// Returns [`Error::WriteFailed`] or [`Error::Timeout`] if the write is
    /// not acknowledged.
    pub async fn send(&self, peripheral: &PeripheralHandle, message: &str) -> Result<()> {
        self.send_bytes(peripheral, message.as_bytes()).await
    }

    /// Encode raw bytes and write them with acknowledgement.
    ///
    /// # Errors
    ///
    /// See [`DataChannel::send`].
    pub async fn send_bytes(&self, peripheral: &PeripheralHandle, data: &[u8]) -> Result<()> {
        let encoded = protocol::encode(data);

        let written = tokio::time::timeout(
            self.write_timeout,
            self.backend.write_with_response(
                &peripheral.identifier,
                self.service,
                self.characteristic,
                &encoded,
            ),
        )
        .await;

        match written {
            Ok(Ok(())) => {
                debug!("Wrote {} bytes to {}", data.len(), peripheral);
                Ok(())
            }
            Ok(Err(e @ Error::WriteFailed { .. })) => Err(e),
            Ok(Err(e)) => Err(Error::WriteFailed {
                reason: e.to_string(),
            }),
            Err(_) => Err(Error::timeout("write")),
        }
    }

    /// Turn one raw notification into a message.
    ///
    /// Errors, empty payloads and undecodable payloads are logged and
    /// skipped; none of them end the stream.
    fn handle_notification(notification: RawNotification) -> Option<Message> {
        let value = match notification {
            Err(e) => {
                warn!("Notification error: {}", e);
                return None;
            }
            Ok(None) => {
                debug!("No Data was received");
                return None;
            }
            Ok(Some(value)) => value,
        };

        match protocol::decode(&value) {
            Ok(data) if data.is_empty() => {
                debug!("No Data was received");
                None
            }
            Ok(data) => Some(Message::new(data)),
            Err(e) => {
                warn!("Dropping undecodable notification: {}", e);
                None
            }
        }
    }
}

impl Drop for DataChannel {
    fn drop(&mut self) {
        if let Some(subscription) = self.subscription.lock().take() {
            subscription.cancel();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ble::mock::{BackendCall, MockBackend};
    use crate::ble::uuids::{SESSION_CHARACTERISTIC_UUID, SESSION_SERVICE_UUID};
    use pretty_assertions::assert_eq;

    async fn connected_channel_with(
        config: SessionConfig,
    ) -> (Arc<MockBackend>, DataChannel, PeripheralHandle) {
        let backend = Arc::new(MockBackend::new());
        let device = PeripheralHandle::new("AA:BB");
        backend.connect(&device.identifier).await.unwrap();

        let channel = DataChannel::new(backend.clone(), &config);
        (backend, channel, device)
    }

    async fn connected_channel() -> (Arc<MockBackend>, DataChannel, PeripheralHandle) {
        connected_channel_with(SessionConfig::default()).await
    }

    #[test]
    fn test_handle_notification() {
        assert!(DataChannel::handle_notification(Ok(None)).is_none());
        assert!(DataChannel::handle_notification(Ok(Some(String::new()))).is_none());
        assert!(DataChannel::handle_notification(Ok(Some("%%%".into()))).is_none());
        assert!(DataChannel::handle_notification(Err(Error::NotificationError {
            reason: "gatt 133".into()
        }))
        .is_none());

        let message = DataChannel::handle_notification(Ok(Some("SGVsbG8=".into()))).unwrap();
        assert_eq!(message.as_text(), Some("Hello"));
    }

    #[tokio::test]
    async fn test_streaming_delivers_decoded_messages() {
        let (backend, channel, device) = connected_channel().await;
        let mut messages = channel.subscribe();

        channel.start_streaming(&device).await.unwrap();

        let info = channel.subscription().unwrap();
        assert_eq!(info.service, SESSION_SERVICE_UUID);
        assert_eq!(info.characteristic, SESSION_CHARACTERISTIC_UUID);

        backend.emit_notification(Ok(Some(protocol::encode([1u8, 2, 3]))));
        let message = messages.recv().await.unwrap();
        assert_eq!(&message.data[..], &[1, 2, 3]);
    }

    #[tokio::test]
    async fn test_empty_and_error_notifications_are_skipped() {
        let (backend, channel, device) = connected_channel().await;
        let mut messages = channel.subscribe();
        channel.start_streaming(&device).await.unwrap();

        backend.emit_notification(Ok(None));
        backend.emit_notification(Err(Error::NotificationError {
            reason: "gatt 133".into(),
        }));
        backend.emit_notification(Ok(Some("not base64!".into())));
        backend.emit_notification(Ok(Some(protocol::encode_text("after"))));

        let message = messages.recv().await.unwrap();
        assert_eq!(message.as_text(), Some("after"));
        assert!(channel.is_streaming());
        assert!(backend.is_monitoring());
    }

    #[tokio::test]
    async fn test_stop_streaming_releases_monitor() {
        let (backend, channel, device) = connected_channel().await;
        channel.start_streaming(&device).await.unwrap();

        assert!(channel.stop_streaming().await);
        assert!(!channel.is_streaming());
        assert!(!backend.is_monitoring());
        assert!(!channel.stop_streaming().await);
    }

    #[tokio::test]
    async fn test_monitor_failure() {
        let backend = Arc::new(MockBackend::new());
        let channel = DataChannel::new(backend.clone(), &SessionConfig::default());

        let err = channel
            .start_streaming(&PeripheralHandle::new("AA:BB"))
            .await
            .unwrap_err();

        assert!(matches!(err, Error::NotificationError { .. }));
        assert!(!channel.is_streaming());
    }

    #[tokio::test]
    async fn test_send_encodes_and_targets_session_characteristic() {
        let (backend, channel, device) = connected_channel().await;

        channel.send(&device, "Hello").await.unwrap();

        assert_eq!(
            backend.calls().last().cloned(),
            Some(BackendCall::Write {
                identifier: "AA:BB".into(),
                service: SESSION_SERVICE_UUID,
                characteristic: SESSION_CHARACTERISTIC_UUID,
                value: protocol::encode_text("Hello"),
            })
        );
    }

    #[tokio::test]
    async fn test_write_failure() {
        let (backend, channel, device) = connected_channel().await;
        backend.fail_writes("not acknowledged");

        let err = channel.send(&device, "Hello").await.unwrap_err();
        assert!(matches!(err, Error::WriteFailed { .. }));
    }

    #[tokio::test(start_paused = true)]
    async fn test_write_timeout() {
        let (backend, channel, device) = connected_channel_with(
            SessionConfig::default().with_write_timeout(Duration::from_millis(100)),
        )
        .await;
        backend.set_write_delay(Duration::from_secs(5));

        let err = channel.send(&device, "Hello").await.unwrap_err();
        assert!(matches!(err, Error::Timeout { .. }));
    }

    #[tokio::test]
    async fn test_link_drop_reports_stream_end() {
        let (backend, channel, device) = connected_channel().await;
        let mut ended = channel.stream_ended();
        channel.start_streaming(&device).await.unwrap();

        backend.disconnect("AA:BB").await.unwrap();

        assert_eq!(ended.recv().await.unwrap(), device);
        assert!(channel.stop_streaming_from(&device).await);
        assert!(!channel.is_streaming());
    }

    #[tokio::test]
    async fn test_stop_streaming_does_not_report_stream_end() {
        let (_, channel, device) = connected_channel().await;
        let mut ended = channel.stream_ended();
        channel.start_streaming(&device).await.unwrap();

        assert!(!channel.stop_streaming_from(&PeripheralHandle::new("CC:DD")).await);
        assert!(channel.is_streaming());

        assert!(channel.stop_streaming().await);
        tokio::task::yield_now().await;
        assert!(ended.try_recv().is_err());
    }
}
