// Allow unusual byte groupings for UUIDs which have standard format
#![allow(clippy::unusual_byte_groupings)]

//! # ble-session
//!
//! A session manager for talking to a single nearby Bluetooth Low Energy
//! peripheral over one service/characteristic pair.
//!
//! ## Features
//!
//! - **Permission Negotiation**: Platform-aware runtime permission requests
//! - **Device Discovery**: Scanning with per-identifier deduplication
//! - **Connection Lifecycle**: Connect, service discovery and teardown with
//!   explicit timeouts and a single-connection policy
//! - **Data Channel**: Notification streaming and acknowledged writes, with
//!   payloads carried in a transport-safe (base64) encoding
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use ble_session::{PermissionGate, Result, SessionConfig, SessionFacade};
//!
//! #[tokio::main]
//! async fn main() -> Result<()> {
//!     let session =
//!         SessionFacade::with_default_adapter(PermissionGate::desktop(), SessionConfig::default())
//!             .await?;
//!
//!     if !session.scan_for_devices().await? {
//!         return Ok(());
//!     }
//!
//!     // Wait for devices to be discovered
//!     tokio::time::sleep(std::time::Duration::from_secs(5)).await;
//!
//!     if let Some(device) = session.devices().into_iter().next() {
//!         session.connect_to_device(&device).await?;
//!         session.send_message(&device, "Hello").await?;
//!         session.disconnect_from_device().await;
//!     }
//!
//!     session.shutdown().await
//! }
//! ```
//!
//! ## Platform Notes
//!
//! ### macOS
//! Requires Bluetooth permission. Add `NSBluetoothAlwaysUsageDescription`
//! to your Info.plist for bundled apps.
//!
//! ### Linux
//! Requires BlueZ. User may need to be in the `bluetooth` group.
//!
//! ### Android
//! Runtime permissions are negotiated through a [`PermissionBackend`]
//! supplied by the host; see [`permissions`].
//!
//! ## Feature Flags
//!
//! - `serde`: Enable serialization/deserialization for data types

// Public modules
pub mod ble;
pub mod config;
pub mod data;
pub mod error;
pub mod permissions;
pub mod protocol;
pub mod session;

// Re-exports for convenience
pub use config::{ConnectionPolicy, SessionConfig};
pub use error::{Error, Result};
pub use permissions::{
    Permission, PermissionBackend, PermissionGate, PermissionStatus, Platform,
};
pub use session::SessionFacade;

// Re-export commonly used types from submodules
pub use ble::{
    AdapterState, BleBackend, BtleplugBackend, ConnectionEvent, ConnectionState, MockBackend,
    SubscriptionInfo,
};
pub use data::{Message, PeripheralHandle, SendOutcome};
