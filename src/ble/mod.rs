//! BLE communication module.
//!
//! This module provides the link-level pieces of a session: the backend
//! seam and its implementations, device discovery, the connection state
//! machine and the notify/write data channel.

pub mod adapter;
pub mod backend;
pub mod channel;
pub mod connection;
pub mod mock;
pub mod registry;
pub mod uuids;

pub use adapter::BtleplugBackend;
pub use backend::{AdapterState, BleBackend, RawNotification, ServiceDescriptor};
pub use channel::{DataChannel, SubscriptionInfo};
pub use connection::{ConnectionEvent, ConnectionManager, ConnectionState};
pub use mock::MockBackend;
pub use registry::DeviceRegistry;
pub use uuids::*;
