//! Error types for the ble-session crate.

use thiserror::Error;

/// The main error type for this crate.
#[derive(Error, Debug)]
pub enum Error {
    /// Bluetooth-related error from the underlying BLE library.
    #[error("Bluetooth error: {0}")]
    Bluetooth(#[from] btleplug::Error),

    /// Bluetooth is not available or is disabled on this system.
    #[error("Bluetooth not available or disabled")]
    BluetoothUnavailable,

    /// A required runtime permission was not granted.
    #[error("Permission denied: {permission}")]
    PermissionDenied {
        /// The permission that was refused.
        permission: String,
    },

    /// Device discovery could not be started.
    #[error("Discovery failed: {reason}")]
    DiscoveryFailed {
        /// Description of why discovery failed.
        reason: String,
    },

    /// The specified peripheral was not found.
    #[error("Peripheral not found: {identifier}")]
    PeripheralNotFound {
        /// The identifier that was searched for.
        identifier: String,
    },

    /// Failed to establish a link to the peripheral.
    #[error("Connection failed: {reason}")]
    ConnectionFailed {
        /// Description of why the connection failed.
        reason: String,
    },

    /// A connection is already active or in progress.
    #[error("Already connected to {identifier}")]
    AlreadyConnected {
        /// The peripheral currently holding the session.
        identifier: String,
    },

    /// Services or characteristics could not be discovered.
    #[error("Service discovery failed: {reason}")]
    ServiceDiscoveryFailed {
        /// Description of why discovery failed.
        reason: String,
    },

    /// The peripheral reported an error on the notification stream.
    #[error("Notification error: {reason}")]
    NotificationError {
        /// Description of the notification failure.
        reason: String,
    },

    /// A write-with-response was not acknowledged.
    #[error("Write failed: {reason}")]
    WriteFailed {
        /// Description of why the write failed.
        reason: String,
    },

    /// Operation requires a connected peripheral but none is connected.
    #[error("No device connected")]
    NoActiveConnection,

    /// The given peripheral is not the one in the `Ready` state.
    #[error("Peripheral {identifier} is not ready")]
    NotReady {
        /// The identifier that was addressed.
        identifier: String,
    },

    /// A payload was not valid in the transport-safe encoding.
    #[error("Invalid encoding: {context}")]
    InvalidEncoding {
        /// Description of what was invalid about the payload.
        context: String,
    },

    /// A bounded operation did not complete in time.
    #[error("Timed out during {operation}")]
    Timeout {
        /// The operation that timed out.
        operation: String,
    },

    /// The operation was abandoned because the session was torn down.
    #[error("Operation cancelled")]
    Cancelled,

    /// Characteristic not found on the device.
    #[error("Characteristic not found: {uuid}")]
    CharacteristicNotFound {
        /// The UUID of the characteristic that was not found.
        uuid: String,
    },

    /// Service not found on the device.
    #[error("Service not found: {uuid}")]
    ServiceNotFound {
        /// The UUID of the service that was not found.
        uuid: String,
    },

    /// An internal error occurred.
    #[error("Internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Shorthand for a [`Error::ConnectionFailed`] with the given reason.
    pub fn connection_failed(reason: impl Into<String>) -> Self {
        Self::ConnectionFailed {
            reason: reason.into(),
        }
    }

    /// Shorthand for a [`Error::Timeout`] on the named operation.
    pub fn timeout(operation: impl Into<String>) -> Self {
        Self::Timeout {
            operation: operation.into(),
        }
    }
}

/// A specialized Result type for this crate.
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        assert_eq!(Error::NoActiveConnection.to_string(), "No device connected");
        assert_eq!(
            Error::connection_failed("link lost").to_string(),
            "Connection failed: link lost"
        );
        assert_eq!(
            Error::timeout("connect").to_string(),
            "Timed out during connect"
        );
    }
}
