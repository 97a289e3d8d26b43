//! Runtime permission negotiation.
//!
//! Some hosts (Android) must grant runtime permissions before a BLE scan
//! may start. The set depends on the platform version: API levels below
//! 31 need a single location permission, 31 and above need the split
//! scan, connect and location permissions. Hosts without runtime grants
//! always pass.

use async_trait::async_trait;
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::error::{Error, Result};

/// First Android API level with the split Bluetooth permissions.
pub const ANDROID_SPLIT_PERMISSIONS_API_LEVEL: u32 = 31;

/// A runtime capability that may need a grant.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Permission {
    /// Fine location, required for BLE scanning on older Android versions
    /// and still requested alongside the split permissions.
    AccessFineLocation,
    /// Scan for nearby BLE devices.
    BluetoothScan,
    /// Connect to paired or discovered BLE devices.
    BluetoothConnect,
}

impl Permission {
    /// Platform name of the permission.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::AccessFineLocation => "android.permission.ACCESS_FINE_LOCATION",
            Self::BluetoothScan => "android.permission.BLUETOOTH_SCAN",
            Self::BluetoothConnect => "android.permission.BLUETOOTH_CONNECT",
        }
    }
}

impl std::fmt::Display for Permission {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Answer to a single permission prompt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PermissionStatus {
    /// The user granted the permission.
    Granted,
    /// The user denied the permission.
    Denied,
    /// The user denied the permission and asked not to be prompted again.
    NeverAskAgain,
}

impl PermissionStatus {
    /// Check if the permission was granted.
    pub fn is_granted(&self) -> bool {
        matches!(self, Self::Granted)
    }
}

/// The host the session runs on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Platform {
    /// Android with the given API level.
    Android {
        /// `Build.VERSION.SDK_INT` of the device.
        api_level: u32,
    },
    /// iOS; Bluetooth access is granted by the system prompt.
    Ios,
    /// Desktop host; no runtime grants.
    Desktop,
}

impl Platform {
    /// Permissions to request, in request order.
    pub fn required_permissions(&self) -> Vec<Permission> {
        match self {
            Self::Android { api_level } if *api_level < ANDROID_SPLIT_PERMISSIONS_API_LEVEL => {
                vec![Permission::AccessFineLocation]
            }
            Self::Android { .. } => vec![
                Permission::BluetoothScan,
                Permission::BluetoothConnect,
                Permission::AccessFineLocation,
            ],
            Self::Ios | Self::Desktop => Vec::new(),
        }
    }

    /// Check if this platform uses runtime grants at all.
    pub fn requires_runtime_grants(&self) -> bool {
        !self.required_permissions().is_empty()
    }
}

/// Host prompt for a single permission.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait PermissionBackend: Send + Sync {
    /// Prompt for a permission and report the answer.
    async fn request(&self, permission: Permission) -> Result<PermissionStatus>;
}

/// Backend for hosts that never prompt; every request is granted.
#[derive(Debug, Clone, Copy, Default)]
pub struct HostPermissions;

#[async_trait]
impl PermissionBackend for HostPermissions {
    async fn request(&self, _permission: Permission) -> Result<PermissionStatus> {
        Ok(PermissionStatus::Granted)
    }
}

/// Resolves the runtime permissions needed before scanning.
pub struct PermissionGate {
    platform: Platform,
    backend: Arc<dyn PermissionBackend>,
}

impl PermissionGate {
    /// Create a gate for a platform.
    pub fn new(platform: Platform, backend: Arc<dyn PermissionBackend>) -> Self {
        Self { platform, backend }
    }

    /// Gate for a host without runtime grants.
    pub fn desktop() -> Self {
        Self::new(Platform::Desktop, Arc::new(HostPermissions))
    }

    /// Get the platform.
    pub fn platform(&self) -> Platform {
        self.platform
    }

    /// Request every required permission.
    ///
    /// Returns `true` only if all of them were granted. Denials are logged
    /// and never retried; the caller decides whether to ask again.
    pub async fn request_permissions(&self) -> bool {
        self.ensure_permissions().await.is_ok()
    }

    /// Request every required permission, in order.
    ///
    /// All permissions are prompted for even after a denial, so the user
    /// sees each prompt once per call.
    ///
    /// # Errors
    ///
    /// Returns [`Error::PermissionDenied`] naming the refused permissions.
    pub async fn ensure_permissions(&self) -> Result<()> {
        let required = self.platform.required_permissions();

        if required.is_empty() {
            debug!("No runtime permissions required on {:?}", self.platform);
            return Ok(());
        }

        let mut denied = Vec::new();

        for permission in required {
            match self.backend.request(permission).await {
                Ok(status) if status.is_granted() => {
                    debug!("Permission granted: {}", permission);
                }
                Ok(status) => {
                    warn!("Permission {} refused: {:?}", permission, status);
                    denied.push(permission);
                }
                Err(e) => {
                    warn!("Permission request for {} failed: {}", permission, e);
                    denied.push(permission);
                }
            }
        }

        if denied.is_empty() {
            info!("Permissions enabled");
            Ok(())
        } else {
            Err(Error::PermissionDenied {
                permission: denied
                    .iter()
                    .map(Permission::as_str)
                    .collect::<Vec<_>>()
                    .join(", "),
            })
        }
    }
}
