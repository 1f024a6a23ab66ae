//! Platform collaborators.
//!
//! The resolver never talks to the USB stack, the package manager or remote
//! services directly. Everything outside this crate is reached through the
//! traits below, handed in at construction as a [`Platform`].

use crate::component::ComponentName;
use crate::device::UsbDevice;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

/// Intent action delivered to the chosen handler
pub const ACTION_USB_DEVICE_ATTACHED: &str = "android.hardware.usb.action.USB_DEVICE_ATTACHED";

/// Errors reported by platform collaborators
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum PlatformError {
    #[error("Failed to bind service {0}")]
    BindFailed(String),

    #[error("Remote call failed: {0}")]
    RemoteCall(String),

    #[error("Timed out: {0}")]
    Timeout(String),

    #[error("Permission grant failed: {0}")]
    PermissionDenied(String),

    #[error("Failed to launch {0}")]
    LaunchFailed(String),
}

/// An installed activity that declared interest in USB device attach
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HandlerDeclaration {
    pub component: ComponentName,
    /// Application uid that receives the USB permission grant
    pub uid: u32,
    /// Capability metadata document, if the activity ships one
    pub metadata: Option<String>,
}

/// Accessory-start request: the strings a device receives before switching
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AoapSwitchRequest {
    pub device: UsbDevice,
    pub manufacturer: Option<String>,
    pub model: Option<String>,
    pub description: Option<String>,
    pub version: Option<String>,
    pub uri: Option<String>,
    pub serial: Option<String>,
}

/// Result of an accessory-mode switch
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AoapSwitchOutcome {
    /// The device re-enumerated in accessory mode
    Switched(UsbDevice),
    /// The switch was attempted and the device refused or never came back
    Failed,
    /// The switch could not even be attempted (no connection, no protocol support)
    NotAttempted,
}

/// Intent addressed directly to the chosen handler
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceAttachedIntent {
    pub action: String,
    pub component: ComponentName,
    pub device: UsbDevice,
}

impl DeviceAttachedIntent {
    pub fn new(component: ComponentName, device: UsbDevice) -> Self {
        Self {
            action: ACTION_USB_DEVICE_ATTACHED.to_string(),
            component,
            device,
        }
    }
}

/// Installed applications and their declared capabilities
pub trait PackageRegistry: Send + Sync {
    /// Every activity that handles device attach, in discovery order
    fn query_handlers(&self) -> Vec<HandlerDeclaration>;

    /// Look up a single activity
    fn resolve_activity(&self, component: &ComponentName) -> Option<HandlerDeclaration>;
}

/// Switches devices into accessory mode and back.
///
/// Implementations own the re-enumeration that follows: the attach/detach
/// broadcasts a switch or reset produces are theirs to absorb.
#[async_trait::async_trait]
pub trait AoapNegotiator: Send + Sync {
    async fn start_aoap(&self, request: AoapSwitchRequest) -> AoapSwitchOutcome;

    /// Reset the device back to its normal descriptors. Returns the
    /// re-enumerated device, or `None` if it did not come back.
    async fn reset_device(&self, device: &UsbDevice) -> Option<UsbDevice>;
}

/// The "is this device supported" call exposed by a verification service
#[async_trait::async_trait]
pub trait AoapSupportCheck: Send + Sync {
    async fn is_device_supported(&self, device: &UsbDevice) -> Result<bool, PlatformError>;
}

/// Binds verification services
#[async_trait::async_trait]
pub trait ServiceBinder: Send + Sync {
    async fn bind(
        &self,
        component: &ComponentName,
    ) -> Result<Arc<dyn AoapSupportCheck>, PlatformError>;

    /// Release a binding. Also called when a bind is abandoned before it completes.
    fn unbind(&self, component: &ComponentName);
}

/// Permission grants and activity launch
pub trait UsbHost: Send + Sync {
    fn grant_permission(&self, device: &UsbDevice, uid: u32) -> Result<(), PlatformError>;

    fn start_activity(&self, intent: DeviceAttachedIntent) -> Result<(), PlatformError>;
}

/// Bundle of collaborators shared by the resolver and the dispatcher
#[derive(Clone)]
pub struct Platform {
    pub packages: Arc<dyn PackageRegistry>,
    pub negotiator: Arc<dyn AoapNegotiator>,
    pub services: Arc<dyn ServiceBinder>,
    pub usb: Arc<dyn UsbHost>,
}
