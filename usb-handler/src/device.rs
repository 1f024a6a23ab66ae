//! USB device descriptors and identities.
//!
//! These are the values the platform hands us on attach. A `UsbDevice` is the
//! full descriptor (including interfaces); a `DeviceIdentity` is the subset that
//! survives a reconnect and keys persisted handler settings.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Vendor id a device reports once it has switched into accessory mode
pub const AOAP_VENDOR_ID: u16 = 0x18d1;

/// Product id of an accessory-mode device
pub const AOAP_PRODUCT_ID: u16 = 0x2d00;

/// Accessory-mode product ids (accessory, +adb, audio, audio+adb, accessory+audio, all)
pub const AOAP_PRODUCT_IDS: &[u16] = &[0x2d00, 0x2d01, 0x2d02, 0x2d03, 0x2d04, 0x2d05];

/// Class/subclass/protocol triple of one interface descriptor
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct UsbInterface {
    pub class: u8,
    pub subclass: u8,
    pub protocol: u8,
}

impl UsbInterface {
    pub fn new(class: u8, subclass: u8, protocol: u8) -> Self {
        Self {
            class,
            subclass,
            protocol,
        }
    }
}

/// A USB device as reported by the host at attach time
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UsbDevice {
    /// Bus path (e.g., "/dev/bus/usb/001/004"); changes on every re-enumeration
    pub name: String,
    pub vendor_id: u16,
    pub product_id: u16,
    #[serde(default)]
    pub class: u8,
    #[serde(default)]
    pub subclass: u8,
    #[serde(default)]
    pub protocol: u8,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub manufacturer_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub product_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub serial_number: Option<String>,
    #[serde(default)]
    pub interfaces: Vec<UsbInterface>,
}

impl UsbDevice {
    /// Whether the device currently presents accessory-mode descriptors
    pub fn is_in_aoap_mode(&self) -> bool {
        self.vendor_id == AOAP_VENDOR_ID && AOAP_PRODUCT_IDS.contains(&self.product_id)
    }

    /// Identity used to persist handler choices across reconnects
    pub fn identity(&self) -> DeviceIdentity {
        DeviceIdentity {
            serial: self.serial_key().to_string(),
            vendor_id: self.vendor_id,
            product_id: self.product_id,
        }
    }

    /// Serial number, or the empty string for devices that do not report one
    pub fn serial_key(&self) -> &str {
        self.serial_number.as_deref().unwrap_or("")
    }

    /// Human-readable name stored next to a persisted setting
    pub fn display_name(&self) -> String {
        match (&self.manufacturer_name, &self.product_name) {
            (Some(m), Some(p)) => format!("{} {}", m, p),
            (None, Some(p)) => p.clone(),
            (Some(m), None) => m.clone(),
            (None, None) => format!("{:04x}:{:04x}", self.vendor_id, self.product_id),
        }
    }
}

/// Identifies one physical device across reconnects
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct DeviceIdentity {
    pub serial: String,
    pub vendor_id: u16,
    pub product_id: u16,
}

impl DeviceIdentity {
    pub fn new(serial: impl Into<String>, vendor_id: u16, product_id: u16) -> Self {
        Self {
            serial: serial.into(),
            vendor_id,
            product_id,
        }
    }
}

impl fmt::Display for DeviceIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} ({:04x}:{:04x})",
            self.serial, self.vendor_id, self.product_id
        )
    }
}
