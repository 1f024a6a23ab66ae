//! Capability filters declared by handler applications.
//!
//! A `DeviceFilter` describes which devices an application handles; absent
//! fields are wildcards. An `AoapIdentityFilter` carries the accessory strings
//! sent to a device when probing it in accessory mode, plus the component of
//! the service that verifies support afterwards.

use crate::component::ComponentName;
use crate::device::{UsbDevice, AOAP_PRODUCT_ID, AOAP_VENDOR_ID};
use crate::platform::AoapSwitchRequest;
use serde::{Deserialize, Serialize};
use tracing::warn;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum FilterParseError {
    #[error("Invalid number {value:?} for attribute {attribute}")]
    InvalidNumber { attribute: String, value: String },

    #[error("Value {value} out of range for attribute {attribute}")]
    OutOfRange { attribute: String, value: i64 },
}

/// Declarative match against a device descriptor
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceFilter {
    pub vendor_id: Option<u16>,
    pub product_id: Option<u16>,
    pub class: Option<u8>,
    pub subclass: Option<u8>,
    pub protocol: Option<u8>,
    pub manufacturer_name: Option<String>,
    pub product_name: Option<String>,
    pub serial_number: Option<String>,
}

impl DeviceFilter {
    /// Build a filter from `<usb-device>` attributes.
    ///
    /// Unknown attributes are ignored. Any unparsable integer rejects the
    /// whole filter.
    pub fn from_attributes(attributes: &[(String, String)]) -> Result<Self, FilterParseError> {
        let mut filter = Self::default();

        for (name, value) in attributes {
            match name.as_str() {
                "manufacturer-name" => filter.manufacturer_name = Some(value.clone()),
                "product-name" => filter.product_name = Some(value.clone()),
                "serial-number" => filter.serial_number = Some(value.clone()),
                "vendor-id" => filter.vendor_id = parse_u16(name, value)?,
                "product-id" => filter.product_id = parse_u16(name, value)?,
                "class" => filter.class = parse_u8(name, value)?,
                "subclass" => filter.subclass = parse_u8(name, value)?,
                "protocol" => filter.protocol = parse_u8(name, value)?,
                _ => {}
            }
        }

        Ok(filter)
    }

    /// True when every specified field matches the device.
    ///
    /// The class triple is checked against the device descriptor first, then
    /// against each interface.
    pub fn matches(&self, device: &UsbDevice) -> bool {
        if self.vendor_id.is_some_and(|v| v != device.vendor_id) {
            return false;
        }
        if self.product_id.is_some_and(|p| p != device.product_id) {
            return false;
        }
        if !string_matches(&self.manufacturer_name, &device.manufacturer_name)
            || !string_matches(&self.product_name, &device.product_name)
            || !string_matches(&self.serial_number, &device.serial_number)
        {
            return false;
        }

        if self.matches_class(device.class, device.subclass, device.protocol) {
            return true;
        }

        device
            .interfaces
            .iter()
            .any(|intf| self.matches_class(intf.class, intf.subclass, intf.protocol))
    }

    /// Whether this filter targets the reserved accessory-mode vendor/product pair
    pub fn is_aoap(&self) -> bool {
        self.vendor_id == Some(AOAP_VENDOR_ID) && self.product_id == Some(AOAP_PRODUCT_ID)
    }

    fn matches_class(&self, class: u8, subclass: u8, protocol: u8) -> bool {
        self.class.map_or(true, |c| c == class)
            && self.subclass.map_or(true, |s| s == subclass)
            && self.protocol.map_or(true, |p| p == protocol)
    }
}

// A filter that names a string requires the device to report one.
fn string_matches(expected: &Option<String>, actual: &Option<String>) -> bool {
    match (expected, actual) {
        (None, _) => true,
        (Some(_), None) => false,
        (Some(e), Some(a)) => e == a,
    }
}

fn parse_u16(attribute: &str, value: &str) -> Result<Option<u16>, FilterParseError> {
    Ok(parse_field(attribute, value, u16::MAX as i64)?.map(|v| v as u16))
}

fn parse_u8(attribute: &str, value: &str) -> Result<Option<u8>, FilterParseError> {
    Ok(parse_field(attribute, value, u8::MAX as i64)?.map(|v| v as u8))
}

/// Accepts decimal, `0x`/`0X` hex and `-1` (wildcard).
fn parse_field(attribute: &str, value: &str, max: i64) -> Result<Option<i64>, FilterParseError> {
    let trimmed = value.trim();
    let parsed = match trimmed
        .strip_prefix("0x")
        .or_else(|| trimmed.strip_prefix("0X"))
    {
        Some(hex) if !hex.is_empty() => i64::from_str_radix(hex, 16),
        _ => trimmed.parse::<i64>(),
    };

    let number = parsed.map_err(|_| FilterParseError::InvalidNumber {
        attribute: attribute.to_string(),
        value: value.to_string(),
    })?;

    if number == -1 {
        return Ok(None);
    }
    if !(0..=max).contains(&number) {
        return Err(FilterParseError::OutOfRange {
            attribute: attribute.to_string(),
            value: number,
        });
    }
    Ok(Some(number))
}

/// Accessory identity strings sent when switching a device into accessory mode
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AoapIdentityFilter {
    pub manufacturer: Option<String>,
    pub model: Option<String>,
    pub description: Option<String>,
    pub version: Option<String>,
    pub uri: Option<String>,
    pub serial: Option<String>,
    /// Flattened component of the verification service
    pub service: Option<String>,
}

impl AoapIdentityFilter {
    pub fn from_attributes(attributes: &[(String, String)]) -> Self {
        let mut filter = Self::default();
        for (name, value) in attributes {
            let slot = match name.as_str() {
                "manufacturer" => &mut filter.manufacturer,
                "model" => &mut filter.model,
                "description" => &mut filter.description,
                "version" => &mut filter.version,
                "uri" => &mut filter.uri,
                "serial" => &mut filter.serial,
                "service" => &mut filter.service,
                _ => continue,
            };
            *slot = Some(value.clone());
        }
        filter
    }

    /// Verification service component, if declared and well-formed
    pub fn service_component(&self) -> Option<ComponentName> {
        let flat = self.service.as_deref()?;
        match ComponentName::unflatten(flat) {
            Ok(component) => Some(component),
            Err(e) => {
                warn!("Ignoring accessory verification service: {}", e);
                None
            }
        }
    }

    /// Accessory-start request for `device` using these identity strings
    pub fn switch_request(&self, device: &UsbDevice) -> AoapSwitchRequest {
        AoapSwitchRequest {
            device: device.clone(),
            manufacturer: self.manufacturer.clone(),
            model: self.model.clone(),
            description: self.description.clone(),
            version: self.version.clone(),
            uri: self.uri.clone(),
            serial: self.serial.clone(),
        }
    }
}
