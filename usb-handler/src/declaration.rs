//! Parsing of handler capability metadata.
//!
//! Handlers ship an XML document listing `<usb-device>` filters (devices they
//! handle directly) and `<usb-aoap-accessory>` entries (accessory identities to
//! probe with). Only those two element kinds are of interest, so the document
//! is scanned rather than parsed into a tree.

use crate::device::UsbDevice;
use crate::filter::{AoapIdentityFilter, DeviceFilter};
use lazy_static::lazy_static;
use regex::{Captures, Regex};
use tracing::{debug, warn};

pub const DEVICE_ELEMENT: &str = "usb-device";
pub const ACCESSORY_ELEMENT: &str = "usb-aoap-accessory";

lazy_static! {
    static ref COMMENT: Regex = Regex::new(r"(?s)<!--.*?-->").unwrap();

    // <usb-device .../> or <usb-aoap-accessory ...>; quoted values may hold '>'
    static ref ELEMENT: Regex = Regex::new(
        r#"<\s*(usb-device|usb-aoap-accessory)((?:\s+[A-Za-z_][-A-Za-z0-9_.:]*\s*=\s*(?:"[^"]*"|'[^']*'))*)\s*/?\s*>"#
    ).unwrap();

    static ref ATTRIBUTE: Regex = Regex::new(
        r#"([A-Za-z_][-A-Za-z0-9_.:]*)\s*=\s*(?:"([^"]*)"|'([^']*)')"#
    ).unwrap();

    static ref ENTITY: Regex = Regex::new(r"&(?:#([0-9]+)|#[xX]([0-9A-Fa-f]+)|([A-Za-z]+));").unwrap();
}

/// All filters declared in one handler's metadata, in document order
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CapabilityDeclaration {
    pub device_filters: Vec<DeviceFilter>,
    pub accessory_filters: Vec<AoapIdentityFilter>,
}

impl CapabilityDeclaration {
    /// Scan a metadata document. Malformed `<usb-device>` entries are dropped
    /// with a warning.
    pub fn parse(xml: &str) -> Self {
        let stripped = COMMENT.replace_all(xml, "");
        let mut declaration = Self::default();

        for caps in ELEMENT.captures_iter(&stripped) {
            let tag = &caps[1];
            let attributes = parse_attributes(&caps[2]);

            if tag == DEVICE_ELEMENT {
                match DeviceFilter::from_attributes(&attributes) {
                    Ok(filter) => declaration.device_filters.push(filter),
                    Err(e) => warn!("Dropping malformed <{}> declaration: {}", DEVICE_ELEMENT, e),
                }
            } else {
                declaration
                    .accessory_filters
                    .push(AoapIdentityFilter::from_attributes(&attributes));
            }
        }

        debug!(
            "Parsed {} device filter(s), {} accessory filter(s)",
            declaration.device_filters.len(),
            declaration.accessory_filters.len()
        );
        declaration
    }

    /// First `<usb-device>` filter matching the device
    pub fn first_match(&self, device: &UsbDevice) -> Option<&DeviceFilter> {
        self.device_filters.iter().find(|f| f.matches(device))
    }

    /// First `<usb-aoap-accessory>` entry; accessory entries are not matched
    /// against the device, the probe decides
    pub fn accessory(&self) -> Option<&AoapIdentityFilter> {
        self.accessory_filters.first()
    }
}

fn parse_attributes(raw: &str) -> Vec<(String, String)> {
    ATTRIBUTE
        .captures_iter(raw)
        .map(|caps| {
            let value = caps
                .get(2)
                .or_else(|| caps.get(3))
                .map(|m| m.as_str())
                .unwrap_or("");
            (caps[1].to_string(), decode_entities(value))
        })
        .collect()
}

fn decode_entities(value: &str) -> String {
    if !value.contains('&') {
        return value.to_string();
    }
    // Single pass, so "&amp;lt;" stays "&lt;"
    ENTITY
        .replace_all(value, |caps: &Captures<'_>| {
            let decoded = if let Some(decimal) = caps.get(1) {
                decimal.as_str().parse().ok().and_then(char::from_u32)
            } else if let Some(hex) = caps.get(2) {
                u32::from_str_radix(hex.as_str(), 16)
                    .ok()
                    .and_then(char::from_u32)
            } else {
                match &caps[3] {
                    "lt" => Some('<'),
                    "gt" => Some('>'),
                    "quot" => Some('"'),
                    "apos" => Some('\''),
                    "amp" => Some('&'),
                    _ => None,
                }
            };
            decoded
                .map(String::from)
                .unwrap_or_else(|| caps[0].to_string())
        })
        .into_owned()
}
