//! Shared fakes for the integration tests.
//!
//! Each fake records what it was asked to do so tests can assert on the
//! sequence of platform calls.

#![allow(dead_code)]

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::Notify;
use usb_handler::platform::{
    AoapNegotiator, AoapSupportCheck, AoapSwitchOutcome, AoapSwitchRequest, DeviceAttachedIntent,
    HandlerDeclaration, PlatformError, ServiceBinder, UsbHost,
};
use usb_handler::{
    ComponentName, ManifestRegistry, Platform, ResolverConfig, UsbDevice, UsbInterface,
};

pub const NAV_METADATA: &str = r#"<?xml version="1.0" encoding="utf-8"?>
<resources>
    <usb-device vendor-id="0x04e8" product-id="0x6860" />
</resources>
"#;

/// Metadata declaring only an accessory identity checked by `service`
pub fn accessory_metadata(model: &str, service: &str) -> String {
    format!(
        r#"<resources>
    <usb-aoap-accessory manufacturer="Android" model="{}" version="1.0" service="{}" />
</resources>"#,
        model, service
    )
}

/// Metadata matching devices already in accessory mode
pub const ACCESSORY_PAIR_METADATA: &str = r#"<resources>
    <usb-device vendor-id="0x18d1" product-id="0x2d00" />
    <usb-aoap-accessory model="Android Auto" service="com.example.aa/.Check" />
</resources>"#;

pub fn handler(package: &str, uid: u32, metadata: &str) -> HandlerDeclaration {
    HandlerDeclaration {
        component: activity(package),
        uid,
        metadata: Some(metadata.to_string()),
    }
}

pub fn activity(package: &str) -> ComponentName {
    ComponentName::new(package, format!("{}.UsbActivity", package))
}

pub fn service(package: &str) -> ComponentName {
    ComponentName::new(package, format!("{}.Check", package))
}

/// Accessory handler whose verification service is `<package>/.Check`
pub fn accessory_handler(package: &str, uid: u32) -> HandlerDeclaration {
    handler(
        package,
        uid,
        &accessory_metadata(package, &format!("{}/.Check", package)),
    )
}

pub fn phone(serial: &str) -> UsbDevice {
    UsbDevice {
        name: "/dev/bus/usb/001/004".to_string(),
        vendor_id: 0x04e8,
        product_id: 0x6860,
        class: 0,
        subclass: 0,
        protocol: 0,
        manufacturer_name: Some("SAMSUNG".to_string()),
        product_name: Some("Galaxy".to_string()),
        serial_number: Some(serial.to_string()),
        interfaces: vec![UsbInterface::new(0xff, 0x42, 0x01)],
    }
}

/// The same physical device after it re-enumerated in accessory mode
pub fn in_accessory_mode(device: &UsbDevice) -> UsbDevice {
    UsbDevice {
        name: format!("{}-aoap", device.name),
        vendor_id: 0x18d1,
        product_id: 0x2d00,
        interfaces: vec![UsbInterface::new(0xff, 0xff, 0x00)],
        ..device.clone()
    }
}

/// Short timings for tests running on the real clock
pub fn fast_config() -> ResolverConfig {
    ResolverConfig {
        bind_timeout: Duration::from_secs(2),
        rpc_timeout: Duration::from_secs(1),
        probe_settle: Duration::from_millis(20),
        reschedule_delay: Duration::from_millis(10),
    }
}

#[derive(Default)]
pub struct FakeNegotiator {
    pub switch_requests: Mutex<Vec<AoapSwitchRequest>>,
    pub resets: Mutex<Vec<UsbDevice>>,
    /// Outcomes for upcoming switches; a successful switch once exhausted
    pub scripted: Mutex<VecDeque<AoapSwitchOutcome>>,
    pub lose_on_reset: AtomicBool,
    originals: Mutex<HashMap<String, UsbDevice>>,
}

impl FakeNegotiator {
    pub fn switch_count(&self) -> usize {
        self.switch_requests.lock().unwrap().len()
    }

    pub fn reset_count(&self) -> usize {
        self.resets.lock().unwrap().len()
    }

    pub fn switched_models(&self) -> Vec<String> {
        self.switch_requests
            .lock()
            .unwrap()
            .iter()
            .map(|r| r.model.clone().unwrap_or_default())
            .collect()
    }
}

#[async_trait::async_trait]
impl AoapNegotiator for FakeNegotiator {
    async fn start_aoap(&self, request: AoapSwitchRequest) -> AoapSwitchOutcome {
        let device = request.device.clone();
        self.switch_requests.lock().unwrap().push(request);

        let scripted = self.scripted.lock().unwrap().pop_front();
        let outcome =
            scripted.unwrap_or_else(|| AoapSwitchOutcome::Switched(in_accessory_mode(&device)));
        if let AoapSwitchOutcome::Switched(_) = outcome {
            self.originals
                .lock()
                .unwrap()
                .entry(device.serial_key().to_string())
                .or_insert(device);
        }
        outcome
    }

    async fn reset_device(&self, device: &UsbDevice) -> Option<UsbDevice> {
        self.resets.lock().unwrap().push(device.clone());
        if self.lose_on_reset.load(Ordering::SeqCst) {
            return None;
        }
        let original = self
            .originals
            .lock()
            .unwrap()
            .get(device.serial_key())
            .cloned();
        Some(original.unwrap_or_else(|| device.clone()))
    }
}

#[derive(Debug, Clone)]
pub enum ServiceBehavior {
    Supported(bool),
    RpcError,
    BindFails,
    /// Bind never completes
    Hangs,
    /// Bind succeeds but the verification call never answers
    SlowRpc,
}

struct FakeCheck {
    /// `None` never answers
    answer: Option<Result<bool, PlatformError>>,
    checked: Arc<Mutex<Vec<UsbDevice>>>,
}

#[async_trait::async_trait]
impl AoapSupportCheck for FakeCheck {
    async fn is_device_supported(&self, device: &UsbDevice) -> Result<bool, PlatformError> {
        self.checked.lock().unwrap().push(device.clone());
        match &self.answer {
            Some(answer) => answer.clone(),
            None => std::future::pending().await,
        }
    }
}

#[derive(Default)]
pub struct FakeBinder {
    behaviors: Mutex<HashMap<ComponentName, ServiceBehavior>>,
    pub bound: Mutex<Vec<ComponentName>>,
    pub unbound: Mutex<Vec<ComponentName>>,
    /// Devices handed to verification calls
    pub checked: Arc<Mutex<Vec<UsbDevice>>>,
    pub bind_called: Notify,
}

impl FakeBinder {
    pub fn set(&self, service: ComponentName, behavior: ServiceBehavior) {
        self.behaviors.lock().unwrap().insert(service, behavior);
    }

    pub fn bound(&self) -> Vec<ComponentName> {
        self.bound.lock().unwrap().clone()
    }

    pub fn unbound(&self) -> Vec<ComponentName> {
        self.unbound.lock().unwrap().clone()
    }
}

#[async_trait::async_trait]
impl ServiceBinder for FakeBinder {
    async fn bind(
        &self,
        component: &ComponentName,
    ) -> Result<Arc<dyn AoapSupportCheck>, PlatformError> {
        self.bound.lock().unwrap().push(component.clone());
        self.bind_called.notify_one();

        let behavior = self
            .behaviors
            .lock()
            .unwrap()
            .get(component)
            .cloned()
            .unwrap_or(ServiceBehavior::BindFails);

        let answer = match behavior {
            ServiceBehavior::Supported(supported) => Some(Ok(supported)),
            ServiceBehavior::RpcError => {
                Some(Err(PlatformError::RemoteCall("binder died".to_string())))
            }
            ServiceBehavior::SlowRpc => None,
            ServiceBehavior::BindFails => {
                return Err(PlatformError::BindFailed(component.flatten()));
            }
            ServiceBehavior::Hangs => std::future::pending().await,
        };

        Ok(Arc::new(FakeCheck {
            answer,
            checked: self.checked.clone(),
        }))
    }

    fn unbind(&self, component: &ComponentName) {
        self.unbound.lock().unwrap().push(component.clone());
    }
}

#[derive(Default)]
pub struct FakeUsbHost {
    pub grants: Mutex<Vec<(UsbDevice, u32)>>,
    pub launches: Mutex<Vec<DeviceAttachedIntent>>,
    pub deny_permission: AtomicBool,
}

impl UsbHost for FakeUsbHost {
    fn grant_permission(&self, device: &UsbDevice, uid: u32) -> Result<(), PlatformError> {
        if self.deny_permission.load(Ordering::SeqCst) {
            return Err(PlatformError::PermissionDenied(format!("uid {}", uid)));
        }
        self.grants.lock().unwrap().push((device.clone(), uid));
        Ok(())
    }

    fn start_activity(&self, intent: DeviceAttachedIntent) -> Result<(), PlatformError> {
        self.launches.lock().unwrap().push(intent);
        Ok(())
    }
}

pub struct Fakes {
    pub negotiator: Arc<FakeNegotiator>,
    pub binder: Arc<FakeBinder>,
    pub usb: Arc<FakeUsbHost>,
}

pub fn platform(handlers: Vec<HandlerDeclaration>) -> (Platform, Fakes) {
    let fakes = Fakes {
        negotiator: Arc::new(FakeNegotiator::default()),
        binder: Arc::new(FakeBinder::default()),
        usb: Arc::new(FakeUsbHost::default()),
    };
    let platform = Platform {
        packages: Arc::new(ManifestRegistry::from_declarations(handlers)),
        negotiator: fakes.negotiator.clone(),
        services: fakes.binder.clone(),
        usb: fakes.usb.clone(),
    };
    (platform, fakes)
}
