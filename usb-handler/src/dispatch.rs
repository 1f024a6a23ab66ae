//! Device dispatch.
//!
//! Entry point for attached devices. A remembered handler is used directly;
//! otherwise the resolver produces candidates and the caller (or the
//! single-candidate shortcut) picks one. A successful dispatch grants the
//! handler permission, launches it and remembers the choice.

use crate::component::ComponentName;
use crate::config::{Config, DispatchConfig};
use crate::declaration::CapabilityDeclaration;
use crate::device::UsbDevice;
use crate::filter::AoapIdentityFilter;
use crate::platform::{DeviceAttachedIntent, HandlerDeclaration, Platform, PlatformError};
use crate::resolver::{Candidate, CandidateResolver, ResolveError, ResolverConfig};
use crate::settings::{HandlerSetting, SettingsStore, StorageError};
use serde::Serialize;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::{mpsc, Mutex};
use tracing::{debug, error, info, warn};

#[derive(Error, Debug)]
pub enum DispatchError {
    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),
    #[error("Resolution error: {0}")]
    Resolve(#[from] ResolveError),
}

/// Progress notifications for whoever presents handler choices
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum HandlerEvent {
    ProcessingStarted {
        device: UsbDevice,
    },
    CandidatesResolved {
        device: UsbDevice,
        candidates: Vec<Candidate>,
    },
    Dispatched {
        device: UsbDevice,
        handler: ComponentName,
    },
    DispatchFailed {
        device: UsbDevice,
        handler: ComponentName,
    },
}

/// How processing an attached device ended
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProcessOutcome {
    Dispatched(ComponentName),
    /// Several handlers qualify; the caller picks one and calls `dispatch`
    AwaitingChoice(Vec<Candidate>),
    NoHandlers,
    /// The device detached before resolution finished
    Cancelled,
}

pub struct DispatchController {
    resolver: CandidateResolver,
    platform: Platform,
    settings: Arc<Mutex<SettingsStore>>,
    events: mpsc::UnboundedSender<HandlerEvent>,
    auto_dispatch_single: bool,
}

impl DispatchController {
    pub fn new(
        resolver: CandidateResolver,
        platform: Platform,
        settings: SettingsStore,
        config: &DispatchConfig,
        events: mpsc::UnboundedSender<HandlerEvent>,
    ) -> Self {
        Self {
            resolver,
            platform,
            settings: Arc::new(Mutex::new(settings)),
            events,
            auto_dispatch_single: config.auto_dispatch_single,
        }
    }

    /// Open the configured settings database and start a resolver.
    /// Must be called from within a tokio runtime.
    pub fn from_config(
        platform: Platform,
        config: &Config,
        events: mpsc::UnboundedSender<HandlerEvent>,
    ) -> Result<Self, DispatchError> {
        let settings = SettingsStore::open(config.storage.resolved_db_path())?;
        let resolver =
            CandidateResolver::spawn(platform.clone(), ResolverConfig::from(&config.timing));
        Ok(Self::new(
            resolver,
            platform,
            settings,
            &config.dispatch,
            events,
        ))
    }

    pub fn resolver(&self) -> &CandidateResolver {
        &self.resolver
    }

    /// Handle a newly attached device
    pub async fn process_device(&self, device: UsbDevice) -> Result<ProcessOutcome, DispatchError> {
        let identity = device.identity();

        let saved = self.settings.lock().await.get_settings(&identity)?;
        if let Some(setting) = saved {
            info!("Using saved handler {} for {}", setting.handler, identity);
            if self.dispatch(&device, &setting.handler, setting.aoap).await? {
                return Ok(ProcessOutcome::Dispatched(setting.handler));
            }
            warn!(
                "Saved handler {} failed for {}, resolving again",
                setting.handler, identity
            );
        }

        self.emit(HandlerEvent::ProcessingStarted {
            device: device.clone(),
        });

        let candidates = match self.resolver.resolve(device.clone()).await {
            Ok(candidates) => candidates,
            Err(ResolveError::Cancelled) => {
                info!("Resolution for {} cancelled", identity);
                return Ok(ProcessOutcome::Cancelled);
            }
            Err(e) => return Err(e.into()),
        };

        self.emit(HandlerEvent::CandidatesResolved {
            device: device.clone(),
            candidates: candidates.clone(),
        });

        if candidates.is_empty() {
            info!("No handlers for {}", identity);
            return Ok(ProcessOutcome::NoHandlers);
        }

        if self.auto_dispatch_single && candidates.len() == 1 {
            let only = &candidates[0];
            if self.dispatch(&device, &only.handler, only.requires_aoap).await? {
                return Ok(ProcessOutcome::Dispatched(only.handler.clone()));
            }
        }

        Ok(ProcessOutcome::AwaitingChoice(candidates))
    }

    /// Hand `device` to `handler`, switching it to accessory mode first when
    /// `want_aoap` is set. Returns whether the handler was launched.
    ///
    /// The choice is remembered under the identity the device had when it
    /// was passed in, so the next attach finds it before any mode switch.
    pub async fn dispatch(
        &self,
        device: &UsbDevice,
        handler: &ComponentName,
        want_aoap: bool,
    ) -> Result<bool, DispatchError> {
        debug!(
            "Dispatching {} to {} (aoap: {})",
            device.identity(),
            handler,
            want_aoap
        );

        let Some(declaration) = self.platform.packages.resolve_activity(handler) else {
            warn!("Activity not found: {}", handler);
            self.dispatch_failed(device, handler);
            return Ok(false);
        };

        let mut target = device.clone();
        let mut switched = false;
        if want_aoap && !device.is_in_aoap_mode() {
            match accessory_filter(&declaration) {
                Some(filter) => {
                    match self
                        .resolver
                        .switch_for_dispatch(device.clone(), filter)
                        .await
                    {
                        Ok(accessory) => {
                            target = accessory;
                            switched = true;
                        }
                        Err(e @ (ResolveError::AoapSwitchFailed(_) | ResolveError::Cancelled)) => {
                            warn!("Cannot dispatch {} to {}: {}", device.identity(), handler, e);
                            self.dispatch_failed(device, handler);
                            return Ok(false);
                        }
                        Err(e) => return Err(e.into()),
                    }
                }
                None => warn!(
                    "{} declares no accessory identity, dispatching without a switch",
                    handler
                ),
            }
        }

        let delivered = self.deliver(&target, &declaration);
        if switched {
            self.resolver.complete_dispatch(device);
        }
        if let Err(e) = delivered {
            warn!("Dispatch of {} to {} failed: {}", device.identity(), handler, e);
            self.dispatch_failed(device, handler);
            return Ok(false);
        }

        let setting = HandlerSetting::for_device(device, handler.clone(), want_aoap);
        if let Err(e) = self.settings.lock().await.save_settings(&setting) {
            error!("Failed to save settings for {}: {}", setting.identity, e);
        }

        info!("Dispatched {} to {}", device.identity(), handler);
        self.emit(HandlerEvent::Dispatched {
            device: target,
            handler: handler.clone(),
        });
        Ok(true)
    }

    pub fn device_detached(&self, device: &UsbDevice) {
        self.resolver.device_detached(device);
    }

    fn deliver(
        &self,
        device: &UsbDevice,
        declaration: &HandlerDeclaration,
    ) -> Result<(), PlatformError> {
        self.platform
            .usb
            .grant_permission(device, declaration.uid)?;
        self.platform.usb.start_activity(DeviceAttachedIntent::new(
            declaration.component.clone(),
            device.clone(),
        ))
    }

    fn dispatch_failed(&self, device: &UsbDevice, handler: &ComponentName) {
        self.emit(HandlerEvent::DispatchFailed {
            device: device.clone(),
            handler: handler.clone(),
        });
    }

    fn emit(&self, event: HandlerEvent) {
        if self.events.send(event).is_err() {
            debug!("No listener for handler events");
        }
    }
}

fn accessory_filter(declaration: &HandlerDeclaration) -> Option<AoapIdentityFilter> {
    let metadata = declaration.metadata.as_deref()?;
    CapabilityDeclaration::parse(metadata).accessory().cloned()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::UsbInterface;

    #[test]
    fn test_event_serialization() {
        let device = UsbDevice {
            name: "/dev/bus/usb/001/002".to_string(),
            vendor_id: 0x04e8,
            product_id: 0x6860,
            class: 0,
            subclass: 0,
            protocol: 0,
            manufacturer_name: None,
            product_name: None,
            serial_number: Some("S2".to_string()),
            interfaces: vec![UsbInterface::new(255, 66, 1)],
        };
        let event = HandlerEvent::Dispatched {
            device,
            handler: ComponentName::new("com.example.nav", "com.example.nav.UsbActivity"),
        };

        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["event"], "dispatched");
        assert_eq!(json["device"]["serial_number"], "S2");
        assert_eq!(json["handler"]["package"], "com.example.nav");
    }

    #[test]
    fn test_accessory_filter_from_metadata() {
        let declaration = HandlerDeclaration {
            component: ComponentName::new("com.example.aa", "com.example.aa.UsbActivity"),
            uid: 10_050,
            metadata: Some(
                r#"<usb-aoap-accessory model="Android Auto" service="com.example.aa/.Check"/>"#
                    .to_string(),
            ),
        };
        let filter = accessory_filter(&declaration).unwrap();
        assert_eq!(filter.model.as_deref(), Some("Android Auto"));

        let bare = HandlerDeclaration {
            metadata: None,
            ..declaration
        };
        assert!(accessory_filter(&bare).is_none());
    }
}
