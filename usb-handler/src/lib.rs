//! USB Handler Library
//!
//! Decides which installed application receives an attached USB device,
//! probing accessory-mode handlers where needed, and remembers the choice
//! per physical device.

pub mod component;
pub mod config;
pub mod declaration;
pub mod device;
pub mod dispatch;
pub mod filter;
pub mod platform;
pub mod registry;
pub mod resolver;
pub mod settings;

pub use component::ComponentName;
pub use config::Config;
pub use device::{DeviceIdentity, UsbDevice, UsbInterface};
pub use dispatch::{DispatchController, DispatchError, HandlerEvent, ProcessOutcome};
pub use filter::{AoapIdentityFilter, DeviceFilter};
pub use platform::Platform;
pub use registry::ManifestRegistry;
pub use resolver::{Candidate, CandidateResolver, Mode, ResolveError, ResolverConfig};
pub use settings::{HandlerSetting, SettingsStore, StorageError};
