//! Configuration management for the USB handler.
//!
//! Loads configuration from TOML files and provides runtime defaults.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;
use tracing::{info, warn};

/// Main configuration structure
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub general: GeneralConfig,

    #[serde(default)]
    pub storage: StorageConfig,

    #[serde(default)]
    pub timing: TimingConfig,

    #[serde(default)]
    pub dispatch: DispatchConfig,

    #[serde(default)]
    pub registry: RegistryConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GeneralConfig {
    /// Log level (trace, debug, info, warn, error); RUST_LOG takes precedence
    #[serde(default = "default_log_level")]
    pub log_level: String,
}

impl Default for GeneralConfig {
    fn default() -> Self {
        Self {
            log_level: default_log_level(),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StorageConfig {
    /// Settings database; defaults to the local data directory
    #[serde(default)]
    pub db_path: Option<PathBuf>,
}

impl StorageConfig {
    pub fn resolved_db_path(&self) -> PathBuf {
        self.db_path.clone().unwrap_or_else(|| {
            dirs::data_local_dir()
                .unwrap_or_else(|| PathBuf::from("."))
                .join("usb-handler")
                .join("settings.db")
        })
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TimingConfig {
    /// How long to wait for a verification service to bind
    #[serde(default = "default_bind_timeout")]
    pub bind_timeout_ms: u64,

    /// How long a bound verification service may take to answer
    #[serde(default = "default_rpc_timeout")]
    pub rpc_timeout_ms: u64,

    /// Quiet period after the last probe before candidates are reported
    #[serde(default = "default_probe_settle")]
    pub probe_settle_ms: u64,

    /// Retry delay for a device that arrives while another is being resolved
    #[serde(default = "default_reschedule_delay")]
    pub reschedule_delay_ms: u64,
}

impl Default for TimingConfig {
    fn default() -> Self {
        Self {
            bind_timeout_ms: default_bind_timeout(),
            rpc_timeout_ms: default_rpc_timeout(),
            probe_settle_ms: default_probe_settle(),
            reschedule_delay_ms: default_reschedule_delay(),
        }
    }
}

impl TimingConfig {
    pub fn bind_timeout(&self) -> Duration {
        Duration::from_millis(self.bind_timeout_ms)
    }

    pub fn rpc_timeout(&self) -> Duration {
        Duration::from_millis(self.rpc_timeout_ms)
    }

    pub fn probe_settle(&self) -> Duration {
        Duration::from_millis(self.probe_settle_ms)
    }

    pub fn reschedule_delay(&self) -> Duration {
        Duration::from_millis(self.reschedule_delay_ms)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DispatchConfig {
    /// Dispatch without asking when resolution yields exactly one candidate
    #[serde(default = "default_true")]
    pub auto_dispatch_single: bool,
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            auto_dispatch_single: true,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RegistryConfig {
    /// TOML manifest listing handler declarations
    #[serde(default)]
    pub manifest_path: Option<PathBuf>,
}

// Default value functions for serde
fn default_true() -> bool {
    true
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_bind_timeout() -> u64 {
    5000
}

fn default_rpc_timeout() -> u64 {
    5000
}

fn default_probe_settle() -> u64 {
    200
}

fn default_reschedule_delay() -> u64 {
    100
}

impl Config {
    /// Load configuration from the default path
    pub fn load() -> Self {
        Self::load_from_path(Self::default_config_path())
    }

    /// Load configuration from a specific path
    pub fn load_from_path(path: PathBuf) -> Self {
        match std::fs::read_to_string(&path) {
            Ok(contents) => match toml::from_str(&contents) {
                Ok(config) => {
                    info!("Loaded configuration from {:?}", path);
                    config
                }
                Err(e) => {
                    warn!("Failed to parse config file: {}, using defaults", e);
                    Self::default()
                }
            },
            Err(_) => {
                info!("No config file found at {:?}, using defaults", path);
                Self::default()
            }
        }
    }

    /// Get the default configuration file path
    pub fn default_config_path() -> PathBuf {
        dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("usb-handler")
            .join("config.toml")
    }

    /// Save configuration to a specific path
    pub fn save_to_path(&self, path: PathBuf) -> std::io::Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let contents = toml::to_string_pretty(self).map_err(|e| {
            std::io::Error::new(std::io::ErrorKind::InvalidData, e.to_string())
        })?;

        std::fs::write(&path, contents)?;
        info!("Saved configuration to {:?}", path);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert_eq!(config.timing.bind_timeout(), Duration::from_secs(5));
        assert_eq!(config.timing.probe_settle(), Duration::from_millis(200));
        assert_eq!(config.timing.reschedule_delay(), Duration::from_millis(100));
        assert!(config.dispatch.auto_dispatch_single);
        assert!(config
            .storage
            .resolved_db_path()
            .ends_with("usb-handler/settings.db"));
    }

    #[test]
    fn test_parse_toml() {
        let toml_str = r#"
[general]
log_level = "debug"

[storage]
db_path = "/var/lib/usb-handler/settings.db"

[timing]
bind_timeout_ms = 2500

[dispatch]
auto_dispatch_single = false
"#;

        let config: Config = toml::from_str(toml_str).unwrap();
        assert_eq!(config.general.log_level, "debug");
        assert_eq!(config.timing.bind_timeout_ms, 2500);
        // Unspecified keys keep their defaults
        assert_eq!(config.timing.probe_settle_ms, 200);
        assert!(!config.dispatch.auto_dispatch_single);
        assert_eq!(
            config.storage.resolved_db_path(),
            PathBuf::from("/var/lib/usb-handler/settings.db")
        );
    }

    #[test]
    fn test_save_and_reload() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");

        let mut config = Config::default();
        config.timing.rpc_timeout_ms = 750;
        config.save_to_path(path.clone()).unwrap();

        let loaded = Config::load_from_path(path);
        assert_eq!(loaded.timing.rpc_timeout_ms, 750);
    }

    #[test]
    fn test_malformed_file_falls_back() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(&path, "timing = [not toml").unwrap();

        let loaded = Config::load_from_path(path);
        assert_eq!(loaded.timing.bind_timeout_ms, 5000);
    }
}
