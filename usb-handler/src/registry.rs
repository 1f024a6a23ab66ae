//! File-backed package registry.
//!
//! Handler declarations come from a TOML manifest:
//!
//! ```toml
//! [[handler]]
//! package = "com.example.nav"
//! activity = ".UsbActivity"
//! uid = 10050
//! metadata = "nav_filters.xml"   # relative to the manifest
//! ```
//!
//! `metadata_inline` may carry the XML directly instead. Entries are
//! discovered in file order.

use crate::component::{ComponentName, InvalidComponent};
use crate::platform::{HandlerDeclaration, PackageRegistry};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::{debug, info, warn};

#[derive(Error, Debug)]
pub enum RegistryError {
    #[error("Failed to read manifest {path:?}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("Invalid manifest: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("Invalid handler activity: {0}")]
    InvalidActivity(#[from] InvalidComponent),
}

#[derive(Debug, Deserialize)]
struct Manifest {
    #[serde(default, rename = "handler")]
    handlers: Vec<ManifestEntry>,
}

#[derive(Debug, Deserialize)]
struct ManifestEntry {
    package: String,
    activity: String,
    #[serde(default)]
    uid: u32,
    #[serde(default)]
    metadata: Option<PathBuf>,
    #[serde(default)]
    metadata_inline: Option<String>,
}

/// Package registry backed by a fixed list of declarations
#[derive(Debug, Clone, Default)]
pub struct ManifestRegistry {
    handlers: Vec<HandlerDeclaration>,
}

impl ManifestRegistry {
    pub fn from_declarations(handlers: Vec<HandlerDeclaration>) -> Self {
        Self { handlers }
    }

    /// Load a manifest file. Metadata paths resolve against its directory.
    pub fn load(path: &Path) -> Result<Self, RegistryError> {
        let contents = std::fs::read_to_string(path).map_err(|source| RegistryError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        let base_dir = path.parent().unwrap_or_else(|| Path::new("."));
        let registry = Self::parse(&contents, base_dir)?;
        info!(
            "Loaded {} handler declaration(s) from {:?}",
            registry.handlers.len(),
            path
        );
        Ok(registry)
    }

    pub fn parse(contents: &str, base_dir: &Path) -> Result<Self, RegistryError> {
        let manifest: Manifest = toml::from_str(contents)?;

        let mut handlers = Vec::with_capacity(manifest.handlers.len());
        for entry in manifest.handlers {
            let component =
                ComponentName::unflatten(&format!("{}/{}", entry.package, entry.activity))?;

            let metadata = match (entry.metadata_inline, entry.metadata) {
                (Some(inline), _) => Some(inline),
                (None, Some(relative)) => {
                    let path = base_dir.join(relative);
                    match std::fs::read_to_string(&path) {
                        Ok(xml) => Some(xml),
                        Err(e) => {
                            warn!("Cannot read metadata {:?} for {}: {}", path, component, e);
                            None
                        }
                    }
                }
                (None, None) => None,
            };

            debug!("Declared handler {} (uid {})", component, entry.uid);
            handlers.push(HandlerDeclaration {
                component,
                uid: entry.uid,
                metadata,
            });
        }

        Ok(Self { handlers })
    }

    pub fn handlers(&self) -> &[HandlerDeclaration] {
        &self.handlers
    }
}

impl PackageRegistry for ManifestRegistry {
    fn query_handlers(&self) -> Vec<HandlerDeclaration> {
        self.handlers.clone()
    }

    fn resolve_activity(&self, component: &ComponentName) -> Option<HandlerDeclaration> {
        self.handlers
            .iter()
            .find(|h| &h.component == component)
            .cloned()
    }
}
