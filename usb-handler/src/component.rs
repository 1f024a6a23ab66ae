//! Application component references.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Package + class name of an activity or service
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ComponentName {
    pub package: String,
    pub class: String,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("Invalid component name: {0:?}")]
pub struct InvalidComponent(pub String);

impl ComponentName {
    pub fn new(package: impl Into<String>, class: impl Into<String>) -> Self {
        Self {
            package: package.into(),
            class: class.into(),
        }
    }

    /// Flatten to the persisted `package/class` form
    pub fn flatten(&self) -> String {
        format!("{}/{}", self.package, self.class)
    }

    /// Parse `package/class`; a class starting with '.' is relative to the package
    pub fn unflatten(flat: &str) -> Result<Self, InvalidComponent> {
        let (package, class) = flat
            .split_once('/')
            .ok_or_else(|| InvalidComponent(flat.to_string()))?;
        let package = package.trim();
        let class = class.trim();
        if package.is_empty() || class.is_empty() {
            return Err(InvalidComponent(flat.to_string()));
        }

        let class = if class.starts_with('.') {
            format!("{}{}", package, class)
        } else {
            class.to_string()
        };

        Ok(Self::new(package, class))
    }
}

impl FromStr for ComponentName {
    type Err = InvalidComponent;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::unflatten(s)
    }
}

impl fmt::Display for ComponentName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.flatten())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_flatten_roundtrip() {
        let component = ComponentName::new("com.example.nav", "com.example.nav.UsbActivity");
        assert_eq!(component.flatten(), "com.example.nav/com.example.nav.UsbActivity");
        assert_eq!(
            ComponentName::unflatten(&component.flatten()).unwrap(),
            component
        );
    }

    #[test]
    fn test_relative_class() {
        let component: ComponentName = "com.example.aa/.AoapCheckService".parse().unwrap();
        assert_eq!(component.class, "com.example.aa.AoapCheckService");
    }

    #[test]
    fn test_invalid() {
        assert!(ComponentName::unflatten("no-slash").is_err());
        assert!(ComponentName::unflatten("/OnlyClass").is_err());
        assert!(ComponentName::unflatten("pkg/").is_err());
    }
}
