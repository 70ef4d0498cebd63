// SPDX-License-Identifier: PMPL-1.0-or-later
//! Registry and component configuration.
//!
//! A registry is configured with a list of named components, each naming a
//! driver kind and carrying driver-specific string metadata:
//!
//! ```json
//! {
//!   "components": [
//!     {"name": "orders", "type": "state.document",
//!      "metadata": {"collection": "orders", "partitionKey": "tenant-a"}}
//!   ],
//!   "options": {"bulk_parallelism": 8, "default_timeout_ms": 5000}
//! }
//! ```

use std::collections::{HashMap, HashSet};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::encoding::JSON_CONTENT_TYPE;
use crate::error::StateError;
use crate::request::metadata;

/// One configured state store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ComponentConfig {
    /// Name callers resolve the store by.
    pub name: String,
    /// Driver kind, e.g. `state.in-memory`.
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default)]
    pub metadata: HashMap<String, String>,
}

impl ComponentConfig {
    pub fn new(name: impl Into<String>, kind: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            kind: kind.into(),
            metadata: HashMap::new(),
        }
    }

    pub fn with_metadata(mut self, key: &str, value: impl Into<String>) -> Self {
        self.metadata.insert(key.to_string(), value.into());
        self
    }

    pub fn metadata_value(&self, key: &str) -> Option<&str> {
        self.metadata.get(key).map(String::as_str)
    }

    /// Default content type for raw values written through this component.
    pub fn content_type(&self) -> &str {
        self.metadata_value(metadata::CONTENT_TYPE)
            .unwrap_or(JSON_CONTENT_TYPE)
    }
}

/// Options shared by every store the registry creates.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreOptions {
    /// Maximum concurrent per-item calls within one bulk request.
    pub bulk_parallelism: usize,
    /// Deadline applied to calls that bring none of their own.
    pub default_timeout_ms: Option<u64>,
}

impl StoreOptions {
    pub fn default_timeout(&self) -> Option<Duration> {
        self.default_timeout_ms.map(Duration::from_millis)
    }
}

impl Default for StoreOptions {
    fn default() -> Self {
        Self {
            bulk_parallelism: 8,
            default_timeout_ms: None,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RegistryConfig {
    #[serde(default)]
    pub components: Vec<ComponentConfig>,
    #[serde(default)]
    pub options: StoreOptions,
}

impl RegistryConfig {
    /// Parse and validate a JSON configuration document.
    pub fn from_json(text: &str) -> Result<Self, StateError> {
        let config: RegistryConfig = serde_json::from_str(text)
            .map_err(|err| StateError::InvalidConfig(err.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn with_component(mut self, component: ComponentConfig) -> Self {
        self.components.push(component);
        self
    }

    pub fn component(&self, name: &str) -> Option<&ComponentConfig> {
        self.components.iter().find(|c| c.name == name)
    }

    /// Names must be non-empty and unique, and bulk parallelism positive.
    pub fn validate(&self) -> Result<(), StateError> {
        if self.options.bulk_parallelism == 0 {
            return Err(StateError::InvalidConfig(
                "bulk_parallelism must be at least 1".to_string(),
            ));
        }
        let mut seen = HashSet::new();
        for component in &self.components {
            if component.name.is_empty() {
                return Err(StateError::InvalidConfig(
                    "component name must not be empty".to_string(),
                ));
            }
            if component.kind.is_empty() {
                return Err(StateError::InvalidConfig(format!(
                    "component '{}' has no type",
                    component.name
                )));
            }
            if !seen.insert(component.name.as_str()) {
                return Err(StateError::InvalidConfig(format!(
                    "duplicate component name '{}'",
                    component.name
                )));
            }
        }
        Ok(())
    }
}
