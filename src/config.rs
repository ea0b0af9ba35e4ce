//! Protection configuration loaded from YAML.
//!
//! ```yaml
//! request_timeout_secs: 10
//! user_agent: rseme
//! keys:
//!   7e571d037e571d037e571d037e571d03: 7e5733337e5733337e5733337e573333
//! ```
use std::collections::HashMap;
use std::path::Path;
use std::time::Duration;

use serde::Deserialize;

use crate::error::{Error, Result};
use crate::key_system::StaticKeyProvider;

/// Runtime settings for license acquisition.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ProtectionConfig {
    /// Timeout for remote license requests, in seconds.
    pub request_timeout_secs: u64,
    /// User agent sent to license servers.
    pub user_agent: String,
    /// Hex `kid -> key` table served by the static key provider.
    pub keys: HashMap<String, String>,
}

impl Default for ProtectionConfig {
    fn default() -> Self {
        Self {
            request_timeout_secs: 10,
            user_agent: concat!("rseme/", env!("CARGO_PKG_VERSION")).to_string(),
            keys: HashMap::new(),
        }
    }
}

impl ProtectionConfig {
    pub fn from_yaml_str(yaml: &str) -> Result<Self> {
        let config: Self =
            serde_yaml::from_str(yaml).map_err(|e| Error::Config(format!("Invalid YAML: {}", e)))?;
        if config.request_timeout_secs == 0 {
            return Err(Error::Config(
                "request_timeout_secs must be greater than zero".to_string(),
            ));
        }
        Ok(config)
    }

    pub fn from_path(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let yaml = std::fs::read_to_string(path)
            .map_err(|e| Error::Config(format!("Failed to read {}: {}", path.display(), e)))?;
        Self::from_yaml_str(&yaml)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    /// Key provider serving the configured key table.
    pub fn key_provider(&self) -> Result<StaticKeyProvider> {
        StaticKeyProvider::from_hex_map(&self.keys)
    }
}
