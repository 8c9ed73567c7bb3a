//! Server settings, loadable from a JSON file.

use std::path::Path;

use appkit_types::{AppKitError, Result, StreamConfig};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Socket address to listen on.
    pub bind: String,
    pub stream: StreamConfig,
    /// Serve the built-in ticker for streams started by POST.
    pub demo_source: bool,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: "127.0.0.1:8080".to_string(),
            stream: StreamConfig::default(),
            demo_source: true,
        }
    }
}

impl ServerConfig {
    pub fn from_file(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)?;
        let config: ServerConfig = serde_json::from_str(&text)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.bind.trim().is_empty() {
            return Err(AppKitError::InvalidConfig("bind address is empty".into()));
        }
        self.stream.validate()
    }
}
