//! Agent Configuration

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Agent configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentConfig {
    /// Host identity; falls back to the `HOSTNAME` environment variable
    pub host_id: Option<String>,
    /// Local API listen address
    pub listen_addr: String,
    /// Flow table cadence
    pub flow: FlowConfig,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            host_id: None,
            listen_addr: "127.0.0.1:8082".into(),
            flow: FlowConfig::default(),
        }
    }
}

impl AgentConfig {
    /// Load from file
    pub fn load(path: &str) -> Result<Self, std::io::Error> {
        let content = std::fs::read_to_string(path)?;
        serde_json::from_str(&content)
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))
    }

    /// Save to file
    pub fn save(&self, path: &str) -> Result<(), std::io::Error> {
        let content = serde_json::to_string_pretty(self)
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))?;
        std::fs::write(path, content)
    }
}

/// Update/expire cadence applied to every allocated flow table
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FlowConfig {
    /// Seconds between update callbacks
    pub update_every_secs: u64,
    /// Only flows seen within this window are reported as updated
    pub update_window_secs: u64,
    /// Seconds between expiration passes
    pub expire_every_secs: u64,
    /// Flows idle for longer than this are expired
    pub expire_window_secs: u64,
}

impl Default for FlowConfig {
    fn default() -> Self {
        Self {
            update_every_secs: 30,
            update_window_secs: 60,
            expire_every_secs: 60,
            expire_window_secs: 300,
        }
    }
}

impl FlowConfig {
    pub fn update_every(&self) -> Duration {
        Duration::from_secs(self.update_every_secs)
    }

    pub fn update_window(&self) -> Duration {
        Duration::from_secs(self.update_window_secs)
    }

    pub fn expire_every(&self) -> Duration {
        Duration::from_secs(self.expire_every_secs)
    }

    pub fn expire_window(&self) -> Duration {
        Duration::from_secs(self.expire_window_secs)
    }
}
