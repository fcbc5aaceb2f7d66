use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::peer::IceServerConfig;

/// Tunables for a client instance. Every field has a serde default so a
/// partial file only overrides what it names.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
#[serde(default)]
pub struct ClientConfig {
    pub reconnect_base_delay_ms: u64,
    pub reconnect_max_delay_ms: u64,
    pub reconnect_max_attempts: u32,
    pub heartbeat_interval_ms: u64,
    pub join_timeout_ms: u64,
    pub call_setup_timeout_ms: u64,
    pub ring_timeout_ms: u64,
    /// How long live chat is held back waiting for the history replay.
    pub history_wait_ms: u64,
    pub ice_servers: Vec<IceServerConfig>,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            reconnect_base_delay_ms: 500,
            reconnect_max_delay_ms: 15_000,
            reconnect_max_attempts: 5,
            heartbeat_interval_ms: 25_000,
            join_timeout_ms: 10_000,
            call_setup_timeout_ms: 10_000,
            ring_timeout_ms: 45_000,
            history_wait_ms: 2_000,
            ice_servers: vec![IceServerConfig {
                urls: vec!["stun:stun.l.google.com:19302".to_string()],
                username: None,
                credential: None,
            }],
        }
    }
}

impl ClientConfig {
    /// Missing or unreadable files yield the defaults.
    pub fn load(path: &Path) -> Self {
        match std::fs::read_to_string(path) {
            Ok(contents) => serde_json::from_str(&contents).unwrap_or_else(|e| {
                tracing::warn!(path = %path.display(), "invalid client config, using defaults: {e}");
                Self::default()
            }),
            Err(_) => Self::default(),
        }
    }

    pub fn save(&self, path: &Path) -> std::io::Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let json = serde_json::to_string_pretty(self).map_err(std::io::Error::other)?;
        std::fs::write(path, json)
    }

    pub fn reconnect_base_delay(&self) -> Duration {
        Duration::from_millis(self.reconnect_base_delay_ms)
    }

    pub fn reconnect_max_delay(&self) -> Duration {
        Duration::from_millis(self.reconnect_max_delay_ms)
    }

    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_millis(self.heartbeat_interval_ms)
    }

    pub fn join_timeout(&self) -> Duration {
        Duration::from_millis(self.join_timeout_ms)
    }

    pub fn call_setup_timeout(&self) -> Duration {
        Duration::from_millis(self.call_setup_timeout_ms)
    }

    pub fn ring_timeout(&self) -> Duration {
        Duration::from_millis(self.ring_timeout_ms)
    }

    pub fn history_wait(&self) -> Duration {
        Duration::from_millis(self.history_wait_ms)
    }
}
