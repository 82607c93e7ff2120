//! Relay server configuration, loaded once at startup from a JSON file.

use std::path::Path;
use std::time::Duration;

use cbr_proto::SessionCipher;
use serde::{Deserialize, Serialize};

use crate::error::{Result, ServerError};

fn default_name() -> String {
    "CBR".to_string()
}

fn default_host() -> String {
    "127.0.0.1".to_string()
}

fn default_port() -> u16 {
    30001
}

fn default_idle_timeout_secs() -> u64 {
    120
}

fn default_ping_interval_secs() -> u64 {
    60
}

fn default_call_timeout_ms() -> u64 {
    2000
}

/// Main server configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServerConfig {
    /// Name the relay uses as `sender` on self-originated envelopes.
    #[serde(default = "default_name")]
    pub name: String,

    #[serde(default = "default_host")]
    pub host: String,

    #[serde(default = "default_port")]
    pub port: u16,

    /// Shared passphrase; empty selects the codec's plaintext mode.
    #[serde(default)]
    pub aes_key: String,

    /// Bridge identities allowed to log in.
    #[serde(default)]
    pub clients: Vec<ClientEntry>,

    #[serde(default)]
    pub timing: TimingConfig,
}

/// One configured bridge identity
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClientEntry {
    pub name: String,
    pub password: String,
    /// Free-form tag, e.g. "mc" or "cqhttp".
    #[serde(rename = "type", default)]
    pub client_type: String,
}

/// Timeout knobs
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TimingConfig {
    #[serde(default = "default_idle_timeout_secs")]
    pub idle_timeout_secs: u64,

    #[serde(default = "default_ping_interval_secs")]
    pub ping_interval_secs: u64,

    /// Wait for command/api replies and for one-shot ping probes.
    #[serde(default = "default_call_timeout_ms")]
    pub call_timeout_ms: u64,
}

impl Default for TimingConfig {
    fn default() -> Self {
        Self {
            idle_timeout_secs: default_idle_timeout_secs(),
            ping_interval_secs: default_ping_interval_secs(),
            call_timeout_ms: default_call_timeout_ms(),
        }
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            name: default_name(),
            host: default_host(),
            port: default_port(),
            aes_key: String::new(),
            clients: Vec::new(),
            timing: TimingConfig::default(),
        }
    }
}

impl ServerConfig {
    /// Load configuration from a JSON file.
    ///
    /// # Errors
    ///
    /// Returns `ServerError::Io` if the file cannot be read and
    /// `ServerError::Config` if it does not parse.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        serde_json::from_str(&content)
            .map_err(|e| ServerError::Config(format!("{}: {e}", path.display())))
    }

    #[must_use]
    pub fn listen_addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    #[must_use]
    pub fn cipher(&self) -> SessionCipher {
        SessionCipher::new(&self.aes_key)
    }

    #[must_use]
    pub fn idle_timeout(&self) -> Duration {
        Duration::from_secs(self.timing.idle_timeout_secs)
    }

    #[must_use]
    pub fn ping_interval(&self) -> Duration {
        Duration::from_secs(self.timing.ping_interval_secs)
    }

    #[must_use]
    pub fn call_timeout(&self) -> Duration {
        Duration::from_millis(self.timing.call_timeout_ms)
    }
}
