//! Server configuration.

use serde::{Deserialize, Serialize};

/// Per-server configuration, loadable from any serde format.
///
/// `encryption_key` keys the binary subprotocol when non-empty;
/// `enable_json` additionally registers the JSON subprotocol. The two
/// callback timeouts bound how long an outbound callback may wait to seize
/// the wire and to receive its answer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Address the listener binds to.
    pub bind_addr: String,
    /// Listening TCP port. 0 picks an ephemeral port.
    pub port: u16,
    /// Enables AES-256-CFB on the binary subprotocol when non-empty.
    pub encryption_key: String,
    /// Registers the JSON subprotocol.
    pub enable_json: bool,
    /// Maximum wait for an outbound callback to seize the wire.
    pub callback_acquire_timeout_ms: u64,
    /// Maximum wait for the client's reply frame.
    pub callback_answer_timeout_ms: u64,
    /// Compression toggle for the binary subprotocol.
    pub compressed: bool,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: "127.0.0.1".to_string(),
            port: 0,
            encryption_key: String::new(),
            enable_json: false,
            callback_acquire_timeout_ms: 5000,
            callback_answer_timeout_ms: 1000,
            compressed: true,
        }
    }
}

impl ServerConfig {
    /// Default configuration on the given port.
    #[must_use]
    pub fn new(port: u16) -> Self {
        Self {
            port,
            ..Self::default()
        }
    }

    /// Set the bind address.
    #[must_use]
    pub fn bind_addr(mut self, addr: impl Into<String>) -> Self {
        self.bind_addr = addr.into();
        self
    }

    /// Key the binary subprotocol.
    #[must_use]
    pub fn encryption_key(mut self, key: impl Into<String>) -> Self {
        self.encryption_key = key.into();
        self
    }

    /// Register the JSON subprotocol as well.
    #[must_use]
    pub fn enable_json(mut self, enable: bool) -> Self {
        self.enable_json = enable;
        self
    }

    /// Set the callback acquire timeout.
    #[must_use]
    pub fn callback_acquire_timeout_ms(mut self, millis: u64) -> Self {
        self.callback_acquire_timeout_ms = millis;
        self
    }

    /// Set the callback answer timeout.
    #[must_use]
    pub fn callback_answer_timeout_ms(mut self, millis: u64) -> Self {
        self.callback_answer_timeout_ms = millis;
        self
    }

    /// Toggle binary subprotocol compression.
    #[must_use]
    pub fn compressed(mut self, compressed: bool) -> Self {
        self.compressed = compressed;
        self
    }
}
