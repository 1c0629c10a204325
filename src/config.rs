//! Bus configuration.
//!
//! Usually read from the `[bus]` table of a service's TOML config:
//!
//! ```toml
//! environment = "staging"
//! service_name = "orders"
//! command_concurrency = 16
//! reply_timeout_ms = 30000
//! encryption_key = "base64-encoded 32 byte key"
//! ```
//!
//! Every field has a default, so an empty document is a valid config.

use std::path::Path;
use std::time::Duration;

use serde::Deserialize;

use crate::codec::Serializer;
use crate::error::BusError;
use crate::topic::{DEFAULT_MAX_TOPIC_LENGTH, MIN_TOPIC_LENGTH};

/// Settings shared by the dispatcher, the exchanges and the facade.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct BusConfig {
    /// Prefix for every topic (`{environment}_{type}`).
    pub environment: Option<String>,
    /// Recorded as the source service of dispatched envelopes.
    pub service_name: Option<String>,
    /// Broker-imposed ceiling on topic names.
    pub max_topic_length: usize,
    /// Concurrent handler invocations per command exchange.
    pub command_concurrency: usize,
    /// Concurrent handler invocations per event exchange.
    pub event_concurrency: usize,
    /// Total commands the command exchanges accept before draining.
    pub command_receive_budget: Option<u64>,
    /// Total events the event exchanges accept before draining.
    pub event_receive_budget: Option<u64>,
    /// Fixed delay between reconnect attempts.
    pub retry_delay_ms: u64,
    /// Default reply deadline for awaited dispatches. `None` waits until shutdown.
    pub reply_timeout_ms: Option<u64>,
    /// Pause between checks while a receive budget is exhausted.
    pub idle_poll_ms: u64,
    /// Base64 AES-256-GCM key. `None` keeps the wire format in plaintext.
    pub encryption_key: Option<String>,
    pub serializer: Serializer,
}

impl Default for BusConfig {
    fn default() -> Self {
        Self {
            environment: None,
            service_name: None,
            max_topic_length: DEFAULT_MAX_TOPIC_LENGTH,
            command_concurrency: 8,
            event_concurrency: 8,
            command_receive_budget: None,
            event_receive_budget: None,
            retry_delay_ms: 5_000,
            reply_timeout_ms: None,
            idle_poll_ms: 50,
            encryption_key: None,
            serializer: Serializer::default(),
        }
    }
}

impl BusConfig {
    /// Parse and validate a TOML document.
    pub fn from_toml_str(content: &str) -> Result<Self, BusError> {
        let config: BusConfig =
            toml::from_str(content).map_err(|e| BusError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Read, parse and validate a TOML file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, BusError> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)
            .map_err(|e| BusError::Config(format!("cannot read {}: {}", path.display(), e)))?;
        Self::from_toml_str(&content)
    }

    /// Reject settings the bus cannot run with.
    pub fn validate(&self) -> Result<(), BusError> {
        if self.command_concurrency == 0 || self.event_concurrency == 0 {
            return Err(BusError::Config("concurrency limits must be at least 1".into()));
        }
        if self.max_topic_length < MIN_TOPIC_LENGTH {
            return Err(BusError::Config(format!(
                "max_topic_length must be at least {}",
                MIN_TOPIC_LENGTH
            )));
        }
        if let Some(key) = &self.encryption_key {
            crate::codec::decode_key(key)?;
        }
        Ok(())
    }

    pub fn environment(&self) -> Option<&str> {
        self.environment.as_deref()
    }

    pub fn service_name(&self) -> Option<&str> {
        self.service_name.as_deref()
    }

    pub fn retry_delay(&self) -> Duration {
        Duration::from_millis(self.retry_delay_ms)
    }

    pub fn reply_timeout(&self) -> Option<Duration> {
        self.reply_timeout_ms.map(Duration::from_millis)
    }

    pub fn idle_poll(&self) -> Duration {
        Duration::from_millis(self.idle_poll_ms)
    }
}
