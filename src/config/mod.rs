//! Agent configuration.
//!
//! Layered with the `config` crate: built-in defaults, then an optional TOML
//! file, then `GANGLION__*` environment variables (highest precedence).

mod facade;
mod merge {
    pub mod service;
}
mod sources {
    pub mod environment;
}

pub use facade::ConfigLoader;

use crate::directory::AccessPolicy;
use crate::error::AgentError;
use crate::logging::LoggingConfig;
use crate::scheduler::Backoff;
use crate::types::Address;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Protocol timing and codec options
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProtocolConfig {
    /// Upper bound on one operation, announcement to commit
    #[serde(default = "default_operation_timeout_ms")]
    pub operation_timeout_ms: u64,

    /// TTL used by `keep_advertised` when none is given
    #[serde(default = "default_advertise_ttl_secs")]
    pub advertise_ttl_secs: u64,

    /// Allow 64-bit integers on the wire
    #[serde(default)]
    pub wide_integers: bool,
}

fn default_operation_timeout_ms() -> u64 {
    30_000
}

fn default_advertise_ttl_secs() -> u64 {
    60
}

impl Default for ProtocolConfig {
    fn default() -> Self {
        Self {
            operation_timeout_ms: default_operation_timeout_ms(),
            advertise_ttl_secs: default_advertise_ttl_secs(),
            wide_integers: false,
        }
    }
}

/// Idle behaviour of the run loop
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SchedulerConfig {
    #[serde(default = "default_idle_backoff_ms")]
    pub idle_backoff_ms: u64,

    #[serde(default = "default_max_backoff_doublings")]
    pub max_backoff_doublings: u32,
}

fn default_idle_backoff_ms() -> u64 {
    1
}

fn default_max_backoff_doublings() -> u32 {
    6
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            idle_backoff_ms: default_idle_backoff_ms(),
            max_backoff_doublings: default_max_backoff_doublings(),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AgentConfig {
    /// This agent's transport address
    #[serde(default)]
    pub address: Option<Address>,

    /// Directory agent used by advertise / discover / perform
    #[serde(default)]
    pub directory: Option<Address>,

    /// Agent asked to authorize inbound operations; none means allow all
    #[serde(default)]
    pub authorizer: Option<Address>,

    #[serde(default)]
    pub protocol: ProtocolConfig,

    #[serde(default)]
    pub scheduler: SchedulerConfig,

    #[serde(default)]
    pub logging: LoggingConfig,

    /// Policy served on `/authorize` when this agent runs the directory
    #[serde(default)]
    pub access: AccessPolicy,
}

impl AgentConfig {
    pub fn new(address: impl Into<Address>) -> Self {
        Self {
            address: Some(address.into()),
            ..Self::default()
        }
    }

    pub fn with_directory(mut self, directory: impl Into<Address>) -> Self {
        self.directory = Some(directory.into());
        self
    }

    pub fn with_authorizer(mut self, authorizer: impl Into<Address>) -> Self {
        self.authorizer = Some(authorizer.into());
        self
    }

    pub fn with_operation_timeout(mut self, timeout: Duration) -> Self {
        self.protocol.operation_timeout_ms = timeout.as_millis() as u64;
        self
    }

    pub fn operation_timeout(&self) -> Duration {
        Duration::from_millis(self.protocol.operation_timeout_ms)
    }

    pub fn advertise_ttl(&self) -> Duration {
        Duration::from_secs(self.protocol.advertise_ttl_secs)
    }

    pub fn backoff(&self) -> Backoff {
        Backoff::new(
            Duration::from_millis(self.scheduler.idle_backoff_ms),
            self.scheduler.max_backoff_doublings,
        )
    }

    /// The configured address, or a configuration error.
    pub fn require_address(&self) -> Result<&Address, AgentError> {
        self.address
            .as_ref()
            .filter(|address| !address.as_str().trim().is_empty())
            .ok_or_else(|| AgentError::ConfigError("'address' must be set".to_string()))
    }

    pub fn validate(&self) -> Result<(), AgentError> {
        self.require_address()?;
        self.validate_shared()
    }

    /// Everything [`validate`](Self::validate) checks except the address,
    /// for settings shared by several agents.
    pub fn validate_shared(&self) -> Result<(), AgentError> {
        for (name, value) in [("directory", &self.directory), ("authorizer", &self.authorizer)] {
            if value.as_ref().is_some_and(|a| a.as_str().trim().is_empty()) {
                return Err(AgentError::ConfigError(format!("'{}' must not be empty", name)));
            }
        }
        if self.protocol.operation_timeout_ms == 0 {
            return Err(AgentError::ConfigError(
                "'protocol.operation_timeout_ms' must be positive".to_string(),
            ));
        }
        if self.scheduler.idle_backoff_ms == 0 {
            return Err(AgentError::ConfigError(
                "'scheduler.idle_backoff_ms' must be positive".to_string(),
            ));
        }
        Ok(())
    }
}
