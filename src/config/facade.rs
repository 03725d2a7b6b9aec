//! ConfigLoader facade delegating to the merge service.

use super::merge::service::MergeService;
use super::AgentConfig;
use crate::error::AgentError;
use std::path::Path;

/// Configuration loader facade.
pub struct ConfigLoader;

impl ConfigLoader {
    /// Defaults, then the TOML file at `path`, then environment overrides.
    pub fn load(path: &Path) -> Result<AgentConfig, AgentError> {
        let config = MergeService::load(Some(path))?;
        config.validate()?;
        Ok(config)
    }

    /// Defaults plus environment overrides only.
    pub fn from_env() -> Result<AgentConfig, AgentError> {
        let config = MergeService::load(None)?;
        config.validate()?;
        Ok(config)
    }

    /// Settings shared by several agents in one process: like
    /// [`load`](Self::load) with an optional file, but without an address.
    pub fn load_shared(path: Option<&Path>) -> Result<AgentConfig, AgentError> {
        let config = MergeService::load(path)?;
        config.validate_shared()?;
        Ok(config)
    }

    /// Built-in defaults; `address` still has to be filled in.
    pub fn default() -> AgentConfig {
        AgentConfig::default()
    }
}
