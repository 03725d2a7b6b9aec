//! MergeService: orchestrates sources and deserializes to AgentConfig.

use crate::config::sources::environment;
use crate::config::AgentConfig;
use config::builder::DefaultState;
use config::{Config, ConfigBuilder, ConfigError, File, FileFormat};
use std::path::Path;

/// Merge service for config composition.
pub struct MergeService;

impl MergeService {
    /// Precedence: defaults (lowest) -> file -> environment (highest).
    pub fn load(file: Option<&Path>) -> Result<AgentConfig, ConfigError> {
        let mut builder = Self::builder_with_defaults()?;
        if let Some(path) = file {
            builder = builder.add_source(File::from(path).format(FileFormat::Toml).required(true));
        }
        let builder = environment::add_to_builder(builder)?;

        let config = builder.build()?;
        config.try_deserialize()
    }

    fn builder_with_defaults() -> Result<ConfigBuilder<DefaultState>, ConfigError> {
        let defaults = Config::try_from(&AgentConfig::default())?;
        Ok(Config::builder().add_source(defaults))
    }
}
