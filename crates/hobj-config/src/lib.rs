//! Typed TOML configuration with validation and hot reload.

pub mod manager;

pub use manager::ConfigManager;

use serde::de::DeserializeOwned;

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("cannot read config file: {0}")]
    Io(#[from] std::io::Error),

    #[error("cannot parse config: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("invalid config: {0}")]
    Invalid(String),
}

/// A configuration section that can be loaded from TOML.
///
/// `from_toml` goes through serde, so implementors only declare defaults via
/// `#[serde(default)]` and add cross-field checks in `validate`.
pub trait Config: DeserializeOwned + Send + Sync + 'static {
    fn from_toml(value: &toml::Value) -> Result<Self, ConfigError> {
        Ok(value.clone().try_into::<Self>()?)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        Ok(())
    }

    /// Copy the fields that may change at runtime from `other` into `self`.
    fn hot_update(&mut self, _other: &Self) {}
}
