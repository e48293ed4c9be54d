//! Configuration management for portr
//!
//! The on-disk [`Config`] describes one tunnel server and any number of
//! tunnels. [`Config::client_config`] picks a single tunnel and produces the
//! immutable [`ClientConfig`] that drives one tunnel session.

mod client;
mod file;
mod serde_utils;
mod tunnel;

pub use client::{ClientConfig, PortCandidateConfig};
#[cfg(test)]
pub(crate) use client::test_client_config;
pub use file::Config;
pub use tunnel::{validate_subdomain, TunnelConfig, TunnelType};

use crate::error::ConfigError;
use std::path::{Path, PathBuf};

/// Get the default configuration directory (`~/.portr`)
pub fn default_config_dir() -> PathBuf {
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".portr")
}

/// Get the default configuration file path
pub fn default_config_path() -> PathBuf {
    default_config_dir().join("config.toml")
}

/// Get the default location of the client's private key
pub fn default_key_path() -> PathBuf {
    default_config_dir().join("keys").join("id_rsa")
}

/// Load configuration from a file
pub fn load_config<T: serde::de::DeserializeOwned>(path: &Path) -> Result<T, ConfigError> {
    if !path.exists() {
        return Err(ConfigError::NotFound(path.to_path_buf()));
    }

    tracing::debug!("Loading config from {:?}", path);
    let content = std::fs::read_to_string(path)
        .map_err(|e| ConfigError::Invalid(format!("Failed to read config: {}", e)))?;

    let config: T = toml::from_str(&content)?;
    Ok(config)
}
