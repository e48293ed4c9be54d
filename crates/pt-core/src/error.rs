//! Core error types for portr

use std::path::PathBuf;
use thiserror::Error;

/// Configuration-related errors
#[derive(Error, Debug)]
pub enum ConfigError {
    /// Config file not found
    #[error("Config file not found: {0}")]
    NotFound(PathBuf),

    /// Invalid configuration
    #[error("Invalid config: {0}")]
    Invalid(String),

    /// TOML parse error
    #[error("TOML parse error: {0}")]
    Parse(#[from] toml::de::Error),

    /// Missing required field
    #[error("Missing required field: {0}")]
    MissingField(String),

    /// No tunnel matches the requested name
    #[error("No tunnel named '{0}' in config")]
    UnknownTunnel(String),

    /// Subdomain does not satisfy DNS label rules
    #[error("Invalid subdomain '{subdomain}': {reason}")]
    InvalidSubdomain { subdomain: String, reason: String },
}
