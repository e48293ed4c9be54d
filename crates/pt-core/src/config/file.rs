//! The portr config file

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

use super::client::{ClientConfig, PortCandidateConfig};
use super::serde_utils::duration_secs;
use super::tunnel::TunnelConfig;
use crate::error::ConfigError;

/// Contents of `~/.portr/config.toml`
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Admin server address
    pub server_url: String,

    /// SSH endpoint, defaults to `server_url`
    pub ssh_url: Option<String>,

    /// Public tunnel host, defaults to `server_url`
    pub tunnel_url: Option<String>,

    /// Shared secret issued by the tunnel server
    pub secret_key: String,

    /// Configured tunnels
    pub tunnels: Vec<TunnelConfig>,

    /// Talk plain http to a server on localhost
    pub use_localhost: bool,

    /// Verbose logging
    pub debug: bool,

    /// Private key path, defaults to `~/.portr/keys/id_rsa`
    pub key_path: Option<PathBuf>,

    /// Timeout for the SSH dial and handshake
    #[serde(with = "duration_secs")]
    pub connect_timeout: Duration,

    /// Timeout for dialing the local service
    #[serde(with = "duration_secs")]
    pub local_dial_timeout: Duration,

    /// Deadline for graceful shutdown
    #[serde(with = "duration_secs")]
    pub shutdown_timeout: Duration,

    /// Remote port candidate policy
    pub port_candidates: PortCandidateConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            server_url: "localhost:8000".to_string(),
            ssh_url: None,
            tunnel_url: None,
            secret_key: String::new(),
            tunnels: Vec::new(),
            use_localhost: false,
            debug: false,
            key_path: None,
            connect_timeout: Duration::from_secs(30),
            local_dial_timeout: Duration::from_secs(10),
            shutdown_timeout: Duration::from_secs(30),
            port_candidates: PortCandidateConfig::default(),
        }
    }
}

impl Config {
    /// Build the session config for one tunnel
    ///
    /// Selects the tunnel matching `name` (by name or subdomain), or the
    /// first configured tunnel when `name` is `None`, then applies defaults
    /// and validates the result.
    pub fn client_config(&self, name: Option<&str>) -> Result<ClientConfig, ConfigError> {
        let tunnel = match name {
            Some(name) => self
                .tunnels
                .iter()
                .find(|t| t.matches(name))
                .ok_or_else(|| ConfigError::UnknownTunnel(name.to_string()))?,
            None => self
                .tunnels
                .first()
                .ok_or_else(|| ConfigError::MissingField("tunnels".to_string()))?,
        };

        if self.secret_key.is_empty() {
            return Err(ConfigError::MissingField("secret_key".to_string()));
        }

        let mut tunnel = tunnel.clone();
        tunnel.apply_defaults();
        tunnel.validate()?;
        self.port_candidates.validate()?;

        let server_url = if self.server_url.is_empty() {
            Config::default().server_url
        } else {
            self.server_url.clone()
        };
        let or_server = |url: &Option<String>| {
            url.clone()
                .filter(|u| !u.is_empty())
                .unwrap_or_else(|| server_url.clone())
        };

        Ok(ClientConfig {
            ssh_url: or_server(&self.ssh_url),
            tunnel_url: or_server(&self.tunnel_url),
            server_url: server_url.clone(),
            secret_key: self.secret_key.clone(),
            tunnel,
            use_localhost: self.use_localhost,
            debug: self.debug,
            key_path: self.key_path.clone().unwrap_or_else(super::default_key_path),
            connect_timeout: self.connect_timeout,
            local_dial_timeout: self.local_dial_timeout,
            shutdown_timeout: self.shutdown_timeout,
            port_candidates: self.port_candidates.clone(),
        })
    }
}
