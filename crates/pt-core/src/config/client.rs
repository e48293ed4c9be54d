//! Per-session client configuration

use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;
use std::time::Duration;

use super::tunnel::{TunnelConfig, TunnelType};
use crate::error::ConfigError;
use crate::identity::Identity;

/// How remote port candidates are generated when negotiating a listener
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PortCandidateConfig {
    /// Total number of candidates to try, including configured hints
    pub count: usize,

    /// Lowest port for randomly generated candidates
    pub range_start: u16,

    /// Highest port (inclusive) for randomly generated candidates
    pub range_end: u16,
}

impl Default for PortCandidateConfig {
    fn default() -> Self {
        Self {
            count: 10,
            range_start: 20000,
            range_end: 30000,
        }
    }
}

impl PortCandidateConfig {
    /// Validate the candidate policy
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.count == 0 {
            return Err(ConfigError::Invalid(
                "port_candidates.count must be at least 1".to_string(),
            ));
        }
        if self.range_start == 0 || self.range_start > self.range_end {
            return Err(ConfigError::Invalid(format!(
                "port_candidates range {}..={} is empty",
                self.range_start, self.range_end
            )));
        }
        Ok(())
    }
}

/// Configuration for a single tunnel session
///
/// Produced by [`super::Config::client_config`] with defaults applied and
/// validated. Never mutated while a session is running.
#[derive(Clone)]
pub struct ClientConfig {
    /// Admin server address (`host[:port]`)
    pub server_url: String,

    /// SSH endpoint of the tunnel server (`host:port`)
    pub ssh_url: String,

    /// Public tunnel host (`host[:port]`)
    pub tunnel_url: String,

    /// Shared secret issued by the tunnel server
    pub secret_key: String,

    /// The tunnel this session serves
    pub tunnel: TunnelConfig,

    /// Talk plain http to a server on localhost
    pub use_localhost: bool,

    /// Verbose logging
    pub debug: bool,

    /// Private key used for SSH authentication
    pub key_path: PathBuf,

    /// Timeout for the SSH dial and handshake
    pub connect_timeout: Duration,

    /// Timeout for dialing the local service
    pub local_dial_timeout: Duration,

    /// Deadline for graceful shutdown
    pub shutdown_timeout: Duration,

    /// Remote port candidate policy
    pub port_candidates: PortCandidateConfig,
}

impl fmt::Debug for ClientConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ClientConfig")
            .field("server_url", &self.server_url)
            .field("ssh_url", &self.ssh_url)
            .field("tunnel_url", &self.tunnel_url)
            .field("secret_key", &"<redacted>")
            .field("tunnel", &self.tunnel)
            .field("use_localhost", &self.use_localhost)
            .field("debug", &self.debug)
            .field("key_path", &self.key_path)
            .field("connect_timeout", &self.connect_timeout)
            .field("local_dial_timeout", &self.local_dial_timeout)
            .field("shutdown_timeout", &self.shutdown_timeout)
            .field("port_candidates", &self.port_candidates)
            .finish()
    }
}

impl ClientConfig {
    /// Identity presented to the tunnel server as the SSH username
    pub fn identity(&self) -> Identity {
        Identity::new(&self.secret_key, self.tunnel.label())
    }

    /// Address of the local service
    pub fn local_addr(&self) -> String {
        self.tunnel.local_addr()
    }

    fn scheme(&self) -> &'static str {
        if self.use_localhost {
            "http"
        } else {
            "https"
        }
    }

    /// Admin server URL
    pub fn server_addr(&self) -> String {
        format!("{}://{}", self.scheme(), self.server_url)
    }

    /// Publicly reachable address of the tunnel
    ///
    /// HTTP tunnels are addressed by subdomain; TCP tunnels by the tunnel
    /// host and the remote port that was actually bound.
    pub fn tunnel_addr(&self, remote_port: u16) -> String {
        match self.tunnel.tunnel_type {
            TunnelType::Http => format!(
                "{}://{}.{}",
                self.scheme(),
                self.tunnel.label(),
                self.tunnel_url
            ),
            TunnelType::Tcp => {
                let host = self
                    .tunnel_url
                    .rsplit_once(':')
                    .map(|(host, _)| host)
                    .unwrap_or(&self.tunnel_url);
                format!("{}:{}", host, remote_port)
            }
        }
    }
}

#[cfg(test)]
pub(crate) fn test_client_config(tunnel: TunnelConfig) -> ClientConfig {
    ClientConfig {
        server_url: "portr.dev".to_string(),
        ssh_url: "portr.dev:2222".to_string(),
        tunnel_url: "portr.dev:8001".to_string(),
        secret_key: "s3cret".to_string(),
        tunnel,
        use_localhost: false,
        debug: false,
        key_path: PathBuf::from("/tmp/id_rsa"),
        connect_timeout: Duration::from_secs(30),
        local_dial_timeout: Duration::from_secs(10),
        shutdown_timeout: Duration::from_secs(30),
        port_candidates: PortCandidateConfig::default(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_http_tunnel_addr() {
        let mut config = test_client_config(TunnelConfig {
            subdomain: Some("demo".to_string()),
            port: 3000,
            ..Default::default()
        });
        assert_eq!(config.tunnel_addr(0), "https://demo.portr.dev:8001");

        config.use_localhost = true;
        assert_eq!(config.tunnel_addr(0), "http://demo.portr.dev:8001");
    }

    #[test]
    fn test_tcp_tunnel_addr_uses_remote_port() {
        let config = test_client_config(TunnelConfig {
            name: Some("db".to_string()),
            port: 5432,
            tunnel_type: TunnelType::Tcp,
            ..Default::default()
        });
        assert_eq!(config.tunnel_addr(41001), "portr.dev:41001");
    }

    #[test]
    fn test_tcp_tunnel_addr_without_port_in_url() {
        let mut config = test_client_config(TunnelConfig {
            name: Some("db".to_string()),
            port: 5432,
            tunnel_type: TunnelType::Tcp,
            ..Default::default()
        });
        config.tunnel_url = "tunnel.local".to_string();
        assert_eq!(config.tunnel_addr(20001), "tunnel.local:20001");
    }

    #[test]
    fn test_server_addr_scheme() {
        let mut config = test_client_config(TunnelConfig::default());
        assert_eq!(config.server_addr(), "https://portr.dev");
        config.use_localhost = true;
        assert_eq!(config.server_addr(), "http://portr.dev");
    }

    #[test]
    fn test_debug_redacts_secret() {
        let config = test_client_config(TunnelConfig::default());
        let rendered = format!("{:?}", config);
        assert!(!rendered.contains("s3cret"));
        assert!(rendered.contains("<redacted>"));
    }

    #[test]
    fn test_port_candidate_validation() {
        assert!(PortCandidateConfig::default().validate().is_ok());

        let zero = PortCandidateConfig {
            count: 0,
            ..Default::default()
        };
        assert!(zero.validate().is_err());

        let inverted = PortCandidateConfig {
            range_start: 3000,
            range_end: 2000,
            ..Default::default()
        };
        assert!(inverted.validate().is_err());
    }
}
