//! Tunnel descriptors

use serde::{Deserialize, Serialize};
use std::fmt;

use crate::error::ConfigError;

/// Longest subdomain accepted (a single DNS label)
const MAX_SUBDOMAIN_LEN: usize = 63;

/// What the tunnel server exposes for a tunnel
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TunnelType {
    /// Routed by subdomain on the server's HTTP front
    #[default]
    Http,
    /// Raw TCP, reachable on the assigned remote port
    Tcp,
}

impl fmt::Display for TunnelType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TunnelType::Http => write!(f, "http"),
            TunnelType::Tcp => write!(f, "tcp"),
        }
    }
}

/// A single tunnel from the config file
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TunnelConfig {
    /// Tunnel name, used to select it and as the identity label for TCP tunnels
    pub name: Option<String>,

    /// Subdomain requested for HTTP tunnels
    pub subdomain: Option<String>,

    /// Local host the service listens on
    pub host: String,

    /// Local port the service listens on
    pub port: u16,

    /// Tunnel type
    #[serde(rename = "type")]
    pub tunnel_type: TunnelType,

    /// Preferred remote ports, tried in order before random candidates
    pub remote_ports: Vec<u16>,
}

impl Default for TunnelConfig {
    fn default() -> Self {
        Self {
            name: None,
            subdomain: None,
            host: "localhost".to_string(),
            port: 0,
            tunnel_type: TunnelType::Http,
            remote_ports: Vec::new(),
        }
    }
}

impl TunnelConfig {
    /// Address of the local service (`host:port`)
    pub fn local_addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    /// The label presented to the server: subdomain, else name, else empty
    pub fn label(&self) -> &str {
        self.subdomain
            .as_deref()
            .filter(|s| !s.is_empty())
            .or(self.name.as_deref())
            .unwrap_or("")
    }

    /// Whether this tunnel answers to `name` (by name or subdomain)
    pub fn matches(&self, name: &str) -> bool {
        self.name.as_deref() == Some(name) || self.subdomain.as_deref() == Some(name)
    }

    /// Fill in values left empty in the file
    pub(crate) fn apply_defaults(&mut self) {
        if self.host.trim().is_empty() {
            self.host = "localhost".to_string();
        }
    }

    /// Validate this tunnel
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.port == 0 {
            return Err(ConfigError::MissingField(format!(
                "port for tunnel '{}'",
                self.label()
            )));
        }

        if self.tunnel_type == TunnelType::Http {
            match self.subdomain.as_deref() {
                Some(subdomain) => validate_subdomain(subdomain)?,
                None => {
                    return Err(ConfigError::MissingField(
                        "subdomain for http tunnel".to_string(),
                    ))
                }
            }
        }

        Ok(())
    }
}

/// Check that a subdomain is a single lowercase DNS label
pub fn validate_subdomain(subdomain: &str) -> Result<(), ConfigError> {
    let invalid = |reason: &str| ConfigError::InvalidSubdomain {
        subdomain: subdomain.to_string(),
        reason: reason.to_string(),
    };

    if subdomain.is_empty() {
        return Err(invalid("must not be empty"));
    }
    if subdomain.len() > MAX_SUBDOMAIN_LEN {
        return Err(invalid("must be at most 63 characters"));
    }
    if !subdomain
        .bytes()
        .all(|b| b.is_ascii_lowercase() || b.is_ascii_digit() || b == b'-')
    {
        return Err(invalid("only lowercase letters, digits and '-' are allowed"));
    }
    if subdomain.starts_with('-') || subdomain.ends_with('-') {
        return Err(invalid("must not start or end with '-'"));
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn http_tunnel(subdomain: &str) -> TunnelConfig {
        TunnelConfig {
            subdomain: Some(subdomain.to_string()),
            port: 8080,
            ..Default::default()
        }
    }

    #[test]
    fn test_type_parses_lowercase() {
        #[derive(Deserialize)]
        struct Wrapper {
            kind: TunnelType,
        }
        let w: Wrapper = toml::from_str(r#"kind = "tcp""#).unwrap();
        assert_eq!(w.kind, TunnelType::Tcp);
        assert!(toml::from_str::<Wrapper>(r#"kind = "udp""#).is_err());
    }

    #[test]
    fn test_label_prefers_subdomain() {
        let mut tunnel = TunnelConfig {
            name: Some("db".to_string()),
            ..Default::default()
        };
        assert_eq!(tunnel.label(), "db");

        tunnel.subdomain = Some("app".to_string());
        assert_eq!(tunnel.label(), "app");

        tunnel.subdomain = Some(String::new());
        assert_eq!(tunnel.label(), "db");
    }

    #[test]
    fn test_local_addr() {
        let tunnel = http_tunnel("app");
        assert_eq!(tunnel.local_addr(), "localhost:8080");
    }

    #[test]
    fn test_http_requires_subdomain() {
        let tunnel = TunnelConfig {
            port: 8080,
            ..Default::default()
        };
        assert!(matches!(
            tunnel.validate(),
            Err(ConfigError::MissingField(_))
        ));
    }

    #[test]
    fn test_tcp_needs_no_subdomain() {
        let tunnel = TunnelConfig {
            name: Some("postgres".to_string()),
            port: 5432,
            tunnel_type: TunnelType::Tcp,
            ..Default::default()
        };
        assert!(tunnel.validate().is_ok());
    }

    #[test]
    fn test_zero_port_rejected() {
        let mut tunnel = http_tunnel("app");
        tunnel.port = 0;
        assert!(tunnel.validate().is_err());
    }

    #[test]
    fn test_subdomain_rules() {
        assert!(validate_subdomain("my-app-42").is_ok());
        assert!(validate_subdomain("").is_err());
        assert!(validate_subdomain("-app").is_err());
        assert!(validate_subdomain("app-").is_err());
        assert!(validate_subdomain("My-App").is_err());
        assert!(validate_subdomain("app.example").is_err());
        assert!(validate_subdomain(&"a".repeat(64)).is_err());
        assert!(validate_subdomain(&"a".repeat(63)).is_ok());
    }
}
