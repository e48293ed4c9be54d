//! pt-core: Core configuration and shared types for the portr tunnel client
//!
//! This crate provides the configuration model consumed by the tunnel
//! client, the identity string presented to the tunnel server, and the
//! shared error types.

pub mod config;
pub mod error;
pub mod identity;

pub use config::{ClientConfig, Config, TunnelConfig, TunnelType};
pub use error::ConfigError;
pub use identity::Identity;
