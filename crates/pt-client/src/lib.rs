//! pt-client: portr tunnel client
//!
//! Exposes a local service through a reverse SSH tunnel. The client opens
//! one SSH session to the tunnel server, binds a remote listener on the
//! first free candidate port, and relays every connection the server
//! forwards to a fresh connection to the local service.

pub mod credential;
pub mod error;
pub mod lifecycle;
pub mod relay;
pub mod tunnel;

pub use error::TunnelError;
pub use lifecycle::{LifecycleState, TunnelClient};
