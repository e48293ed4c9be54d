//! Reverse tunnel over SSH
//!
//! Opens the SSH session to the tunnel server and negotiates the remote
//! listener that inbound tunnel traffic arrives on.

mod listener;
mod negotiate;
mod ports;
mod session;

pub use listener::{ListenerBinder, RemoteListener, SshRemoteListener};
pub use negotiate::{negotiate_listener, REMOTE_BIND_HOST};
pub use ports::{candidate_ports, candidate_ports_with};
pub use session::TransportSession;
