//! Error types for the tunnel client

use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;

/// Failure to load the client's signing key. Always fatal.
#[derive(Debug, Error)]
pub enum CredentialError {
    /// No key file at the expected location
    #[error("Private key not found at {}", path.display())]
    NotFound { path: PathBuf },

    /// The file exists but does not hold a usable private key
    #[error("Failed to parse private key at {}: {source}", path.display())]
    Unparseable {
        path: PathBuf,
        #[source]
        source: russh_keys::Error,
    },
}

/// Failure to open the SSH session to the tunnel server
#[derive(Debug, Error)]
pub enum DialError {
    /// TCP connect or socket I/O failed
    #[error("Failed to reach tunnel server at {addr}: {source}")]
    Unreachable {
        addr: String,
        #[source]
        source: std::io::Error,
    },

    /// Connect or handshake did not finish in time
    #[error("Timed out connecting to tunnel server at {addr} after {timeout:?}")]
    Timeout { addr: String, timeout: Duration },

    /// The server refused the identity or key
    #[error("Authentication rejected by tunnel server")]
    AuthRejected,

    /// SSH negotiation failed
    #[error("SSH negotiation with {addr} failed: {source}")]
    Protocol {
        addr: String,
        #[source]
        source: russh::Error,
    },
}

/// A single remote bind attempt failed
#[derive(Debug, Error)]
pub enum BindError {
    /// The server refused the forward (port in use, not permitted, ...)
    #[error("Server rejected listener on {addr}: {reason}")]
    Rejected { addr: String, reason: String },

    /// The session already owns a remote listener
    #[error("Session already has a remote listener")]
    AlreadyBound,
}

/// Accepting from a remote listener failed
#[derive(Debug, Error)]
pub enum AcceptError {
    /// The listener was closed locally or its session went away
    #[error("Remote listener closed")]
    Closed,

    /// One inbound connection could not be accepted; the listener is still usable
    #[error("Failed to accept connection: {0}")]
    Failed(String),
}

/// Closing a remote listener failed
#[derive(Debug, Error)]
#[error("Failed to close remote listener on port {port}: {reason}")]
pub struct CloseError {
    pub port: u16,
    pub reason: String,
}

/// Port negotiation exhausted every candidate
#[derive(Debug, Error)]
pub enum NegotiateError {
    /// Every candidate port was tried and rejected
    #[error("No remote port available (tried {} candidates)", attempted.len())]
    NoPortAvailable { attempted: Vec<u16> },
}

/// Errors that end a tunnel session
#[derive(Debug, Error)]
pub enum TunnelError {
    /// Signing key could not be loaded
    #[error(transparent)]
    Credential(#[from] CredentialError),

    /// SSH session could not be opened
    #[error(transparent)]
    Dial(#[from] DialError),

    /// No remote listener could be bound
    #[error(transparent)]
    Negotiate(#[from] NegotiateError),

    /// The server side stopped delivering connections
    #[error("Remote listener closed by the tunnel server")]
    RemoteClosed,

    /// Graceful shutdown exceeded its deadline
    #[error("Shutdown did not complete within {0:?}")]
    ShutdownTimeout(Duration),

    /// The background pipeline task panicked or was cancelled
    #[error("Tunnel task failed: {0}")]
    Task(String),
}

impl TunnelError {
    /// Whether this error happened while setting the tunnel up
    pub fn is_setup(&self) -> bool {
        matches!(
            self,
            TunnelError::Credential(_) | TunnelError::Dial(_) | TunnelError::Negotiate(_)
        )
    }
}
