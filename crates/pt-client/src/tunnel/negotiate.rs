//! Remote listener negotiation

use super::listener::{ListenerBinder, RemoteListener};
use crate::error::NegotiateError;

/// Address remote listeners are requested on
pub const REMOTE_BIND_HOST: &str = "localhost";

/// Bind a remote listener on the first candidate port the server accepts
///
/// Candidates are tried strictly in order and iteration stops at the first
/// success. Fails with [`NegotiateError::NoPortAvailable`] only after every
/// candidate was attempted.
pub async fn negotiate_listener<B: ListenerBinder>(
    binder: &mut B,
    host: &str,
    candidates: &[u16],
) -> Result<B::Listener, NegotiateError> {
    let mut attempted = Vec::with_capacity(candidates.len());

    for &port in candidates {
        attempted.push(port);
        match binder.bind(host, port).await {
            Ok(listener) => {
                tracing::info!(
                    "Remote listener bound on {}:{} (attempt {} of {})",
                    host,
                    listener.port(),
                    attempted.len(),
                    candidates.len()
                );
                return Ok(listener);
            }
            Err(e) => {
                tracing::debug!("Remote port {} unavailable: {}", port, e);
            }
        }
    }

    tracing::error!(
        "Failed to bind a remote listener after {} attempts",
        attempted.len()
    );
    Err(NegotiateError::NoPortAvailable { attempted })
}
