//! SSH transport session to the tunnel server

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use russh::client::{self, Config, Handle, Msg};
use russh::{Channel, Disconnect};
use russh_keys::key::{KeyPair, PublicKey};
use tokio::sync::{mpsc, Mutex};

use pt_core::Identity;

use super::listener::{ForwardedChannel, ListenerBinder, SshRemoteListener};
use crate::error::{BindError, DialError};

/// Forwarded connections waiting to be accepted; beyond this the handler
/// refuses new ones instead of waiting.
const FORWARDED_CHANNEL_CAPACITY: usize = 64;

/// One authenticated SSH connection to the tunnel server
///
/// Owns at most one remote listener. Dropping the session (and the
/// listener holding its handle) tears the connection down.
pub struct TransportSession {
    /// SSH session handle
    handle: Arc<Mutex<Handle<TunnelHandler>>>,
    /// Forwarded channels, until a listener takes them
    incoming: Option<mpsc::Receiver<ForwardedChannel>>,
    /// Server address, for logging
    server_addr: String,
}

impl TransportSession {
    /// Dial and authenticate
    ///
    /// The server's host key is not verified: the shared secret in the
    /// identity is what the server trusts.
    pub async fn open(
        server_addr: &str,
        identity: &Identity,
        key: Arc<KeyPair>,
        connect_timeout: Duration,
    ) -> Result<Self, DialError> {
        let ssh_config = Arc::new(Config::default());
        let (forwarded_tx, forwarded_rx) = mpsc::channel(FORWARDED_CHANNEL_CAPACITY);
        let handler = TunnelHandler::new(forwarded_tx);

        tracing::debug!("Connecting to {}", server_addr);
        let timed_out = || DialError::Timeout {
            addr: server_addr.to_string(),
            timeout: connect_timeout,
        };

        let mut handle = tokio::time::timeout(
            connect_timeout,
            client::connect(ssh_config, server_addr, handler),
        )
        .await
        .map_err(|_| timed_out())?
        .map_err(|e| classify_dial_error(server_addr, e))?;

        tracing::debug!("Authenticating tunnel '{}'", identity.label());
        let authenticated = tokio::time::timeout(
            connect_timeout,
            handle.authenticate_publickey(identity.username(), key),
        )
        .await
        .map_err(|_| timed_out())?
        .map_err(|e| classify_dial_error(server_addr, e))?;

        if !authenticated {
            return Err(DialError::AuthRejected);
        }

        tracing::info!("Connected to tunnel server at {}", server_addr);
        Ok(Self {
            handle: Arc::new(Mutex::new(handle)),
            incoming: Some(forwarded_rx),
            server_addr: server_addr.to_string(),
        })
    }

    /// Disconnect from the server
    pub async fn close(self) -> Result<(), russh::Error> {
        tracing::debug!("Disconnecting from {}", self.server_addr);
        self.handle
            .lock()
            .await
            .disconnect(Disconnect::ByApplication, "closing", "en")
            .await
    }
}

#[async_trait]
impl ListenerBinder for TransportSession {
    type Listener = SshRemoteListener;

    async fn bind(&mut self, host: &str, port: u16) -> Result<SshRemoteListener, BindError> {
        if self.incoming.is_none() {
            return Err(BindError::AlreadyBound);
        }

        let assigned = {
            let mut handle = self.handle.lock().await;
            handle
                .tcpip_forward(host, u32::from(port))
                .await
                .map_err(|e| BindError::Rejected {
                    addr: format!("{}:{}", host, port),
                    reason: e.to_string(),
                })?
        };

        // Servers only report the port when asked for port 0
        let bound = match u16::try_from(assigned) {
            Ok(0) | Err(_) => port,
            Ok(assigned) => assigned,
        };

        let incoming = self.incoming.take().ok_or(BindError::AlreadyBound)?;
        Ok(SshRemoteListener::new(
            Arc::clone(&self.handle),
            host.to_string(),
            bound,
            incoming,
        ))
    }
}

fn classify_dial_error(addr: &str, error: russh::Error) -> DialError {
    match error {
        russh::Error::IO(source) => DialError::Unreachable {
            addr: addr.to_string(),
            source,
        },
        source => DialError::Protocol {
            addr: addr.to_string(),
            source,
        },
    }
}

/// Close a refused channel off the session loop
fn close_in_background(rejected: ForwardedChannel) {
    tokio::spawn(async move {
        let _ = rejected.channel.close().await;
    });
}

/// SSH client handler for the tunnel session
pub(crate) struct TunnelHandler {
    /// Where `forwarded-tcpip` channels go
    forwarded_tx: mpsc::Sender<ForwardedChannel>,
}

impl TunnelHandler {
    fn new(forwarded_tx: mpsc::Sender<ForwardedChannel>) -> Self {
        Self { forwarded_tx }
    }
}

#[async_trait]
impl client::Handler for TunnelHandler {
    type Error = russh::Error;

    /// Accept any host key; trust comes from the shared secret
    async fn check_server_key(
        &mut self,
        server_public_key: &PublicKey,
    ) -> Result<bool, Self::Error> {
        tracing::debug!("Server host key: {}", server_public_key.fingerprint());
        Ok(true)
    }

    /// Route an inbound tunnel connection to the remote listener
    async fn server_channel_open_forwarded_tcpip(
        &mut self,
        channel: Channel<Msg>,
        connected_address: &str,
        connected_port: u32,
        originator_address: &str,
        originator_port: u32,
        _session: &mut client::Session,
    ) -> Result<(), Self::Error> {
        tracing::trace!(
            "Forwarded connection to {}:{} from {}:{}",
            connected_address,
            connected_port,
            originator_address,
            originator_port
        );

        let forwarded = ForwardedChannel {
            channel,
            connected_port,
            originator: format!("{}:{}", originator_address, originator_port),
        };

        // Never wait here: a blocked handler stalls every channel on the session
        match self.forwarded_tx.try_send(forwarded) {
            Ok(()) => {}
            Err(mpsc::error::TrySendError::Full(rejected)) => {
                tracing::warn!(
                    "Accept backlog full, dropping connection from {}",
                    rejected.originator
                );
                close_in_background(rejected);
            }
            Err(mpsc::error::TrySendError::Closed(rejected)) => {
                tracing::debug!("No listener for forwarded connection, closing it");
                close_in_background(rejected);
            }
        }

        Ok(())
    }
}
