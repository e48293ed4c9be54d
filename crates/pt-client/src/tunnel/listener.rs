//! Remote listeners
//!
//! A remote listener is a `tcpip-forward` bound on the tunnel server. Each
//! connection the server accepts on it shows up as a `forwarded-tcpip`
//! channel on our SSH session.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use russh::client::{Handle, Msg};
use russh::{Channel, ChannelStream};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::{mpsc, Mutex};
use tokio_util::sync::CancellationToken;

use super::session::TunnelHandler;
use crate::error::{AcceptError, BindError, CloseError};

/// A listener bound on the remote side of a tunnel
///
/// `accept` and `close` may run concurrently: closing makes a pending or
/// later `accept` return [`AcceptError::Closed`] without blocking. Closing
/// twice is a no-op.
#[async_trait]
pub trait RemoteListener: Send + Sync + 'static {
    /// Stream type for accepted connections
    type Stream: AsyncRead + AsyncWrite + Unpin + Send + 'static;

    /// Remote port this listener is bound to
    fn port(&self) -> u16;

    /// Wait for the next inbound connection
    async fn accept(&self) -> Result<Self::Stream, AcceptError>;

    /// Stop accepting connections
    async fn close(&self) -> Result<(), CloseError>;

    /// Whether `close` has been called
    fn is_closed(&self) -> bool;
}

/// Something that can request remote listeners, one port at a time
#[async_trait]
pub trait ListenerBinder: Send {
    /// Listener produced by a successful bind
    type Listener: RemoteListener;

    /// Ask the remote side to listen on `host:port`
    async fn bind(&mut self, host: &str, port: u16) -> Result<Self::Listener, BindError>;
}

/// A `forwarded-tcpip` channel opened by the server
pub(crate) struct ForwardedChannel {
    pub channel: Channel<Msg>,
    pub connected_port: u32,
    pub originator: String,
}

/// Remote listener backed by an SSH `tcpip-forward`
pub struct SshRemoteListener {
    /// Session handle, shared with the owning [`super::TransportSession`]
    handle: Arc<Mutex<Handle<TunnelHandler>>>,
    /// Address the forward was requested on
    host: String,
    /// Port actually bound on the server
    port: u16,
    /// Channels routed here by the session handler
    incoming: Mutex<mpsc::Receiver<ForwardedChannel>>,
    /// Wakes pending accepts on close
    shutdown: CancellationToken,
    closed: AtomicBool,
}

impl SshRemoteListener {
    pub(crate) fn new(
        handle: Arc<Mutex<Handle<TunnelHandler>>>,
        host: String,
        port: u16,
        incoming: mpsc::Receiver<ForwardedChannel>,
    ) -> Self {
        Self {
            handle,
            host,
            port,
            incoming: Mutex::new(incoming),
            shutdown: CancellationToken::new(),
            closed: AtomicBool::new(false),
        }
    }
}

#[async_trait]
impl RemoteListener for SshRemoteListener {
    type Stream = ChannelStream<Msg>;

    fn port(&self) -> u16 {
        self.port
    }

    async fn accept(&self) -> Result<Self::Stream, AcceptError> {
        let mut incoming = tokio::select! {
            _ = self.shutdown.cancelled() => return Err(AcceptError::Closed),
            guard = self.incoming.lock() => guard,
        };

        let forwarded = tokio::select! {
            _ = self.shutdown.cancelled() => return Err(AcceptError::Closed),
            next = incoming.recv() => next.ok_or(AcceptError::Closed)?,
        };

        if forwarded.connected_port != u32::from(self.port) {
            let _ = forwarded.channel.close().await;
            return Err(AcceptError::Failed(format!(
                "connection for port {} arrived on listener for port {}",
                forwarded.connected_port, self.port
            )));
        }

        tracing::debug!(
            "Accepted tunnel connection from {} on remote port {}",
            forwarded.originator,
            self.port
        );
        Ok(forwarded.channel.into_stream())
    }

    async fn close(&self) -> Result<(), CloseError> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        self.shutdown.cancel();
        // Late forwards get refused by the session handler
        self.incoming.lock().await.close();

        tracing::debug!("Cancelling remote forward on {}:{}", self.host, self.port);
        let handle = self.handle.lock().await;
        handle
            .cancel_tcpip_forward(self.host.clone(), u32::from(self.port))
            .await
            .map(|_| ())
            .map_err(|e| CloseError {
                port: self.port,
                reason: e.to_string(),
            })
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}
