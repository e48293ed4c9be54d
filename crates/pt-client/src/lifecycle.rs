//! Tunnel lifecycle
//!
//! Runs the tunnel pipeline (key, SSH session, port negotiation, relay) as
//! a background task and shuts it down when either the pipeline ends or
//! the process is asked to stop. Both paths feed one termination channel,
//! so shutdown happens in exactly one place.

use std::future::Future;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{mpsc, watch};

use pt_core::ClientConfig;

use crate::credential::load_signing_identity;
use crate::error::TunnelError;
use crate::relay::{ActivePairs, Dialer, Relay, TcpDialer};
use crate::tunnel::{
    candidate_ports, negotiate_listener, RemoteListener, SshRemoteListener, TransportSession,
    REMOTE_BIND_HOST,
};

/// Lifecycle of a [`TunnelClient`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LifecycleState {
    /// Not started yet
    Idle,
    /// Setting up the session and remote listener
    Starting,
    /// Relaying connections
    Running,
    /// Shutdown in progress
    Stopping,
    /// Shutdown finished
    Stopped,
}

/// Why the controller is shutting down
#[derive(Debug)]
enum Termination {
    /// SIGINT/SIGTERM, or the caller's stop future
    Signal,
    /// Setup failed
    Failed(TunnelError),
    /// The relay saw its listener close underneath it
    ListenerClosed,
}

/// Establishes the remote listener for a tunnel
#[async_trait]
pub trait Connector: Send + Sync + 'static {
    /// Listener type produced on success
    type Listener: RemoteListener;

    /// Run setup up to a bound remote listener
    async fn connect(&self) -> Result<Self::Listener, TunnelError>;
}

/// Connects over SSH using a [`ClientConfig`]
pub struct SshConnector {
    config: ClientConfig,
}

impl SshConnector {
    /// Create a connector for `config`
    pub fn new(config: ClientConfig) -> Self {
        Self { config }
    }
}

#[async_trait]
impl Connector for SshConnector {
    type Listener = SshRemoteListener;

    async fn connect(&self) -> Result<SshRemoteListener, TunnelError> {
        let key = load_signing_identity(&self.config.key_path)?;
        let identity = self.config.identity();

        let mut session = TransportSession::open(
            &self.config.ssh_url,
            &identity,
            Arc::new(key),
            self.config.connect_timeout,
        )
        .await?;

        let candidates = candidate_ports(
            &self.config.tunnel.remote_ports,
            &self.config.port_candidates,
        );
        tracing::debug!("Trying {} remote port candidates", candidates.len());

        match negotiate_listener(&mut session, REMOTE_BIND_HOST, &candidates).await {
            Ok(listener) => {
                tracing::info!(
                    "Tunnel ready: {} -> {}",
                    self.config.tunnel_addr(listener.port()),
                    self.config.local_addr()
                );
                Ok(listener)
            }
            Err(e) => {
                if let Err(close_err) = session.close().await {
                    tracing::debug!("Failed to disconnect after negotiation failure: {}", close_err);
                }
                Err(e.into())
            }
        }
    }
}

/// The remote listener, shared by the pipeline and the shutdown routine
///
/// Once shutdown has taken the slot, a listener installed late is refused
/// so the pipeline can close it itself.
struct ListenerSlot<L> {
    inner: Mutex<SlotState<L>>,
}

struct SlotState<L> {
    listener: Option<Arc<L>>,
    shutting_down: bool,
}

impl<L> ListenerSlot<L> {
    fn new() -> Self {
        Self {
            inner: Mutex::new(SlotState {
                listener: None,
                shutting_down: false,
            }),
        }
    }

    /// Store the listener; `false` if shutdown already started
    fn install(&self, listener: Arc<L>) -> bool {
        let mut state = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
        if state.shutting_down {
            return false;
        }
        state.listener = Some(listener);
        true
    }

    /// Mark shutdown and hand out the listener, if one was installed
    fn begin_shutdown(&self) -> Option<Arc<L>> {
        let mut state = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
        state.shutting_down = true;
        state.listener.clone()
    }
}

/// Drives one tunnel from start to shutdown
pub struct TunnelClient<C, D> {
    connector: C,
    dialer: D,
    shutdown_timeout: Duration,
    state_tx: Arc<watch::Sender<LifecycleState>>,
    active: ActivePairs,
}

impl TunnelClient<SshConnector, TcpDialer> {
    /// Create a client for the tunnel described by `config`
    pub fn new(config: ClientConfig) -> Self {
        let dialer = TcpDialer::new(config.local_addr(), config.local_dial_timeout);
        let shutdown_timeout = config.shutdown_timeout;
        Self::with_parts(SshConnector::new(config), dialer, shutdown_timeout)
    }
}

impl<C: Connector, D: Dialer> TunnelClient<C, D> {
    /// Assemble a client from its parts
    pub fn with_parts(connector: C, dialer: D, shutdown_timeout: Duration) -> Self {
        let (state_tx, _) = watch::channel(LifecycleState::Idle);
        Self {
            connector,
            dialer,
            shutdown_timeout,
            state_tx: Arc::new(state_tx),
            active: ActivePairs::default(),
        }
    }

    /// Watch lifecycle transitions
    pub fn state(&self) -> watch::Receiver<LifecycleState> {
        self.state_tx.subscribe()
    }

    /// Live relay pair count
    pub fn active_pairs(&self) -> ActivePairs {
        self.active.clone()
    }

    /// Run until SIGINT/SIGTERM or a fatal pipeline error, then shut down
    pub async fn start(self) -> Result<(), TunnelError> {
        self.run_until(shutdown_signal()).await
    }

    /// Run until `stop` completes or the pipeline ends, then shut down
    ///
    /// Returns `Ok` only for a requested stop that closed the listener in
    /// time. Setup failures, loss of the remote listener and an expired
    /// shutdown deadline are errors.
    pub async fn run_until<F>(self, stop: F) -> Result<(), TunnelError>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        self.state_tx.send_replace(LifecycleState::Starting);

        let (term_tx, mut term_rx) = mpsc::channel::<Termination>(2);
        let slot = Arc::new(ListenerSlot::new());
        let relay = Relay::with_active_pairs(self.dialer, self.active);

        let signal_tx = term_tx.clone();
        let signal_task = tokio::spawn(async move {
            stop.await;
            let _ = signal_tx.send(Termination::Signal).await;
        });

        let mut pipeline = tokio::spawn(run_pipeline(
            self.connector,
            relay,
            Arc::clone(&slot),
            term_tx,
            Arc::clone(&self.state_tx),
        ));

        let termination = tokio::select! {
            received = term_rx.recv() => received.unwrap_or(Termination::Signal),
            joined = &mut pipeline => match joined {
                // The pipeline sends before it returns
                Ok(()) => term_rx.recv().await.unwrap_or(Termination::Signal),
                Err(e) => {
                    tracing::error!("Tunnel pipeline task failed: {}", e);
                    Termination::Failed(TunnelError::Task(e.to_string()))
                }
            },
        };
        self.state_tx.send_replace(LifecycleState::Stopping);
        tracing::info!("Stopping tunnel client");

        let shutdown = shutdown_listener(slot.begin_shutdown(), self.shutdown_timeout).await;

        signal_task.abort();
        pipeline.abort();
        self.state_tx.send_replace(LifecycleState::Stopped);

        match (termination, shutdown) {
            (Termination::Failed(e), _) => Err(e),
            (_, Err(e)) => Err(e),
            (Termination::ListenerClosed, Ok(())) => Err(TunnelError::RemoteClosed),
            (Termination::Signal, Ok(())) => {
                tracing::info!("Tunnel client stopped");
                Ok(())
            }
        }
    }
}

/// Background half of the controller: setup, then the accept loop
async fn run_pipeline<C: Connector, D: Dialer>(
    connector: C,
    relay: Relay<D>,
    slot: Arc<ListenerSlot<C::Listener>>,
    term_tx: mpsc::Sender<Termination>,
    state_tx: Arc<watch::Sender<LifecycleState>>,
) {
    let termination = match connector.connect().await {
        Err(e) => {
            tracing::debug!("Failed to establish tunnel connection: {}", e);
            Termination::Failed(e)
        }
        Ok(listener) => {
            let listener = Arc::new(listener);
            if !slot.install(Arc::clone(&listener)) {
                tracing::debug!("Shutdown began during setup, closing new listener");
                let _ = listener.close().await;
                return;
            }

            state_tx.send_if_modified(|state| {
                if *state == LifecycleState::Starting {
                    *state = LifecycleState::Running;
                    true
                } else {
                    false
                }
            });

            relay.serve(listener).await;
            Termination::ListenerClosed
        }
    };

    let _ = term_tx.send(termination).await;
}

/// Close the listener within `deadline`
///
/// A failed close is logged but not an error: the listener stops
/// accepting locally either way. Only the deadline expiring is.
async fn shutdown_listener<L: RemoteListener>(
    listener: Option<Arc<L>>,
    deadline: Duration,
) -> Result<(), TunnelError> {
    let Some(listener) = listener else {
        tracing::debug!("No remote listener to close");
        return Ok(());
    };
    if listener.is_closed() {
        tracing::debug!("Remote listener on port {} already closed", listener.port());
        return Ok(());
    }

    match tokio::time::timeout(deadline, listener.close()).await {
        Ok(Ok(())) => {
            tracing::info!("Closed remote listener on port {}", listener.port());
            Ok(())
        }
        Ok(Err(e)) => {
            tracing::warn!("{}", e);
            Ok(())
        }
        Err(_) => {
            tracing::error!("Failed to stop tunnel client within {:?}", deadline);
            Err(TunnelError::ShutdownTimeout(deadline))
        }
    }
}

/// Resolve on SIGINT (Ctrl+C) or SIGTERM
pub async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!("Failed to listen for Ctrl+C: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                tracing::error!("Failed to listen for SIGTERM: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            tracing::info!("Received Ctrl+C, initiating shutdown...");
        }
        _ = terminate => {
            tracing::info!("Received SIGTERM, initiating shutdown...");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::{AcceptError, CloseError};
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use tokio::io::DuplexStream;

    #[derive(Default)]
    struct CountingListener {
        closed: AtomicBool,
        closes: AtomicUsize,
    }

    #[async_trait]
    impl RemoteListener for CountingListener {
        type Stream = DuplexStream;

        fn port(&self) -> u16 {
            41000
        }

        async fn accept(&self) -> Result<DuplexStream, AcceptError> {
            Err(AcceptError::Closed)
        }

        async fn close(&self) -> Result<(), CloseError> {
            self.closes.fetch_add(1, Ordering::SeqCst);
            self.closed.store(true, Ordering::SeqCst);
            Ok(())
        }

        fn is_closed(&self) -> bool {
            self.closed.load(Ordering::SeqCst)
        }
    }

    #[tokio::test]
    async fn test_shutdown_closes_open_listener() {
        let listener = Arc::new(CountingListener::default());
        shutdown_listener(Some(Arc::clone(&listener)), Duration::from_secs(1))
            .await
            .unwrap();
        assert_eq!(listener.closes.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_shutdown_skips_closed_listener() {
        let listener = Arc::new(CountingListener::default());
        listener.close().await.unwrap();

        shutdown_listener(Some(Arc::clone(&listener)), Duration::from_secs(1))
            .await
            .unwrap();
        assert_eq!(listener.closes.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_shutdown_without_listener() {
        shutdown_listener::<CountingListener>(None, Duration::from_secs(1))
            .await
            .unwrap();
    }

    #[test]
    fn test_slot_hands_out_listener() {
        let slot = ListenerSlot::new();
        assert!(slot.install(Arc::new(7u16)));
        assert_eq!(slot.begin_shutdown().as_deref(), Some(&7));
    }

    #[test]
    fn test_slot_refuses_after_shutdown() {
        let slot = ListenerSlot::<u16>::new();
        assert!(slot.begin_shutdown().is_none());
        assert!(!slot.install(Arc::new(7)));
        assert!(slot.begin_shutdown().is_none());
    }
}
