//! Connection relay
//!
//! Accepts tunnel connections from the remote listener, dials the local
//! service for each one and copies bytes both ways. The relay is a
//! transparent byte pipe: no framing, no buffering beyond the sockets.

use std::io;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt, ReadHalf, WriteHalf};
use tokio::net::TcpStream;
use tokio::sync::Notify;

use crate::error::AcceptError;
use crate::tunnel::RemoteListener;

/// Opens connections to the local service
#[async_trait]
pub trait Dialer: Send + Sync + 'static {
    /// Stream type of a local connection
    type Stream: AsyncRead + AsyncWrite + Unpin + Send + 'static;

    /// Connect to the local service
    async fn dial(&self) -> io::Result<Self::Stream>;

    /// Human-readable target, for logging
    fn target(&self) -> &str;
}

/// Dials the local service over TCP
#[derive(Debug, Clone)]
pub struct TcpDialer {
    addr: String,
    timeout: Duration,
}

impl TcpDialer {
    /// Create a dialer for `addr` (`host:port`)
    pub fn new(addr: impl Into<String>, timeout: Duration) -> Self {
        Self {
            addr: addr.into(),
            timeout,
        }
    }
}

#[async_trait]
impl Dialer for TcpDialer {
    type Stream = TcpStream;

    async fn dial(&self) -> io::Result<TcpStream> {
        let stream = tokio::time::timeout(self.timeout, TcpStream::connect(&self.addr))
            .await
            .map_err(|_| {
                io::Error::new(
                    io::ErrorKind::TimedOut,
                    format!("connect timed out after {:?}", self.timeout),
                )
            })??;
        stream.set_nodelay(true)?;
        Ok(stream)
    }

    fn target(&self) -> &str {
        &self.addr
    }
}

/// Counters from a [`Relay`]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RelayStats {
    /// Connections accepted from the remote listener
    pub accepted: u64,
    /// Pairs that reached the relaying state
    pub relayed: u64,
    /// Accepted connections dropped because the local dial failed
    pub dial_failures: u64,
    /// Accept calls that failed without closing the listener
    pub accept_errors: u64,
}

/// Number of relay pairs whose copy tasks are still running
#[derive(Debug, Clone, Default)]
pub struct ActivePairs(Arc<AtomicUsize>);

impl ActivePairs {
    /// Current count
    pub fn get(&self) -> usize {
        self.0.load(Ordering::SeqCst)
    }

    fn enter(&self) -> PairGuard {
        self.0.fetch_add(1, Ordering::SeqCst);
        PairGuard(Arc::clone(&self.0))
    }
}

/// Held by both copy tasks of a pair; the pair stops counting when the
/// last one drops it
struct PairGuard(Arc<AtomicUsize>);

impl Drop for PairGuard {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

/// Direction of one copy task
#[derive(Debug, Clone, Copy)]
enum Direction {
    RemoteToLocal,
    LocalToRemote,
}

/// Live counters behind [`RelayStats`]; dial tasks update them after the
/// accept loop has moved on
#[derive(Debug, Default)]
struct RelayCounters {
    accepted: AtomicU64,
    relayed: AtomicU64,
    dial_failures: AtomicU64,
    accept_errors: AtomicU64,
}

impl RelayCounters {
    fn snapshot(&self) -> RelayStats {
        RelayStats {
            accepted: self.accepted.load(Ordering::Relaxed),
            relayed: self.relayed.load(Ordering::Relaxed),
            dial_failures: self.dial_failures.load(Ordering::Relaxed),
            accept_errors: self.accept_errors.load(Ordering::Relaxed),
        }
    }
}

/// Accept loop relaying remote connections to the local service
pub struct Relay<D> {
    dialer: Arc<D>,
    active: ActivePairs,
    counters: Arc<RelayCounters>,
    next_pair: AtomicU64,
}

impl<D: Dialer> Relay<D> {
    /// Create a relay that dials through `dialer`
    pub fn new(dialer: D) -> Self {
        Self::with_active_pairs(dialer, ActivePairs::default())
    }

    /// Create a relay that reports its pairs into `active`
    pub fn with_active_pairs(dialer: D, active: ActivePairs) -> Self {
        Self {
            dialer: Arc::new(dialer),
            active,
            counters: Arc::new(RelayCounters::default()),
            next_pair: AtomicU64::new(1),
        }
    }

    /// Handle to the live pair count
    pub fn active_pairs(&self) -> ActivePairs {
        self.active.clone()
    }

    /// Counters so far, including dials still finishing in the background
    pub fn stats(&self) -> RelayStats {
        self.counters.snapshot()
    }

    /// Run the accept loop until the listener is closed
    ///
    /// Each accepted connection dials the local service in its own task, so
    /// a slow or unreachable local service never holds up later accepts.
    /// Per-connection failures (an accept error that does not close the
    /// listener, a failed local dial) are logged and the loop keeps going.
    /// Pairs already relaying are left to finish on their own.
    pub async fn serve<L: RemoteListener>(&self, listener: Arc<L>) -> RelayStats {
        loop {
            let remote = match listener.accept().await {
                Ok(stream) => stream,
                Err(AcceptError::Closed) => {
                    tracing::info!("Remote listener on port {} closed", listener.port());
                    break;
                }
                Err(e) => {
                    self.counters.accept_errors.fetch_add(1, Ordering::Relaxed);
                    tracing::warn!("{}", e);
                    continue;
                }
            };
            self.counters.accepted.fetch_add(1, Ordering::Relaxed);

            let pair = self.next_pair.fetch_add(1, Ordering::Relaxed);
            tokio::spawn(dial_and_relay(
                pair,
                remote,
                Arc::clone(&self.dialer),
                self.active.clone(),
                Arc::clone(&self.counters),
            ));
        }

        let stats = self.counters.snapshot();
        tracing::debug!(
            "Relay stopped: {} accepted, {} relayed, {} dial failures, {} accept errors",
            stats.accepted,
            stats.relayed,
            stats.dial_failures,
            stats.accept_errors
        );
        stats
    }
}

/// Dial the local service for one accepted connection, then relay it
async fn dial_and_relay<R, D>(
    pair: u64,
    mut remote: R,
    dialer: Arc<D>,
    active: ActivePairs,
    counters: Arc<RelayCounters>,
) where
    R: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    D: Dialer,
{
    tracing::debug!("Pair {}: dialing {}", pair, dialer.target());

    let local = match dialer.dial().await {
        Ok(stream) => stream,
        Err(e) => {
            counters.dial_failures.fetch_add(1, Ordering::Relaxed);
            tracing::error!(
                "Failed to connect to local service at {}: {}",
                dialer.target(),
                e
            );
            let _ = remote.shutdown().await;
            return;
        }
    };

    counters.relayed.fetch_add(1, Ordering::Relaxed);
    tracing::debug!("Pair {}: relaying", pair);
    spawn_pair(pair, remote, local, active.enter());
}

/// Start the two copy tasks of a relay pair
///
/// Whichever direction ends first shuts down its writer and wakes its
/// sibling, which then stops and shuts down the other writer. Both
/// streams are closed once both tasks return.
fn spawn_pair<R, S>(pair: u64, remote: R, local: S, guard: PairGuard)
where
    R: AsyncRead + AsyncWrite + Send + 'static,
    S: AsyncRead + AsyncWrite + Send + 'static,
{
    let (remote_read, remote_write) = tokio::io::split(remote);
    let (local_read, local_write) = tokio::io::split(local);

    let inbound_done = Arc::new(Notify::new());
    let outbound_done = Arc::new(Notify::new());
    let guard = Arc::new(guard);

    tokio::spawn(pipe(
        pair,
        Direction::RemoteToLocal,
        remote_read,
        local_write,
        Arc::clone(&outbound_done),
        Arc::clone(&inbound_done),
        Arc::clone(&guard),
    ));
    tokio::spawn(pipe(
        pair,
        Direction::LocalToRemote,
        local_read,
        remote_write,
        inbound_done,
        outbound_done,
        guard,
    ));
}

/// Copy one direction of a pair until EOF, error, or the sibling finishing
async fn pipe<R, W>(
    pair: u64,
    direction: Direction,
    mut reader: ReadHalf<R>,
    mut writer: WriteHalf<W>,
    sibling_done: Arc<Notify>,
    done: Arc<Notify>,
    _guard: Arc<PairGuard>,
) where
    R: AsyncRead,
    W: AsyncWrite,
{
    tokio::select! {
        result = tokio::io::copy(&mut reader, &mut writer) => match result {
            Ok(bytes) => tracing::debug!("Pair {} {:?}: closed after {} bytes", pair, direction, bytes),
            Err(e) => tracing::debug!("Pair {} {:?}: {}", pair, direction, e),
        },
        _ = sibling_done.notified() => {
            tracing::trace!("Pair {} {:?}: stopped by other direction", pair, direction);
        }
    }

    let _ = writer.shutdown().await;
    done.notify_one();
}
