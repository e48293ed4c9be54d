//! In-memory listener and dialers for driving the relay and lifecycle
//! without an SSH server.

#![allow(dead_code)]

use std::collections::HashSet;
use std::io;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use tokio::io::{duplex, AsyncReadExt, AsyncWriteExt, DuplexStream};
use tokio::sync::{mpsc, Mutex};
use tokio_util::sync::CancellationToken;

use pt_client::error::{AcceptError, CloseError};
use pt_client::relay::Dialer;
use pt_client::tunnel::RemoteListener;

const STREAM_BUFFER: usize = 64 * 1024;

type Inbound = Result<DuplexStream, AcceptError>;

/// Remote listener fed by a [`RemoteEnd`]
pub struct MemoryListener {
    port: u16,
    incoming: Mutex<mpsc::Receiver<Inbound>>,
    shutdown: CancellationToken,
    closed: AtomicBool,
    close_calls: AtomicUsize,
    effective_closes: AtomicUsize,
    close_delay: Option<Duration>,
}

/// The "server side": opens connections on a [`MemoryListener`]
#[derive(Clone)]
pub struct RemoteEnd {
    tx: mpsc::Sender<Inbound>,
}

impl MemoryListener {
    pub fn new(port: u16) -> (Self, RemoteEnd) {
        Self::build(port, None)
    }

    /// A listener whose close takes `delay` to complete
    pub fn with_close_delay(port: u16, delay: Duration) -> (Self, RemoteEnd) {
        Self::build(port, Some(delay))
    }

    fn build(port: u16, close_delay: Option<Duration>) -> (Self, RemoteEnd) {
        let (tx, rx) = mpsc::channel(64);
        let listener = Self {
            port,
            incoming: Mutex::new(rx),
            shutdown: CancellationToken::new(),
            closed: AtomicBool::new(false),
            close_calls: AtomicUsize::new(0),
            effective_closes: AtomicUsize::new(0),
            close_delay,
        };
        (listener, RemoteEnd { tx })
    }

    pub fn close_calls(&self) -> usize {
        self.close_calls.load(Ordering::SeqCst)
    }

    pub fn effective_closes(&self) -> usize {
        self.effective_closes.load(Ordering::SeqCst)
    }
}

impl RemoteEnd {
    /// Open a tunnel connection; returns the public client's end
    pub async fn connect(&self) -> DuplexStream {
        let (client, server) = duplex(STREAM_BUFFER);
        self.tx
            .send(Ok(server))
            .await
            .expect("listener dropped");
        client
    }

    /// Make the next accept fail without closing the listener
    pub async fn inject_accept_error(&self) {
        self.tx
            .send(Err(AcceptError::Failed("injected".to_string())))
            .await
            .expect("listener dropped");
    }
}

#[async_trait]
impl RemoteListener for MemoryListener {
    type Stream = DuplexStream;

    fn port(&self) -> u16 {
        self.port
    }

    async fn accept(&self) -> Result<DuplexStream, AcceptError> {
        let mut incoming = tokio::select! {
            _ = self.shutdown.cancelled() => return Err(AcceptError::Closed),
            guard = self.incoming.lock() => guard,
        };
        tokio::select! {
            _ = self.shutdown.cancelled() => Err(AcceptError::Closed),
            next = incoming.recv() => next.unwrap_or(Err(AcceptError::Closed)),
        }
    }

    async fn close(&self) -> Result<(), CloseError> {
        self.close_calls.fetch_add(1, Ordering::SeqCst);
        if self.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        self.effective_closes.fetch_add(1, Ordering::SeqCst);
        self.shutdown.cancel();
        if let Some(delay) = self.close_delay {
            tokio::time::sleep(delay).await;
        }
        Ok(())
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}

/// Echo until EOF, then close
pub async fn echo(mut stream: DuplexStream) {
    let mut buf = [0u8; 4096];
    loop {
        match stream.read(&mut buf).await {
            Ok(0) | Err(_) => break,
            Ok(n) => {
                if stream.write_all(&buf[..n]).await.is_err() {
                    break;
                }
            }
        }
    }
    let _ = stream.shutdown().await;
}

/// Local service that echoes; optionally refuses selected dials (1-based)
pub struct EchoDialer {
    calls: AtomicUsize,
    refuse: HashSet<usize>,
}

impl EchoDialer {
    pub fn new() -> Self {
        Self::refusing(&[])
    }

    pub fn refusing(calls: &[usize]) -> Self {
        Self {
            calls: AtomicUsize::new(0),
            refuse: calls.iter().copied().collect(),
        }
    }
}

#[async_trait]
impl Dialer for EchoDialer {
    type Stream = DuplexStream;

    async fn dial(&self) -> io::Result<DuplexStream> {
        let call = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
        if self.refuse.contains(&call) {
            return Err(io::Error::new(io::ErrorKind::ConnectionRefused, "refused"));
        }
        let (local, service) = duplex(STREAM_BUFFER);
        tokio::spawn(echo(service));
        Ok(local)
    }

    fn target(&self) -> &str {
        "echo"
    }
}

/// Local service whose connections are handed to the test
pub struct ServiceDialer {
    accepted: mpsc::UnboundedSender<DuplexStream>,
}

impl ServiceDialer {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<DuplexStream>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { accepted: tx }, rx)
    }
}

#[async_trait]
impl Dialer for ServiceDialer {
    type Stream = DuplexStream;

    async fn dial(&self) -> io::Result<DuplexStream> {
        let (local, service) = duplex(STREAM_BUFFER);
        self.accepted
            .send(service)
            .map_err(|_| io::Error::new(io::ErrorKind::ConnectionRefused, "service gone"))?;
        Ok(local)
    }

    fn target(&self) -> &str {
        "service"
    }
}

/// Poll `check` until it holds or `limit` passes
pub async fn eventually(limit: Duration, mut check: impl FnMut() -> bool) -> bool {
    let deadline = tokio::time::Instant::now() + limit;
    while tokio::time::Instant::now() < deadline {
        if check() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    check()
}
