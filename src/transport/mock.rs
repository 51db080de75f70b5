//! Mock transport for testing without real sockets.
//!
//! [`MockFactory`] scripts bind failures and radio state transitions;
//! [`MockServerSocket`] lets a test push connections or accept errors into
//! an accept loop; [`mock_connection`] builds a connection whose rejection
//! and close activity can be observed through a [`ChannelProbe`].

use std::io;
use std::sync::atomic::{AtomicBool, AtomicU16, AtomicU32, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use tokio::sync::{mpsc, watch};

use super::{
    closed_err, EndpointId, IncomingConnection, RadioState, RawChannel, ServerSocket,
    SocketFactory, TransportKind,
};

/// Scriptable socket factory.
pub struct MockFactory {
    radio: Mutex<RadioState>,
    bind_failures: AtomicU32,
    next_channel: AtomicU16,
    bound: Mutex<Vec<Arc<MockServerSocket>>>,
}

impl MockFactory {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            radio: Mutex::new(RadioState::On),
            bind_failures: AtomicU32::new(0),
            next_channel: AtomicU16::new(1),
            bound: Mutex::new(Vec::new()),
        })
    }

    pub fn set_radio_state(&self, state: RadioState) {
        *self.radio.lock().unwrap() = state;
    }

    /// Fail the next `n` bind calls with an I/O error.
    pub fn fail_next_binds(&self, n: u32) {
        self.bind_failures.store(n, Ordering::SeqCst);
    }

    /// The most recently bound socket of `kind`, if any.
    pub fn socket(&self, kind: TransportKind) -> Option<Arc<MockServerSocket>> {
        self.bound
            .lock()
            .unwrap()
            .iter()
            .rev()
            .find(|s| s.kind() == kind)
            .cloned()
    }
}

#[async_trait]
impl SocketFactory for MockFactory {
    fn radio_state(&self) -> RadioState {
        *self.radio.lock().unwrap()
    }

    async fn bind(&self, kind: TransportKind) -> io::Result<Arc<dyn ServerSocket>> {
        let remaining = self.bind_failures.load(Ordering::SeqCst);
        if remaining > 0 {
            self.bind_failures.store(remaining - 1, Ordering::SeqCst);
            return Err(io::Error::new(
                io::ErrorKind::AddrNotAvailable,
                "scripted bind failure",
            ));
        }

        let channel = self.next_channel.fetch_add(1, Ordering::SeqCst);
        let socket = Arc::new(MockServerSocket::new(kind, channel));
        self.bound.lock().unwrap().push(socket.clone());
        Ok(socket)
    }
}

/// In-process server socket fed by the test.
pub struct MockServerSocket {
    kind: TransportKind,
    channel: u16,
    tx: mpsc::UnboundedSender<io::Result<IncomingConnection>>,
    rx: tokio::sync::Mutex<mpsc::UnboundedReceiver<io::Result<IncomingConnection>>>,
    closed: watch::Sender<bool>,
}

impl MockServerSocket {
    pub fn new(kind: TransportKind, channel: u16) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        let (closed, _) = watch::channel(false);
        Self {
            kind,
            channel,
            tx,
            rx: tokio::sync::Mutex::new(rx),
            closed,
        }
    }

    /// Deliver a connection to the accept loop.
    pub fn push(&self, conn: IncomingConnection) {
        let _ = self.tx.send(Ok(conn));
    }

    /// Fail the next accept with `err`.
    pub fn push_error(&self, err: io::Error) {
        let _ = self.tx.send(Err(err));
    }
}

#[async_trait]
impl ServerSocket for MockServerSocket {
    fn kind(&self) -> TransportKind {
        self.kind
    }

    fn channel(&self) -> u16 {
        self.channel
    }

    async fn accept(&self) -> io::Result<IncomingConnection> {
        let mut closed = self.closed.subscribe();
        if *closed.borrow() {
            return Err(closed_err());
        }

        let mut rx = self.rx.lock().await;
        tokio::select! {
            item = rx.recv() => item.unwrap_or_else(|| Err(closed_err())),
            _ = closed.changed() => Err(closed_err()),
        }
    }

    fn close(&self) {
        self.closed.send_replace(true);
    }

    fn is_closed(&self) -> bool {
        *self.closed.borrow()
    }
}

/// Build a connection whose channel activity is observable via the probe.
pub fn mock_connection(
    kind: TransportKind,
    endpoint: Option<&str>,
) -> (IncomingConnection, ChannelProbe) {
    let state = Arc::new(ChannelState::default());
    let conn = IncomingConnection::new(
        kind,
        endpoint.map(EndpointId::new),
        Box::new(MockChannel {
            state: state.clone(),
        }),
    );
    (conn, ChannelProbe { state })
}

#[derive(Default)]
struct ChannelState {
    reject_code: Mutex<Option<u8>>,
    closed: AtomicBool,
    close_count: AtomicUsize,
}

struct MockChannel {
    state: Arc<ChannelState>,
}

#[async_trait]
impl RawChannel for MockChannel {
    async fn reject(&self, code: u8) -> io::Result<()> {
        *self.state.reject_code.lock().unwrap() = Some(code);
        Ok(())
    }

    async fn close(&self) {
        self.state.closed.store(true, Ordering::SeqCst);
        self.state.close_count.fetch_add(1, Ordering::SeqCst);
    }
}

/// Test-side view of a mock channel.
pub struct ChannelProbe {
    state: Arc<ChannelState>,
}

impl ChannelProbe {
    /// Rejection status the channel delivered, if any.
    pub fn reject_code(&self) -> Option<u8> {
        *self.state.reject_code.lock().unwrap()
    }

    pub fn is_closed(&self) -> bool {
        self.state.closed.load(Ordering::SeqCst)
    }

    /// How many times the transport-level close actually ran.
    pub fn close_count(&self) -> usize {
        self.state.close_count.load(Ordering::SeqCst)
    }
}
