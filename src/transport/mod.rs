//! Transport abstractions for the two server channels.
//!
//! The same logical service is reachable over a byte-stream channel and a
//! packet channel. Everything above this module works against the
//! [`ServerSocket`] and [`SocketFactory`] seams, so the accept loops and the
//! arbiter never care which concrete transport delivered a connection.
//!
//! Two implementations ship with the crate: loopback TCP/UDP sockets for the
//! daemon, and a scriptable mock for tests.

use std::fmt;
use std::io;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;

pub mod mock;
mod packet;
mod stream;

pub use mock::{MockFactory, MockServerSocket};
pub use packet::PacketServerSocket;
pub use stream::StreamServerSocket;

/// The two parallel channels over which the service is reachable.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TransportKind {
    /// Byte-stream-oriented channel.
    Stream,
    /// Packet-oriented channel.
    Packet,
}

impl fmt::Display for TransportKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TransportKind::Stream => write!(f, "stream"),
            TransportKind::Packet => write!(f, "packet"),
        }
    }
}

/// Stable printable identity of a remote peer.
///
/// Used for validation and diagnostics only; this crate never interprets the
/// contents beyond equality.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct EndpointId(String);

impl EndpointId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for EndpointId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Power state of the radio backing the transports.
///
/// Socket allocation is only worth retrying while the radio is on or still
/// coming up.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RadioState {
    Off,
    TurningOn,
    On,
    TurningOff,
}

impl RadioState {
    /// Whether a failed socket allocation may succeed on a later attempt.
    pub fn allows_retry(&self) -> bool {
        matches!(self, RadioState::On | RadioState::TurningOn)
    }
}

/// Raw bidirectional channel of an accepted connection.
///
/// The protocol session living on top of a winning connection is out of
/// scope here; this crate only ever sends the single rejection status byte
/// to losers and closes channels.
#[async_trait]
pub trait RawChannel: Send + Sync {
    /// Send the rejection status byte to the peer. Best effort.
    async fn reject(&self, code: u8) -> io::Result<()>;

    /// Tear the channel down. Called at most once via
    /// [`IncomingConnection::close`].
    async fn close(&self);
}

/// An accepted raw connection paired with its resolved remote identity.
///
/// Ownership transfers exactly once: either to the validator (winner) or to
/// the rejection responder (loser).
pub struct IncomingConnection {
    kind: TransportKind,
    endpoint: Option<EndpointId>,
    channel: Box<dyn RawChannel>,
    closed: AtomicBool,
}

impl IncomingConnection {
    pub fn new(
        kind: TransportKind,
        endpoint: Option<EndpointId>,
        channel: Box<dyn RawChannel>,
    ) -> Self {
        Self {
            kind,
            endpoint,
            channel,
            closed: AtomicBool::new(false),
        }
    }

    pub fn kind(&self) -> TransportKind {
        self.kind
    }

    /// Remote identity, if the transport could resolve one.
    pub fn endpoint(&self) -> Option<&EndpointId> {
        self.endpoint.as_ref()
    }

    /// Send the rejection status byte to the peer.
    pub async fn reject(&self, code: u8) -> io::Result<()> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(closed_err());
        }
        self.channel.reject(code).await
    }

    /// Close the underlying channel. Safe to call more than once; only the
    /// first call reaches the transport.
    pub async fn close(&self) {
        if !self.closed.swap(true, Ordering::SeqCst) {
            self.channel.close().await;
        }
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}

impl fmt::Debug for IncomingConnection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("IncomingConnection")
            .field("kind", &self.kind)
            .field("endpoint", &self.endpoint)
            .field("closed", &self.is_closed())
            .finish()
    }
}

/// Server-side listening socket for one transport kind.
#[async_trait]
pub trait ServerSocket: Send + Sync {
    fn kind(&self) -> TransportKind;

    /// System-assigned channel number, stable for the socket lifetime.
    fn channel(&self) -> u16;

    /// Wait for the next incoming connection.
    async fn accept(&self) -> io::Result<IncomingConnection>;

    /// Close the listening socket. Idempotent; also fails a pending accept,
    /// which is the only reliable way to unblock one.
    fn close(&self);

    fn is_closed(&self) -> bool;
}

/// Allocates listening sockets and reports the radio power state, like the
/// adapter object it stands in for.
#[async_trait]
pub trait SocketFactory: Send + Sync {
    fn radio_state(&self) -> RadioState;

    async fn bind(&self, kind: TransportKind) -> io::Result<Arc<dyn ServerSocket>>;
}

/// Socket factory backed by loopback TCP (stream) and UDP (packet) sockets.
#[derive(Debug, Default)]
pub struct LoopbackFactory;

impl LoopbackFactory {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl SocketFactory for LoopbackFactory {
    fn radio_state(&self) -> RadioState {
        RadioState::On
    }

    async fn bind(&self, kind: TransportKind) -> io::Result<Arc<dyn ServerSocket>> {
        match kind {
            TransportKind::Stream => Ok(Arc::new(StreamServerSocket::bind().await?)),
            TransportKind::Packet => Ok(Arc::new(PacketServerSocket::bind().await?)),
        }
    }
}

pub(crate) fn closed_err() -> io::Error {
    io::Error::new(io::ErrorKind::NotConnected, "socket closed")
}
