//! Packet-kind transport over loopback UDP.
//!
//! Connection establishment is a single hello datagram whose UTF-8 payload
//! is the peer's advertised identity. An empty or undecodable hello yields a
//! connection with no resolvable identity, which the accept loop drops.
//!
//! Per-peer channels share the listening socket; the channel itself is
//! datagram-oriented, so closing one is purely local bookkeeping.

use std::io;
use std::net::SocketAddr;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::net::UdpSocket;
use tokio::sync::watch;
use tracing::{debug, trace};

use super::{
    closed_err, EndpointId, IncomingConnection, RawChannel, ServerSocket, TransportKind,
};

/// Longest hello payload we bother reading; identities are short strings.
const MAX_HELLO: usize = 512;

/// Listening socket for the packet channel.
pub struct PacketServerSocket {
    socket: Arc<UdpSocket>,
    channel: u16,
    closed: watch::Sender<bool>,
}

impl PacketServerSocket {
    /// Bind to a system-assigned loopback port.
    pub async fn bind() -> io::Result<Self> {
        let socket = UdpSocket::bind(("127.0.0.1", 0)).await?;
        let channel = socket.local_addr()?.port();
        let (closed, _) = watch::channel(false);

        debug!(channel, "packet listening socket bound");

        Ok(Self {
            socket: Arc::new(socket),
            channel,
            closed,
        })
    }
}

#[async_trait]
impl ServerSocket for PacketServerSocket {
    fn kind(&self) -> TransportKind {
        TransportKind::Packet
    }

    fn channel(&self) -> u16 {
        self.channel
    }

    async fn accept(&self) -> io::Result<IncomingConnection> {
        let mut closed = self.closed.subscribe();
        if *closed.borrow() {
            return Err(closed_err());
        }

        let mut buf = [0u8; MAX_HELLO];
        tokio::select! {
            res = self.socket.recv_from(&mut buf) => {
                let (n, peer) = res?;
                let endpoint = parse_identity(&buf[..n]);
                trace!(%peer, identity = ?endpoint, "hello datagram received");
                Ok(IncomingConnection::new(
                    TransportKind::Packet,
                    endpoint,
                    Box::new(PacketChannel {
                        socket: self.socket.clone(),
                        peer,
                    }),
                ))
            }
            _ = closed.changed() => Err(closed_err()),
        }
    }

    fn close(&self) {
        if self.closed.send_replace(true) {
            return;
        }
        debug!(channel = self.channel, "packet listening socket closed");
    }

    fn is_closed(&self) -> bool {
        *self.closed.borrow()
    }
}

fn parse_identity(payload: &[u8]) -> Option<EndpointId> {
    let identity = std::str::from_utf8(payload).ok()?.trim();
    if identity.is_empty() {
        return None;
    }
    Some(EndpointId::new(identity))
}

struct PacketChannel {
    socket: Arc<UdpSocket>,
    peer: SocketAddr,
}

#[async_trait]
impl RawChannel for PacketChannel {
    async fn reject(&self, code: u8) -> io::Result<()> {
        self.socket.send_to(&[code], self.peer).await?;
        Ok(())
    }

    async fn close(&self) {
        // datagram channel; nothing to tear down beyond the shared socket
        trace!(peer = %self.peer, "packet channel closed");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn client() -> UdpSocket {
        UdpSocket::bind(("127.0.0.1", 0)).await.unwrap()
    }

    #[tokio::test]
    async fn hello_carries_identity() {
        let socket = PacketServerSocket::bind().await.unwrap();
        let peer = client().await;

        peer.send_to(b"AA:BB:CC:DD:EE:FF", ("127.0.0.1", socket.channel()))
            .await
            .unwrap();

        let conn = socket.accept().await.unwrap();
        assert_eq!(conn.endpoint().unwrap().as_str(), "AA:BB:CC:DD:EE:FF");
    }

    #[tokio::test]
    async fn empty_hello_has_no_identity() {
        let socket = PacketServerSocket::bind().await.unwrap();
        let peer = client().await;

        peer.send_to(b"", ("127.0.0.1", socket.channel()))
            .await
            .unwrap();

        let conn = socket.accept().await.unwrap();
        assert!(conn.endpoint().is_none());
    }

    #[tokio::test]
    async fn reject_reaches_the_peer() {
        let socket = PacketServerSocket::bind().await.unwrap();
        let peer = client().await;

        peer.send_to(b"11:22:33:44:55:66", ("127.0.0.1", socket.channel()))
            .await
            .unwrap();

        let conn = socket.accept().await.unwrap();
        conn.reject(0xD3).await.unwrap();
        conn.close().await;

        let mut buf = [0u8; 4];
        let (n, _) = peer.recv_from(&mut buf).await.unwrap();
        assert_eq!(&buf[..n], &[0xD3]);
    }

    #[tokio::test]
    async fn close_unblocks_pending_accept() {
        let socket = Arc::new(PacketServerSocket::bind().await.unwrap());

        let acceptor = {
            let socket = socket.clone();
            tokio::spawn(async move { socket.accept().await })
        };

        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        socket.close();

        assert!(acceptor.await.unwrap().is_err());
    }
}
