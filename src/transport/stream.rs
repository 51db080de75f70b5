//! Stream-kind transport over loopback TCP.
//!
//! The OS-assigned port doubles as the advertised channel number and the
//! peer socket address is the remote endpoint identity.

use std::io;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use tokio::io::AsyncWriteExt;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;
use tracing::debug;

use super::{
    closed_err, EndpointId, IncomingConnection, RawChannel, ServerSocket, TransportKind,
};

/// Listening socket for the byte-stream channel.
pub struct StreamServerSocket {
    /// Taken on close so the port is released even with an accept pending.
    listener: Mutex<Option<Arc<TcpListener>>>,
    channel: u16,
    closed: watch::Sender<bool>,
}

impl StreamServerSocket {
    /// Bind to a system-assigned loopback port.
    pub async fn bind() -> io::Result<Self> {
        let listener = TcpListener::bind(("127.0.0.1", 0)).await?;
        let channel = listener.local_addr()?.port();
        let (closed, _) = watch::channel(false);

        debug!(channel, "stream listening socket bound");

        Ok(Self {
            listener: Mutex::new(Some(Arc::new(listener))),
            channel,
            closed,
        })
    }
}

#[async_trait]
impl ServerSocket for StreamServerSocket {
    fn kind(&self) -> TransportKind {
        TransportKind::Stream
    }

    fn channel(&self) -> u16 {
        self.channel
    }

    async fn accept(&self) -> io::Result<IncomingConnection> {
        let mut closed = self.closed.subscribe();
        let listener = self.listener.lock().unwrap().clone();
        let Some(listener) = listener else {
            return Err(closed_err());
        };
        if *closed.borrow() {
            return Err(closed_err());
        }

        tokio::select! {
            res = listener.accept() => {
                let (stream, peer) = res?;
                Ok(connection_from(stream, peer))
            }
            _ = closed.changed() => Err(closed_err()),
        }
    }

    fn close(&self) {
        if self.closed.send_replace(true) {
            return;
        }
        self.listener.lock().unwrap().take();
        debug!(channel = self.channel, "stream listening socket closed");
    }

    fn is_closed(&self) -> bool {
        *self.closed.borrow()
    }
}

fn connection_from(stream: TcpStream, peer: SocketAddr) -> IncomingConnection {
    IncomingConnection::new(
        TransportKind::Stream,
        Some(EndpointId::new(peer.to_string())),
        Box::new(StreamChannel {
            stream: tokio::sync::Mutex::new(Some(stream)),
        }),
    )
}

struct StreamChannel {
    stream: tokio::sync::Mutex<Option<TcpStream>>,
}

#[async_trait]
impl RawChannel for StreamChannel {
    async fn reject(&self, code: u8) -> io::Result<()> {
        let mut guard = self.stream.lock().await;
        let stream = guard.as_mut().ok_or_else(closed_err)?;
        stream.write_all(&[code]).await?;
        stream.flush().await
    }

    async fn close(&self) {
        if let Some(mut stream) = self.stream.lock().await.take() {
            let _ = stream.shutdown().await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::AsyncReadExt;

    #[tokio::test]
    async fn accept_resolves_peer_identity() {
        let socket = StreamServerSocket::bind().await.unwrap();
        let channel = socket.channel();

        let client = tokio::spawn(async move {
            TcpStream::connect(("127.0.0.1", channel)).await.unwrap()
        });

        let conn = socket.accept().await.unwrap();
        let client = client.await.unwrap();

        let endpoint = conn.endpoint().unwrap();
        assert_eq!(endpoint.as_str(), client.local_addr().unwrap().to_string());
    }

    #[tokio::test]
    async fn reject_delivers_status_byte() {
        let socket = StreamServerSocket::bind().await.unwrap();
        let channel = socket.channel();

        let mut client = TcpStream::connect(("127.0.0.1", channel)).await.unwrap();
        let conn = socket.accept().await.unwrap();

        conn.reject(0xD3).await.unwrap();
        conn.close().await;

        let mut buf = [0u8; 1];
        client.read_exact(&mut buf).await.unwrap();
        assert_eq!(buf[0], 0xD3);
    }

    #[tokio::test]
    async fn close_unblocks_pending_accept() {
        let socket = Arc::new(StreamServerSocket::bind().await.unwrap());

        let acceptor = {
            let socket = socket.clone();
            tokio::spawn(async move { socket.accept().await })
        };

        // give the accept a chance to block first
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        socket.close();

        let res = acceptor.await.unwrap();
        assert!(res.is_err());
        assert!(socket.is_closed());
    }

    #[tokio::test]
    async fn double_close_is_a_noop() {
        let socket = StreamServerSocket::bind().await.unwrap();
        socket.close();
        socket.close();
        assert!(socket.is_closed());
        assert!(socket.accept().await.is_err());
    }
}
