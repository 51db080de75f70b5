//! Rejection responder for losing connections.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tracing::{debug, trace};

use crate::transport::IncomingConnection;

/// Answers a losing connection with a fixed rejection status, then closes it.
///
/// A silent or misbehaving peer must not hold the socket open indefinitely,
/// so the socket is closed when a one-shot timer expires unless an explicit
/// [`shutdown`](Self::shutdown) pre-empts it. Both paths go through the
/// connection's one-shot close, so the socket is torn down exactly once no
/// matter how the race falls.
pub struct RejectionResponder {
    conn: Arc<IncomingConnection>,
    cancel: Arc<Notify>,
    handle: JoinHandle<()>,
}

impl RejectionResponder {
    /// Take ownership of `conn`, deliver `code`, and arm the teardown timer.
    ///
    /// The responder is detachable: dropping the returned handle leaves the
    /// spawned task running until the timer fires.
    pub fn spawn(conn: IncomingConnection, code: u8, timeout: Duration) -> Self {
        let conn = Arc::new(conn);
        let cancel = Arc::new(Notify::new());
        let handle = tokio::spawn(run(conn.clone(), cancel.clone(), code, timeout));
        Self {
            conn,
            cancel,
            handle,
        }
    }

    /// Close the socket now and cancel the pending timer. Idempotent.
    pub async fn shutdown(&self) {
        self.cancel.notify_one();
        self.conn.close().await;
    }

    /// Whether the responder task has run to completion.
    pub fn is_finished(&self) -> bool {
        self.handle.is_finished()
    }

    /// Whether the losing socket has been closed.
    pub fn is_closed(&self) -> bool {
        self.conn.is_closed()
    }
}

async fn run(conn: Arc<IncomingConnection>, cancel: Arc<Notify>, code: u8, timeout: Duration) {
    let endpoint = conn.endpoint().cloned();

    if let Err(e) = conn.reject(code).await {
        // a loser we cannot even answer still gets its socket closed below
        debug!(endpoint = ?endpoint, error = %e, "rejection status not delivered");
    }

    tokio::select! {
        _ = tokio::time::sleep(timeout) => {
            debug!(endpoint = ?endpoint, "rejection timer expired, closing socket");
        }
        _ = cancel.notified() => {
            trace!(endpoint = ?endpoint, "rejection responder cancelled");
        }
    }

    conn.close().await;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::mock::mock_connection;
    use crate::transport::TransportKind;

    #[tokio::test(start_paused = true)]
    async fn timer_closes_a_silent_loser() {
        let (conn, probe) = mock_connection(TransportKind::Stream, Some("11:22:33:44:55:66"));
        let responder =
            RejectionResponder::spawn(conn, 0xD3, Duration::from_secs(5));

        tokio::time::sleep(Duration::from_secs(6)).await;

        assert_eq!(probe.reject_code(), Some(0xD3));
        assert!(responder.is_closed());
        assert!(responder.is_finished());
        assert_eq!(probe.close_count(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn explicit_shutdown_preempts_the_timer() {
        let (conn, probe) = mock_connection(TransportKind::Packet, Some("11:22:33:44:55:66"));
        let responder =
            RejectionResponder::spawn(conn, 0xD3, Duration::from_secs(5));

        // let the task send the status and park on the timer
        tokio::time::sleep(Duration::from_millis(10)).await;
        responder.shutdown().await;

        assert!(responder.is_closed());
        assert_eq!(probe.close_count(), 1);

        // well past the original deadline: still exactly one close
        tokio::time::sleep(Duration::from_secs(10)).await;
        assert!(responder.is_finished());
        assert_eq!(probe.close_count(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn double_shutdown_is_a_noop() {
        let (conn, probe) = mock_connection(TransportKind::Stream, Some("11:22:33:44:55:66"));
        let responder =
            RejectionResponder::spawn(conn, 0xD3, Duration::from_secs(5));

        responder.shutdown().await;
        responder.shutdown().await;

        assert!(responder.is_closed());
        assert_eq!(probe.close_count(), 1);
    }
}
