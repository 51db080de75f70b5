//! Accept loop for one transport channel.

use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::group::GroupShared;
use crate::transport::{IncomingConnection, ServerSocket};

use super::arbiter::{ConnectionArbiter, Verdict};
use super::responder::RejectionResponder;

/// One accept loop bound to one listening socket.
///
/// Runs as a dedicated task for the lifetime of the group. The loop keeps
/// accepting after a round has been won so the other channel's peers still
/// get a proper rejection instead of a dangling connect.
pub(crate) struct TransportListener {
    socket: Arc<dyn ServerSocket>,
    arbiter: Arc<ConnectionArbiter>,
    shared: Arc<GroupShared>,
    reject_code: u8,
    reject_timeout: Duration,
}

impl TransportListener {
    pub(crate) fn spawn(
        socket: Arc<dyn ServerSocket>,
        arbiter: Arc<ConnectionArbiter>,
        shared: Arc<GroupShared>,
        reject_code: u8,
        reject_timeout: Duration,
    ) -> JoinHandle<()> {
        let listener = Self {
            socket,
            arbiter,
            shared,
            reject_code,
            reject_timeout,
        };
        tokio::spawn(listener.run())
    }

    async fn run(self) {
        let kind = self.socket.kind();
        info!(
            listener = %kind,
            channel = self.socket.channel(),
            "transport listener started"
        );

        let mut stop = self.shared.subscribe_stop();

        loop {
            if self.shared.stop_requested() {
                break;
            }

            tokio::select! {
                biased;

                _ = stop.changed() => {
                    debug!(listener = %kind, "stop requested");
                    break;
                }

                res = self.socket.accept() => match res {
                    Ok(conn) => self.handle_accept(conn).await,
                    Err(e) => {
                        if self.shared.stop_requested() {
                            debug!(listener = %kind, "accept unblocked by shutdown");
                        } else {
                            error!(listener = %kind, error = %e, "accept failed");
                            self.arbiter.on_accept_failed();
                        }
                        break;
                    }
                }
            }
        }

        self.shared.listener_exited();
        info!(listener = %kind, "transport listener stopped");
    }

    async fn handle_accept(&self, conn: IncomingConnection) {
        let kind = self.socket.kind();

        // a connection whose peer cannot be identified is dropped, not fatal
        let Some(endpoint) = conn.endpoint().cloned() else {
            warn!(listener = %kind, "accepted connection without remote identity, dropping");
            conn.close().await;
            return;
        };

        debug!(listener = %kind, %endpoint, "incoming connection");

        match self.arbiter.on_connect(&endpoint, conn) {
            Verdict::Accepted => {
                // winner handed to the validator; keep accepting so peers on
                // either channel still get answered
            }
            Verdict::Rejected(conn) => {
                debug!(listener = %kind, %endpoint, "spawning rejection responder");
                // fire and forget; the responder tears the socket down itself
                let _ = RejectionResponder::spawn(conn, self.reject_code, self.reject_timeout);
            }
        }
    }
}
