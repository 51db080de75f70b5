//! Listener group lifecycle: socket allocation with retry, the pair of
//! accept loops, and group-wide shutdown.

use std::fmt;
use std::io;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use thiserror::Error;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::sleep;
use tracing::{debug, error, info, warn};

use crate::config::GroupConfig;
use crate::listener::{ConnectionArbiter, ConnectionValidator, TransportListener};
use crate::transport::{RadioState, ServerSocket, SocketFactory, TransportKind};

/// Lifecycle state of a listener group.
///
/// Terminal states stay terminal; a fresh group must be created for a new
/// listening lifetime.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GroupState {
    Creating,
    Listening,
    ShuttingDown,
    Terminated,
}

/// Errors from group creation.
#[derive(Debug, Error)]
pub enum GroupError {
    /// Socket allocation kept failing; the service is unavailable for now
    /// and the caller should retry later.
    #[error("listening sockets unavailable after {attempts} attempts")]
    Unavailable { attempts: u32 },

    /// The radio is off or going down; retrying cannot help.
    #[error("radio is {state:?}, not allocating listening sockets")]
    RadioOff { state: RadioState },
}

/// State shared between the group handle, the arbiter and both listeners.
pub(crate) struct GroupShared {
    state: watch::Sender<GroupState>,
    stop: watch::Sender<bool>,
    sockets: Vec<Arc<dyn ServerSocket>>,
    live_listeners: AtomicUsize,
}

impl GroupShared {
    pub(crate) fn new(sockets: Vec<Arc<dyn ServerSocket>>) -> Arc<Self> {
        let (state, _) = watch::channel(GroupState::Creating);
        let (stop, _) = watch::channel(false);
        Arc::new(Self {
            state,
            stop,
            sockets,
            live_listeners: AtomicUsize::new(0),
        })
    }

    pub(crate) fn state(&self) -> GroupState {
        *self.state.borrow()
    }

    pub(crate) fn subscribe_stop(&self) -> watch::Receiver<bool> {
        self.stop.subscribe()
    }

    pub(crate) fn stop_requested(&self) -> bool {
        *self.stop.borrow()
    }

    /// Ask both listeners to stop. Closing the listening sockets is what
    /// actually unblocks a pending accept; the watch signal covers a
    /// listener between accepts. Idempotent.
    pub(crate) fn request_stop(&self) {
        if self.stop.send_replace(true) {
            return;
        }
        for socket in &self.sockets {
            socket.close();
        }
        if self.state() == GroupState::Listening {
            self.state.send_replace(GroupState::ShuttingDown);
        }
    }

    fn mark_listening(&self) {
        self.state.send_replace(GroupState::Listening);
    }

    fn listener_started(&self) {
        self.live_listeners.fetch_add(1, Ordering::SeqCst);
    }

    /// Called by each accept loop as it exits; the last one out marks the
    /// group terminated.
    pub(crate) fn listener_exited(&self) {
        if self.live_listeners.fetch_sub(1, Ordering::SeqCst) == 1 {
            self.state.send_replace(GroupState::Terminated);
        }
    }
}

/// Handle to the pair of transport listeners.
///
/// The only component the owning service touches directly: it creates the
/// group, advertises the channel numbers, resets rounds and shuts the group
/// down.
pub struct ListenerGroup {
    shared: Arc<GroupShared>,
    arbiter: Arc<ConnectionArbiter>,
    stream_channel: u16,
    packet_channel: u16,
    handles: tokio::sync::Mutex<Vec<JoinHandle<()>>>,
}

impl ListenerGroup {
    /// Allocate both listening sockets and start the accept loops.
    ///
    /// Allocation is retried with a short fixed backoff while the radio is
    /// on or still turning on, since sockets routinely fail to bind during a
    /// radio toggle. Retrying stops immediately once the radio is off or
    /// going down.
    pub async fn create(
        factory: Arc<dyn SocketFactory>,
        validator: Arc<dyn ConnectionValidator>,
        config: &GroupConfig,
    ) -> Result<Arc<Self>, GroupError> {
        let sockets = bind_sockets(factory.as_ref(), config).await?;
        let stream_channel = sockets[0].channel();
        let packet_channel = sockets[1].channel();

        let shared = GroupShared::new(sockets.clone());
        let arbiter = Arc::new(ConnectionArbiter::new(validator, shared.clone()));

        let mut handles = Vec::with_capacity(sockets.len());
        for socket in sockets {
            shared.listener_started();
            handles.push(TransportListener::spawn(
                socket,
                arbiter.clone(),
                shared.clone(),
                config.reject_code,
                config.reject_timeout,
            ));
        }

        shared.mark_listening();
        info!(stream_channel, packet_channel, "listener group started");

        Ok(Arc::new(Self {
            shared,
            arbiter,
            stream_channel,
            packet_channel,
            handles: tokio::sync::Mutex::new(handles),
        }))
    }

    /// System-assigned channel number of the stream transport, stable for
    /// the group lifetime.
    pub fn stream_channel(&self) -> u16 {
        self.stream_channel
    }

    /// System-assigned channel number of the packet transport.
    pub fn packet_channel(&self) -> u16 {
        self.packet_channel
    }

    pub fn state(&self) -> GroupState {
        self.shared.state()
    }

    /// Allow the next round to accept exactly one new connection again.
    pub fn prepare_for_new_connection(&self) {
        self.arbiter.prepare_for_new_connection();
    }

    /// Stop both listeners. With `block`, wait for both accept loops to
    /// exit before returning. Idempotent either way.
    pub async fn shutdown(&self, block: bool) {
        self.shared.request_stop();
        if !block {
            return;
        }

        let handles: Vec<_> = self.handles.lock().await.drain(..).collect();
        for handle in handles {
            if let Err(e) = handle.await {
                warn!(error = %e, "listener task join failed");
            }
        }
    }
}

impl fmt::Debug for ListenerGroup {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ListenerGroup")
            .field("stream_channel", &self.stream_channel)
            .field("packet_channel", &self.packet_channel)
            .field("state", &self.state())
            .finish()
    }
}

async fn bind_sockets(
    factory: &dyn SocketFactory,
    config: &GroupConfig,
) -> Result<Vec<Arc<dyn ServerSocket>>, GroupError> {
    let mut attempts = 0;
    loop {
        attempts += 1;
        match bind_pair(factory).await {
            Ok(pair) => return Ok(pair),
            Err(e) => {
                let state = factory.radio_state();
                if !state.allows_retry() {
                    warn!(?state, "radio is not coming up, abandoning socket allocation");
                    return Err(GroupError::RadioOff { state });
                }
                if attempts >= config.create_retries {
                    error!(attempts, error = %e, "could not allocate listening sockets");
                    return Err(GroupError::Unavailable { attempts });
                }
                debug!(
                    attempt = attempts,
                    error = %e,
                    backoff = ?config.create_backoff,
                    "socket allocation failed, retrying"
                );
                sleep(config.create_backoff).await;
            }
        }
    }
}

async fn bind_pair(factory: &dyn SocketFactory) -> io::Result<Vec<Arc<dyn ServerSocket>>> {
    let stream = factory.bind(TransportKind::Stream).await?;
    match factory.bind(TransportKind::Packet).await {
        Ok(packet) => Ok(vec![stream, packet]),
        Err(e) => {
            // no leaking half an allocated pair into the next attempt
            stream.close();
            Err(e)
        }
    }
}
