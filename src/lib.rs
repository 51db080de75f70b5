//! obexd - dual-transport OBEX connection listener and arbitration service.
//!
//! The same logical OBEX service is reachable over two parallel transport
//! channels (a byte-stream channel and a packet channel). This crate owns the
//! server side of that arrangement: it keeps one accept loop per transport,
//! guarantees that at most one incoming connection is accepted per round, and
//! answers every competing connection with a rejection status before tearing
//! its socket down.
//!
//! The higher-level profile service plugs in through [`ConnectionValidator`]
//! and owns the winning connection; everything else (losers, malformed
//! connections, transport failures) is handled here.

pub mod config;
pub mod group;
pub mod listener;
pub mod telemetry;
pub mod transport;

pub use config::{Config, GroupConfig};
pub use group::{GroupError, GroupState, ListenerGroup};
pub use listener::{ConnectionArbiter, ConnectionValidator, RejectionResponder, Verdict};
pub use transport::{
    EndpointId, IncomingConnection, LoopbackFactory, RadioState, RawChannel, ServerSocket,
    SocketFactory, TransportKind,
};
