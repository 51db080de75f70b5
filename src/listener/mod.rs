//! Accept loops, arbitration and rejection handling.
//!
//! One [`TransportListener`] per channel feeds the shared
//! [`ConnectionArbiter`]; losers are answered by a detached
//! [`RejectionResponder`].

mod acceptor;
mod arbiter;
mod responder;

pub(crate) use acceptor::TransportListener;
pub use arbiter::{ConnectionArbiter, ConnectionValidator, Verdict};
pub use responder::RejectionResponder;
