//! Single-winner arbitration across the two transport listeners.

use std::sync::{Arc, Mutex};

use tracing::{debug, info, warn};

use crate::group::GroupShared;
use crate::transport::{EndpointId, IncomingConnection};

/// Outcome of a connection decision.
///
/// Ownership of the connection moves exactly once: into the validator on
/// accept, or back to the caller for rejection handling.
pub enum Verdict {
    /// The connection won; the validator took ownership.
    Accepted,
    /// The connection lost; ownership is handed back.
    Rejected(IncomingConnection),
}

impl Verdict {
    pub fn is_accepted(&self) -> bool {
        matches!(self, Verdict::Accepted)
    }
}

/// Callbacks implemented by the owning profile service.
pub trait ConnectionValidator: Send + Sync {
    /// Decide whether to accept `conn` from `endpoint`.
    ///
    /// Runs under the arbitration lock, so it must return quickly and must
    /// not re-enter the arbiter.
    fn on_connect(&self, endpoint: &EndpointId, conn: IncomingConnection) -> Verdict;

    /// A transport listener failed irrecoverably. The group is going down;
    /// the implementor should discard it and create a replacement.
    fn on_accept_failed(&self);
}

/// Round state guarded by the arbitration lock.
#[derive(Default)]
struct RoundState {
    /// Whether the current round has already been won.
    accepted: bool,
    /// Whether a listener failure has already been escalated.
    failed: bool,
}

/// Serializes accept decisions so at most one connection per round wins.
pub struct ConnectionArbiter {
    state: Mutex<RoundState>,
    validator: Arc<dyn ConnectionValidator>,
    shared: Arc<GroupShared>,
}

impl ConnectionArbiter {
    pub(crate) fn new(validator: Arc<dyn ConnectionValidator>, shared: Arc<GroupShared>) -> Self {
        Self {
            state: Mutex::new(RoundState::default()),
            validator,
            shared,
        }
    }

    /// Run the single-winner decision for one incoming connection.
    ///
    /// The won-flag check and the validator call happen under one lock, so
    /// validations from the two listeners are totally ordered and the flag
    /// cannot be raced between them.
    pub fn on_connect(&self, endpoint: &EndpointId, conn: IncomingConnection) -> Verdict {
        let mut state = self.state.lock().unwrap();

        if state.accepted {
            debug!(%endpoint, "round already won, rejecting without validation");
            return Verdict::Rejected(conn);
        }

        match self.validator.on_connect(endpoint, conn) {
            Verdict::Accepted => {
                state.accepted = true;
                info!(%endpoint, "connection accepted");
                Verdict::Accepted
            }
            rejected => {
                debug!(%endpoint, "connection rejected by validator");
                rejected
            }
        }
    }

    /// Escalate an irrecoverable accept failure and stop the whole group.
    ///
    /// Runs under the arbitration lock, so escalation never overlaps an
    /// in-flight validation, and only the first failing listener reaches
    /// the validator; both listeners failing at once still escalate once.
    pub fn on_accept_failed(&self) {
        let mut state = self.state.lock().unwrap();
        if state.failed {
            debug!("listener failure already escalated, ignoring");
            return;
        }
        state.failed = true;

        warn!("transport accept failed, stopping listener group");
        self.validator.on_accept_failed();
        self.shared.request_stop();
    }

    /// Clear the won flag so the next round can accept one connection again.
    pub fn prepare_for_new_connection(&self) {
        let mut state = self.state.lock().unwrap();
        state.accepted = false;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::group::GroupShared;
    use crate::transport::mock::{mock_connection, MockServerSocket};
    use crate::transport::TransportKind;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct CountingValidator {
        accept: bool,
        connects: AtomicUsize,
        failures: AtomicUsize,
    }

    impl CountingValidator {
        fn new(accept: bool) -> Arc<Self> {
            Arc::new(Self {
                accept,
                connects: AtomicUsize::new(0),
                failures: AtomicUsize::new(0),
            })
        }
    }

    impl ConnectionValidator for CountingValidator {
        fn on_connect(&self, _endpoint: &EndpointId, conn: IncomingConnection) -> Verdict {
            self.connects.fetch_add(1, Ordering::SeqCst);
            if self.accept {
                Verdict::Accepted
            } else {
                Verdict::Rejected(conn)
            }
        }

        fn on_accept_failed(&self) {
            self.failures.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn test_shared() -> Arc<GroupShared> {
        GroupShared::new(vec![
            Arc::new(MockServerSocket::new(TransportKind::Stream, 1)),
            Arc::new(MockServerSocket::new(TransportKind::Packet, 2)),
        ])
    }

    fn connect(arbiter: &ConnectionArbiter, id: &str) -> Verdict {
        let (conn, _probe) = mock_connection(TransportKind::Stream, Some(id));
        arbiter.on_connect(&EndpointId::new(id), conn)
    }

    #[test]
    fn at_most_one_winner_under_contention() {
        let validator = CountingValidator::new(true);
        let arbiter = Arc::new(ConnectionArbiter::new(validator.clone(), test_shared()));

        let wins = AtomicUsize::new(0);
        std::thread::scope(|scope| {
            for i in 0..16 {
                let arbiter = arbiter.clone();
                let wins = &wins;
                scope.spawn(move || {
                    let id = format!("00:00:00:00:00:{i:02X}");
                    if connect(&arbiter, &id).is_accepted() {
                        wins.fetch_add(1, Ordering::SeqCst);
                    }
                });
            }
        });

        assert_eq!(wins.load(Ordering::SeqCst), 1);
        // the winner reached the validator; later arrivals may or may not have
        assert!(validator.connects.load(Ordering::SeqCst) >= 1);
    }

    #[test]
    fn won_round_skips_the_validator() {
        let validator = CountingValidator::new(true);
        let arbiter = ConnectionArbiter::new(validator.clone(), test_shared());

        assert!(connect(&arbiter, "AA:BB:CC:DD:EE:FF").is_accepted());
        assert!(!connect(&arbiter, "11:22:33:44:55:66").is_accepted());
        assert_eq!(validator.connects.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn prepare_for_new_connection_resets_the_round() {
        let validator = CountingValidator::new(true);
        let arbiter = ConnectionArbiter::new(validator, test_shared());

        assert!(connect(&arbiter, "AA:BB:CC:DD:EE:FF").is_accepted());
        arbiter.prepare_for_new_connection();
        assert!(connect(&arbiter, "11:22:33:44:55:66").is_accepted());
    }

    #[test]
    fn validator_rejection_does_not_win_the_round() {
        let validator = CountingValidator::new(false);
        let arbiter = ConnectionArbiter::new(validator.clone(), test_shared());

        assert!(!connect(&arbiter, "AA:BB:CC:DD:EE:FF").is_accepted());
        // round still open, validator consulted again
        assert!(!connect(&arbiter, "AA:BB:CC:DD:EE:FF").is_accepted());
        assert_eq!(validator.connects.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn accept_failure_notifies_validator_and_stops_group() {
        let validator = CountingValidator::new(true);
        let shared = test_shared();
        let arbiter = ConnectionArbiter::new(validator.clone(), shared.clone());

        arbiter.on_accept_failed();

        assert_eq!(validator.failures.load(Ordering::SeqCst), 1);
        assert!(shared.stop_requested());
    }

    #[test]
    fn accept_failure_escalates_once_per_group() {
        let validator = CountingValidator::new(true);
        let arbiter = ConnectionArbiter::new(validator.clone(), test_shared());

        // both listeners failing at once still reach the validator only once
        arbiter.on_accept_failed();
        arbiter.on_accept_failed();

        assert_eq!(validator.failures.load(Ordering::SeqCst), 1);
    }

    struct SlowValidator {
        in_connect: std::sync::atomic::AtomicBool,
        overlapped: std::sync::atomic::AtomicBool,
        failures: AtomicUsize,
    }

    impl ConnectionValidator for SlowValidator {
        fn on_connect(&self, _endpoint: &EndpointId, _conn: IncomingConnection) -> Verdict {
            self.in_connect.store(true, Ordering::SeqCst);
            std::thread::sleep(std::time::Duration::from_millis(200));
            self.in_connect.store(false, Ordering::SeqCst);
            Verdict::Accepted
        }

        fn on_accept_failed(&self) {
            if self.in_connect.load(Ordering::SeqCst) {
                self.overlapped.store(true, Ordering::SeqCst);
            }
            self.failures.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[test]
    fn accept_failure_waits_for_in_flight_validation() {
        let validator = Arc::new(SlowValidator {
            in_connect: std::sync::atomic::AtomicBool::new(false),
            overlapped: std::sync::atomic::AtomicBool::new(false),
            failures: AtomicUsize::new(0),
        });
        let arbiter = Arc::new(ConnectionArbiter::new(validator.clone(), test_shared()));

        std::thread::scope(|scope| {
            let worker = arbiter.clone();
            scope.spawn(move || {
                connect(&worker, "AA:BB:CC:DD:EE:FF");
            });

            // escalate from another thread while the validation is mid-flight
            std::thread::sleep(std::time::Duration::from_millis(50));
            arbiter.on_accept_failed();
        });

        assert!(!validator.overlapped.load(Ordering::SeqCst));
        assert_eq!(validator.failures.load(Ordering::SeqCst), 1);
    }
}
