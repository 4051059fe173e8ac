//! Connection lifecycle state machine
//!
//! [`Session`] holds the lifecycle state and per-connection counters and
//! decides every transition. It performs no I/O: the driver feeds it what
//! happened on the wire and publishes whatever it returns.
//!
//! ```text
//! Disconnected --connect--> Connecting --transport up--> Handshaking
//! Handshaking --ack accepted--> Active
//! Handshaking --ack rejected--> Failed
//! Connecting | Handshaking --attempt failed--> Reconnecting | Failed
//! Active --connection lost--> Reconnecting --delay elapsed--> Connecting
//! any --close--> Disconnected
//! ```

use std::time::{Duration, Instant};

use thiserror::Error;

use stage_core::{Capabilities, ConnectionState, Endpoint};
use stage_protocol::StateDelta;

use ConnectionState::*;

/// A state change, as published to lifecycle subscribers
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Transition {
    /// State before
    pub from: ConnectionState,
    /// State after
    pub to: ConnectionState,
}

/// The requested operation is not valid in the current state
#[derive(Debug, Error, PartialEq, Eq)]
#[error("cannot {action} while {state}")]
pub struct InvalidTransition {
    /// Operation that was attempted
    pub action: &'static str,
    /// State at the time
    pub state: ConnectionState,
}

/// Inbound delta whose sequence does not follow the previous one
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SequenceGap {
    /// Sequence that was due
    pub expected: u64,
    /// Sequence that arrived
    pub received: u64,
}

/// Lifecycle and counters of one logical connection
#[derive(Debug)]
pub struct Session {
    endpoint: Endpoint,
    state: ConnectionState,
    capabilities: Option<Capabilities>,
    /// Reconnect attempts since the session was last active
    attempt: u32,
    max_attempts: Option<u32>,
    /// Times the session has reached `Active`
    activations: u32,
    next_outbound: u64,
    last_inbound: Option<u64>,
    last_activity: Instant,
}

impl Session {
    /// New session in `Disconnected`. `max_attempts` of `None` retries
    /// forever.
    pub fn new(endpoint: Endpoint, max_attempts: Option<u32>) -> Self {
        Self {
            endpoint,
            state: Disconnected,
            capabilities: None,
            attempt: 0,
            max_attempts,
            activations: 0,
            next_outbound: 0,
            last_inbound: None,
            last_activity: Instant::now(),
        }
    }

    /// Session continuing from the terminal state a previous one ended in,
    /// so a restart after `Failed` is reported as `Failed -> Connecting`
    pub fn resume(endpoint: Endpoint, max_attempts: Option<u32>, state: ConnectionState) -> Self {
        let mut session = Self::new(endpoint, max_attempts);
        if state.is_terminal() {
            session.state = state;
        }
        session
    }

    pub fn endpoint(&self) -> &Endpoint {
        &self.endpoint
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    /// Capabilities of the current connection, once active
    pub fn capabilities(&self) -> Option<Capabilities> {
        self.capabilities
    }

    /// Reconnect attempt number; 0 is the initial connection
    pub fn attempt(&self) -> u32 {
        self.attempt
    }

    /// Whether the session was active at least once before the current
    /// connection
    pub fn has_been_active(&self) -> bool {
        self.activations > 0
    }

    fn transition(
        &mut self,
        action: &'static str,
        allowed: &[ConnectionState],
        to: ConnectionState,
    ) -> Result<Transition, InvalidTransition> {
        if !allowed.contains(&self.state) {
            return Err(InvalidTransition {
                action,
                state: self.state,
            });
        }
        let from = std::mem::replace(&mut self.state, to);
        tracing::debug!("Session {}: {} -> {}", self.endpoint, from, to);
        Ok(Transition { from, to })
    }

    /// Start connecting. Allowed from `Disconnected`, and from `Failed` as an
    /// explicit restart.
    pub fn connect(&mut self) -> Result<Transition, InvalidTransition> {
        let transition = self.transition("connect", &[Disconnected, Failed], Connecting)?;
        self.attempt = 0;
        Ok(transition)
    }

    /// The secure channel is up; the hello is about to be sent
    pub fn transport_established(&mut self) -> Result<Transition, InvalidTransition> {
        self.transition("start handshake", &[Connecting], Handshaking)
    }

    /// The server accepted the hello. Resets the attempt counter and both
    /// sequence counters.
    pub fn handshake_accepted(
        &mut self,
        capabilities: Capabilities,
    ) -> Result<Transition, InvalidTransition> {
        let transition = self.transition("activate", &[Handshaking], Active)?;
        self.capabilities = Some(capabilities);
        self.attempt = 0;
        self.activations += 1;
        self.next_outbound = 0;
        self.last_inbound = None;
        self.touch();
        Ok(transition)
    }

    /// The server rejected the hello. Rejections are not retried.
    pub fn handshake_rejected(&mut self) -> Result<Transition, InvalidTransition> {
        self.transition("reject", &[Handshaking], Failed)
    }

    /// An active connection broke. Going to `Reconnecting` does not count as
    /// an attempt.
    pub fn connection_lost(&mut self) -> Result<Transition, InvalidTransition> {
        let transition = self.transition("drop connection", &[Active], Reconnecting)?;
        self.capabilities = None;
        Ok(transition)
    }

    /// A connection attempt failed before reaching `Active`. Moves to
    /// `Failed` once the attempt budget is spent, else to `Reconnecting`.
    pub fn attempt_failed(&mut self) -> Result<Transition, InvalidTransition> {
        let exhausted = self
            .max_attempts
            .is_some_and(|max| self.attempt >= max);
        let to = if exhausted { Failed } else { Reconnecting };
        self.transition("fail attempt", &[Connecting, Handshaking], to)
    }

    /// The backoff delay elapsed; start the next attempt
    pub fn begin_reconnect(&mut self) -> Result<Transition, InvalidTransition> {
        let transition = self.transition("reconnect", &[Reconnecting], Connecting)?;
        self.attempt = self.attempt.saturating_add(1);
        Ok(transition)
    }

    /// Caller-requested shutdown, valid from any state
    pub fn close(&mut self) -> Transition {
        let from = std::mem::replace(&mut self.state, Disconnected);
        self.capabilities = None;
        Transition {
            from,
            to: Disconnected,
        }
    }

    /// Assign the next outbound sequence to `delta`. The first delta of a
    /// connection is the baseline. The counter only advances on
    /// [`Session::commit_outbound`], so a delta that fails to encode does
    /// not leave a gap.
    pub fn stamp_outbound(&self, delta: &mut StateDelta) {
        delta.sequence = self.next_outbound;
        delta.baseline = self.next_outbound == 0;
    }

    /// The stamped delta went out
    pub fn commit_outbound(&mut self) {
        self.next_outbound += 1;
    }

    /// Record an inbound delta. The first one after (re)connecting is marked
    /// as baseline regardless of its sequence. A non-consecutive sequence on
    /// a non-baseline delta is reported as a gap.
    pub fn accept_inbound(&mut self, delta: &mut StateDelta) -> Option<SequenceGap> {
        let gap = match self.last_inbound {
            None => {
                delta.baseline = true;
                None
            }
            Some(last) => {
                let expected = last.wrapping_add(1);
                (!delta.baseline && delta.sequence != expected).then_some(SequenceGap {
                    expected,
                    received: delta.sequence,
                })
            }
        };
        self.last_inbound = Some(delta.sequence);
        gap
    }

    /// Note inbound traffic for idle detection
    pub fn touch(&mut self) {
        self.last_activity = Instant::now();
    }

    /// Time since the last inbound traffic
    pub fn idle_for(&self) -> Duration {
        self.last_activity.elapsed()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn session(max_attempts: Option<u32>) -> Session {
        Session::new(Endpoint::new("localhost", 4443), max_attempts)
    }

    fn caps() -> Capabilities {
        Capabilities {
            protocol_version: 1,
            compression: true,
        }
    }

    fn activate(session: &mut Session) {
        session.connect().unwrap();
        session.transport_established().unwrap();
        session.handshake_accepted(caps()).unwrap();
    }

    #[test]
    fn test_happy_path() {
        let mut session = session(None);
        assert_eq!(session.state(), Disconnected);

        let t = session.connect().unwrap();
        assert_eq!(t, Transition { from: Disconnected, to: Connecting });
        session.transport_established().unwrap();
        assert_eq!(session.state(), Handshaking);
        assert!(!session.has_been_active());

        session.handshake_accepted(caps()).unwrap();
        assert_eq!(session.state(), Active);
        assert_eq!(session.capabilities(), Some(caps()));
        assert!(session.has_been_active());
    }

    #[test]
    fn test_invalid_transitions() {
        let mut session = session(None);
        assert_eq!(
            session.handshake_accepted(caps()),
            Err(InvalidTransition { action: "activate", state: Disconnected })
        );
        assert!(session.connection_lost().is_err());
        assert!(session.begin_reconnect().is_err());

        activate(&mut session);
        assert!(session.connect().is_err());
        assert!(session.attempt_failed().is_err());
    }

    #[test]
    fn test_rejection_fails_without_retry() {
        let mut session = session(Some(5));
        session.connect().unwrap();
        session.transport_established().unwrap();

        let t = session.handshake_rejected().unwrap();
        assert_eq!(t.to, Failed);
        assert!(session.begin_reconnect().is_err());
    }

    #[test]
    fn test_exhausting_attempts_reaches_failed() {
        let max = 3;
        let mut session = session(Some(max));
        activate(&mut session);

        let t = session.connection_lost().unwrap();
        assert_eq!(t, Transition { from: Active, to: Reconnecting });
        assert_eq!(session.attempt(), 0);

        for attempt in 1..=max {
            session.begin_reconnect().unwrap();
            assert_eq!(session.attempt(), attempt);
            let t = session.attempt_failed().unwrap();
            if attempt < max {
                assert_eq!(t.to, Reconnecting);
            } else {
                assert_eq!(t.to, Failed);
            }
        }
        assert_eq!(session.state(), Failed);
    }

    #[test]
    fn test_handshake_failure_counts_as_attempt() {
        let mut session = session(Some(1));
        activate(&mut session);
        session.connection_lost().unwrap();

        session.begin_reconnect().unwrap();
        session.transport_established().unwrap();
        assert_eq!(session.attempt_failed().unwrap().to, Failed);
    }

    #[test]
    fn test_zero_attempts_fails_initial_connect() {
        let mut session = session(Some(0));
        session.connect().unwrap();
        assert_eq!(session.attempt_failed().unwrap().to, Failed);
    }

    #[test]
    fn test_initial_failure_retries_when_unbounded() {
        let mut session = session(None);
        session.connect().unwrap();
        for _ in 0..100 {
            assert_eq!(session.attempt_failed().unwrap().to, Reconnecting);
            session.begin_reconnect().unwrap();
        }
    }

    #[test]
    fn test_attempt_counter_saturates() {
        let mut session = session(None);
        session.connect().unwrap();
        session.attempt_failed().unwrap();
        session.attempt = u32::MAX;

        session.begin_reconnect().unwrap();
        assert_eq!(session.attempt(), u32::MAX);
        assert_eq!(session.attempt_failed().unwrap().to, Reconnecting);
    }

    #[test]
    fn test_success_resets_attempts() {
        let mut session = session(Some(2));
        activate(&mut session);
        session.connection_lost().unwrap();
        session.begin_reconnect().unwrap();
        session.attempt_failed().unwrap();
        session.begin_reconnect().unwrap();
        session.transport_established().unwrap();
        session.handshake_accepted(caps()).unwrap();
        assert_eq!(session.attempt(), 0);
    }

    #[test]
    fn test_restart_from_failed() {
        let mut session = session(Some(0));
        session.connect().unwrap();
        session.attempt_failed().unwrap();
        assert_eq!(session.state(), Failed);

        let t = session.connect().unwrap();
        assert_eq!(t, Transition { from: Failed, to: Connecting });
    }

    #[test]
    fn test_resume() {
        let endpoint = Endpoint::new("localhost", 4443);
        let mut session = Session::resume(endpoint.clone(), None, Failed);
        assert_eq!(session.connect().unwrap().from, Failed);

        let session = Session::resume(endpoint, None, Active);
        assert_eq!(session.state(), Disconnected);
    }

    #[test]
    fn test_close_from_any_state() {
        let preparations: [fn(&mut Session); 4] = [
            |_| {},
            |s| {
                s.connect().unwrap();
            },
            activate,
            |s| {
                activate(s);
                s.connection_lost().unwrap();
            },
        ];
        for prepare in preparations {
            let mut session = session(None);
            prepare(&mut session);
            assert_eq!(session.close().to, Disconnected);
            assert_eq!(session.state(), Disconnected);
            assert_eq!(session.capabilities(), None);
        }
    }

    #[test]
    fn test_outbound_sequence_resets_on_reconnect() {
        let mut session = session(None);
        activate(&mut session);

        let mut stamped = Vec::new();
        for _ in 0..3 {
            let mut delta = StateDelta::new("stage", &b"x"[..]);
            session.stamp_outbound(&mut delta);
            session.commit_outbound();
            stamped.push((delta.sequence, delta.baseline));
        }
        assert_eq!(stamped, vec![(0, true), (1, false), (2, false)]);

        session.connection_lost().unwrap();
        session.begin_reconnect().unwrap();
        session.transport_established().unwrap();
        session.handshake_accepted(caps()).unwrap();

        let mut delta = StateDelta::new("stage", &b"y"[..]);
        session.stamp_outbound(&mut delta);
        assert_eq!((delta.sequence, delta.baseline), (0, true));
    }

    #[test]
    fn test_uncommitted_stamp_is_reused() {
        let mut session = session(None);
        activate(&mut session);

        let mut first = StateDelta::new("stage", &b"too big"[..]);
        session.stamp_outbound(&mut first);
        let mut second = StateDelta::new("stage", &b"ok"[..]);
        session.stamp_outbound(&mut second);
        assert_eq!(first.sequence, second.sequence);
    }

    #[test]
    fn test_inbound_baseline_and_gaps() {
        let mut session = session(None);
        activate(&mut session);

        let mut first = StateDelta {
            sequence: 5,
            ..StateDelta::new("stage", &b"a"[..])
        };
        assert_eq!(session.accept_inbound(&mut first), None);
        assert!(first.baseline);

        let mut next = StateDelta {
            sequence: 6,
            ..StateDelta::new("stage", &b"b"[..])
        };
        assert_eq!(session.accept_inbound(&mut next), None);
        assert!(!next.baseline);

        let mut skipped = StateDelta {
            sequence: 9,
            ..StateDelta::new("stage", &b"c"[..])
        };
        assert_eq!(
            session.accept_inbound(&mut skipped),
            Some(SequenceGap { expected: 7, received: 9 })
        );

        let mut resync = StateDelta {
            sequence: 0,
            baseline: true,
            ..StateDelta::new("stage", &b"d"[..])
        };
        assert_eq!(session.accept_inbound(&mut resync), None);
    }

    #[test]
    fn test_inbound_baseline_after_reconnect() {
        let mut session = session(None);
        activate(&mut session);
        let mut delta = StateDelta::new("stage", &b"a"[..]);
        session.accept_inbound(&mut delta);

        session.connection_lost().unwrap();
        session.begin_reconnect().unwrap();
        session.transport_established().unwrap();
        session.handshake_accepted(caps()).unwrap();

        let mut delta = StateDelta {
            sequence: 40,
            ..StateDelta::new("stage", &b"b"[..])
        };
        assert_eq!(session.accept_inbound(&mut delta), None);
        assert!(delta.baseline);
    }
}
