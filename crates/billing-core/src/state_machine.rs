use std::time::Duration;

use crate::{
    error::BillingError,
    retry::RetryPolicy,
    types::{BillingEvent, ConnectionState},
};

/// What the caller of [`ConnectionStateMachine::begin_connect`] must do next.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectDecision {
    /// Issue the backend handshake.
    StartHandshake,
    /// A handshake is already in flight; wait for it.
    AwaitInFlight,
    /// Already connected; resolve the caller immediately.
    AlreadyConnected,
}

/// Outcome of a lost connection or failed handshake.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReconnectDecision {
    /// Reconnect after `delay`.
    Retry { attempt: u32, delay: Duration },
    /// Attempts are exhausted; stay down.
    GiveUp { attempts: u32 },
    /// Nothing to do: the connection was not up or is already dormant.
    Ignored,
}

/// Result of a finished backend handshake.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SetupOutcome {
    Connected,
    Lost(ReconnectDecision),
}

#[derive(Debug, Clone)]
pub struct ConnectionStateMachine {
    state: ConnectionState,
    attempt_count: u32,
    policy: RetryPolicy,
}

impl Default for ConnectionStateMachine {
    fn default() -> Self {
        Self::new(RetryPolicy::default())
    }
}

impl ConnectionStateMachine {
    pub fn new(policy: RetryPolicy) -> Self {
        Self {
            state: ConnectionState::Disconnected,
            attempt_count: 0,
            policy,
        }
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    pub fn attempt_count(&self) -> u32 {
        self.attempt_count
    }

    pub fn policy(&self) -> RetryPolicy {
        self.policy
    }

    /// Start or join a connection attempt.
    ///
    /// An explicit connect from `Failed` starts a fresh retry budget; a
    /// scheduled reconnect from `Disconnected` keeps the current count.
    pub fn begin_connect(&mut self) -> (ConnectDecision, Vec<BillingEvent>) {
        match self.state {
            ConnectionState::Connecting => (ConnectDecision::AwaitInFlight, Vec::new()),
            ConnectionState::Connected => (ConnectDecision::AlreadyConnected, Vec::new()),
            ConnectionState::Failed => {
                self.attempt_count = 0;
                (
                    ConnectDecision::StartHandshake,
                    self.transition(ConnectionState::Connecting),
                )
            }
            ConnectionState::Disconnected => (
                ConnectDecision::StartHandshake,
                self.transition(ConnectionState::Connecting),
            ),
        }
    }

    /// Apply the result of the backend handshake.
    pub fn on_setup_finished(
        &mut self,
        success: bool,
    ) -> Result<(SetupOutcome, Vec<BillingEvent>), BillingError> {
        if self.state != ConnectionState::Connecting {
            return Err(BillingError::invalid_state(self.state, "on_setup_finished"));
        }

        if success {
            self.attempt_count = 0;
            return Ok((
                SetupOutcome::Connected,
                self.transition(ConnectionState::Connected),
            ));
        }

        let (decision, events) = self.connection_lost();
        Ok((SetupOutcome::Lost(decision), events))
    }

    /// Apply an unsolicited disconnection notification.
    pub fn on_disconnected(&mut self) -> (ReconnectDecision, Vec<BillingEvent>) {
        match self.state {
            ConnectionState::Connected | ConnectionState::Connecting => self.connection_lost(),
            ConnectionState::Disconnected | ConnectionState::Failed => {
                (ReconnectDecision::Ignored, Vec::new())
            }
        }
    }

    /// Explicit teardown; valid from any state.
    pub fn teardown(&mut self) -> Vec<BillingEvent> {
        self.attempt_count = 0;
        self.transition(ConnectionState::Disconnected)
    }

    fn connection_lost(&mut self) -> (ReconnectDecision, Vec<BillingEvent>) {
        let attempt = self.attempt_count.saturating_add(1);
        if self.policy.should_retry(attempt) {
            self.attempt_count = attempt;
            let delay = self.policy.delay_for_attempt(attempt);
            let mut events = self.transition(ConnectionState::Disconnected);
            events.push(BillingEvent::ReconnectScheduled {
                attempt,
                delay_ms: delay.as_millis() as u64,
            });
            return (ReconnectDecision::Retry { attempt, delay }, events);
        }

        let attempts = self.attempt_count;
        let mut events = self.transition(ConnectionState::Failed);
        events.push(BillingEvent::ReconnectExhausted { attempts });
        (ReconnectDecision::GiveUp { attempts }, events)
    }

    fn transition(&mut self, next: ConnectionState) -> Vec<BillingEvent> {
        if self.state == next {
            return Vec::new();
        }
        self.state = next;
        vec![BillingEvent::ConnectionStateChanged { state: next }]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn connected() -> ConnectionStateMachine {
        let mut sm = ConnectionStateMachine::default();
        sm.begin_connect();
        sm.on_setup_finished(true).expect("handshake should resolve");
        sm
    }

    #[test]
    fn runs_happy_path_state_transitions() {
        let mut sm = ConnectionStateMachine::default();
        assert_eq!(sm.state(), ConnectionState::Disconnected);

        let (decision, events) = sm.begin_connect();
        assert_eq!(decision, ConnectDecision::StartHandshake);
        assert_eq!(
            events,
            vec![BillingEvent::ConnectionStateChanged {
                state: ConnectionState::Connecting
            }]
        );

        let (outcome, _) = sm.on_setup_finished(true).expect("handshake should resolve");
        assert_eq!(outcome, SetupOutcome::Connected);
        assert_eq!(sm.state(), ConnectionState::Connected);
        assert_eq!(sm.attempt_count(), 0);

        sm.teardown();
        assert_eq!(sm.state(), ConnectionState::Disconnected);
    }

    #[test]
    fn joins_in_flight_handshake_instead_of_starting_another() {
        let mut sm = ConnectionStateMachine::default();
        assert_eq!(sm.begin_connect().0, ConnectDecision::StartHandshake);
        assert_eq!(sm.begin_connect().0, ConnectDecision::AwaitInFlight);

        sm.on_setup_finished(true).expect("handshake should resolve");
        let (decision, events) = sm.begin_connect();
        assert_eq!(decision, ConnectDecision::AlreadyConnected);
        assert!(events.is_empty());
    }

    #[test]
    fn rejects_setup_result_without_handshake() {
        let mut sm = ConnectionStateMachine::default();
        let err = sm
            .on_setup_finished(true)
            .expect_err("setup result should fail when not connecting");
        assert_eq!(err.code, "invalid_state_transition");
    }

    #[test]
    fn schedules_linear_backoff_then_gives_up() {
        let mut sm = connected();

        let (decision, events) = sm.on_disconnected();
        assert_eq!(
            decision,
            ReconnectDecision::Retry {
                attempt: 1,
                delay: Duration::from_millis(2_000)
            }
        );
        assert!(events.contains(&BillingEvent::ReconnectScheduled {
            attempt: 1,
            delay_ms: 2_000
        }));

        for (attempt, delay_ms) in [(2, 4_000), (3, 6_000)] {
            assert_eq!(sm.begin_connect().0, ConnectDecision::StartHandshake);
            let (outcome, _) = sm.on_setup_finished(false).expect("handshake should resolve");
            assert_eq!(
                outcome,
                SetupOutcome::Lost(ReconnectDecision::Retry {
                    attempt,
                    delay: Duration::from_millis(delay_ms)
                })
            );
        }

        sm.begin_connect();
        let (outcome, events) = sm.on_setup_finished(false).expect("handshake should resolve");
        assert_eq!(
            outcome,
            SetupOutcome::Lost(ReconnectDecision::GiveUp { attempts: 3 })
        );
        assert_eq!(sm.state(), ConnectionState::Failed);
        assert!(events.contains(&BillingEvent::ReconnectExhausted { attempts: 3 }));

        let (decision, _) = sm.on_disconnected();
        assert_eq!(decision, ReconnectDecision::Ignored);
    }

    #[test]
    fn successful_reconnect_resets_attempts() {
        let mut sm = connected();
        sm.on_disconnected();
        assert_eq!(sm.attempt_count(), 1);

        sm.begin_connect();
        sm.on_setup_finished(true).expect("handshake should resolve");
        assert_eq!(sm.state(), ConnectionState::Connected);
        assert_eq!(sm.attempt_count(), 0);
    }

    #[test]
    fn ignores_disconnect_while_waiting_for_retry() {
        let mut sm = connected();
        sm.on_disconnected();
        let (decision, events) = sm.on_disconnected();
        assert_eq!(decision, ReconnectDecision::Ignored);
        assert!(events.is_empty());
        assert_eq!(sm.attempt_count(), 1);
    }

    #[test]
    fn explicit_connect_from_failed_starts_fresh_budget() {
        let mut sm = ConnectionStateMachine::new(RetryPolicy::new(2_000, 0));
        sm.begin_connect();
        sm.on_setup_finished(false).expect("handshake should resolve");
        assert_eq!(sm.state(), ConnectionState::Failed);

        let (decision, _) = sm.begin_connect();
        assert_eq!(decision, ConnectDecision::StartHandshake);
        assert_eq!(sm.state(), ConnectionState::Connecting);
        assert_eq!(sm.attempt_count(), 0);
    }
}
