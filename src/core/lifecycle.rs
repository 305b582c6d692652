//! Pure push-channel state machine.
//!
//! The connection actor owns one of these and publishes `state()` after every transition.
//! Nothing here touches timers: a transition returns a [`ReconnectPlan`] and the caller
//! decides how to schedule it.

use std::time::Duration;

use super::backoff::ReconnectStrategy;
use super::types::{ConnectionState, DisconnectCause};

/// What the caller should do after a failed attempt or a dropped connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReconnectPlan {
    /// Try again after the delay against `endpoint` (index into the endpoint list).
    RetryAfter { delay: Duration, endpoint: usize },
    /// Attempt budget exhausted; stay degraded until an explicit reconnect.
    Degraded,
    /// Non-retryable failure (authentication).
    Fatal,
}

#[derive(Debug)]
pub struct ConnectionLifecycle<S: ReconnectStrategy> {
    state: ConnectionState,
    strategy: S,
    endpoints: Vec<String>,
    endpoint: usize,
    reconnects: u64,
}

impl<S: ReconnectStrategy> ConnectionLifecycle<S> {
    pub fn new(strategy: S) -> Self {
        Self {
            state: ConnectionState::Disconnected,
            strategy,
            endpoints: Vec::new(),
            endpoint: 0,
            reconnects: 0,
        }
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    pub fn reconnects(&self) -> u64 {
        self.reconnects
    }

    pub fn attempts(&self) -> u32 {
        self.strategy.attempts()
    }

    /// Replace the endpoint list (primary first, then fallbacks).
    pub fn set_endpoints(&mut self, endpoints: Vec<String>) {
        self.endpoints = endpoints;
        self.endpoint = 0;
    }

    pub fn current_endpoint(&self) -> Option<&str> {
        self.endpoints.get(self.endpoint).map(String::as_str)
    }

    pub fn has_endpoints(&self) -> bool {
        !self.endpoints.is_empty()
    }

    /// `connect()` or a scheduled retry fired.
    pub fn begin_attempt(&mut self) -> ConnectionState {
        self.state = ConnectionState::Connecting;
        self.state
    }

    /// Handshake acknowledged: reset the attempt budget.
    pub fn handshake_accepted(&mut self) -> ConnectionState {
        self.state = ConnectionState::Connected;
        self.strategy.reset();
        self.state
    }

    /// A connection attempt failed before reaching `Connected`.
    ///
    /// Transport failures rotate to the next endpoint for the following attempt.
    pub fn attempt_failed(&mut self, cause: &DisconnectCause) -> ReconnectPlan {
        if cause.is_fatal() {
            self.state = ConnectionState::Error;
            return ReconnectPlan::Fatal;
        }
        if self.endpoints.len() > 1 {
            self.endpoint = (self.endpoint + 1) % self.endpoints.len();
        }
        self.plan_retry()
    }

    /// An established connection dropped.
    pub fn connection_lost(&mut self, cause: &DisconnectCause) -> ReconnectPlan {
        if cause.is_fatal() {
            self.state = ConnectionState::Error;
            return ReconnectPlan::Fatal;
        }
        self.plan_retry()
    }

    /// Explicit teardown; always lands in `Disconnected`.
    pub fn teardown(&mut self) -> ConnectionState {
        self.state = ConnectionState::Disconnected;
        self.strategy.reset();
        self.endpoint = 0;
        self.state
    }

    /// Explicit `reconnect()`: the only way out of `Degraded` and `Error`.
    pub fn manual_reconnect(&mut self) -> ConnectionState {
        self.strategy.reset();
        self.begin_attempt()
    }

    fn plan_retry(&mut self) -> ReconnectPlan {
        match self.strategy.next_delay() {
            Some(delay) => {
                self.state = ConnectionState::Reconnecting;
                self.reconnects = self.reconnects.saturating_add(1);
                ReconnectPlan::RetryAfter {
                    delay,
                    endpoint: self.endpoint,
                }
            }
            None => {
                self.state = ConnectionState::Degraded;
                ReconnectPlan::Degraded
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::backoff::BackoffPolicy;

    fn lifecycle(max_attempts: u32) -> ConnectionLifecycle<BackoffPolicy> {
        let mut lifecycle = ConnectionLifecycle::new(BackoffPolicy::new(
            Duration::from_secs(1),
            Duration::from_secs(5),
            2.0,
            max_attempts,
        ));
        lifecycle.set_endpoints(vec!["wss://primary".to_string(), "wss://fallback".to_string()]);
        lifecycle
    }

    fn transport_error() -> DisconnectCause {
        DisconnectCause::HandshakeFailed {
            message: "connection refused".to_string(),
        }
    }

    #[test]
    fn happy_path_reaches_connected() {
        let mut lc = lifecycle(5);
        assert_eq!(lc.state(), ConnectionState::Disconnected);
        assert_eq!(lc.begin_attempt(), ConnectionState::Connecting);
        assert_eq!(lc.handshake_accepted(), ConnectionState::Connected);
        assert_eq!(lc.current_endpoint(), Some("wss://primary"));
    }

    #[test]
    fn failed_attempts_rotate_endpoints_then_degrade() {
        let mut lc = lifecycle(2);
        lc.begin_attempt();

        let plan = lc.attempt_failed(&transport_error());
        assert_eq!(
            plan,
            ReconnectPlan::RetryAfter {
                delay: Duration::from_secs(1),
                endpoint: 1
            }
        );
        assert_eq!(lc.state(), ConnectionState::Reconnecting);
        assert_eq!(lc.current_endpoint(), Some("wss://fallback"));

        lc.begin_attempt();
        let plan = lc.attempt_failed(&transport_error());
        assert_eq!(
            plan,
            ReconnectPlan::RetryAfter {
                delay: Duration::from_secs(2),
                endpoint: 0
            }
        );

        lc.begin_attempt();
        assert_eq!(lc.attempt_failed(&transport_error()), ReconnectPlan::Degraded);
        assert_eq!(lc.state(), ConnectionState::Degraded);
        assert_eq!(lc.reconnects(), 2);
    }

    #[test]
    fn auth_rejection_is_fatal_and_not_retried() {
        let mut lc = lifecycle(5);
        lc.begin_attempt();
        let plan = lc.attempt_failed(&DisconnectCause::AuthRejected {
            message: "bad token".to_string(),
        });
        assert_eq!(plan, ReconnectPlan::Fatal);
        assert_eq!(lc.state(), ConnectionState::Error);
        assert_eq!(lc.attempts(), 0);
    }

    #[test]
    fn successful_handshake_restores_budget_after_drop() {
        let mut lc = lifecycle(2);
        lc.begin_attempt();
        lc.attempt_failed(&transport_error());
        lc.begin_attempt();
        lc.handshake_accepted();
        assert_eq!(lc.attempts(), 0);

        let plan = lc.connection_lost(&DisconnectCause::RemoteClosed);
        assert!(matches!(
            plan,
            ReconnectPlan::RetryAfter { delay, .. } if delay == Duration::from_secs(1)
        ));
    }

    #[test]
    fn teardown_and_manual_reconnect_reset_state() {
        let mut lc = lifecycle(1);
        lc.begin_attempt();
        lc.attempt_failed(&transport_error());
        lc.begin_attempt();
        assert_eq!(lc.attempt_failed(&transport_error()), ReconnectPlan::Degraded);

        assert_eq!(lc.manual_reconnect(), ConnectionState::Connecting);
        assert_eq!(lc.attempts(), 0);

        assert_eq!(lc.teardown(), ConnectionState::Disconnected);
        assert_eq!(lc.current_endpoint(), Some("wss://primary"));
    }
}
