use std::time::{Duration, Instant};

use super::bounded::BoundedQueue;
use super::clock::SharedClock;
use super::types::{ConnectionState, ConnectionStats};

const MAX_RECENT_ERRORS: usize = 100;
const MAX_ERROR_TEXT_BYTES: usize = 1024;

#[derive(Debug, Clone)]
struct ErrorRec {
    _at: Instant,
    context: String,
    _error: String,
}

fn truncate_string(s: &str) -> String {
    if s.len() <= MAX_ERROR_TEXT_BYTES {
        return s.to_string();
    }

    let mut end = MAX_ERROR_TEXT_BYTES;
    while end > 0 && !s.is_char_boundary(end) {
        end -= 1;
    }
    s[..end].to_string()
}

/// Passive heartbeat tracker for the push channel.
///
/// Any inbound frame counts as proof of life; silence longer than the heartbeat timeout
/// is treated as a dropped connection by the connection actor.
#[derive(Debug)]
pub struct LivenessMonitor {
    clock: SharedClock,
    connected_at: Instant,
    last_inbound: Instant,
    heartbeat_timeout: Duration,
    message_count: u64,
    error_count: u64,
    reconnect_count: u64,
    recent_errors: BoundedQueue<ErrorRec>,
}

impl LivenessMonitor {
    pub fn new(heartbeat_timeout: Duration, clock: SharedClock) -> Self {
        let now = clock.now();
        Self {
            clock,
            connected_at: now,
            last_inbound: now,
            heartbeat_timeout,
            message_count: 0,
            error_count: 0,
            reconnect_count: 0,
            recent_errors: BoundedQueue::new(MAX_RECENT_ERRORS),
        }
    }

    /// Restart the silence window (new connection established).
    pub fn reset(&mut self) {
        let now = self.clock.now();
        self.connected_at = now;
        self.last_inbound = now;
    }

    pub fn record_inbound(&mut self) {
        self.last_inbound = self.clock.now();
        self.message_count = self.message_count.saturating_add(1);
    }

    pub fn record_error(&mut self, context: &str, error: &str) {
        self.error_count = self.error_count.saturating_add(1);
        self.recent_errors.push(ErrorRec {
            _at: self.clock.now(),
            context: truncate_string(context),
            _error: truncate_string(error),
        });
    }

    pub fn increment_reconnect(&mut self) {
        self.reconnect_count = self.reconnect_count.saturating_add(1);
    }

    pub fn silent_for(&self) -> Duration {
        self.clock.now().saturating_duration_since(self.last_inbound)
    }

    pub fn is_stale(&self) -> bool {
        self.silent_for() > self.heartbeat_timeout
    }

    pub fn heartbeat_timeout(&self) -> Duration {
        self.heartbeat_timeout
    }

    pub fn last_error_context(&self) -> Option<&str> {
        self.recent_errors.iter().next_back().map(|rec| rec.context.as_str())
    }

    pub fn stats(&self, state: ConnectionState) -> ConnectionStats {
        let now = self.clock.now();
        ConnectionStats {
            state,
            uptime: now.saturating_duration_since(self.connected_at),
            messages: self.message_count,
            errors: self.error_count,
            reconnects: self.reconnect_count,
            last_message_age: now.saturating_duration_since(self.last_inbound),
            recent_errors: self.recent_errors.len(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::clock::ManualClock;
    use std::sync::Arc;

    fn monitor(timeout: Duration) -> (LivenessMonitor, ManualClock) {
        let clock = ManualClock::new();
        let monitor = LivenessMonitor::new(timeout, Arc::new(clock.clone()));
        (monitor, clock)
    }

    #[test]
    fn silence_beyond_timeout_is_stale() {
        let (mut monitor, clock) = monitor(Duration::from_secs(30));
        assert!(!monitor.is_stale());

        clock.advance(Duration::from_secs(29));
        assert!(!monitor.is_stale());

        monitor.record_inbound();
        clock.advance(Duration::from_secs(30));
        assert!(!monitor.is_stale());

        clock.advance(Duration::from_millis(1));
        assert!(monitor.is_stale());
        assert_eq!(monitor.silent_for(), Duration::from_millis(30_001));
    }

    #[test]
    fn reset_restarts_window() {
        let (mut monitor, clock) = monitor(Duration::from_secs(1));
        clock.advance(Duration::from_secs(5));
        assert!(monitor.is_stale());
        monitor.reset();
        assert!(!monitor.is_stale());
        assert_eq!(monitor.stats(ConnectionState::Connected).uptime, Duration::ZERO);
    }

    #[test]
    fn error_buffer_is_bounded_and_truncated() {
        let (mut monitor, _clock) = monitor(Duration::from_secs(1));
        for i in 0..105 {
            monitor.record_error("read", &format!("error-{i}"));
        }
        let stats = monitor.stats(ConnectionState::Reconnecting);
        assert_eq!(stats.errors, 105);
        assert_eq!(stats.recent_errors, MAX_RECENT_ERRORS);

        let huge = "x".repeat(MAX_ERROR_TEXT_BYTES + 10);
        monitor.record_error(&huge, "boom");
        assert_eq!(
            monitor.last_error_context().map(str::len),
            Some(MAX_ERROR_TEXT_BYTES)
        );
    }
}
