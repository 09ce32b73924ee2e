//! Bounded reconnection policy.
//!
//! A dropped transport is retried with exponential backoff, at most three
//! times per outage. Close codes in the application-terminal range mean the
//! server ended the session on purpose; those are never retried.

use std::time::Duration;

/// Backoff schedule, indexed by attempt number.
const BACKOFF: [Duration; 3] = [
    Duration::from_secs(1),
    Duration::from_secs(2),
    Duration::from_secs(4),
];

/// Close codes the server uses for deliberate, final session termination.
const TERMINAL_CODE_RANGE: std::ops::RangeInclusive<u16> = 4000..=4099;

/// How often the client sends a heartbeat `ping` while a connection is up.
/// Well inside the server's idle timeout.
pub const PING_INTERVAL: Duration = Duration::from_secs(15);

/// What the client should do after the connection dropped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReconnectDecision {
    /// Wait this long, then reconnect
    RetryAfter(Duration),
    /// The server ended the session deliberately; do not reconnect
    Terminal,
    /// Retry budget exhausted
    GiveUp,
}

/// Tracks reconnect attempts across one outage.
#[derive(Debug, Default)]
pub struct ReconnectionSupervisor {
    attempts: usize,
}

impl ReconnectionSupervisor {
    pub fn new() -> Self {
        Self::default()
    }

    /// Decide what to do about a connection loss. `close_code` is the
    /// WebSocket close code, if the peer sent one.
    pub fn on_disconnect(&mut self, close_code: Option<u16>) -> ReconnectDecision {
        if let Some(code) = close_code
            && TERMINAL_CODE_RANGE.contains(&code)
        {
            return ReconnectDecision::Terminal;
        }
        if self.attempts >= BACKOFF.len() {
            return ReconnectDecision::GiveUp;
        }
        let delay = BACKOFF[self.attempts];
        self.attempts += 1;
        ReconnectDecision::RetryAfter(delay)
    }

    /// A connection was (re-)established; the next outage starts a fresh
    /// retry budget. Returns the interval at which the transport should
    /// send heartbeat pings until the connection drops again.
    pub fn on_connected(&mut self) -> Duration {
        self.attempts = 0;
        PING_INTERVAL
    }

    pub fn attempts(&self) -> usize {
        self.attempts
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_backoff_schedule() {
        let mut supervisor = ReconnectionSupervisor::new();
        assert_eq!(
            supervisor.on_disconnect(None),
            ReconnectDecision::RetryAfter(Duration::from_secs(1))
        );
        assert_eq!(
            supervisor.on_disconnect(None),
            ReconnectDecision::RetryAfter(Duration::from_secs(2))
        );
        assert_eq!(
            supervisor.on_disconnect(None),
            ReconnectDecision::RetryAfter(Duration::from_secs(4))
        );
        assert_eq!(supervisor.on_disconnect(None), ReconnectDecision::GiveUp);
    }

    #[test]
    fn test_successful_connect_resets_budget() {
        let mut supervisor = ReconnectionSupervisor::new();
        supervisor.on_disconnect(None);
        supervisor.on_disconnect(None);
        supervisor.on_connected();
        assert_eq!(
            supervisor.on_disconnect(None),
            ReconnectDecision::RetryAfter(Duration::from_secs(1))
        );
    }

    #[test]
    fn test_connect_schedules_heartbeat() {
        let mut supervisor = ReconnectionSupervisor::new();
        assert_eq!(supervisor.on_connected(), PING_INTERVAL);
        assert!(PING_INTERVAL < Duration::from_secs(30 * 60));
    }

    #[test]
    fn test_terminal_codes_never_retry() {
        let mut supervisor = ReconnectionSupervisor::new();
        assert_eq!(
            supervisor.on_disconnect(Some(4000)),
            ReconnectDecision::Terminal
        );
        assert_eq!(
            supervisor.on_disconnect(Some(4099)),
            ReconnectDecision::Terminal
        );
        // ordinary close codes still retry
        assert!(matches!(
            supervisor.on_disconnect(Some(1006)),
            ReconnectDecision::RetryAfter(_)
        ));
    }
}
