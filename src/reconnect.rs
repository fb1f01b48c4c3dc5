use std::time::Duration;

/// Default backoff table: 1s, 2s, 5s, 10s, then give up
pub const DEFAULT_BACKOFF: [Duration; 4] = [
    Duration::from_secs(1),
    Duration::from_secs(2),
    Duration::from_secs(5),
    Duration::from_secs(10),
];

/// Bounded backoff for reconnecting after a transient failure.
///
/// A pure function of the attempt count; the session owns the counter and
/// resets it whenever a connection succeeds.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReconnectionPolicy {
    delays: Vec<Duration>,
}

impl ReconnectionPolicy {
    pub fn new(delays: Vec<Duration>) -> Self {
        Self { delays }
    }

    /// Delay before reconnect attempt `attempt` (0-indexed), or `None` to give up
    pub fn delay_for(&self, attempt: usize) -> Option<Duration> {
        self.delays.get(attempt).copied()
    }

    /// Number of reconnects allowed before the session settles in `Error`
    pub fn max_attempts(&self) -> usize {
        self.delays.len()
    }
}

impl Default for ReconnectionPolicy {
    fn default() -> Self {
        Self::new(DEFAULT_BACKOFF.to_vec())
    }
}
