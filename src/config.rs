//! Runtime knobs for connections and listeners.
use std::time::Duration;

/// Stream timeouts applied when a connection is constructed. `None` blocks
/// indefinitely, which is the default.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ConnectionConfig {
    pub read_timeout: Option<Duration>,
    pub write_timeout: Option<Duration>,
}

impl ConnectionConfig {
    pub fn read_timeout(mut self, timeout: Duration) -> Self {
        self.read_timeout = Some(timeout);
        self
    }

    pub fn write_timeout(mut self, timeout: Duration) -> Self {
        self.write_timeout = Some(timeout);
        self
    }
}

const DEFAULT_ACCEPT_POLL: Duration = Duration::from_millis(50);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ListenerConfig {
    /// How long the accept loop sleeps when no connection is pending. Bounds
    /// how long `terminate` takes to be noticed.
    pub accept_poll: Duration,
}

impl ListenerConfig {
    pub fn accept_poll(mut self, interval: Duration) -> Self {
        self.accept_poll = interval;
        self
    }
}

impl Default for ListenerConfig {
    fn default() -> Self {
        Self {
            accept_poll: DEFAULT_ACCEPT_POLL,
        }
    }
}
