use std::time::Duration;

/// Tunable timing constants for a peer: 3s/5s/2s heartbeat cadence, 15s
/// request wait ceiling, 8s hold ceiling.
#[derive(Debug, Clone, Copy)]
pub struct Config {
    /// Period between outbound heartbeats.
    pub heartbeat_interval: Duration,
    /// Silence beyond which a peer is evicted from the active set.
    pub heartbeat_timeout: Duration,
    /// Period of the eviction sweep.
    pub monitor_interval: Duration,
    /// Upper bound on `enter()`'s wait for all replies.
    pub max_wait_time: Duration,
    /// Upper bound on CS hold before forced release.
    pub max_access_time: Duration,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            heartbeat_interval: Duration::from_secs(3),
            heartbeat_timeout: Duration::from_secs(5),
            monitor_interval: Duration::from_secs(2),
            max_wait_time: Duration::from_secs(15),
            max_access_time: Duration::from_secs(8),
        }
    }
}

impl Config {
    /// A configuration scaled down for tests, preserving the relative
    /// ordering the end-to-end scenarios depend on (monitor tighter than
    /// heartbeat timeout, wait longer than either).
    pub fn test_scaled() -> Self {
        Self {
            heartbeat_interval: Duration::from_millis(30),
            heartbeat_timeout: Duration::from_millis(100),
            monitor_interval: Duration::from_millis(20),
            max_wait_time: Duration::from_millis(400),
            max_access_time: Duration::from_millis(150),
        }
    }
}
