//! Session-layer configuration.

/// Configuration for the connection manager and its sessions.
#[derive(Debug, Clone)]
pub struct SyncConfig {
    /// The shared channel topic every participant joins. All roles meet
    /// on one topic; that is what lets host, controllers and view see
    /// each other.
    pub topic: String,
    /// Whether our own broadcasts round-trip back into the message log.
    /// Consumers filter on `clientId`, so the default is to receive them.
    pub self_broadcast: bool,
    /// Whether broadcasts are acknowledged by the server.
    pub ack: bool,
    /// Message log bounds and prune cadence.
    pub log: LogConfig,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            topic: "game".to_string(),
            self_broadcast: true,
            ack: false,
            log: LogConfig::default(),
        }
    }
}

/// Bounds for the in-memory message log.
#[derive(Debug, Clone, Copy)]
pub struct LogConfig {
    /// Length that triggers a prune on the next prune cycle.
    pub max_len: usize,
    /// Number of most-recent messages retained by a prune.
    pub retain: usize,
    /// Seconds between prune cycles.
    pub prune_interval_secs: u64,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            max_len: 100,
            retain: 50,
            prune_interval_secs: 30,
        }
    }
}
