//! Protocol constants shared by the server and its clients.

/// Default number of events retained per topic for replay.
pub const DEFAULT_HISTORY_CAPACITY: usize = 100;

/// Default interval between liveness probes, in seconds.
pub const DEFAULT_LIVENESS_INTERVAL_SECS: u64 = 30;

/// Default interval between idle-topic sweeps, in seconds.
pub const DEFAULT_REAPER_INTERVAL_SECS: u64 = 300;

/// Default grace period an idle topic survives before it is reaped, in seconds.
pub const DEFAULT_TOPIC_GRACE_SECS: u64 = 300;

/// Default bound on a single transport send, in milliseconds.
pub const DEFAULT_SEND_TIMEOUT_MS: u64 = 5_000;

/// WebSocket close codes used by the relay.
pub mod close_code {
    /// Normal leave.
    pub const NORMAL: u16 = 1000;
    /// Server shutting down.
    pub const GOING_AWAY: u16 = 1001;
    /// Liveness deadline missed, or an unusable scope.
    pub const POLICY_VIOLATION: u16 = 1008;
    /// Send to the peer failed or timed out.
    pub const INTERNAL_ERROR: u16 = 1011;
    /// Invalid or expired credential.
    pub const UNAUTHENTICATED: u16 = 4001;
    /// Principal not entitled to the requested scope.
    pub const FORBIDDEN: u16 = 4003;
}
