//! Centralized configuration for modwire.
//!
//! Default values for connection descriptors, call deadlines, keepalive timing
//! and reconnection. Per-channel overrides live in [`crate::ChannelOptions`].

use std::time::Duration;

/// Defaults applied when a connection descriptor leaves a field unset.
pub struct ChannelDefaults;

impl ChannelDefaults {
    pub const HOSTNAME: &'static str = "127.0.0.1";
    pub const PORT: u16 = 80;
    pub const PATHNAME: &'static str = "/";

    /// Base URL that relative and bare-path descriptors are resolved against.
    pub const UNIX_BASE_URL: &'static str = "ws+unix://localhost:80";
}

/// Client-side timing.
pub struct ClientDefaults;

impl ClientDefaults {
    /// Deadline for a single call (and for the connect handshake).
    pub const CALL_TIMEOUT: Duration = Duration::from_millis(5000);
    pub const PING_INTERVAL: Duration = Duration::from_millis(5000);
    /// Watchdog window after a PING; no PONG within it tears the transport down.
    pub const PING_TIMEOUT: Duration = Duration::from_millis(3000);
    pub const RECONNECT_BACKOFF: Duration = Duration::from_secs(2);
    /// Length of the random id generated for clients that don't supply one.
    pub const CLIENT_ID_LENGTH: usize = 10;

    /// Task ids run from `TASK_ID_OFFSET` to `TASK_ID_MAX`, then wrap.
    pub const TASK_ID_OFFSET: u64 = 1;
    pub const TASK_ID_MAX: u64 = u64::MAX;
    pub const TASK_ID_WRAP: bool = true;
}

/// Server-side limits.
pub struct ServerLimits;

impl ServerLimits {
    pub const MAX_CONNECTIONS: usize = 1024;
    pub const MAX_MESSAGE_SIZE: usize = 16 * 1024 * 1024; // 16MB
}
