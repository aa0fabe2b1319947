use std::time::Duration;

use clap::ValueEnum;

/// Interval between liveness probes on WebSocket sessions.
pub const DEFAULT_HEARTBEAT_INTERVAL: Duration = Duration::from_secs(30);

/// How long a closing connection may take to flush before it is dropped.
pub const DEFAULT_CLOSE_GRACE: Duration = Duration::from_secs(3);

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum TransportKind {
    /// Newline-delimited JSON over TCP.
    Lines,
    /// One JSON message per WebSocket text frame.
    #[value(name = "websocket")]
    WebSocket,
}

/// Decides who may hold the admin role.
///
/// At most one session is admin at a time under either policy. The role is
/// never reassigned when the admin leaves; a relay without an admin is a valid
/// steady state until somebody eligible asks again.
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum AdminPolicy {
    /// Only the longest-connected live session may become admin.
    OldestConnection,
    /// The first session to ask becomes admin while nobody else holds it.
    FirstRequester,
}

#[derive(Debug, Clone)]
pub struct RelayConfig {
    pub admin_policy: AdminPolicy,
    pub heartbeat_interval: Duration,
    pub close_grace: Duration,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            admin_policy: AdminPolicy::OldestConnection,
            heartbeat_interval: DEFAULT_HEARTBEAT_INTERVAL,
            close_grace: DEFAULT_CLOSE_GRACE,
        }
    }
}
