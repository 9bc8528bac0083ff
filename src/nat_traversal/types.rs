/**
 * nat_traversal/types.rs
 *
 * Core types for the hole punching dialer
 */

use std::fmt;
use std::time::Duration;

/// Retry behaviour of one punch attempt loop
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Pause between failed connect attempts (zero retries immediately)
    pub interval: Duration,

    /// Give up after this many connect attempts (`None` for unbounded)
    pub max_attempts: Option<u32>,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            interval: Duration::ZERO,
            max_attempts: None,
        }
    }
}

/// Hole punching dialer configuration
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DialConfig {
    /// Bound on the control channel round trip, which includes waiting for
    /// the peer to register
    pub handshake_timeout: Option<Duration>,

    /// Bound on the punch race once peer addresses are known
    pub punch_timeout: Option<Duration>,

    pub retry: RetryPolicy,
}

impl Default for DialConfig {
    fn default() -> Self {
        Self {
            handshake_timeout: None,
            punch_timeout: Some(Duration::from_secs(60)),
            retry: RetryPolicy::default(),
        }
    }
}

/// Which contributor to the race produced a connection: an outbound loop
/// towards one of the peer's endpoints, or the listener on the local tuple
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PunchTarget {
    Public,
    Private,
    Inbound,
}

impl fmt::Display for PunchTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PunchTarget::Public => write!(f, "PUBLIC"),
            PunchTarget::Private => write!(f, "PRIVATE"),
            PunchTarget::Inbound => write!(f, "INBOUND"),
        }
    }
}

/// Dialer state machine
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectionState {
    Idle,
    ConnectingRendezvous,
    AwaitingPeer,
    Punching,
    Connected,
    Failed(String),
}
