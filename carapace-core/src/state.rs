//! Connection lifecycle states.

use std::fmt;

/// Where a client is in its lifecycle.
///
/// ```text
/// DISCONNECTED -> CONNECTING -> CONNECTED <-> RECONNECTING
///                                   |              |
///                                   +-> DRAINING <-+
///                                          |
///                     CLOSED <-------------+ (also from RECONNECTING)
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    Reconnecting,
    Draining,
    Closed,
}

impl ConnectionState {
    /// True when no further transitions can happen.
    #[inline]
    pub const fn is_terminal(self) -> bool {
        matches!(self, Self::Closed)
    }

    /// True when application publishes may be accepted.
    ///
    /// Writes issued while reconnecting are buffered, not rejected.
    #[inline]
    pub const fn accepts_publish(self) -> bool {
        matches!(self, Self::Connecting | Self::Connected | Self::Reconnecting)
    }

    /// Whether moving to `next` is a legal transition.
    pub const fn can_transition_to(self, next: Self) -> bool {
        use ConnectionState::*;
        matches!(
            (self, next),
            (Disconnected, Connecting)
                | (Connecting, Connected)
                | (Connecting, Closed)
                | (Connected, Reconnecting)
                | (Connected, Draining)
                | (Connected, Closed)
                | (Reconnecting, Connected)
                | (Reconnecting, Draining)
                | (Reconnecting, Closed)
                | (Draining, Closed)
        )
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Disconnected => "DISCONNECTED",
            Self::Connecting => "CONNECTING",
            Self::Connected => "CONNECTED",
            Self::Reconnecting => "RECONNECTING",
            Self::Draining => "DRAINING",
            Self::Closed => "CLOSED",
        };
        f.write_str(s)
    }
}
