//! Connection event monitoring.
//!
//! Provides a stream of lifecycle events (connects, disconnects, slow
//! consumers, broker errors) alongside the typed callback interface.

use crate::endpoint::Endpoint;
use std::fmt;

/// Client lifecycle events.
#[derive(Debug, Clone)]
pub enum ConnectionEvent {
    /// Initial connection established.
    Connected(Endpoint),

    /// Established connection lost.
    Disconnected {
        endpoint: Endpoint,
        reason: String,
    },

    /// Connection re-established after a loss.
    Reconnected(Endpoint),

    /// A connect attempt against one server failed.
    ConnectFailed {
        endpoint: Endpoint,
        reason: String,
    },

    /// Client reached the terminal state.
    Closed {
        reason: Option<String>,
    },

    /// Subscription dropped messages.
    SlowConsumer {
        sid: u64,
        subject: String,
    },

    /// Asynchronous error (broker `-ERR`, drain timeout, ...).
    Error(String),

    /// Broker advertised additional servers.
    ServersDiscovered(Vec<Endpoint>),

    /// Broker entered lame-duck mode and will shut down soon.
    LameDuck(Endpoint),
}

impl fmt::Display for ConnectionEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Connected(ep) => write!(f, "Connected to {ep}"),
            Self::Disconnected { endpoint, reason } => {
                write!(f, "Disconnected from {endpoint}: {reason}")
            }
            Self::Reconnected(ep) => write!(f, "Reconnected to {ep}"),
            Self::ConnectFailed { endpoint, reason } => {
                write!(f, "Connect failed for {endpoint}: {reason}")
            }
            Self::Closed { reason: Some(r) } => write!(f, "Closed: {r}"),
            Self::Closed { reason: None } => write!(f, "Closed"),
            Self::SlowConsumer { sid, subject } => {
                write!(f, "Slow consumer on sid {sid} ({subject})")
            }
            Self::Error(e) => write!(f, "Error: {e}"),
            Self::ServersDiscovered(eps) => write!(f, "Discovered {} server(s)", eps.len()),
            Self::LameDuck(ep) => write!(f, "Lame duck mode on {ep}"),
        }
    }
}

/// Handle for receiving connection events.
pub type ConnectionMonitor = flume::Receiver<ConnectionEvent>;

/// Sender half used by the client to emit events.
pub type ConnectionEventSender = flume::Sender<ConnectionEvent>;

/// Creates a new monitoring channel pair.
#[must_use]
pub fn create_monitor() -> (ConnectionEventSender, ConnectionMonitor) {
    flume::unbounded()
}
