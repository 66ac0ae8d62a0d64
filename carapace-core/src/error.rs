//! Carapace Error Types
//!
//! Every failure a client can observe, grouped into the classes that decide
//! how the connection engine reacts to it.

use std::io;
use std::time::Duration;
use thiserror::Error;

use crate::endpoint::EndpointError;
use crate::options::OptionsError;

/// Coarse classification used by the connection engine to pick a reaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorClass {
    /// Connect attempt failed; advance to the next server.
    Connect,
    /// Malformed or unexpected wire data; the transport is torn down.
    Protocol,
    /// Broker-reported or keepalive failure; reconnect unless disabled.
    Runtime,
    /// Slow consumer; reported, connection stays up.
    Flow,
    /// Local to a single request.
    Request,
    /// Drain did not finish in time; the client closes anyway.
    Drain,
    /// Misuse of the API or a closed client.
    Usage,
}

/// Byte-stream failures raised by a transport.
///
/// Timeouts are kept apart from resets so callers can tell a slow peer from
/// a dead one.
#[derive(Error, Debug)]
pub enum TransportError {
    /// Deadline elapsed before the operation completed
    #[error("{op} timed out after {after:?}")]
    Timeout { op: &'static str, after: Duration },

    /// Peer reset or aborted the connection
    #[error("Connection reset: {0}")]
    ConnectionReset(String),

    /// Orderly end of stream
    #[error("Connection closed by peer")]
    Closed,

    /// Write attempted before the WebSocket upgrade finished
    #[error("WebSocket handshake in progress")]
    HandshakeInProgress,

    /// TLS configuration or negotiation failure
    #[error("TLS error: {0}")]
    Tls(String),

    /// WebSocket framing or upgrade failure
    #[error("WebSocket error: {0}")]
    WebSocket(String),

    /// Any other I/O error
    #[error("IO error: {0}")]
    Io(io::Error),
}

impl TransportError {
    /// Returns true when the failure was a deadline rather than a broken link.
    #[must_use]
    pub const fn is_timeout(&self) -> bool {
        matches!(self, Self::Timeout { .. })
    }

    /// Returns true when the peer went away.
    #[must_use]
    pub const fn is_reset(&self) -> bool {
        matches!(self, Self::ConnectionReset(_) | Self::Closed)
    }
}

impl From<io::Error> for TransportError {
    fn from(e: io::Error) -> Self {
        match e.kind() {
            io::ErrorKind::ConnectionReset
            | io::ErrorKind::ConnectionAborted
            | io::ErrorKind::BrokenPipe
            | io::ErrorKind::NotConnected => Self::ConnectionReset(e.to_string()),
            io::ErrorKind::UnexpectedEof => Self::Closed,
            _ => Self::Io(e),
        }
    }
}

/// Main error type for client operations
#[derive(Error, Debug)]
pub enum Error {
    /// Could not reach or handshake with a server
    #[error("Connect to {endpoint} failed: {source}")]
    Connect {
        endpoint: String,
        #[source]
        source: TransportError,
    },

    /// Connect attempt exceeded `connect_timeout`
    #[error("Connect to {endpoint} timed out after {after:?}")]
    ConnectTimeout { endpoint: String, after: Duration },

    /// TLS required by one side but unavailable on the other
    #[error("TLS negotiation failed: {0}")]
    Tls(String),

    /// Handshake rejected or malformed
    #[error("Handshake failed: {0}")]
    Handshake(String),

    /// Every pool entry has been tried
    #[error("No servers available for connection{}", .last.as_ref().map(|e| format!(" (last error: {e})")).unwrap_or_default())]
    NoServers { last: Option<String> },

    /// Malformed frame or unknown verb
    #[error("Protocol violation: {0}")]
    Protocol(String),

    /// Transport failure on an established connection
    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),

    /// `-ERR` frame from the broker
    #[error("Server error: {0}")]
    Server(String),

    /// Authorization rejected by the broker
    #[error("Authorization violation: {0}")]
    Authorization(String),

    /// Publish or subscribe denied by broker permissions
    #[error("Permissions violation: {0}")]
    Permissions(String),

    /// Keepalive pings went unanswered
    #[error("Stale connection")]
    StaleConnection,

    /// Subscription exceeded its pending limits
    #[error("Slow consumer on subscription {sid} ({subject})")]
    SlowConsumer { sid: u64, subject: String },

    /// Request deadline elapsed without a reply
    #[error("Request timed out")]
    Timeout,

    /// Broker reported no subscribers for the request subject
    #[error("No responders available for request")]
    NoResponders,

    /// Flush round trip did not complete in time
    #[error("Flush timed out after {0:?}")]
    FlushTimeout(Duration),

    /// Drain did not complete within `drain_timeout`
    #[error("Drain timed out after {0:?}")]
    DrainTimeout(Duration),

    /// Client is closed
    #[error("Connection closed")]
    ConnectionClosed,

    /// Client is draining and refuses new work
    #[error("Connection draining")]
    ConnectionDraining,

    /// Connection lost while the call was waiting
    #[error("Connection lost: {0}")]
    Disconnected(String),

    /// Publish larger than the server allows
    #[error("Payload too large: {size} bytes (max: {max})")]
    MaxPayload { size: usize, max: usize },

    /// Writes buffered during reconnect exceeded their bound
    #[error("Reconnect buffer exceeded ({limit} bytes)")]
    ReconnectBufferExceeded { limit: usize },

    /// Subject or queue name cannot be put on the wire
    #[error("Invalid subject: {0:?}")]
    InvalidSubject(String),

    /// Subscription is no longer registered
    #[error("Invalid subscription: {0}")]
    InvalidSubscription(u64),

    /// Server URL could not be parsed
    #[error("Endpoint error: {0}")]
    Endpoint(#[from] EndpointError),

    /// Option value could not be parsed
    #[error("Options error: {0}")]
    Options(#[from] OptionsError),
}

/// Result type alias for client operations
pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    /// Create a protocol error with a message
    pub fn protocol(msg: impl Into<String>) -> Self {
        Self::Protocol(msg.into())
    }

    /// Create a handshake error with a message
    pub fn handshake(msg: impl Into<String>) -> Self {
        Self::Handshake(msg.into())
    }

    /// Classify a `-ERR` text the way the broker phrases it.
    pub fn from_server_text(text: &str) -> Self {
        let lower = text.to_ascii_lowercase();
        if lower.starts_with("stale connection") {
            Self::StaleConnection
        } else if lower.starts_with("permissions violation") {
            Self::Permissions(text.to_string())
        } else if lower.starts_with("authorization violation")
            || lower.starts_with("user authentication")
            || lower.starts_with("authentication timeout")
        {
            Self::Authorization(text.to_string())
        } else {
            Self::Server(text.to_string())
        }
    }

    /// The class that decides the engine's reaction.
    #[must_use]
    pub const fn class(&self) -> ErrorClass {
        match self {
            Self::Connect { .. }
            | Self::ConnectTimeout { .. }
            | Self::Tls(_)
            | Self::Handshake(_)
            | Self::NoServers { .. } => ErrorClass::Connect,
            Self::Protocol(_) => ErrorClass::Protocol,
            Self::Transport(_)
            | Self::Server(_)
            | Self::Authorization(_)
            | Self::Permissions(_)
            | Self::StaleConnection
            | Self::Disconnected(_) => ErrorClass::Runtime,
            Self::SlowConsumer { .. } => ErrorClass::Flow,
            Self::Timeout | Self::NoResponders | Self::FlushTimeout(_) => ErrorClass::Request,
            Self::DrainTimeout(_) => ErrorClass::Drain,
            Self::ConnectionClosed
            | Self::ConnectionDraining
            | Self::MaxPayload { .. }
            | Self::ReconnectBufferExceeded { .. }
            | Self::InvalidSubject(_)
            | Self::InvalidSubscription(_)
            | Self::Endpoint(_)
            | Self::Options(_) => ErrorClass::Usage,
        }
    }

    /// Check if this error tears down the current transport.
    #[must_use]
    pub const fn is_connection_error(&self) -> bool {
        match self {
            Self::Permissions(_) => false,
            _ => matches!(
                self.class(),
                ErrorClass::Connect | ErrorClass::Protocol | ErrorClass::Runtime
            ),
        }
    }

    /// Check if retrying the same call later may succeed.
    #[must_use]
    pub fn is_recoverable(&self) -> bool {
        match self {
            Self::Transport(e) => e.is_timeout() || e.is_reset(),
            Self::Authorization(_) | Self::Protocol(_) => false,
            Self::Timeout
            | Self::FlushTimeout(_)
            | Self::NoResponders
            | Self::SlowConsumer { .. }
            | Self::Disconnected(_)
            | Self::StaleConnection => true,
            _ => false,
        }
    }
}
