//! NATS protocol client.
//!
//! # Connecting
//!
//! - [`Client::connect`] takes a comma separated server list
//! - [`Client::connect_with_options`] takes full [`ConnectOptions`]
//! - [`Client::builder`] adds a [`ConnectionHandler`] or a custom TLS setup
//!
//! # Observing the connection
//!
//! ```rust,no_run
//! use carapace::nats::{Client, ConnectionEvent};
//!
//! # async fn example(client: Client) {
//! let events = client.monitor();
//! while let Ok(event) = events.recv_async().await {
//!     match event {
//!         ConnectionEvent::Disconnected { reason, .. } => eprintln!("lost: {reason}"),
//!         ConnectionEvent::Reconnected(ep) => eprintln!("back on {ep}"),
//!         ConnectionEvent::Closed { .. } => break,
//!         _ => {}
//!     }
//! }
//! # }
//! ```

pub use carapace_core::endpoint::{Endpoint, Scheme};
pub use carapace_core::monitor::{ConnectionEvent, ConnectionMonitor};
pub use carapace_core::options::{ConnectOptions, ReplyMode};
pub use carapace_core::state::ConnectionState;
pub use carapace_nats::{
    new_inbox, Client, ClientBuilder, ConnectionHandler, HeaderMap, Message, NoopHandler,
    ServerInfo, Status, SubscribeOptions, Subscription, SubscriptionStats,
};

#[cfg(unix)]
pub use carapace_nats::registry::after_fork;

/// Convenient imports for the NATS client.
///
/// ```rust
/// use carapace::nats::prelude::*;
/// ```
pub mod prelude {
    pub use super::{
        Client, ConnectOptions, ConnectionEvent, ConnectionHandler, ConnectionState, HeaderMap,
        Message, ReplyMode, SubscribeOptions, Subscription,
    };
    pub use crate::{Bytes, Error};
}
