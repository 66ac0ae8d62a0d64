//! # Carapace NATS
//!
//! Client engine for the NATS text protocol.
//!
//! ## Overview
//!
//! - **Codec**: incremental decoder for `INFO`/`MSG`/`HMSG`/`PING`/`PONG`/`+OK`/`-ERR`
//!   and encoder for the client verbs
//! - **Transport**: TCP, in-place TLS upgrade, WebSocket overlay
//! - **Server pool**: explicit and discovered servers with reconnect pacing
//! - **Connection engine**: handshake, keepalive, reconnect with
//!   subscription replay, drain and close
//! - **Dispatcher**: per-subscription queues with pending limits
//! - **Correlator**: multiplexed or per-request reply inboxes
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use carapace_nats::Client;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let client = Client::connect("nats://127.0.0.1:4222").await?;
//!
//!     let sub = client.subscribe("updates")?;
//!     client.publish("updates", "hello")?;
//!     client.flush().await?;
//!
//!     let msg = sub.next().await;
//!     println!("{:?}", msg.map(|m| m.payload));
//!
//!     client.drain().await?;
//!     Ok(())
//! }
//! ```

// Allow some pedantic lints
#![allow(clippy::cast_possible_truncation)]
#![allow(clippy::items_after_statements)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::must_use_candidate)]
#![allow(clippy::needless_pass_by_value)]
#![allow(clippy::match_same_arms)]
#![allow(clippy::missing_errors_doc)]

// Internal modules (not part of public API)
mod connection;

// Protocol
pub mod codec;
pub mod header;
pub mod info;
pub mod message;

// Transport and server selection
pub mod pool;
pub mod tls;
pub mod transport;

// Client surface
pub mod callbacks;
pub mod client;
pub mod request;
pub mod subscription;

#[cfg(unix)]
pub mod registry;

pub use callbacks::{ConnectionHandler, NoopHandler};
pub use client::{Client, ClientBuilder};
pub use header::{HeaderMap, Status};
pub use info::ServerInfo;
pub use message::Message;
pub use request::new_inbox;
pub use subscription::{SubscribeOptions, Subscription, SubscriptionStats};

pub mod prelude {
    pub use crate::callbacks::ConnectionHandler;
    pub use crate::client::{Client, ClientBuilder};
    pub use crate::header::HeaderMap;
    pub use crate::message::Message;
    pub use crate::subscription::{SubscribeOptions, Subscription};
    pub use carapace_core::prelude::*;
}
