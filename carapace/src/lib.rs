//! # Carapace
//!
//! A resilient publish/subscribe messaging client with multi-server
//! failover, transparent reconnection and request/reply.
//!
//! ## Architecture
//!
//! - **`carapace-core`**: protocol-agnostic building blocks (endpoints,
//!   options, reconnect pacing, subject matching, pending limits, errors)
//! - **Protocol crates**: wire codec, transport and client engine
//! - **`carapace`**: Public API surface (this crate)
//!
//! ## Protocols (opt-in via features)
//!
//! - **`nats`** - NATS text protocol client (enabled by default)
//!
//! ```toml
//! [dependencies]
//! carapace = { version = "0.1", features = ["nats"] }
//! ```
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! # #[cfg(feature = "nats")]
//! use carapace::nats::prelude::*;
//!
//! # #[cfg(feature = "nats")]
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let options = ConnectOptions::from_env()?
//!     .with_servers(["nats://a:4222", "nats://b:4222"])
//!     .with_name("orders-service");
//! let client = Client::connect_with_options(options).await?;
//!
//! // Pull-style subscription
//! let sub = client.subscribe("orders.>")?;
//! client.publish("orders.created", "{\"id\":1}")?;
//! client.flush().await?;
//! if let Some(msg) = sub.next().await {
//!     println!("{} -> {}", msg.subject, msg.text());
//! }
//!
//! // Request/reply
//! let reply = client.request("pricing.quote", "sku-42").await?;
//! println!("quote: {}", reply.text());
//!
//! // Let in-flight work finish, then close
//! client.drain().await?;
//! # Ok(())
//! # }
//! ```
//!
//! ## Resilience
//!
//! - Every configured server is tried in turn; servers advertised by the
//!   broker join the pool
//! - After a connection loss subscriptions are replayed and buffered
//!   publishes are sent once a new link is up
//! - Slow subscribers drop new messages past their pending limits instead
//!   of stalling the connection

#![warn(missing_docs)]
#![warn(clippy::all)]

// Re-export core types
pub use bytes::Bytes;
pub use carapace_core::error::{Error, ErrorClass, Result};
pub use carapace_core::options::{ConnectOptions, ReplyMode};

pub mod dev_tracing;

// Protocol modules (opt-in via features)
#[cfg(feature = "nats")]
pub mod nats;
