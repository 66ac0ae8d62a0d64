//! Carapace Core
//!
//! This crate contains the protocol-agnostic client building blocks:
//! - Server addressing (`endpoint`)
//! - Client options with environment overrides (`options`)
//! - Reconnect pacing (`reconnect`)
//! - Subject wildcard matching (`subject`)
//! - Per-subscription pending limits (`backpressure`)
//! - Deadline-aware I/O helpers (`timeout`) and TCP tuning (`tcp`)
//! - Lifecycle states and events (`state`, `monitor`)
//! - Error types (`error`)

#![cfg_attr(not(test), deny(unsafe_code))]
// Allow some pedantic lints that are intentional in this crate
#![allow(clippy::cast_possible_truncation)]
#![allow(clippy::cast_sign_loss)]
#![allow(clippy::items_after_statements)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::needless_pass_by_value)]
#![allow(clippy::match_same_arms)]
pub mod backpressure;
pub mod endpoint;
pub mod error;
pub mod monitor;
pub mod options;
pub mod reconnect;
pub mod state;
pub mod subject;
pub mod tcp;
pub mod timeout;

// Optional: a small prelude to make downstream crates ergonomic.
// Keep it minimal to avoid API lock-in.
pub mod prelude {
    pub use crate::backpressure::{Admission, PendingCounter, PendingLimits};
    pub use crate::endpoint::{Endpoint, EndpointError, Scheme, UrlAuth};
    pub use crate::error::{Error, ErrorClass, TransportError};
    pub use crate::monitor::{ConnectionEvent, ConnectionMonitor};
    pub use crate::options::{ConnectOptions, ReplyMode};
    pub use crate::reconnect::ReconnectState;
    pub use crate::state::ConnectionState;
}
