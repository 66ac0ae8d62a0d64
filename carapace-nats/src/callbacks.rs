//! Callback bus.
//!
//! Lifecycle notifications are queued to a dedicated task so a slow
//! application handler never stalls the read loop or the supervisor. The
//! same task fans every event out to the monitor channels.

use std::sync::Arc;

use carapace_core::endpoint::Endpoint;
use carapace_core::error::Error;
use carapace_core::monitor::{create_monitor, ConnectionEvent, ConnectionEventSender, ConnectionMonitor};
use parking_lot::Mutex;
use tracing::{debug, trace};

/// Application hooks for asynchronous connection events.
///
/// Every method has an empty default; implement only what you need. All
/// methods run on the callback task, never on the read loop.
///
/// ```rust
/// use carapace_nats::callbacks::ConnectionHandler;
/// use carapace_core::endpoint::Endpoint;
///
/// struct Log;
///
/// impl ConnectionHandler for Log {
///     fn on_reconnect(&self, endpoint: &Endpoint) {
///         println!("back on {endpoint}");
///     }
/// }
/// ```
pub trait ConnectionHandler: Send + Sync + 'static {
    /// An established connection was lost.
    fn on_disconnect(&self, _endpoint: &Endpoint, _error: &Error) {}

    /// A new connection is live and subscriptions were replayed.
    fn on_reconnect(&self, _endpoint: &Endpoint) {}

    /// The client reached CLOSED. Called exactly once.
    fn on_close(&self, _error: Option<&Error>) {}

    /// Asynchronous error that did not (by itself) close the client.
    fn on_error(&self, _error: &Error) {}

    /// The broker announced it is shutting down.
    fn on_lame_duck(&self, _endpoint: &Endpoint) {}
}

/// Handler used when the application registers none.
#[derive(Debug, Default)]
pub struct NoopHandler;

impl ConnectionHandler for NoopHandler {}

#[derive(Debug)]
pub(crate) enum Callback {
    Connected(Endpoint),
    ConnectFailed(Endpoint, String),
    Disconnected(Endpoint, Error),
    Reconnected(Endpoint),
    Error(Error),
    LameDuck(Endpoint),
    Discovered(Vec<Endpoint>),
    Closed(Option<Error>),
}

impl Callback {
    fn event(&self) -> ConnectionEvent {
        match self {
            Self::Connected(ep) => ConnectionEvent::Connected(ep.clone()),
            Self::ConnectFailed(ep, reason) => ConnectionEvent::ConnectFailed {
                endpoint: ep.clone(),
                reason: reason.clone(),
            },
            Self::Disconnected(ep, e) => ConnectionEvent::Disconnected {
                endpoint: ep.clone(),
                reason: e.to_string(),
            },
            Self::Reconnected(ep) => ConnectionEvent::Reconnected(ep.clone()),
            Self::Error(Error::SlowConsumer { sid, subject }) => ConnectionEvent::SlowConsumer {
                sid: *sid,
                subject: subject.clone(),
            },
            Self::Error(e) => ConnectionEvent::Error(e.to_string()),
            Self::LameDuck(ep) => ConnectionEvent::LameDuck(ep.clone()),
            Self::Discovered(eps) => ConnectionEvent::ServersDiscovered(eps.clone()),
            Self::Closed(e) => ConnectionEvent::Closed {
                reason: e.as_ref().map(ToString::to_string),
            },
        }
    }
}

/// Sending side of the bus, held by the engine.
#[derive(Debug, Clone)]
pub(crate) struct CallbackBus {
    tx: flume::Sender<Callback>,
    monitors: Arc<Mutex<Vec<ConnectionEventSender>>>,
}

impl CallbackBus {
    /// Start the callback task.
    pub(crate) fn spawn(handler: Arc<dyn ConnectionHandler>) -> Self {
        let (tx, rx) = flume::unbounded::<Callback>();
        let monitors: Arc<Mutex<Vec<ConnectionEventSender>>> = Arc::new(Mutex::new(Vec::new()));
        let task_monitors = Arc::clone(&monitors);

        tokio::spawn(async move {
            while let Ok(callback) = rx.recv_async().await {
                trace!("[Callbacks] {:?}", callback);
                let event = callback.event();
                task_monitors.lock().retain(|m| m.send(event.clone()).is_ok());

                let last = matches!(callback, Callback::Closed(_));
                match callback {
                    Callback::Disconnected(ep, e) => handler.on_disconnect(&ep, &e),
                    Callback::Reconnected(ep) => handler.on_reconnect(&ep),
                    Callback::Error(e) => handler.on_error(&e),
                    Callback::LameDuck(ep) => handler.on_lame_duck(&ep),
                    Callback::Closed(e) => handler.on_close(e.as_ref()),
                    Callback::Connected(_)
                    | Callback::ConnectFailed(..)
                    | Callback::Discovered(_) => {}
                }
                if last {
                    debug!("[Callbacks] Closed, callback task exiting");
                    task_monitors.lock().clear();
                    break;
                }
            }
        });

        Self { tx, monitors }
    }

    pub(crate) fn emit(&self, callback: Callback) {
        let _ = self.tx.send(callback);
    }

    /// New event receiver; only sees events emitted after this call.
    pub(crate) fn monitor(&self) -> ConnectionMonitor {
        let (tx, rx) = create_monitor();
        self.monitors.lock().push(tx);
        rx
    }
}
