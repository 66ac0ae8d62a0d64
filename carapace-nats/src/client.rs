//! Public client handle.
//!
//! [`Client`] is cheap to clone; every clone talks to the same connection.
//! When the last clone is dropped the connection is closed in the
//! background.

use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use carapace_core::error::{Error, Result};
use carapace_core::monitor::ConnectionMonitor;
use carapace_core::options::ConnectOptions;
use carapace_core::state::ConnectionState;
use futures::FutureExt;
use rustls::ClientConfig;

use crate::callbacks::{ConnectionHandler, NoopHandler};
use crate::connection::Shared;
use crate::header::HeaderMap;
use crate::info::ServerInfo;
use crate::message::Message;
use crate::subscription::{Handler, SubscribeOptions, Subscription};

/// Closes the connection when the last [`Client`] clone goes away.
struct Owner(Arc<Shared>);

impl Drop for Owner {
    fn drop(&mut self) {
        self.0.close_detached();
    }
}

/// Connection to a broker cluster.
///
/// # Examples
///
/// ```rust,no_run
/// use carapace_nats::Client;
///
/// # async fn example() -> carapace_core::error::Result<()> {
/// let client = Client::connect("nats://127.0.0.1:4222").await?;
/// let sub = client.subscribe("greet.*")?;
/// client.publish("greet.joe", "hello")?;
/// client.flush().await?;
///
/// if let Some(msg) = sub.next().await {
///     println!("{}: {}", msg.subject, msg.text());
/// }
/// client.drain().await?;
/// # Ok(())
/// # }
/// ```
#[derive(Clone)]
pub struct Client {
    shared: Arc<Shared>,
    _owner: Arc<Owner>,
}

impl fmt::Debug for Client {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Client")
            .field("id", &self.shared.id)
            .field("state", &self.shared.state())
            .finish_non_exhaustive()
    }
}

/// Builder for clients that need a handler or a custom TLS setup.
pub struct ClientBuilder {
    options: ConnectOptions,
    tls: Option<Arc<ClientConfig>>,
    handler: Arc<dyn ConnectionHandler>,
}

impl ClientBuilder {
    pub fn new(options: ConnectOptions) -> Self {
        Self {
            options,
            tls: None,
            handler: Arc::new(NoopHandler),
        }
    }

    /// Use a prepared rustls configuration instead of building one from the
    /// TLS file options.
    pub fn tls_config(mut self, config: Arc<ClientConfig>) -> Self {
        self.tls = Some(config);
        self
    }

    pub fn handler(mut self, handler: impl ConnectionHandler) -> Self {
        self.handler = Arc::new(handler);
        self
    }

    /// Connect to the first reachable server of the pool.
    ///
    /// # Errors
    ///
    /// [`Error::NoServers`] when every configured server failed; the last
    /// failure is carried in the error.
    pub async fn connect(self) -> Result<Client> {
        let shared = Shared::connect(self.options, self.tls, self.handler).await?;
        Ok(Client {
            _owner: Arc::new(Owner(Arc::clone(&shared))),
            shared,
        })
    }
}

impl Client {
    /// Connect with default options to a comma separated server list.
    pub async fn connect(servers: &str) -> Result<Self> {
        let options = ConnectOptions::default().with_servers(servers.split(',').map(str::trim));
        Self::connect_with_options(options).await
    }

    pub async fn connect_with_options(options: ConnectOptions) -> Result<Self> {
        ClientBuilder::new(options).connect().await
    }

    pub fn builder(options: ConnectOptions) -> ClientBuilder {
        ClientBuilder::new(options)
    }

    pub fn options(&self) -> &ConnectOptions {
        &self.shared.options
    }

    // === Publish ===

    /// Queue a message for `subject`. Returns once it is buffered, not once
    /// it reached the broker; see [`Client::flush`].
    pub fn publish(&self, subject: &str, payload: impl AsRef<[u8]>) -> Result<()> {
        self.shared.publish(subject, None, None, payload.as_ref())
    }

    pub fn publish_with_reply(
        &self,
        subject: &str,
        reply: &str,
        payload: impl AsRef<[u8]>,
    ) -> Result<()> {
        self.shared
            .publish(subject, Some(reply), None, payload.as_ref())
    }

    pub fn publish_with_headers(
        &self,
        subject: &str,
        headers: &HeaderMap,
        payload: impl AsRef<[u8]>,
    ) -> Result<()> {
        self.shared
            .publish(subject, None, Some(headers), payload.as_ref())
    }

    // === Subscribe ===

    /// Subscribe in handle mode; pull messages with [`Subscription::next`].
    pub fn subscribe(&self, subject: &str) -> Result<Subscription> {
        self.shared
            .subscribe(subject, SubscribeOptions::default(), None)
    }

    /// Join queue group `queue`; the broker delivers each message to one
    /// member of the group.
    pub fn queue_subscribe(&self, subject: &str, queue: &str) -> Result<Subscription> {
        self.shared
            .subscribe(subject, SubscribeOptions::queue(queue), None)
    }

    pub fn subscribe_with(&self, subject: &str, options: SubscribeOptions) -> Result<Subscription> {
        self.shared.subscribe(subject, options, None)
    }

    /// Subscribe with an async handler run for each message, one at a time.
    ///
    /// ```rust,no_run
    /// # async fn example(client: carapace_nats::Client) -> carapace_core::error::Result<()> {
    /// use carapace_nats::SubscribeOptions;
    ///
    /// let _sub = client.subscribe_with_handler("jobs", SubscribeOptions::queue("workers"), |msg| async move {
    ///     println!("job {}", msg.text());
    /// })?;
    /// # Ok(())
    /// # }
    /// ```
    pub fn subscribe_with_handler<F, Fut>(
        &self,
        subject: &str,
        options: SubscribeOptions,
        handler: F,
    ) -> Result<Subscription>
    where
        F: Fn(Message) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let handler: Handler = Arc::new(move |msg| handler(msg).boxed());
        self.shared.subscribe(subject, options, Some(handler))
    }

    // === Request / reply ===

    /// Send a request and wait `request_timeout` for the first reply.
    pub async fn request(&self, subject: &str, payload: impl AsRef<[u8]>) -> Result<Message> {
        self.request_timeout(subject, payload, self.shared.options.request_timeout)
            .await
    }

    /// # Errors
    ///
    /// [`Error::NoResponders`] as soon as the broker reports nobody listens on
    /// `subject`, [`Error::Timeout`] when `timeout` elapses first.
    pub async fn request_timeout(
        &self,
        subject: &str,
        payload: impl AsRef<[u8]>,
        timeout: Duration,
    ) -> Result<Message> {
        let replies = self
            .shared
            .request(subject, None, payload.as_ref(), 1, timeout)
            .await?;
        replies.into_iter().next().ok_or(Error::Timeout)
    }

    pub async fn request_with_headers(
        &self,
        subject: &str,
        headers: &HeaderMap,
        payload: impl AsRef<[u8]>,
        timeout: Duration,
    ) -> Result<Message> {
        let replies = self
            .shared
            .request(subject, Some(headers), payload.as_ref(), 1, timeout)
            .await?;
        replies.into_iter().next().ok_or(Error::Timeout)
    }

    /// Collect up to `max` replies, returning early once `max` arrived.
    /// Replies received before the deadline are returned even if fewer than
    /// `max`.
    pub async fn request_many(
        &self,
        subject: &str,
        payload: impl AsRef<[u8]>,
        max: usize,
        timeout: Duration,
    ) -> Result<Vec<Message>> {
        if max == 0 {
            return Ok(Vec::new());
        }
        self.shared
            .request(subject, None, payload.as_ref(), max, timeout)
            .await
    }

    // === Lifecycle ===

    /// Round trip to the broker with `flush_timeout`.
    pub async fn flush(&self) -> Result<()> {
        self.shared.flush(self.shared.options.flush_timeout).await
    }

    pub async fn flush_timeout(&self, timeout: Duration) -> Result<()> {
        self.shared.flush(timeout).await
    }

    /// Stop taking new work, let in-flight messages and handlers finish,
    /// then close. Bounded by `drain_timeout`.
    pub async fn drain(&self) -> Result<()> {
        self.shared.drain().await
    }

    /// Close immediately. Buffered writes get `close_timeout` to go out.
    pub async fn close(&self) {
        self.shared.close(None).await;
    }

    pub fn state(&self) -> ConnectionState {
        self.shared.state()
    }

    pub fn is_closed(&self) -> bool {
        self.shared.state().is_terminal()
    }

    /// Wait until the connection reaches `state`.
    ///
    /// # Errors
    ///
    /// [`Error::Timeout`] if it does not within `timeout`,
    /// [`Error::ConnectionClosed`] if the client closes first.
    pub async fn wait_for_state(&self, state: ConnectionState, timeout: Duration) -> Result<()> {
        let mut rx = self.shared.state.subscribe();
        let wait = rx.wait_for(|s| *s == state || s.is_terminal());
        let reached = match tokio::time::timeout(timeout, wait).await {
            Ok(Ok(reached)) => *reached,
            Ok(Err(_)) => return Err(Error::ConnectionClosed),
            Err(_) => return Err(Error::Timeout),
        };
        if reached == state {
            Ok(())
        } else {
            Err(Error::ConnectionClosed)
        }
    }

    /// Receiver for lifecycle events emitted from now on.
    pub fn monitor(&self) -> ConnectionMonitor {
        self.shared.bus.monitor()
    }

    /// Latest INFO received from the broker.
    pub fn server_info(&self) -> ServerInfo {
        self.shared.server_info()
    }

    pub fn id(&self) -> u64 {
        self.shared.id
    }
}
