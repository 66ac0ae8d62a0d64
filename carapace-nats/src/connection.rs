//! Connection engine.
//!
//! One [`Shared`] per client holds every piece of mutable state behind its
//! own lock; no code path holds two of them at once. Each live transport
//! runs three tasks tagged with a generation number:
//!
//! - **reader**: decodes frames and dispatches them
//! - **flusher**: sole owner of the write half, drains the outbound buffer
//! - **pinger**: keepalive, declares the link stale
//!
//! Any of them reports failure to the **supervisor** task, which tears the
//! generation down and runs the reconnect loop. Reports from an older
//! generation are ignored.
//!
//! Outbound bytes always go through one buffer. While connected the flusher
//! empties it; while disconnected it keeps growing up to
//! `reconnect_buffer_size` and is written out after subscriptions have been
//! replayed on the next link.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bytes::BytesMut;
use carapace_core::backpressure::PendingLimits;
use carapace_core::endpoint::{Endpoint, Scheme, UrlAuth};
use carapace_core::error::{Error, Result, TransportError};
use carapace_core::options::{ConnectOptions, ReplyMode};
use carapace_core::reconnect::ReconnectState;
use carapace_core::state::ConnectionState;
use carapace_core::subject;
use once_cell::sync::OnceCell;
use parking_lot::Mutex;
use rustls::ClientConfig;
use tokio::sync::{watch, Notify};
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, info, trace, warn};

use crate::callbacks::{Callback, CallbackBus, ConnectionHandler};
use crate::codec::{ClientOp, Decoder, MsgFrame, ServerOp};
use crate::header::HeaderMap;
use crate::info::{ConnectInfo, ServerInfo, LANG, PROTOCOL};
use crate::message::Message;
use crate::pool::ServerPool;
use crate::request::{new_inbox, token, Correlator, Inbox};
use crate::subscription::{spawn_handler, Delivery, Handler, Registry, Routed, SubState, SubscribeOptions, Subscription};
use crate::tls;
use crate::transport::{Transport, TransportReader, TransportWriter};

static NEXT_CLIENT_ID: AtomicU64 = AtomicU64::new(1);

/// Write side state, guarded by the outbound lock.
#[derive(Debug, Default)]
pub(crate) struct Outbound {
    buf: BytesMut,
    /// A flusher owns a live writer
    connected: bool,
    /// PINGs sitting in `buf`, not yet handed to a writer
    pings_in_buf: usize,
    /// One slot per PING in flight or buffered, oldest first. `None` for
    /// keepalive pings nobody waits on.
    waiters: VecDeque<Option<flume::Sender<()>>>,
    outstanding_pings: u32,
    /// Flusher should close the writer once `buf` is empty
    shutdown: bool,
}

/// Reports to the supervisor.
#[derive(Debug)]
pub(crate) enum Signal {
    Disconnect { generation: u64, error: Error },
    Close,
}

/// Everything a connect attempt produced, ready to go live.
struct Established {
    endpoint: Endpoint,
    reader: TransportReader,
    writer: TransportWriter,
    decoder: Decoder,
    buf: BytesMut,
    info: ServerInfo,
}

/// Tasks of one transport generation.
struct Link {
    generation: u64,
    endpoint: Endpoint,
    reader: JoinHandle<()>,
    flusher: JoinHandle<()>,
    pinger: JoinHandle<()>,
}

impl Link {
    /// Stop all tasks and wait until their futures are gone.
    async fn abort(&mut self) {
        self.reader.abort();
        self.flusher.abort();
        self.pinger.abort();
        let _ = (&mut self.reader).await;
        let _ = (&mut self.flusher).await;
        let _ = (&mut self.pinger).await;
    }

    /// Let the flusher push out what is buffered, then stop.
    async fn shutdown(mut self, shared: &Shared) {
        self.pinger.abort();
        self.reader.abort();
        shared.outbound.lock().shutdown = true;
        shared.wake_flusher.notify_one();
        if tokio::time::timeout(shared.options.close_timeout, &mut self.flusher)
            .await
            .is_err()
        {
            debug!("[Engine] Close timeout elapsed with data still buffered");
            self.flusher.abort();
            let _ = self.flusher.await;
        }
        let _ = self.reader.await;
        let _ = self.pinger.await;
    }
}

enum ReconnectStop {
    Closed,
    Exhausted(Error),
}

/// Where replies to a request are read from.
enum ReplySource<'a> {
    Inbox(&'a flume::Receiver<Message>),
    Subscription(&'a Subscription),
}

impl ReplySource<'_> {
    async fn next(&self) -> Option<Message> {
        match self {
            Self::Inbox(rx) => rx.recv_async().await.ok(),
            Self::Subscription(sub) => sub.next().await,
        }
    }
}

/// State shared by the client handles and the engine tasks.
pub(crate) struct Shared {
    pub(crate) id: u64,
    pub(crate) options: ConnectOptions,
    tls: OnceCell<Arc<ClientConfig>>,
    pub(crate) state: watch::Sender<ConnectionState>,
    outbound: Mutex<Outbound>,
    wake_flusher: Notify,
    pub(crate) subs: Mutex<Registry>,
    info: Mutex<ServerInfo>,
    pool: Mutex<ServerPool>,
    correlator: Correlator,
    pub(crate) bus: CallbackBus,
    signals: flume::Sender<Signal>,
    supervisor: Mutex<Option<JoinHandle<()>>>,
    closing: AtomicBool,
    close_fired: AtomicBool,
    #[cfg(unix)]
    pub(crate) pid: u32,
}

impl Shared {
    /// Build the client state and make the initial connection.
    ///
    /// Every pool entry is tried once; the first success wins.
    pub(crate) async fn connect(
        options: ConnectOptions,
        tls_config: Option<Arc<ClientConfig>>,
        handler: Arc<dyn ConnectionHandler>,
    ) -> Result<Arc<Self>> {
        options.validate()?;
        let pool = ServerPool::new(&options)?;
        let attempts = pool.len();
        let (signals_tx, signals_rx) = flume::unbounded();
        let tls = OnceCell::new();
        if let Some(config) = tls_config {
            let _ = tls.set(config);
        }

        let shared = Arc::new(Self {
            id: NEXT_CLIENT_ID.fetch_add(1, Ordering::Relaxed),
            tls,
            state: watch::channel(ConnectionState::Disconnected).0,
            outbound: Mutex::new(Outbound::default()),
            wake_flusher: Notify::new(),
            subs: Mutex::new(Registry::new()),
            info: Mutex::new(ServerInfo::default()),
            pool: Mutex::new(pool),
            correlator: Correlator::new(),
            bus: CallbackBus::spawn(handler),
            signals: signals_tx,
            supervisor: Mutex::new(None),
            closing: AtomicBool::new(false),
            close_fired: AtomicBool::new(false),
            #[cfg(unix)]
            pid: std::process::id(),
            options,
        });
        shared.transition(ConnectionState::Connecting);

        let pacing = ReconnectState::new(&shared.options);
        let mut last_error: Option<String> = None;
        for _ in 0..attempts {
            let next = shared.pool.lock().next(&pacing);
            let Some((endpoint, _)) = next else {
                break;
            };
            match shared.establish(&endpoint).await {
                Ok(established) => {
                    shared.pool.lock().mark_result(&endpoint, Ok(()));
                    info!("[Engine] Connected to {}", endpoint);
                    let link = shared.go_live(established, 1);
                    shared.bus.emit(Callback::Connected(endpoint));
                    let handle = tokio::spawn(supervise(Arc::clone(&shared), signals_rx, link));
                    *shared.supervisor.lock() = Some(handle);
                    #[cfg(unix)]
                    crate::registry::register(&shared);
                    return Ok(shared);
                }
                Err(e) => {
                    warn!("[Engine] Connect to {} failed: {}", endpoint, e);
                    let reason = e.to_string();
                    shared.pool.lock().mark_result(&endpoint, Err(reason.clone()));
                    shared.bus.emit(Callback::ConnectFailed(endpoint, reason.clone()));
                    last_error = Some(reason);
                }
            }
        }

        shared.closing.store(true, Ordering::SeqCst);
        shared.close_fired.store(true, Ordering::SeqCst);
        shared.transition(ConnectionState::Closed);
        Err(Error::NoServers { last: last_error })
    }

    pub(crate) fn state(&self) -> ConnectionState {
        *self.state.borrow()
    }

    /// Move to `next` if the lifecycle allows it from the current state.
    fn transition(&self, next: ConnectionState) -> bool {
        self.state.send_if_modified(|s| {
            if s.can_transition_to(next) {
                trace!("[Engine] {} -> {}", s, next);
                *s = next;
                true
            } else {
                false
            }
        })
    }

    pub(crate) fn server_info(&self) -> ServerInfo {
        self.info.lock().clone()
    }

    fn tls_config(&self) -> Result<Arc<ClientConfig>> {
        self.tls
            .get_or_try_init(|| {
                tls::client_config(&self.options).map_err(|e| Error::Tls(e.to_string()))
            })
            .cloned()
    }

    // === Connect ===

    async fn establish(&self, endpoint: &Endpoint) -> Result<Established> {
        let after = self.options.connect_timeout;
        match tokio::time::timeout(after, self.handshake(endpoint)).await {
            Ok(result) => result,
            Err(_) => Err(Error::ConnectTimeout {
                endpoint: endpoint.to_string(),
                after,
            }),
        }
    }

    async fn handshake(&self, endpoint: &Endpoint) -> Result<Established> {
        let connect_err = |source: TransportError| Error::Connect {
            endpoint: endpoint.to_string(),
            source,
        };

        let wss_config = if endpoint.scheme == Scheme::Wss {
            Some(self.tls_config()?)
        } else {
            None
        };
        let mut transport = Transport::connect(endpoint, wss_config.as_ref(), None)
            .await
            .map_err(connect_err)?;
        transport.handshake_websocket(None).await.map_err(connect_err)?;

        let mut decoder = Decoder::new();
        let mut buf = BytesMut::with_capacity(self.options.read_buffer_size);
        let mut info = match self.read_op(&mut transport, &mut decoder, &mut buf).await? {
            ServerOp::Info(info) => *info,
            other => {
                return Err(Error::handshake(format!(
                    "expected INFO, got {}",
                    other.verb()
                )))
            }
        };
        trace!("[Engine] INFO from {}: {:?}", endpoint, info);

        let wants_tls =
            endpoint.scheme.requires_tls() || self.options.tls_required || info.requires_tls();
        if wants_tls && !transport.is_tls() {
            if endpoint.is_websocket() {
                return Err(Error::Tls(format!("{endpoint} requires TLS, use wss://")));
            }
            if !info.supports_tls() {
                return Err(Error::Tls(format!("{endpoint} does not offer TLS")));
            }
            let config = self.tls_config()?;
            transport
                .upgrade_tls(config, None)
                .await
                .map_err(|e| Error::Tls(e.to_string()))?;
            buf.clear();
        }

        let connect = self.connect_info(endpoint, transport.is_tls());
        let mut hello = BytesMut::new();
        ClientOp::Connect(&connect).encode(&mut hello);
        ClientOp::Ping.encode(&mut hello);
        transport.write(&hello, None).await.map_err(connect_err)?;

        loop {
            match self.read_op(&mut transport, &mut decoder, &mut buf).await? {
                ServerOp::Pong => break,
                ServerOp::Ok => {}
                ServerOp::Info(update) => info = *update,
                ServerOp::Ping => {
                    let mut pong = BytesMut::new();
                    ClientOp::Pong.encode(&mut pong);
                    transport.write(&pong, None).await.map_err(connect_err)?;
                }
                ServerOp::Err(text) => {
                    return Err(match Error::from_server_text(&text) {
                        e @ Error::Authorization(_) => e,
                        other => Error::handshake(other.to_string()),
                    })
                }
                other => {
                    return Err(Error::handshake(format!(
                        "unexpected {} during handshake",
                        other.verb()
                    )))
                }
            }
        }

        let (reader, writer) = transport.split();
        Ok(Established {
            endpoint: endpoint.clone(),
            reader,
            writer,
            decoder,
            buf,
            info,
        })
    }

    async fn read_op(
        &self,
        transport: &mut Transport,
        decoder: &mut Decoder,
        buf: &mut BytesMut,
    ) -> Result<ServerOp> {
        loop {
            if let Some(op) = decoder.decode(buf) {
                if let ServerOp::Unknown(raw) = &op {
                    return Err(Error::protocol(format!(
                        "unexpected data during handshake: {:?}",
                        String::from_utf8_lossy(&raw[..raw.len().min(64)])
                    )));
                }
                return Ok(op);
            }
            transport
                .read(buf, self.options.read_buffer_size, None)
                .await
                .map_err(|source| Error::Connect {
                    endpoint: transport.endpoint().to_string(),
                    source,
                })?;
        }
    }

    fn connect_info(&self, endpoint: &Endpoint, tls: bool) -> ConnectInfo {
        let opts = &self.options;
        let (user, pass, auth_token) = match &endpoint.auth {
            Some(UrlAuth::UserPassword { user, password }) => {
                (Some(user.clone()), Some(password.clone()), None)
            }
            Some(UrlAuth::Token(token)) => (None, None, Some(token.clone())),
            None => (opts.user.clone(), opts.password.clone(), opts.token.clone()),
        };
        ConnectInfo {
            verbose: opts.verbose,
            pedantic: opts.pedantic,
            tls_required: tls,
            name: opts.name.clone(),
            lang: LANG.to_string(),
            version: env!("CARGO_PKG_VERSION").to_string(),
            protocol: PROTOCOL,
            echo: !opts.no_echo,
            headers: opts.headers,
            no_responders: opts.headers && opts.no_responders,
            user,
            pass,
            auth_token,
        }
    }

    /// Install a freshly established transport and start its tasks.
    fn go_live(self: &Arc<Self>, established: Established, generation: u64) -> Link {
        let Established {
            endpoint,
            reader,
            writer,
            decoder,
            buf,
            info,
        } = established;

        let mut replay = BytesMut::new();
        {
            let mut subs = self.subs.lock();
            subs.replay(&mut replay);
            subs.live = true;
        }
        {
            let mut out = self.outbound.lock();
            replay.extend_from_slice(&out.buf);
            out.buf = replay;
            out.connected = true;
            out.outstanding_pings = 0;
            out.shutdown = false;
        }
        self.transition(ConnectionState::Connected);

        let reader = tokio::spawn(run_reader(
            Arc::clone(self),
            reader,
            decoder,
            buf,
            generation,
            endpoint.clone(),
        ));
        let flusher = tokio::spawn(run_flusher(Arc::clone(self), writer, generation));
        let pinger = tokio::spawn(run_pinger(Arc::clone(self), generation));
        self.wake_flusher.notify_one();

        self.apply_info(info, &endpoint);
        Link {
            generation,
            endpoint,
            reader,
            flusher,
            pinger,
        }
    }

    fn mark_disconnected(&self) {
        self.subs.lock().live = false;
        let mut out = self.outbound.lock();
        out.connected = false;
        out.outstanding_pings = 0;
        // PINGs already written will never be answered.
        let in_flight = out.waiters.len().saturating_sub(out.pings_in_buf);
        out.waiters.drain(..in_flight);
    }

    async fn reconnect(
        self: &Arc<Self>,
        signals: &flume::Receiver<Signal>,
        generation: u64,
    ) -> std::result::Result<Link, ReconnectStop> {
        let mut pacing = ReconnectState::new(&self.options);
        loop {
            let next = self.pool.lock().next(&pacing);
            let Some((endpoint, delay)) = next else {
                let last = self.pool.lock().last_error();
                return Err(ReconnectStop::Exhausted(Error::NoServers { last }));
            };
            let attempt = pacing.record_attempt();
            debug!(
                "[Engine] Reconnect attempt {} to {} in {:?}",
                attempt, endpoint, delay
            );

            let result = tokio::select! {
                result = async {
                    tokio::time::sleep(delay).await;
                    self.establish(&endpoint).await
                } => result,
                () = wait_for_close(signals) => return Err(ReconnectStop::Closed),
            };
            if self.state().is_terminal() {
                return Err(ReconnectStop::Closed);
            }

            match result {
                Ok(established) => {
                    self.pool.lock().mark_result(&endpoint, Ok(()));
                    info!("[Engine] Reconnected to {}", endpoint);
                    return Ok(self.go_live(established, generation));
                }
                Err(e) => {
                    warn!("[Engine] Reconnect to {} failed: {}", endpoint, e);
                    let reason = e.to_string();
                    self.pool.lock().mark_result(&endpoint, Err(reason.clone()));
                    self.bus.emit(Callback::ConnectFailed(endpoint, reason));
                }
            }
        }
    }

    fn signal_disconnect(&self, generation: u64, error: Error) {
        let _ = self.signals.send(Signal::Disconnect { generation, error });
    }

    // === Inbound ===

    fn handle_op(&self, op: ServerOp, endpoint: &Endpoint) -> Result<()> {
        match op {
            ServerOp::Msg(frame) => self.dispatch(frame),
            ServerOp::Ping => {
                self.enqueue(ClientOp::Pong)?;
            }
            ServerOp::Pong => {
                let waiter = {
                    let mut out = self.outbound.lock();
                    out.outstanding_pings = 0;
                    out.waiters.pop_front().flatten()
                };
                if let Some(tx) = waiter {
                    let _ = tx.send(());
                }
            }
            ServerOp::Info(info) => self.apply_info(*info, endpoint),
            ServerOp::Ok => trace!("[Engine] +OK"),
            ServerOp::Err(text) => {
                let error = Error::from_server_text(&text);
                if !error.is_connection_error() {
                    warn!("[Engine] Server error: {}", error);
                    self.bus.emit(Callback::Error(error));
                    return Ok(());
                }
                return Err(error);
            }
            ServerOp::Unknown(raw) => {
                return Err(Error::protocol(format!(
                    "unknown frame {:?}",
                    String::from_utf8_lossy(&raw[..raw.len().min(64)])
                )));
            }
        }
        Ok(())
    }

    fn dispatch(&self, frame: MsgFrame) {
        let msg = Message::from_frame(frame);
        let routed = self.subs.lock().route(msg);
        match routed {
            Routed::Delivered => {}
            Routed::Inbox(msg) => self.correlator.resolve(msg),
            Routed::SlowConsumer { sid, subject } => {
                warn!("[Dispatcher] Slow consumer on sid {} ({})", sid, subject);
                self.bus.emit(Callback::Error(Error::SlowConsumer { sid, subject }));
            }
            Routed::NoSubscription => trace!("[Dispatcher] Message for unknown sid"),
        }
    }

    fn apply_info(&self, info: ServerInfo, current: &Endpoint) {
        let urls: Vec<String> = if current.is_websocket() {
            info.ws_connect_urls.clone()
        } else {
            info.connect_urls.clone()
        };
        let lame_duck = info.lame_duck_mode;
        *self.info.lock() = info;

        let discovered: Vec<Endpoint> = urls
            .iter()
            .filter_map(|url| {
                let mut endpoint = Endpoint::parse(url).ok()?;
                if !url.contains("://") {
                    endpoint.scheme = current.scheme;
                }
                Some(endpoint)
            })
            .collect();
        if !discovered.is_empty() {
            let added = self.pool.lock().add_discovered(discovered);
            if !added.is_empty() {
                self.bus.emit(Callback::Discovered(added));
            }
        }
        if lame_duck {
            info!("[Engine] {} entered lame duck mode", current);
            self.bus.emit(Callback::LameDuck(current.clone()));
        }
    }

    // === Outbound ===

    fn enqueue(&self, op: ClientOp<'_>) -> Result<()> {
        {
            let mut out = self.outbound.lock();
            let before = out.buf.len();
            op.encode(&mut out.buf);
            if !out.connected && out.buf.len() > self.options.reconnect_buffer_size {
                out.buf.truncate(before);
                return Err(Error::ReconnectBufferExceeded {
                    limit: self.options.reconnect_buffer_size,
                });
            }
        }
        self.wake_flusher.notify_one();
        Ok(())
    }

    fn check_publish(&self) -> Result<()> {
        match self.state() {
            s if s.accepts_publish() => Ok(()),
            ConnectionState::Draining => Err(Error::ConnectionDraining),
            _ => Err(Error::ConnectionClosed),
        }
    }

    pub(crate) fn publish(
        &self,
        subject: &str,
        reply: Option<&str>,
        headers: Option<&HeaderMap>,
        payload: &[u8],
    ) -> Result<()> {
        self.check_publish()?;
        if !subject::is_valid(subject, false) {
            return Err(Error::InvalidSubject(subject.to_string()));
        }
        let size = payload.len() + headers.map_or(0, HeaderMap::encoded_len);
        let max = self.info.lock().max_payload;
        if max > 0 && size > max {
            return Err(Error::MaxPayload { size, max });
        }
        self.enqueue(ClientOp::Pub {
            subject,
            reply,
            headers,
            payload,
        })
    }

    /// Wait for a PONG proving the broker processed everything sent so far.
    pub(crate) async fn flush(&self, timeout: Duration) -> Result<()> {
        let deadline = Instant::now() + timeout;
        let mut state_rx = self.state.subscribe();
        loop {
            if state_rx.borrow_and_update().is_terminal() {
                return Err(Error::ConnectionClosed);
            }
            let waiter = {
                let mut out = self.outbound.lock();
                if out.connected {
                    let (tx, rx) = flume::bounded(1);
                    ClientOp::Ping.encode(&mut out.buf);
                    out.pings_in_buf += 1;
                    out.waiters.push_back(Some(tx));
                    Some(rx)
                } else {
                    None
                }
            };

            match waiter {
                Some(rx) => {
                    self.wake_flusher.notify_one();
                    match tokio::time::timeout_at(deadline, rx.recv_async()).await {
                        Ok(Ok(())) => return Ok(()),
                        // Link dropped before the PONG; try again on the next one.
                        Ok(Err(_)) => continue,
                        Err(_) => return Err(Error::FlushTimeout(timeout)),
                    }
                }
                None => match tokio::time::timeout_at(deadline, state_rx.changed()).await {
                    Ok(Ok(())) => continue,
                    Ok(Err(_)) => return Err(Error::ConnectionClosed),
                    Err(_) => return Err(Error::FlushTimeout(timeout)),
                },
            }
        }
    }

    // === Subscriptions ===

    pub(crate) fn subscribe(
        self: &Arc<Self>,
        subject: &str,
        options: SubscribeOptions,
        handler: Option<Handler>,
    ) -> Result<Subscription> {
        match self.state() {
            ConnectionState::Closed => return Err(Error::ConnectionClosed),
            ConnectionState::Draining => return Err(Error::ConnectionDraining),
            _ => {}
        }
        if !subject::is_valid(subject, true) {
            return Err(Error::InvalidSubject(subject.to_string()));
        }
        let queue = options.queue.as_deref();
        if let Some(q) = queue {
            if !subject::is_valid_queue(q) {
                return Err(Error::InvalidSubject(q.to_string()));
            }
        }
        let limits = options.limits.unwrap_or(PendingLimits::new(
            self.options.pending_msgs_limit,
            self.options.pending_bytes_limit,
        ));

        let (tx, rx) = flume::unbounded();
        let (sid, state, live) = {
            let mut subs = self.subs.lock();
            let (sid, state) = subs.insert(subject, queue, Delivery::Queue(tx), limits);
            (sid, state, subs.live)
        };
        if live {
            if let Err(e) = self.enqueue(ClientOp::Sub { subject, queue, sid }) {
                self.subs.lock().remove(sid);
                return Err(e);
            }
        }
        debug!("[Dispatcher] sid {} subscribed to {}", sid, subject);

        let receiver = match handler {
            Some(handler) => {
                spawn_handler(rx, Arc::clone(&state), handler);
                None
            }
            None => Some(rx),
        };
        Ok(Subscription::new(
            sid,
            subject.to_string(),
            options.queue,
            receiver,
            state,
            Arc::clone(self),
        ))
    }

    pub(crate) fn unsubscribe(&self, sid: u64, max: Option<u64>) -> Result<()> {
        let live = {
            let mut subs = self.subs.lock();
            match max {
                None => {
                    if !subs.remove(sid) {
                        return Err(Error::InvalidSubscription(sid));
                    }
                }
                Some(max) => {
                    subs.set_max(sid, max)?;
                }
            }
            subs.live
        };
        if live {
            self.enqueue(ClientOp::Unsub { sid, max })?;
        }
        Ok(())
    }

    pub(crate) async fn drain_subscription(&self, sid: u64, state: &SubState) -> Result<()> {
        let timeout = self.options.drain_timeout;
        let work = async {
            let live = {
                let subs = self.subs.lock();
                subs.contains(sid).then_some(subs.live)
            };
            if let Some(live) = live {
                if live {
                    self.enqueue(ClientOp::Unsub { sid, max: None })?;
                }
                self.flush(timeout).await?;
                self.subs.lock().remove(sid);
            }
            state.wait_idle().await;
            Ok(())
        };
        match tokio::time::timeout(timeout, work).await {
            Ok(result) => result,
            Err(_) => Err(Error::DrainTimeout(timeout)),
        }
    }

    // === Requests ===

    fn create_inbox(&self) -> Result<Inbox> {
        let prefix = format!("{}.{}.", self.options.inbox_prefix, token());
        let subject = format!("{prefix}*");
        let (sid, live) = {
            let mut subs = self.subs.lock();
            let (sid, _) = subs.insert(&subject, None, Delivery::Inbox, PendingLimits::unlimited());
            (sid, subs.live)
        };
        if live {
            self.enqueue(ClientOp::Sub {
                subject: &subject,
                queue: None,
                sid,
            })?;
        }
        debug!("[Correlator] Inbox {} on sid {}", subject, sid);
        Ok(Inbox { prefix, sid })
    }

    /// Publish a request and collect up to `max` replies before `timeout`.
    pub(crate) async fn request(
        self: &Arc<Self>,
        subject: &str,
        headers: Option<&HeaderMap>,
        payload: &[u8],
        max: usize,
        timeout: Duration,
    ) -> Result<Vec<Message>> {
        self.check_publish()?;
        let deadline = Instant::now() + timeout;
        match self.options.reply_mode {
            ReplyMode::Multiplexed => {
                let inbox = self.correlator.inbox(|| self.create_inbox())?;
                let (reply, rx, _guard) = self.correlator.register(inbox, max);
                self.publish(subject, Some(&reply), headers, payload)?;
                self.collect(ReplySource::Inbox(&rx), max, deadline).await
            }
            ReplyMode::Legacy => {
                let inbox = new_inbox(&self.options.inbox_prefix);
                let sub = self.subscribe(
                    &inbox,
                    SubscribeOptions {
                        queue: None,
                        limits: Some(PendingLimits::unlimited()),
                    },
                    None,
                )?;
                self.unsubscribe(sub.sid(), Some(max as u64))?;
                self.publish(subject, Some(&inbox), headers, payload)?;
                self.collect(ReplySource::Subscription(&sub), max, deadline)
                    .await
            }
        }
    }

    async fn collect(
        &self,
        source: ReplySource<'_>,
        max: usize,
        deadline: Instant,
    ) -> Result<Vec<Message>> {
        let mut replies = Vec::new();
        while replies.len() < max {
            match tokio::time::timeout_at(deadline, source.next()).await {
                Ok(Some(msg)) if msg.is_no_responders() => {
                    if replies.is_empty() {
                        return Err(Error::NoResponders);
                    }
                    break;
                }
                Ok(Some(msg)) => replies.push(msg),
                Ok(None) => {
                    if replies.is_empty() {
                        return Err(if self.state().is_terminal() {
                            Error::ConnectionClosed
                        } else {
                            Error::Timeout
                        });
                    }
                    break;
                }
                Err(_) => {
                    if replies.is_empty() {
                        return Err(Error::Timeout);
                    }
                    break;
                }
            }
        }
        Ok(replies)
    }

    // === Drain / close ===

    pub(crate) async fn drain(self: &Arc<Self>) -> Result<()> {
        if !self.transition(ConnectionState::Draining) {
            return Err(match self.state() {
                ConnectionState::Draining => Error::ConnectionDraining,
                _ => Error::ConnectionClosed,
            });
        }

        let timeout = self.options.drain_timeout;
        info!("[Engine] Draining (timeout {:?})", timeout);
        match tokio::time::timeout(timeout, self.drain_all(timeout)).await {
            Ok(Ok(())) => {
                self.close(None).await;
                Ok(())
            }
            Ok(Err(e)) => {
                warn!("[Engine] Drain failed: {}", e);
                self.close(Some(Error::Disconnected(e.to_string()))).await;
                Err(e)
            }
            Err(_) => {
                warn!("[Engine] Drain timed out after {:?}", timeout);
                self.bus.emit(Callback::Error(Error::DrainTimeout(timeout)));
                self.close(Some(Error::DrainTimeout(timeout))).await;
                Err(Error::DrainTimeout(timeout))
            }
        }
    }

    async fn drain_all(&self, timeout: Duration) -> Result<()> {
        let (subs, live) = {
            let registry = self.subs.lock();
            (registry.user_subscriptions(), registry.live)
        };
        if live {
            for (sid, _) in &subs {
                self.enqueue(ClientOp::Unsub { sid: *sid, max: None })?;
            }
        }
        self.flush(timeout).await?;
        {
            let mut registry = self.subs.lock();
            for (sid, _) in &subs {
                registry.remove(*sid);
            }
        }
        for (sid, state) in &subs {
            trace!("[Engine] Waiting for sid {} to go idle", sid);
            state.wait_idle().await;
        }

        self.correlator.wait_idle().await;
        if let Some(sid) = self.correlator.inbox_sid() {
            let live = {
                let mut registry = self.subs.lock();
                registry.remove(sid);
                registry.live
            };
            if live {
                self.enqueue(ClientOp::Unsub { sid, max: None })?;
            }
        }
        self.flush(timeout).await
    }

    /// Close the client. Buffered writes get `close_timeout` to go out.
    pub(crate) async fn close(&self, reason: Option<Error>) {
        if self.closing.swap(true, Ordering::SeqCst) {
            let mut state_rx = self.state.subscribe();
            let _ = state_rx.wait_for(|s| s.is_terminal()).await;
            return;
        }
        self.transition(ConnectionState::Closed);
        let _ = self.signals.send(Signal::Close);
        let handle = self.supervisor.lock().take();
        if let Some(handle) = handle {
            let _ = handle.await;
        }
        self.finish_close(reason);
    }

    /// Close from a context that cannot wait (last handle dropped).
    pub(crate) fn close_detached(self: &Arc<Self>) {
        if self.closing.load(Ordering::SeqCst) {
            return;
        }
        if let Ok(runtime) = tokio::runtime::Handle::try_current() {
            let shared = Arc::clone(self);
            runtime.spawn(async move { shared.close(None).await });
        }
    }

    /// Terminal bookkeeping. The close callback fires at most once.
    fn finish_close(&self, reason: Option<Error>) {
        self.closing.store(true, Ordering::SeqCst);
        self.transition(ConnectionState::Closed);
        self.subs.lock().clear();
        self.correlator.fail_all();
        {
            let mut out = self.outbound.lock();
            out.connected = false;
            out.buf.clear();
            out.pings_in_buf = 0;
            out.waiters.clear();
        }
        #[cfg(unix)]
        crate::registry::deregister(self.id);
        if !self.close_fired.swap(true, Ordering::SeqCst) {
            info!("[Engine] Closed");
            self.bus.emit(Callback::Closed(reason));
        }
    }

    /// Mark closed after a fork without touching sockets or callbacks.
    #[cfg(unix)]
    pub(crate) fn invalidate_after_fork(&self) {
        self.closing.store(true, Ordering::SeqCst);
        self.close_fired.store(true, Ordering::SeqCst);
        self.transition(ConnectionState::Closed);
        self.subs.lock().clear();
        self.correlator.fail_all();
        let mut out = self.outbound.lock();
        out.connected = false;
        out.buf.clear();
        out.waiters.clear();
    }
}

async fn wait_for_close(signals: &flume::Receiver<Signal>) {
    loop {
        match signals.recv_async().await {
            Ok(Signal::Close) | Err(_) => return,
            Ok(Signal::Disconnect { generation, .. }) => {
                trace!("[Engine] Ignoring stale disconnect from generation {}", generation);
            }
        }
    }
}

async fn supervise(shared: Arc<Shared>, signals: flume::Receiver<Signal>, mut link: Link) {
    loop {
        let signal = signals.recv_async().await.unwrap_or(Signal::Close);
        match signal {
            Signal::Close => {
                debug!("[Engine] Supervisor shutting down");
                link.shutdown(&shared).await;
                return;
            }
            Signal::Disconnect { generation, error } => {
                if generation != link.generation {
                    continue;
                }
                link.abort().await;
                shared.mark_disconnected();
                let endpoint = link.endpoint.clone();
                if error.is_recoverable() {
                    info!("[Engine] Connection to {} lost: {}", endpoint, error);
                } else {
                    warn!("[Engine] Connection to {} lost: {}", endpoint, error);
                }

                if shared.state().is_terminal() {
                    return;
                }
                if !shared.options.reconnect {
                    let reason = Error::Disconnected(error.to_string());
                    shared.bus.emit(Callback::Disconnected(endpoint, error));
                    shared.finish_close(Some(reason));
                    return;
                }

                shared.transition(ConnectionState::Reconnecting);
                shared.bus.emit(Callback::Disconnected(endpoint, error));

                match shared.reconnect(&signals, generation + 1).await {
                    Ok(next) => {
                        shared.bus.emit(Callback::Reconnected(next.endpoint.clone()));
                        link = next;
                    }
                    Err(ReconnectStop::Closed) => return,
                    Err(ReconnectStop::Exhausted(e)) => {
                        warn!("[Engine] Giving up: {}", e);
                        shared.finish_close(Some(e));
                        return;
                    }
                }
            }
        }
    }
}

async fn run_reader(
    shared: Arc<Shared>,
    mut reader: TransportReader,
    mut decoder: Decoder,
    mut buf: BytesMut,
    generation: u64,
    endpoint: Endpoint,
) {
    let max = shared.options.read_buffer_size;
    let error = 'read: loop {
        while let Some(op) = decoder.decode(&mut buf) {
            if let Err(e) = shared.handle_op(op, &endpoint) {
                break 'read e;
            }
        }
        if let Err(e) = reader.read(&mut buf, max, None).await {
            break 'read Error::Transport(e);
        }
    };
    debug!("[Engine] Reader for generation {} stopped: {}", generation, error);
    shared.signal_disconnect(generation, error);
}

/// A chunk taken out of the outbound buffer. Put back in front of the
/// buffer unless the write completed, including when the flusher task is
/// aborted mid-write.
struct InFlight<'a> {
    outbound: &'a Mutex<Outbound>,
    chunk: Option<BytesMut>,
    pings: usize,
}

impl InFlight<'_> {
    fn bytes(&self) -> &[u8] {
        self.chunk.as_deref().unwrap_or_default()
    }

    fn complete(mut self) {
        self.chunk = None;
    }
}

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        if let Some(mut chunk) = self.chunk.take() {
            let mut out = self.outbound.lock();
            chunk.extend_from_slice(&out.buf);
            out.buf = chunk;
            out.pings_in_buf += self.pings;
        }
    }
}

async fn run_flusher(shared: Arc<Shared>, mut writer: TransportWriter, generation: u64) {
    loop {
        let (chunk, pings, shutdown) = {
            let mut out = shared.outbound.lock();
            let pings = std::mem::take(&mut out.pings_in_buf);
            (out.buf.split(), pings, out.shutdown)
        };
        if chunk.is_empty() {
            if shutdown {
                writer.close().await;
                return;
            }
            shared.wake_flusher.notified().await;
            continue;
        }

        trace!("[Engine] Writing {} bytes", chunk.len());
        let in_flight = InFlight {
            outbound: &shared.outbound,
            chunk: Some(chunk),
            pings,
        };
        let result = writer
            .write(in_flight.bytes(), Some(shared.options.write_timeout))
            .await;
        match result {
            Ok(()) => in_flight.complete(),
            Err(e) => {
                drop(in_flight);
                shared.signal_disconnect(generation, Error::Transport(e));
                return;
            }
        }
    }
}

async fn run_pinger(shared: Arc<Shared>, generation: u64) {
    let period = shared.options.ping_interval;
    let mut ticker = tokio::time::interval_at(Instant::now() + period, period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    loop {
        ticker.tick().await;
        let stale = {
            let mut out = shared.outbound.lock();
            if out.outstanding_pings >= shared.options.max_outstanding_pings {
                true
            } else {
                out.outstanding_pings += 1;
                ClientOp::Ping.encode(&mut out.buf);
                out.pings_in_buf += 1;
                out.waiters.push_back(None);
                false
            }
        };
        if stale {
            shared.signal_disconnect(generation, Error::StaleConnection);
            return;
        }
        shared.wake_flusher.notify_one();
    }
}
