//! Client configuration options
//!
//! Options resolve in three layers: built-in defaults, then process
//! environment variables (`NATS_*`), then values set at the call site with
//! the `with_*` builders.
//!
//! ```
//! use carapace_core::options::ConnectOptions;
//! use std::time::Duration;
//!
//! # fn main() -> Result<(), carapace_core::options::OptionsError> {
//! let opts = ConnectOptions::from_env()?
//!     .with_servers(["nats://127.0.0.1:4222"])
//!     .with_ping_interval(Duration::from_secs(30));
//! # Ok(())
//! # }
//! ```

use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

/// Prefix shared by every recognized environment variable.
pub const ENV_PREFIX: &str = "NATS_";

/// How request replies are routed back to the caller.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ReplyMode {
    /// One wildcard inbox subscription per connection; replies demultiplexed
    /// by subject suffix.
    #[default]
    Multiplexed,
    /// A fresh inbox subscription per request.
    Legacy,
}

impl FromStr for ReplyMode {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "multiplexed" | "mux" => Ok(Self::Multiplexed),
            "legacy" | "old" => Ok(Self::Legacy),
            _ => Err(()),
        }
    }
}

/// Client connection options.
///
/// # Examples
///
/// ```
/// use carapace_core::options::{ConnectOptions, ReplyMode};
/// use std::time::Duration;
///
/// let opts = ConnectOptions::default()
///     .with_servers(["nats://a:4222", "nats://b:4222"])
///     .with_reconnect_time_wait(Duration::from_millis(250))
///     .with_reply_mode(ReplyMode::Legacy);
/// assert_eq!(opts.servers.len(), 2);
/// ```
#[derive(Debug, Clone)]
pub struct ConnectOptions {
    /// Server URLs, tried in order (after shuffling unless
    /// `dont_randomize_servers`).
    /// - Default: `nats://127.0.0.1:4222`
    pub servers: Vec<String>,

    /// Client name reported in CONNECT.
    pub name: Option<String>,

    /// Username for user/password authentication.
    pub user: Option<String>,

    /// Password for user/password authentication.
    pub password: Option<String>,

    /// Authentication token.
    pub token: Option<String>,

    /// Refuse to talk to a server without TLS.
    pub tls_required: bool,

    /// PEM bundle of trusted roots. Falls back to the bundled web PKI roots.
    pub tls_ca_file: Option<PathBuf>,

    /// PEM client certificate chain for mutual TLS.
    pub tls_cert_file: Option<PathBuf>,

    /// PEM private key matching `tls_cert_file`.
    pub tls_key_file: Option<PathBuf>,

    /// Reconnect automatically after losing an established connection.
    pub reconnect: bool,

    /// Minimum time between two attempts against the same server.
    /// - Default: 2 seconds
    pub reconnect_time_wait: Duration,

    /// Upper bound of random delay added to `reconnect_time_wait`.
    /// - Default: 100ms
    pub reconnect_jitter: Duration,

    /// Failed attempts allowed per server before it is skipped.
    /// - `None`: unlimited
    /// - Default: `Some(60)`
    pub max_reconnect_attempts: Option<u32>,

    /// Bytes of outbound data kept while reconnecting.
    /// - Default: 8 MiB
    pub reconnect_buffer_size: usize,

    /// Interval between keepalive pings. Must be non-zero.
    /// - Default: 2 minutes
    pub ping_interval: Duration,

    /// Unanswered pings tolerated before the connection is declared stale.
    /// - Default: 2
    pub max_outstanding_pings: u32,

    /// Deadline for transport setup plus handshake on one server.
    /// - Default: 2 seconds
    pub connect_timeout: Duration,

    /// Deadline for `drain()` as a whole.
    /// - Default: 30 seconds
    pub drain_timeout: Duration,

    /// Time allowed to push buffered writes out on `close()`.
    /// - Default: 2 seconds
    pub close_timeout: Duration,

    /// Default deadline for `flush()`.
    /// - Default: 10 seconds
    pub flush_timeout: Duration,

    /// Default deadline for `request()`.
    /// - Default: 5 seconds
    pub request_timeout: Duration,

    /// Deadline for a single transport write on an established connection.
    /// - Default: 10 seconds
    pub write_timeout: Duration,

    /// Do not add servers advertised by the broker to the pool.
    pub ignore_discovered_urls: bool,

    /// Keep configured servers in the given order.
    pub dont_randomize_servers: bool,

    /// Default per-subscription limit of queued messages.
    /// - Default: 524288
    pub pending_msgs_limit: usize,

    /// Default per-subscription limit of queued payload bytes.
    /// - Default: 64 MiB
    pub pending_bytes_limit: usize,

    /// Request/reply routing strategy.
    pub reply_mode: ReplyMode,

    /// Subject prefix for reply inboxes.
    /// - Default: `_INBOX`
    pub inbox_prefix: String,

    /// Ask the broker not to deliver our own publishes back to us.
    pub no_echo: bool,

    /// Ask the broker to acknowledge every frame with `+OK`.
    pub verbose: bool,

    /// Ask the broker for strict subject checking.
    pub pedantic: bool,

    /// Advertise header support.
    pub headers: bool,

    /// Ask for no-responders status replies. Requires `headers`.
    pub no_responders: bool,

    /// Bytes requested from the transport per read.
    /// - Default: 32 KiB
    pub read_buffer_size: usize,
}

impl Default for ConnectOptions {
    fn default() -> Self {
        Self {
            servers: vec!["nats://127.0.0.1:4222".to_string()],
            name: None,
            user: None,
            password: None,
            token: None,
            tls_required: false,
            tls_ca_file: None,
            tls_cert_file: None,
            tls_key_file: None,
            reconnect: true,
            reconnect_time_wait: Duration::from_secs(2),
            reconnect_jitter: Duration::from_millis(100),
            max_reconnect_attempts: Some(60),
            reconnect_buffer_size: 8 * 1024 * 1024,
            ping_interval: Duration::from_secs(120),
            max_outstanding_pings: 2,
            connect_timeout: Duration::from_secs(2),
            drain_timeout: Duration::from_secs(30),
            close_timeout: Duration::from_secs(2),
            flush_timeout: Duration::from_secs(10),
            request_timeout: Duration::from_secs(5),
            write_timeout: Duration::from_secs(10),
            ignore_discovered_urls: false,
            dont_randomize_servers: false,
            pending_msgs_limit: 512 * 1024,
            pending_bytes_limit: 64 * 1024 * 1024,
            reply_mode: ReplyMode::Multiplexed,
            inbox_prefix: "_INBOX".to_string(),
            no_echo: false,
            verbose: false,
            pedantic: false,
            headers: true,
            no_responders: true,
            read_buffer_size: 32 * 1024,
        }
    }
}

impl ConnectOptions {
    /// Create new options with default values.
    pub fn new() -> Self {
        Self::default()
    }

    /// Defaults overlaid with `NATS_*` environment variables.
    pub fn from_env() -> Result<Self, OptionsError> {
        Self::from_env_with(|key| std::env::var(key).ok())
    }

    /// Defaults overlaid with values from `lookup`, keyed by full variable
    /// name (e.g. `NATS_PING_INTERVAL_MS`).
    pub fn from_env_with<F>(lookup: F) -> Result<Self, OptionsError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let env = EnvSource { lookup };
        let mut opts = Self::default();

        if let Some(urls) = env.raw("URL") {
            let servers: Vec<String> = urls
                .split(',')
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(str::to_string)
                .collect();
            if !servers.is_empty() {
                opts.servers = servers;
            }
        }
        opts.name = env.raw("NAME").or(opts.name);
        opts.user = env.raw("USER").or(opts.user);
        opts.password = env.raw("PASSWORD").or(opts.password);
        opts.token = env.raw("TOKEN").or(opts.token);
        opts.tls_required = env.flag("TLS_REQUIRED")?.unwrap_or(opts.tls_required);
        opts.tls_ca_file = env.raw("TLS_CA_FILE").map(PathBuf::from).or(opts.tls_ca_file);
        opts.tls_cert_file = env.raw("TLS_CERT_FILE").map(PathBuf::from).or(opts.tls_cert_file);
        opts.tls_key_file = env.raw("TLS_KEY_FILE").map(PathBuf::from).or(opts.tls_key_file);
        opts.reconnect = env.flag("RECONNECT")?.unwrap_or(opts.reconnect);
        opts.reconnect_time_wait = env
            .millis("RECONNECT_TIME_WAIT_MS")?
            .unwrap_or(opts.reconnect_time_wait);
        opts.reconnect_jitter = env
            .millis("RECONNECT_JITTER_MS")?
            .unwrap_or(opts.reconnect_jitter);
        if let Some(attempts) = env.parse::<i64>("MAX_RECONNECT_ATTEMPTS")? {
            opts.max_reconnect_attempts = u32::try_from(attempts).ok();
        }
        opts.ping_interval = env
            .non_zero("PING_INTERVAL_MS")?
            .map(Duration::from_millis)
            .unwrap_or(opts.ping_interval);
        opts.max_outstanding_pings = env
            .non_zero("MAX_OUTSTANDING_PINGS")?
            .unwrap_or(opts.max_outstanding_pings);
        opts.connect_timeout = env.millis("CONNECT_TIMEOUT_MS")?.unwrap_or(opts.connect_timeout);
        opts.drain_timeout = env.millis("DRAIN_TIMEOUT_MS")?.unwrap_or(opts.drain_timeout);
        opts.close_timeout = env.millis("CLOSE_TIMEOUT_MS")?.unwrap_or(opts.close_timeout);
        opts.flush_timeout = env.millis("FLUSH_TIMEOUT_MS")?.unwrap_or(opts.flush_timeout);
        opts.request_timeout = env.millis("REQUEST_TIMEOUT_MS")?.unwrap_or(opts.request_timeout);
        opts.ignore_discovered_urls = env
            .flag("IGNORE_DISCOVERED_URLS")?
            .unwrap_or(opts.ignore_discovered_urls);
        opts.dont_randomize_servers = env
            .flag("DONT_RANDOMIZE")?
            .unwrap_or(opts.dont_randomize_servers);
        opts.pending_msgs_limit = env
            .parse("PENDING_MSGS_LIMIT")?
            .unwrap_or(opts.pending_msgs_limit);
        opts.pending_bytes_limit = env
            .parse("PENDING_BYTES_LIMIT")?
            .unwrap_or(opts.pending_bytes_limit);
        opts.reply_mode = env.parse("REPLY_MODE")?.unwrap_or(opts.reply_mode);
        opts.inbox_prefix = env.raw("INBOX_PREFIX").unwrap_or(opts.inbox_prefix);
        opts.no_echo = env.flag("NO_ECHO")?.unwrap_or(opts.no_echo);

        Ok(opts)
    }

    /// Replace the server list.
    pub fn with_servers<I, S>(mut self, servers: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.servers = servers.into_iter().map(Into::into).collect();
        self
    }

    /// Set the client name.
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    /// Authenticate with a username and password.
    pub fn with_user_and_password(
        mut self,
        user: impl Into<String>,
        password: impl Into<String>,
    ) -> Self {
        self.user = Some(user.into());
        self.password = Some(password.into());
        self
    }

    /// Authenticate with a token.
    pub fn with_token(mut self, token: impl Into<String>) -> Self {
        self.token = Some(token.into());
        self
    }

    /// Require TLS on every connection.
    pub fn with_tls_required(mut self, required: bool) -> Self {
        self.tls_required = required;
        self
    }

    /// Trust roots from a PEM file instead of the bundled web PKI roots.
    pub fn with_tls_ca_file(mut self, path: impl Into<PathBuf>) -> Self {
        self.tls_ca_file = Some(path.into());
        self
    }

    /// Present a client certificate.
    pub fn with_tls_client_cert(
        mut self,
        cert: impl Into<PathBuf>,
        key: impl Into<PathBuf>,
    ) -> Self {
        self.tls_cert_file = Some(cert.into());
        self.tls_key_file = Some(key.into());
        self
    }

    /// Enable or disable automatic reconnection.
    pub fn with_reconnect(mut self, enabled: bool) -> Self {
        self.reconnect = enabled;
        self
    }

    /// Set the wait between attempts against the same server.
    pub fn with_reconnect_time_wait(mut self, wait: Duration) -> Self {
        self.reconnect_time_wait = wait;
        self
    }

    /// Set the random jitter added to the reconnect wait.
    pub fn with_reconnect_jitter(mut self, jitter: Duration) -> Self {
        self.reconnect_jitter = jitter;
        self
    }

    /// Set failed attempts per server (`None` for unlimited).
    pub fn with_max_reconnect_attempts(mut self, attempts: Option<u32>) -> Self {
        self.max_reconnect_attempts = attempts;
        self
    }

    /// Set the bound on writes buffered while reconnecting.
    pub fn with_reconnect_buffer_size(mut self, bytes: usize) -> Self {
        self.reconnect_buffer_size = bytes;
        self
    }

    /// Set the keepalive interval.
    pub fn with_ping_interval(mut self, interval: Duration) -> Self {
        self.ping_interval = interval;
        self
    }

    /// Set how many pings may be outstanding before the link is stale.
    pub fn with_max_outstanding_pings(mut self, max: u32) -> Self {
        self.max_outstanding_pings = max;
        self
    }

    /// Set the per-server connect deadline.
    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    /// Set the drain deadline.
    pub fn with_drain_timeout(mut self, timeout: Duration) -> Self {
        self.drain_timeout = timeout;
        self
    }

    /// Set the close deadline.
    pub fn with_close_timeout(mut self, timeout: Duration) -> Self {
        self.close_timeout = timeout;
        self
    }

    /// Set the default flush deadline.
    pub fn with_flush_timeout(mut self, timeout: Duration) -> Self {
        self.flush_timeout = timeout;
        self
    }

    /// Set the default request deadline.
    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }

    /// Set the per-write deadline.
    pub fn with_write_timeout(mut self, timeout: Duration) -> Self {
        self.write_timeout = timeout;
        self
    }

    /// Ignore servers advertised by the broker.
    pub fn with_ignore_discovered_urls(mut self, ignore: bool) -> Self {
        self.ignore_discovered_urls = ignore;
        self
    }

    /// Keep the configured server order.
    pub fn with_dont_randomize_servers(mut self, dont: bool) -> Self {
        self.dont_randomize_servers = dont;
        self
    }

    /// Set default pending limits for new subscriptions.
    pub fn with_pending_limits(mut self, msgs: usize, bytes: usize) -> Self {
        self.pending_msgs_limit = msgs;
        self.pending_bytes_limit = bytes;
        self
    }

    /// Select the request/reply strategy.
    pub fn with_reply_mode(mut self, mode: ReplyMode) -> Self {
        self.reply_mode = mode;
        self
    }

    /// Set the inbox subject prefix.
    pub fn with_inbox_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.inbox_prefix = prefix.into();
        self
    }

    /// Suppress delivery of our own publishes.
    pub fn with_no_echo(mut self, no_echo: bool) -> Self {
        self.no_echo = no_echo;
        self
    }

    /// Ask for `+OK` acknowledgements.
    pub fn with_verbose(mut self, verbose: bool) -> Self {
        self.verbose = verbose;
        self
    }

    /// Ask for strict subject checking.
    pub fn with_pedantic(mut self, pedantic: bool) -> Self {
        self.pedantic = pedantic;
        self
    }

    /// Enable or disable header support and no-responders signalling.
    pub fn with_headers(mut self, headers: bool) -> Self {
        self.headers = headers;
        if !headers {
            self.no_responders = false;
        }
        self
    }

    /// Enable or disable the no-responders fast failure.
    pub fn with_no_responders(mut self, enabled: bool) -> Self {
        self.no_responders = enabled;
        self
    }

    /// Set the transport read size.
    pub fn with_read_buffer_size(mut self, size: usize) -> Self {
        self.read_buffer_size = size;
        self
    }

    /// Reject settings the engine cannot run with.
    pub fn validate(&self) -> Result<(), OptionsError> {
        if self.ping_interval.is_zero() {
            return Err(OptionsError::Invalid {
                field: "ping_interval",
                reason: "must be non-zero",
            });
        }
        if self.max_outstanding_pings == 0 {
            return Err(OptionsError::Invalid {
                field: "max_outstanding_pings",
                reason: "must be at least 1",
            });
        }
        if self.read_buffer_size == 0 {
            return Err(OptionsError::Invalid {
                field: "read_buffer_size",
                reason: "must be non-zero",
            });
        }
        Ok(())
    }
}

struct EnvSource<F> {
    lookup: F,
}

impl<F> EnvSource<F>
where
    F: Fn(&str) -> Option<String>,
{
    fn raw(&self, name: &str) -> Option<String> {
        (self.lookup)(&format!("{ENV_PREFIX}{name}")).filter(|v| !v.trim().is_empty())
    }

    fn parse<T: FromStr>(&self, name: &str) -> Result<Option<T>, OptionsError> {
        match self.raw(name) {
            None => Ok(None),
            Some(value) => value
                .trim()
                .parse::<T>()
                .map(Some)
                .map_err(|_| OptionsError::InvalidEnv {
                    key: format!("{ENV_PREFIX}{name}"),
                    value,
                }),
        }
    }

    fn non_zero<T>(&self, name: &str) -> Result<Option<T>, OptionsError>
    where
        T: FromStr + Default + PartialEq,
    {
        match self.parse::<T>(name)? {
            Some(v) if v == T::default() => Err(OptionsError::InvalidEnv {
                key: format!("{ENV_PREFIX}{name}"),
                value: "0".to_string(),
            }),
            other => Ok(other),
        }
    }

    fn millis(&self, name: &str) -> Result<Option<Duration>, OptionsError> {
        Ok(self.parse::<u64>(name)?.map(Duration::from_millis))
    }

    fn flag(&self, name: &str) -> Result<Option<bool>, OptionsError> {
        match self.raw(name) {
            None => Ok(None),
            Some(value) => match value.trim().to_ascii_lowercase().as_str() {
                "1" | "true" | "yes" | "on" => Ok(Some(true)),
                "0" | "false" | "no" | "off" => Ok(Some(false)),
                _ => Err(OptionsError::InvalidEnv {
                    key: format!("{ENV_PREFIX}{name}"),
                    value,
                }),
            },
        }
    }
}

/// Errors raised while resolving options.
#[derive(Debug, thiserror::Error)]
pub enum OptionsError {
    #[error("Invalid value for {key}: {value:?}")]
    InvalidEnv { key: String, value: String },

    #[error("Invalid option {field}: {reason}")]
    Invalid {
        field: &'static str,
        reason: &'static str,
    },
}
