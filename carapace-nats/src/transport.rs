//! Byte-level transport: plain TCP, TLS upgraded in place, and WebSocket.
//!
//! A [`Transport`] is used whole during the handshake (INFO, optional TLS
//! upgrade, CONNECT) and then split into a [`TransportReader`] owned by the
//! read loop and a [`TransportWriter`] owned by the flusher.
//!
//! The WebSocket overlay carries protocol bytes inside binary frames. Inbound
//! frames are appended to the caller's buffer as-is, so the codec never sees
//! frame boundaries.

use std::sync::Arc;
use std::time::Duration;

use bytes::{Bytes, BytesMut};
use carapace_core::endpoint::{Endpoint, Scheme};
use carapace_core::error::TransportError;
use carapace_core::tcp;
use carapace_core::timeout::{read_with_timeout, with_deadline, write_all_with_timeout};
use futures::stream::{SplitSink, SplitStream};
use futures::{Sink, SinkExt, Stream, StreamExt};
use rustls::ClientConfig;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt, ReadHalf, WriteHalf};
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::{Error as WsError, Message as WsMessage};
use tokio_tungstenite::WebSocketStream;
use tracing::{debug, trace};

use crate::tls;

/// Anything the transport can carry bytes over.
pub trait Io: AsyncRead + AsyncWrite + Send + Unpin {}
impl<T: AsyncRead + AsyncWrite + Send + Unpin> Io for T {}

type BoxIo = Box<dyn Io>;

enum Link {
    Tcp(TcpStream),
    Stream(BoxIo),
    /// Socket open, HTTP upgrade not yet performed
    WsPending(BoxIo),
    Ws(Box<WebSocketStream<BoxIo>>),
    /// Placeholder while an upgrade owns the socket
    Detached,
}

/// An open connection to one server.
pub struct Transport {
    link: Link,
    endpoint: Endpoint,
}

impl std::fmt::Debug for Transport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let kind = match self.link {
            Link::Tcp(_) => "tcp",
            Link::Stream(_) => "tls",
            Link::WsPending(_) => "ws-pending",
            Link::Ws(_) => "ws",
            Link::Detached => "detached",
        };
        f.debug_struct("Transport")
            .field("endpoint", &self.endpoint.to_string())
            .field("kind", &kind)
            .finish()
    }
}

impl Transport {
    /// Dial `endpoint`. For `wss://` the TLS session is set up here; the
    /// WebSocket upgrade itself is left to [`Transport::handshake_websocket`].
    pub async fn connect(
        endpoint: &Endpoint,
        tls_config: Option<&Arc<ClientConfig>>,
        deadline: Option<Duration>,
    ) -> Result<Self, TransportError> {
        let address = endpoint.address();
        debug!("[Transport] Dialing {}", address);
        let stream = with_deadline("connect", deadline, async {
            Ok(TcpStream::connect(&address).await?)
        })
        .await?;
        tcp::tune(&stream);

        let mut transport = Self {
            link: Link::Tcp(stream),
            endpoint: endpoint.clone(),
        };

        if endpoint.is_websocket() {
            if endpoint.scheme == Scheme::Wss {
                let config = tls_config.ok_or_else(|| {
                    TransportError::Tls("wss endpoint without TLS configuration".into())
                })?;
                transport.upgrade_tls(Arc::clone(config), deadline).await?;
            }
            transport.link = match std::mem::replace(&mut transport.link, Link::Detached) {
                Link::Tcp(s) => Link::WsPending(Box::new(s)),
                Link::Stream(s) => Link::WsPending(s),
                other => other,
            };
        }
        Ok(transport)
    }

    pub fn endpoint(&self) -> &Endpoint {
        &self.endpoint
    }

    pub fn is_tls(&self) -> bool {
        matches!(self.link, Link::Stream(_)) || self.endpoint.scheme == Scheme::Wss
    }

    /// Wrap the open plain socket in TLS without closing it.
    pub async fn upgrade_tls(
        &mut self,
        config: Arc<ClientConfig>,
        deadline: Option<Duration>,
    ) -> Result<(), TransportError> {
        let tcp = match std::mem::replace(&mut self.link, Link::Detached) {
            Link::Tcp(tcp) => tcp,
            other => {
                self.link = other;
                return Err(TransportError::Tls("TLS upgrade on a non-plain link".into()));
            }
        };
        let (connector, name) = tls::connector(config, &self.endpoint.host)?;
        debug!("[Transport] Upgrading {} to TLS", self.endpoint.address());
        let stream = with_deadline("tls handshake", deadline, async {
            connector
                .connect(name, tcp)
                .await
                .map_err(|e| TransportError::Tls(e.to_string()))
        })
        .await?;
        self.link = Link::Stream(Box::new(stream));
        Ok(())
    }

    /// Perform the HTTP upgrade on a WebSocket endpoint.
    pub async fn handshake_websocket(
        &mut self,
        deadline: Option<Duration>,
    ) -> Result<(), TransportError> {
        let io = match std::mem::replace(&mut self.link, Link::Detached) {
            Link::WsPending(io) => io,
            other => {
                self.link = other;
                return Ok(());
            }
        };
        let url = self.endpoint.websocket_url();
        debug!("[Transport] WebSocket upgrade {}", url);
        let (ws, _response) = with_deadline("websocket handshake", deadline, async {
            tokio_tungstenite::client_async(url.as_str(), io)
                .await
                .map_err(|e| TransportError::WebSocket(e.to_string()))
        })
        .await?;
        self.link = Link::Ws(Box::new(ws));
        Ok(())
    }

    /// Append available bytes (at most `max` for stream links) to `buf`.
    pub async fn read(
        &mut self,
        buf: &mut BytesMut,
        max: usize,
        deadline: Option<Duration>,
    ) -> Result<usize, TransportError> {
        match &mut self.link {
            Link::Tcp(s) => read_with_timeout(s, buf, max, deadline).await,
            Link::Stream(s) => read_with_timeout(s, buf, max, deadline).await,
            Link::Ws(ws) => with_deadline("read", deadline, ws_read(ws.as_mut(), buf)).await,
            Link::WsPending(_) => Err(TransportError::HandshakeInProgress),
            Link::Detached => Err(TransportError::Closed),
        }
    }

    pub async fn write(
        &mut self,
        data: &[u8],
        deadline: Option<Duration>,
    ) -> Result<(), TransportError> {
        match &mut self.link {
            Link::Tcp(s) => write_all_with_timeout(s, data, deadline).await,
            Link::Stream(s) => write_all_with_timeout(s, data, deadline).await,
            Link::Ws(ws) => with_deadline("write", deadline, ws_write(ws.as_mut(), data)).await,
            Link::WsPending(_) => Err(TransportError::HandshakeInProgress),
            Link::Detached => Err(TransportError::Closed),
        }
    }

    pub async fn close(mut self) {
        match &mut self.link {
            Link::Tcp(s) => {
                let _ = s.shutdown().await;
            }
            Link::Stream(s) | Link::WsPending(s) => {
                let _ = s.shutdown().await;
            }
            Link::Ws(ws) => {
                let _ = ws.as_mut().close(None).await;
            }
            Link::Detached => {}
        }
    }

    /// Separate the read and write directions.
    pub fn split(self) -> (TransportReader, TransportWriter) {
        match self.link {
            Link::Tcp(s) => split_stream(Box::new(s)),
            Link::Stream(s) => split_stream(s),
            Link::Ws(ws) => {
                let (sink, stream) = ws.split();
                (TransportReader::Ws(stream), TransportWriter::Ws(sink))
            }
            Link::WsPending(_) => (TransportReader::Detached, TransportWriter::Pending),
            Link::Detached => (TransportReader::Detached, TransportWriter::Detached),
        }
    }
}

fn split_stream(io: BoxIo) -> (TransportReader, TransportWriter) {
    let (r, w) = tokio::io::split(io);
    (TransportReader::Stream(r), TransportWriter::Stream(w))
}

async fn ws_read<S>(ws: &mut S, buf: &mut BytesMut) -> Result<usize, TransportError>
where
    S: Stream<Item = Result<WsMessage, WsError>> + Unpin,
{
    loop {
        match ws.next().await {
            Some(Ok(WsMessage::Binary(data))) if !data.is_empty() => {
                buf.extend_from_slice(&data);
                return Ok(data.len());
            }
            Some(Ok(WsMessage::Text(text))) if !text.is_empty() => {
                buf.extend_from_slice(text.as_bytes());
                return Ok(text.len());
            }
            Some(Ok(WsMessage::Close(_))) | None => return Err(TransportError::Closed),
            Some(Ok(other)) => {
                trace!("[Transport] Ignoring WebSocket control frame {:?}", other);
            }
            Some(Err(e)) => return Err(ws_error(e)),
        }
    }
}

async fn ws_write<S>(ws: &mut S, data: &[u8]) -> Result<(), TransportError>
where
    S: Sink<WsMessage, Error = WsError> + Unpin,
{
    ws.send(WsMessage::binary(Bytes::copy_from_slice(data)))
        .await
        .map_err(ws_error)
}

fn ws_error(e: WsError) -> TransportError {
    match e {
        WsError::ConnectionClosed | WsError::AlreadyClosed => TransportError::Closed,
        WsError::Io(io) => io.into(),
        other => TransportError::WebSocket(other.to_string()),
    }
}

/// Read direction, owned by the read loop.
pub enum TransportReader {
    Stream(ReadHalf<BoxIo>),
    Ws(SplitStream<Box<WebSocketStream<BoxIo>>>),
    Detached,
}

impl TransportReader {
    pub async fn read(
        &mut self,
        buf: &mut BytesMut,
        max: usize,
        deadline: Option<Duration>,
    ) -> Result<usize, TransportError> {
        match self {
            Self::Stream(r) => read_with_timeout(r, buf, max, deadline).await,
            Self::Ws(ws) => with_deadline("read", deadline, ws_read(ws, buf)).await,
            Self::Detached => Err(TransportError::Closed),
        }
    }
}

/// Write direction, owned by the flusher.
pub enum TransportWriter {
    Stream(WriteHalf<BoxIo>),
    Ws(SplitSink<Box<WebSocketStream<BoxIo>>, WsMessage>),
    /// WebSocket upgrade never happened
    Pending,
    Detached,
}

impl TransportWriter {
    pub async fn write(
        &mut self,
        data: &[u8],
        deadline: Option<Duration>,
    ) -> Result<(), TransportError> {
        match self {
            Self::Stream(w) => write_all_with_timeout(w, data, deadline).await,
            Self::Ws(ws) => with_deadline("write", deadline, ws_write(ws, data)).await,
            Self::Pending => Err(TransportError::HandshakeInProgress),
            Self::Detached => Err(TransportError::Closed),
        }
    }

    pub async fn close(&mut self) {
        match self {
            Self::Stream(w) => {
                let _ = w.shutdown().await;
            }
            Self::Ws(ws) => {
                let _ = ws.close().await;
            }
            Self::Pending | Self::Detached => {}
        }
    }
}
