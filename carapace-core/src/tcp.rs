//! TCP socket tuning.
//!
//! Control-line traffic is small and latency-sensitive, so Nagle is turned
//! off. OS keepalive is enabled as a backstop under the protocol-level
//! PING/PONG.

use std::io;
use std::time::Duration;

use socket2::{SockRef, TcpKeepalive};
use tokio::net::TcpStream;

/// Idle time before the OS starts probing a silent connection.
pub const KEEPALIVE_IDLE: Duration = Duration::from_secs(60);

/// Enable TCP_NODELAY.
///
/// # Errors
///
/// Returns an error if the socket option cannot be set.
#[inline]
pub fn enable_tcp_nodelay(stream: &TcpStream) -> io::Result<()> {
    stream.set_nodelay(true)
}

/// Enable OS-level TCP keepalive with the given idle time.
///
/// # Errors
///
/// Returns an error if the socket option cannot be set.
pub fn configure_tcp_keepalive(stream: &TcpStream, idle: Duration) -> io::Result<()> {
    let keepalive = TcpKeepalive::new().with_time(idle);
    SockRef::from(stream).set_tcp_keepalive(&keepalive)
}

/// Apply the client's default tuning to a freshly connected stream.
///
/// Failures are logged, not returned: a socket without these options still
/// works.
pub fn tune(stream: &TcpStream) {
    if let Err(e) = enable_tcp_nodelay(stream) {
        tracing::debug!("[tcp] Failed to set TCP_NODELAY: {}", e);
    }
    if let Err(e) = configure_tcp_keepalive(stream, KEEPALIVE_IDLE) {
        tracing::debug!("[tcp] Failed to set keepalive: {}", e);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::TcpListener;

    #[tokio::test]
    async fn test_tune_connected_stream() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let accept = tokio::spawn(async move { listener.accept().await.unwrap() });

        let stream = TcpStream::connect(addr).await.unwrap();
        tune(&stream);
        assert!(stream.nodelay().unwrap());

        let _ = accept.await.unwrap();
    }
}
