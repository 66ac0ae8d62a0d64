//! Deadline wrappers for transport I/O.
//!
//! Every helper maps an elapsed deadline to [`TransportError::Timeout`] so
//! callers never confuse a slow peer with a reset one.

use std::future::Future;
use std::time::Duration;

use bytes::BytesMut;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::error::TransportError;

/// Run `fut` under an optional deadline.
///
/// * `None`: wait indefinitely
/// * `Some(d)`: fail with `TransportError::Timeout` once `d` elapses
pub async fn with_deadline<T, F>(
    op: &'static str,
    duration: Option<Duration>,
    fut: F,
) -> Result<T, TransportError>
where
    F: Future<Output = Result<T, TransportError>>,
{
    match duration {
        None => fut.await,
        Some(d) => match tokio::time::timeout(d, fut).await {
            Ok(result) => result,
            Err(_elapsed) => Err(TransportError::Timeout { op, after: d }),
        },
    }
}

/// Read whatever is available (at most `max` bytes) into `buf`.
///
/// End of stream is reported as [`TransportError::Closed`], never as `Ok(0)`.
pub async fn read_with_timeout<S>(
    stream: &mut S,
    buf: &mut BytesMut,
    max: usize,
    duration: Option<Duration>,
) -> Result<usize, TransportError>
where
    S: AsyncRead + Unpin,
{
    buf.reserve(max);
    with_deadline("read", duration, async {
        let mut limited = (&mut *stream).take(max as u64);
        let n = limited.read_buf(buf).await?;
        if n == 0 {
            return Err(TransportError::Closed);
        }
        Ok(n)
    })
    .await
}

/// Write all of `data` and flush.
pub async fn write_all_with_timeout<S>(
    stream: &mut S,
    data: &[u8],
    duration: Option<Duration>,
) -> Result<(), TransportError>
where
    S: AsyncWrite + Unpin,
{
    with_deadline("write", duration, async {
        stream.write_all(data).await?;
        stream.flush().await?;
        Ok(())
    })
    .await
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::duplex;

    #[tokio::test]
    async fn test_read_timeout_is_distinct() {
        let (mut client, _server) = duplex(64);
        let mut buf = BytesMut::new();
        let err = read_with_timeout(&mut client, &mut buf, 16, Some(Duration::from_millis(20)))
            .await
            .unwrap_err();
        assert!(err.is_timeout(), "expected timeout, got {err:?}");
    }

    #[tokio::test]
    async fn test_read_eof_is_closed() {
        let (mut client, server) = duplex(64);
        drop(server);
        let mut buf = BytesMut::new();
        let err = read_with_timeout(&mut client, &mut buf, 16, None)
            .await
            .unwrap_err();
        assert!(matches!(err, TransportError::Closed));
    }

    #[tokio::test]
    async fn test_write_then_read() {
        let (mut client, mut server) = duplex(64);
        write_all_with_timeout(&mut client, b"PING\r\n", Some(Duration::from_secs(1)))
            .await
            .unwrap();
        let mut buf = BytesMut::new();
        let n = read_with_timeout(&mut server, &mut buf, 64, Some(Duration::from_secs(1)))
            .await
            .unwrap();
        assert_eq!(n, 6);
        assert_eq!(&buf[..], b"PING\r\n");
    }
}
