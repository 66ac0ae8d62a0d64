//! Inbound message value handed to the application.

use bytes::Bytes;

use crate::codec::MsgFrame;
use crate::header::{HeaderMap, Status, NO_RESPONDERS};

/// A delivered message. Owned by the application once received.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    pub subject: String,
    pub reply: Option<String>,
    pub payload: Bytes,
    pub headers: Option<HeaderMap>,
    /// Inline status from the header version line, if any.
    pub status: Option<Status>,
    /// Subscription the message was routed to.
    pub sid: u64,
    /// Bytes counted against pending limits (headers plus payload).
    pub length: usize,
}

impl Message {
    pub(crate) fn from_frame(frame: MsgFrame) -> Self {
        let header_len = frame.headers.as_ref().map_or(0, Bytes::len);
        let (headers, status) = match frame.headers.as_deref().and_then(HeaderMap::parse) {
            Some((map, status)) => (Some(map).filter(|m| !m.is_empty()), status),
            None => (None, None),
        };
        Self {
            length: header_len + frame.payload.len(),
            subject: frame.subject,
            reply: frame.reply,
            payload: frame.payload,
            headers,
            status,
            sid: frame.sid,
        }
    }

    /// Broker reply meaning "nobody is listening on the request subject".
    pub fn is_no_responders(&self) -> bool {
        self.payload.is_empty() && self.status.as_ref().is_some_and(|s| s.code == NO_RESPONDERS)
    }

    /// Payload as UTF-8 text, lossy.
    pub fn text(&self) -> std::borrow::Cow<'_, str> {
        String::from_utf8_lossy(&self.payload)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_no_responders_detection() {
        let msg = Message::from_frame(MsgFrame {
            subject: "_INBOX.abc.1".into(),
            sid: 1,
            reply: None,
            headers: Some(Bytes::from_static(b"NATS/1.0 503\r\n\r\n")),
            payload: Bytes::new(),
        });
        assert!(msg.is_no_responders());
        assert!(msg.headers.is_none());
        assert_eq!(msg.length, 16);
    }

    #[test]
    fn test_plain_message() {
        let msg = Message::from_frame(MsgFrame {
            subject: "foo".into(),
            sid: 3,
            reply: Some("bar".into()),
            headers: None,
            payload: Bytes::from_static(b"hello"),
        });
        assert!(!msg.is_no_responders());
        assert_eq!(msg.text(), "hello");
        assert_eq!(msg.length, 5);
    }
}
