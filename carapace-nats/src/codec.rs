//! Wire codec.
//!
//! `Decoder` turns an append-only byte buffer into [`ServerOp`]s; the
//! `encode` methods produce the exact control-line grammar for both
//! directions.
//!
//! The decoder only ever consumes complete units from the front of the
//! buffer: a control line is taken once its CRLF is present, and a MSG/HMSG
//! payload once all of its bytes plus the trailing CRLF are present.
//! Anything short of that is "not yet decidable" and leaves the buffer
//! untouched (apart from an already-consumed MSG control line, which is kept
//! in decoder state).

use bytes::{BufMut, Bytes, BytesMut};

use crate::header::HeaderMap;
use crate::info::{ConnectInfo, ServerInfo};

/// Longest control line accepted before the stream is declared corrupt.
pub const MAX_CONTROL_LINE: usize = 4096;

/// Longest INFO line accepted. Cluster INFO carries every peer URL.
pub const MAX_INFO_LINE: usize = 1024 * 1024;

/// Largest MSG/HMSG body accepted, whatever the broker advertises.
pub const MAX_PAYLOAD_LEN: usize = 64 * 1024 * 1024;

const CRLF: &[u8] = b"\r\n";

/// A decoded MSG or HMSG frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MsgFrame {
    pub subject: String,
    pub sid: u64,
    pub reply: Option<String>,
    /// Raw header block (HMSG only)
    pub headers: Option<Bytes>,
    pub payload: Bytes,
}

/// Broker-to-client frames.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ServerOp {
    Info(Box<ServerInfo>),
    Msg(MsgFrame),
    Ping,
    Pong,
    Ok,
    Err(String),
    /// Anything the grammar does not allow. Always fatal for the connection.
    Unknown(Bytes),
}

impl ServerOp {
    /// Short verb for logging.
    pub fn verb(&self) -> &'static str {
        match self {
            Self::Info(_) => "INFO",
            Self::Msg(m) if m.headers.is_some() => "HMSG",
            Self::Msg(_) => "MSG",
            Self::Ping => "PING",
            Self::Pong => "PONG",
            Self::Ok => "+OK",
            Self::Err(_) => "-ERR",
            Self::Unknown(_) => "UNKNOWN",
        }
    }

    /// Append the canonical wire form.
    pub fn encode(&self, dst: &mut BytesMut) {
        match self {
            Self::Info(info) => {
                dst.put_slice(b"INFO ");
                // ServerInfo has only plain fields; serialization cannot fail.
                let json = serde_json::to_vec(info).unwrap_or_else(|_| b"{}".to_vec());
                dst.put_slice(&json);
                dst.put_slice(CRLF);
            }
            Self::Msg(m) => {
                let verb: &[u8] = if m.headers.is_some() { b"HMSG " } else { b"MSG " };
                dst.put_slice(verb);
                dst.put_slice(m.subject.as_bytes());
                dst.put_u8(b' ');
                put_decimal(dst, m.sid as usize);
                if let Some(reply) = &m.reply {
                    dst.put_u8(b' ');
                    dst.put_slice(reply.as_bytes());
                }
                let hdr_len = m.headers.as_ref().map_or(0, Bytes::len);
                if m.headers.is_some() {
                    dst.put_u8(b' ');
                    put_decimal(dst, hdr_len);
                }
                dst.put_u8(b' ');
                put_decimal(dst, hdr_len + m.payload.len());
                dst.put_slice(CRLF);
                if let Some(h) = &m.headers {
                    dst.put_slice(h);
                }
                dst.put_slice(&m.payload);
                dst.put_slice(CRLF);
            }
            Self::Ping => dst.put_slice(b"PING\r\n"),
            Self::Pong => dst.put_slice(b"PONG\r\n"),
            Self::Ok => dst.put_slice(b"+OK\r\n"),
            Self::Err(text) => {
                dst.put_slice(b"-ERR '");
                dst.put_slice(text.as_bytes());
                dst.put_slice(b"'\r\n");
            }
            Self::Unknown(raw) => dst.put_slice(raw),
        }
    }
}

/// Client-to-broker frames. Borrowed so publishing never copies the payload
/// before it reaches the write buffer.
#[derive(Debug, Clone, Copy)]
pub enum ClientOp<'a> {
    Connect(&'a ConnectInfo),
    Pub {
        subject: &'a str,
        reply: Option<&'a str>,
        headers: Option<&'a HeaderMap>,
        payload: &'a [u8],
    },
    Sub {
        subject: &'a str,
        queue: Option<&'a str>,
        sid: u64,
    },
    Unsub {
        sid: u64,
        max: Option<u64>,
    },
    Ping,
    Pong,
}

impl ClientOp<'_> {
    /// Append the wire form.
    pub fn encode(&self, dst: &mut BytesMut) {
        match *self {
            Self::Connect(info) => {
                dst.put_slice(b"CONNECT ");
                let json = serde_json::to_vec(info).unwrap_or_else(|_| b"{}".to_vec());
                dst.put_slice(&json);
                dst.put_slice(CRLF);
            }
            Self::Pub { subject, reply, headers, payload } => {
                let verb: &[u8] = if headers.is_some() { b"HPUB " } else { b"PUB " };
                dst.reserve(subject.len() + payload.len() + 32);
                dst.put_slice(verb);
                dst.put_slice(subject.as_bytes());
                if let Some(reply) = reply {
                    dst.put_u8(b' ');
                    dst.put_slice(reply.as_bytes());
                }
                match headers {
                    Some(h) => {
                        let hdr_len = h.encoded_len();
                        dst.put_u8(b' ');
                        put_decimal(dst, hdr_len);
                        dst.put_u8(b' ');
                        put_decimal(dst, hdr_len + payload.len());
                        dst.put_slice(CRLF);
                        h.encode(dst);
                    }
                    None => {
                        dst.put_u8(b' ');
                        put_decimal(dst, payload.len());
                        dst.put_slice(CRLF);
                    }
                }
                dst.put_slice(payload);
                dst.put_slice(CRLF);
            }
            Self::Sub { subject, queue, sid } => {
                dst.put_slice(b"SUB ");
                dst.put_slice(subject.as_bytes());
                if let Some(queue) = queue {
                    dst.put_u8(b' ');
                    dst.put_slice(queue.as_bytes());
                }
                dst.put_u8(b' ');
                put_decimal(dst, sid as usize);
                dst.put_slice(CRLF);
            }
            Self::Unsub { sid, max } => {
                dst.put_slice(b"UNSUB ");
                put_decimal(dst, sid as usize);
                if let Some(max) = max {
                    dst.put_u8(b' ');
                    put_decimal(dst, max as usize);
                }
                dst.put_slice(CRLF);
            }
            Self::Ping => dst.put_slice(b"PING\r\n"),
            Self::Pong => dst.put_slice(b"PONG\r\n"),
        }
    }
}

fn put_decimal(dst: &mut BytesMut, n: usize) {
    let mut buf = [0u8; 20];
    let mut i = buf.len();
    let mut n = n;
    loop {
        i -= 1;
        buf[i] = b'0' + (n % 10) as u8;
        n /= 10;
        if n == 0 {
            break;
        }
    }
    dst.put_slice(&buf[i..]);
}

/// MSG/HMSG control line already consumed, waiting for its payload.
#[derive(Debug)]
struct PendingPayload {
    subject: String,
    sid: u64,
    reply: Option<String>,
    header_len: Option<usize>,
    total_len: usize,
}

/// Stateful incremental decoder.
///
/// Returns:
/// - `Some(op)`: one frame decoded and removed from the buffer
/// - `None`: need more data
#[derive(Debug, Default)]
pub struct Decoder {
    pending: Option<PendingPayload>,
}

impl Decoder {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Decode a single frame from the front of `src`.
    pub fn decode(&mut self, src: &mut BytesMut) -> Option<ServerOp> {
        // === Payload phase ===
        if let Some(pending) = &self.pending {
            let Some(needed) = pending.total_len.checked_add(CRLF.len()) else {
                self.pending = None;
                return Some(ServerOp::Unknown(src.split().freeze()));
            };
            if src.len() < needed {
                return None;
            }
            let pending = self.pending.take()?;
            let mut body = src.split_to(pending.total_len).freeze();
            let trailer = src.split_to(CRLF.len());
            if &trailer[..] != CRLF {
                return Some(ServerOp::Unknown(trailer.freeze()));
            }
            let headers = pending.header_len.map(|n| body.split_to(n));
            return Some(ServerOp::Msg(MsgFrame {
                subject: pending.subject,
                sid: pending.sid,
                reply: pending.reply,
                headers,
                payload: body,
            }));
        }

        // === Control line phase ===
        let Some(end) = find_crlf(src) else {
            if src.len() > line_limit(src) {
                return Some(ServerOp::Unknown(src.split().freeze()));
            }
            return None;
        };

        let line = src.split_to(end + CRLF.len()).freeze();
        let op = match parse_control_line(&line[..end]) {
            Some(Control::Op(op)) => op,
            Some(Control::Payload(pending)) => {
                self.pending = Some(pending);
                return self.decode(src);
            }
            None => ServerOp::Unknown(line),
        };
        Some(op)
    }
}

enum Control {
    Op(ServerOp),
    Payload(PendingPayload),
}

fn line_limit(buf: &[u8]) -> usize {
    let start = buf
        .iter()
        .position(|b| !matches!(b, b' ' | b'\t'))
        .unwrap_or(buf.len());
    match buf.get(start..start + 4) {
        Some(verb) if verb.eq_ignore_ascii_case(b"INFO") => MAX_INFO_LINE,
        _ => MAX_CONTROL_LINE,
    }
}

fn find_crlf(buf: &[u8]) -> Option<usize> {
    buf.windows(2).position(|w| w == CRLF)
}

fn parse_control_line(line: &[u8]) -> Option<Control> {
    let line = std::str::from_utf8(line).ok()?;
    let trimmed = line.trim_start_matches([' ', '\t']);
    let verb_end = trimmed
        .find([' ', '\t'])
        .unwrap_or(trimmed.len());
    let verb = &trimmed[..verb_end];
    let rest = &trimmed[verb_end..];

    if verb.eq_ignore_ascii_case("MSG") {
        return parse_msg(rest, false).map(Control::Payload);
    }
    if verb.eq_ignore_ascii_case("HMSG") {
        return parse_msg(rest, true).map(Control::Payload);
    }

    let op = if verb.eq_ignore_ascii_case("PING") {
        no_args(rest, ServerOp::Ping)?
    } else if verb.eq_ignore_ascii_case("PONG") {
        no_args(rest, ServerOp::Pong)?
    } else if verb.eq_ignore_ascii_case("+OK") {
        no_args(rest, ServerOp::Ok)?
    } else if verb.eq_ignore_ascii_case("-ERR") {
        let text = rest.trim();
        let text = text
            .strip_prefix('\'')
            .and_then(|t| t.strip_suffix('\''))
            .unwrap_or(text);
        ServerOp::Err(text.to_string())
    } else if verb.eq_ignore_ascii_case("INFO") {
        let info: ServerInfo = serde_json::from_str(rest.trim()).ok()?;
        ServerOp::Info(Box::new(info))
    } else {
        return None;
    };
    Some(Control::Op(op))
}

fn no_args(rest: &str, op: ServerOp) -> Option<ServerOp> {
    rest.trim().is_empty().then_some(op)
}

fn parse_msg(rest: &str, with_headers: bool) -> Option<PendingPayload> {
    let args: smallvec::SmallVec<[&str; 5]> = rest.split_ascii_whitespace().collect();
    let (subject, sid, reply, sizes) = match (with_headers, args.len()) {
        (false, 3) => (args[0], args[1], None, &args[2..]),
        (false, 4) => (args[0], args[1], Some(args[2]), &args[3..]),
        (true, 4) => (args[0], args[1], None, &args[2..]),
        (true, 5) => (args[0], args[1], Some(args[2]), &args[3..]),
        _ => return None,
    };
    let sid = sid.parse::<u64>().ok()?;
    let (header_len, total_len) = if with_headers {
        let hdr = sizes[0].parse::<usize>().ok()?;
        let total = sizes[1].parse::<usize>().ok()?;
        if hdr > total {
            return None;
        }
        (Some(hdr), total)
    } else {
        (None, sizes[0].parse::<usize>().ok()?)
    };
    if total_len > MAX_PAYLOAD_LEN {
        return None;
    }
    Some(PendingPayload {
        subject: subject.to_string(),
        sid,
        reply: reply.map(str::to_string),
        header_len,
        total_len,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn decode_all(decoder: &mut Decoder, buf: &mut BytesMut) -> Vec<ServerOp> {
        let mut out = Vec::new();
        while let Some(op) = decoder.decode(buf) {
            out.push(op);
        }
        out
    }

    fn stream() -> Vec<u8> {
        let mut s = Vec::new();
        s.extend_from_slice(b"INFO {\"server_id\":\"S\",\"max_payload\":1024,\"headers\":true}\r\n");
        s.extend_from_slice(b"PING\r\n");
        s.extend_from_slice(b"MSG foo 1 5\r\nhello\r\n");
        s.extend_from_slice(b"msg   foo.bar\t2  reply.to   3\r\nabc\r\n");
        s.extend_from_slice(b"HMSG _INBOX.x.1 3 12 14\r\nNATS/1.0\r\n\r\nhi\r\n");
        s.extend_from_slice(b"+OK\r\n");
        s.extend_from_slice(b"pong\r\n");
        s.extend_from_slice(b"-ERR 'Unknown Protocol Operation'\r\n");
        s.extend_from_slice(b"MSG empty 9 0\r\n\r\n");
        s
    }

    #[test]
    fn test_decode_each_verb() {
        let mut decoder = Decoder::new();
        let mut buf = BytesMut::from(&stream()[..]);
        let ops = decode_all(&mut decoder, &mut buf);
        assert!(buf.is_empty());
        let verbs: Vec<_> = ops.iter().map(ServerOp::verb).collect();
        assert_eq!(
            verbs,
            vec!["INFO", "PING", "MSG", "MSG", "HMSG", "+OK", "PONG", "-ERR", "MSG"]
        );

        match &ops[3] {
            ServerOp::Msg(m) => {
                assert_eq!(m.subject, "foo.bar");
                assert_eq!(m.sid, 2);
                assert_eq!(m.reply.as_deref(), Some("reply.to"));
                assert_eq!(&m.payload[..], b"abc");
            }
            other => panic!("unexpected {other:?}"),
        }
        match &ops[4] {
            ServerOp::Msg(m) => {
                assert_eq!(m.headers.as_deref(), Some(&b"NATS/1.0\r\n\r\n"[..]));
                assert_eq!(&m.payload[..], b"hi");
            }
            other => panic!("unexpected {other:?}"),
        }
        assert_eq!(ops[7], ServerOp::Err("Unknown Protocol Operation".into()));
    }

    #[test]
    fn test_chunked_equivalence() {
        let whole = stream();
        let mut decoder = Decoder::new();
        let mut buf = BytesMut::from(&whole[..]);
        let expected = decode_all(&mut decoder, &mut buf);

        for chunk_size in [1, 2, 3, 7, 13, 64] {
            let mut decoder = Decoder::new();
            let mut buf = BytesMut::new();
            let mut got = Vec::new();
            for chunk in whole.chunks(chunk_size) {
                buf.extend_from_slice(chunk);
                got.extend(decode_all(&mut decoder, &mut buf));
            }
            assert_eq!(got, expected, "chunk size {chunk_size}");
        }
    }

    #[test]
    fn test_partial_line_is_undecided() {
        let mut decoder = Decoder::new();
        let mut buf = BytesMut::from(&b"PIN"[..]);
        assert!(decoder.decode(&mut buf).is_none());
        assert_eq!(&buf[..], b"PIN");
        buf.extend_from_slice(b"G\r");
        assert!(decoder.decode(&mut buf).is_none());
        buf.extend_from_slice(b"\n");
        assert_eq!(decoder.decode(&mut buf), Some(ServerOp::Ping));
    }

    #[test]
    fn test_unknown_frames() {
        for line in [
            &b"FOO bar\r\n"[..],
            b"PING extra\r\n",
            b"MSG foo notanumber 5\r\n",
            b"MSG foo 1\r\n",
            b"HMSG foo 1 10 5\r\n",
            b"INFO {not json\r\n",
            b"\r\n",
            b"garbagePING\r\n",
        ] {
            let mut decoder = Decoder::new();
            let mut buf = BytesMut::from(line);
            assert!(
                matches!(decoder.decode(&mut buf), Some(ServerOp::Unknown(_))),
                "{:?} should be unknown",
                String::from_utf8_lossy(line)
            );
        }
    }

    #[test]
    fn test_payload_without_crlf_is_unknown() {
        let mut decoder = Decoder::new();
        let mut buf = BytesMut::from(&b"MSG foo 1 3\r\nabcXY"[..]);
        assert!(matches!(decoder.decode(&mut buf), Some(ServerOp::Unknown(_))));
    }

    #[test]
    fn test_oversized_control_line() {
        let mut decoder = Decoder::new();
        let mut buf = BytesMut::from(&vec![b'A'; MAX_CONTROL_LINE + 1][..]);
        assert!(matches!(decoder.decode(&mut buf), Some(ServerOp::Unknown(_))));
    }

    #[test]
    fn test_absurd_byte_count_is_unknown() {
        let lines: [&[u8]; 3] = [
            b"MSG foo 1 18446744073709551615\r\nxx",
            b"HMSG foo 1 2 18446744073709551615\r\nxx",
            b"MSG foo 1 67108865\r\n",
        ];
        for line in lines {
            let mut decoder = Decoder::new();
            let mut buf = BytesMut::from(line);
            assert!(
                matches!(decoder.decode(&mut buf), Some(ServerOp::Unknown(_))),
                "{}",
                String::from_utf8_lossy(line)
            );
        }

        let mut buf = BytesMut::from(&b"MSG foo 1 67108864\r\n"[..]);
        assert!(Decoder::new().decode(&mut buf).is_none(), "at the cap waits for the body");
    }

    #[test]
    fn test_large_info_arrives_in_pieces() {
        let urls: Vec<String> = (0..400).map(|i| format!("\"10.0.{}.{}:4222\"", i / 250, i % 250)).collect();
        let line = format!("INFO {{\"server_id\":\"big\",\"connect_urls\":[{}]}}\r\n", urls.join(","));
        assert!(line.len() > MAX_CONTROL_LINE);

        let mut decoder = Decoder::new();
        let mut buf = BytesMut::new();
        let bytes = line.as_bytes();
        let (head, tail) = bytes.split_at(bytes.len() - 10);
        buf.extend_from_slice(head);
        assert!(decoder.decode(&mut buf).is_none());
        buf.extend_from_slice(tail);
        match decoder.decode(&mut buf) {
            Some(ServerOp::Info(info)) => assert_eq!(info.connect_urls.len(), 400),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn test_round_trip_is_whitespace_independent() {
        let inputs: [&[u8]; 6] = [
            b"MSG   foo   1    5\r\nhello\r\n",
            b"msg foo 1 reply 5\r\nhello\r\n",
            b"HMSG foo 7 12   14\r\nNATS/1.0\r\n\r\nhi\r\n",
            b"  PING\r\n",
            b"-ERR   'Stale Connection'\r\n",
            b"INFO   {\"server_id\":\"abc\",\"max_payload\":10}\r\n",
        ];
        for input in inputs {
            let mut decoder = Decoder::new();
            let first = decoder.decode(&mut BytesMut::from(input)).unwrap();
            let mut wire = BytesMut::new();
            first.encode(&mut wire);
            let second = Decoder::new().decode(&mut wire.clone()).unwrap();
            assert_eq!(first, second);

            let mut again = BytesMut::new();
            second.encode(&mut again);
            assert_eq!(wire, again, "canonical form is stable");
        }
    }

    #[test]
    fn test_encode_client_ops() {
        let mut buf = BytesMut::new();
        ClientOp::Pub { subject: "foo", reply: None, headers: None, payload: b"hello" }
            .encode(&mut buf);
        assert_eq!(&buf[..], b"PUB foo 5\r\nhello\r\n");

        buf.clear();
        ClientOp::Pub { subject: "foo", reply: Some("_INBOX.a.1"), headers: None, payload: b"" }
            .encode(&mut buf);
        assert_eq!(&buf[..], b"PUB foo _INBOX.a.1 0\r\n\r\n");

        buf.clear();
        let mut headers = HeaderMap::new();
        headers.insert("A", "b");
        ClientOp::Pub { subject: "foo", reply: None, headers: Some(&headers), payload: b"xy" }
            .encode(&mut buf);
        assert_eq!(&buf[..], b"HPUB foo 18 20\r\nNATS/1.0\r\nA: b\r\n\r\nxy\r\n");

        buf.clear();
        ClientOp::Sub { subject: "foo.*", queue: Some("workers"), sid: 42 }.encode(&mut buf);
        ClientOp::Unsub { sid: 42, max: Some(3) }.encode(&mut buf);
        ClientOp::Unsub { sid: 43, max: None }.encode(&mut buf);
        ClientOp::Ping.encode(&mut buf);
        assert_eq!(
            &buf[..],
            b"SUB foo.* workers 42\r\nUNSUB 42 3\r\nUNSUB 43\r\nPING\r\n"
        );
    }
}
