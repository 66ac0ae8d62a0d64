//! Message headers.
//!
//! Wire form (the header block of HPUB/HMSG):
//!
//! ```text
//! NATS/1.0[ <status>[ <description>]]\r\n
//! <Name>: <value>\r\n
//! ...
//! \r\n
//! ```

use bytes::{BufMut, BytesMut};
use std::fmt;

/// Version line every header block starts with.
pub const HEADER_VERSION: &str = "NATS/1.0";

/// Status code the broker uses to signal that nobody is subscribed to a
/// request subject.
pub const NO_RESPONDERS: u16 = 503;

/// Inline status carried on the version line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Status {
    pub code: u16,
    pub description: Option<String>,
}

/// Ordered multi-map of header names to values.
///
/// Names are compared exactly; insertion order is kept on the wire.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct HeaderMap {
    entries: Vec<(String, String)>,
}

impl HeaderMap {
    pub fn new() -> Self {
        Self::default()
    }

    /// Set `name` to a single value, replacing earlier values.
    pub fn insert(&mut self, name: impl Into<String>, value: impl Into<String>) {
        let name = name.into();
        self.entries.retain(|(n, _)| *n != name);
        self.entries.push((name, value.into()));
    }

    /// Add a value for `name`, keeping earlier ones.
    pub fn append(&mut self, name: impl Into<String>, value: impl Into<String>) {
        self.entries.push((name.into(), value.into()));
    }

    /// First value for `name`.
    pub fn get(&self, name: &str) -> Option<&str> {
        self.entries
            .iter()
            .find(|(n, _)| n == name)
            .map(|(_, v)| v.as_str())
    }

    /// All values for `name`, in insertion order.
    pub fn get_all<'a>(&'a self, name: &'a str) -> impl Iterator<Item = &'a str> + 'a {
        self.entries
            .iter()
            .filter(move |(n, _)| n == name)
            .map(|(_, v)| v.as_str())
    }

    pub fn remove(&mut self, name: &str) {
        self.entries.retain(|(n, _)| n != name);
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.entries.iter().map(|(n, v)| (n.as_str(), v.as_str()))
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Append the header block (version line through the blank line).
    pub fn encode(&self, dst: &mut BytesMut) {
        dst.put_slice(HEADER_VERSION.as_bytes());
        dst.put_slice(b"\r\n");
        for (name, value) in &self.entries {
            dst.put_slice(name.as_bytes());
            dst.put_slice(b": ");
            dst.put_slice(value.as_bytes());
            dst.put_slice(b"\r\n");
        }
        dst.put_slice(b"\r\n");
    }

    /// Size of the encoded block in bytes.
    pub fn encoded_len(&self) -> usize {
        HEADER_VERSION.len()
            + 2
            + self
                .entries
                .iter()
                .map(|(n, v)| n.len() + 2 + v.len() + 2)
                .sum::<usize>()
            + 2
    }

    /// Parse a header block. Returns `None` if the block is malformed.
    pub fn parse(raw: &[u8]) -> Option<(Self, Option<Status>)> {
        let text = std::str::from_utf8(raw).ok()?;
        let mut lines = text.split("\r\n");

        let version_line = lines.next()?;
        let rest = version_line.strip_prefix(HEADER_VERSION)?;
        let status = parse_status(rest);

        let mut map = HeaderMap::new();
        for line in lines {
            if line.is_empty() {
                continue;
            }
            let (name, value) = line.split_once(':')?;
            let name = name.trim();
            if name.is_empty() {
                return None;
            }
            map.append(name, value.trim());
        }
        Some((map, status))
    }
}

fn parse_status(rest: &str) -> Option<Status> {
    let rest = rest.trim();
    if rest.is_empty() {
        return None;
    }
    let (code, description) = match rest.split_once(char::is_whitespace) {
        Some((code, desc)) => (code, Some(desc.trim().to_string()).filter(|d| !d.is_empty())),
        None => (rest, None),
    };
    let code = code.parse::<u16>().ok()?;
    Some(Status { code, description })
}

impl fmt::Display for HeaderMap {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut first = true;
        for (name, value) in &self.entries {
            if !first {
                f.write_str(", ")?;
            }
            first = false;
            write!(f, "{name}: {value}")?;
        }
        Ok(())
    }
}

impl<K, V> FromIterator<(K, V)> for HeaderMap
where
    K: Into<String>,
    V: Into<String>,
{
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        let mut map = HeaderMap::new();
        for (k, v) in iter {
            map.append(k, v);
        }
        map
    }
}
