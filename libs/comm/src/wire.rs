//! Wire envelope
//!
//! A frame is either a bare body, or
//! `SENTINEL k1 VAL_SEP v1 KEY_SEP k2 VAL_SEP v2 ... SENTINEL body`.
//! Only the first two sentinels are significant, so bodies may contain any
//! bytes. EOF and client sign-off are fixed bodies sent without a header.

use std::fmt;

use crate::error::{Error, Result};

/// Marks the start and end of a header
pub const SENTINEL: &[u8] = b"#CMSG_HEAD#";

const VAL_SEP_STR: &str = "=>";
const KEY_SEP_STR: &str = "|;|";

/// Separates a key from its value
pub const VAL_SEP: &[u8] = VAL_SEP_STR.as_bytes();

/// Separates key/value pairs
pub const KEY_SEP: &[u8] = KEY_SEP_STR.as_bytes();

/// End-of-stream body
pub const EOF_BYTES: &[u8] = b"#CMSG_EOF#";

/// Body sent by an RPC client that will make no further requests
pub const SIGNOFF_BYTES: &[u8] = b"#CMSG_SIGNOFF#";

/// Reserved header keys
pub mod keys {
    pub const ID: &str = "id";
    pub const SIZE: &str = "size";
    pub const ADDRESS: &str = "address";
    pub const SERITYPE: &str = "seritype";
    pub const FORMAT_STR: &str = "format_str";
    pub const FIELD_NAMES: &str = "field_names";
    pub const FIELD_UNITS: &str = "field_units";
    pub const RESPONSE_ID: &str = "response_id";
    pub const REQUEST_ID: &str = "request_id";
    pub const RESPONSE_ADDRESS: &str = "response_address";
    pub const MODEL: &str = "model";
}

/// Ordered string map carried in a frame's envelope
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Header {
    entries: Vec<(String, String)>,
}

impl Header {
    pub fn new() -> Self {
        Self::default()
    }

    /// Set a key, replacing an earlier value in place
    pub fn insert(&mut self, key: impl Into<String>, value: impl Into<String>) {
        let key = key.into();
        let value = value.into();
        match self.entries.iter_mut().find(|(k, _)| *k == key) {
            Some(entry) => entry.1 = value,
            None => self.entries.push((key, value)),
        }
    }

    pub fn with(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.insert(key, value);
        self
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.entries
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }

    pub fn contains(&self, key: &str) -> bool {
        self.get(key).is_some()
    }

    pub fn remove(&mut self, key: &str) -> Option<String> {
        let pos = self.entries.iter().position(|(k, _)| k == key)?;
        Some(self.entries.remove(pos).1)
    }

    /// Copy every entry of `other` into `self`, overriding shared keys
    pub fn extend(&mut self, other: &Header) {
        for (k, v) in other.iter() {
            self.insert(k, v);
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.entries.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Parse a numeric entry
    pub fn get_usize(&self, key: &str) -> Option<usize> {
        self.get(key).and_then(|v| v.parse().ok())
    }
}

impl fmt::Display for Header {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{{")?;
        for (i, (k, v)) in self.iter().enumerate() {
            if i > 0 {
                write!(f, ", ")?;
            }
            write!(f, "{k}: {v}")?;
        }
        write!(f, "}}")
    }
}

impl<K: Into<String>, V: Into<String>> FromIterator<(K, V)> for Header {
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        let mut header = Header::new();
        for (k, v) in iter {
            header.insert(k, v);
        }
        header
    }
}

fn find(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    if needle.is_empty() || haystack.len() < needle.len() {
        return None;
    }
    haystack.windows(needle.len()).position(|w| w == needle)
}

fn contains_token(s: &str) -> bool {
    let b = s.as_bytes();
    find(b, SENTINEL).is_some() || find(b, VAL_SEP).is_some() || find(b, KEY_SEP).is_some()
}

/// Render a header envelope; an empty header renders as nothing
pub fn format_header(header: &Header) -> Result<Vec<u8>> {
    if header.is_empty() {
        return Ok(Vec::new());
    }

    let mut out = Vec::with_capacity(2 * SENTINEL.len() + 32 * header.len());
    out.extend_from_slice(SENTINEL);
    for (i, (k, v)) in header.iter().enumerate() {
        if k.is_empty() || contains_token(k) || contains_token(v) {
            return Err(Error::Serialization(format!(
                "header entry '{k}' contains a reserved separator"
            )));
        }
        if i > 0 {
            out.extend_from_slice(KEY_SEP);
        }
        out.extend_from_slice(k.as_bytes());
        out.extend_from_slice(VAL_SEP);
        out.extend_from_slice(v.as_bytes());
    }
    out.extend_from_slice(SENTINEL);
    Ok(out)
}

/// Build a full frame from a header and a body
pub fn encode(header: &Header, body: &[u8]) -> Result<Vec<u8>> {
    let mut out = format_header(header)?;
    out.extend_from_slice(body);
    Ok(out)
}

/// Split a frame into its header and body
///
/// A frame that does not start with [`SENTINEL`] has no header.
pub fn parse_header(raw: &[u8]) -> Result<(Header, &[u8])> {
    let Some(rest) = raw.strip_prefix(SENTINEL) else {
        return Ok((Header::new(), raw));
    };
    let end = find(rest, SENTINEL)
        .ok_or_else(|| Error::InvalidFrame("header is missing its closing sentinel".into()))?;
    let header_bytes = &rest[..end];
    let body = &rest[end + SENTINEL.len()..];

    let text = std::str::from_utf8(header_bytes)
        .map_err(|e| Error::InvalidFrame(format!("header is not valid UTF-8: {e}")))?;

    let mut header = Header::new();
    if !text.is_empty() {
        for pair in text.split(KEY_SEP_STR) {
            let (k, v) = pair
                .split_once(VAL_SEP_STR)
                .ok_or_else(|| Error::InvalidFrame(format!("malformed header entry '{pair}'")))?;
            header.insert(k, v);
        }
    }
    Ok((header, body))
}

pub fn is_eof(raw: &[u8]) -> bool {
    raw == EOF_BYTES
}

pub fn is_signoff(raw: &[u8]) -> bool {
    raw == SIGNOFF_BYTES
}
