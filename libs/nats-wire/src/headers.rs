//! Message header block: `NATS/1.0[ <status>[ <description>]]\r\n(Key: Value\r\n)*\r\n`.

use bytes::BytesMut;

use crate::error::{WireError, WireResult};
use crate::subject::validate_token;

/// Protocol line every header block starts with.
pub const HEADER_VERSION: &str = "NATS/1.0";

/// Status a server attaches to a request reply when nobody is subscribed.
pub const NO_RESPONDERS_STATUS: u16 = 503;

/// Ordered multi-value header map.
///
/// Keys are compared exactly (case-sensitive) and keep insertion order so
/// that an encoded block is stable.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct HeaderMap {
    status: Option<u16>,
    description: Option<String>,
    entries: Vec<(String, Vec<String>)>,
}

impl HeaderMap {
    pub fn new() -> Self {
        Self::default()
    }

    /// A header block carrying only a status line.
    pub fn with_status(status: u16, description: Option<&str>) -> Self {
        Self {
            status: Some(status),
            description: description.map(str::to_owned),
            entries: Vec::new(),
        }
    }

    pub fn status(&self) -> Option<u16> {
        self.status
    }

    pub fn description(&self) -> Option<&str> {
        self.description.as_deref()
    }

    /// Replace all values of `key` with `value`.
    pub fn insert(&mut self, key: impl Into<String>, value: impl Into<String>) -> &mut Self {
        let key = key.into();
        let value = value.into();
        match self.entries.iter_mut().find(|(k, _)| *k == key) {
            Some((_, values)) => {
                values.clear();
                values.push(value);
            }
            None => self.entries.push((key, vec![value])),
        }
        self
    }

    /// Add `value` to the values of `key`.
    pub fn append(&mut self, key: impl Into<String>, value: impl Into<String>) -> &mut Self {
        let key = key.into();
        let value = value.into();
        match self.entries.iter_mut().find(|(k, _)| *k == key) {
            Some((_, values)) => values.push(value),
            None => self.entries.push((key, vec![value])),
        }
        self
    }

    /// First value of `key`.
    pub fn get(&self, key: &str) -> Option<&str> {
        self.get_all(key).first().map(String::as_str)
    }

    /// All values of `key`, in the order they were added.
    pub fn get_all(&self, key: &str) -> &[String] {
        self.entries
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_slice())
            .unwrap_or(&[])
    }

    pub fn remove(&mut self, key: &str) -> Option<Vec<String>> {
        let idx = self.entries.iter().position(|(k, _)| k == key)?;
        Some(self.entries.remove(idx).1)
    }

    /// Number of distinct keys.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &[String])> {
        self.entries.iter().map(|(k, v)| (k.as_str(), v.as_slice()))
    }

    /// Append the encoded block to `buf`, validating every key and value.
    pub fn encode(&self, buf: &mut BytesMut) -> WireResult<()> {
        buf.extend_from_slice(HEADER_VERSION.as_bytes());
        if let Some(status) = self.status {
            buf.extend_from_slice(b" ");
            buf.extend_from_slice(status.to_string().as_bytes());
            if let Some(desc) = &self.description {
                validate_value(desc)?;
                buf.extend_from_slice(b" ");
                buf.extend_from_slice(desc.as_bytes());
            }
        }
        buf.extend_from_slice(b"\r\n");
        for (key, values) in &self.entries {
            validate_key(key)?;
            for value in values {
                validate_value(value)?;
                buf.extend_from_slice(key.as_bytes());
                buf.extend_from_slice(b": ");
                buf.extend_from_slice(value.as_bytes());
                buf.extend_from_slice(b"\r\n");
            }
        }
        buf.extend_from_slice(b"\r\n");
        Ok(())
    }

    /// Parse a complete header block as carried by `HMSG`.
    pub fn parse(block: &[u8]) -> WireResult<Self> {
        let text = std::str::from_utf8(block)
            .map_err(|_| WireError::OpParser("header block is not valid UTF-8".into()))?;
        let body = text.strip_suffix("\r\n\r\n").ok_or_else(|| {
            WireError::OpParser("header block is not terminated by an empty line".into())
        })?;

        let mut lines = body.split("\r\n");
        let proto = lines.next().unwrap_or_default();
        let rest = proto.strip_prefix(HEADER_VERSION).ok_or_else(|| {
            WireError::OpParser(format!("header block has unknown version line '{proto}'"))
        })?;

        let mut map = HeaderMap::new();
        let rest = rest.trim();
        if !rest.is_empty() {
            let (code, desc) = match rest.split_once(' ') {
                Some((code, desc)) => (code, Some(desc.trim())),
                None => (rest, None),
            };
            map.status = Some(code.parse().map_err(|_| WireError::InvalidNumber {
                field: "header status",
                value: code.to_owned(),
            })?);
            map.description = desc.filter(|d| !d.is_empty()).map(str::to_owned);
        }

        for line in lines {
            let (key, value) = line.split_once(':').ok_or_else(|| {
                WireError::OpParser(format!("header line without ':' separator: '{line}'"))
            })?;
            let key = key.trim();
            if key.is_empty() {
                return Err(WireError::OpParser(format!(
                    "header line with empty key: '{line}'"
                )));
            }
            map.append(key, value.trim());
        }
        Ok(map)
    }
}

fn validate_key(key: &str) -> WireResult<()> {
    validate_token("header key", key)?;
    if key.contains(':') {
        return Err(WireError::InvalidField {
            field: "header key",
            reason: format!("'{key}' contains ':'"),
        });
    }
    Ok(())
}

fn validate_value(value: &str) -> WireResult<()> {
    if !value.is_ascii() {
        return Err(WireError::NonAscii {
            field: "header value",
            value: value.to_owned(),
        });
    }
    if value.bytes().any(|b| b == b'\r' || b == b'\n') {
        return Err(WireError::InvalidField {
            field: "header value",
            reason: format!("{value:?} contains CR or LF"),
        });
    }
    Ok(())
}
