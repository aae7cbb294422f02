//! Canonical message envelope shared by every adapter.

use crate::context::RequestContext;
use crate::error::{HandlerError, PanicError};
use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use serde::{Deserialize, Serialize};
use std::collections::btree_map;
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

/// Header keys that stay stable across brokers.
pub mod keys {
    /// Correlation id mirrored as a plain header for cheap filtering.
    pub const CORRELATION_ID: &str = "x-request-id";
    /// Base64 JSON of the serialized request context.
    pub const REQUEST_CONTEXT: &str = "x-request-info";
    /// Deduplication / message id.
    pub const MESSAGE_ID: &str = "Nats-Msg-Id";
    /// Body compression algorithm name.
    pub const COMPRESSION: &str = "x-compression";
}

/// A single header value.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum HeaderValue {
    Bool(bool),
    Int(i64),
    Str(String),
    Bytes(Vec<u8>),
}

impl HeaderValue {
    /// Render the value for string-only header transports.
    ///
    /// Bytes are base64 (standard alphabet) encoded.
    pub fn to_wire_string(&self) -> String {
        match self {
            HeaderValue::Str(s) => s.clone(),
            HeaderValue::Int(i) => i.to_string(),
            HeaderValue::Bool(b) => b.to_string(),
            HeaderValue::Bytes(b) => STANDARD.encode(b),
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            HeaderValue::Str(s) => Some(s),
            _ => None,
        }
    }
}

impl fmt::Display for HeaderValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_wire_string())
    }
}

impl From<&str> for HeaderValue {
    fn from(value: &str) -> Self {
        HeaderValue::Str(value.to_string())
    }
}

impl From<String> for HeaderValue {
    fn from(value: String) -> Self {
        HeaderValue::Str(value)
    }
}

impl From<i64> for HeaderValue {
    fn from(value: i64) -> Self {
        HeaderValue::Int(value)
    }
}

impl From<bool> for HeaderValue {
    fn from(value: bool) -> Self {
        HeaderValue::Bool(value)
    }
}

impl From<Vec<u8>> for HeaderValue {
    fn from(value: Vec<u8>) -> Self {
        HeaderValue::Bytes(value)
    }
}

/// Case-sensitive, ordered header map.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Header(BTreeMap<String, HeaderValue>);

impl Header {
    pub fn new() -> Self {
        Self::default()
    }

    /// Wire-string rendering of `key`, empty when missing.
    pub fn get(&self, key: &str) -> String {
        self.0
            .get(key)
            .map(HeaderValue::to_wire_string)
            .unwrap_or_default()
    }

    pub fn get_value(&self, key: &str) -> Option<&HeaderValue> {
        self.0.get(key)
    }

    pub fn contains(&self, key: &str) -> bool {
        self.0.contains_key(key)
    }

    /// Insert only when `key` is absent.
    pub fn add(&mut self, key: impl Into<String>, value: impl Into<HeaderValue>) {
        self.0.entry(key.into()).or_insert_with(|| value.into());
    }

    /// Insert, overwriting any previous value.
    pub fn set(&mut self, key: impl Into<String>, value: impl Into<HeaderValue>) {
        self.0.insert(key.into(), value.into());
    }

    pub fn del(&mut self, key: &str) -> Option<HeaderValue> {
        self.0.remove(key)
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn iter(&self) -> btree_map::Iter<'_, String, HeaderValue> {
        self.0.iter()
    }
}

impl<'a> IntoIterator for &'a Header {
    type Item = (&'a String, &'a HeaderValue);
    type IntoIter = btree_map::Iter<'a, String, HeaderValue>;

    fn into_iter(self) -> Self::IntoIter {
        self.0.iter()
    }
}

impl<K: Into<String>, V: Into<HeaderValue>> FromIterator<(K, V)> for Header {
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        Self(
            iter.into_iter()
                .map(|(k, v)| (k.into(), v.into()))
                .collect(),
        )
    }
}

/// Callback that turns a recovered panic into a broker-specific failure.
pub type RecoverFn = Arc<dyn Fn(&RequestContext, &PanicError) -> HandlerError + Send + Sync>;

/// A message travelling through a queue.
#[derive(Clone, Default)]
pub struct Message {
    /// Correlation / dedup token.
    pub id: Option<String>,
    /// Subject, routing key or task type.
    pub topic: String,
    pub body: Vec<u8>,
    pub headers: Header,
    pub recover: Option<RecoverFn>,
    /// Publish the bare body, without context or metadata headers.
    pub no_header: bool,
}

impl Message {
    pub fn new(body: impl Into<Vec<u8>>) -> Self {
        Self {
            body: body.into(),
            ..Default::default()
        }
    }

    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = Some(id.into());
        self
    }

    pub fn with_topic(mut self, topic: impl Into<String>) -> Self {
        self.topic = topic.into();
        self
    }

    pub fn with_header(mut self, key: impl Into<String>, value: impl Into<HeaderValue>) -> Self {
        self.headers.set(key, value);
        self
    }

    pub fn with_headers(mut self, headers: Header) -> Self {
        self.headers = headers;
        self
    }

    pub fn with_recover(mut self, recover: RecoverFn) -> Self {
        self.recover = Some(recover);
        self
    }

    pub fn without_headers(mut self) -> Self {
        self.no_header = true;
        self
    }

    /// Body as UTF-8, lossy.
    pub fn body_str(&self) -> std::borrow::Cow<'_, str> {
        String::from_utf8_lossy(&self.body)
    }
}

impl fmt::Debug for Message {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Message")
            .field("id", &self.id)
            .field("topic", &self.topic)
            .field("body_len", &self.body.len())
            .field("headers", &self.headers)
            .field("recover", &self.recover.is_some())
            .field("no_header", &self.no_header)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_header_get_missing_is_empty() {
        let header = Header::new();
        assert_eq!(header.get("missing"), "");
        assert!(header.get_value("missing").is_none());
    }

    #[test]
    fn test_header_add_keeps_existing() {
        let mut header = Header::new();
        header.add("k", "first");
        header.add("k", "second");
        assert_eq!(header.get("k"), "first");

        header.set("k", "third");
        assert_eq!(header.get("k"), "third");
    }

    #[test]
    fn test_header_is_case_sensitive() {
        let mut header = Header::new();
        header.set("Key", "upper");
        header.set("key", "lower");
        assert_eq!(header.len(), 2);
        assert_eq!(header.get("Key"), "upper");
    }

    #[test]
    fn test_header_clone_is_independent() {
        let mut original = Header::new();
        original.set("a", 1i64);
        let mut copy = original.clone();
        copy.set("a", 2i64);
        copy.del("missing");
        assert_eq!(original.get_value("a"), Some(&HeaderValue::Int(1)));
        assert_eq!(copy.get_value("a"), Some(&HeaderValue::Int(2)));
    }

    #[test]
    fn test_wire_string_rendering() {
        assert_eq!(HeaderValue::from(42i64).to_wire_string(), "42");
        assert_eq!(HeaderValue::from(true).to_wire_string(), "true");
        assert_eq!(HeaderValue::from("x").to_wire_string(), "x");
        assert_eq!(HeaderValue::from(b"hi".to_vec()).to_wire_string(), "aGk=");
    }

    #[test]
    fn test_header_json_shape() {
        let header: Header = [
            ("flag", HeaderValue::Bool(true)),
            ("count", HeaderValue::Int(3)),
            ("name", HeaderValue::Str("x".to_string())),
        ]
        .into_iter()
        .collect();

        let json = serde_json::to_value(&header).unwrap();
        assert_eq!(json, serde_json::json!({"count": 3, "flag": true, "name": "x"}));

        let back: Header = serde_json::from_value(json).unwrap();
        assert_eq!(back, header);
    }

    #[test]
    fn test_message_builder() {
        let msg = Message::new("hello")
            .with_id("id-1")
            .with_header(keys::COMPRESSION, "gzip");
        assert_eq!(msg.id.as_deref(), Some("id-1"));
        assert_eq!(msg.body_str(), "hello");
        assert_eq!(msg.headers.get(keys::COMPRESSION), "gzip");
        assert!(!msg.no_header);
    }
}
