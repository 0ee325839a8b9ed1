//! The message envelope exchanged with clients over either transport.

use crate::{fields, unix_timestamp, MessageKind, SessionId};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fmt;

#[derive(Debug, thiserror::Error)]
pub enum EnvelopeError {
    #[error("payload is not valid UTF-8")]
    InvalidUtf8,
    #[error("payload is not valid JSON: {0}")]
    InvalidJson(#[from] serde_json::Error),
    #[error("payload is not a JSON object")]
    NotAnObject,
    #[error("payload has no string `type` field")]
    MissingType,
}

/// One structured message: a JSON object carrying at least `type` and
/// `timestamp`.
///
/// Field order is irrelevant. Everything beyond the transport fields in
/// [`crate::fields`] is opaque to the connection layer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Envelope(Map<String, Value>);

impl Envelope {
    /// Creates an envelope with the given type tag, stamped with the current time.
    pub fn new(kind: &str) -> Self {
        let mut map = Map::new();
        map.insert(fields::TYPE.to_string(), Value::from(kind));
        map.insert(fields::TIMESTAMP.to_string(), Value::from(unix_timestamp()));
        Envelope(map)
    }

    /// Builder-style field insertion.
    pub fn with(mut self, key: &str, value: impl Into<Value>) -> Self {
        self.insert(key, value);
        self
    }

    /// Parses one envelope from text.
    ///
    /// The input must be a JSON object with a string `type`. A missing
    /// `timestamp` is accepted because the server overwrites it on receipt.
    pub fn parse(text: &str) -> Result<Self, EnvelopeError> {
        let value: Value = serde_json::from_str(text)?;
        Self::from_value(value)
    }

    /// Parses one envelope from raw bytes, e.g. a datagram payload.
    pub fn from_slice(bytes: &[u8]) -> Result<Self, EnvelopeError> {
        let text = std::str::from_utf8(bytes).map_err(|_| EnvelopeError::InvalidUtf8)?;
        Self::parse(text)
    }

    fn from_value(value: Value) -> Result<Self, EnvelopeError> {
        let Value::Object(map) = value else {
            return Err(EnvelopeError::NotAnObject);
        };
        match map.get(fields::TYPE) {
            Some(Value::String(tag)) if !tag.is_empty() => Ok(Envelope(map)),
            _ => Err(EnvelopeError::MissingType),
        }
    }

    /// The raw `type` tag. Empty only if a caller overwrote it with a non-string.
    pub fn tag(&self) -> &str {
        self.get_str(fields::TYPE).unwrap_or_default()
    }

    pub fn kind(&self) -> MessageKind {
        MessageKind::from_tag(self.tag())
    }

    pub fn timestamp(&self) -> Option<f64> {
        self.get_f64(fields::TIMESTAMP)
    }

    /// Overwrites `timestamp` with the current time.
    pub fn stamp(&mut self) {
        self.insert(fields::TIMESTAMP, unix_timestamp());
    }

    pub fn session_id(&self) -> Option<SessionId> {
        self.0.get(fields::SESSION_ID).and_then(Value::as_u64)
    }

    pub fn set_session_id(&mut self, id: SessionId) {
        self.insert(fields::SESSION_ID, id);
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.0.get(key)
    }

    pub fn get_str(&self, key: &str) -> Option<&str> {
        self.0.get(key).and_then(Value::as_str)
    }

    pub fn get_f64(&self, key: &str) -> Option<f64> {
        self.0.get(key).and_then(Value::as_f64)
    }

    pub fn insert(&mut self, key: &str, value: impl Into<Value>) {
        self.0.insert(key.to_string(), value.into());
    }

    pub fn fields(&self) -> &Map<String, Value> {
        &self.0
    }

    /// Serializes the envelope as one stream-transport line, newline included.
    pub fn to_line(&self) -> String {
        let mut line = self.to_string();
        line.push('\n');
        line
    }
}

impl fmt::Display for Envelope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let text = serde_json::to_string(&self.0).map_err(|_| fmt::Error)?;
        f.write_str(&text)
    }
}
