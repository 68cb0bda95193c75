//! Message and batch types flowing through the stage.

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Ordered sequence of messages processed together in one pipeline cycle.
pub type Batch = Vec<Message>;

/// Per-message error marker.
///
/// Attached to a message instead of failing the batch, so downstream stages can
/// branch on it element by element.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum MessageError {
    #[error("request returned unexpected response code: {code}")]
    UnexpectedStatus { code: u16 },
    #[error("request failed after {attempts} attempt(s): {reason}")]
    Transport { reason: String, attempts: u32 },
    #[error("failed to build request: {0}")]
    InvalidRequest(String),
    #[error("processing aborted: {0}")]
    Aborted(String),
}

/// A unit of processing: payload bytes, string metadata and an optional error.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Message {
    payload: Bytes,
    metadata: BTreeMap<String, String>,
    error: Option<MessageError>,
}

impl Message {
    pub fn new(payload: impl Into<Bytes>) -> Self {
        Self {
            payload: payload.into(),
            metadata: BTreeMap::new(),
            error: None,
        }
    }

    /// Builder-style metadata setter.
    pub fn with_meta(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.set_meta(key, value);
        self
    }

    pub fn payload(&self) -> &Bytes {
        &self.payload
    }

    pub fn set_payload(&mut self, payload: impl Into<Bytes>) {
        self.payload = payload.into();
    }

    pub fn meta(&self, key: &str) -> Option<&str> {
        self.metadata.get(key).map(String::as_str)
    }

    /// Insert a metadata entry, overwriting any previous value for `key`.
    pub fn set_meta(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.metadata.insert(key.into(), value.into());
    }

    pub fn metadata(&self) -> &BTreeMap<String, String> {
        &self.metadata
    }

    pub fn error(&self) -> Option<&MessageError> {
        self.error.as_ref()
    }

    pub fn set_error(&mut self, error: MessageError) {
        self.error = Some(error);
    }

    pub fn has_error(&self) -> bool {
        self.error.is_some()
    }
}

/// JSON line form of a message used by the CLI.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MessageRecord {
    #[serde(default)]
    pub payload: String,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub metadata: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl From<MessageRecord> for Message {
    // Errors are produced by this stage, never read back in.
    fn from(record: MessageRecord) -> Self {
        Self {
            payload: Bytes::from(record.payload),
            metadata: record.metadata,
            error: None,
        }
    }
}

impl From<&Message> for MessageRecord {
    fn from(message: &Message) -> Self {
        Self {
            payload: String::from_utf8_lossy(&message.payload).into_owned(),
            metadata: message.metadata.clone(),
            error: message.error.as_ref().map(ToString::to_string),
        }
    }
}
