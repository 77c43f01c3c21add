use std::collections::HashMap;
use std::fmt;

use chrono::{DateTime, Utc};
use thiserror::Error;

use crate::producer::ProduceError;

/// Metadata key carrying the event id, used when describing a message in logs.
pub const METADATA_EVENT_ID: &str = "id";
/// Metadata key carrying the event name, used when describing a message in logs.
pub const METADATA_EVENT_NAME: &str = "event";

/// Side-channel information attached to an outgoing message. Never sent to the broker.
pub type Metadata = HashMap<String, String>;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MessageHeader {
    pub key: Vec<u8>,
    pub value: Vec<u8>,
}

impl MessageHeader {
    pub fn new(key: impl Into<Vec<u8>>, value: impl Into<Vec<u8>>) -> Self {
        Self {
            key: key.into(),
            value: value.into(),
        }
    }
}

impl fmt::Display for MessageHeader {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "[Key: {}, Value: {}]",
            String::from_utf8_lossy(&self.key),
            String::from_utf8_lossy(&self.value)
        )
    }
}

/// An outgoing record.
///
/// `key`, `value` and `headers` keep the difference between "absent" (`None`) and
/// "present but empty" (`Some` of an empty vec) all the way to the wire.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Message {
    pub topic: String,
    pub key: Option<Vec<u8>>,
    pub value: Option<Vec<u8>>,
    pub headers: Option<Vec<MessageHeader>>,
    pub metadata: Option<Metadata>,
}

impl Message {
    pub fn new(topic: impl Into<String>) -> Self {
        Self {
            topic: topic.into(),
            ..Default::default()
        }
    }

    pub fn with_key(mut self, key: impl Into<Vec<u8>>) -> Self {
        self.key = Some(key.into());
        self
    }

    pub fn with_value(mut self, value: impl Into<Vec<u8>>) -> Self {
        self.value = Some(value.into());
        self
    }

    pub fn with_headers(mut self, headers: Vec<MessageHeader>) -> Self {
        self.headers = Some(headers);
        self
    }

    pub fn with_header(mut self, key: impl Into<Vec<u8>>, value: impl Into<Vec<u8>>) -> Self {
        self.headers
            .get_or_insert_with(Vec::new)
            .push(MessageHeader::new(key, value));
        self
    }

    pub fn with_metadata(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.metadata
            .get_or_insert_with(HashMap::new)
            .insert(key.into(), value.into());
        self
    }

    pub fn metadata_value(&self, key: &str) -> Option<&str> {
        self.metadata
            .as_ref()
            .and_then(|m| m.get(key))
            .map(String::as_str)
    }
}

/// A record read from a topic partition.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConsumerMessage {
    pub topic: String,
    pub key: Option<Vec<u8>>,
    pub value: Option<Vec<u8>>,
    pub headers: Option<Vec<MessageHeader>>,
    pub partition: i32,
    pub offset: i64,
    pub timestamp: Option<DateTime<Utc>>,
}

impl ConsumerMessage {
    pub fn value_str(&self) -> Option<std::borrow::Cow<'_, str>> {
        self.value.as_deref().map(String::from_utf8_lossy)
    }

    pub fn header(&self, key: &[u8]) -> Option<&[u8]> {
        self.headers
            .as_ref()?
            .iter()
            .find(|h| h.key == key)
            .map(|h| h.value.as_slice())
    }
}

/// A message the async producer could not deliver, together with the reason.
#[derive(Debug, Error)]
#[error("failed to produce message to topic {}: {cause}", message.topic)]
pub struct ProducerError {
    pub message: Message,
    #[source]
    pub cause: ProduceError,
}

impl ProducerError {
    pub fn new(message: Message, cause: ProduceError) -> Self {
        Self { message, cause }
    }
}
