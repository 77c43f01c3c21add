//! Conversions between the bus message model and rdkafka records.
//!
//! Every function here is total. Absent fields stay absent and empty fields stay empty:
//! `None` headers never become an empty header list, and an empty key is still sent as a key.

use chrono::{DateTime, Utc};
use rdkafka::message::{Header, Headers, OwnedHeaders};
use rdkafka::producer::{BaseRecord, FutureRecord};
use rdkafka::util::IntoOpaque;

use crate::message::{ConsumerMessage, Message, MessageHeader};

pub fn to_wire_headers(headers: Option<&[MessageHeader]>) -> Option<OwnedHeaders> {
    let headers = headers?;
    let mut wire = OwnedHeaders::new_with_capacity(headers.len());
    for header in headers {
        let key = String::from_utf8_lossy(&header.key);
        wire = wire.insert(Header {
            key: &key,
            value: Some(header.value.as_slice()),
        });
    }
    Some(wire)
}

pub fn from_wire_headers<H: Headers>(headers: Option<&H>) -> Option<Vec<MessageHeader>> {
    let headers = headers?;
    Some(
        headers
            .iter()
            .map(|h| MessageHeader {
                key: h.key.as_bytes().to_vec(),
                value: h.value.map(<[u8]>::to_vec).unwrap_or_default(),
            })
            .collect(),
    )
}

pub fn to_future_record(message: &Message) -> FutureRecord<'_, [u8], [u8]> {
    let mut record = FutureRecord::to(&message.topic);
    if let Some(key) = message.key.as_deref() {
        record = record.key(key);
    }
    if let Some(value) = message.value.as_deref() {
        record = record.payload(value);
    }
    if let Some(headers) = to_wire_headers(message.headers.as_deref()) {
        record = record.headers(headers);
    }
    record
}

/// Same as [`to_future_record`] but for the threaded producer, carrying `opaque` through to the
/// delivery callback.
pub fn to_base_record<D: IntoOpaque>(message: &Message, opaque: D) -> BaseRecord<'_, [u8], [u8], D> {
    let mut record = BaseRecord::with_opaque_to(&message.topic, opaque);
    if let Some(key) = message.key.as_deref() {
        record = record.key(key);
    }
    if let Some(value) = message.value.as_deref() {
        record = record.payload(value);
    }
    if let Some(headers) = to_wire_headers(message.headers.as_deref()) {
        record = record.headers(headers);
    }
    record
}

pub fn to_consumer_message<M: rdkafka::Message>(message: &M) -> ConsumerMessage {
    ConsumerMessage {
        topic: message.topic().to_string(),
        key: message.key().map(<[u8]>::to_vec),
        value: message.payload().map(<[u8]>::to_vec),
        headers: from_wire_headers(message.headers()),
        partition: message.partition(),
        offset: message.offset(),
        timestamp: message
            .timestamp()
            .to_millis()
            .and_then(DateTime::<Utc>::from_timestamp_millis),
    }
}
