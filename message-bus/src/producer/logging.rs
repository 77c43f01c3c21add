use std::collections::HashSet;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{error, info};

use crate::message::{Message, ProducerError, METADATA_EVENT_ID, METADATA_EVENT_NAME};

/// Renders a message for logs. The payload is omitted for events listed in `without_payload`.
pub fn describe_message(message: &Message, without_payload: &HashSet<String>) -> String {
    let event = message.metadata_value(METADATA_EVENT_NAME);
    let mut parts = vec![format!("Topic: {}", message.topic)];

    if let Some(id) = message.metadata_value(METADATA_EVENT_ID) {
        parts.push(format!("Id: {id}"));
    }
    if let Some(event) = event {
        parts.push(format!("Event: {event}"));
    }
    if let Some(key) = message.key.as_deref() {
        parts.push(format!("Key: {}", String::from_utf8_lossy(key)));
    }
    if let Some(headers) = message.headers.as_deref().filter(|h| !h.is_empty()) {
        let rendered: Vec<String> = headers.iter().map(ToString::to_string).collect();
        parts.push(format!("Headers: {}", rendered.join(" ")));
    }

    let redacted = event.is_some_and(|e| without_payload.contains(e));
    match message.value.as_deref() {
        Some(_) if redacted => parts.push("Value: <omitted>".to_string()),
        Some(value) => parts.push(format!("Value: {}", String::from_utf8_lossy(value))),
        None => {}
    }

    format!("[{}]", parts.join(", "))
}

/// Logs every acknowledged record until the stream ends.
pub fn spawn_success_logger(
    mut successes: mpsc::Receiver<Message>,
    without_payload: HashSet<String>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        while let Some(message) = successes.recv().await {
            info!(
                "Success to produce message {}",
                describe_message(&message, &without_payload)
            );
        }
    })
}

/// Logs every failed record until the stream ends.
pub fn spawn_error_logger(
    mut errors: mpsc::Receiver<ProducerError>,
    without_payload: HashSet<String>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        while let Some(failure) = errors.recv().await {
            error!(
                "Failed to produce message {}: {}",
                describe_message(&failure.message, &without_payload),
                failure.cause
            );
        }
    })
}
