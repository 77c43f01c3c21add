use async_trait::async_trait;

use crate::message::ConsumerMessage;

/// Business logic attached to a handler mapping.
///
/// `handle` is called once per record, one record at a time per consumer. Returning an error
/// ends the current session; the record is delivered again once the consumer rejoins.
#[async_trait]
pub trait ConsumerHandler: Send + Sync {
    async fn handle(&self, message: &ConsumerMessage) -> anyhow::Result<()>;

    /// Called once when the owning consumer stops, after the group has been closed.
    async fn close(&self) {}
}
