use std::sync::Arc;

use async_trait::async_trait;
use rdkafka::error::KafkaError;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::error::ConfigError;
use crate::message::ConsumerMessage;

#[derive(Debug, Error)]
pub enum GroupError {
    #[error("consumer group is closed")]
    Closed,
    #[error("kafka error: {0}")]
    Kafka(#[from] KafkaError),
    #[error("handler {handler} failed: {source:#}")]
    Handler {
        handler: String,
        #[source]
        source: anyhow::Error,
    },
    #[error("invalid consumer configuration: {0}")]
    Config(#[from] ConfigError),
}

/// One group generation, from partition assignment until revocation, cancellation or close.
pub trait GroupSession: Send + Sync {
    /// Cancelled when the session ends. Handlers stop pulling records once it fires.
    fn cancellation(&self) -> &CancellationToken;

    /// Records `message` as handled. Its offset becomes eligible for the next commit.
    fn mark_message(&self, message: &ConsumerMessage) -> Result<(), GroupError>;

    /// Synchronously commits every offset marked so far in this session.
    fn commit(&self) -> Result<(), GroupError>;
}

/// Records delivered to a session. Records of one partition come out in partition order.
#[async_trait]
pub trait GroupClaim: Send {
    /// Next record, or `None` once the session is over. Cancel safe.
    async fn next(&mut self) -> Option<ConsumerMessage>;
}

/// Callbacks driven by [`ConsumerGroup::consume`] for each session.
#[async_trait]
pub trait GroupHandler: Send + Sync {
    async fn setup(&self, session: &dyn GroupSession) -> Result<(), GroupError>;

    async fn cleanup(&self, session: &dyn GroupSession) -> Result<(), GroupError>;

    async fn consume_claim(
        &self,
        session: &dyn GroupSession,
        claim: &mut dyn GroupClaim,
    ) -> Result<(), GroupError>;
}

/// A consumer group membership. `consume` joins the group and runs one session; callers loop
/// on it to follow rebalances.
#[async_trait]
pub trait ConsumerGroup: Send + Sync {
    /// Runs `setup`, `consume_claim` and `cleanup` for one session. Returns once the session
    /// ends; `Ok` when it ended because of a rebalance or `cancel`.
    async fn consume(
        &self,
        cancel: &CancellationToken,
        topics: &[String],
        handler: &dyn GroupHandler,
    ) -> Result<(), GroupError>;

    /// Asynchronous client errors. Can be taken once.
    fn errors(&self) -> Option<mpsc::UnboundedReceiver<GroupError>>;

    /// Leaves the group. Waits for a running `consume` to return; later calls to `consume`
    /// fail with [`GroupError::Closed`].
    async fn close(&self) -> Result<(), GroupError>;

    /// Releases the underlying connection.
    async fn close_client(&self) -> Result<(), GroupError> {
        Ok(())
    }
}

pub trait ConsumerGroupFactory: Send + Sync {
    fn create(&self, group_id: &str) -> Result<Arc<dyn ConsumerGroup>, GroupError>;
}
